use rusqlite::params;
use scangraph_core::db::{open_db_in_memory, Context, Database, ErrorKind};
use scangraph_core::metrics::{self, Op};
use scangraph_core::repo::now_ms;
use scangraph_core::{
    EmbeddedComponent, EmbeddedVulnerability, Node, NodeRepository, NodeScan, NodeService,
    RepoError, ServiceError, Severity, SnoozeState, SqliteNodeRepository, StoreConfig,
};
use std::thread::sleep;
use std::time::Duration;

const OS: &str = "ubuntu:22.04";

fn repo_with(config: StoreConfig) -> SqliteNodeRepository {
    let db = open_db_in_memory(&config).unwrap();
    SqliteNodeRepository::new(db, &config)
}

fn repo() -> SqliteNodeRepository {
    repo_with(StoreConfig::default())
}

fn vuln(cve: &str, cvss: f32, fixed_by: Option<&str>) -> EmbeddedVulnerability {
    EmbeddedVulnerability {
        cve: cve.to_string(),
        cvss,
        impact_score: 2.5,
        severity: Severity::Important,
        summary: format!("{cve} summary"),
        link: format!("https://example.test/{cve}"),
        published_on: Some(1_600_000_000_000),
        created_at: None,
        snooze: SnoozeState::Active,
        fixed_by: fixed_by.map(str::to_string),
    }
}

fn component(name: &str, version: &str, vulns: Vec<EmbeddedVulnerability>) -> EmbeddedComponent {
    EmbeddedComponent {
        name: name.to_string(),
        version: version.to_string(),
        priority: 3,
        risk_score: 1.5,
        top_cvss: vulns.iter().map(|vuln| vuln.cvss).fold(0.0, f32::max),
        vulns,
    }
}

fn node(id: &str, scan_time: i64, components: Vec<EmbeddedComponent>) -> Node {
    let mut node = Node::new(id, format!("{id}-name"));
    node.cluster_id = "cluster-1".to_string();
    node.cluster_name = "prod".to_string();
    node.os_image = "Ubuntu 22.04.3 LTS".to_string();
    node.container_runtime_version = "containerd://1.7.2".to_string();
    node.labels.insert("zone".to_string(), "a".to_string());
    node.joined_at = Some(1_700_000_000_000);
    node.risk_score = 4.2;
    node.scan = Some(NodeScan {
        scan_time: Some(scan_time),
        operating_system: OS.to_string(),
        components,
    });
    node
}

fn cve_id(cve: &str) -> String {
    format!("{cve}#{OS}")
}

fn orphaned_flag(db: &Database, cve: &str) -> Option<bool> {
    db.query(
        &Context::background(),
        "SELECT orphaned FROM node_cves WHERE id = ?1",
        params![cve_id(cve)],
        |row| row.get::<_, bool>(0),
    )
    .unwrap()
    .into_iter()
    .next()
}

fn all_cves(node: &Node) -> Vec<&EmbeddedVulnerability> {
    node.scan
        .as_ref()
        .unwrap()
        .components
        .iter()
        .flat_map(|component| component.vulns.iter())
        .collect()
}

fn find_cve<'a>(node: &'a Node, cve: &str) -> &'a EmbeddedVulnerability {
    all_cves(node)
        .into_iter()
        .find(|vuln| vuln.cve == cve)
        .unwrap()
}

#[test]
fn upsert_then_get_rebuilds_the_scan() {
    let repo = repo();
    let ctx = Context::background();
    let input = node(
        "n1",
        100,
        vec![
            component("openssl", "3.0.2", vec![vuln("CVE-2", 9.8, Some("3.0.7")), vuln("CVE-1", 5.0, None)]),
            component("bash", "5.1", vec![vuln("CVE-1", 5.0, None)]),
        ],
    );

    repo.upsert(&ctx, &input).unwrap();
    let loaded = repo.get(&ctx, "n1").unwrap().unwrap();

    assert_eq!(loaded.name, input.name);
    assert_eq!(loaded.labels, input.labels);
    assert_eq!(loaded.joined_at, input.joined_at);
    assert!(loaded.last_updated.is_some());

    let scan = loaded.scan.as_ref().unwrap();
    assert_eq!(scan.scan_time, Some(100));
    let names: Vec<&str> = scan.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["bash", "openssl"]);
    let openssl_cves: Vec<&str> = scan.components[1]
        .vulns
        .iter()
        .map(|vuln| vuln.cve.as_str())
        .collect();
    assert_eq!(openssl_cves, vec!["CVE-1", "CVE-2"]);
    assert_eq!(scan.components[1].vulns[1].fixed_by.as_deref(), Some("3.0.7"));
    assert_eq!(scan.components[1].vulns[1].summary, "CVE-2 summary");
    assert!(scan.components[1].vulns[1].created_at.is_some());

    assert_eq!(loaded.components, 2);
    assert_eq!(loaded.cves, 2);
    assert_eq!(loaded.fixable_cves, 1);
    assert_eq!(loaded.top_cvss, 9.8);

    assert_eq!(repo.count_components(&ctx).unwrap(), 2);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 2);
    assert!(metrics::stats(Op::Upsert, "node").calls >= 1);
}

#[test]
fn missing_node_reads_as_none() {
    let repo = repo();
    let ctx = Context::background();

    assert!(repo.get(&ctx, "absent").unwrap().is_none());
    assert!(repo.get_node_metadata(&ctx, "absent").unwrap().is_none());
    assert!(!repo.exists(&ctx, "absent").unwrap());
    assert_eq!(repo.count(&ctx).unwrap(), 0);
    repo.delete(&ctx, "absent").unwrap();
}

#[test]
fn stale_scan_keeps_stored_scan_but_updates_node_fields() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(
        &ctx,
        &node("n1", 200, vec![component("zlib", "1.2", vec![vuln("CVE-1", 7.0, None)])]),
    )
    .unwrap();

    let mut stale = node("n1", 100, vec![component("curl", "8.0", vec![vuln("CVE-9", 3.0, None)])]);
    stale.name = "renamed".to_string();
    stale.risk_score = 0.1;
    repo.upsert(&ctx, &stale).unwrap();

    let loaded = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(loaded.name, "renamed");
    assert_eq!(loaded.risk_score, 4.2);
    assert_eq!(loaded.scan_time(), Some(200));
    let scan = loaded.scan.unwrap();
    assert_eq!(scan.components.len(), 1);
    assert_eq!(scan.components[0].name, "zlib");
    assert_eq!(loaded.cves, 1);
    assert_eq!(loaded.top_cvss, 7.0);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 1);
}

#[test]
fn equal_scan_time_replaces_the_scan() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(&ctx, &node("n1", 100, vec![component("zlib", "1.2", vec![])]))
        .unwrap();
    repo.upsert(&ctx, &node("n1", 100, vec![component("zlib", "1.3", vec![])]))
        .unwrap();

    let loaded = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(loaded.scan.unwrap().components[0].version, "1.3");
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
}

#[test]
fn rescan_orphans_cves_no_component_reports() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(
        &ctx,
        &node(
            "n1",
            100,
            vec![
                component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)]),
                component("curl", "8.0", vec![vuln("CVE-2", 6.0, None)]),
            ],
        ),
    )
    .unwrap();

    repo.upsert(
        &ctx,
        &node("n1", 200, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
    )
    .unwrap();

    let db = repo.database();
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
    assert_eq!(orphaned_flag(db, "CVE-1"), Some(false));
    assert_eq!(orphaned_flag(db, "CVE-2"), Some(true));
    let loaded = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(all_cves(&loaded).len(), 1);

    assert_eq!(repo.purge_orphaned_cves(&ctx).unwrap(), 1);
    assert_eq!(orphaned_flag(db, "CVE-2"), None);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 1);
}

#[test]
fn rescan_reactivates_an_orphaned_cve() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(
        &ctx,
        &node("n1", 100, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
    )
    .unwrap();
    repo.upsert(&ctx, &node("n1", 200, vec![])).unwrap();
    assert_eq!(orphaned_flag(repo.database(), "CVE-1"), Some(true));

    repo.upsert(
        &ctx,
        &node("n1", 300, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
    )
    .unwrap();

    assert_eq!(orphaned_flag(repo.database(), "CVE-1"), Some(false));
    assert_eq!(repo.purge_orphaned_cves(&ctx).unwrap(), 0);
}

#[test]
fn shared_rows_survive_until_the_last_node_is_deleted() {
    let repo = repo();
    let ctx = Context::background();
    let shared = || component("openssl", "3.0.2", vec![vuln("CVE-1", 9.0, None)]);
    repo.upsert(&ctx, &node("n1", 100, vec![shared()])).unwrap();
    repo.upsert(&ctx, &node("n2", 100, vec![shared()])).unwrap();
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 1);

    repo.delete(&ctx, "n1").unwrap();

    assert!(!repo.exists(&ctx, "n1").unwrap());
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
    assert_eq!(orphaned_flag(repo.database(), "CVE-1"), Some(false));
    let survivor = repo.get(&ctx, "n2").unwrap().unwrap();
    assert_eq!(find_cve(&survivor, "CVE-1").cvss, 9.0);

    repo.delete(&ctx, "n2").unwrap();

    assert_eq!(repo.count(&ctx).unwrap(), 0);
    assert_eq!(repo.count_components(&ctx).unwrap(), 0);
    assert_eq!(orphaned_flag(repo.database(), "CVE-1"), Some(true));
    assert_eq!(repo.sweep_orphaned_cves(&ctx).unwrap(), 0);
    assert_eq!(repo.purge_orphaned_cves(&ctx).unwrap(), 1);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 0);
}

#[test]
fn delete_many_removes_nodes_and_sweeps_once() {
    let repo = repo();
    let ctx = Context::background();
    for id in ["n1", "n2", "n3"] {
        repo.upsert(
            &ctx,
            &node(id, 100, vec![component(id, "1.0", vec![vuln(&format!("CVE-{id}"), 4.0, None)])]),
        )
        .unwrap();
    }

    repo.delete_many(&ctx, &["n1".to_string(), "n3".to_string(), "absent".to_string()])
        .unwrap();

    assert_eq!(repo.count(&ctx).unwrap(), 1);
    assert!(repo.exists(&ctx, "n2").unwrap());
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
    assert_eq!(orphaned_flag(repo.database(), "CVE-n1"), Some(true));
    assert_eq!(orphaned_flag(repo.database(), "CVE-n2"), Some(false));
    assert_eq!(orphaned_flag(repo.database(), "CVE-n3"), Some(true));
}

#[test]
fn created_at_is_kept_across_rescans() {
    let repo = repo();
    let ctx = Context::background();
    let before = now_ms();
    repo.upsert(
        &ctx,
        &node("n1", 100, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
    )
    .unwrap();
    let first = repo.get(&ctx, "n1").unwrap().unwrap();
    let first_created = find_cve(&first, "CVE-1").created_at.unwrap();
    assert!(first_created >= before);

    sleep(Duration::from_millis(5));
    repo.upsert(
        &ctx,
        &node(
            "n1",
            200,
            vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.5, None), vuln("CVE-3", 1.0, None)])],
        ),
    )
    .unwrap();

    let second = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(find_cve(&second, "CVE-1").created_at, Some(first_created));
    assert_eq!(find_cve(&second, "CVE-1").cvss, 5.5);
    assert!(find_cve(&second, "CVE-3").created_at.unwrap() > first_created);
}

#[test]
fn snooze_state_survives_rescans_until_unsnoozed() {
    let repo = repo();
    let ctx = Context::background();
    let scan = |time| node("n1", time, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]);
    repo.upsert(&ctx, &scan(100)).unwrap();

    let expiry = now_ms() + 86_400_000;
    let snoozed = repo
        .snooze_cves(&ctx, &[cve_id("CVE-1"), cve_id("CVE-404")], Some(expiry))
        .unwrap();
    assert_eq!(snoozed, 1);
    let loaded = repo.get(&ctx, "n1").unwrap().unwrap();
    assert!(find_cve(&loaded, "CVE-1").snooze.is_snoozed());
    assert_eq!(find_cve(&loaded, "CVE-1").snooze.expiry(), Some(expiry));

    repo.upsert(&ctx, &scan(200)).unwrap();
    let rescanned = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(find_cve(&rescanned, "CVE-1").snooze.expiry(), Some(expiry));

    assert_eq!(repo.unsnooze_cves(&ctx, &[cve_id("CVE-1")]).unwrap(), 1);
    let active = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(find_cve(&active, "CVE-1").snooze, SnoozeState::Active);
}

#[test]
fn reinserted_node_keeps_snooze_of_an_orphaned_cve() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(&ctx, &node("r1", 100, vec![component("bash", "5.1", vec![])]))
        .unwrap();
    let loaded = repo.get(&ctx, "r1").unwrap().unwrap();
    assert_eq!(loaded.scan.as_ref().unwrap().components[0].name, "bash");

    repo.delete(&ctx, "r1").unwrap();
    assert!(repo.get(&ctx, "r1").unwrap().is_none());
    assert_eq!(repo.count_components(&ctx).unwrap(), 0);

    // V1 is left snoozed and orphaned by another node.
    repo.upsert(
        &ctx,
        &node("r2", 100, vec![component("curl", "7.81", vec![vuln("CVE-V1", 7.5, None)])]),
    )
    .unwrap();
    let expiry = now_ms() + 86_400_000;
    assert_eq!(repo.snooze_cves(&ctx, &[cve_id("CVE-V1")], Some(expiry)).unwrap(), 1);
    repo.delete(&ctx, "r2").unwrap();
    assert_eq!(orphaned_flag(repo.database(), "CVE-V1"), Some(true));

    let fresh = vuln("CVE-V1", 7.5, None);
    assert_eq!(fresh.snooze, SnoozeState::Active);
    repo.upsert(
        &ctx,
        &node("r1", 200, vec![component("bash", "5.1", vec![fresh])]),
    )
    .unwrap();

    let reinserted = repo.get(&ctx, "r1").unwrap().unwrap();
    assert!(find_cve(&reinserted, "CVE-V1").snooze.is_snoozed());
    assert_eq!(find_cve(&reinserted, "CVE-V1").snooze.expiry(), Some(expiry));
    assert_eq!(orphaned_flag(repo.database(), "CVE-V1"), Some(false));
    assert_eq!(repo.count_components(&ctx).unwrap(), 1);
}

#[test]
fn get_many_keeps_request_order_and_reports_missing_indices() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(&ctx, &node("a", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]))
        .unwrap();
    repo.upsert(&ctx, &node("b", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]))
        .unwrap();

    let ids = vec!["b".to_string(), "x".to_string(), "a".to_string(), "y".to_string()];
    let (found, missing) = repo.get_many(&ctx, &ids).unwrap();

    let found_ids: Vec<&str> = found.iter().map(|node| node.id.as_str()).collect();
    assert_eq!(found_ids, vec!["b", "a"]);
    assert_eq!(missing, vec![1, 3]);
    assert!(found.iter().all(|node| all_cves(node).len() == 1));

    let (metadata, missing) = repo.get_many_node_metadata(&ctx, &ids).unwrap();
    assert_eq!(metadata.len(), 2);
    assert_eq!(missing, vec![1, 3]);
    assert!(metadata
        .iter()
        .all(|node| node.scan.as_ref().unwrap().components.is_empty()));
}

#[test]
fn metadata_has_summary_without_components() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(
        &ctx,
        &node("n1", 100, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, Some("1.3"))])]),
    )
    .unwrap();

    let metadata = repo.get_node_metadata(&ctx, "n1").unwrap().unwrap();

    assert_eq!(metadata.scan_time(), Some(100));
    assert!(metadata.scan.unwrap().components.is_empty());
    assert_eq!(metadata.components, 1);
    assert_eq!(metadata.fixable_cves, 1);
}

#[test]
fn node_without_scan_is_stored() {
    let repo = repo();
    let ctx = Context::background();
    let bare = Node::new("bare", "bare-node");

    repo.upsert(&ctx, &bare).unwrap();

    let loaded = repo.get(&ctx, "bare").unwrap().unwrap();
    assert!(loaded.scan.is_none());
    assert_eq!(loaded.components, 0);
    assert_eq!(repo.count(&ctx).unwrap(), 1);
}

#[test]
fn invalid_node_is_rejected_before_any_write() {
    let repo = repo();
    let ctx = Context::background();
    let invalid = node("n1", 1, vec![component("", "1.0", vec![])]);

    let err = repo.upsert(&ctx, &invalid).unwrap_err();

    assert!(matches!(err, RepoError::Validation(_)));
    assert_eq!(err.kind(), ErrorKind::Unclassified);
    assert_eq!(repo.count(&ctx).unwrap(), 0);
}

#[test]
fn no_update_timestamps_keeps_caller_timestamp() {
    let repo = repo_with(StoreConfig {
        no_update_timestamps: true,
        ..StoreConfig::default()
    });
    let ctx = Context::background();
    let mut input = node("n1", 1, vec![]);
    input.last_updated = Some(42);

    repo.upsert(&ctx, &input).unwrap();

    assert_eq!(repo.get(&ctx, "n1").unwrap().unwrap().last_updated, Some(42));
}

#[test]
fn caller_transaction_owns_commit_and_rollback() {
    let repo = repo();
    let ctx = Context::background();
    let input = node("n1", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]);

    let tx = repo.database().begin(&ctx).unwrap();
    let tx_ctx = ctx.with_tx(&tx);
    repo.upsert(&tx_ctx, &input).unwrap();
    assert!(repo.get(&tx_ctx, "n1").unwrap().is_some());
    tx.rollback().unwrap();

    assert!(repo.get(&ctx, "n1").unwrap().is_none());
    assert_eq!(repo.count_cves(&ctx).unwrap(), 0);

    let tx = repo.database().begin(&ctx).unwrap();
    repo.upsert(&ctx.with_tx(&tx), &input).unwrap();
    tx.commit().unwrap();
    assert!(repo.exists(&ctx, "n1").unwrap());
}

#[test]
fn reads_inside_a_write_tx_see_uncommitted_cve_changes() {
    let repo = repo();
    let ctx = Context::background();
    let scan = |cvss| node("n1", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", cvss, None)])]);
    repo.upsert(&ctx, &scan(5.0)).unwrap();
    // Warm the shared cache.
    repo.get(&ctx, "n1").unwrap();
    assert!(!repo.cve_store().cache().is_empty());

    let tx = repo.database().begin(&ctx).unwrap();
    let tx_ctx = ctx.with_tx(&tx);
    repo.upsert(&tx_ctx, &scan(8.0)).unwrap();
    assert_eq!(find_cve(&repo.get(&tx_ctx, "n1").unwrap().unwrap(), "CVE-1").cvss, 8.0);
    tx.rollback().unwrap();

    let after = repo.get(&ctx, "n1").unwrap().unwrap();
    assert_eq!(find_cve(&after, "CVE-1").cvss, 5.0);
}

#[test]
fn purge_before_cutoff_respects_retention() {
    let repo = repo();
    let ctx = Context::background();
    repo.upsert(
        &ctx,
        &node("n1", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
    )
    .unwrap();
    let before_orphaning = now_ms() - 1;
    repo.delete(&ctx, "n1").unwrap();

    assert_eq!(repo.purge_orphaned_cves_before(&ctx, before_orphaning).unwrap(), 0);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 1);
    assert_eq!(repo.purge_orphaned_cves_before(&ctx, now_ms()).unwrap(), 1);
    assert_eq!(repo.count_cves(&ctx).unwrap(), 0);
}

#[test]
fn service_runs_maintenance_and_maps_errors() {
    let service = NodeService::new(repo());
    let ctx = Context::background();
    service
        .upsert_node(
            &ctx,
            &node("n1", 1, vec![component("zlib", "1.2", vec![vuln("CVE-1", 5.0, None)])]),
        )
        .unwrap();
    service.upsert_node(&ctx, &node("n1", 2, vec![])).unwrap();

    let long_retention = service.run_orphan_maintenance(&ctx, 3_600_000).unwrap();
    assert_eq!(long_retention.purged, 0);
    let summary = service.run_orphan_maintenance(&ctx, 0).unwrap();
    assert_eq!(summary.orphaned, 0);
    assert_eq!(summary.purged, 1);

    let counts = service.counts(&ctx).unwrap();
    assert_eq!((counts.nodes, counts.components, counts.cves), (1, 0, 0));

    let missing = service.require_node(&ctx, "absent").unwrap_err();
    assert!(matches!(missing, ServiceError::NodeNotFound(_)));
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    let invalid = service.upsert_node(&ctx, &Node::new(" ", "blank")).unwrap_err();
    assert!(matches!(invalid, ServiceError::Validation(_)));
}
