//! Content-derived row identifiers.

const SEPARATOR: char = '#';

/// `name#version#operating_system`
pub fn component_id(name: &str, version: &str, operating_system: &str) -> String {
    join(&[name, version, operating_system])
}

/// `cve#operating_system`
pub fn cve_id(cve: &str, operating_system: &str) -> String {
    join(&[cve, operating_system])
}

/// `node_id#component_id`
pub fn node_component_edge_id(node_id: &str, component_id: &str) -> String {
    join(&[node_id, component_id])
}

/// `component_id#cve_id`
pub fn component_cve_edge_id(component_id: &str, cve_id: &str) -> String {
    join(&[component_id, cve_id])
}

fn join(parts: &[&str]) -> String {
    let mut id = String::with_capacity(parts.iter().map(|part| part.len() + 1).sum());
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            id.push(SEPARATOR);
        }
        id.push_str(part);
    }
    id
}
