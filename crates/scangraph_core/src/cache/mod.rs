//! Read caches for graph rows.
//!
//! # Responsibility
//! - [`TxCache`]: per-operation map that avoids re-reading rows already
//!   loaded during the same transaction.
//! - [`SharedCache`]: process-wide map of immutable snapshots for the CVE
//!   rows read by every node.
//!
//! # Invariants
//! - `get_many(ids)` returns `found ∪ missing = ids` and
//!   `found ∩ missing = ∅`; `missing` has no duplicates.
//! - Values handed out by [`SharedCache`] are `Arc` snapshots; later cache
//!   writes never change a snapshot a caller already holds.

mod shared;
mod tx_cache;

pub use shared::{ReadToken, SharedCache};
pub use tx_cache::TxCache;
