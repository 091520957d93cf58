//! Node scan graph domain model.
//!
//! # Responsibility
//! - Define the caller-facing [`node::Node`] with its embedded scan.
//! - Define the flat row kinds the node is stored as.
//! - Split a node into rows and merge rows back into a node.
//!
//! # Invariants
//! - Row identifiers are content-derived (see [`ids`]), so identical
//!   components or CVEs reported by different nodes collapse to one row.
//! - Splitting then merging a node yields the same node up to ordering and
//!   de-duplication of its scan.

pub mod component;
pub mod cve;
pub mod edge;
pub mod ids;
pub mod node;
pub mod parts;
