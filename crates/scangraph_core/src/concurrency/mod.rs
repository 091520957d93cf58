//! Writer coordination primitives.

pub mod key_fence;

pub use key_fence::{KeyFence, KeySet};
