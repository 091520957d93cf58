//! Discrete-key mutual exclusion.
//!
//! # Responsibility
//! - Serialize writers whose key sets overlap.
//! - Let writers with disjoint key sets run concurrently.
//!
//! # Invariants
//! - A key set is acquired all-or-nothing, so two writers never hold parts
//!   of each other's sets and cannot deadlock.
//! - Keys are released when the guard drops, including on error and panic.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashSet};

/// Canonical (sorted, de-duplicated) set of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: BTreeSet<String>,
}

impl KeySet {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for KeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[derive(Default)]
pub struct KeyFence {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl KeyFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding every key of `keys`.
    pub fn do_with_lock<T>(&self, keys: &KeySet, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock(keys);
        f()
    }

    /// Blocks until no key of `keys` is held, then holds all of them.
    pub fn lock<'fence>(&'fence self, keys: &KeySet) -> FenceGuard<'fence> {
        let mut held = self.held.lock();
        while keys.iter().any(|key| held.contains(key)) {
            self.released.wait(&mut held);
        }
        held.extend(keys.iter().map(str::to_string));
        FenceGuard {
            fence: self,
            keys: keys.keys.iter().cloned().collect(),
        }
    }

    /// Number of keys currently held.
    pub fn held_keys(&self) -> usize {
        self.held.lock().len()
    }
}

pub struct FenceGuard<'fence> {
    fence: &'fence KeyFence,
    keys: Vec<String>,
}

impl Drop for FenceGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.fence.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.fence.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyFence, KeySet};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn key_set_is_canonical() {
        let left = KeySet::new(["b", "a", "b"]);
        let right: KeySet = ["a", "b"].into_iter().collect();
        assert_eq!(left, right);
        assert_eq!(left.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn overlapping_sets_never_interleave() {
        let fence = Arc::new(KeyFence::new());
        let events = Arc::new(Mutex::new(Vec::new()));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let fence = Arc::clone(&fence);
                let events = Arc::clone(&events);
                thread::spawn(move || {
                    let keys = KeySet::new([format!("node-{worker}"), "shared-component".to_string()]);
                    for _ in 0..5 {
                        fence.do_with_lock(&keys, || {
                            events.lock().push((worker, "delete"));
                            thread::sleep(Duration::from_millis(1));
                            events.lock().push((worker, "load"));
                        });
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let events = events.lock();
        assert_eq!(events.len(), 40);
        for pair in events.chunks(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, "delete");
            assert_eq!(pair[1].1, "load");
        }
        assert_eq!(fence.held_keys(), 0);
    }

    #[test]
    fn disjoint_sets_run_concurrently() {
        let fence = Arc::new(KeyFence::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let fence = Arc::clone(&fence);
            thread::spawn(move || {
                fence.do_with_lock(&KeySet::new(["node-a", "component-a"]), || {
                    entered_tx.send(()).unwrap();
                    release_rx.recv_timeout(Duration::from_secs(5)).unwrap();
                });
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let other = {
            let fence = Arc::clone(&fence);
            thread::spawn(move || {
                fence.do_with_lock(&KeySet::new(["node-b", "component-b"]), || {
                    done_tx.send(()).unwrap();
                });
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        release_tx.send(()).unwrap();
        holder.join().unwrap();
        other.join().unwrap();
    }

    #[test]
    fn keys_are_released_after_panic() {
        let fence = Arc::new(KeyFence::new());
        let panicking = {
            let fence = Arc::clone(&fence);
            thread::spawn(move || {
                fence.do_with_lock(&KeySet::new(["node-a"]), || panic!("writer failed"));
            })
        };
        assert!(panicking.join().is_err());
        assert_eq!(fence.held_keys(), 0);

        let ran = fence.do_with_lock(&KeySet::new(["node-a"]), || true);
        assert!(ran);
    }
}
