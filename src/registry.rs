//! Thread-safe link registry: opaque handle -> owned socket wrapper.
//!
//! Handles are allocated from a monotonic counter; the smallest free integer
//! is only scanned for after the counter is exhausted, which takes
//! `u32::MAX` allocations in one driver lifetime. Handle `0` is reserved
//! invalid and never produced. The registry lock is held only for table
//! mutation, never across I/O.

use std::{collections::HashMap, sync::Arc};

use crate::sync::Mutex;

const MAX_HANDLE: u32 = u32::MAX;

struct Inner<S> {
  map: HashMap<u32, Arc<S>>,
  counter: u32,
}

pub(crate) struct Registry<S> {
  inner: Mutex<Inner<S>>,
}

impl<S> Registry<S> {
  pub fn new() -> Self {
    Self { inner: Mutex::new(Inner { map: HashMap::new(), counter: 0 }) }
  }

  /// Registers a wrapper and returns its new handle, or `None` when every
  /// handle is live (the absolute ceiling, failing synchronously).
  pub fn add(&self, socket: Arc<S>) -> Option<u32> {
    let mut inner = self.inner.lock();
    if inner.map.len() as u64 >= MAX_HANDLE as u64 {
      return None;
    }
    let handle = if inner.counter != MAX_HANDLE {
      inner.counter += 1;
      inner.counter
    } else {
      // Counter exhausted: fall back to the smallest free integer.
      let mut candidate = 1u32;
      while inner.map.contains_key(&candidate) {
        candidate += 1;
      }
      candidate
    };
    let _previous = inner.map.insert(handle, socket);
    debug_assert!(_previous.is_none(), "handle {handle} was still live");
    Some(handle)
  }

  /// Erases the entry; the wrapper is destroyed when the last clone drops.
  pub fn remove(&self, handle: u32) -> Option<Arc<S>> {
    self.inner.lock().map.remove(&handle)
  }

  /// Clones the wrapper out under the lock. Callers must not assume the
  /// handle stays live across a later operation.
  pub fn find(&self, handle: u32) -> Option<Arc<S>> {
    self.inner.lock().map.get(&handle).cloned()
  }

  /// Removes every entry, returning the handles that were live.
  pub fn drain(&self) -> Vec<u32> {
    let mut inner = self.inner.lock();
    inner.counter = 0;
    inner.map.drain().map(|(handle, _)| handle).collect()
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.inner.lock().map.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use std::thread;

  #[test]
  fn handles_start_at_one() {
    let registry = Registry::new();
    assert_eq!(registry.add(Arc::new(())), Some(1));
    assert_eq!(registry.add(Arc::new(())), Some(2));
  }

  #[test]
  fn removed_handle_is_not_reused() {
    let registry = Registry::new();
    let first = registry.add(Arc::new(())).unwrap();
    registry.remove(first);
    let second = registry.add(Arc::new(())).unwrap();
    assert_ne!(first, second);
    assert!(registry.find(first).is_none());
    assert!(registry.find(second).is_some());
  }

  #[test]
  fn find_clones_the_entry() {
    let registry = Registry::new();
    let value = Arc::new(7usize);
    let handle = registry.add(value.clone()).unwrap();
    let found = registry.find(handle).unwrap();
    assert_eq!(*found, 7);
    assert_eq!(Arc::strong_count(&value), 3);
  }

  #[test]
  fn concurrent_adds_yield_distinct_nonzero_handles() {
    let registry = Arc::new(Registry::new());
    let threads = 8;
    let per_thread = 500;

    let joins: Vec<_> = (0..threads)
      .map(|_| {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
          (0..per_thread)
            .map(|_| registry.add(Arc::new(())).unwrap())
            .collect::<Vec<_>>()
        })
      })
      .collect();

    let mut seen = HashSet::new();
    for join in joins {
      for handle in join.join().unwrap() {
        assert_ne!(handle, 0);
        assert!(seen.insert(handle), "handle {handle} allocated twice");
      }
    }
    assert_eq!(seen.len(), threads * per_thread);
    assert_eq!(registry.len(), threads * per_thread);
  }

  #[test]
  fn concurrent_add_remove_churn() {
    let registry = Arc::new(Registry::new());

    let joins: Vec<_> = (0..8)
      .map(|_| {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
          let mut live = Vec::new();
          for _ in 0..200 {
            live.push(registry.add(Arc::new(())).unwrap());
            if live.len() > 4 && fastrand::bool() {
              let handle = live.remove(fastrand::usize(..live.len()));
              assert!(registry.remove(handle).is_some());
            }
          }
          for handle in live {
            assert!(registry.remove(handle).is_some());
          }
        })
      })
      .collect();

    for join in joins {
      join.join().unwrap();
    }
    assert_eq!(registry.len(), 0);
  }

  #[test]
  fn drain_empties_the_registry() {
    let registry = Registry::new();
    for _ in 0..5 {
      registry.add(Arc::new(())).unwrap();
    }
    let mut drained = registry.drain();
    drained.sort_unstable();
    assert_eq!(drained, vec![1, 2, 3, 4, 5]);
    assert_eq!(registry.len(), 0);
  }
}
