//! Lazily created records shared by every instantiation of one definition.
//!
//! The cell's lock is held across "read cache, else compute and cache", so two
//! callers composing the same definition concurrently observe one record.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Mutex-guarded lazy slot holding one shared record.
pub struct SharedRecord<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> SharedRecord<T> {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Returns the cached record, if any.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().clone()
    }

    /// Checks if a record is cached.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Returns the cached record, or runs `init` and caches its result.
    /// The boolean is true when `init` ran. A failing `init` leaves the slot empty.
    pub fn get_or_try_init<E, F>(&self, init: F) -> Result<(Arc<T>, bool), E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            return Ok((Arc::clone(existing), false));
        }
        let created = Arc::new(init()?);
        *slot = Some(Arc::clone(&created));
        Ok((created, true))
    }

    /// Removes and returns the cached record.
    pub fn take(&self) -> Option<Arc<T>> {
        self.slot.lock().take()
    }
}

impl<T> Default for SharedRecord<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedRecord").field(&*self.slot.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_init_runs_once() {
        let record: SharedRecord<u32> = SharedRecord::new();
        let (first, created) = record.get_or_try_init(|| Ok::<_, ()>(7)).unwrap();
        assert!(created);
        let (second, created) = record.get_or_try_init(|| Ok::<_, ()>(8)).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 7);
    }

    #[test]
    fn test_failed_init_leaves_slot_empty() {
        let record: SharedRecord<u32> = SharedRecord::new();
        assert!(record.get_or_try_init(|| Err::<u32, _>("nope")).is_err());
        assert!(!record.is_set());
        assert_eq!(*record.get_or_try_init(|| Ok::<_, ()>(1)).unwrap().0, 1);
    }

    #[test]
    fn test_take() {
        let record: SharedRecord<u32> = SharedRecord::new();
        record.get_or_try_init(|| Ok::<_, ()>(1)).unwrap();
        assert_eq!(record.take().as_deref(), Some(&1));
        assert!(record.get().is_none());
    }

    #[test]
    fn test_concurrent_init_single_record() {
        let record = Arc::new(SharedRecord::<u32>::new());
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let record = Arc::clone(&record);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    record
                        .get_or_try_init(|| Ok::<_, ()>(counter.fetch_add(1, Ordering::SeqCst)))
                        .unwrap()
                        .0
                })
            })
            .collect();

        let results: Vec<Arc<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }
}
