//! Bitmap number pools for replication minor numbers and layer resource ids.
//!
//! Thread-safe via an internal mutex. Automatic allocation always hands out the
//! lowest free number of the range.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LayerError, LayerResult};

/// Inclusive range of numbers managed by a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberRange {
    /// First number of the range.
    pub start: u32,
    /// Last number of the range.
    pub end: u32,
}

impl NumberRange {
    /// Creates a new range.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of values in the range.
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Checks if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if `nr` lies within the range.
    pub fn contains(&self, nr: u32) -> bool {
        nr >= self.start && nr <= self.end
    }
}

struct PoolInner {
    bits: Vec<u64>,
    allocated: usize,
}

impl PoolInner {
    fn is_set(&self, idx: usize) -> bool {
        self.bits[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.bits[idx / 64] |= 1u64 << (idx % 64);
        self.allocated += 1;
    }

    fn clear(&mut self, idx: usize) {
        self.bits[idx / 64] &= !(1u64 << (idx % 64));
        self.allocated -= 1;
    }

    fn first_free(&self, len: usize) -> Option<usize> {
        for (word_idx, word) in self.bits.iter().enumerate() {
            if *word != u64::MAX {
                let idx = word_idx * 64 + (!*word).trailing_zeros() as usize;
                if idx < len {
                    return Some(idx);
                }
                return None;
            }
        }
        None
    }
}

/// Allocator for unique numbers within a [`NumberRange`].
pub struct NumberPool {
    name: String,
    range: NumberRange,
    inner: Mutex<PoolInner>,
}

impl NumberPool {
    /// Creates an empty pool over `range`.
    pub fn new(name: impl Into<String>, range: NumberRange) -> Self {
        let words = range.len().div_ceil(64);
        Self {
            name: name.into(),
            range,
            inner: Mutex::new(PoolInner {
                bits: vec![0; words],
                allocated: 0,
            }),
        }
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the managed range.
    pub fn range(&self) -> NumberRange {
        self.range
    }

    fn index_of(&self, nr: u32) -> LayerResult<usize> {
        if !self.range.contains(nr) {
            return Err(LayerError::implementation(format!(
                "number {} outside of pool {} range {}..={}",
                nr, self.name, self.range.start, self.range.end
            )));
        }
        Ok((nr - self.range.start) as usize)
    }

    /// Reserves `nr`. Returns false if it was already allocated.
    pub fn allocate(&self, nr: u32) -> LayerResult<bool> {
        let idx = self.index_of(nr)?;
        let mut inner = self.inner.lock();
        if inner.is_set(idx) {
            return Ok(false);
        }
        inner.set(idx);
        Ok(true)
    }

    /// Allocates the lowest free number.
    pub fn auto_allocate(&self) -> LayerResult<u32> {
        let mut inner = self.inner.lock();
        match inner.first_free(self.range.len()) {
            Some(idx) => {
                inner.set(idx);
                let nr = self.range.start + idx as u32;
                debug!(pool = %self.name, nr, "allocated number");
                Ok(nr)
            }
            None => Err(LayerError::PoolExhausted {
                pool: self.name.clone(),
            }),
        }
    }

    /// Releases `nr`. Returns false if it was not allocated.
    pub fn deallocate(&self, nr: u32) -> LayerResult<bool> {
        let idx = self.index_of(nr)?;
        let mut inner = self.inner.lock();
        if !inner.is_set(idx) {
            return Ok(false);
        }
        inner.clear(idx);
        Ok(true)
    }

    /// Checks if `nr` is allocated. Numbers outside the range never are.
    pub fn is_allocated(&self, nr: u32) -> bool {
        match self.index_of(nr) {
            Ok(idx) => self.inner.lock().is_set(idx),
            Err(_) => false,
        }
    }

    /// Number of allocated values.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().allocated
    }

    /// Number of free values.
    pub fn available_count(&self) -> usize {
        self.range.len() - self.allocated_count()
    }
}

impl std::fmt::Debug for NumberPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NumberPool")
            .field("name", &self.name)
            .field("range", &self.range)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_allocate_lowest_first() {
        let pool = NumberPool::new("minor", NumberRange::new(1000, 1010));
        assert_eq!(pool.auto_allocate().unwrap(), 1000);
        assert_eq!(pool.auto_allocate().unwrap(), 1001);
        assert!(pool.deallocate(1000).unwrap());
        assert_eq!(pool.auto_allocate().unwrap(), 1000);
        assert_eq!(pool.allocated_count(), 2);
    }

    #[test]
    fn test_explicit_allocate_skipped_by_auto() {
        let pool = NumberPool::new("minor", NumberRange::new(0, 3));
        assert!(pool.allocate(0).unwrap());
        assert!(!pool.allocate(0).unwrap());
        assert_eq!(pool.auto_allocate().unwrap(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let pool = NumberPool::new("ids", NumberRange::new(5, 6));
        pool.auto_allocate().unwrap();
        pool.auto_allocate().unwrap();
        let err = pool.auto_allocate().unwrap_err();
        assert_eq!(err, LayerError::PoolExhausted { pool: "ids".to_string() });
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let pool = NumberPool::new("ids", NumberRange::new(10, 20));
        assert!(matches!(
            pool.allocate(21),
            Err(LayerError::ImplementationError { .. })
        ));
        assert!(!pool.is_allocated(9));
    }

    #[test]
    fn test_deallocate_unallocated() {
        let pool = NumberPool::new("ids", NumberRange::new(0, 100));
        assert!(!pool.deallocate(50).unwrap());
    }

    #[test]
    fn test_word_boundary() {
        let pool = NumberPool::new("ids", NumberRange::new(0, 129));
        for expected in 0..130 {
            assert_eq!(pool.auto_allocate().unwrap(), expected);
        }
        assert!(pool.auto_allocate().is_err());
        assert!(pool.deallocate(127).unwrap());
        assert_eq!(pool.auto_allocate().unwrap(), 127);
    }
}
