//! Atomic bitmaps for per-slot and per-page bookkeeping.
//!
//! Heap blocks keep one bitmap each for allocation, marking, pending dispose
//! and dirty pages. Bits are set and cleared with atomic read-modify-write so
//! the mutator, the background thread and parallel markers can share them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A fixed-size bitmap with an atomic population count.
///
/// # Example
///
/// ```
/// use recycler::heap::Bitmap;
///
/// let bitmap = Bitmap::new(100);
/// assert!(bitmap.set(3));
/// assert!(!bitmap.set(3));
/// assert!(bitmap.get(3));
/// assert_eq!(bitmap.count(), 1);
/// ```
#[derive(Debug)]
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    capacity: usize,
    count: AtomicUsize,
}

impl Bitmap {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = (0..capacity.div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            words,
            capacity,
            count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Sets bit `index`. Returns `true` if this call changed it.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize) -> bool {
        self.set_with(index, Ordering::AcqRel)
    }

    /// Sets bit `index` with release ordering, for publishing a write that precedes it.
    pub fn set_release(&self, index: usize) -> bool {
        self.set_with(index, Ordering::Release)
    }

    fn set_with(&self, index: usize, order: Ordering) -> bool {
        assert!(index < self.capacity, "bit {index} out of range");
        let mask = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_or(mask, order);
        if prev & mask == 0 {
            self.count.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Clears bit `index`. Returns `true` if it was set.
    pub fn clear_bit(&self, index: usize) -> bool {
        assert!(index < self.capacity, "bit {index} out of range");
        let mask = 1u64 << (index % 64);
        let prev = self.words[index / 64].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            false
        } else {
            self.count.fetch_sub(1, Ordering::Relaxed);
            true
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.capacity, "bit {index} out of range");
        (self.words[index / 64].load(Ordering::Acquire) >> (index % 64)) & 1 != 0
    }

    /// Clears all bits.
    pub fn clear(&self) {
        for word in &*self.words {
            word.store(0, Ordering::Release);
        }
        self.count.store(0, Ordering::Relaxed);
    }

    /// Clears all bits and returns the indices that were set.
    pub fn take(&self) -> Vec<usize> {
        let mut taken = Vec::new();
        for (w, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            if bits != 0 {
                self.count
                    .fetch_sub(bits.count_ones() as usize, Ordering::Relaxed);
            }
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                taken.push(w * 64 + bit);
                bits &= bits - 1;
            }
        }
        taken
    }

    /// Indices of the set bits, without clearing them.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            let mut bits = word.load(Ordering::Acquire);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(w * 64 + bit)
            })
        })
    }
}
