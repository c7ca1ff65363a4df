#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore used to bound concurrent native resource usage.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    permits: Mutex<usize>,
    capacity: usize,
    released: Condvar,
}

/// Permit held against a [`Semaphore`]; released on drop.
pub struct SemaphorePermit {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Creates a semaphore with `capacity` permits (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(SemaphoreInner {
                permits: Mutex::new(capacity),
                capacity,
                released: Condvar::new(),
            }),
        }
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) -> SemaphorePermit {
        let mut permits = self.inner.permits.lock();
        while *permits == 0 {
            self.inner.released.wait(&mut permits);
        }
        *permits -= 1;
        SemaphorePermit {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        let mut permits = self.inner.permits.lock();
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(SemaphorePermit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of permits currently free.
    pub fn available(&self) -> usize {
        *self.inner.permits.lock()
    }

    /// Total permits.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        let mut permits = self.inner.permits.lock();
        *permits += 1;
        drop(permits);
        self.inner.released.notify_one();
    }
}

/// A pooled value together with the pool generation it was built against.
pub struct Stamped<T> {
    value: T,
    generation: u64,
}

impl<T> Stamped<T> {
    /// Stamps `value` with `generation`.
    pub fn new(value: T, generation: u64) -> Self {
        Self { value, generation }
    }

    /// Generation this value was built against.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shared access to the value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Exclusive access to the value.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Bounded free-list of recyclable values stamped with a generation.
///
/// Advancing the generation invalidates everything built earlier: stale
/// values are discarded on checkout and refused on checkin.
pub struct GenerationPool<T> {
    free: Mutex<Vec<Stamped<T>>>,
    capacity: usize,
    generation: AtomicU64,
}

impl<T> GenerationPool<T> {
    /// Creates an empty pool retaining at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            generation: AtomicU64::new(0),
        }
    }

    /// Current generation.
    pub fn current(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Moves to the next generation and returns it.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns true if `item` was built against the current generation.
    pub fn is_current(&self, item: &Stamped<T>) -> bool {
        item.generation == self.current()
    }

    /// Pops a current-generation value, dropping any stale ones encountered.
    pub fn checkout(&self) -> Option<Stamped<T>> {
        let current = self.current();
        let mut free = self.free.lock();
        while let Some(item) = free.pop() {
            if item.generation == current {
                return Some(item);
            }
        }
        None
    }

    /// Returns `item` to the pool; stale or overflow values are dropped.
    ///
    /// Returns true if the value was retained.
    pub fn checkin(&self, item: Stamped<T>) -> bool {
        if !self.is_current(&item) {
            return false;
        }
        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            return false;
        }
        free.push(item);
        true
    }

    /// Removes and returns every pooled value.
    pub fn drain(&self) -> Vec<Stamped<T>> {
        std::mem::take(&mut *self.free.lock())
    }

    /// Number of values currently pooled.
    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns true if nothing is pooled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_blocks_until_release() {
        let sem = Semaphore::new(1);
        let held = sem.acquire();
        assert!(sem.try_acquire().is_none());
        let acquired = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let sem = sem.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _permit = sem.acquire();
                acquired.store(1, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0, "waiter must block");
        drop(held);
        waiter.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn stale_values_are_discarded() {
        let pool = GenerationPool::new(4);
        let gen = pool.current();
        assert!(pool.checkin(Stamped::new(1u32, gen)));
        assert!(pool.checkin(Stamped::new(2u32, gen)));
        pool.advance();
        assert!(pool.checkout().is_none(), "stale entries must not be reused");
        assert!(pool.is_empty());
        assert!(!pool.checkin(Stamped::new(3u32, gen)));
        let fresh = pool.current();
        assert!(pool.checkin(Stamped::new(4u32, fresh)));
        let item = pool.checkout().expect("current entry");
        assert_eq!(*item.get(), 4);
        assert_eq!(item.generation(), fresh);
    }

    #[test]
    fn pool_respects_capacity() {
        let pool = GenerationPool::new(2);
        let gen = pool.current();
        assert!(pool.checkin(Stamped::new('a', gen)));
        assert!(pool.checkin(Stamped::new('b', gen)));
        assert!(!pool.checkin(Stamped::new('c', gen)));
        assert_eq!(pool.drain().len(), 2);
    }
}
