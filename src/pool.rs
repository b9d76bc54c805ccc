//! Bounded pools of reusable per-request objects.
//!
//! `acquire` never blocks and never fails: it pops a pooled object or builds
//! a fresh one. `release` resets the object and keeps it only while the pool
//! holds fewer than `capacity` objects; otherwise the object is dropped.
//!
//! Storage is a lock-free queue plus an atomic count of reserved slots. A
//! release reserves a slot before enqueueing and an acquire frees one after
//! dequeueing, so under contention the count and the queue length briefly
//! disagree. Once concurrent calls settle the pool holds at most `capacity`
//! objects.

use crossbeam_channel::{Receiver, Sender};
use std::fmt::{self, Debug};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Objects that can be returned to a fresh, caller-indistinguishable state.
pub trait Reset {
    /// Clear every trace of previous use.
    fn reset(&mut self);
}

impl Reset for String {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Pool capacity for `per_cpu` objects per available hardware thread.
#[must_use]
pub fn default_capacity(per_cpu: usize) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    per_cpu.saturating_mul(cpus).max(1)
}

/// A thread-safe object pool that reuses objects to avoid allocations on hot
/// paths.
pub struct ObjectPool<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    /// Slots reserved by releases, freed by acquires
    stored: AtomicUsize,
    /// Factory function for creating new objects when the pool is empty
    create_fn: Arc<dyn Fn() -> T + Send + Sync>,
    capacity: usize,
}

impl<T> Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("len", &self.rx.len())
            .field("capacity", &self.capacity)
            .field("create_fn", &"<function>")
            .finish()
    }
}

impl<T: Reset + Send + 'static> ObjectPool<T> {
    /// Create an empty pool holding at most `capacity` objects.
    #[must_use]
    pub fn new<F>(capacity: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_prewarm(capacity, 0, create_fn)
    }

    /// Create a pool pre-filled with `prewarm` objects (at most `capacity`).
    #[must_use]
    pub fn with_prewarm<F>(capacity: usize, prewarm: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = Self {
            tx,
            rx,
            stored: AtomicUsize::new(0),
            create_fn: Arc::new(create_fn),
            capacity,
        };
        for _ in 0..prewarm.min(capacity) {
            pool.release((pool.create_fn)());
        }
        pool
    }

    /// Take an object from the pool, or build one if the pool is empty.
    ///
    /// The object is always in reset state.
    pub fn acquire(&self) -> T {
        match self.rx.try_recv() {
            Ok(object) => {
                self.stored.fetch_sub(1, Ordering::AcqRel);
                object
            }
            Err(_) => {
                trace!("Pool empty, constructing new object");
                (self.create_fn)()
            }
        }
    }

    /// Reset `object` and offer it back to the pool.
    ///
    /// Returns false if the pool was full and the object was dropped.
    pub fn release(&self, mut object: T) -> bool {
        if self.stored.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.stored.fetch_sub(1, Ordering::AcqRel);
            trace!(capacity = self.capacity, "Pool full, discarding object");
            return false;
        }

        object.reset();
        if self.tx.send(object).is_err() {
            // The receiver lives in `self`; unreachable while the pool exists.
            self.stored.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Get an object wrapped in a guard that releases it on drop.
    pub fn get(&self) -> PooledObject<'_, T> {
        PooledObject {
            object: Some(self.acquire()),
            pool: self,
        }
    }
}

impl<T> ObjectPool<T> {
    /// Number of objects currently pooled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if the pool holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of objects kept.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A smart pointer for objects borrowed from an `ObjectPool`.
///
/// When dropped, the object is released back to the pool.
pub struct PooledObject<'a, T: Reset + Send + 'static> {
    /// The object borrowed from the pool (None once released or detached)
    object: Option<T>,
    pool: &'a ObjectPool<T>,
}

impl<T: Reset + Send + 'static> PooledObject<'_, T> {
    /// Release the object back to the pool now.
    pub fn return_to_pool(mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(object);
        }
    }

    /// Keep the object; it will not be returned to the pool.
    #[must_use]
    pub fn detach(mut self) -> T {
        self.object
            .take()
            .unwrap_or_else(|| (self.pool.create_fn)())
    }
}

impl<T: Reset + Send + 'static> Drop for PooledObject<'_, T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.release(object);
        }
    }
}

impl<T: Reset + Send + 'static> std::ops::Deref for PooledObject<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.object
            .as_ref()
            .expect("Object already returned to pool")
    }
}

impl<T: Reset + Send + 'static> std::ops::DerefMut for PooledObject<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.object
            .as_mut()
            .expect("Object already returned to pool")
    }
}

impl<T: Reset + Send + Debug + 'static> Debug for PooledObject<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledObject")
            .field("object", &self.object)
            .finish()
    }
}

impl<T: Reset + Send + fmt::Display + 'static> fmt::Display for PooledObject<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.object {
            Some(object) => fmt::Display::fmt(object, f),
            None => Ok(()),
        }
    }
}

/// A string borrowed from a [`StringPool`].
pub type PooledString<'a> = PooledObject<'a, String>;

/// A vector borrowed from a [`VecPool`].
pub type PooledVec<'a, T> = PooledObject<'a, Vec<T>>;

/// A pool for reusing String objects to avoid allocations in hot paths.
#[derive(Debug)]
pub struct StringPool {
    inner: ObjectPool<String>,
}

impl StringPool {
    /// Create a string pool; new strings start with `initial_capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize, prewarm: usize, initial_capacity: usize) -> Self {
        Self {
            inner: ObjectPool::with_prewarm(capacity, prewarm, move || {
                String::with_capacity(initial_capacity)
            }),
        }
    }

    /// Get an empty string from the pool.
    pub fn get(&self) -> PooledString<'_> {
        self.inner.get()
    }

    /// Get a string from the pool and initialize it with the provided value.
    pub fn get_with_value<S: AsRef<str>>(&self, value: S) -> PooledString<'_> {
        let mut string = self.inner.get();
        string.push_str(value.as_ref());
        string
    }

    /// The underlying object pool.
    #[must_use]
    pub const fn pool(&self) -> &ObjectPool<String> {
        &self.inner
    }
}

/// Pool of reusable `Vec<T>` objects to avoid allocations on hot paths.
pub struct VecPool<T> {
    inner: ObjectPool<Vec<T>>,
}

impl<T> Debug for VecPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VecPool").field("inner", &self.inner).finish()
    }
}

impl<T: Send + 'static> VecPool<T> {
    /// Create a vector pool; new vectors start with room for `initial_capacity` items.
    #[must_use]
    pub fn new(capacity: usize, prewarm: usize, initial_capacity: usize) -> Self {
        Self {
            inner: ObjectPool::with_prewarm(capacity, prewarm, move || {
                Vec::with_capacity(initial_capacity)
            }),
        }
    }

    /// Get an empty vector from the pool.
    pub fn get(&self) -> PooledVec<'_, T> {
        self.inner.get()
    }

    /// The underlying object pool.
    #[must_use]
    pub const fn pool(&self) -> &ObjectPool<Vec<T>> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn counting_pool(capacity: usize) -> (ObjectPool<Vec<u8>>, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let pool = ObjectPool::new(capacity, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        });
        (pool, built)
    }

    #[test]
    fn test_acquire_constructs_when_empty() {
        let (pool, built) = counting_pool(4);
        assert!(pool.is_empty());
        let _a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_invariant() {
        let (pool, built) = counting_pool(4);
        let mut first = pool.acquire();
        first.extend_from_slice(b"secret");
        assert!(pool.release(first));

        let second = pool.acquire();
        assert!(second.is_empty());
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_discards_beyond_capacity() {
        let (pool, _) = counting_pool(2);
        assert!(pool.release(vec![1]));
        assert!(pool.release(vec![2]));
        assert!(!pool.release(vec![3]));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_concurrent_releases_settle_at_capacity() {
        let (pool, built) = counting_pool(2);
        let pool = Arc::new(pool);
        let barrier = Arc::new(Barrier::new(3));

        let handles: Vec<_> = (0..3u8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    pool.release(vec![i]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let kept = pool.len();
        assert!(kept <= 2);

        let reused = (0..3).map(|_| pool.acquire()).filter(Vec::is_empty).count();
        assert_eq!(reused, 3);
        assert_eq!(built.load(Ordering::SeqCst), 3 - kept);
    }

    #[test]
    fn test_burst_never_leaves_pool_over_capacity() {
        let pool = Arc::new(ObjectPool::new(8, Vec::<u64>::new));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let mut v = pool.acquire();
                        v.push(i);
                        pool.release(v);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() <= 8);
        while !pool.is_empty() {
            assert!(pool.acquire().is_empty());
        }
    }

    #[test]
    fn test_prewarm_is_bounded_by_capacity() {
        let pool = ObjectPool::with_prewarm(3, 10, String::new);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let pool = ObjectPool::new(2, String::new);
        {
            let mut guard = pool.get();
            guard.push_str("temp");
            assert_eq!(guard.to_string(), "temp");
        }
        assert_eq!(pool.len(), 1);
        assert_eq!(*pool.get(), "");

        let kept = pool.get().detach();
        assert!(kept.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_string_pool() {
        let pool = StringPool::new(10, 5, 32);
        assert_eq!(pool.pool().len(), 5);

        let mut str1 = pool.get();
        str1.push_str("hello");
        assert_eq!(*str1, "hello");
        drop(str1);

        let str2 = pool.get();
        assert_eq!(*str2, "");

        let str3 = pool.get_with_value("world");
        assert_eq!(*str3, "world");
    }

    #[test]
    fn test_vec_pool() {
        let pool = VecPool::new(10, 0, 32);

        let mut vec1 = pool.get();
        vec1.push(1);
        vec1.push(2);
        assert_eq!(*vec1, vec![1, 2]);
        vec1.return_to_pool();

        let vec2 = pool.get();
        assert_eq!(*vec2, Vec::<i32>::new());
        assert!(vec2.capacity() >= 32);
    }

    #[test]
    fn test_default_capacity_scales_with_cpus() {
        assert!(default_capacity(4) >= 4);
        assert_eq!(default_capacity(0), 1);
    }
}
