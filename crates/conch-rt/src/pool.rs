// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Owned channels: elements carry pooled resources.
//!
//! The caller supplies create/reset/destroy hooks (arena-style resources
//! that are expensive to build and cheap to reset). `Pooled<T>` guards
//! recycle into the pool on drop — including the silent drop-old path —
//! and the pool destroys its free elements on teardown.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::channel::{Backpressure, Channel};
use crate::error::RtError;

/// Caller-supplied lifecycle hooks for pooled resources.
pub struct PoolHooks<T> {
    pub create: Box<dyn Fn() -> T + Send + Sync>,
    pub reset: Box<dyn Fn(&mut T) + Send + Sync>,
    pub destroy: Box<dyn Fn(T) + Send + Sync>,
}

struct PoolInner<T> {
    free: Mutex<Vec<T>>,
    hooks: PoolHooks<T>,
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        let free = self.free.get_mut().unwrap();
        for v in free.drain(..) {
            (self.hooks.destroy)(v);
        }
    }
}

/// Pool of reusable resources.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn new(hooks: PoolHooks<T>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                hooks,
            }),
        }
    }

    /// Take a recycled element, or create a fresh one.
    pub fn acquire(&self) -> Pooled<T> {
        let value = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| (self.inner.hooks.create)());
        Pooled {
            value: Some(value),
            pool: self.inner.clone(),
        }
    }

    /// Recycled elements currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }

    /// Guard-less acquire for surfaces (FFI) that track checkout
    /// manually. Pair with [`release`](Self::release) or
    /// [`destroy`](Self::destroy).
    pub fn acquire_raw(&self) -> T {
        self.inner
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| (self.inner.hooks.create)())
    }

    /// Reset an element checked out with [`acquire_raw`](Self::acquire_raw)
    /// and return it to the pool.
    pub fn release(&self, mut value: T) {
        (self.inner.hooks.reset)(&mut value);
        self.inner.free.lock().unwrap().push(value);
    }

    /// Destroy an element instead of recycling it (teardown paths).
    pub fn destroy(&self, value: T) {
        (self.inner.hooks.destroy)(value);
    }
}

/// An element checked out of a [`ResourcePool`]. Reset and returned to
/// the pool on drop; the pool keeps the element alive until teardown.
pub struct Pooled<T> {
    value: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled").field("value", &self.value).finish()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value already released")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value already released")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(mut v) = self.value.take() {
            (self.pool.hooks.reset)(&mut v);
            self.pool.free.lock().unwrap().push(v);
        }
    }
}

/// Channel whose elements are pooled resources. Sending moves ownership
/// of the checked-out element; any path that discards an element
/// (drop-old, close-time drain) recycles it.
pub struct OwnedChannel<T> {
    chan: Arc<Channel<Pooled<T>>>,
    pool: ResourcePool<T>,
}

impl<T: Send + 'static> OwnedChannel<T> {
    pub fn new(
        capacity: usize,
        mode: Backpressure,
        hooks: PoolHooks<T>,
    ) -> Result<Self, RtError> {
        // Owned elements always move; take is implied.
        let chan = Channel::new(capacity, mode, true)?;
        Ok(Self {
            chan,
            pool: ResourcePool::new(hooks),
        })
    }

    /// Check out an element to fill and send.
    pub fn acquire(&self) -> Pooled<T> {
        self.pool.acquire()
    }

    /// The underlying channel; all send/recv flavors apply.
    pub fn channel(&self) -> &Arc<Channel<Pooled<T>>> {
        &self.chan
    }

    pub fn pool(&self) -> &ResourcePool<T> {
        &self.pool
    }

    pub fn close(&self) {
        self.chan.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hooks(
        created: Arc<AtomicUsize>,
        reset: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    ) -> PoolHooks<Vec<u8>> {
        PoolHooks {
            create: Box::new(move || {
                created.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(64)
            }),
            reset: Box::new(move |v| {
                reset.fetch_add(1, Ordering::Relaxed);
                v.clear();
            }),
            destroy: Box::new(move |_| {
                destroyed.fetch_add(1, Ordering::Relaxed);
            }),
        }
    }

    #[test]
    fn acquire_reuses_reset_elements() {
        let created = Arc::new(AtomicUsize::new(0));
        let reset = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ResourcePool::new(counting_hooks(
            created.clone(),
            reset.clone(),
            destroyed.clone(),
        ));

        {
            let mut a = pool.acquire();
            a.push(1);
        } // recycled
        assert_eq!(pool.idle(), 1);
        {
            let b = pool.acquire(); // reuse, no create
            assert!(b.is_empty()); // reset cleared it
        }
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(reset.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn destroy_runs_on_teardown() {
        let created = Arc::new(AtomicUsize::new(0));
        let reset = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        {
            let pool = ResourcePool::new(counting_hooks(
                created.clone(),
                reset.clone(),
                destroyed.clone(),
            ));
            drop(pool.acquire());
            drop(pool.acquire());
        }
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(destroyed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn owned_channel_round_trip() {
        let created = Arc::new(AtomicUsize::new(0));
        let reset = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let oc = OwnedChannel::new(
            2,
            Backpressure::Block,
            counting_hooks(created.clone(), reset.clone(), destroyed.clone()),
        )
        .unwrap();

        let mut elem = oc.acquire();
        elem.extend_from_slice(b"payload");
        oc.channel().try_send(elem).unwrap();

        let got = oc.channel().try_recv().unwrap();
        assert_eq!(&got[..], b"payload");
        drop(got); // back to the pool
        assert_eq!(oc.pool().idle(), 1);
    }

    #[test]
    fn drop_old_recycles_displaced_element() {
        let created = Arc::new(AtomicUsize::new(0));
        let reset = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let oc = OwnedChannel::new(
            1,
            Backpressure::DropOld,
            counting_hooks(created.clone(), reset.clone(), destroyed.clone()),
        )
        .unwrap();

        oc.channel().try_send(oc.acquire()).unwrap();
        oc.channel().try_send(oc.acquire()).unwrap(); // displaces the first
        assert_eq!(oc.pool().idle(), 1);
        assert_eq!(created.load(Ordering::Relaxed), 2);
    }
}
