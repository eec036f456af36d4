// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Size-bucketed reusable buffer pool.
//!
//! Video decoding produces same-resolution frames, so a capacity-keyed free
//! list turns steady state into zero-allocation reuse. On a resolution
//! change, first-fit over `capacity >= len` keeps larger recycled buffers
//! serviceable without a round trip through the allocator.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::alloc::{BufAddr, HostAllocator, RawAllocator};
use crate::core::driver::DeviceMemory;
use crate::core::{PipelineError, Result};

/// Pool size bounds.
pub const POOL_MIN: usize = 2;
pub const POOL_MAX: usize = 1 << 16;

/// How long one saturated-pool wait lasts before the state is re-examined.
const SATURATED_WAIT: Duration = Duration::from_millis(2);
/// Saturated waits between "still starved" log lines.
const STARVED_LOG_EVERY: u32 = 512;

struct PoolState {
    pool_size: usize,
    /// capacity -> addresses, ascending, for first-fit lookup.
    free: BTreeMap<usize, Vec<BufAddr>>,
    free_len: usize,
    /// address -> capacity for every buffer currently handed out.
    busy: HashMap<BufAddr, usize>,
}

impl PoolState {
    fn take_first_fit(&mut self, len: usize) -> Option<(BufAddr, usize)> {
        let cap = *self.free.range(len..).next()?.0;
        let bucket = self.free.get_mut(&cap)?;
        let addr = bucket.pop()?;
        if bucket.is_empty() {
            self.free.remove(&cap);
        }
        self.free_len -= 1;
        Some((addr, cap))
    }

    fn take_largest(&mut self) -> Option<(BufAddr, usize)> {
        let cap = *self.free.keys().next_back()?;
        self.take_first_fit(cap)
    }

    fn insert_free(&mut self, addr: BufAddr, cap: usize) {
        self.free.entry(cap).or_default().push(addr);
        self.free_len += 1;
    }
}

/// Reuse cache over an allocator `A`. See the module docs.
///
/// Every address handed out is in exactly one of the two sets (`free` or
/// `busy`) for the lifetime of the pool; `free + busy` never exceeds the
/// (clamped) pool size.
pub struct BufferPool<A: RawAllocator> {
    label: &'static str,
    allocator: A,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl<A: RawAllocator> BufferPool<A> {
    pub fn with_allocator(label: &'static str, pool_size: usize, allocator: A) -> Self {
        if !(POOL_MIN..=POOL_MAX).contains(&pool_size) {
            warn!(label, pool_size, "pool size out of range [{POOL_MIN}, {POOL_MAX}], clamping");
        }
        Self {
            label,
            allocator,
            state: Mutex::new(PoolState {
                pool_size: pool_size.clamp(POOL_MIN, POOL_MAX),
                free: BTreeMap::new(),
                free_len: 0,
                busy: HashMap::new(),
            }),
            freed: Condvar::new(),
        }
    }

    /// Hand out a buffer with usable capacity >= `len`.
    ///
    /// Order of preference: recycle first-fit from the free list; allocate
    /// fresh while under the pool bound; reallocate the largest free buffer;
    /// otherwise wait for a `free` call. Allocator failures propagate.
    pub fn alloc(&self, len: usize) -> Result<BufAddr> {
        debug_assert!(len > 0);
        let mut state = self.state.lock();
        let mut waits: u32 = 0;
        loop {
            if let Some((addr, cap)) = state.take_first_fit(len) {
                state.busy.insert(addr, cap);
                return Ok(addr);
            }

            if state.free_len + state.busy.len() < state.pool_size {
                let addr = self.allocator.alloc(len)?;
                state.busy.insert(addr, len);
                return Ok(addr);
            }

            // No buffer fits and the pool is at capacity: sacrifice the
            // largest free buffer and size it to the request.
            if state.free_len > 0 {
                let (old, old_cap) = state
                    .take_largest()
                    .ok_or_else(|| PipelineError::Other(anyhow::anyhow!("free list corrupt")))?;
                let addr = self.allocator.realloc(old, old_cap, len)?;
                state.busy.insert(addr, len);
                return Ok(addr);
            }

            // Everything is busy. Wait for a free; `free` notifies.
            waits += 1;
            if waits % STARVED_LOG_EVERY == 0 {
                warn!(label = self.label, len, waits, "pool starved, still waiting for a free buffer");
            }
            self.freed.wait_for(&mut state, SATURATED_WAIT);
        }
    }

    /// Return a buffer to the free list, preserving its capacity.
    ///
    /// Unknown addresses are reported (and logged) but are not fatal.
    pub fn free(&self, addr: BufAddr) -> Result<()> {
        let mut state = self.state.lock();
        let Some(cap) = state.busy.remove(&addr) else {
            warn!(label = self.label, addr = addr.0, "buffer unrecognized");
            return Err(PipelineError::UnknownBuffer(addr.0));
        };
        state.insert_free(addr, cap);
        drop(state);
        self.freed.notify_one();
        Ok(())
    }

    /// Multiply the pool bound, staying inside `[POOL_MIN, POOL_MAX]`.
    /// Called once per added stream when the pool is shared.
    pub fn grow(&self, factor: usize) {
        let mut state = self.state.lock();
        state.pool_size = state
            .pool_size
            .saturating_mul(factor.max(1))
            .clamp(POOL_MIN, POOL_MAX);
        debug!(label = self.label, pool_size = state.pool_size, "pool bound grown");
        drop(state);
        self.freed.notify_all();
    }

    pub fn free_len(&self) -> usize {
        self.state.lock().free_len
    }

    pub fn busy_len(&self) -> usize {
        self.state.lock().busy.len()
    }

    pub fn pool_size(&self) -> usize {
        self.state.lock().pool_size
    }
}

impl<A: RawAllocator> Drop for BufferPool<A> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.busy.is_empty() {
            warn!(
                label = self.label,
                busy = state.busy.len(),
                "pool dropped with buffers still handed out; freeing them anyway"
            );
        }
        let busy: Vec<_> = state.busy.drain().collect();
        for (addr, cap) in busy {
            if let Err(err) = self.allocator.free(addr, cap) {
                warn!(label = self.label, %err, "failed to free busy buffer during teardown");
            }
        }
        let free = std::mem::take(&mut state.free);
        state.free_len = 0;
        for (cap, bucket) in free {
            for addr in bucket {
                if let Err(err) = self.allocator.free(addr, cap) {
                    warn!(label = self.label, %err, "failed to free buffer during teardown");
                }
            }
        }
    }
}

/// Host RAM pool.
pub type HostPool = BufferPool<HostAllocator>;

impl HostPool {
    pub fn host(pool_size: usize) -> Self {
        Self::with_allocator("host", pool_size, HostAllocator)
    }
}

/// Adapter that lets a [`BufferPool`] allocate through the active driver's
/// device memory interface.
pub struct DeviceAllocator {
    memory: std::sync::Arc<dyn DeviceMemory>,
}

impl DeviceAllocator {
    pub fn new(memory: std::sync::Arc<dyn DeviceMemory>) -> Self {
        Self { memory }
    }
}

impl RawAllocator for DeviceAllocator {
    fn alloc(&self, len: usize) -> Result<BufAddr> {
        self.memory.alloc(len)
    }

    fn free(&self, addr: BufAddr, len: usize) -> Result<()> {
        self.memory.free(addr, len)
    }

    // Device realloc is free-then-alloc; there is no in-place grow.
}

/// Device VRAM pool.
pub type DevicePool = BufferPool<DeviceAllocator>;

impl DevicePool {
    pub fn device(pool_size: usize, memory: std::sync::Arc<dyn DeviceMemory>) -> Self {
        Self::with_allocator("device", pool_size, DeviceAllocator::new(memory))
    }
}

/// A device buffer checked out of a [`DevicePool`], returned on drop.
///
/// The backref is weak: the buffer relates to its pool, it never keeps it
/// alive. If the pool is already gone, its teardown reclaimed the memory
/// and the drop is a no-op.
pub struct PooledDeviceBuffer {
    addr: BufAddr,
    pool: std::sync::Weak<DevicePool>,
}

impl PooledDeviceBuffer {
    pub fn checkout(pool: &std::sync::Arc<DevicePool>, len: usize) -> Result<Self> {
        let addr = pool.alloc(len)?;
        Ok(Self {
            addr,
            pool: std::sync::Arc::downgrade(pool),
        })
    }

    pub fn addr(&self) -> BufAddr {
        self.addr
    }

    pub fn device_ptr(&self) -> crate::core::driver::DevicePtr {
        crate::core::driver::DevicePtr(self.addr.0)
    }
}

impl Drop for PooledDeviceBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            // An unknown-buffer report here would mean a double return;
            // the pool already logs it.
            let _ = pool.free(self.addr);
        } else {
            debug!(addr = self.addr.0, "device pool gone before buffer return");
        }
    }
}

impl std::fmt::Debug for PooledDeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledDeviceBuffer")
            .field("addr", &format_args!("{:#x}", self.addr.0))
            .finish()
    }
}

/// A host buffer checked out of a [`HostPool`], returned on drop.
pub struct PooledHostBuffer {
    addr: BufAddr,
    pitch: u32,
    pool: std::sync::Weak<HostPool>,
}

impl PooledHostBuffer {
    pub fn checkout(pool: &std::sync::Arc<HostPool>, len: usize, pitch: u32) -> Result<Self> {
        let addr = pool.alloc(len)?;
        Ok(Self {
            addr,
            pitch,
            pool: std::sync::Arc::downgrade(pool),
        })
    }

    pub fn addr(&self) -> BufAddr {
        self.addr
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }
}

impl Drop for PooledHostBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let _ = pool.free(self.addr);
        } else {
            debug!(addr = self.addr.0, "host pool gone before buffer return");
        }
    }
}

impl std::fmt::Debug for PooledHostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHostBuffer")
            .field("addr", &format_args!("{:#x}", self.addr.0))
            .field("pitch", &self.pitch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Host allocator that counts how often the real allocator is hit.
    struct CountingAllocator {
        inner: HostAllocator,
        allocs: Arc<AtomicUsize>,
    }

    impl RawAllocator for CountingAllocator {
        fn alloc(&self, len: usize) -> Result<BufAddr> {
            self.allocs.fetch_add(1, Ordering::Relaxed);
            self.inner.alloc(len)
        }

        fn free(&self, addr: BufAddr, len: usize) -> Result<()> {
            self.inner.free(addr, len)
        }
    }

    fn counting_pool(pool_size: usize) -> (BufferPool<CountingAllocator>, Arc<AtomicUsize>) {
        let allocs = Arc::new(AtomicUsize::new(0));
        let pool = BufferPool::with_allocator(
            "test",
            pool_size,
            CountingAllocator {
                inner: HostAllocator,
                allocs: allocs.clone(),
            },
        );
        (pool, allocs)
    }

    #[test]
    fn steady_state_recycles_without_allocating() {
        let (pool, allocs) = counting_pool(8);
        // Warm up: four buffers of a fixed size.
        let warm: Vec<_> = (0..4).map(|_| pool.alloc(4096).unwrap()).collect();
        for addr in warm {
            pool.free(addr).unwrap();
        }
        let after_warmup = allocs.load(Ordering::Relaxed);
        assert_eq!(after_warmup, 4);

        for _ in 0..100 {
            let a = pool.alloc(4096).unwrap();
            let b = pool.alloc(2048).unwrap(); // smaller fits in a recycled 4096
            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }
        assert_eq!(allocs.load(Ordering::Relaxed), after_warmup);
    }

    #[test]
    fn conservation_under_random_traffic() {
        let (pool, _) = counting_pool(16);
        fastrand::seed(7);
        let mut held: Vec<BufAddr> = Vec::new();
        for _ in 0..2000 {
            if held.is_empty() || (fastrand::bool() && held.len() < 12) {
                held.push(pool.alloc(1024 + fastrand::usize(..8192)).unwrap());
            } else {
                let addr = held.swap_remove(fastrand::usize(..held.len()));
                pool.free(addr).unwrap();
            }
            assert!(pool.free_len() + pool.busy_len() <= pool.pool_size());
            assert_eq!(pool.busy_len(), held.len());
        }
        for addr in held {
            pool.free(addr).unwrap();
        }
        assert_eq!(pool.busy_len(), 0);
    }

    #[test]
    fn unknown_free_is_reported_not_fatal() {
        let (pool, _) = counting_pool(4);
        let err = pool.free(BufAddr(0xDEAD_B000)).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownBuffer(0xDEAD_B000)));
        // The pool still works afterwards.
        let a = pool.alloc(128).unwrap();
        pool.free(a).unwrap();
    }

    #[test]
    fn double_free_is_unknown() {
        let (pool, _) = counting_pool(4);
        let a = pool.alloc(128).unwrap();
        pool.free(a).unwrap();
        assert!(matches!(
            pool.free(a),
            Err(PipelineError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn full_pool_reallocates_largest_free() {
        let (pool, allocs) = counting_pool(2);
        let small = pool.alloc(512).unwrap();
        let big = pool.alloc(8192).unwrap();
        pool.free(big).unwrap();
        // Pool is at its bound and no free buffer fits 16384: the 8192
        // buffer is resized instead of waiting.
        let larger = pool.alloc(16384).unwrap();
        assert_eq!(pool.busy_len(), 2);
        assert_eq!(allocs.load(Ordering::Relaxed), 3);
        pool.free(small).unwrap();
        pool.free(larger).unwrap();
    }

    #[test]
    fn saturated_alloc_waits_for_a_free() {
        let (pool, _) = counting_pool(2);
        let pool = Arc::new(pool);
        let a = pool.alloc(256).unwrap();
        let b = pool.alloc(256).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.alloc(256).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.free(a).unwrap();
        let got = waiter.join().expect("waiter thread");
        assert_eq!(got, a);
        pool.free(b).unwrap();
        pool.free(got).unwrap();
    }

    #[test]
    fn grow_raises_the_bound() {
        let (pool, _) = counting_pool(4);
        assert_eq!(pool.pool_size(), 4);
        pool.grow(4);
        assert_eq!(pool.pool_size(), 16);
        pool.grow(usize::MAX);
        assert_eq!(pool.pool_size(), POOL_MAX);
    }

    #[test]
    fn out_of_range_pool_size_is_clamped() {
        let (pool, _) = counting_pool(0);
        assert_eq!(pool.pool_size(), POOL_MIN);
        let (pool, _) = counting_pool(1 << 20);
        assert_eq!(pool.pool_size(), POOL_MAX);
    }
}
