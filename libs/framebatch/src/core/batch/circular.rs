// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Many-producer circular batcher.
//!
//! A slot array of `batch_size * batch_count` elements with a write cursor
//! `w` and a draining-batch cursor `b`. The moment `w` leaves the slice
//! `[b*S, (b+1)*S)` that slice is closed: its elements move into a reusable
//! staging vector and `b` advances, making the slice writable again.
//!
//! Two mutexes split the fast path from the slow one: the ring mutex covers
//! cursor movement and is never held across the user callback; the staging
//! mutex is held from closure through emission, which both serializes
//! batches in closure order and reuses one allocation for every emission.

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::core::{PipelineError, Result};

/// Batch consumer. Receives owning elements; whatever it leaves in the
/// vector is dropped when the call returns, so it must move elements out to
/// retain them.
pub type BatchCallback<T> = Box<dyn Fn(&mut Vec<T>) + Send + Sync>;

struct Ring<T> {
    slots: Vec<Option<T>>,
    /// Next write slot.
    w: usize,
    /// Index of the batch currently being filled/drained.
    b: usize,
}

/// See the module docs.
pub struct CircularBatch<T> {
    batch_size: usize,
    batch_count: usize,
    ring: Mutex<Ring<T>>,
    staging: Mutex<Vec<T>>,
    callback: BatchCallback<T>,
}

impl<T: Send> CircularBatch<T> {
    pub fn new(batch_size: usize, batch_count: usize, callback: BatchCallback<T>) -> Result<Self> {
        if batch_size == 0 || batch_count == 0 {
            return Err(PipelineError::Configuration(
                "batch size and batch count must be non-zero".into(),
            ));
        }
        let capacity = batch_size * batch_count;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            batch_size,
            batch_count,
            ring: Mutex::new(Ring { slots, w: 0, b: 0 }),
            staging: Mutex::new(Vec::with_capacity(batch_size)),
            callback,
        })
    }

    pub fn capacity(&self) -> usize {
        self.batch_size * self.batch_count
    }

    /// Elements pushed but not yet emitted.
    pub fn pending(&self) -> usize {
        let ring = self.ring.lock();
        let start = ring.b * self.batch_size;
        (ring.w + self.capacity() - start) % self.capacity()
    }

    /// Write one element.
    ///
    /// Returns the closed batch when this write completed a slice; the
    /// caller emits it (by dropping the guard or calling
    /// [`ClosedBatch::emit`]) outside the ring lock.
    #[must_use = "a closed batch must be emitted"]
    pub fn push(&self, item: T) -> Option<ClosedBatch<'_, T>> {
        let mut ring = self.ring.lock();
        let w = ring.w;
        ring.slots[w] = Some(item);
        ring.w = (w + 1) % self.capacity();

        let slice_end = (ring.b * self.batch_size + self.batch_size) % self.capacity();
        if ring.w != slice_end {
            return None;
        }
        // Slice closed: move it into staging and advance the batch cursor
        // while still under the ring lock, then emit without it.
        let staging = self.close_slice(&mut ring, self.batch_size);
        drop(ring);
        Some(ClosedBatch {
            staging,
            callback: &self.callback,
        })
    }

    /// Emit the partially filled slice, if any. Used by the flush timer so
    /// a trickle of input is not held back indefinitely.
    ///
    /// Returns the emitted element count, `0..=batch_size`.
    pub fn flush(&self) -> usize {
        let mut ring = self.ring.lock();
        let start = ring.b * self.batch_size;
        let filled = (ring.w + self.capacity() - start) % self.capacity();
        debug_assert!(filled < self.batch_size, "closed slice left in ring");
        if filled == 0 {
            return 0;
        }
        let mut staging = self.close_slice(&mut ring, filled);
        // The write cursor jumps to the next slice boundary.
        ring.w = ring.b * self.batch_size;
        drop(ring);

        let emitted = staging.len();
        trace!(emitted, "flushing partial batch");
        (self.callback)(&mut staging);
        staging.clear();
        emitted
    }

    /// Move `len` elements of the current slice into staging and advance
    /// `b`. Caller holds the ring lock; the returned staging guard is held
    /// through emission so batches leave in closure order.
    fn close_slice<'a>(&'a self, ring: &mut Ring<T>, len: usize) -> MutexGuard<'a, Vec<T>> {
        let mut staging = self.staging.lock();
        debug_assert!(staging.is_empty(), "previous batch was not emitted");
        let start = ring.b * self.batch_size;
        for slot in &mut ring.slots[start..start + len] {
            if let Some(item) = slot.take() {
                staging.push(item);
            } else {
                debug_assert!(false, "closed slot was empty");
            }
        }
        ring.b = (ring.b + 1) % self.batch_count;
        staging
    }
}

/// A closed batch on its way to the consumer. Dropping it invokes the
/// callback with the batch content (so it cannot be lost) and recycles the
/// staging storage.
pub struct ClosedBatch<'a, T> {
    staging: MutexGuard<'a, Vec<T>>,
    callback: &'a BatchCallback<T>,
}

impl<T> ClosedBatch<'_, T> {
    pub fn len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staging.is_empty()
    }

    /// Run the consumer callback now.
    pub fn emit(self) {
        drop(self);
    }
}

impl<T> Drop for ClosedBatch<'_, T> {
    fn drop(&mut self) {
        if !self.staging.is_empty() {
            (self.callback)(&mut self.staging);
            self.staging.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    fn collecting() -> (Arc<StdMutex<Vec<Vec<u32>>>>, BatchCallback<u32>) {
        let batches: Arc<StdMutex<Vec<Vec<u32>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = batches.clone();
        let callback: BatchCallback<u32> = Box::new(move |batch| {
            sink.lock().unwrap().push(batch.drain(..).collect());
        });
        (batches, callback)
    }

    #[test]
    fn emits_full_batches_in_push_order() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(4, 3, callback).unwrap();
        for i in 0..12u32 {
            if let Some(closed) = ring.push(i) {
                assert_eq!(closed.len(), 4);
                closed.emit();
            }
        }
        let got = batches.lock().unwrap();
        assert_eq!(*got, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9, 10, 11]]);
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn wraps_around_the_ring() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(2, 2, callback).unwrap();
        for i in 0..20u32 {
            if let Some(closed) = ring.push(i) {
                closed.emit();
            }
        }
        let got = batches.lock().unwrap();
        assert_eq!(got.len(), 10);
        assert!(got.iter().all(|b| b.len() == 2));
        assert_eq!(got[9], vec![18, 19]);
    }

    #[test]
    fn flush_emits_partial_slice_once() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(8, 4, callback).unwrap();
        for i in 0..3u32 {
            assert!(ring.push(i).is_none());
        }
        assert_eq!(ring.pending(), 3);
        assert_eq!(ring.flush(), 3);
        assert_eq!(ring.flush(), 0, "nothing left after the partial flush");
        assert_eq!(ring.pending(), 0);

        // Pushes after a flush land in the next slice.
        for i in 10..18u32 {
            if let Some(closed) = ring.push(i) {
                closed.emit();
            }
        }
        let got = batches.lock().unwrap();
        assert_eq!(*got, vec![vec![0, 1, 2], (10..18).collect::<Vec<_>>()]);
    }

    #[test]
    fn flush_on_empty_slice_is_a_no_op() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(4, 2, callback).unwrap();
        assert_eq!(ring.flush(), 0);
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn dropping_a_closed_batch_still_delivers_it() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(2, 2, callback).unwrap();
        let _ = ring.push(1);
        let closed = ring.push(2).expect("batch closed");
        drop(closed); // no explicit emit
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn single_slice_ring_closes_every_batch() {
        let (batches, callback) = collecting();
        let ring = CircularBatch::new(1, 1, callback).unwrap();
        for i in 0..5u32 {
            ring.push(i).expect("every push closes").emit();
        }
        assert_eq!(batches.lock().unwrap().len(), 5);
    }

    #[test]
    fn outstanding_elements_never_exceed_capacity() {
        let (_batches, callback) = collecting();
        let ring = CircularBatch::new(3, 4, callback).unwrap();
        fastrand::seed(11);
        for i in 0..500u32 {
            if fastrand::u8(..4) == 0 {
                ring.flush();
            } else if let Some(closed) = ring.push(i) {
                closed.emit();
            }
            assert!(ring.pending() <= ring.capacity());
            assert!(ring.pending() < ring.batch_size, "slice never stays closed");
        }
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let (batches, callback) = collecting();
        let ring = Arc::new(CircularBatch::new(4, 4, callback).unwrap());
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u32 {
                    if let Some(closed) = ring.push(t * 1000 + i) {
                        closed.emit();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        ring.flush();
        let got = batches.lock().unwrap();
        let mut all: Vec<u32> = got.iter().flatten().copied().collect();
        assert_eq!(all.len(), 400);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400, "no element lost or duplicated");
        // Per-producer order survives batching.
        let mut per_producer: std::collections::HashMap<u32, Vec<u32>> = Default::default();
        for v in got.iter().flatten() {
            per_producer.entry(v / 1000).or_default().push(v % 1000);
        }
        for (_, seq) in per_producer {
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
