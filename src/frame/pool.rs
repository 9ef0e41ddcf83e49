// SPDX-License-Identifier: GPL-3.0-only

//! Latest-wins frame buffer pool
//!
//! A fixed set of slots handed back and forth between one producer (the
//! sensor) and one consumer (the capture thread). A slot's buffer is moved
//! out of the pool while it is being written or read, so a buffer is never
//! reachable from both sides at once.
//!
//! The producer never waits: when no slot is free it reclaims the oldest
//! undelivered frame. Committing a frame discards any older undelivered one,
//! so the consumer always sees the newest frame.

use crate::backends::camera::{FramePlanes, FrameView, PlaneLayout};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    Free,
    Writing,
    Ready(u64),
    Reading,
}

struct Slot {
    status: SlotStatus,
    buffer: Option<FramePlanes>,
}

struct PoolState {
    slots: Vec<Slot>,
    next_sequence: u64,
    closed: bool,
    released: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    frame_ready: Condvar,
    committed: AtomicU64,
    dropped: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put a checked-out buffer back into its slot as free
    fn return_slot(&self, index: usize, buffer: FramePlanes) {
        let mut state = self.lock();
        let released = state.released;
        let slot = &mut state.slots[index];
        slot.status = SlotStatus::Free;
        slot.buffer = if released { None } else { Some(buffer) };
    }
}

/// Frame counters for a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames the producer committed
    pub committed: u64,
    /// Frames discarded before the consumer saw them
    pub dropped: u64,
}

/// Consumer side of the pool
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    pub fn new(size: usize) -> Self {
        let slots = (0..size.max(2))
            .map(|_| Slot {
                status: SlotStatus::Free,
                buffer: Some(FramePlanes::default()),
            })
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    slots,
                    next_sequence: 0,
                    closed: false,
                    released: false,
                }),
                frame_ready: Condvar::new(),
                committed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Handle for the hardware side
    pub fn producer(&self) -> FrameProducer {
        FrameProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take the newest committed frame, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout or once the pool is closed.
    pub fn acquire_latest(&self, timeout: Duration) -> Option<FrameReadGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return None;
            }

            let newest = state
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| match slot.status {
                    SlotStatus::Ready(seq) => Some((i, seq)),
                    _ => None,
                })
                .max_by_key(|(_, seq)| *seq);

            if let Some((index, _)) = newest {
                let slot = &mut state.slots[index];
                if let Some(buffer) = slot.buffer.take() {
                    slot.status = SlotStatus::Reading;
                    return Some(FrameReadGuard {
                        shared: Arc::clone(&self.shared),
                        index,
                        buffer: Some(buffer),
                    });
                }
                // Buffer already released; nothing left to deliver
                slot.status = SlotStatus::Free;
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .frame_ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Stop accepting and delivering frames; wakes a waiting consumer.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        drop(state);
        self.shared.frame_ready.notify_all();
    }

    /// Free all slot memory. Buffers still checked out are freed when their
    /// guard drops.
    pub fn release_buffers(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        state.released = true;
        let mut freed = 0usize;
        for slot in state.slots.iter_mut() {
            if matches!(slot.status, SlotStatus::Free | SlotStatus::Ready(_)) {
                slot.status = SlotStatus::Free;
                if slot.buffer.take().is_some() {
                    freed += 1;
                }
            }
        }
        drop(state);
        self.shared.frame_ready.notify_all();
        debug!(freed, "Frame pool buffers released");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            committed: self.shared.committed.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the pool, handed to the hardware as an output target
#[derive(Clone)]
pub struct FrameProducer {
    shared: Arc<PoolShared>,
}

impl FrameProducer {
    /// Claim a slot to write the next frame into.
    ///
    /// Never blocks. Reclaims the oldest undelivered frame when no slot is
    /// free, and returns `None` only when the pool is closed or every slot is
    /// checked out.
    pub fn begin_frame(&self, layout: PlaneLayout) -> Option<FrameWriteGuard> {
        let mut state = self.shared.lock();
        if state.closed {
            return None;
        }

        let index = match state
            .slots
            .iter()
            .position(|slot| slot.status == SlotStatus::Free)
        {
            Some(index) => index,
            None => {
                let oldest = state
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| match slot.status {
                        SlotStatus::Ready(seq) => Some((i, seq)),
                        _ => None,
                    })
                    .min_by_key(|(_, seq)| *seq);
                match oldest {
                    Some((index, _)) => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        index
                    }
                    None => {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                }
            }
        };

        let slot = &mut state.slots[index];
        slot.status = SlotStatus::Writing;
        let mut buffer = slot.buffer.take().unwrap_or_default();
        drop(state);

        buffer.y.resize(layout.y_len(), 0);
        buffer.u.resize(layout.uv_len(), 0);
        buffer.v.resize(layout.uv_len(), 0);
        buffer.layout = Some(layout);

        Some(FrameWriteGuard {
            shared: Arc::clone(&self.shared),
            index,
            buffer: Some(buffer),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// A slot checked out for writing; dropping it without `commit` discards the frame
pub struct FrameWriteGuard {
    shared: Arc<PoolShared>,
    index: usize,
    buffer: Option<FramePlanes>,
}

impl FrameWriteGuard {
    /// Publish the frame as the newest one, discarding any older undelivered frame.
    pub fn commit(mut self, timestamp_ns: i64) {
        let Some(mut buffer) = self.buffer.take() else {
            return;
        };

        let mut state = self.shared.lock();
        if state.closed {
            let released = state.released;
            let slot = &mut state.slots[self.index];
            slot.status = SlotStatus::Free;
            slot.buffer = if released { None } else { Some(buffer) };
            return;
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        buffer.timestamp_ns = timestamp_ns;
        buffer.sequence = sequence;

        for (i, slot) in state.slots.iter_mut().enumerate() {
            if i != self.index && matches!(slot.status, SlotStatus::Ready(_)) {
                slot.status = SlotStatus::Free;
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let slot = &mut state.slots[self.index];
        slot.status = SlotStatus::Ready(sequence);
        slot.buffer = Some(buffer);
        drop(state);

        self.shared.committed.fetch_add(1, Ordering::Relaxed);
        self.shared.frame_ready.notify_one();
    }
}

impl Deref for FrameWriteGuard {
    type Target = FramePlanes;

    fn deref(&self) -> &FramePlanes {
        // Only `commit` takes the buffer, and it consumes the guard
        self.buffer.as_ref().unwrap_or(&EMPTY_PLANES)
    }
}

impl DerefMut for FrameWriteGuard {
    fn deref_mut(&mut self) -> &mut FramePlanes {
        self.buffer.get_or_insert_with(FramePlanes::default)
    }
}

impl Drop for FrameWriteGuard {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.shared.return_slot(self.index, buffer);
        }
    }
}

static EMPTY_PLANES: FramePlanes = FramePlanes {
    y: Vec::new(),
    u: Vec::new(),
    v: Vec::new(),
    layout: None,
    timestamp_ns: 0,
    sequence: 0,
};

/// A frame checked out for reading; returned to the pool on drop
pub struct FrameReadGuard {
    shared: Arc<PoolShared>,
    index: usize,
    buffer: Option<FramePlanes>,
}

impl FrameReadGuard {
    pub fn view(&self) -> Option<FrameView<'_>> {
        self.buffer.as_ref().and_then(FramePlanes::view)
    }

    pub fn timestamp_ns(&self) -> i64 {
        self.buffer.as_ref().map(|b| b.timestamp_ns).unwrap_or_default()
    }
}

impl Drop for FrameReadGuard {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.shared.return_slot(self.index, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::Resolution;

    fn layout() -> PlaneLayout {
        PlaneLayout::semi_planar(Resolution::new(16, 8))
    }

    fn write_frame(producer: &FrameProducer, ts: i64) {
        let mut guard = producer.begin_frame(layout()).expect("slot available");
        guard.y[0] = (ts & 0xff) as u8;
        guard.commit(ts);
    }

    #[test]
    fn test_latest_wins_without_consumer() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        // Producer must never block even though nobody reads
        for ts in 1..=100 {
            write_frame(&producer, ts);
        }

        let frame = pool.acquire_latest(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.timestamp_ns(), 100);
        assert_eq!(frame.view().unwrap().y[0], 100);

        let stats = pool.stats();
        assert_eq!(stats.committed, 100);
        assert_eq!(stats.dropped, 99);
    }

    #[test]
    fn test_reader_and_writer_never_share_a_slot() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        write_frame(&producer, 1);
        let reading = pool.acquire_latest(Duration::from_millis(10)).unwrap();

        // With one slot out for reading, the producer keeps cycling the other two
        for ts in 2..=10 {
            write_frame(&producer, ts);
        }
        assert_eq!(reading.timestamp_ns(), 1);
        drop(reading);

        let next = pool.acquire_latest(Duration::from_millis(10)).unwrap();
        assert_eq!(next.timestamp_ns(), 10);
    }

    #[test]
    fn test_uncommitted_write_is_discarded() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        let guard = producer.begin_frame(layout()).unwrap();
        drop(guard);

        assert!(pool.acquire_latest(Duration::from_millis(5)).is_none());
        assert_eq!(pool.stats().committed, 0);
    }

    #[test]
    fn test_sequences_increase() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        let mut last = None;
        for ts in [10, 20, 30] {
            write_frame(&producer, ts);
            let frame = pool.acquire_latest(Duration::from_millis(10)).unwrap();
            let seq = frame.view().unwrap().sequence;
            if let Some(prev) = last {
                assert!(seq > prev);
            }
            last = Some(seq);
        }
    }

    #[test]
    fn test_close_wakes_consumer_and_rejects_producer() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_latest(Duration::from_secs(5)).is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        pool.close();

        assert!(waiter.join().unwrap());
        assert!(producer.begin_frame(layout()).is_none());
    }

    #[test]
    fn test_release_buffers_frees_checked_out_slots_on_return() {
        let pool = FramePool::new(3);
        let producer = pool.producer();

        write_frame(&producer, 1);
        let reading = pool.acquire_latest(Duration::from_millis(10)).unwrap();
        pool.release_buffers();
        drop(reading);

        let state = pool.shared.lock();
        assert!(state.slots.iter().all(|s| s.buffer.is_none()));
        assert!(state.slots.iter().all(|s| s.status == SlotStatus::Free));
    }
}
