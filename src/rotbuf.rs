//! Rotational write buffers.
//!
//! A producer-favoring ring: writers reserve space in the current slot
//! and never wait; a consumer rotates the ring to claim a slot, waits
//! for the writers that already reserved in it to finish, and drains it.
//! The slow path is the consumer's, by construction.

use std::collections::VecDeque;
use std::sync::Arc;

use log::trace;
use parking_lot::Condvar;
use parking_lot::Mutex;

/// Ring depth when the caller does not choose one.
const DEFAULT_SLOT_COUNT: usize = 2;
/// Capacity of one vector allocation: 1 MiB.
const VEC_ALLOC_SIZE: usize = 1024 * 1024;
/// Vector counts inside this band are never shrunk.
const VEC_LOW_WATERMARK: usize = 1;
const VEC_HIGH_WATERMARK: usize = 1 << 4;

struct RVec {
    buf: Box<[u8]>,
    used: usize,
}

impl RVec {
    fn new() -> RVec {
        RVec {
            buf: vec![0u8; VEC_ALLOC_SIZE].into_boxed_slice(),
            used: 0,
        }
    }
}

#[derive(Default)]
struct SlotCounters {
    pending: u64,
    completed: u64,
    awaiting: bool,
}

struct SlotVecs {
    vecs: Vec<RVec>,
    /// Index of the vector currently being filled.
    current: usize,
}

/// One ring slot: a growable vector list plus completion counters.
pub(crate) struct RotSlot {
    counters: Mutex<SlotCounters>,
    drained: Condvar,
    vecs: Mutex<SlotVecs>,
}

impl RotSlot {
    fn new() -> Arc<RotSlot> {
        Arc::new(RotSlot {
            counters: Mutex::new(SlotCounters::default()),
            drained: Condvar::new(),
            vecs: Mutex::new(SlotVecs {
                vecs: vec![RVec::new()],
                current: 0,
            }),
        })
    }

    /// Carve `bytes` out of the slot, growing the vector list when the
    /// current vector is exhausted. Runs under the ring lock.
    fn alloc_area(&self, bytes: usize) -> (*mut u8, usize) {
        let mut vecs = self.vecs.lock();
        let need_next =
            vecs.vecs[vecs.current].used + bytes > VEC_ALLOC_SIZE;
        if need_next {
            if vecs.current + 1 == vecs.vecs.len() {
                vecs.vecs.push(RVec::new());
            } else {
                let next = vecs.current + 1;
                vecs.vecs[next].used = 0;
            }
            vecs.current += 1;
        }
        let current = vecs.current;
        let rvec = &mut vecs.vecs[current];
        let offset = rvec.used;
        rvec.used += bytes;
        (unsafe { rvec.buf.as_mut_ptr().add(offset) }, bytes)
    }

    fn note_pending(&self) {
        self.counters.lock().pending += 1;
    }

    fn note_completed(&self) {
        let mut counters = self.counters.lock();
        counters.completed += 1;
        if counters.awaiting && counters.completed == counters.pending {
            self.drained.notify_one();
        }
    }

    fn wait_for_writers(&self) {
        let mut counters = self.counters.lock();
        counters.awaiting = true;
        while counters.completed != counters.pending {
            self.drained.wait(&mut counters);
        }
    }

    /// Geometric decay of the vector list after a drain: counts above
    /// the watermark band lose `total - total * e^-0.2` vectors.
    fn shrink_and_reset(&self) {
        let mut vecs = self.vecs.lock();
        let total = vecs.vecs.len();
        if total < VEC_LOW_WATERMARK || total > VEC_HIGH_WATERMARK {
            let keep =
                ((total as f64) * (-0.2f64).exp()).floor() as usize;
            let keep = keep.max(1);
            vecs.vecs.truncate(keep);
            trace!("rot-buf shrank {total} -> {keep} vectors");
        }
        for rvec in &mut vecs.vecs {
            rvec.used = 0;
        }
        vecs.current = 0;

        let mut counters = self.counters.lock();
        counters.pending = 0;
        counters.completed = 0;
        counters.awaiting = false;
    }
}

/// A reserved, writable span of the current slot. Dropping without
/// [`WriteArea::commit`] still completes the reservation so consumers
/// never hang on a lost writer.
pub struct WriteArea {
    slot: Arc<RotSlot>,
    ptr: *mut u8,
    len: usize,
    committed: bool,
}

// Reserved areas are disjoint; the pointer aliases no other area.
unsafe impl Send for WriteArea {}

impl WriteArea {
    /// The writable span.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Mark the write finished, letting a waiting consumer proceed.
    pub fn commit(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if !self.committed {
            self.committed = true;
            self.slot.note_completed();
        }
    }
}

impl Drop for WriteArea {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for WriteArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteArea").field("len", &self.len).finish()
    }
}

/// Result of a consumer's attempt to claim a slot.
#[derive(Debug)]
pub enum Pull {
    /// Nothing was written since the last drain.
    Empty,
    /// Only one slot remains in rotation; removing it would starve
    /// writers.
    WouldStarve,
    /// The caller owns this slot until it consumes it.
    Claimed(ClaimedSlot),
}

/// A slot removed from rotation, owned by one consumer.
pub struct ClaimedSlot {
    ring: Arc<RingInner>,
    slot: Arc<RotSlot>,
    seq: u64,
}

impl ClaimedSlot {
    /// Rotation sequence number of this batch.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for in-flight writers, hand the filled spans to `dispatch`,
    /// then shrink and return the slot to rotation.
    pub fn consume<F: FnOnce(&[&[u8]])>(self, dispatch: F) {
        self.slot.wait_for_writers();
        {
            let vecs = self.slot.vecs.lock();
            let spans: Vec<&[u8]> = vecs
                .vecs
                .iter()
                .take(vecs.current + 1)
                .map(|rvec| &rvec.buf[..rvec.used])
                .collect();
            dispatch(&spans);
        }
        self.slot.shrink_and_reset();
        self.ring.lock.lock().freelist.push_back(self.slot.clone());
    }
}

impl std::fmt::Debug for ClaimedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimedSlot").field("seq", &self.seq).finish()
    }
}

struct Rotation {
    freelist: VecDeque<Arc<RotSlot>>,
    current: Arc<RotSlot>,
    next_seq: u64,
}

struct RingInner {
    lock: Mutex<Rotation>,
}

/// The rotational buffer ring.
pub struct RotBuf {
    inner: Arc<RingInner>,
}

impl RotBuf {
    /// A ring of `count` slots (0 selects the default of two).
    pub fn new(count: usize) -> RotBuf {
        let count = if count == 0 { DEFAULT_SLOT_COUNT } else { count };
        let freelist: VecDeque<Arc<RotSlot>> =
            (0..count).map(|_| RotSlot::new()).collect();
        // current stays in the freelist; pull() refuses to rotate the
        // last one away (the starvation check)
        let current = freelist
            .front()
            .cloned()
            .unwrap_or_else(RotSlot::new);
        RotBuf {
            inner: Arc::new(RingInner {
                lock: Mutex::new(Rotation {
                    freelist,
                    current,
                    next_seq: 1,
                }),
            }),
        }
    }

    /// Reserve `bytes` of the current slot. Fails only on a zero or
    /// oversized request; writers never block here.
    pub fn reserve(&self, bytes: usize) -> Option<WriteArea> {
        if bytes == 0 || bytes > VEC_ALLOC_SIZE {
            return None;
        }
        let rotation = self.inner.lock.lock();
        let slot = rotation.current.clone();
        let (ptr, len) = slot.alloc_area(bytes);
        slot.note_pending();
        drop(rotation);
        Some(WriteArea {
            slot,
            ptr,
            len,
            committed: false,
        })
    }

    /// Try to rotate the ring and claim the written slot.
    pub fn pull(&self) -> Pull {
        let mut rotation = self.inner.lock.lock();
        if rotation.current.counters.lock().pending == 0 {
            return Pull::Empty;
        }
        if rotation.freelist.len() <= 1 {
            // removal would leave writers with nowhere to go
            return Pull::WouldStarve;
        }
        let claimed = rotation.current.clone();
        if let Some(pos) = rotation
            .freelist
            .iter()
            .position(|s| Arc::ptr_eq(s, &claimed))
        {
            rotation.freelist.remove(pos);
        }
        let next = match rotation.freelist.front() {
            Some(slot) => slot.clone(),
            None => RotSlot::new(),
        };
        rotation.current = next;
        let seq = rotation.next_seq;
        rotation.next_seq += 1;
        Pull::Claimed(ClaimedSlot {
            ring: self.inner.clone(),
            slot: claimed,
            seq,
        })
    }
}

impl std::fmt::Debug for RotBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotBuf").finish()
    }
}
