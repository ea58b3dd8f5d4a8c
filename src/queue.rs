//! C3: the virtqueue engine.
//!
//! Owns one split ring: drains avail, walks chains via [`crate::chain`],
//! hands buffer vectors to a caller-supplied callback, and publishes
//! completions to the used ring while keeping the inflight region (C4)
//! in lockstep. Control flow (drain-avail-then-dispatch, ring index
//! bookkeeping) follows the `virtio-queue` crate's `Queue`/`QueueState`
//! shape; the "never silently truncate a bad chain" policy is this
//! crate's own, spelled out in `chain.rs`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{fence, Ordering};

use vm_memory::Le16;

use crate::chain::walk_chain;
use crate::descriptor::VirtqUsedElem;
use crate::inflight::{InflightRegion, ReplayEntry};
use crate::mem::{GuestMemoryManager, PinnedMemory};

/// One buffer segment resolved from a descriptor: a host pointer, its
/// length, and whether the device may write into it.
#[derive(Copy, Clone, Debug)]
pub struct IoBuffer {
    pub ptr: *mut u8,
    pub len: u32,
    pub write_only: bool,
}

// Safety: see `mem::HostPtr`. The pointer is only valid while the
// `PinnedMemory` snapshot it was translated from is kept alive, which
// `BufferVector` does by carrying that snapshot alongside the buffers.
unsafe impl Send for IoBuffer {}

/// An ordered buffer vector (read-only buffers first, then write-only,
/// per the virtio ordering rule) together with the pinned guest-memory
/// snapshot its pointers were translated from. Holding this snapshot is
/// what keeps the snapshot's `Arc` above zero, and therefore the
/// mapping behind every `IoBuffer::ptr` valid, for as long as the
/// request carrying this buffer vector is outstanding: a memory-table
/// update swaps in a new table immediately but the old one is only
/// actually unmapped once the last snapshot referencing it (this one
/// included) drops, which happens at `commit`.
pub struct BufferVector {
    buffers: Vec<IoBuffer>,
    pinned: PinnedMemory,
}

impl BufferVector {
    pub(crate) fn new(buffers: Vec<IoBuffer>, pinned: PinnedMemory) -> Self {
        BufferVector { buffers, pinned }
    }

    /// The guest-memory snapshot these buffers were translated from.
    /// Exposed so a backend that needs to re-pin (e.g. to translate a
    /// header separately) can share the exact same table the engine saw.
    pub fn pinned_memory(&self) -> &PinnedMemory {
        &self.pinned
    }
}

impl std::ops::Deref for BufferVector {
    type Target = [IoBuffer];

    fn deref(&self) -> &[IoBuffer] {
        &self.buffers
    }
}

impl<'a> IntoIterator for &'a BufferVector {
    type Item = &'a IoBuffer;
    type IntoIter = std::slice::Iter<'a, IoBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}

impl fmt::Debug for BufferVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferVector")
            .field("buffers", &self.buffers)
            .finish()
    }
}

/// Lifecycle state of a [`Queue`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Draining,
    Broken,
    Released,
}

/// What a `dequeue_many` invariant violation was.
#[derive(Debug)]
pub enum QueueError {
    DescriptorOutOfBounds { index: u16, qsz: u16 },
    ChainLoop { head: u16 },
    ChainTooLong { head: u16 },
    IndirectWithNext { head: u16 },
    MisalignedIndirectTable { head: u16 },
    NestedIndirect { head: u16 },
    OrderViolation { head: u16 },
    TranslationFailure { gpa: u64 },
    InvalidRingBase,
    Broken,
    NotAttached,
    Inflight(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::DescriptorOutOfBounds { index, qsz } => {
                write!(f, "descriptor index {} is out of bounds (qsz={})", index, qsz)
            }
            QueueError::ChainLoop { head } => write!(f, "descriptor chain at head {} loops", head),
            QueueError::ChainTooLong { head } => {
                write!(f, "descriptor chain at head {} exceeds queue size", head)
            }
            QueueError::IndirectWithNext { head } => {
                write!(f, "descriptor at head {} sets both INDIRECT and NEXT", head)
            }
            QueueError::MisalignedIndirectTable { head } => write!(
                f,
                "indirect table referenced by head {} has a misaligned or zero length",
                head
            ),
            QueueError::NestedIndirect { head } => {
                write!(f, "indirect table referenced by head {} nests another indirect table", head)
            }
            QueueError::OrderViolation { head } => write!(
                f,
                "chain at head {} has a read-only buffer after a write-only one",
                head
            ),
            QueueError::TranslationFailure { gpa } => {
                write!(f, "failed to translate guest address {:#x}", gpa)
            }
            QueueError::InvalidRingBase => write!(f, "ring base address is not mapped"),
            QueueError::Broken => write!(f, "queue is broken"),
            QueueError::NotAttached => write!(f, "queue is not attached to any rings"),
            QueueError::Inflight(msg) => write!(f, "inflight region error: {}", msg),
        }
    }
}

impl std::error::Error for QueueError {}

/// What the dequeue callback wants to happen next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep draining the avail ring.
    Continue,
    /// Stop after this head; not an error.
    Stop,
}

/// Result of a `dequeue_many` pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// Avail ring fully drained (no replay pending, no new entries left).
    Drained,
    /// The callback asked to stop.
    Stopped,
}

/// One split virtqueue.
pub struct Queue {
    mem: GuestMemoryManager,
    qsz: u16,
    desc_table_gpa: u64,
    avail_gpa: u64,
    used_gpa: u64,
    last_avail: u16,
    state: QueueState,
    inflight: Option<InflightRegion>,
    replay_queue: VecDeque<ReplayEntry>,
    in_flight: usize,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("qsz", &self.qsz)
            .field("last_avail", &self.last_avail)
            .field("state", &self.state)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Queue {
    /// Creates an unattached queue bound to `mem`. Call [`attach`](Self::attach)
    /// before draining it.
    pub fn new(mem: GuestMemoryManager) -> Self {
        Queue {
            mem,
            qsz: 0,
            desc_table_gpa: 0,
            avail_gpa: 0,
            used_gpa: 0,
            last_avail: 0,
            state: QueueState::Released,
            inflight: None,
            replay_queue: VecDeque::new(),
            in_flight: 0,
        }
    }

    /// Binds the queue to a set of ring addresses, validates them, and
    /// reattaches the inflight region (repairing any crash-in-commit
    /// drift and queuing outstanding heads for replay in counter order).
    pub fn attach(
        &mut self,
        desc_table_gpa: u64,
        avail_gpa: u64,
        used_gpa: u64,
        qsz: u16,
        inflight: Option<InflightRegion>,
    ) -> Result<(), QueueError> {
        let pinned = self.mem.pin();
        if !pinned.is_mapped(desc_table_gpa) || !pinned.is_mapped(avail_gpa) || !pinned.is_mapped(used_gpa) {
            return Err(QueueError::InvalidRingBase);
        }

        self.desc_table_gpa = desc_table_gpa;
        self.avail_gpa = avail_gpa;
        self.used_gpa = used_gpa;
        self.qsz = qsz;
        self.state = QueueState::Idle;

        let used_idx = self.read_used_idx(&pinned);

        self.replay_queue.clear();
        if let Some(mut region) = inflight {
            let last_committed_head = if used_idx > 0 {
                self.read_used_entry_id(&pinned, used_idx.wrapping_sub(1))
            } else {
                0
            };
            let repair = region
                .reattach(used_idx, last_committed_head)
                .map_err(|e| QueueError::Inflight(e.to_string()))?;
            self.replay_queue = repair.into_iter().collect();
            self.inflight = Some(region);
        } else {
            self.inflight = None;
        }

        self.last_avail = used_idx;

        Ok(())
    }

    /// Drains the replay queue (if any) then the avail ring, calling
    /// `callback(head, iov)` for each chain. Returns as soon as the
    /// callback asks to stop, the queue is exhausted, or a protocol
    /// violation is found; in the latter case the queue is marked
    /// broken and the callback is never invoked for the offending head.
    pub fn dequeue_many<F>(&mut self, mut callback: F) -> Result<DequeueOutcome, QueueError>
    where
        F: FnMut(u16, BufferVector) -> CallbackAction,
    {
        if self.state == QueueState::Broken {
            return Err(QueueError::Broken);
        }
        if self.state == QueueState::Released {
            return Err(QueueError::NotAttached);
        }

        while let Some(replay) = self.replay_queue.pop_front() {
            let iov = self.walk(replay.head).map_err(|e| self.mark_broken(e))?;
            self.record_inflight(replay.head, Some(replay.counter))?;
            self.in_flight += 1;
            // the avail slot this head originally came from was counted
            // once already (in the crashed session); account for it now
            // so new avail consumption resumes exactly where that
            // session actually left off, not at `used.idx`.
            self.last_avail = self.last_avail.wrapping_add(1);
            if callback(replay.head, iov) == CallbackAction::Stop {
                return Ok(DequeueOutcome::Stopped);
            }
        }

        loop {
            fence(Ordering::Acquire);
            let pinned = self.mem.pin();
            let avail_idx = self.read_avail_idx(&pinned);
            if avail_idx == self.last_avail {
                return Ok(DequeueOutcome::Drained);
            }

            let head = self.read_avail_entry(&pinned, self.last_avail);
            if head >= self.qsz {
                return Err(self.mark_broken(QueueError::DescriptorOutOfBounds { index: head, qsz: self.qsz }));
            }
            drop(pinned);

            self.record_inflight(head, None)?;
            let iov = match self.walk(head) {
                Ok(iov) => iov,
                Err(e) => return Err(self.mark_broken(e)),
            };
            self.in_flight += 1;
            self.last_avail = self.last_avail.wrapping_add(1);

            if callback(head, iov) == CallbackAction::Stop {
                return Ok(DequeueOutcome::Stopped);
            }
        }
    }

    /// Publishes completion of `head` with `len` bytes written, then
    /// updates the inflight region in the order the crash-recovery
    /// protocol requires: used ring entry, used.idx, inflight.used_idx,
    /// clear the inflight bit.
    pub fn commit(&mut self, head: u16, len: u32) -> Result<(), QueueError> {
        if self.state == QueueState::Broken {
            return Err(QueueError::Broken);
        }
        let pinned = self.mem.pin();
        let used_idx = self.read_used_idx(&pinned);
        self.write_used_entry(&pinned, used_idx, head, len);
        let new_used_idx = used_idx.wrapping_add(1);
        fence(Ordering::Release);
        self.write_used_idx(&pinned, new_used_idx);

        if let Some(region) = self.inflight.as_mut() {
            region
                .mark_committed(new_used_idx, head)
                .map_err(|e| QueueError::Inflight(e.to_string()))?;
        }

        self.in_flight = self.in_flight.saturating_sub(1);
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.state == QueueState::Broken
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }

    /// Disconnects from the rings. Callers must ensure `in_flight_count()
    /// == 0` first (or accept that any still-inflight heads will be
    /// recovered on the next attach via the inflight region).
    pub fn release(&mut self) {
        self.state = QueueState::Released;
        self.inflight = None;
        self.replay_queue.clear();
    }

    fn mark_broken(&mut self, e: QueueError) -> QueueError {
        self.state = QueueState::Broken;
        e
    }

    fn walk(&self, head: u16) -> Result<BufferVector, QueueError> {
        let pinned = self.mem.pin();
        walk_chain(&pinned, self.desc_table_gpa, self.qsz, head)
    }

    fn record_inflight(&mut self, head: u16, counter: Option<u64>) -> Result<(), QueueError> {
        if let Some(region) = self.inflight.as_mut() {
            region
                .record(head, counter)
                .map_err(|e| QueueError::Inflight(e.to_string()))?;
        }
        Ok(())
    }

    fn read_avail_idx(&self, mem: &crate::mem::PinnedMemory) -> u16 {
        let v: Le16 = mem.read_obj(self.avail_gpa + 2).unwrap_or_default();
        v.into()
    }

    fn read_avail_entry(&self, mem: &crate::mem::PinnedMemory, slot: u16) -> u16 {
        let offset = self.avail_gpa + 4 + 2 * (slot as u64 % self.qsz as u64);
        let v: Le16 = mem.read_obj(offset).unwrap_or_default();
        v.into()
    }

    fn read_used_idx(&self, mem: &crate::mem::PinnedMemory) -> u16 {
        let v: Le16 = mem.read_obj(self.used_gpa + 2).unwrap_or_default();
        v.into()
    }

    fn read_used_entry_id(&self, mem: &crate::mem::PinnedMemory, slot: u16) -> u16 {
        let offset = self.used_gpa + 4 + 8 * (slot as u64 % self.qsz as u64);
        let elem: VirtqUsedElem = mem.read_obj(offset).unwrap_or_default();
        elem.id() as u16
    }

    fn write_used_idx(&self, mem: &crate::mem::PinnedMemory, idx: u16) {
        let _ = mem.write_obj(Le16::from(idx), self.used_gpa + 2);
    }

    fn write_used_entry(&self, mem: &crate::mem::PinnedMemory, slot: u16, head: u16, len: u32) {
        let offset = self.used_gpa + 4 + 8 * (slot as u64 % self.qsz as u64);
        let elem = VirtqUsedElem::new(head as u32, len);
        let _ = mem.write_obj(elem, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, DescriptorFlags};
    use vm_memory::{GuestAddress, GuestMemoryMmap};

    const DESC_TABLE: u64 = 0x1000;
    const AVAIL: u64 = 0x2000;
    const USED: u64 = 0x3000;

    fn new_queue(qsz: u16) -> Queue {
        let mem = GuestMemoryManager::new(
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap(),
        );
        let mut q = Queue::new(mem);
        q.attach(DESC_TABLE, AVAIL, USED, qsz, None).unwrap();
        q
    }

    fn push_avail(q: &Queue, slot: u16, head: u16, qsz: u16) {
        let pinned = q.mem.pin();
        let offset = AVAIL + 4 + 2 * (slot as u64 % qsz as u64);
        pinned.write_obj(Le16::from(head), offset).unwrap();
        pinned.write_obj(Le16::from(slot.wrapping_add(1)), AVAIL + 2).unwrap();
    }

    #[test]
    fn drain_empty_queue_returns_drained() {
        let mut q = new_queue(8);
        let outcome = q.dequeue_many(|_, _| CallbackAction::Continue).unwrap();
        assert_eq!(outcome, DequeueOutcome::Drained);
    }

    #[test]
    fn single_write_only_buffer_commits_to_used_ring() {
        let mut q = new_queue(1024);
        {
            let pinned = q.mem.pin();
            pinned
                .write_obj(
                    Descriptor::new(0xd000, 4096, DescriptorFlags::WRITE, 0),
                    DESC_TABLE,
                )
                .unwrap();
        }
        push_avail(&q, 0, 0, 1024);

        let mut seen = Vec::new();
        q.dequeue_many(|head, iov| {
            seen.push((head, iov));
            CallbackAction::Continue
        })
        .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, 0);
        assert_eq!(seen[0].1[0].len, 4096);

        q.commit(0, 42).unwrap();
        let pinned = q.mem.pin();
        let used_idx: Le16 = pinned.read_obj(USED + 2).unwrap();
        assert_eq!(u16::from(used_idx), 1);
        let elem: VirtqUsedElem = pinned.read_obj(USED + 4).unwrap();
        assert_eq!(elem.id(), 0);
        assert_eq!(elem.len(), 42);
    }

    #[test]
    fn out_of_bounds_next_breaks_the_queue() {
        let mut q = new_queue(8);
        {
            let pinned = q.mem.pin();
            pinned
                .write_obj(
                    Descriptor::new(0x1100, 16, DescriptorFlags::NEXT, 8),
                    DESC_TABLE,
                )
                .unwrap();
        }
        push_avail(&q, 0, 0, 8);

        let result = q.dequeue_many(|_, _| CallbackAction::Continue);
        assert!(result.is_err());
        assert!(q.is_broken());

        // a subsequent valid chain also fails once broken.
        push_avail(&q, 1, 1, 8);
        let result = q.dequeue_many(|_, _| CallbackAction::Continue);
        assert!(result.is_err());
    }
}
