//! Test harness for constructing real descriptor tables/avail/used rings
//! in a flat guest memory region, modeled directly on the `virtio-queue`
//! crate's own mock-queue test harness, trimmed to what this crate's
//! end-to-end tests need: direct and indirect chain construction, avail
//! publication, and used-ring/inflight inspection.

use vhost_backend::descriptor::{Descriptor, DescriptorFlags, VirtqUsedElem, DESCRIPTOR_SIZE};
use vhost_backend::mem::GuestMemoryManager;
use vhost_backend::queue::Queue;
use vm_memory::{GuestAddress, GuestMemoryMmap, Le16};

pub const DESC_TABLE: u64 = 0x1000;
pub const AVAIL: u64 = 0x8000;
pub const USED: u64 = 0x9000;
pub const INDIRECT_TABLE: u64 = 0x20000;

pub struct MockSplitQueue {
    pub mem: GuestMemoryManager,
    pub qsz: u16,
}

impl MockSplitQueue {
    pub fn new(qsz: u16) -> Self {
        let mem = GuestMemoryManager::new(
            GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10_0000)]).unwrap(),
        );
        MockSplitQueue { mem, qsz }
    }

    pub fn put_desc(&self, table_gpa: u64, idx: u16, d: Descriptor) {
        let gpa = table_gpa + idx as u64 * DESCRIPTOR_SIZE as u64;
        self.mem.pin().write_obj(d, gpa).unwrap();
    }

    /// Writes a chain of `count` direct descriptors starting at index 0
    /// of the descriptor table, each `len` bytes with `write_only`,
    /// returns the head index (always 0).
    pub fn build_direct_chain(&self, base: u16, addrs_lens: &[(u64, u32)], write_only: bool) -> u16 {
        for (i, (addr, len)) in addrs_lens.iter().enumerate() {
            let last = i == addrs_lens.len() - 1;
            let flags = if write_only { DescriptorFlags::WRITE } else { DescriptorFlags::empty() };
            let flags = if last { flags } else { flags | DescriptorFlags::NEXT };
            let next = if last { 0 } else { base + i as u16 + 1 };
            self.put_desc(DESC_TABLE, base + i as u16, Descriptor::new(*addr, *len, flags, next));
        }
        base
    }

    /// Writes an indirect table at `INDIRECT_TABLE` with the given
    /// entries (all read-only, NEXT-chained except the last) and a
    /// top-level INDIRECT descriptor at `head` pointing at it.
    pub fn build_indirect_chain(&self, head: u16, entries: &[(u64, u32)]) -> u16 {
        for (i, (addr, len)) in entries.iter().enumerate() {
            let last = i == entries.len() - 1;
            let flags = if last { DescriptorFlags::empty() } else { DescriptorFlags::NEXT };
            let next = if last { 0 } else { i as u16 + 1 };
            self.put_desc(INDIRECT_TABLE, i as u16, Descriptor::new(*addr, *len, flags, next));
        }
        let table_len = (entries.len() * DESCRIPTOR_SIZE) as u32;
        self.put_desc(
            DESC_TABLE,
            head,
            Descriptor::new(INDIRECT_TABLE, table_len, DescriptorFlags::INDIRECT, 0),
        );
        head
    }

    pub fn push_avail(&self, slot: u16, head: u16) {
        let pinned = self.mem.pin();
        let offset = AVAIL + 4 + 2 * (slot as u64 % self.qsz as u64);
        pinned.write_obj(Le16::from(head), offset).unwrap();
        pinned
            .write_obj(Le16::from(slot.wrapping_add(1)), AVAIL + 2)
            .unwrap();
    }

    pub fn used_idx(&self) -> u16 {
        let v: Le16 = self.mem.pin().read_obj(USED + 2).unwrap();
        v.into()
    }

    pub fn used_entry(&self, slot: u16) -> (u32, u32) {
        let offset = USED + 4 + 8 * (slot as u64 % self.qsz as u64);
        let elem: VirtqUsedElem = self.mem.pin().read_obj(offset).unwrap();
        (elem.id(), elem.len())
    }

    pub fn new_queue(&self) -> Queue {
        let mut q = Queue::new(self.mem.clone());
        q.attach(DESC_TABLE, AVAIL, USED, self.qsz, None).unwrap();
        q
    }
}
