//! C2: the 16-byte descriptor record and its flag bits.
//!
//! Field layout and `ByteValued` wiring follow the `virtio-queue` crate's
//! `Descriptor`/`VirtqUsedElem` types; the flag bitset itself is a plain
//! `bitflags!` type, the conventional way to model a small fixed set of
//! descriptor flag bits in this ecosystem.

use bitflags::bitflags;
use vm_memory::{ByteValued, Le16, Le32, Le64};

bitflags! {
    /// Descriptor flag bits (virtio spec §2.6.5).
    pub struct DescriptorFlags: u16 {
        /// This descriptor continues via `next`.
        const NEXT = 0b001;
        /// Device-write-only buffer (vs. device-read-only).
        const WRITE = 0b010;
        /// Buffer contains a list of descriptors, not data.
        const INDIRECT = 0b100;
    }
}

/// One 16-byte entry in a descriptor table. Little-endian on the wire,
/// exactly as laid out by the virtio spec and the vhost-user memory
/// regions this crate reads directly.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Descriptor {
    addr: Le64,
    len: Le32,
    flags: Le16,
    next: Le16,
}

// Safety: `Descriptor` is `repr(C)`, has no padding, and every bit
// pattern of its fields is valid, so any byte sequence of the right
// length is a valid `Descriptor`.
unsafe impl ByteValued for Descriptor {}

impl Descriptor {
    pub fn new(addr: u64, len: u32, flags: DescriptorFlags, next: u16) -> Self {
        Descriptor {
            addr: addr.into(),
            len: len.into(),
            flags: flags.bits().into(),
            next: next.into(),
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr.into()
    }

    pub fn len(&self) -> u32 {
        self.len.into()
    }

    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.flags.into())
    }

    pub fn next(&self) -> u16 {
        self.next.into()
    }

    pub fn has_next(&self) -> bool {
        self.flags().contains(DescriptorFlags::NEXT)
    }

    pub fn is_write_only(&self) -> bool {
        self.flags().contains(DescriptorFlags::WRITE)
    }

    pub fn is_indirect(&self) -> bool {
        self.flags().contains(DescriptorFlags::INDIRECT)
    }
}

/// One 8-byte entry in the used ring: the completed head index and the
/// number of bytes the device actually wrote.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtqUsedElem {
    id: Le32,
    len: Le32,
}

unsafe impl ByteValued for VirtqUsedElem {}

impl VirtqUsedElem {
    pub fn new(id: u32, len: u32) -> Self {
        VirtqUsedElem {
            id: id.into(),
            len: len.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.into()
    }

    pub fn len(&self) -> u32 {
        self.len.into()
    }
}

pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<Descriptor>();
