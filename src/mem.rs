//! C1: guest-memory map.
//!
//! Translates guest-physical ranges to host pointers and keeps the table
//! backing an in-flight translation alive even if the hypervisor installs
//! a new one mid-request. Built on `GuestMemoryAtomic`/`GuestMemoryMmap`,
//! the same pattern `virtiofsd`'s `update_memory` and the `virtio-queue`
//! crate's `Queue<M: GuestAddressSpace>` use for a live-swappable guest
//! address space.

use std::sync::Arc;

use vm_memory::{
    Address, Bytes, GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryAtomic,
    GuestMemoryLoadGuard, GuestMemoryMmap,
};

use crate::error::Error;

/// Owns the current guest memory table and hands out atomically
/// refcounted snapshots of it.
///
/// A memory-table update (`update`) installs a new table but does not
/// invalidate snapshots already pinned by [`pin`](Self::pin): those keep
/// the old table alive (via `Arc`) until the last in-flight request using
/// them drops its snapshot, which is exactly the "ref/unref" requirement:
/// no explicit refcount is threaded by hand, the `Arc` inside
/// `GuestMemoryAtomic` does it.
#[derive(Clone, Debug)]
pub struct GuestMemoryManager {
    inner: GuestMemoryAtomic<GuestMemoryMmap>,
}

impl GuestMemoryManager {
    /// Wraps an already-constructed guest memory map.
    pub fn new(mem: GuestMemoryMmap) -> Self {
        Self {
            inner: GuestMemoryAtomic::new(mem),
        }
    }

    /// Installs a new memory table. Snapshots already pinned via
    /// [`pin`](Self::pin) keep seeing the old table until dropped.
    pub fn update(&self, mem: GuestMemoryMmap) {
        let mut guard = self.inner.lock().expect("guest memory lock poisoned");
        *guard = Arc::new(mem);
    }

    /// Pins the current table and returns a handle through which
    /// descriptor chains can be translated. Hold this for the lifetime of
    /// one `dequeue_many` pass or one in-flight request's buffer vector.
    pub fn pin(&self) -> PinnedMemory {
        PinnedMemory(self.inner.memory())
    }
}

/// A refcounted snapshot of the guest memory table, pinned against
/// concurrent memory-table updates for as long as it's held.
#[derive(Clone)]
pub struct PinnedMemory(GuestMemoryLoadGuard<GuestMemoryMmap>);

impl std::fmt::Debug for PinnedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedMemory").finish_non_exhaustive()
    }
}

impl PinnedMemory {
    /// Translates a guest-physical range to a host pointer, failing if the
    /// full range does not lie within a single mapped region.
    pub fn translate(&self, gpa: u64, len: u32) -> Result<HostPtr, Error> {
        if len == 0 {
            return Ok(HostPtr {
                ptr: std::ptr::NonNull::dangling().as_ptr(),
                len: 0,
            });
        }
        let addr = GuestAddress(gpa);
        let slice = self
            .0
            .get_slice(addr, len as usize)
            .map_err(|_| Error::Translation { gpa, len })?;
        Ok(HostPtr {
            ptr: slice.as_ptr(),
            len,
        })
    }

    /// Reads a `ByteValued` object out of guest memory at `gpa`.
    pub fn read_obj<T: vm_memory::ByteValued>(&self, gpa: u64) -> Result<T, Error> {
        self.0
            .read_obj(GuestAddress(gpa))
            .map_err(|_| Error::Translation { gpa, len: std::mem::size_of::<T>() as u32 })
    }

    /// True if `gpa` is backed by the current table at all (used by
    /// `attach` to reject a ring whose base address isn't mapped).
    pub fn is_mapped(&self, gpa: u64) -> bool {
        self.0.address_in_range(GuestAddress(gpa))
    }

    /// Writes a `ByteValued` object into guest memory. The device only
    /// ever uses this for the used ring (`queue::Queue::commit`); test
    /// harnesses also use it to seed descriptor tables and avail rings.
    pub fn write_obj<T: vm_memory::ByteValued>(&self, val: T, gpa: u64) -> Result<(), Error> {
        self.0
            .write_obj(val, GuestAddress(gpa))
            .map_err(|_| Error::Translation { gpa, len: std::mem::size_of::<T>() as u32 })
    }
}

/// A validated host pointer into pinned guest memory. Never outlives the
/// [`PinnedMemory`] it was derived from in spirit (nothing enforces this
/// at the type level beyond documentation), matching the reference
/// ecosystem's own `VolatileSlice` usage, which is likewise a bare
/// pointer+len pair validated once at translation time.
#[derive(Copy, Clone, Debug)]
pub struct HostPtr {
    ptr: *mut u8,
    len: u32,
}

impl HostPtr {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// Safety: the pointer only ever refers into an mmap'd guest memory region
// kept alive by a pinned `Arc` elsewhere; the struct carries no borrowed
// lifetime so it can live inside a `Send` request object.
unsafe impl Send for HostPtr {}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestMemoryMmap;

    fn flat_memory(size: usize) -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).unwrap()
    }

    #[test]
    fn translate_within_region_succeeds() {
        let mgr = GuestMemoryManager::new(flat_memory(0x10000));
        let pinned = mgr.pin();
        let ptr = pinned.translate(0x100, 64).unwrap();
        assert_eq!(ptr.len(), 64);
    }

    #[test]
    fn translate_past_region_fails() {
        let mgr = GuestMemoryManager::new(flat_memory(0x1000));
        let pinned = mgr.pin();
        assert!(pinned.translate(0x1000 - 8, 64).is_err());
    }

    #[test]
    fn zero_gpa_is_a_valid_translation() {
        let mgr = GuestMemoryManager::new(flat_memory(0x1000));
        let pinned = mgr.pin();
        assert!(pinned.translate(0, 16).is_ok());
        assert!(pinned.is_mapped(0));
    }

    #[test]
    fn update_does_not_disturb_pinned_snapshot() {
        let mgr = GuestMemoryManager::new(flat_memory(0x1000));
        let pinned = mgr.pin();
        mgr.update(flat_memory(0x2000));
        // the snapshot taken before the update still sees the old table.
        assert!(pinned.translate(0x100, 16).is_ok());
        assert!(pinned.translate(0x1800, 16).is_err());
    }
}
