//! C4: the crash-safe inflight tracking region.
//!
//! A `desc_num`-entry side table, memory-mapped `MAP_SHARED` so a
//! reconnecting server maps the same bytes a crashed one left behind.
//! The on-disk layout is the stable ABI the vhost-user
//! `SET_INFLIGHT_FD`/`GET_INFLIGHT_FD` messages negotiate; the
//! mmap-over-a-file pattern itself follows the block-device-image
//! mapping idiom used elsewhere for file-backed shared state.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::Error;

const HEADER_SIZE: usize = 64;
const ENTRY_SIZE: usize = 24;
const VERSION: u64 = 1;

#[repr(C)]
#[derive(Copy, Clone)]
struct HeaderRaw {
    version: u64,
    desc_num: u64,
    used_idx: u64,
    old_used_idx: u64,
    _reserved: [u8; 32],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct EntryRaw {
    inflight: u8,
    _pad0: [u8; 7],
    counter: u64,
    num: u16,
    next: u16,
    _pad1: [u8; 4],
}

static_assertions::const_assert_eq!(std::mem::size_of::<HeaderRaw>(), HEADER_SIZE);
static_assertions::const_assert_eq!(std::mem::size_of::<EntryRaw>(), ENTRY_SIZE);

/// A head queued for replay after reattach, in the order it must be
/// redelivered to the backend.
#[derive(Copy, Clone, Debug)]
pub struct ReplayEntry {
    pub head: u16,
    pub counter: u64,
}

/// The memory-mapped inflight side table for one virtqueue.
pub struct InflightRegion {
    mmap: MmapMut,
    desc_num: u16,
    next_counter: u64,
}

impl std::fmt::Debug for InflightRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightRegion")
            .field("desc_num", &self.desc_num)
            .field("next_counter", &self.next_counter)
            .finish()
    }
}

impl InflightRegion {
    /// Opens (creating and zero-initializing if necessary) the
    /// file-backed inflight region for a queue of `desc_num` descriptors.
    /// This is the entry point surrounding vhost-user handshake code
    /// hands the negotiated fd (or path) to once `SET_INFLIGHT_FD` has
    /// been negotiated.
    pub fn open_or_create(path: &Path, desc_num: u16) -> Result<Self, Error> {
        let size = region_size(desc_num);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(size as u64)?;
        Self::from_file(file, desc_num)
    }

    /// Wraps an already-open fd (the common vhost-user path: the fd
    /// arrives via `SET_INFLIGHT_FD`'s `SCM_RIGHTS` ancillary data and
    /// surrounding code only needs to hand us the `File`).
    pub fn from_file(file: File, desc_num: u16) -> Result<Self, Error> {
        let size = region_size(desc_num);
        if file.metadata()?.len() < size as u64 {
            file.set_len(size as u64)?;
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = header_mut(&mut mmap);
        if header.version == 0 {
            header.version = VERSION;
            header.desc_num = desc_num as u64;
            header.used_idx = 0;
            header.old_used_idx = 0;
        } else if header.desc_num != desc_num as u64 {
            return Err(Error::Inflight(format!(
                "inflight region desc_num mismatch: file has {}, queue has {}",
                header.desc_num, desc_num
            )));
        }

        let next_counter = (0..desc_num)
            .map(|i| entry(&mmap, i).counter)
            .max()
            .map(|c| c + 1)
            .unwrap_or(1);

        Ok(InflightRegion {
            mmap,
            desc_num,
            next_counter,
        })
    }

    fn header(&self) -> &HeaderRaw {
        header(&self.mmap)
    }

    fn header_mut(&mut self) -> &mut HeaderRaw {
        header_mut(&mut self.mmap)
    }

    fn entry(&self, index: u16) -> &EntryRaw {
        entry(&self.mmap, index)
    }

    fn entry_mut(&mut self, index: u16) -> &mut EntryRaw {
        entry_mut(&mut self.mmap, index)
    }

    /// Records that `head` has been handed to a backend. `counter` is
    /// `None` for a freshly dequeued head (a new monotonic counter is
    /// assigned) or `Some(c)` to re-affirm a replayed head's existing
    /// counter without consuming a new one.
    pub fn record(&mut self, head: u16, counter: Option<u64>) -> Result<u64, Error> {
        let counter = match counter {
            Some(c) => c,
            None => {
                let c = self.next_counter;
                self.next_counter += 1;
                c
            }
        };
        let entry = self.entry_mut(head);
        entry.inflight = 1;
        entry.counter = counter;
        Ok(counter)
    }

    /// Clears `head`'s inflight bit and advances `used_idx` to
    /// `new_used_idx`, in that order relative to the caller's own used
    /// ring write. This is the crash-recovery ordering seam: a crash
    /// between the two leaves this region one step behind the ring, and
    /// `reattach` repairs exactly that drift.
    pub fn mark_committed(&mut self, new_used_idx: u16, head: u16) -> Result<(), Error> {
        let old = self.header().used_idx;
        self.header_mut().old_used_idx = old;
        self.header_mut().used_idx = new_used_idx as u64;
        self.entry_mut(head).inflight = 0;
        Ok(())
    }

    /// Repairs drift left by a crash inside `commit` and returns the
    /// replay set in ascending counter order.
    ///
    /// `ring_used_idx` is the live `used.idx` read from the ring itself;
    /// `last_committed_head` is the head stored at
    /// `used.ring[(ring_used_idx - 1) % qsz]`, needed only if a repair
    /// turns out to be necessary.
    pub fn reattach(
        &mut self,
        ring_used_idx: u16,
        last_committed_head: u16,
    ) -> Result<Vec<ReplayEntry>, Error> {
        let stored = self.header().used_idx as u16;
        if stored != ring_used_idx {
            // a commit crashed between writing used.idx and updating
            // inflight.used_idx; the ring is the source of truth.
            self.header_mut().old_used_idx = self.header().used_idx;
            self.header_mut().used_idx = ring_used_idx as u64;
            self.entry_mut(last_committed_head).inflight = 0;
        }

        let mut replay: Vec<ReplayEntry> = (0..self.desc_num)
            .filter_map(|i| {
                let e = self.entry(i);
                if e.inflight == 1 {
                    Some(ReplayEntry { head: i, counter: e.counter })
                } else {
                    None
                }
            })
            .collect();
        replay.sort_by_key(|r| r.counter);
        Ok(replay)
    }

    pub fn used_idx(&self) -> u16 {
        self.header().used_idx as u16
    }

    pub fn desc_num(&self) -> u16 {
        self.desc_num
    }
}

fn region_size(desc_num: u16) -> usize {
    HEADER_SIZE + desc_num as usize * ENTRY_SIZE
}

fn header(mmap: &MmapMut) -> &HeaderRaw {
    // Safety: the mapping is at least HEADER_SIZE bytes (enforced at
    // open/create time) and HeaderRaw has no invalid bit patterns.
    unsafe { &*(mmap.as_ptr() as *const HeaderRaw) }
}

fn header_mut(mmap: &mut MmapMut) -> &mut HeaderRaw {
    unsafe { &mut *(mmap.as_mut_ptr() as *mut HeaderRaw) }
}

fn entry(mmap: &MmapMut, index: u16) -> &EntryRaw {
    let offset = HEADER_SIZE + index as usize * ENTRY_SIZE;
    unsafe { &*(mmap.as_ptr().add(offset) as *const EntryRaw) }
}

fn entry_mut(mmap: &mut MmapMut, index: u16) -> &mut EntryRaw {
    let offset = HEADER_SIZE + index as usize * ENTRY_SIZE;
    unsafe { &mut *(mmap.as_mut_ptr().add(offset) as *mut EntryRaw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_region(dir: &Path, desc_num: u16) -> InflightRegion {
        InflightRegion::open_or_create(&dir.join("inflight"), desc_num).unwrap()
    }

    #[test]
    fn fresh_region_has_no_inflight_entries() {
        let dir = tempdir().unwrap();
        let mut region = new_region(dir.path(), 16);
        let replay = region.reattach(0, 0).unwrap();
        assert!(replay.is_empty());
        assert_eq!(region.used_idx(), 0);
    }

    #[test]
    fn replay_set_is_ordered_by_counter() {
        let dir = tempdir().unwrap();
        let mut region = new_region(dir.path(), 16);
        for head in 0..10u16 {
            let c = region.record(head, None).unwrap();
            assert_eq!(c, head as u64 + 1);
        }
        // commit heads 9..5 descending, per S5.
        for (i, head) in (5..10u16).rev().enumerate() {
            region.mark_committed(i as u16 + 1, head).unwrap();
        }
        let replay = region.reattach(region.used_idx(), 5).unwrap();
        let heads: Vec<u16> = replay.iter().map(|r| r.head).collect();
        assert_eq!(heads, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn crash_in_commit_window_is_repaired() {
        let dir = tempdir().unwrap();
        let mut region = new_region(dir.path(), 16);
        for head in 0..10u16 {
            region.record(head, None).unwrap();
        }
        // commit 6 of the 10 heads, in reverse arrival order: 9,8,7,6,5,4.
        let commit_order: Vec<u16> = (4..10u16).rev().collect();
        for (i, head) in commit_order.iter().enumerate() {
            region.mark_committed(i as u16 + 1, *head).unwrap();
        }
        let last_committed_head = *commit_order.last().unwrap();

        // simulate a crash between writing used.idx and inflight.used_idx:
        // the ring already reached 6 but inflight.used_idx still says 5, and
        // the last committed head's bit is falsely still set.
        region.header_mut().used_idx = 5;
        region.entry_mut(last_committed_head).inflight = 1;

        let replay = region.reattach(6, last_committed_head).unwrap();
        assert_eq!(region.used_idx(), 6);
        assert_eq!(region.entry(last_committed_head).inflight, 0);
        assert_eq!(replay.len(), 4);
    }
}
