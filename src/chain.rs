//! C2: descriptor chain walker.
//!
//! Follows the `virtio-queue` crate's `DescriptorChain` iterator
//! (`switch_to_indirect_table`, ttl-based loop detection) with one
//! deliberate divergence: the reference iterator silently stops yielding
//! descriptors on a malformed chain (returns `None`); this walker treats
//! every such case as a hard `Err` so the caller can mark the queue
//! broken. A protocol violation must never be swallowed.

use crate::descriptor::{Descriptor, DescriptorFlags, DESCRIPTOR_SIZE};
use crate::mem::PinnedMemory;
use crate::queue::{BufferVector, IoBuffer, QueueError};

/// Walks one descriptor chain starting at `head` and returns its buffer
/// vector, or the specific invariant it violated.
///
/// `desc_table_gpa` is the guest-physical base of the (direct) descriptor
/// table this queue was attached with; `qsz` bounds both direct indices
/// and hop counts.
pub fn walk_chain(
    mem: &PinnedMemory,
    desc_table_gpa: u64,
    qsz: u16,
    head: u16,
) -> Result<BufferVector, QueueError> {
    if head >= qsz {
        return Err(QueueError::DescriptorOutOfBounds { index: head, qsz });
    }

    let mut buffers: Vec<IoBuffer> = Vec::new();
    let mut seen_write_only = false;
    let mut ttl = qsz as u32;
    let mut table_gpa = desc_table_gpa;
    let mut index = head;
    let mut indirect = false;

    loop {
        if ttl == 0 {
            return Err(QueueError::ChainLoop { head });
        }
        ttl -= 1;

        let desc_gpa = table_gpa + (index as u64) * (DESCRIPTOR_SIZE as u64);
        let desc: Descriptor = mem
            .read_obj(desc_gpa)
            .map_err(|_| QueueError::TranslationFailure { gpa: desc_gpa })?;

        let flags = desc.flags();
        if flags.contains(DescriptorFlags::INDIRECT) {
            if flags.contains(DescriptorFlags::NEXT) {
                return Err(QueueError::IndirectWithNext { head });
            }
            if indirect {
                return Err(QueueError::NestedIndirect { head });
            }
            if desc.len() as usize % DESCRIPTOR_SIZE != 0 || desc.len() == 0 {
                return Err(QueueError::MisalignedIndirectTable { head });
            }
            let entries = desc.len() as usize / DESCRIPTOR_SIZE;
            if entries > qsz as usize {
                return Err(QueueError::ChainTooLong { head });
            }
            // descend into the indirect table; a translation failure on
            // the table itself is the same as on any other descriptor.
            if !mem.is_mapped(desc.addr()) {
                return Err(QueueError::TranslationFailure { gpa: desc.addr() });
            }
            indirect = true;
            table_gpa = desc.addr();
            ttl = entries as u32;
            index = 0;
            continue;
        }

        if flags.contains(DescriptorFlags::WRITE) {
            seen_write_only = true;
        } else if seen_write_only {
            return Err(QueueError::OrderViolation { head });
        }

        if desc.len() > 0 {
            let ptr = mem
                .translate(desc.addr(), desc.len())
                .map_err(|_| QueueError::TranslationFailure { gpa: desc.addr() })?;
            buffers.push(IoBuffer {
                ptr: ptr.as_ptr(),
                len: ptr.len(),
                write_only: flags.contains(DescriptorFlags::WRITE),
            });
        }

        if !flags.contains(DescriptorFlags::NEXT) {
            break;
        }
        if desc.next() >= qsz {
            return Err(QueueError::DescriptorOutOfBounds { index: desc.next(), qsz });
        }
        index = desc.next();
    }

    Ok(BufferVector::new(buffers, mem.clone()))
}
