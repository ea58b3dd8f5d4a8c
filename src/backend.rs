//! External backend-facing configuration types.
//!
//! This module specifies only the seam where the queue engine hands off
//! to a user-supplied backend: per-device configuration structs and the
//! completion status vocabulary. The backend's actual I/O (file I/O,
//! AIO, FUSE passthrough) and the virtio-blk/virtio-fs request parsers
//! above the queue engine are out of scope: they consume [`Request`]s
//! from a [`crate::RequestQueue`] and call [`Request::complete_bio`]
//! directly, and no trait dispatch happens inside this crate for that part.
//!
//! The `num_queues`/`max_queue_size`/`features` shape below mirrors the
//! `VhostUserBackend` trait vhost-user-backend-based servers implement
//! (see `vhost-device`'s scsi backend), trimmed to the handful of
//! queries [`crate::device::Device`] actually needs to size its virtqueue
//! set.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;

/// Outcome of one backend I/O operation, reported back through
/// [`crate::Request::complete_bio`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Success,
    IoErr,
    Canceled,
}

/// A completed request as the queue engine's commit path sees it.
#[derive(Copy, Clone, Debug)]
pub struct Completion {
    pub head: u16,
    pub len: u32,
    pub status: Status,
}

/// Guest-memory notification hooks a block backend may want (e.g. to
/// invalidate a page cache when the hypervisor rebalances guest RAM).
/// Optional: most backends never need them.
pub type MapCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type UnmapCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Device-level parameters [`crate::device::Device`] needs to size and
/// validate a vhost-user block device before the first hypervisor
/// connects.
#[derive(Clone)]
pub struct BlockDeviceInfo {
    pub socket_path: PathBuf,
    pub serial: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub num_queues: usize,
    pub readonly: bool,
    pub map_cb: Option<MapCallback>,
    pub unmap_cb: Option<UnmapCallback>,
}

impl fmt::Debug for BlockDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDeviceInfo")
            .field("socket_path", &self.socket_path)
            .field("serial", &self.serial)
            .field("block_size", &self.block_size)
            .field("total_blocks", &self.total_blocks)
            .field("num_queues", &self.num_queues)
            .field("readonly", &self.readonly)
            .field("map_cb", &self.map_cb.is_some())
            .field("unmap_cb", &self.unmap_cb.is_some())
            .finish()
    }
}

impl BlockDeviceInfo {
    /// Validates the fields that must be checked at registration time:
    /// `block_size` must be a power of two (the multiple-of-
    /// underlying-storage-block-size half of the invariant is the
    /// concrete backend's responsibility, since this crate has no
    /// notion of the underlying storage device).
    pub fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.num_queues == 0 {
            return Err(Error::InvalidConfig("num_queues must be at least 1".into()));
        }
        Ok(())
    }
}

/// Device-level parameters for a vhost-user filesystem (virtio-fs)
/// device.
#[derive(Clone, Debug)]
pub struct FsDeviceInfo {
    pub socket_path: PathBuf,
    pub num_queues: usize,
    pub tag: String,
}

impl FsDeviceInfo {
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_queues == 0 {
            return Err(Error::InvalidConfig("num_queues must be at least 1".into()));
        }
        if self.tag.len() >= 36 {
            return Err(Error::InvalidConfig("tag must be shorter than 36 bytes".into()));
        }
        Ok(())
    }
}

/// The handful of device-shape queries [`crate::device::Device`] needs
/// regardless of which concrete virtio device is registered.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Number of virtqueues this device exposes (block: request queues;
    /// fs: hiprio + request queues).
    fn num_queues(&self) -> usize;
    /// Maximum queue size this backend will accept during negotiation.
    fn max_queue_size(&self) -> u16 {
        1024
    }
    /// vhost-user/virtio feature bits this backend advertises. The
    /// feature negotiation itself lives in the (out of scope) handshake
    /// layer; this crate only needs the value to pass through.
    fn features(&self) -> u64 {
        0
    }
}

impl Backend for BlockDeviceInfo {
    fn num_queues(&self) -> usize {
        self.num_queues
    }
}

impl Backend for FsDeviceInfo {
    fn num_queues(&self) -> usize {
        // +1 for the high-priority queue virtio-fs devices always carry
        // alongside their request queues.
        self.num_queues + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(block_size: u32) -> BlockDeviceInfo {
        BlockDeviceInfo {
            socket_path: "/tmp/vhost-test.sock".into(),
            serial: "test".into(),
            block_size,
            total_blocks: 1024,
            num_queues: 1,
            readonly: false,
            map_cb: None,
            unmap_cb: None,
        }
    }

    #[test]
    fn power_of_two_block_size_is_accepted() {
        assert!(info(512).validate().is_ok());
        assert!(info(4096).validate().is_ok());
    }

    #[test]
    fn non_power_of_two_block_size_is_rejected() {
        assert!(info(500).validate().is_err());
        assert!(info(0).validate().is_err());
    }

    #[test]
    fn fs_info_rejects_an_oversized_tag() {
        let info = FsDeviceInfo {
            socket_path: "/tmp/vhost-fs.sock".into(),
            num_queues: 1,
            tag: "x".repeat(40),
        };
        assert!(info.validate().is_err());
    }
}
