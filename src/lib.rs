//! vhost-backend: device-side vhost-user virtqueue engine.
//!
//! This crate implements the three subsystems that sit between a kicked
//! eventfd and a completed guest I/O request: the split-ring descriptor
//! walker (`chain`, `descriptor`), the crash-safe inflight side table
//! (`inflight`), and the event-loop/request-queue plumbing that hands
//! dequeued requests to a user-supplied backend (`event_loop`,
//! `request_queue`, `device`). The vhost-user handshake itself, concrete
//! backends, and the virtio-blk/virtio-fs request parsers above the queue
//! engine are out of scope; `backend` only specifies the trait boundary.

#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod chain;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod event_loop;
pub mod inflight;
pub mod log_bridge;
pub mod mem;
pub mod queue;
pub mod request_queue;

pub use backend::{BlockDeviceInfo, Completion, FsDeviceInfo, Status};
pub use descriptor::{Descriptor, DescriptorFlags, VirtqUsedElem};
pub use device::{Device, DeviceHandle};
pub use error::Error;
pub use event_loop::EventLoop;
pub use inflight::InflightRegion;
pub use queue::{BufferVector, IoBuffer, Queue, QueueState};
pub use request_queue::{Request, RequestQueue};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Installs `log_fn` as the process-wide logger and brings up whatever
/// process-global state the library needs before any device is
/// registered. Mirrors the reference server's single global context:
/// callers hold the returned context and pass it to `register_*`.
pub fn start_server(log_fn: Box<dyn Fn(log::Level, &str) + Send + Sync>) -> Result<ServerContext> {
    log_bridge::install(log_fn)?;
    Ok(ServerContext { _private: () })
}

/// Opaque process-wide handle returned by [`start_server`]. Dropping it
/// does not stop the server; call [`stop_server`] explicitly.
#[derive(Debug)]
pub struct ServerContext {
    _private: (),
}

/// Tears down whatever process-global state `start_server` brought up.
/// Does not by itself unregister devices; callers must have already
/// called [`Device::unregister`] (or equivalent) for each registered
/// device and drained its request queue.
pub fn stop_server(_ctx: ServerContext) {}
