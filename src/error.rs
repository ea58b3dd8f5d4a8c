//! Crate-wide error type.
//!
//! Follows the `virtio-queue` crate's `Error` enum: a flat set of
//! variants with a hand-written `Display`/`std::error::Error` impl, no
//! `thiserror`, nothing in a queue-engine layer this thin needs it.

use std::fmt;
use std::io;

use crate::queue::QueueError;

/// Errors that can cross the public API boundary.
#[derive(Debug)]
pub enum Error {
    /// A descriptor chain or ring index violated an invariant from
    /// the virtqueue's data model; the owning queue is now broken.
    Queue(QueueError),
    /// A guest-physical range did not resolve to a single host mapping.
    Translation { gpa: u64, len: u32 },
    /// The inflight region's on-disk layout or contents were invalid.
    Inflight(String),
    /// A config value (e.g. `block_size`) failed validation.
    InvalidConfig(String),
    /// mmap, socket, or other OS-level failure.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Queue(e) => write!(f, "virtqueue error: {}", e),
            Error::Translation { gpa, len } => {
                write!(f, "failed to translate guest address {:#x} (len {})", gpa, len)
            }
            Error::Inflight(msg) => write!(f, "inflight region error: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "invalid device configuration: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Queue(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        Error::Queue(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
