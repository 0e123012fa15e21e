//! Error taxonomy shared by the capture, display and handoff layers

use std::io;

use thiserror::Error;

use crate::display::{ConnectorId, PipeId};
use crate::pipeline::pool::{BufferId, Ownership};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Raw failure reported by a device driver: errno plus a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct DeviceError {
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<nix::errno::Errno> for DeviceError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::new(errno as i32, errno.desc())
    }
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        Self::new(err.raw_os_error().unwrap_or(-1), err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("stream configuration invalid: {0}")]
    Configuration(String),

    #[error("{op} failed to start the capture device: {source}")]
    DeviceStart {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error("capture queue full, buffer {0} not accepted")]
    QueueFull(BufferId),

    #[error("no plane is attached to pipe {pipe} (connector {connector})")]
    NoPlaneAvailable { connector: ConnectorId, pipe: PipeId },

    #[error("atomic commit rejected: {0}")]
    CommitRejected(#[source] DeviceError),

    #[error("buffer {buffer}: invalid ownership transition {from:?} -> {to:?}")]
    InvalidOwnershipTransition {
        buffer: BufferId,
        from: Ownership,
        to: Ownership,
    },

    #[error("capture device disconnected: {0}")]
    Disconnected(#[source] DeviceError),

    #[error("{op}: {source}")]
    Device {
        op: &'static str,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl Error {
    pub fn device(op: &'static str, source: impl Into<DeviceError>) -> Self {
        Self::Device {
            op,
            source: source.into(),
        }
    }

    /// Queue-full and rejected commits are retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull(_) | Self::CommitRejected(_))
    }

    /// Device-reported error code, when there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::DeviceStart { source, .. }
            | Self::Device { source, .. }
            | Self::CommitRejected(source)
            | Self::Disconnected(source) => Some(source.code),
            _ => None,
        }
    }
}

/// Destination rectangle fell outside the display and was pulled back to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("plane geometry clamped: destination would start at ({dest_x}, {dest_y})")]
pub struct GeometryClampedWarning {
    pub dest_x: i64,
    pub dest_y: i64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JPEG decoder reported a fatal condition: {0}")]
    Codec(#[from] jpeg_decoder::Error),

    #[error("JPEG stream carries no image info")]
    MissingInfo,

    #[error("unsupported JPEG pixel format {0:?}")]
    UnsupportedPixelFormat(jpeg_decoder::PixelFormat),
}
