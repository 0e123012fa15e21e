pub mod decoder;
pub mod frame;
pub mod session;
pub mod synthetic;
pub mod v4l2;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{DeviceError, Result};
use crate::pipeline::pool::{BufferAllocator, BufferId};

pub use frame::{FrameMetadata, PixelFormat};
pub use session::CaptureSession;
pub use synthetic::{SyntheticCamera, SyntheticTrigger};
pub use v4l2::V4l2Camera;

/// What the stream is used for; devices tune their proposal to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamRole {
    Raw,
    StillCapture,
    VideoRecording,
    #[default]
    Viewfinder,
}

/// Outcome of validating a proposed configuration against the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigStatus {
    Valid,
    Adjusted,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub role: StreamRole,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: u32,
    pub frame_size: usize,
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}-{:?} (stride {}, {} bytes)",
            self.width, self.height, self.format, self.stride, self.frame_size
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// One buffer submitted to the device for filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub id: RequestId,
    pub buffer: BufferId,
    pub stream: StreamRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Complete,
    /// Returned unfilled because the device stopped
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBuffer {
    pub request: RequestId,
    pub buffer: BufferId,
    pub status: CompletionStatus,
    pub metadata: FrameMetadata,
}

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Completed(CompletedBuffer),
    /// The device can't continue (unplugged, I/O error)
    Failed(DeviceError),
}

pub type CompletionHandler = Arc<dyn Fn(CaptureEvent) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("device queue full")]
    Full,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Capture hardware as seen by [`CaptureSession`].
///
/// Completions are reported through the handler on a device thread. After
/// `stop` every request still queued is reported as `Cancelled`.
pub trait CaptureDevice: BufferAllocator + Send {
    fn name(&self) -> &str;

    /// Proposes a configuration for `role` and validates it.
    fn configure(&mut self, role: StreamRole) -> Result<(StreamConfig, ConfigStatus)>;

    fn set_completion_handler(&mut self, handler: CompletionHandler);

    fn start(&mut self) -> std::result::Result<(), DeviceError>;

    fn queue_request(&mut self, request: CaptureRequest) -> std::result::Result<(), QueueError>;

    fn stop(&mut self) -> std::result::Result<(), DeviceError>;
}
