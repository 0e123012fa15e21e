//! Hardware-free devices for unit tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureRequest, CompletedBuffer, CompletionHandler,
    CompletionStatus, ConfigStatus, FrameMetadata, PixelFormat, QueueError, RequestId,
    StreamConfig, StreamRole,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{BufferAllocator, BufferId, BufferMemory, MemoryKind};
use crate::utils::create_memfd;

/// memfd-backed allocator. `raw_size` sizes buffers of compressed formats.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    pub fail: bool,
    pub raw_size: Option<usize>,
}

impl BufferAllocator for HeapAllocator {
    fn allocate(
        &mut self,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<BufferMemory>> {
        if self.fail {
            return Err(Error::Allocation("device cannot export buffers".into()));
        }
        let (planes, len) = match (format.layout(width, height), self.raw_size) {
            (Some(layout), _) => layout,
            (None, Some(len)) => (Vec::new(), len),
            (None, None) => return Err(Error::Allocation(format!("no size for {format:?}"))),
        };
        (0..count)
            .map(|index| {
                let file = create_memfd(&format!("test-{index}"), len)
                    .map_err(|err| Error::Allocation(err.to_string()))?;
                Ok(BufferMemory {
                    fd: file.into(),
                    kind: MemoryKind::Memfd,
                    len,
                    planes: planes.clone(),
                })
            })
            .collect()
    }
}

#[derive(Default)]
struct LogState {
    outstanding: VecDeque<CaptureRequest>,
    stop_calls: usize,
    fail_start: bool,
    queue_full: bool,
    sequence: u64,
    handler: Option<CompletionHandler>,
}

/// Shared view of what a [`FakeCamera`] was asked to do. Also drives its
/// completions from the test body.
#[derive(Clone, Default)]
pub struct CameraLog {
    state: Arc<Mutex<LogState>>,
    size: (u32, u32),
}

impl CameraLog {
    fn with<R>(&self, f: impl FnOnce(&mut LogState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Buffers currently queued on the device, oldest first.
    pub fn queued_buffers(&self) -> Vec<BufferId> {
        self.with(|s| s.outstanding.iter().map(|r| r.buffer).collect())
    }

    pub fn stop_calls(&self) -> usize {
        self.with(|s| s.stop_calls)
    }

    pub fn fail_start(&self, fail: bool) {
        self.with(|s| s.fail_start = fail);
    }

    pub fn set_queue_full(&self, full: bool) {
        self.with(|s| s.queue_full = full);
    }

    pub fn emit(&self, event: CaptureEvent) {
        let handler = self.with(|s| s.handler.clone());
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Completes the oldest queued request.
    pub fn complete_next(&self) -> Option<BufferId> {
        let request = self.with(|s| s.outstanding.pop_front())?;
        let completed = self.completed(request, CompletionStatus::Complete);
        self.emit(CaptureEvent::Completed(completed));
        Some(request.buffer)
    }

    pub fn disconnect(&self) {
        self.emit(CaptureEvent::Failed(DeviceError::new(libc::ENODEV, "no such device")));
    }

    fn completed(&self, request: CaptureRequest, status: CompletionStatus) -> CompletedBuffer {
        let sequence = self.with(|s| {
            s.sequence += 1;
            s.sequence
        });
        CompletedBuffer {
            request: request.id,
            buffer: request.buffer,
            status,
            metadata: FrameMetadata {
                sequence,
                width: self.size.0,
                height: self.size.1,
                format: PixelFormat::Xrgb8888,
                bytes_used: (self.size.0 * self.size.1 * 4) as usize,
                timestamp: Duration::from_millis(sequence * 33),
            },
        }
    }
}

/// Capture device whose completions happen only when the test says so.
pub struct FakeCamera {
    width: u32,
    height: u32,
    status: ConfigStatus,
    allocator: HeapAllocator,
    pub log: CameraLog,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            status: ConfigStatus::Valid,
            allocator: HeapAllocator::default(),
            log: CameraLog {
                size: (width, height),
                ..Default::default()
            },
        }
    }

    pub fn with_status(mut self, status: ConfigStatus) -> Self {
        self.status = status;
        self
    }

    pub fn emit(&self, event: CaptureEvent) {
        self.log.emit(event);
    }

    /// A completion for `buffer`, taking its request off the device queue.
    pub fn completion(&self, buffer: BufferId, status: CompletionStatus) -> CompletedBuffer {
        let request = self
            .log
            .with(|s| {
                let pos = s.outstanding.iter().position(|r| r.buffer == buffer)?;
                s.outstanding.remove(pos)
            })
            .unwrap_or(CaptureRequest {
                id: RequestId(0),
                buffer,
                stream: StreamRole::Viewfinder,
            });
        self.log.completed(request, status)
    }
}

impl BufferAllocator for FakeCamera {
    fn allocate(
        &mut self,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<BufferMemory>> {
        self.allocator.allocate(count, format, width, height)
    }
}

impl CaptureDevice for FakeCamera {
    fn name(&self) -> &str {
        "fake"
    }

    fn configure(&mut self, role: StreamRole) -> Result<(StreamConfig, ConfigStatus)> {
        let config = StreamConfig {
            role,
            width: self.width,
            height: self.height,
            format: PixelFormat::Xrgb8888,
            stride: self.width * 4,
            frame_size: (self.width * self.height * 4) as usize,
        };
        Ok((config, self.status))
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.log.with(|s| s.handler = Some(handler));
    }

    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        if self.log.with(|s| s.fail_start) {
            return Err(DeviceError::new(libc::EBUSY, "device busy"));
        }
        Ok(())
    }

    fn queue_request(&mut self, request: CaptureRequest) -> std::result::Result<(), QueueError> {
        self.log.with(|s| {
            if s.queue_full {
                return Err(QueueError::Full);
            }
            s.outstanding.push_back(request);
            Ok(())
        })
    }

    fn stop(&mut self) -> std::result::Result<(), DeviceError> {
        let cancelled: Vec<_> = self.log.with(|s| {
            s.stop_calls += 1;
            s.outstanding.drain(..).collect()
        });
        for request in cancelled {
            let completed = self.log.completed(request, CompletionStatus::Cancelled);
            self.log.emit(CaptureEvent::Completed(completed));
        }
        Ok(())
    }
}
