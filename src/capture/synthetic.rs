//! Test-pattern camera backed by memfd buffers.
//!
//! Frames are painted straight into the shared memory the display imports, so
//! the handoff stays zero-copy. The clock is either a fixed frame rate or
//! manual ticks from a [`SyntheticTrigger`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::capture::decoder::{self, DecodedImage};
use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureRequest, CompletedBuffer, CompletionHandler,
    CompletionStatus, ConfigStatus, FrameMetadata, PixelFormat, QueueError, StreamConfig,
    StreamRole,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{BufferAllocator, BufferMemory, MemoryKind};
use crate::utils::create_memfd;

const MAX_WIDTH: u32 = 4096;
const MAX_HEIGHT: u32 = 2160;

enum Command {
    Queue(CaptureRequest),
    Tick,
    Fail(DeviceError),
    Stop,
}

/// Drives a synthetic camera running on a manual clock, or injects failures.
#[derive(Clone)]
pub struct SyntheticTrigger {
    tx: flume::Sender<Command>,
}

impl SyntheticTrigger {
    /// Completes the oldest queued request.
    pub fn fire(&self) {
        let _ = self.tx.send(Command::Tick);
    }

    /// Simulates the device dropping off the bus.
    pub fn disconnect(&self) {
        let _ = self
            .tx
            .send(Command::Fail(DeviceError::new(libc::ENODEV, "camera unplugged")));
    }
}

pub struct SyntheticCamera {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: Option<u32>,
    queue_depth: usize,
    pattern: Option<DecodedImage>,
    config: Option<StreamConfig>,
    maps: Vec<MmapMut>,
    handler: Option<CompletionHandler>,
    tx: flume::Sender<Command>,
    rx: Option<flume::Receiver<Command>>,
    queued: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
    started: bool,
}

impl SyntheticCamera {
    /// `fps = None` puts the camera on a manual clock.
    pub fn new(width: u32, height: u32, format: PixelFormat, fps: Option<u32>) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name: format!("synthetic-{width}x{height}"),
            width,
            height,
            format,
            fps,
            queue_depth: 8,
            pattern: None,
            config: None,
            maps: Vec::new(),
            handler: None,
            tx,
            rx: Some(rx),
            queued: Arc::new(AtomicUsize::new(0)),
            worker: None,
            started: false,
        }
    }

    /// Limits how many requests the device accepts at once.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Uses a JPEG still as the picture instead of color bars.
    pub fn with_pattern_image(mut self, path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|err| {
            Error::Configuration(format!("cannot read pattern {}: {err}", path.display()))
        })?;
        self.pattern = Some(decoder::decode_jpeg(&data)?);
        Ok(self)
    }

    pub fn trigger(&self) -> SyntheticTrigger {
        SyntheticTrigger {
            tx: self.tx.clone(),
        }
    }
}

impl BufferAllocator for SyntheticCamera {
    fn allocate(
        &mut self,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<BufferMemory>> {
        if self.started {
            return Err(Error::Allocation("camera is streaming".into()));
        }
        let (planes, len) = format
            .layout(width, height)
            .ok_or_else(|| Error::Allocation(format!("{format:?} has no raw layout")))?;

        self.maps.clear();
        let mut memory = Vec::with_capacity(count);
        for index in 0..count {
            let file = create_memfd(&format!("twincam-{index}"), len)
                .map_err(|err| Error::Allocation(format!("memfd: {err}")))?;
            // SAFETY: the memfd is private to this process and sized above
            let map = unsafe { MmapMut::map_mut(&file) }
                .map_err(|err| Error::Allocation(format!("mmap: {err}")))?;
            self.maps.push(map);
            memory.push(BufferMemory {
                fd: file.into(),
                kind: MemoryKind::Memfd,
                len,
                planes: planes.clone(),
            });
        }

        debug!(count, len, "synthetic buffers allocated");
        Ok(memory)
    }
}

impl CaptureDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, role: StreamRole) -> Result<(StreamConfig, ConfigStatus)> {
        let mut status = ConfigStatus::Valid;
        let (mut width, mut height) = (self.width.min(MAX_WIDTH), self.height.min(MAX_HEIGHT));
        if matches!(self.format, PixelFormat::Yuyv | PixelFormat::Nv12) {
            width &= !1;
            height &= !1;
        }
        if (width, height) != (self.width, self.height) {
            status = ConfigStatus::Adjusted;
        }

        let unsupported = role == StreamRole::Raw
            || self.format.is_compressed()
            || width == 0
            || height == 0
            || (self.pattern.is_some() && self.format != PixelFormat::Xrgb8888);
        if unsupported {
            status = ConfigStatus::Invalid;
        }

        let (planes, frame_size) = self.format.layout(width, height).unwrap_or_default();
        let config = StreamConfig {
            role,
            width,
            height,
            format: self.format,
            stride: planes.first().map(|p| p.stride).unwrap_or(0),
            frame_size,
        };
        if status != ConfigStatus::Invalid {
            self.config = Some(config.clone());
        }
        Ok((config, status))
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        if self.started {
            return Err(DeviceError::new(libc::EBUSY, "synthetic camera already started"));
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| DeviceError::new(libc::EINVAL, "stream not configured"))?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| DeviceError::new(libc::EINVAL, "no completion handler"))?;
        let rx = self
            .rx
            .take()
            .ok_or_else(|| DeviceError::new(libc::EBUSY, "synthetic camera already used"))?;

        let worker = Worker {
            config,
            maps: std::mem::take(&mut self.maps),
            pattern: self.pattern.take(),
            handler,
            queued: self.queued.clone(),
            interval: self.fps.map(|fps| Duration::from_secs(1) / fps.max(1)),
        };
        let handle = thread::Builder::new()
            .name("synthetic-camera".into())
            .spawn(move || worker.run(rx))?;

        self.worker = Some(handle);
        self.started = true;
        info!(camera = %self.name, fps = ?self.fps, "synthetic capture clock started");
        Ok(())
    }

    fn queue_request(&mut self, request: CaptureRequest) -> std::result::Result<(), QueueError> {
        let depth = self.queue_depth;
        let accepted = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < depth).then_some(n + 1))
            .is_ok();
        if !accepted {
            return Err(QueueError::Full);
        }
        self.tx
            .send(Command::Queue(request))
            .map_err(|_| DeviceError::new(libc::ENODEV, "synthetic camera worker gone"))?;
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), DeviceError> {
        let _ = self.tx.send(Command::Stop);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| DeviceError::new(libc::EIO, "synthetic camera worker panicked"))?;
        } else if let (Some(rx), Some(handler)) = (self.rx.as_ref(), self.handler.as_ref()) {
            // Never started: hand queued requests back from here.
            for command in rx.drain() {
                if let Command::Queue(request) = command {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    handler(CaptureEvent::Completed(cancelled(request, self.format)));
                }
            }
        }
        Ok(())
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

struct Worker {
    config: StreamConfig,
    maps: Vec<MmapMut>,
    pattern: Option<DecodedImage>,
    handler: CompletionHandler,
    queued: Arc<AtomicUsize>,
    interval: Option<Duration>,
}

impl Worker {
    fn run(mut self, rx: flume::Receiver<Command>) {
        let epoch = Instant::now();
        let mut pending = VecDeque::new();
        let mut sequence = 0u64;
        let mut failed = false;
        let mut deadline = self.interval.map(|interval| epoch + interval);

        loop {
            let command = match deadline {
                Some(at) => match rx.recv_deadline(at) {
                    Ok(command) => command,
                    Err(flume::RecvTimeoutError::Timeout) => {
                        deadline = self.interval.map(|interval| at + interval);
                        Command::Tick
                    }
                    Err(flume::RecvTimeoutError::Disconnected) => Command::Stop,
                },
                None => rx.recv().unwrap_or(Command::Stop),
            };

            match command {
                Command::Queue(request) => pending.push_back(request),
                Command::Tick if failed => {}
                Command::Tick => {
                    let Some(request) = pending.pop_front() else {
                        debug!("capture tick with no queued request");
                        continue;
                    };
                    self.paint(request.buffer.index(), sequence);
                    let metadata = FrameMetadata {
                        sequence,
                        width: self.config.width,
                        height: self.config.height,
                        format: self.config.format,
                        bytes_used: self.config.frame_size,
                        timestamp: epoch.elapsed(),
                    };
                    sequence += 1;
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    (self.handler)(CaptureEvent::Completed(CompletedBuffer {
                        request: request.id,
                        buffer: request.buffer,
                        status: CompletionStatus::Complete,
                        metadata,
                    }));
                }
                Command::Fail(err) => {
                    warn!(%err, "synthetic camera failing");
                    failed = true;
                    (self.handler)(CaptureEvent::Failed(err));
                }
                Command::Stop => break,
            }
        }

        // Requests that raced the stop are still in the channel.
        for command in rx.drain() {
            if let Command::Queue(request) = command {
                pending.push_back(request);
            }
        }
        for request in pending.drain(..) {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            (self.handler)(CaptureEvent::Completed(cancelled(request, self.config.format)));
        }
        debug!(frames = sequence, "synthetic capture clock stopped");
    }

    fn paint(&mut self, index: usize, sequence: u64) {
        let Some(map) = self.maps.get_mut(index) else {
            return;
        };
        let (width, height) = (self.config.width as usize, self.config.height as usize);
        let stride = self.config.stride as usize;

        match (&self.pattern, self.config.format) {
            (Some(image), _) => blit_rgb(map, stride, width, height, image),
            (None, PixelFormat::Xrgb8888) => {
                const BARS: [u32; 8] = [
                    0xFFFFFF, 0xFFFF00, 0x00FFFF, 0x00FF00, 0xFF00FF, 0xFF0000, 0x0000FF, 0x000000,
                ];
                let shift = sequence as usize * 4;
                for (y, row) in map.chunks_exact_mut(stride).take(height).enumerate() {
                    for (x, px) in row.chunks_exact_mut(4).take(width).enumerate() {
                        let bar = ((x + shift) * BARS.len() / width.max(1)) % BARS.len();
                        let shade = if y == sequence as usize % height.max(1) { 0x808080 } else { BARS[bar] };
                        px.copy_from_slice(&shade.to_le_bytes());
                    }
                }
            }
            (None, PixelFormat::Rgb565) => {
                for row in map.chunks_exact_mut(stride).take(height) {
                    for (x, px) in row.chunks_exact_mut(2).take(width).enumerate() {
                        let v = (((x as u64 + sequence) * 31 / width.max(1) as u64) % 32) as u16;
                        px.copy_from_slice(&((v << 11) | (v << 6) | v).to_le_bytes());
                    }
                }
            }
            (None, PixelFormat::Yuyv) => {
                for row in map.chunks_exact_mut(stride).take(height) {
                    for (x, pair) in row.chunks_exact_mut(4).enumerate() {
                        let luma = ((x as u64 * 2 + sequence) % 220 + 16) as u8;
                        pair.copy_from_slice(&[luma, 128, luma, 128]);
                    }
                }
            }
            (None, PixelFormat::Nv12) => {
                let luma = width * height;
                let len = map.len();
                let (y_plane, uv_plane) = map.split_at_mut(luma.min(len));
                for (i, px) in y_plane.iter_mut().enumerate() {
                    *px = (((i % width.max(1)) as u64 + sequence) % 220 + 16) as u8;
                }
                uv_plane.fill(128);
            }
            (None, PixelFormat::Mjpeg) => {}
        }
    }
}

fn blit_rgb(map: &mut [u8], stride: usize, width: usize, height: usize, image: &DecodedImage) {
    let (iw, ih) = (image.width as usize, image.height as usize);
    for (y, row) in map.chunks_exact_mut(stride).take(height.min(ih)).enumerate() {
        let src = &image.rgb[y * iw * 3..(y + 1) * iw * 3];
        for (px, rgb) in row.chunks_exact_mut(4).take(width.min(iw)).zip(src.chunks_exact(3)) {
            px.copy_from_slice(&[rgb[2], rgb[1], rgb[0], 0xFF]);
        }
    }
}

fn cancelled(request: CaptureRequest, format: PixelFormat) -> CompletedBuffer {
    CompletedBuffer {
        request: request.id,
        buffer: request.buffer,
        status: CompletionStatus::Cancelled,
        metadata: FrameMetadata {
            sequence: 0,
            width: 0,
            height: 0,
            format,
            bytes_used: 0,
            timestamp: Duration::ZERO,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RequestId;
    use crate::pipeline::pool::BufferId;

    fn collecting(camera: &mut SyntheticCamera) -> flume::Receiver<CaptureEvent> {
        let (tx, rx) = flume::unbounded();
        camera.set_completion_handler(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        rx
    }

    fn request(n: u64) -> CaptureRequest {
        CaptureRequest {
            id: RequestId(n),
            buffer: BufferId(n as usize),
            stream: StreamRole::Viewfinder,
        }
    }

    #[test]
    fn odd_yuyv_width_is_adjusted() {
        let mut camera = SyntheticCamera::new(641, 480, PixelFormat::Yuyv, None);
        let (config, status) = camera.configure(StreamRole::Viewfinder).unwrap();
        assert_eq!(status, ConfigStatus::Adjusted);
        assert_eq!(config.width, 640);
    }

    #[test]
    fn raw_role_is_invalid() {
        let mut camera = SyntheticCamera::new(640, 480, PixelFormat::Xrgb8888, None);
        let (_, status) = camera.configure(StreamRole::Raw).unwrap();
        assert_eq!(status, ConfigStatus::Invalid);
    }

    #[test]
    fn manual_clock_completes_in_queue_order() {
        let mut camera = SyntheticCamera::new(64, 48, PixelFormat::Xrgb8888, None);
        camera.configure(StreamRole::Viewfinder).unwrap();
        camera.allocate(2, PixelFormat::Xrgb8888, 64, 48).unwrap();
        let events = collecting(&mut camera);

        camera.queue_request(request(0)).unwrap();
        camera.queue_request(request(1)).unwrap();
        camera.start().unwrap();
        let trigger = camera.trigger();
        trigger.fire();
        trigger.fire();

        for expected in 0..2 {
            match events.recv_timeout(Duration::from_secs(2)).unwrap() {
                CaptureEvent::Completed(done) => {
                    assert_eq!(done.buffer, BufferId(expected));
                    assert_eq!(done.status, CompletionStatus::Complete);
                    assert_eq!(done.metadata.sequence, expected as u64);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        camera.stop().unwrap();
    }

    #[test]
    fn queue_depth_limits_outstanding_requests() {
        let mut camera =
            SyntheticCamera::new(64, 48, PixelFormat::Xrgb8888, None).with_queue_depth(1);
        camera.queue_request(request(0)).unwrap();
        assert!(matches!(camera.queue_request(request(1)), Err(QueueError::Full)));
    }

    #[test]
    fn stop_cancels_outstanding_requests() {
        let mut camera = SyntheticCamera::new(64, 48, PixelFormat::Xrgb8888, None);
        camera.configure(StreamRole::Viewfinder).unwrap();
        camera.allocate(3, PixelFormat::Xrgb8888, 64, 48).unwrap();
        let events = collecting(&mut camera);

        for n in 0..3 {
            camera.queue_request(request(n)).unwrap();
        }
        camera.start().unwrap();
        camera.stop().unwrap();

        let cancelled: Vec<_> = events
            .drain()
            .filter_map(|event| match event {
                CaptureEvent::Completed(done) if done.status == CompletionStatus::Cancelled => {
                    Some(done.buffer)
                }
                _ => None,
            })
            .collect();
        assert_eq!(cancelled, vec![BufferId(0), BufferId(1), BufferId(2)]);
    }

    #[test]
    fn disconnect_is_reported_as_failure() {
        let mut camera = SyntheticCamera::new(64, 48, PixelFormat::Xrgb8888, None);
        camera.configure(StreamRole::Viewfinder).unwrap();
        let events = collecting(&mut camera);
        camera.start().unwrap();

        camera.trigger().disconnect();
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, CaptureEvent::Failed(e) if e.code == libc::ENODEV));
        camera.stop().unwrap();
    }

    #[test]
    fn painted_frames_are_visible_through_the_shared_fd() {
        let mut camera = SyntheticCamera::new(16, 4, PixelFormat::Xrgb8888, None);
        camera.configure(StreamRole::Viewfinder).unwrap();
        let memory = camera.allocate(2, PixelFormat::Xrgb8888, 16, 4).unwrap();
        let events = collecting(&mut camera);

        camera.queue_request(request(0)).unwrap();
        camera.start().unwrap();
        camera.trigger().fire();
        events.recv_timeout(Duration::from_secs(2)).unwrap();

        let file = std::fs::File::from(memory[0].fd.try_clone().unwrap());
        // SAFETY: read-only view of a memfd owned by this test
        let view = unsafe { memmap2::Mmap::map(&file) }.unwrap();
        // row 0 carries the sequence marker line, row 1 starts with the white bar
        assert_eq!(&view[..4], &0x808080u32.to_le_bytes());
        assert_eq!(&view[64 + 4..64 + 8], &0xFFFFFFu32.to_le_bytes());
        camera.stop().unwrap();
    }
}
