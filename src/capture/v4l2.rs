//! V4L2 capture with MMAP buffers exported as DMA-BUF for zero-copy scanout

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd};
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_exportbuffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureRequest, CompletedBuffer, CompletionHandler,
    CompletionStatus, ConfigStatus, FrameMetadata, PixelFormat, QueueError, StreamConfig,
    StreamRole,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{BufferAllocator, BufferMemory, MemoryKind, PlaneLayout};

const V4L2_BUF_FLAG_ERROR: u32 = 0x0040;

type Outstanding = Arc<Mutex<HashMap<u32, CaptureRequest>>>;

/// Camera stream on a `/dev/videoN` node.
pub struct V4l2Camera {
    path: PathBuf,
    name: String,
    device: Device,
    width: u32,
    height: u32,
    format: PixelFormat,
    fps: u32,
    config: Option<StreamConfig>,
    allocated: usize,
    handler: Option<CompletionHandler>,
    outstanding: Outstanding,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    streaming: bool,
}

impl V4l2Camera {
    #[instrument]
    pub fn open(path: &Path, width: u32, height: u32, format: PixelFormat, fps: u32) -> Result<Self> {
        let device = Device::with_path(path).map_err(|err| Error::device("open camera", err))?;
        let caps = device
            .query_caps()
            .map_err(|err| Error::device("query capabilities", err))?;
        if !caps
            .capabilities
            .contains(CapFlags::VIDEO_CAPTURE | CapFlags::STREAMING)
        {
            return Err(Error::Configuration(format!(
                "{} cannot stream video capture",
                path.display()
            )));
        }
        info!(card = %caps.card, driver = %caps.driver, "camera opened");

        Ok(Self {
            path: path.to_path_buf(),
            name: caps.card,
            device,
            width,
            height,
            format,
            fps,
            config: None,
            allocated: 0,
            handler: None,
            outstanding: Arc::default(),
            stop: Arc::default(),
            poller: None,
            streaming: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> i32 {
        self.device.handle().fd()
    }

    fn stream_off(&mut self) -> std::result::Result<(), DeviceError> {
        let mut kind = Type::VideoCapture as u32;
        // SAFETY: VIDIOC_STREAMOFF takes a pointer to the buffer type
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMOFF,
                &mut kind as *mut _ as *mut c_void,
            )
        }?;
        Ok(())
    }

    /// Hands back every request the driver still held as cancelled.
    fn cancel_outstanding(&self) {
        let cancelled: Vec<_> = match self.outstanding.lock() {
            Ok(mut outstanding) => outstanding.drain().map(|(_, r)| r).collect(),
            Err(_) => return,
        };
        let Some(handler) = &self.handler else {
            return;
        };
        let config = self.config.as_ref();
        for request in cancelled {
            handler(CaptureEvent::Completed(CompletedBuffer {
                request: request.id,
                buffer: request.buffer,
                status: CompletionStatus::Cancelled,
                metadata: FrameMetadata {
                    sequence: 0,
                    width: config.map_or(self.width, |c| c.width),
                    height: config.map_or(self.height, |c| c.height),
                    format: self.format,
                    bytes_used: 0,
                    timestamp: Duration::ZERO,
                },
            }));
        }
    }
}

fn plane_layout(format: PixelFormat, stride: u32, height: u32) -> Vec<PlaneLayout> {
    match format {
        PixelFormat::Nv12 => vec![
            PlaneLayout { offset: 0, stride },
            PlaneLayout {
                offset: stride * height,
                stride,
            },
        ],
        PixelFormat::Mjpeg => Vec::new(),
        _ => vec![PlaneLayout { offset: 0, stride }],
    }
}

fn capture_buffer(index: u32) -> v4l2_buffer {
    // SAFETY: v4l2_buffer is plain data, all-zero is a valid value
    let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
    buf.index = index;
    buf.type_ = Type::VideoCapture as u32;
    buf.memory = Memory::Mmap as u32;
    buf
}

impl BufferAllocator for V4l2Camera {
    fn allocate(
        &mut self,
        count: usize,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<BufferMemory>> {
        if self.streaming {
            return Err(Error::Allocation("camera is streaming".into()));
        }
        let failed = |op: &str, err: io::Error| Error::Allocation(format!("{op}: {err}"));

        // SAFETY: all-zero is a valid v4l2_requestbuffers
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count as u32;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;
        // SAFETY: req lives for the duration of the call
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_REQBUFS,
                &mut req as *mut _ as *mut c_void,
            )
        }
        .map_err(|err| failed("VIDIOC_REQBUFS", err))?;
        if (req.count as usize) < count {
            return Err(Error::Allocation(format!(
                "driver granted {} of {count} buffers",
                req.count
            )));
        }

        let stride = self
            .config
            .as_ref()
            .map(|c| c.stride)
            .filter(|&s| s != 0)
            .or_else(|| {
                format
                    .layout(width, height)
                    .and_then(|(planes, _)| planes.first().map(|p| p.stride))
            })
            .unwrap_or(0);

        let mut memory = Vec::with_capacity(count);
        for index in 0..count as u32 {
            let mut buf = capture_buffer(index);
            // SAFETY: buf lives for the duration of the call
            unsafe {
                v4l2::ioctl(
                    self.fd(),
                    vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut _ as *mut c_void,
                )
            }
            .map_err(|err| failed("VIDIOC_QUERYBUF", err))?;

            // SAFETY: all-zero is a valid v4l2_exportbuffer
            let mut export: v4l2_exportbuffer = unsafe { mem::zeroed() };
            export.type_ = Type::VideoCapture as u32;
            export.index = index;
            export.flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
            // SAFETY: export lives for the duration of the call
            unsafe {
                v4l2::ioctl(
                    self.fd(),
                    vidioc::VIDIOC_EXPBUF,
                    &mut export as *mut _ as *mut c_void,
                )
            }
            .map_err(|err| failed("VIDIOC_EXPBUF", err))?;

            memory.push(BufferMemory {
                // SAFETY: EXPBUF returned a new descriptor we now own
                fd: unsafe { OwnedFd::from_raw_fd(export.fd) },
                kind: MemoryKind::DmaBuf,
                len: buf.length as usize,
                planes: plane_layout(format, stride, height),
            });
        }

        self.allocated = count;
        debug!(count, stride, "V4L2 buffers exported");
        Ok(memory)
    }
}

impl CaptureDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, role: StreamRole) -> Result<(StreamConfig, ConfigStatus)> {
        let requested = Format::new(
            self.width,
            self.height,
            FourCC::new(&self.format.v4l2_fourcc()),
        );
        let actual = self
            .device
            .set_format(&requested)
            .map_err(|err| Error::device("set format", err))?;
        if let Err(err) = self.device.set_params(&Parameters::with_fps(self.fps)) {
            warn!(fps = self.fps, %err, "frame rate not applied");
        }

        let format = PixelFormat::from_v4l2_fourcc(&actual.fourcc.repr);
        let config = StreamConfig {
            role,
            width: actual.width,
            height: actual.height,
            format: format.unwrap_or(self.format),
            stride: actual.stride,
            frame_size: actual.size as usize,
        };

        let status = match format {
            None => ConfigStatus::Invalid,
            Some(_) if role == StreamRole::Raw => ConfigStatus::Invalid,
            Some(format)
                if format == self.format
                    && actual.width == self.width
                    && actual.height == self.height =>
            {
                ConfigStatus::Valid
            }
            Some(_) => ConfigStatus::Adjusted,
        };
        if status != ConfigStatus::Invalid {
            self.format = config.format;
            self.config = Some(config.clone());
        }
        Ok((config, status))
    }

    fn set_completion_handler(&mut self, handler: CompletionHandler) {
        self.handler = Some(handler);
    }

    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        if self.streaming {
            return Err(DeviceError::new(libc::EBUSY, "camera already streaming"));
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| DeviceError::new(libc::EINVAL, "stream not configured"))?;
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| DeviceError::new(libc::EINVAL, "no completion handler"))?;

        let mut kind = Type::VideoCapture as u32;
        // SAFETY: VIDIOC_STREAMON takes a pointer to the buffer type
        unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_STREAMON,
                &mut kind as *mut _ as *mut c_void,
            )
        }?;

        self.stop.store(false, Ordering::Release);
        let dequeuer = Dequeuer {
            handle: self.device.handle(),
            outstanding: self.outstanding.clone(),
            stop: self.stop.clone(),
            handler,
            config,
        };
        let poller = thread::Builder::new()
            .name("v4l2-dequeue".into())
            .spawn(move || dequeuer.run());
        match poller {
            Ok(poller) => self.poller = Some(poller),
            Err(err) => {
                let _ = self.stream_off();
                return Err(err.into());
            }
        }

        self.streaming = true;
        info!(camera = %self.name, "streaming started");
        Ok(())
    }

    fn queue_request(&mut self, request: CaptureRequest) -> std::result::Result<(), QueueError> {
        let index = request.buffer.index() as u32;
        {
            let mut outstanding = self
                .outstanding
                .lock()
                .map_err(|_| DeviceError::new(libc::EIO, "request table poisoned"))?;
            if outstanding.len() >= self.allocated {
                return Err(QueueError::Full);
            }
            // registered first: the dequeue thread may see the buffer right away
            outstanding.insert(index, request);
        }

        let mut buf = capture_buffer(index);
        // SAFETY: buf lives for the duration of the call
        let queued = unsafe {
            v4l2::ioctl(
                self.fd(),
                vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        };
        if let Err(err) = queued {
            if let Ok(mut outstanding) = self.outstanding.lock() {
                outstanding.remove(&index);
            }
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ENOBUFS) => Err(QueueError::Full),
                _ => Err(QueueError::Device(err.into())),
            };
        }
        Ok(())
    }

    fn stop(&mut self) -> std::result::Result<(), DeviceError> {
        self.stop.store(true, Ordering::Release);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("dequeue thread panicked");
            }
        }
        let result = self.stream_off();
        self.streaming = false;
        self.cancel_outstanding();
        info!(camera = %self.name, "streaming stopped");
        result
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        if self.streaming {
            let _ = self.stop();
        }
    }
}

struct Dequeuer {
    handle: Arc<Handle>,
    outstanding: Outstanding,
    stop: Arc<AtomicBool>,
    handler: CompletionHandler,
    config: StreamConfig,
}

impl Dequeuer {
    fn run(self) {
        let fd = self.handle.fd();
        while !self.stop.load(Ordering::Acquire) {
            // The driver reports POLLERR while nothing is queued.
            let idle = self.outstanding.lock().map(|o| o.is_empty()).unwrap_or(true);
            if idle {
                thread::sleep(Duration::from_millis(5));
                continue;
            }

            // SAFETY: the descriptor stays open while `self.handle` is alive
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(err) => {
                    (self.handler)(CaptureEvent::Failed(err.into()));
                    return;
                }
            }

            let mut buf = capture_buffer(0);
            // SAFETY: buf lives for the duration of the call
            let dequeued = unsafe {
                v4l2::ioctl(fd, vidioc::VIDIOC_DQBUF, &mut buf as *mut _ as *mut c_void)
            };
            match dequeued {
                Ok(()) => self.complete(&buf),
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => continue,
                Err(err) => {
                    warn!(%err, "dequeue failed, camera lost");
                    (self.handler)(CaptureEvent::Failed(err.into()));
                    return;
                }
            }
        }
    }

    fn complete(&self, buf: &v4l2_buffer) {
        let request = self
            .outstanding
            .lock()
            .ok()
            .and_then(|mut outstanding| outstanding.remove(&buf.index));
        let Some(request) = request else {
            debug!(index = buf.index, "dequeued buffer with no request");
            return;
        };
        if buf.flags & V4L2_BUF_FLAG_ERROR != 0 {
            warn!(buffer = %request.buffer, "driver flagged frame as corrupt");
        }

        (self.handler)(CaptureEvent::Completed(CompletedBuffer {
            request: request.id,
            buffer: request.buffer,
            status: CompletionStatus::Complete,
            metadata: FrameMetadata {
                sequence: u64::from(buf.sequence),
                width: self.config.width,
                height: self.config.height,
                format: self.config.format,
                bytes_used: buf.bytesused as usize,
                timestamp: Duration::new(
                    buf.timestamp.tv_sec as u64,
                    (buf.timestamp.tv_usec as u32).saturating_mul(1000),
                ),
            },
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_chroma_follows_padded_luma() {
        let planes = plane_layout(PixelFormat::Nv12, 1024, 480);
        assert_eq!(planes[1].offset, 1024 * 480);
        assert_eq!(planes[1].stride, 1024);
    }

    #[test]
    fn packed_formats_use_one_plane() {
        assert_eq!(plane_layout(PixelFormat::Yuyv, 1280, 720).len(), 1);
        assert!(plane_layout(PixelFormat::Mjpeg, 1280, 720).is_empty());
    }
}
