//! In-memory display card with one connector, one pipe and one primary plane.
//!
//! Commits complete on a simulated vblank, either from a timer thread at the
//! configured refresh rate or manually through [`VirtualVblank`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::capture::frame::fourcc;
use crate::display::{
    AtomicCommitRequest, CommitError, CommitEvent, CommitHandle, CommitHandler, CommitTracker,
    ConnectorId, ConnectorInfo, DisplayDevice, FramebufferId, Mode, PipeId, PipeInfo, PlaneId,
    PlaneInfo, PlaneKind, PlaneProperty,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::Buffer;

const CONNECTOR: ConnectorId = ConnectorId(1);
const PIPE: PipeId = PipeId(2);
const PLANE: PlaneId = PlaneId(3);

#[derive(Debug, Clone, Copy)]
struct Framebuffer {
    width: u32,
    height: u32,
    format: u32,
}

type Position = (i32, i32, u32, u32);

#[derive(Default)]
struct Scanout {
    in_flight: Option<(CommitHandle, FramebufferId, Position)>,
    on_screen: Option<FramebufferId>,
    position: Option<Position>,
    sequence: u32,
    commits: Vec<AtomicCommitRequest>,
}

struct Shared {
    scanout: Mutex<Scanout>,
    tracker: CommitTracker,
    reject_next: AtomicU32,
    epoch: Instant,
}

impl Shared {
    fn vblank(&self) -> bool {
        let event = {
            let Ok(mut scanout) = self.scanout.lock() else {
                return false;
            };
            let Some((handle, fb, position)) = scanout.in_flight.take() else {
                return false;
            };
            scanout.sequence = scanout.sequence.wrapping_add(1);
            scanout.on_screen = Some(fb);
            scanout.position = Some(position);
            CommitEvent {
                handle,
                sequence: scanout.sequence,
                timestamp: self.epoch.elapsed(),
            }
        };
        trace!(handle = event.handle.0, "virtual vblank");
        self.tracker.complete(event);
        true
    }
}

/// Test-side control over a [`VirtualCard`].
#[derive(Clone)]
pub struct VirtualVblank {
    shared: Arc<Shared>,
}

impl VirtualVblank {
    /// Completes the commit in flight, if any.
    pub fn fire(&self) -> bool {
        self.shared.vblank()
    }

    /// Makes the next `count` commits fail as the hardware would for an
    /// unsupported configuration.
    pub fn reject_next(&self, count: u32) {
        self.shared.reject_next.store(count, Ordering::Release);
    }

    /// Every commit the card has accepted, oldest first.
    pub fn commits(&self) -> Vec<AtomicCommitRequest> {
        self.shared
            .scanout
            .lock()
            .map(|s| s.commits.clone())
            .unwrap_or_default()
    }

    pub fn on_screen(&self) -> Option<FramebufferId> {
        self.shared.scanout.lock().ok().and_then(|s| s.on_screen)
    }

    pub fn in_flight(&self) -> bool {
        self.shared
            .scanout
            .lock()
            .map(|s| s.in_flight.is_some())
            .unwrap_or(false)
    }
}

pub struct VirtualCard {
    name: String,
    width: u32,
    height: u32,
    refresh_hz: u32,
    max_scale: f32,
    formats: Vec<u32>,
    framebuffers: HashMap<FramebufferId, Framebuffer>,
    next_fb: u32,
    next_commit: u64,
    shared: Arc<Shared>,
    timer: Option<(flume::Sender<()>, JoinHandle<()>)>,
}

impl VirtualCard {
    /// A card whose vblanks only happen through [`VirtualVblank::fire`].
    pub fn manual(width: u32, height: u32) -> Self {
        Self {
            name: format!("virtual-{width}x{height}"),
            width,
            height,
            refresh_hz: 60,
            max_scale: 4.0,
            formats: vec![
                fourcc(b"XR24"),
                fourcc(b"RG16"),
                fourcc(b"YUYV"),
                fourcc(b"NV12"),
            ],
            framebuffers: HashMap::new(),
            next_fb: 100,
            next_commit: 1,
            shared: Arc::new(Shared {
                scanout: Mutex::new(Scanout::default()),
                tracker: CommitTracker::default(),
                reject_next: AtomicU32::new(0),
                epoch: Instant::now(),
            }),
            timer: None,
        }
    }

    /// A card with a vblank timer thread at `refresh_hz`.
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Result<Self> {
        let mut card = Self::manual(width, height);
        card.refresh_hz = refresh_hz.max(1);

        let period = Duration::from_secs(1) / card.refresh_hz;
        let shared = card.shared.clone();
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("virtual-vblank".into())
            .spawn(move || {
                let mut next = Instant::now() + period;
                while let Err(flume::RecvTimeoutError::Timeout) = stop_rx.recv_deadline(next) {
                    shared.vblank();
                    next += period;
                }
            })
            .map_err(|err| Error::device("spawn vblank thread", err))?;

        card.timer = Some((stop_tx, thread));
        Ok(card)
    }

    /// Largest destination size relative to the display the plane accepts.
    pub fn with_max_scale(mut self, max_scale: f32) -> Self {
        self.max_scale = max_scale;
        self
    }

    pub fn vblank(&self) -> VirtualVblank {
        VirtualVblank {
            shared: self.shared.clone(),
        }
    }

    pub fn connector_id(&self) -> ConnectorId {
        CONNECTOR
    }

    pub fn pipe_id(&self) -> PipeId {
        PIPE
    }

    fn mode(&self) -> Mode {
        Mode {
            name: format!("{}x{}", self.width, self.height),
            width: self.width,
            height: self.height,
            refresh: self.refresh_hz,
        }
    }

    fn validate(&self, request: &AtomicCommitRequest) -> std::result::Result<FramebufferId, DeviceError> {
        let invalid = |message: String| DeviceError::new(libc::EINVAL, message);

        if request.plane != PLANE {
            return Err(invalid(format!("unknown plane {}", request.plane)));
        }
        if request.get(PlaneProperty::CrtcId) != Some(u64::from(PIPE.0)) {
            return Err(invalid("plane can only be attached to pipe 2".into()));
        }
        let fb = request
            .get(PlaneProperty::FbId)
            .and_then(|raw| u32::try_from(raw).ok())
            .map(FramebufferId)
            .ok_or_else(|| invalid("missing FB_ID".into()))?;
        let framebuffer = self
            .framebuffers
            .get(&fb)
            .ok_or_else(|| invalid(format!("unknown framebuffer {fb}")))?;
        if !self.formats.contains(&framebuffer.format) {
            return Err(invalid(format!(
                "format {} not supported by plane",
                crate::capture::frame::fourcc_to_string(framebuffer.format)
            )));
        }

        let get = |p| request.get(p).unwrap_or(0);
        let (src_w, src_h) = (get(PlaneProperty::SrcW) >> 16, get(PlaneProperty::SrcH) >> 16);
        if src_w > u64::from(framebuffer.width) || src_h > u64::from(framebuffer.height) {
            return Err(DeviceError::new(libc::ENOSPC, "source rectangle exceeds framebuffer"));
        }
        let limit = |display: u32| (display as f32 * self.max_scale) as u64;
        if get(PlaneProperty::CrtcW) > limit(self.width)
            || get(PlaneProperty::CrtcH) > limit(self.height)
        {
            return Err(DeviceError::new(
                libc::ERANGE,
                format!("destination exceeds {}x scaling limit", self.max_scale),
            ));
        }
        Ok(fb)
    }
}

impl DisplayDevice for VirtualCard {
    fn name(&self) -> &str {
        &self.name
    }

    fn connectors(&self) -> std::result::Result<Vec<ConnectorInfo>, DeviceError> {
        Ok(vec![ConnectorInfo {
            id: CONNECTOR,
            name: "Virtual-1".into(),
            connected: true,
            pipe: Some(PIPE),
            mm_width: 0,
            mm_height: 0,
            subpixel: "unknown",
            modes: vec![self.mode()],
        }])
    }

    fn pipe(&self, pipe: PipeId) -> std::result::Result<PipeInfo, DeviceError> {
        if pipe != PIPE {
            return Err(DeviceError::new(libc::ENOENT, format!("no pipe {pipe}")));
        }
        Ok(PipeInfo {
            id: PIPE,
            active: true,
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
            mode: Some(self.mode()),
        })
    }

    fn planes(&self) -> std::result::Result<Vec<PlaneInfo>, DeviceError> {
        let (framebuffer, position) = self
            .shared
            .scanout
            .lock()
            .map(|s| (s.on_screen, s.position))
            .unwrap_or_default();
        Ok(vec![PlaneInfo {
            id: PLANE,
            pipe: Some(PIPE),
            possible_pipes: vec![PIPE],
            framebuffer,
            position,
            kind: PlaneKind::Primary,
            formats: self.formats.clone(),
        }])
    }

    fn import_buffer(&mut self, buffer: &Buffer) -> Result<FramebufferId> {
        let format = buffer.format().drm_fourcc().ok_or_else(|| {
            Error::Configuration(format!("{:?} has no scanout format", buffer.format()))
        })?;
        let fb = FramebufferId(self.next_fb);
        self.next_fb += 1;
        self.framebuffers.insert(
            fb,
            Framebuffer {
                width: buffer.width(),
                height: buffer.height(),
                format,
            },
        );
        Ok(fb)
    }

    fn release_framebuffer(&mut self, fb: FramebufferId) -> std::result::Result<(), DeviceError> {
        self.framebuffers
            .remove(&fb)
            .map(|_| ())
            .ok_or_else(|| DeviceError::new(libc::ENOENT, format!("no framebuffer {fb}")))
    }

    fn atomic_commit(
        &mut self,
        request: &AtomicCommitRequest,
    ) -> std::result::Result<CommitHandle, CommitError> {
        let injected = self
            .shared
            .reject_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CommitError::Rejected(DeviceError::new(
                libc::EINVAL,
                "plane configuration not supported",
            )));
        }
        let fb = self.validate(request).map_err(CommitError::Rejected)?;

        let mut scanout = self.shared.scanout.lock().map_err(|_| {
            CommitError::Device(DeviceError::new(libc::EIO, "scanout state poisoned"))
        })?;
        if scanout.in_flight.is_some() {
            return Err(CommitError::Rejected(DeviceError::new(
                libc::EBUSY,
                "previous commit still pending",
            )));
        }
        let get = |p| request.get(p).unwrap_or(0);
        let position = (
            get(PlaneProperty::CrtcX) as i32,
            get(PlaneProperty::CrtcY) as i32,
            get(PlaneProperty::CrtcW) as u32,
            get(PlaneProperty::CrtcH) as u32,
        );
        let handle = CommitHandle(self.next_commit);
        self.next_commit += 1;
        scanout.in_flight = Some((handle, fb, position));
        scanout.commits.push(request.clone());
        debug!(handle = handle.0, %fb, "virtual commit accepted");
        Ok(handle)
    }

    fn set_commit_handler(&mut self, handler: CommitHandler) {
        self.shared.tracker.set_handler(handler);
    }

    fn wait_commit_done(
        &mut self,
        handle: CommitHandle,
        timeout: Duration,
    ) -> std::result::Result<CommitEvent, DeviceError> {
        self.shared.tracker.wait(handle, timeout)
    }
}

impl Drop for VirtualCard {
    fn drop(&mut self) {
        if let Some((stop, thread)) = self.timer.take() {
            let _ = stop.send(());
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::pipeline::pool::{BufferId, BufferPool};
    use crate::pipeline::testing::HeapAllocator;

    fn request(fb: FramebufferId, size: (u64, u64)) -> AtomicCommitRequest {
        let mut request = AtomicCommitRequest::new(PLANE);
        request
            .add(PlaneProperty::CrtcId, u64::from(PIPE.0))
            .add(PlaneProperty::FbId, u64::from(fb.0))
            .add(PlaneProperty::CrtcW, size.0)
            .add(PlaneProperty::CrtcH, size.1)
            .add(PlaneProperty::SrcW, size.0 << 16)
            .add(PlaneProperty::SrcH, size.1 << 16);
        request
    }

    fn imported(card: &mut VirtualCard, format: PixelFormat, w: u32, h: u32) -> FramebufferId {
        let pool = BufferPool::create(&mut HeapAllocator::default(), 2, format, w, h).unwrap();
        card.import_buffer(pool.buffer(BufferId(0)).unwrap()).unwrap()
    }

    #[test]
    fn scaling_beyond_limit_is_rejected() {
        let mut card = VirtualCard::manual(640, 480).with_max_scale(1.0);
        let fb = imported(&mut card, PixelFormat::Xrgb8888, 1280, 720);
        let err = card.atomic_commit(&request(fb, (1280, 720))).unwrap_err();
        assert!(matches!(err, CommitError::Rejected(e) if e.code == libc::ERANGE));
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let mut card = VirtualCard::manual(640, 480);
        card.formats = vec![fourcc(b"XR24")];
        let fb = imported(&mut card, PixelFormat::Nv12, 320, 240);
        let err = card.atomic_commit(&request(fb, (320, 240))).unwrap_err();
        assert!(matches!(err, CommitError::Rejected(e) if e.code == libc::EINVAL));
    }

    #[test]
    fn injected_rejections_are_consumed() {
        let mut card = VirtualCard::manual(640, 480);
        let vblank = card.vblank();
        let fb = imported(&mut card, PixelFormat::Xrgb8888, 320, 240);

        vblank.reject_next(1);
        assert!(card.atomic_commit(&request(fb, (320, 240))).is_err());
        assert!(card.atomic_commit(&request(fb, (320, 240))).is_ok());
        assert_eq!(vblank.commits().len(), 1);
    }

    #[test]
    fn timer_completes_commits_without_help() {
        let mut card = VirtualCard::new(640, 480, 120).unwrap();
        let fb = imported(&mut card, PixelFormat::Xrgb8888, 320, 240);
        let handle = card.atomic_commit(&request(fb, (320, 240))).unwrap();

        let event = card
            .wait_commit_done(handle, Duration::from_secs(2))
            .unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(card.planes().unwrap()[0].framebuffer, Some(fb));
    }

    #[test]
    fn releasing_unknown_framebuffer_fails() {
        let mut card = VirtualCard::manual(640, 480);
        let err = card.release_framebuffer(FramebufferId(7)).unwrap_err();
        assert_eq!(err.code, libc::ENOENT);
    }
}
