pub mod geometry;
pub mod kms;
pub mod plane;
pub mod virtual_card;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::{DeviceError, Result};
use crate::pipeline::pool::Buffer;

pub use geometry::PlaneGeometry;
pub use kms::KmsCard;
pub use plane::DisplayPlane;
pub use virtual_card::{VirtualCard, VirtualVblank};

macro_rules! object_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

object_id!(ConnectorId);
object_id!(PipeId);
object_id!(PlaneId);
object_id!(FramebufferId);

/// Identifies one submitted atomic commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mode {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub name: String,
    pub connected: bool,
    /// Pipe currently driving this connector
    pub pipe: Option<PipeId>,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: &'static str,
    pub modes: Vec<Mode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    pub id: PipeId,
    pub active: bool,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub mode: Option<Mode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Overlay,
    Primary,
    Cursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    pub id: PlaneId,
    /// Pipe the plane is attached to right now
    pub pipe: Option<PipeId>,
    pub possible_pipes: Vec<PipeId>,
    pub framebuffer: Option<FramebufferId>,
    /// Destination rectangle as `(x, y, width, height)` when known
    pub position: Option<(i32, i32, u32, u32)>,
    pub kind: PlaneKind,
    pub formats: Vec<u32>,
}

/// Plane properties written by a handoff commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneProperty {
    CrtcId,
    FbId,
    CrtcX,
    CrtcY,
    CrtcW,
    CrtcH,
    SrcX,
    SrcY,
    SrcW,
    SrcH,
}

impl PlaneProperty {
    pub fn name(self) -> &'static str {
        match self {
            Self::CrtcId => "CRTC_ID",
            Self::FbId => "FB_ID",
            Self::CrtcX => "CRTC_X",
            Self::CrtcY => "CRTC_Y",
            Self::CrtcW => "CRTC_W",
            Self::CrtcH => "CRTC_H",
            Self::SrcX => "SRC_X",
            Self::SrcY => "SRC_Y",
            Self::SrcW => "SRC_W",
            Self::SrcH => "SRC_H",
        }
    }
}

/// Property writes for one plane, applied all together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicCommitRequest {
    pub plane: PlaneId,
    writes: Vec<(PlaneProperty, u64)>,
}

impl AtomicCommitRequest {
    pub fn new(plane: PlaneId) -> Self {
        Self {
            plane,
            writes: Vec::with_capacity(10),
        }
    }

    /// Adds or replaces one property write.
    pub fn add(&mut self, property: PlaneProperty, value: u64) -> &mut Self {
        match self.writes.iter_mut().find(|(p, _)| *p == property) {
            Some(write) => write.1 = value,
            None => self.writes.push((property, value)),
        }
        self
    }

    pub fn get(&self, property: PlaneProperty) -> Option<u64> {
        self.writes
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, v)| *v)
    }

    pub fn writes(&self) -> &[(PlaneProperty, u64)] {
        &self.writes
    }
}

/// Confirmation that a commit is visible on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEvent {
    pub handle: CommitHandle,
    pub sequence: u32,
    pub timestamp: Duration,
}

pub type CommitHandler = Arc<dyn Fn(CommitEvent) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum CommitError {
    /// The hardware can't apply this combination; nothing changed
    #[error("commit rejected: {0}")]
    Rejected(DeviceError),
    #[error(transparent)]
    Device(DeviceError),
}

/// Display hardware as seen by [`DisplayPlane`].
pub trait DisplayDevice: Send {
    fn name(&self) -> &str;

    fn connectors(&self) -> std::result::Result<Vec<ConnectorInfo>, DeviceError>;

    fn pipe(&self, pipe: PipeId) -> std::result::Result<PipeInfo, DeviceError>;

    fn planes(&self) -> std::result::Result<Vec<PlaneInfo>, DeviceError>;

    /// Makes a pool buffer scanout-capable without copying it.
    fn import_buffer(&mut self, buffer: &Buffer) -> Result<FramebufferId>;

    fn release_framebuffer(&mut self, fb: FramebufferId) -> std::result::Result<(), DeviceError>;

    /// Submits without waiting; completion arrives as a [`CommitEvent`].
    fn atomic_commit(
        &mut self,
        request: &AtomicCommitRequest,
    ) -> std::result::Result<CommitHandle, CommitError>;

    fn set_commit_handler(&mut self, handler: CommitHandler);

    fn wait_commit_done(
        &mut self,
        handle: CommitHandle,
        timeout: Duration,
    ) -> std::result::Result<CommitEvent, DeviceError>;
}

const TRACKED_COMMITS: usize = 64;

/// Records commit completions from a device event thread so they can be both
/// waited on and forwarded to a handler.
#[derive(Default)]
pub struct CommitTracker {
    done: Mutex<VecDeque<CommitEvent>>,
    signal: Condvar,
    handler: Mutex<Option<CommitHandler>>,
}

impl CommitTracker {
    pub fn set_handler(&self, handler: CommitHandler) {
        if let Ok(mut slot) = self.handler.lock() {
            *slot = Some(handler);
        }
    }

    pub fn complete(&self, event: CommitEvent) {
        if let Ok(mut done) = self.done.lock() {
            if done.len() == TRACKED_COMMITS {
                done.pop_front();
            }
            done.push_back(event);
        }
        self.signal.notify_all();

        let handler = self.handler.lock().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(event);
        }
    }

    pub fn wait(
        &self,
        handle: CommitHandle,
        timeout: Duration,
    ) -> std::result::Result<CommitEvent, DeviceError> {
        let poisoned = || DeviceError::new(libc::EIO, "commit tracker poisoned");
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().map_err(|_| poisoned())?;
        loop {
            if let Some(pos) = done.iter().position(|e| e.handle == handle) {
                return done.remove(pos).ok_or_else(poisoned);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DeviceError::new(
                    libc::ETIMEDOUT,
                    format!("commit {} not confirmed within {timeout:?}", handle.0),
                ));
            }
            done = self
                .signal
                .wait_timeout(done, deadline - now)
                .map_err(|_| poisoned())?
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_writes_replace_earlier_ones() {
        let mut req = AtomicCommitRequest::new(PlaneId(31));
        req.add(PlaneProperty::FbId, 1).add(PlaneProperty::FbId, 2);
        assert_eq!(req.get(PlaneProperty::FbId), Some(2));
        assert_eq!(req.writes().len(), 1);
    }

    #[test]
    fn tracker_wakes_waiter_and_handler() {
        let tracker = Arc::new(CommitTracker::default());
        let (tx, rx) = flume::unbounded();
        tracker.set_handler(Arc::new(move |event| {
            let _ = tx.send(event.handle);
        }));

        let completer = tracker.clone();
        let thread = std::thread::spawn(move || {
            completer.complete(CommitEvent {
                handle: CommitHandle(7),
                sequence: 1,
                timestamp: Duration::ZERO,
            });
        });

        let event = tracker.wait(CommitHandle(7), Duration::from_secs(2)).unwrap();
        thread.join().unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(rx.try_recv().unwrap(), CommitHandle(7));
    }

    #[test]
    fn tracker_wait_times_out() {
        let tracker = CommitTracker::default();
        let err = tracker
            .wait(CommitHandle(1), Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.code, libc::ETIMEDOUT);
    }
}
