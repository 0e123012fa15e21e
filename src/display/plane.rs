//! One compositor plane driven by atomic commits

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::display::{
    AtomicCommitRequest, CommitError, CommitEvent, CommitHandle, ConnectorId, DisplayDevice,
    FramebufferId, PipeId, PlaneGeometry, PlaneId, PlaneKind, PlaneProperty,
};
use crate::error::{Error, Result};
use crate::pipeline::pool::{Buffer, BufferId, BufferPool};

pub struct DisplayPlane<D> {
    device: D,
    connector: ConnectorId,
    pipe: PipeId,
    plane: PlaneId,
    width: u32,
    height: u32,
    /// Indexed by buffer id
    framebuffers: Vec<Option<FramebufferId>>,
}

impl<D: DisplayDevice> DisplayPlane<D> {
    /// Takes over a plane already attached to `pipe`, preferring the primary
    /// plane since it is the one known to be scanning out.
    #[instrument(skip(device), fields(card = device.name()))]
    pub fn bind(device: D, connector: ConnectorId, pipe: PipeId) -> Result<Self> {
        let info = device.pipe(pipe).map_err(|err| Error::device("get pipe", err))?;
        if !info.active || info.width == 0 || info.height == 0 {
            return Err(Error::NoPlaneAvailable { connector, pipe });
        }

        let planes = device
            .planes()
            .map_err(|err| Error::device("get planes", err))?;
        let plane = planes
            .iter()
            .filter(|p| p.pipe == Some(pipe))
            .min_by_key(|p| match p.kind {
                PlaneKind::Primary => 0,
                PlaneKind::Overlay => 1,
                PlaneKind::Cursor => 2,
            })
            .ok_or(Error::NoPlaneAvailable { connector, pipe })?;

        info!(
            plane = %plane.id,
            kind = ?plane.kind,
            width = info.width,
            height = info.height,
            "display plane bound"
        );

        Ok(Self {
            connector,
            pipe,
            plane: plane.id,
            width: info.width,
            height: info.height,
            framebuffers: Vec::new(),
            device,
        })
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub fn pipe(&self) -> PipeId {
        self.pipe
    }

    pub fn plane(&self) -> PlaneId {
        self.plane
    }

    pub fn display_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn framebuffer(&self, id: BufferId) -> Option<FramebufferId> {
        self.framebuffers.get(id.index()).copied().flatten()
    }

    /// Registers one pool buffer as a scanout framebuffer.
    pub fn import(&mut self, buffer: &Buffer) -> Result<FramebufferId> {
        if buffer.format().drm_fourcc().is_none() {
            return Err(Error::Configuration(format!(
                "{:?} buffers cannot be scanned out",
                buffer.format()
            )));
        }
        let fb = self.device.import_buffer(buffer)?;

        let index = buffer.id().index();
        if self.framebuffers.len() <= index {
            self.framebuffers.resize(index + 1, None);
        }
        if let Some(old) = self.framebuffers[index].replace(fb) {
            self.release(old);
        }
        debug!(buffer = %buffer.id(), fb = %fb, "buffer imported");
        Ok(fb)
    }

    pub fn import_pool(&mut self, pool: &BufferPool) -> Result<()> {
        for buffer in pool.buffers() {
            self.import(buffer)?;
        }
        Ok(())
    }

    pub fn compute_geometry(
        display_width: u32,
        display_height: u32,
        buffer_width: u32,
        buffer_height: u32,
    ) -> PlaneGeometry {
        PlaneGeometry::centered(display_width, display_height, buffer_width, buffer_height)
    }

    /// Switches the plane to `buffer` in one nonblocking atomic commit.
    pub fn commit(&mut self, buffer: BufferId, geometry: &PlaneGeometry) -> Result<CommitHandle> {
        let fb = self.framebuffer(buffer).ok_or_else(|| {
            Error::Configuration(format!("buffer {buffer} was never imported"))
        })?;

        let mut request = AtomicCommitRequest::new(self.plane);
        request
            .add(PlaneProperty::CrtcId, u64::from(self.pipe.0))
            .add(PlaneProperty::FbId, u64::from(fb.0));
        geometry.apply(&mut request);

        match self.device.atomic_commit(&request) {
            Ok(handle) => {
                debug!(%buffer, fb = %fb, handle = handle.0, "commit submitted");
                Ok(handle)
            }
            Err(CommitError::Rejected(source)) => Err(Error::CommitRejected(source)),
            Err(CommitError::Device(source)) => Err(Error::Device {
                op: "atomic commit",
                source,
            }),
        }
    }

    pub fn wait_commit_done(&mut self, handle: CommitHandle, timeout: Duration) -> Result<CommitEvent> {
        self.device
            .wait_commit_done(handle, timeout)
            .map_err(|err| Error::device("wait for commit", err))
    }

    /// `handler` runs on the device's event thread.
    pub fn on_commit_done<F>(&mut self, handler: F)
    where
        F: Fn(CommitEvent) + Send + Sync + 'static,
    {
        self.device.set_commit_handler(Arc::new(handler));
    }

    pub fn release_framebuffers(&mut self) {
        let framebuffers: Vec<_> = self.framebuffers.drain(..).flatten().collect();
        for fb in framebuffers {
            self.release(fb);
        }
    }

    fn release(&mut self, fb: FramebufferId) {
        if let Err(err) = self.device.release_framebuffer(fb) {
            warn!(%fb, %err, "failed to release framebuffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::display::{VirtualCard, VirtualVblank};
    use crate::pipeline::testing::HeapAllocator;

    fn bound() -> (DisplayPlane<VirtualCard>, VirtualVblank, BufferPool) {
        let card = VirtualCard::manual(1920, 1080);
        let vblank = card.vblank();
        let (connector, pipe) = (card.connector_id(), card.pipe_id());
        let mut plane = DisplayPlane::bind(card, connector, pipe).unwrap();
        let pool = BufferPool::create(
            &mut HeapAllocator::default(),
            3,
            PixelFormat::Xrgb8888,
            640,
            480,
        )
        .unwrap();
        plane.import_pool(&pool).unwrap();
        (plane, vblank, pool)
    }

    #[test]
    fn bind_fails_without_a_plane_on_the_pipe() {
        let card = VirtualCard::manual(1920, 1080);
        let connector = card.connector_id();
        let err = DisplayPlane::bind(card, connector, PipeId(999)).err().unwrap();
        assert!(matches!(err, Error::Device { .. } | Error::NoPlaneAvailable { .. }));
    }

    #[test]
    fn bind_reads_active_mode_size() {
        let (plane, _, _) = bound();
        assert_eq!(plane.display_size(), (1920, 1080));
    }

    #[test]
    fn compressed_buffers_cannot_be_imported() {
        let (mut plane, _, _) = bound();
        let pool = BufferPool::create(
            &mut HeapAllocator {
                raw_size: Some(4096),
                ..Default::default()
            },
            2,
            PixelFormat::Mjpeg,
            640,
            480,
        )
        .unwrap();
        let err = plane.import(pool.buffer(BufferId(0)).unwrap()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn commit_writes_every_plane_property() {
        let (mut plane, vblank, _pool) = bound();
        let geometry = DisplayPlane::<VirtualCard>::compute_geometry(1920, 1080, 640, 480);
        let handle = plane.commit(BufferId(1), &geometry).unwrap();

        let commits = vblank.commits();
        assert_eq!(commits.len(), 1);
        let request = &commits[0];
        assert_eq!(request.writes().len(), 10);
        assert_eq!(request.get(PlaneProperty::CrtcId), Some(u64::from(plane.pipe().0)));
        assert_eq!(
            request.get(PlaneProperty::FbId),
            plane.framebuffer(BufferId(1)).map(|fb| u64::from(fb.0))
        );
        assert_eq!(request.get(PlaneProperty::CrtcX), Some(640));
        assert_eq!(request.get(PlaneProperty::CrtcY), Some(300));

        assert!(vblank.fire());
        let event = plane.wait_commit_done(handle, Duration::from_secs(1)).unwrap();
        assert_eq!(event.handle, handle);
    }

    #[test]
    fn second_commit_before_vblank_is_rejected() {
        let (mut plane, vblank, _pool) = bound();
        let geometry = PlaneGeometry::centered(1920, 1080, 640, 480);
        plane.commit(BufferId(0), &geometry).unwrap();

        let err = plane.commit(BufferId(1), &geometry).unwrap_err();
        assert!(matches!(err, Error::CommitRejected(_)));
        assert_eq!(vblank.on_screen(), None);

        vblank.fire();
        assert_eq!(vblank.on_screen(), plane.framebuffer(BufferId(0)));
    }

    #[test]
    fn commit_done_handler_runs_on_vblank() {
        let (mut plane, vblank, _pool) = bound();
        let (tx, rx) = flume::unbounded();
        plane.on_commit_done(move |event| {
            let _ = tx.send(event.handle);
        });

        let handle = plane
            .commit(BufferId(2), &PlaneGeometry::centered(1920, 1080, 640, 480))
            .unwrap();
        vblank.fire();
        assert_eq!(rx.try_recv().unwrap(), handle);
    }

    #[test]
    fn unimported_buffer_is_a_configuration_error() {
        let (mut plane, _, _) = bound();
        plane.release_framebuffers();
        let err = plane
            .commit(BufferId(0), &PlaneGeometry::centered(1920, 1080, 640, 480))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
