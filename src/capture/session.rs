//! Capture stream lifecycle on top of a [`CaptureDevice`]

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureRequest, ConfigStatus, QueueError, RequestId,
    StreamConfig, StreamRole,
};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{BufferId, BufferPool};

pub struct CaptureSession<C> {
    device: C,
    config: Option<StreamConfig>,
    pool: Option<Arc<BufferPool>>,
    next_request: u64,
    running: bool,
}

impl<C: CaptureDevice> CaptureSession<C> {
    pub fn new(device: C) -> Self {
        Self {
            device,
            config: None,
            pool: None,
            next_request: 0,
            running: false,
        }
    }

    pub fn device(&self) -> &C {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut C {
        &mut self.device
    }

    pub fn stream_config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Negotiates the stream format. An adjusted proposal is accepted but the
    /// caller must re-check it against what the display can present.
    #[instrument(skip(self), fields(device = self.device.name()))]
    pub fn configure(&mut self, role: StreamRole) -> Result<StreamConfig> {
        let (config, status) = self.device.configure(role)?;
        match status {
            ConfigStatus::Valid => debug!(%config, "stream configuration valid"),
            ConfigStatus::Adjusted => info!(%config, "camera configuration adjusted"),
            ConfigStatus::Invalid => {
                return Err(Error::Configuration(format!(
                    "{} rejected {role:?} configuration {config}",
                    self.device.name()
                )))
            }
        }
        self.config = Some(config.clone());
        Ok(config)
    }

    /// Allocates a pool in the negotiated format from the device's memory.
    pub fn allocate_pool(&mut self, count: usize) -> Result<Arc<BufferPool>> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::Configuration("stream not configured".into()))?;
        let pool = BufferPool::create(
            &mut self.device,
            count,
            config.format,
            config.width,
            config.height,
        )?;
        Ok(Arc::new(pool))
    }

    /// Registers the handler invoked once per completed request, on the
    /// device's notification thread.
    pub fn on_completion<F>(&mut self, handler: F)
    where
        F: Fn(CaptureEvent) + Send + Sync + 'static,
    {
        self.device.set_completion_handler(Arc::new(handler));
    }

    /// Hands every pool buffer to the device and starts the capture clock.
    #[instrument(skip_all, fields(device = self.device.name(), buffers = pool.len()))]
    pub fn start(&mut self, pool: Arc<BufferPool>) -> Result<()> {
        if self.running {
            return Err(Error::DeviceStart {
                op: "start",
                source: DeviceError::new(libc::EBUSY, "capture session already running"),
            });
        }
        self.pool = Some(pool.clone());

        for id in pool.ids() {
            pool.mark_owned_by_capture(id)?;
            if let Err(err) = self.submit(id) {
                pool.mark_free(id)?;
                let source = match err {
                    QueueError::Full => DeviceError::new(
                        libc::ENOBUFS,
                        format!("device queue can't hold {} buffers", pool.len()),
                    ),
                    QueueError::Device(source) => source,
                };
                self.abort_start();
                return Err(Error::DeviceStart {
                    op: "queue request",
                    source,
                });
            }
        }

        if let Err(source) = self.device.start() {
            self.abort_start();
            return Err(Error::DeviceStart { op: "start", source });
        }

        self.running = true;
        info!("capture started");
        Ok(())
    }

    /// Wraps a free buffer in a new request. On `QueueFull` the buffer stays
    /// `Free` and the caller retries on the next cycle.
    pub fn resubmit(&mut self, id: BufferId) -> Result<()> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| Error::Configuration("capture session not started".into()))?;

        pool.mark_owned_by_capture(id)?;
        match self.submit(id) {
            Ok(()) => Ok(()),
            Err(QueueError::Full) => {
                pool.mark_free(id)?;
                Err(Error::QueueFull(id))
            }
            Err(QueueError::Device(source)) => {
                pool.mark_free(id)?;
                Err(Error::Device {
                    op: "queue request",
                    source,
                })
            }
        }
    }

    /// Halts the clock. Requests still queued come back as cancelled
    /// completions. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        info!(device = self.device.name(), "stopping capture");
        self.device.stop().map_err(|source| Error::Device { op: "stop", source })
    }

    fn submit(&mut self, buffer: BufferId) -> std::result::Result<(), QueueError> {
        let stream = self.config.as_ref().map(|c| c.role).unwrap_or_default();
        let request = CaptureRequest {
            id: RequestId(self.next_request),
            buffer,
            stream,
        };
        self.next_request += 1;
        self.device.queue_request(request)
    }

    // Requests queued before a failed start are cancelled by the device.
    fn abort_start(&mut self) {
        if let Err(err) = self.device.stop() {
            warn!(%err, "device stop after failed start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CompletionStatus;
    use crate::pipeline::pool::Ownership;
    use crate::pipeline::testing::FakeCamera;

    fn configured(camera: FakeCamera) -> (CaptureSession<FakeCamera>, Arc<BufferPool>) {
        let mut session = CaptureSession::new(camera);
        session.configure(StreamRole::Viewfinder).unwrap();
        let pool = session.allocate_pool(4).unwrap();
        (session, pool)
    }

    #[test]
    fn adjusted_configuration_is_accepted() {
        let camera = FakeCamera::new(640, 480).with_status(ConfigStatus::Adjusted);
        let mut session = CaptureSession::new(camera);
        let config = session.configure(StreamRole::Viewfinder).unwrap();
        assert_eq!((config.width, config.height), (640, 480));
    }

    #[test]
    fn invalid_configuration_fails() {
        let camera = FakeCamera::new(640, 480).with_status(ConfigStatus::Invalid);
        let mut session = CaptureSession::new(camera);
        let err = session.configure(StreamRole::Raw).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(session.stream_config().is_none());
    }

    #[test]
    fn start_submits_every_buffer() {
        let (mut session, pool) = configured(FakeCamera::new(640, 480));
        session.start(pool.clone()).unwrap();

        assert!(session.is_running());
        assert_eq!(session.device().log.queued_buffers().len(), 4);
        assert_eq!(pool.census().capture, 4);
    }

    #[test]
    fn second_start_is_rejected() {
        let (mut session, pool) = configured(FakeCamera::new(640, 480));
        session.start(pool.clone()).unwrap();
        let err = session.start(pool).unwrap_err();
        assert!(matches!(err, Error::DeviceStart { .. }));
    }

    #[test]
    fn device_start_failure_cancels_queued_requests() {
        let camera = FakeCamera::new(640, 480);
        camera.log.fail_start(true);
        let (mut session, pool) = configured(camera);

        let err = session.start(pool.clone()).unwrap_err();
        assert!(matches!(err, Error::DeviceStart { op: "start", .. }));
        assert!(!session.is_running());
        assert_eq!(session.device().log.stop_calls(), 1);
        // buffers stay with capture until the cancellations are delivered
        assert_eq!(pool.census().capture, 4);
    }

    #[test]
    fn resubmit_reports_queue_full_and_frees_buffer() {
        let (mut session, pool) = configured(FakeCamera::new(640, 480));
        session.start(pool.clone()).unwrap();

        let id = BufferId(1);
        pool.mark_captured_pending(id).unwrap();
        pool.mark_free(id).unwrap();

        session.device().log.set_queue_full(true);
        let err = session.resubmit(id).unwrap_err();
        assert!(matches!(err, Error::QueueFull(b) if b == id));
        assert_eq!(pool.state(id), Ownership::Free);

        session.device().log.set_queue_full(false);
        session.resubmit(id).unwrap();
        assert_eq!(pool.state(id), Ownership::OwnedByCapture);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut session, pool) = configured(FakeCamera::new(640, 480));
        session.start(pool).unwrap();

        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.device().log.stop_calls(), 1);
    }

    #[test]
    fn completion_handler_reaches_device() {
        let (mut session, _pool) = configured(FakeCamera::new(640, 480));
        let (tx, rx) = flume::unbounded();
        session.on_completion(move |event| {
            let _ = tx.send(event);
        });

        session.device().emit(CaptureEvent::Completed(
            session.device().completion(BufferId(0), CompletionStatus::Complete),
        ));
        assert!(matches!(rx.try_recv(), Ok(CaptureEvent::Completed(_))));
    }
}
