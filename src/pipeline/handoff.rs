//! Capture-to-scanout handoff.
//!
//! Every device notification lands in one channel and is handled on a single
//! task, so the commit in flight, the queued frame and the pool transitions
//! never race each other. At most one commit is outstanding; buffers return to
//! capture only after the commit that replaced them on screen is confirmed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::{
    CaptureDevice, CaptureEvent, CaptureSession, CompletedBuffer, CompletionStatus, StreamRole,
};
use crate::display::{CommitEvent, CommitHandle, DisplayDevice, DisplayPlane, PlaneGeometry};
use crate::error::{DeviceError, Error, Result};
use crate::pipeline::pool::{BufferId, BufferPool, Census};

/// Everything the handoff loop reacts to.
#[derive(Debug)]
pub enum PipelineEvent {
    Capture(CaptureEvent),
    CommitDone(CommitEvent),
    /// Retry resubmitting free buffers after the capture queue was full
    Refill,
    Stop,
}

/// Cloneable way to stop a running pipeline from another task or thread.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: flume::Sender<PipelineEvent>,
}

impl PipelineHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(PipelineEvent::Stop);
    }
}

/// Backoff before free buffers are offered to a full capture queue again.
const QUEUE_FULL_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    /// No new commits; waiting for capture and the last commit to drain
    Stopping,
    Stopped,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub completions: u64,
    pub commits: u64,
    /// Commits that retired a previously displayed buffer
    pub flips: u64,
    pub rejected: u64,
    pub superseded: u64,
    pub queue_full: u64,
    pub cancelled: u64,
    pub geometry_warnings: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub role: StreamRole,
    pub buffer_count: usize,
    pub drain_timeout: Duration,
    pub commit_timeout: Duration,
    pub frame_limit: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            role: StreamRole::Viewfinder,
            buffer_count: 4,
            drain_timeout: Duration::from_secs(2),
            commit_timeout: Duration::from_secs(1),
            frame_limit: None,
        }
    }
}

struct InFlight {
    handle: CommitHandle,
    buffer: BufferId,
    submitted: Instant,
}

pub struct HandoffPipeline<C, D> {
    capture: CaptureSession<C>,
    plane: DisplayPlane<D>,
    pool: Arc<BufferPool>,
    options: PipelineOptions,
    state: PipelineState,
    geometry: Option<PlaneGeometry>,
    in_flight: Option<InFlight>,
    queued: Option<BufferId>,
    drain_deadline: Option<Instant>,
    refill_at: Option<Instant>,
    stats: PipelineStats,
    tx: flume::Sender<PipelineEvent>,
    rx: flume::Receiver<PipelineEvent>,
}

impl<C: CaptureDevice, D: DisplayDevice> HandoffPipeline<C, D> {
    /// Negotiates the camera format, allocates the pool and imports every
    /// buffer into the display before anything streams.
    #[instrument(skip_all, fields(camera = camera.name(), card = plane.device().name()))]
    pub fn setup(camera: C, mut plane: DisplayPlane<D>, options: PipelineOptions) -> Result<Self> {
        let mut capture = CaptureSession::new(camera);
        let config = capture.configure(options.role)?;
        if config.format.drm_fourcc().is_none() {
            return Err(Error::Configuration(format!(
                "camera delivers {:?}, which no plane can scan out",
                config.format
            )));
        }

        let pool = capture.allocate_pool(options.buffer_count)?;
        if let Err(err) = plane.import_pool(&pool) {
            plane.release_framebuffers();
            return Err(err);
        }

        let (tx, rx) = flume::unbounded();
        let events = tx.clone();
        capture.on_completion(move |event| {
            let _ = events.send(PipelineEvent::Capture(event));
        });
        let events = tx.clone();
        plane.on_commit_done(move |event| {
            let _ = events.send(PipelineEvent::CommitDone(event));
        });

        info!(%config, buffers = pool.len(), "handoff pipeline ready");
        Ok(Self {
            capture,
            plane,
            pool,
            options,
            state: PipelineState::Idle,
            geometry: None,
            in_flight: None,
            queued: None,
            drain_deadline: None,
            refill_at: None,
            stats: PipelineStats::default(),
            tx,
            rx,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn census(&self) -> Census {
        self.pool.census()
    }

    pub fn plane(&self) -> &DisplayPlane<D> {
        &self.plane
    }

    pub fn capture(&self) -> &CaptureSession<C> {
        &self.capture
    }

    /// Hands the whole pool to capture. A failure starts teardown.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(Error::DeviceStart {
                op: "start pipeline",
                source: DeviceError::new(libc::EBUSY, "pipeline already started"),
            });
        }
        self.state = PipelineState::Running;
        if let Err(err) = self.capture.start(self.pool.clone()) {
            self.abort(&err);
            return Err(err);
        }
        info!("handoff pipeline running");
        Ok(())
    }

    /// Runs until stopped, the frame limit is reached or a fatal error occurs.
    /// Teardown always completes before this returns.
    pub async fn run(&mut self) -> Result<PipelineStats> {
        let mut fatal = None;
        if self.state == PipelineState::Idle {
            if let Err(err) = self.start() {
                fatal = Some(err);
            }
        }

        while self.state != PipelineState::Stopped {
            let event = match self.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    let forced = self.pool.reclaim_all();
                    warn!(forced, "drain timed out, buffers reclaimed");
                    self.in_flight = None;
                    if let Err(err) = self.finish() {
                        fatal.get_or_insert(err);
                    }
                    break;
                }
                Err(err) => {
                    self.abort(&err);
                    fatal.get_or_insert(err);
                    continue;
                }
            };

            if let Err(err) = self.handle_event(event) {
                self.abort(&err);
                fatal.get_or_insert(err);
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(self.stats),
        }
    }

    /// Handles every event already queued without waiting for more.
    pub fn poll(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            handled += 1;
            if let Err(err) = self.handle_event(event) {
                self.abort(&err);
                return Err(err);
            }
        }
        Ok(handled)
    }

    pub fn handle_event(&mut self, event: PipelineEvent) -> Result<()> {
        match event {
            PipelineEvent::Capture(CaptureEvent::Completed(completed)) => self.on_capture(completed),
            PipelineEvent::Capture(CaptureEvent::Failed(source)) if source.code == libc::ENODEV => {
                Err(Error::Disconnected(source))
            }
            PipelineEvent::Capture(CaptureEvent::Failed(source)) => Err(Error::Device {
                op: "capture",
                source,
            }),
            PipelineEvent::CommitDone(event) => self.on_commit_done(event),
            PipelineEvent::Refill => {
                self.refill_at = None;
                if self.state == PipelineState::Running {
                    self.refill()?;
                }
                Ok(())
            }
            PipelineEvent::Stop => self.request_stop(),
        }
    }

    /// Stops issuing commits and halts capture. The pipeline reaches
    /// `Stopped` once outstanding requests and the last commit have drained.
    pub fn request_stop(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Idle => return self.finish(),
            PipelineState::Stopping | PipelineState::Stopped => return Ok(()),
            PipelineState::Running => {}
        }
        info!(census = ?self.pool.census(), "stopping handoff pipeline");
        self.begin_stop()?;
        self.check_drained()
    }

    fn on_capture(&mut self, completed: CompletedBuffer) -> Result<()> {
        let id = completed.buffer;
        self.pool.mark_captured_pending(id)?;

        if completed.status == CompletionStatus::Cancelled {
            self.stats.cancelled += 1;
            self.pool.mark_free(id)?;
            return self.check_drained();
        }
        if self.state != PipelineState::Running {
            self.pool.mark_free(id)?;
            return self.check_drained();
        }

        self.stats.completions += 1;
        metrics::counter!("twincam_frames_captured_total").increment(1);
        debug!(buffer = %id, sequence = completed.metadata.sequence, "frame captured");

        if self.in_flight.is_some() {
            if let Some(stale) = self.queued.replace(id) {
                self.stats.superseded += 1;
                metrics::counter!("twincam_frames_dropped_total").increment(1);
                debug!(buffer = %stale, "queued frame superseded");
                self.pool.mark_free(stale)?;
                self.recycle(stale)?;
            }
        } else {
            self.present(id)?;
        }

        if let Some(limit) = self.options.frame_limit {
            if self.stats.completions >= limit {
                info!(limit, "frame limit reached");
                self.request_stop()?;
            }
        }
        Ok(())
    }

    fn on_commit_done(&mut self, event: CommitEvent) -> Result<()> {
        let done = match self.in_flight.take() {
            Some(in_flight) if in_flight.handle == event.handle => in_flight,
            other => {
                self.in_flight = other;
                debug!(handle = event.handle.0, "commit event for no outstanding commit");
                return Ok(());
            }
        };
        metrics::histogram!("twincam_commit_latency_us")
            .record(done.submitted.elapsed().as_micros() as f64);

        if let Some(previous) = self.pool.promote_to_scanout(done.buffer)? {
            self.pool.mark_free(previous)?;
            self.stats.flips += 1;
            metrics::counter!("twincam_flips_total").increment(1);
        }
        debug!(buffer = %done.buffer, sequence = event.sequence, "buffer on screen");

        if self.state == PipelineState::Running {
            self.refill()?;
            if let Some(next) = self.queued.take() {
                self.present(next)?;
            }
        }
        self.check_drained()
    }

    /// Commits `id`; on rejection the frame is dropped and the buffer goes
    /// straight back to capture.
    fn present(&mut self, id: BufferId) -> Result<()> {
        let (width, height) = self
            .pool
            .buffer(id)
            .map(|b| (b.width(), b.height()))
            .ok_or_else(|| Error::Configuration(format!("buffer {id} is not in the pool")))?;
        let geometry = self.geometry_for(width, height);

        match self.plane.commit(id, &geometry) {
            Ok(handle) => {
                self.pool.mark_owned_by_display(id)?;
                self.in_flight = Some(InFlight {
                    handle,
                    buffer: id,
                    submitted: Instant::now(),
                });
                self.stats.commits += 1;
                metrics::counter!("twincam_commits_total").increment(1);
                Ok(())
            }
            Err(Error::CommitRejected(err)) => {
                self.stats.rejected += 1;
                metrics::counter!("twincam_commits_rejected_total").increment(1);
                warn!(buffer = %id, %err, "commit rejected, frame dropped");
                self.pool.mark_free(id)?;
                self.recycle(id)
            }
            Err(err) => {
                self.pool.mark_free(id)?;
                Err(err)
            }
        }
    }

    fn geometry_for(&mut self, buffer_width: u32, buffer_height: u32) -> PlaneGeometry {
        let (display_width, display_height) = self.plane.display_size();
        if let Some(geometry) = self
            .geometry
            .filter(|g| g.matches(display_width, display_height, buffer_width, buffer_height))
        {
            return geometry;
        }

        let geometry = DisplayPlane::<D>::compute_geometry(
            display_width,
            display_height,
            buffer_width,
            buffer_height,
        );
        match geometry.clamped {
            Some(warning) => {
                self.stats.geometry_warnings += 1;
                warn!(
                    %warning,
                    display = ?(display_width, display_height),
                    buffer = ?(buffer_width, buffer_height),
                    "buffer larger than display"
                );
            }
            None => debug!(dest = ?geometry.dest, "plane geometry updated"),
        }
        self.geometry = Some(geometry);
        geometry
    }

    fn recycle(&mut self, id: BufferId) -> Result<()> {
        if self.state != PipelineState::Running {
            return Ok(());
        }
        match self.capture.resubmit(id) {
            Err(Error::QueueFull(_)) => {
                debug!(buffer = %id, "capture queue full, buffer kept free");
                self.on_queue_full();
                Ok(())
            }
            other => other,
        }
    }

    /// Resubmits free buffers until the pool or the device queue runs out.
    fn refill(&mut self) -> Result<()> {
        while let Some(id) = self.pool.acquire_free() {
            match self.capture.resubmit(id) {
                Ok(()) => {}
                Err(Error::QueueFull(_)) => {
                    self.on_queue_full();
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// With nothing queued on the device and no commit outstanding, no event
    /// would ever come back to hand the free buffers over, so arm a retry.
    fn on_queue_full(&mut self) {
        self.stats.queue_full += 1;
        metrics::counter!("twincam_queue_full_total").increment(1);
        if self.in_flight.is_none() && self.pool.census().capture == 0 && self.refill_at.is_none() {
            debug!(after = ?QUEUE_FULL_RETRY, "capture starved, refill scheduled");
            self.refill_at = Some(Instant::now() + QUEUE_FULL_RETRY);
        }
    }

    async fn next_event(&self) -> Result<Option<PipelineEvent>> {
        let closed = || Error::device("receive event", DeviceError::new(libc::EPIPE, "event channel closed"));
        let recv = self.rx.recv_async();

        if self.state != PipelineState::Running {
            let deadline = self.drain_deadline.unwrap_or_else(Instant::now);
            return match tokio::time::timeout_at(deadline.into(), recv).await {
                Ok(event) => event.map(Some).map_err(|_| closed()),
                Err(_) => Ok(None),
            };
        }

        match &self.in_flight {
            Some(in_flight) => {
                let deadline = in_flight.submitted + self.options.commit_timeout;
                match tokio::time::timeout_at(deadline.into(), recv).await {
                    Ok(event) => event.map(Some).map_err(|_| closed()),
                    Err(_) => Err(Error::Device {
                        op: "wait for commit",
                        source: DeviceError::new(
                            libc::ETIMEDOUT,
                            format!(
                                "commit {} not confirmed within {:?}",
                                in_flight.handle.0, self.options.commit_timeout
                            ),
                        ),
                    }),
                }
            }
            None => match self.refill_at {
                Some(deadline) => match tokio::time::timeout_at(deadline.into(), recv).await {
                    Ok(event) => event.map(Some).map_err(|_| closed()),
                    Err(_) => Ok(Some(PipelineEvent::Refill)),
                },
                None => recv.await.map(Some).map_err(|_| closed()),
            },
        }
    }

    fn begin_stop(&mut self) -> Result<()> {
        if matches!(self.state, PipelineState::Stopping | PipelineState::Stopped) {
            return Ok(());
        }
        self.state = PipelineState::Stopping;
        self.drain_deadline = Some(Instant::now() + self.options.drain_timeout);
        self.refill_at = None;
        if let Some(id) = self.queued.take() {
            self.pool.mark_free(id)?;
        }
        let capture = &mut self.capture;
        off_runtime(|| capture.stop())
    }

    /// Fatal path: stop everything and let the drain run.
    fn abort(&mut self, err: &Error) {
        if matches!(err, Error::InvalidOwnershipTransition { .. }) {
            error!(%err, census = ?self.pool.census(), "buffer ownership violated");
        } else {
            error!(%err, code = ?err.code(), "handoff pipeline failed");
        }
        metrics::counter!("twincam_fatal_errors_total").increment(1);

        if let Err(stop_err) = self.begin_stop() {
            warn!(%stop_err, "teardown could not stop capture cleanly");
        }
        if let Err(drain_err) = self.check_drained() {
            warn!(%drain_err, "teardown could not release the pool");
        }
    }

    fn check_drained(&mut self) -> Result<()> {
        if self.state == PipelineState::Stopping
            && self.in_flight.is_none()
            && self.pool.census().in_flight() == 0
        {
            self.finish()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.state = PipelineState::Stopped;
        self.drain_deadline = None;
        self.plane.release_framebuffers();
        if let Some(id) = self.pool.release_scanout() {
            self.pool.mark_free(id)?;
        }
        info!(stats = ?self.stats, "handoff pipeline stopped");
        Ok(())
    }
}

/// Runs `f`, which may join device threads, without stalling other tasks on
/// a multi-threaded runtime. A current-thread runtime has no worker to hand
/// its tasks to, so `f` runs in place there.
fn off_runtime<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
