//! Continuous per-output capture with damage refinement.
//!
//! An [`OutputPipeline`] owns one capture session and one damage refinery
//! for an output. Every completed frame runs through the refinery and the
//! resulting `(frame, damage)` pair is offered to a bounded channel. The
//! consumer reads [`DamageEvent`]s at its own pace (e.g. feeding an
//! encoder). When the consumer falls behind, the frame is dropped but its
//! damage is kept and merged into the next delivered frame, so no changed
//! pixels are lost.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::backend::{CaptureBackend, CaptureOutcome, CursorEvent, OutcomeKind};
use crate::capture_session::{
    CaptureHandler, CaptureSession, CaptureSessionBuilder, CaptureSessionConfig,
};
use crate::damage::DamageRefinery;
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::output::{OutputId, OutputKey};
use crate::region::{DirtyRect, Region};

const DISPATCH_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Session settings used for the pipeline's capture session.
    pub session: CaptureSessionConfig,
    /// Maximum number of events buffered before frames are dropped.
    pub channel_depth: usize,
    /// Consecutive failed or timed out cycles tolerated before the
    /// pipeline gives up.
    pub max_consecutive_failures: usize,
    /// Delay before retrying after a failed cycle. Doubles with every
    /// consecutive failure up to `max_retry_backoff`.
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    /// A cycle still in flight after this long is stopped and counted
    /// as a failure. `None` waits forever.
    pub cycle_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            session: CaptureSessionConfig::default(),
            channel_depth: 3,
            max_consecutive_failures: 30,
            retry_backoff: Duration::from_millis(16),
            max_retry_backoff: Duration::from_millis(500),
            cycle_timeout: Some(Duration::from_secs(2)),
        }
    }
}

/// Why a pipeline stopped running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineEnd {
    /// `stop` was requested.
    Stopped,
    /// The capture session reported a fatal outcome.
    OutputLost,
    /// Too many consecutive cycles failed.
    TooManyFailures,
    /// The event receiver was dropped.
    ReceiverGone,
    /// Starting a cycle failed with a non-retryable error.
    Error,
}

/// Result of [`OutputPipeline::run`].
#[derive(Debug)]
pub enum PipelineExit {
    Stopped,
    OutputLost,
    TooManyFailures(CaptureError),
    ReceiverGone,
    Error(CaptureError),
}

impl PipelineExit {
    pub fn reason(&self) -> PipelineEnd {
        match self {
            Self::Stopped => PipelineEnd::Stopped,
            Self::OutputLost => PipelineEnd::OutputLost,
            Self::TooManyFailures(_) => PipelineEnd::TooManyFailures,
            Self::ReceiverGone => PipelineEnd::ReceiverGone,
            Self::Error(_) => PipelineEnd::Error,
        }
    }
}

#[derive(Debug)]
pub enum DamageEvent {
    /// A frame whose content changed, with every region that changed
    /// since the previous delivered frame.
    Frame { frame: Frame, damage: Region },
    /// The output resolution changed. The next frame is fully damaged.
    ResolutionChanged {
        old_width: u32,
        old_height: u32,
        new_width: u32,
        new_height: u32,
    },
    /// A frame was dropped because the channel was full. Its damage is
    /// carried into the next delivered frame.
    FrameDropped { sequence: u64 },
    /// Cursor updates are best-effort. One that finds the channel full is
    /// dropped, since the next hotspot supersedes it.
    Cursor(CursorEvent),
    /// No more events will follow. Always the last event a
    /// [`PipelineHandle`] yields, even when the channel was full as the
    /// pipeline ended.
    Ended(PipelineEnd),
}

/// Live statistics, updated atomically by the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    pub frames_delivered: AtomicU64,
    /// Frames that refined to an empty damage region and were not sent.
    pub frames_unchanged: AtomicU64,
    pub frames_dropped: AtomicU64,
    /// Failed or timed out cycles that were retried.
    pub errors_recovered: AtomicU64,
    pub resolution_changes: AtomicU64,
    /// Frame events currently sitting in the channel.
    pub buffer_fill: AtomicU64,
    /// EWMA of refine time in nanoseconds, stored as `f64` bits.
    pub refine_latency_avg_ns: AtomicU64,
    ended: OnceLock<PipelineEnd>,
}

impl PipelineStats {
    /// Why the pipeline ended, once it has.
    pub fn end_reason(&self) -> Option<PipelineEnd> {
        self.ended.get().copied()
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_unchanged: self.frames_unchanged.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            errors_recovered: self.errors_recovered.load(Ordering::Relaxed),
            resolution_changes: self.resolution_changes.load(Ordering::Relaxed),
            buffer_fill: self.buffer_fill.load(Ordering::Relaxed),
            refine_latency_avg: Duration::from_nanos(f64::from_bits(
                self.refine_latency_avg_ns.load(Ordering::Relaxed),
            ) as u64),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PipelineStatsSnapshot {
    pub frames_captured: u64,
    pub frames_delivered: u64,
    pub frames_unchanged: u64,
    pub frames_dropped: u64,
    pub errors_recovered: u64,
    pub resolution_changes: u64,
    pub buffer_fill: u64,
    pub refine_latency_avg: Duration,
}

/// Session handler that turns completed frames into damage events.
pub struct PipelineHandler {
    output: OutputId,
    refinery: Option<DamageRefinery>,
    /// Damage not yet delivered downstream.
    pending_damage: Region,
    /// Size before a resolution change the consumer has not been told
    /// about yet.
    owed_resize: Option<(u32, u32)>,
    events: mpsc::SyncSender<DamageEvent>,
    stats: Arc<PipelineStats>,
    last_outcome: Option<OutcomeKind>,
    receiver_gone: bool,
    refine_latency_avg_ns: f64,
}

impl PipelineHandler {
    fn new(
        output: OutputId,
        events: mpsc::SyncSender<DamageEvent>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            output,
            refinery: None,
            pending_damage: Region::new(),
            owed_resize: None,
            events,
            stats,
            last_outcome: None,
            receiver_gone: false,
            refine_latency_avg_ns: 0.0,
        }
    }

    pub fn refinery(&self) -> Option<&DamageRefinery> {
        self.refinery.as_ref()
    }

    /// Damage accumulated from dropped frames that is still owed to the
    /// consumer.
    pub fn pending_damage(&self) -> &Region {
        &self.pending_damage
    }

    fn send(&mut self, event: DamageEvent) -> Result<(), DamageEvent> {
        match self.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(event)) => Err(event),
            Err(mpsc::TrySendError::Disconnected(event)) => {
                self.receiver_gone = true;
                Err(event)
            }
        }
    }

    /// Make sure the refinery matches the frame size. Returns `false` if
    /// no refinery can be built for it.
    fn ensure_refinery(&mut self, width: u32, height: u32) -> bool {
        let old = self.refinery.as_ref().map(DamageRefinery::dimensions);
        if old == Some((width, height)) {
            return true;
        }

        let refinery = match DamageRefinery::new(width, height) {
            Ok(refinery) => refinery,
            Err(error) => {
                warn!(
                    output = %self.output,
                    width,
                    height,
                    %error,
                    "cannot track damage for frame"
                );
                return false;
            }
        };
        self.refinery = Some(refinery);
        // Everything is new after (re)initialisation, including tiles whose
        // content happens to hash to the initial value.
        self.pending_damage = Region::from_rect(DirtyRect::new(0, 0, width, height));

        if let Some((old_width, old_height)) = old {
            self.stats.resolution_changes.fetch_add(1, Ordering::Relaxed);
            debug!(
                output = %self.output,
                old_width,
                old_height,
                width,
                height,
                "output resolution changed, damage tracking reset"
            );
            self.owed_resize.get_or_insert((old_width, old_height));
        }
        true
    }

    /// Tell the consumer about a resolution change before the first frame
    /// at the new size. Stays owed while the channel is full.
    fn flush_resize(&mut self) -> Result<(), DamageEvent> {
        let Some((old_width, old_height)) = self.owed_resize else {
            return Ok(());
        };
        let Some((new_width, new_height)) = self.refinery.as_ref().map(DamageRefinery::dimensions)
        else {
            return Ok(());
        };
        // Resized and back again before anything was delivered.
        if (old_width, old_height) != (new_width, new_height) {
            self.send(DamageEvent::ResolutionChanged {
                old_width,
                old_height,
                new_width,
                new_height,
            })?;
        }
        self.owed_resize = None;
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> OutcomeKind {
        const LATENCY_ALPHA: f64 = 0.1;

        self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
        let (width, height) = frame.dimensions();
        if !self.ensure_refinery(width, height) {
            return OutcomeKind::Failed;
        }
        let Some(refinery) = self.refinery.as_mut() else {
            return OutcomeKind::Failed;
        };

        let started = Instant::now();
        refinery.refine(
            &mut self.pending_damage,
            frame.metadata.damage_hint.as_ref(),
            &frame,
        );
        let sample_ns = started.elapsed().as_nanos() as f64;
        self.refine_latency_avg_ns =
            LATENCY_ALPHA * sample_ns + (1.0 - LATENCY_ALPHA) * self.refine_latency_avg_ns;
        self.stats
            .refine_latency_avg_ns
            .store(self.refine_latency_avg_ns.to_bits(), Ordering::Relaxed);

        if self.pending_damage.is_empty() {
            self.stats.frames_unchanged.fetch_add(1, Ordering::Relaxed);
            trace!(output = %self.output, sequence = frame.metadata.sequence, "frame unchanged");
            return OutcomeKind::Done;
        }

        let sequence = frame.metadata.sequence;
        let sent = self.flush_resize().and_then(|()| {
            let damage = self.pending_damage.clone();
            self.send(DamageEvent::Frame { frame, damage })
        });
        match sent {
            Ok(()) => {
                self.pending_damage.clear();
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                self.stats.buffer_fill.fetch_add(1, Ordering::Release);
            }
            Err(_) if self.receiver_gone => {}
            Err(_) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(output = %self.output, sequence, "consumer behind, frame dropped");
                let _ = self.send(DamageEvent::FrameDropped { sequence });
            }
        }
        OutcomeKind::Done
    }
}

impl CaptureHandler for PipelineHandler {
    fn on_done(&mut self, outcome: CaptureOutcome) {
        let kind = match outcome {
            CaptureOutcome::Done(frame) => self.handle_frame(frame),
            other => other.kind(),
        };
        self.last_outcome = Some(kind);
    }

    fn cursor_enter(&mut self) {
        let _ = self.send(DamageEvent::Cursor(CursorEvent::Enter));
    }

    fn cursor_leave(&mut self) {
        let _ = self.send(DamageEvent::Cursor(CursorEvent::Leave));
    }

    fn cursor_hotspot(&mut self, x: i32, y: i32) {
        let _ = self.send(DamageEvent::Cursor(CursorEvent::Hotspot { x, y }));
    }
}

/// One output's capture session plus its damage tracking.
pub struct OutputPipeline {
    session: CaptureSession<PipelineHandler>,
    config: PipelineConfig,
    stats: Arc<PipelineStats>,
}

impl OutputPipeline {
    /// Create the capture session for `output`. Returns the pipeline and
    /// the receiving end of its event channel.
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        output: OutputId,
        config: PipelineConfig,
    ) -> CaptureResult<(Self, mpsc::Receiver<DamageEvent>)> {
        if config.max_consecutive_failures == 0 {
            return Err(CaptureError::InvalidConfig(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        let (tx, rx) = mpsc::sync_channel(config.channel_depth.max(1));
        let stats = Arc::new(PipelineStats::default());
        let handler = PipelineHandler::new(output.clone(), tx, Arc::clone(&stats));
        let session = CaptureSessionBuilder::new(backend)
            .with_config(config.session)
            .create(output, handler)?;

        Ok((
            Self {
                session,
                config,
                stats,
            },
            rx,
        ))
    }

    pub fn output(&self) -> &OutputId {
        self.session.output()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn handler(&self) -> &PipelineHandler {
        self.session.handler()
    }

    /// Run a single capture cycle to completion and process its outcome.
    pub fn run_cycle(&mut self, immediate: bool) -> CaptureResult<OutcomeKind> {
        let never = AtomicBool::new(false);
        self.cycle(immediate, &never)?.ok_or(CaptureError::Canceled)
    }

    fn cycle(&mut self, immediate: bool, stop: &AtomicBool) -> CaptureResult<Option<OutcomeKind>> {
        self.session.handler_mut().last_outcome = None;
        self.session.start(immediate)?;

        loop {
            self.session.dispatch_timeout(DISPATCH_SLICE);
            if let Some(kind) = self.session.handler_mut().last_outcome.take() {
                return Ok(Some(kind));
            }
            if stop.load(Ordering::Acquire) {
                self.session.stop();
                return Ok(None);
            }
            if let (Some(limit), Some(elapsed)) =
                (self.config.cycle_timeout, self.session.in_flight_for())
            {
                if elapsed >= limit {
                    self.session.stop();
                    return Err(CaptureError::Timeout);
                }
            }
        }
    }

    /// Capture continuously until `stop` is set or the pipeline cannot
    /// continue. Sends [`DamageEvent::Ended`] before returning.
    pub fn run(&mut self, stop: &AtomicBool) -> PipelineExit {
        let mut consecutive_failures = 0usize;
        let mut backoff = self.config.retry_backoff;
        let mut immediate = true;

        let exit = loop {
            if stop.load(Ordering::Acquire) {
                break PipelineExit::Stopped;
            }

            let error = match self.cycle(immediate, stop) {
                Ok(None) => break PipelineExit::Stopped,
                Ok(Some(OutcomeKind::Done)) => {
                    if self.session.handler().receiver_gone {
                        break PipelineExit::ReceiverGone;
                    }
                    consecutive_failures = 0;
                    backoff = self.config.retry_backoff;
                    immediate = false;
                    continue;
                }
                Ok(Some(OutcomeKind::Fatal)) => {
                    warn!(output = %self.output(), "output lost, pipeline ending");
                    break PipelineExit::OutputLost;
                }
                Ok(Some(OutcomeKind::Failed)) => CaptureError::CaptureFailed,
                Err(error) if error.is_retryable() => error,
                Err(error) => {
                    warn!(output = %self.output(), %error, "capture cycle could not start");
                    break PipelineExit::Error(error);
                }
            };

            consecutive_failures += 1;
            if consecutive_failures >= self.config.max_consecutive_failures {
                warn!(
                    output = %self.output(),
                    consecutive_failures,
                    %error,
                    "giving up after repeated capture failures"
                );
                break PipelineExit::TooManyFailures(error);
            }
            self.stats.errors_recovered.fetch_add(1, Ordering::Relaxed);
            debug!(
                output = %self.output(),
                consecutive_failures,
                backoff_ms = backoff.as_millis() as u64,
                %error,
                "capture cycle failed, retrying"
            );
            if !sleep_unless_stopped(backoff, stop) {
                break PipelineExit::Stopped;
            }
            backoff = backoff.saturating_mul(2).min(self.config.max_retry_backoff);
            immediate = true;
        };

        let _ = self.stats.ended.set(exit.reason());
        // A full channel loses this, the handle then reports the end
        // once the channel disconnects.
        let _ = self
            .session
            .handler_mut()
            .send(DamageEvent::Ended(exit.reason()));
        exit
    }

    /// Run the pipeline on a dedicated thread.
    pub fn spawn(
        backend: Arc<dyn CaptureBackend>,
        output: OutputId,
        config: PipelineConfig,
    ) -> CaptureResult<PipelineHandle> {
        let channel_depth = config.channel_depth.max(1);
        let (pipeline, receiver) = Self::new(backend, output, config)?;
        let (stop_flag, stats, join_handle) = pipeline.start_thread()?;
        Ok(PipelineHandle {
            receiver,
            stop_flag,
            stats,
            join_handle: Some(join_handle),
            channel_depth,
            end_delivered: AtomicBool::new(false),
        })
    }

    fn start_thread(
        mut self,
    ) -> CaptureResult<(
        Arc<AtomicBool>,
        Arc<PipelineStats>,
        std::thread::JoinHandle<PipelineExit>,
    )> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stats = Arc::clone(&self.stats);
        let stop = Arc::clone(&stop_flag);
        let join_handle = std::thread::Builder::new()
            .name(format!("damage-pipeline-{}", self.output().name()))
            .spawn(move || self.run(&stop))
            .map_err(|e| {
                CaptureError::Platform(anyhow::anyhow!("failed to spawn pipeline thread: {e}"))
            })?;
        Ok((stop_flag, stats, join_handle))
    }
}

/// Sleep for `duration` in short slices. Returns `false` if `stop` was set
/// in the meantime.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(DISPATCH_SLICE));
    }
}

/// `Ended` for a pipeline whose thread is gone. A thread that died without
/// recording a reason counts as an error.
fn final_event(stats: &PipelineStats) -> DamageEvent {
    DamageEvent::Ended(stats.end_reason().unwrap_or(PipelineEnd::Error))
}

/// Handle to a pipeline running on its own thread. Dropping the handle
/// stops the pipeline and joins the thread.
pub struct PipelineHandle {
    receiver: mpsc::Receiver<DamageEvent>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    join_handle: Option<std::thread::JoinHandle<PipelineExit>>,
    channel_depth: usize,
    end_delivered: AtomicBool,
}

impl PipelineHandle {
    fn consumed(&self, event: DamageEvent) -> DamageEvent {
        match event {
            DamageEvent::Frame { .. } => {
                self.stats.buffer_fill.fetch_sub(1, Ordering::Release);
            }
            DamageEvent::Ended(_) => self.end_delivered.store(true, Ordering::Release),
            _ => {}
        }
        event
    }

    /// The `Ended` event the pipeline could not send because the channel
    /// was full. Yielded once, after the channel disconnected.
    fn missed_end(&self) -> Option<DamageEvent> {
        if self.end_delivered.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(final_event(&self.stats))
    }

    pub fn recv(&self) -> Result<DamageEvent, mpsc::RecvError> {
        match self.receiver.recv() {
            Ok(event) => Ok(self.consumed(event)),
            Err(error) => self.missed_end().ok_or(error),
        }
    }

    pub fn try_recv(&self) -> Result<DamageEvent, mpsc::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(self.consumed(event)),
            Err(mpsc::TryRecvError::Empty) => Err(mpsc::TryRecvError::Empty),
            Err(error) => self.missed_end().ok_or(error),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<DamageEvent, mpsc::RecvTimeoutError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Ok(self.consumed(event)),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(mpsc::RecvTimeoutError::Timeout),
            Err(error) => self.missed_end().ok_or(error),
        }
    }

    /// Signal the pipeline thread to stop. Does not wait for it.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Channel fill level in `[0.0, 1.0]`.
    pub fn buffer_fill_percent(&self) -> f64 {
        let fill = self.stats.buffer_fill.load(Ordering::Relaxed);
        (fill as f64 / self.channel_depth as f64).min(1.0)
    }

    /// Wait for the pipeline to end on its own and return why it did.
    pub fn join(mut self) -> PipelineExit {
        self.join_thread()
    }

    /// Stop the pipeline, wait for it and return every event still
    /// buffered, so a consumer can flush without losing the tail.
    pub fn stop_and_drain(mut self) -> (PipelineExit, Vec<DamageEvent>) {
        self.stop();
        let exit = self.join_thread();
        let mut events = Vec::new();
        while let Ok(event) = self.try_recv() {
            events.push(event);
        }
        (exit, events)
    }

    fn join_thread(&mut self) -> PipelineExit {
        match self.join_handle.take().map(|handle| handle.join()) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => PipelineExit::Error(CaptureError::WorkerDead),
            None => PipelineExit::Stopped,
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Async wrapper around a pipeline thread for tokio-based consumers.
///
/// Requires the `tokio-stream` feature.
#[cfg(feature = "tokio-stream")]
pub struct AsyncPipelineHandle {
    async_rx: tokio::sync::mpsc::Receiver<DamageEvent>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    join_handle: Option<std::thread::JoinHandle<PipelineExit>>,
    bridge_handle: Option<std::thread::JoinHandle<()>>,
}

#[cfg(feature = "tokio-stream")]
impl AsyncPipelineHandle {
    /// Start a pipeline thread plus a bridge thread that forwards its
    /// events into a `tokio::sync::mpsc` channel.
    pub fn spawn(
        backend: Arc<dyn CaptureBackend>,
        output: OutputId,
        config: PipelineConfig,
    ) -> CaptureResult<Self> {
        let depth = config.channel_depth.max(1);
        let (pipeline, sync_rx) = OutputPipeline::new(backend, output, config)?;
        let (stop_flag, stats, join_handle) = pipeline.start_thread()?;

        let (async_tx, async_rx) = tokio::sync::mpsc::channel(depth);
        let bridge_stats = Arc::clone(&stats);
        let bridge_handle = std::thread::Builder::new()
            .name("damage-pipeline-async-bridge".to_string())
            .spawn(move || {
                let mut ended = false;
                while !ended {
                    // The pipeline thread always exits after `stop`, which
                    // disconnects the channel and ends this loop.
                    let event = match sync_rx.recv() {
                        Ok(event) => event,
                        Err(mpsc::RecvError) => final_event(&bridge_stats),
                    };
                    let is_frame = matches!(event, DamageEvent::Frame { .. });
                    ended = matches!(event, DamageEvent::Ended(_));
                    if async_tx.blocking_send(event).is_err() {
                        break;
                    }
                    if is_frame {
                        bridge_stats.buffer_fill.fetch_sub(1, Ordering::Release);
                    }
                }
            })
            .map_err(|e| {
                stop_flag.store(true, Ordering::Release);
                CaptureError::Platform(anyhow::anyhow!(
                    "failed to spawn async bridge thread: {e}"
                ))
            })?;

        Ok(Self {
            async_rx,
            stop_flag,
            stats,
            join_handle: Some(join_handle),
            bridge_handle: Some(bridge_handle),
        })
    }

    pub async fn next_event(&mut self) -> Option<DamageEvent> {
        self.async_rx.recv().await
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

#[cfg(feature = "tokio-stream")]
impl Drop for AsyncPipelineHandle {
    fn drop(&mut self) {
        self.stop();
        // Unblock a bridge stuck in blocking_send.
        self.async_rx.close();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.bridge_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Running pipelines for every captured output, keyed by output.
#[derive(Default)]
pub struct PipelineSet {
    pipelines: FxHashMap<OutputKey, (OutputId, PipelineHandle)>,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start capturing `output`. An existing pipeline for the same output
    /// is stopped and its session destroyed before the new one is created,
    /// so an output never has two live sessions.
    pub fn add(
        &mut self,
        backend: Arc<dyn CaptureBackend>,
        output: OutputId,
        config: PipelineConfig,
    ) -> CaptureResult<()> {
        if let Some((_, previous)) = self.pipelines.remove(&output.key()) {
            debug!(output = %output, "replacing running pipeline");
            previous.stop_and_drain();
        }
        let handle = OutputPipeline::spawn(backend, output.clone(), config)?;
        self.pipelines.insert(output.key(), (output, handle));
        Ok(())
    }

    /// Stop and forget the pipeline for `key`, returning its unread events.
    pub fn remove(&mut self, key: &OutputKey) -> Option<Vec<DamageEvent>> {
        let (_, handle) = self.pipelines.remove(key)?;
        Some(handle.stop_and_drain().1)
    }

    pub fn get(&self, key: &OutputKey) -> Option<&PipelineHandle> {
        self.pipelines.get(key).map(|(_, handle)| handle)
    }

    pub fn contains(&self, key: &OutputKey) -> bool {
        self.pipelines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputId> + '_ {
        self.pipelines.values().map(|(output, _)| output)
    }

    /// Collect every buffered event without blocking. Pipelines that
    /// ended are removed once their final event was read, which happens
    /// even if their `Ended` did not fit in the channel.
    pub fn poll(&mut self) -> Vec<(OutputKey, DamageEvent)> {
        let mut events = Vec::new();
        let mut ended = Vec::new();
        for (key, (output, handle)) in &self.pipelines {
            while let Ok(event) = handle.try_recv() {
                if let DamageEvent::Ended(reason) = event {
                    debug!(output = %output, ?reason, "pipeline ended");
                    ended.push(*key);
                }
                events.push((*key, event));
            }
        }
        for key in ended {
            self.pipelines.remove(&key);
        }
        events
    }

    /// Stop every pipeline without waiting.
    pub fn stop_all(&self) {
        for (_, handle) in self.pipelines.values() {
            handle.stop();
        }
    }
}
