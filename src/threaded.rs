//! A [`CaptureBackend`] for sources that can only capture synchronously.
//!
//! Each session gets its own worker thread that owns the [`FrameSource`].
//! `start` queues a cycle on the worker and returns immediately. The worker
//! paces cycles to the session's rate limit, grabs a frame, stamps its
//! metadata and resolves the cycle's [`Completion`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::backend::{
    CaptureBackend, CaptureContext, CaptureKind, CaptureOutcome, CaptureRequest, Capturer,
    Completion,
};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;

/// Pointer state as seen by a [`FrameSource`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CursorState {
    /// The pointer is over the captured output.
    pub visible: bool,
    pub hotspot_x: i32,
    pub hotspot_y: i32,
}

/// Synchronous capture primitive driven by a [`ThreadedBackend`] worker.
pub trait FrameSource: Send {
    /// Produce one frame. `immediate` asks for the current content
    /// instead of waiting for the next change.
    ///
    /// Retryable errors become `FAILED`, everything else `FATAL`.
    fn grab(&mut self, immediate: bool) -> CaptureResult<Frame>;

    /// Current pointer state, polled once per cycle when the session
    /// reports the cursor separately. `None` if unknown.
    fn cursor(&mut self) -> Option<CursorState> {
        None
    }
}

/// Opens [`FrameSource`]s for outputs.
pub trait FrameSourceFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, request: &CaptureRequest) -> CaptureResult<Box<dyn FrameSource>>;

    fn open_cursor(&self, _request: &CaptureRequest) -> CaptureResult<Box<dyn FrameSource>> {
        Err(CaptureError::BackendUnavailable(format!(
            "{} has no cursor source",
            self.name()
        )))
    }
}

/// Adapts a [`FrameSourceFactory`] to the asynchronous backend contract.
pub struct ThreadedBackend<F> {
    factory: F,
}

impl<F: FrameSourceFactory> ThreadedBackend<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn spawn(
        &self,
        source: Box<dyn FrameSource>,
        request: &CaptureRequest,
        context: CaptureContext,
    ) -> CaptureResult<Box<dyn Capturer>> {
        let (commands, receiver) = mpsc::channel();
        let signals = Arc::new(WorkerSignals::default());

        let worker = Worker {
            source,
            context,
            signals: Arc::clone(&signals),
            min_interval: request.min_interval(),
            report_cursor: request.kind == CaptureKind::Cursor || !request.render_cursor,
            output: request.output.to_string(),
            last_completion: None,
            last_cursor: None,
            sequence: 0,
        };

        let join_handle = std::thread::Builder::new()
            .name(format!("damage-capture-{}", request.output.name()))
            .spawn(move || worker.run(receiver))
            .map_err(|e| {
                CaptureError::Platform(anyhow::anyhow!(
                    "failed to spawn capture worker thread: {e}"
                ))
            })?;

        debug!(
            backend = self.factory.name(),
            output = %request.output,
            kind = ?request.kind,
            "capture worker started"
        );

        Ok(Box::new(ThreadedCapturer {
            commands,
            signals,
            in_flight: None,
            join_handle: Some(join_handle),
        }))
    }
}

impl<F: FrameSourceFactory> CaptureBackend for ThreadedBackend<F> {
    fn name(&self) -> &'static str {
        self.factory.name()
    }

    fn create(
        &self,
        request: &CaptureRequest,
        context: CaptureContext,
    ) -> CaptureResult<Box<dyn Capturer>> {
        let source = self.factory.open(request)?;
        self.spawn(source, request, context)
    }

    fn create_cursor(
        &self,
        request: &CaptureRequest,
        context: CaptureContext,
    ) -> CaptureResult<Box<dyn Capturer>> {
        let source = self.factory.open_cursor(request)?;
        self.spawn(source, request, context)
    }
}

enum WorkerCommand {
    Capture {
        immediate: bool,
        completion: Completion,
    },
    Shutdown,
}

#[derive(Default)]
struct WorkerSignals {
    /// Highest cycle number that was stopped. Cycles only grow, so any
    /// cycle at or below this value is cancelled.
    cancelled_through: AtomicU64,
    shutdown: AtomicBool,
}

impl WorkerSignals {
    fn is_cancelled(&self, cycle: u64) -> bool {
        self.shutdown.load(Ordering::Acquire)
            || self.cancelled_through.load(Ordering::Acquire) >= cycle
    }
}

struct ThreadedCapturer {
    commands: mpsc::Sender<WorkerCommand>,
    signals: Arc<WorkerSignals>,
    in_flight: Option<u64>,
    join_handle: Option<JoinHandle<()>>,
}

impl Capturer for ThreadedCapturer {
    fn start(&mut self, immediate: bool, completion: Completion) -> CaptureResult<()> {
        let cycle = completion.cycle();
        self.commands
            .send(WorkerCommand::Capture {
                immediate,
                completion,
            })
            .map_err(|_| CaptureError::WorkerDead)?;
        self.in_flight = Some(cycle);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cycle) = self.in_flight.take() {
            self.signals
                .cancelled_through
                .fetch_max(cycle, Ordering::AcqRel);
        }
    }
}

impl Drop for ThreadedCapturer {
    fn drop(&mut self) {
        self.signals.shutdown.store(true, Ordering::Release);
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                warn!("capture worker panicked");
            }
        }
    }
}

struct Worker {
    source: Box<dyn FrameSource>,
    context: CaptureContext,
    signals: Arc<WorkerSignals>,
    min_interval: Option<Duration>,
    report_cursor: bool,
    output: String,
    last_completion: Option<Instant>,
    last_cursor: Option<CursorState>,
    sequence: u64,
}

impl Worker {
    fn run(mut self, commands: mpsc::Receiver<WorkerCommand>) {
        while let Ok(command) = commands.recv() {
            match command {
                WorkerCommand::Shutdown => break,
                WorkerCommand::Capture {
                    immediate,
                    completion,
                } => {
                    if !self.cycle(immediate, completion) {
                        break;
                    }
                }
            }
        }
        debug!(output = %self.output, captured = self.sequence, "capture worker exiting");
    }

    /// Run one cycle. Returns `false` once the source is unusable.
    fn cycle(&mut self, immediate: bool, completion: Completion) -> bool {
        let cycle = completion.cycle();

        if let (Some(interval), Some(last)) = (self.min_interval, self.last_completion) {
            // An interval past the clock's range never elapses.
            if !self.pace_until(last.checked_add(interval), cycle) {
                trace!(output = %self.output, cycle, "cycle stopped while rate limited");
                completion.cancel();
                return true;
            }
        }
        if self.signals.is_cancelled(cycle) {
            completion.cancel();
            return true;
        }

        if self.report_cursor {
            self.poll_cursor();
        }

        let started = Instant::now();
        let result = self.source.grab(immediate);
        let finished = Instant::now();
        self.last_completion = Some(finished);

        if self.signals.is_cancelled(cycle) {
            trace!(output = %self.output, cycle, "discarding grab of a stopped cycle");
            completion.cancel();
            return true;
        }

        match result {
            Ok(mut frame) => {
                self.sequence += 1;
                frame.metadata.sequence = self.sequence;
                frame.metadata.capture_time = Some(finished);
                frame.metadata.capture_duration = Some(finished.duration_since(started));
                completion.done(frame);
                true
            }
            Err(error) => {
                let outcome = CaptureOutcome::from_error(&error);
                let fatal = matches!(outcome, CaptureOutcome::Fatal);
                if fatal {
                    warn!(output = %self.output, cycle, %error, "frame source failed permanently");
                } else {
                    debug!(output = %self.output, cycle, %error, "frame source failed");
                }
                completion.resolve(outcome);
                !fatal
            }
        }
    }

    /// Sleep until `deadline` unless the cycle is stopped first. Returns
    /// `false` if it was. `None` waits until the cycle is stopped.
    fn pace_until(&self, deadline: Option<Instant>, cycle: u64) -> bool {
        const SLICE: Duration = Duration::from_millis(4);

        loop {
            if self.signals.is_cancelled(cycle) {
                return false;
            }
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => deadline - now,
                None => SLICE,
            };
            std::thread::sleep(remaining.min(SLICE));
        }
    }

    fn poll_cursor(&mut self) {
        let Some(current) = self.source.cursor() else {
            return;
        };
        let previous = self.last_cursor.replace(current).unwrap_or_default();

        if current.visible && !previous.visible {
            self.context.cursor_enter();
        }
        if current.visible
            && (!previous.visible
                || (current.hotspot_x, current.hotspot_y)
                    != (previous.hotspot_x, previous.hotspot_y))
        {
            self.context
                .cursor_hotspot(current.hotspot_x, current.hotspot_y);
        }
        if !current.visible && previous.visible {
            self.context.cursor_leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CursorEvent, OutcomeKind};
    use crate::capture_session::{
        CaptureHandler, CaptureSession, CaptureSessionBuilder, SessionState,
    };
    use crate::frame::PixelFormat;
    use crate::output::OutputId;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        results: VecDeque<CaptureResult<Frame>>,
        cursors: VecDeque<CursorState>,
        grabs: usize,
        immediate: Vec<bool>,
        dropped: usize,
    }

    struct ScriptedSource {
        script: Arc<Mutex<Script>>,
    }

    impl FrameSource for ScriptedSource {
        fn grab(&mut self, immediate: bool) -> CaptureResult<Frame> {
            let mut script = self.script.lock().unwrap();
            script.grabs += 1;
            script.immediate.push(immediate);
            script
                .results
                .pop_front()
                .unwrap_or_else(|| Frame::zeroed(8, 8, 32, PixelFormat::Xrgb8888))
        }

        fn cursor(&mut self) -> Option<CursorState> {
            self.script.lock().unwrap().cursors.pop_front()
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.script.lock().unwrap().dropped += 1;
        }
    }

    struct ScriptedFactory {
        script: Arc<Mutex<Script>>,
    }

    impl FrameSourceFactory for ScriptedFactory {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn open(&self, request: &CaptureRequest) -> CaptureResult<Box<dyn FrameSource>> {
            if request.output.name() == "missing" {
                return Err(CaptureError::InvalidTarget(request.output.stable_id()));
            }
            Ok(Box::new(ScriptedSource {
                script: Arc::clone(&self.script),
            }))
        }

        fn open_cursor(&self, request: &CaptureRequest) -> CaptureResult<Box<dyn FrameSource>> {
            self.open(request)
        }
    }

    #[derive(Default)]
    struct Recorder {
        outcomes: Vec<OutcomeKind>,
        frames: Vec<Frame>,
        cursor: Vec<CursorEvent>,
    }

    impl CaptureHandler for Recorder {
        fn on_done(&mut self, outcome: CaptureOutcome) {
            self.outcomes.push(outcome.kind());
            if let CaptureOutcome::Done(frame) = outcome {
                self.frames.push(frame);
            }
        }

        fn cursor_enter(&mut self) {
            self.cursor.push(CursorEvent::Enter);
        }

        fn cursor_leave(&mut self) {
            self.cursor.push(CursorEvent::Leave);
        }

        fn cursor_hotspot(&mut self, x: i32, y: i32) {
            self.cursor.push(CursorEvent::Hotspot { x, y });
        }
    }

    fn backend(script: &Arc<Mutex<Script>>) -> Arc<dyn CaptureBackend> {
        Arc::new(ThreadedBackend::new(ScriptedFactory {
            script: Arc::clone(script),
        }))
    }

    fn output() -> OutputId {
        OutputId::new(3, "eDP-1", 8, 8)
    }

    fn wait_outcomes(session: &mut CaptureSession<Recorder>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.handler().outcomes.len() < count && Instant::now() < deadline {
            session.dispatch_timeout(Duration::from_millis(50));
        }
        assert_eq!(session.handler().outcomes.len(), count);
    }

    #[test]
    fn completed_frames_carry_sequence_and_timing() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(0.0)
            .create(output(), Recorder::default())?;

        session.start(true)?;
        wait_outcomes(&mut session, 1);
        session.start(false)?;
        wait_outcomes(&mut session, 2);

        let frames = &session.handler().frames;
        assert_eq!(frames[0].metadata.sequence, 1);
        assert_eq!(frames[1].metadata.sequence, 2);
        assert!(frames[0].metadata.capture_time.is_some());
        assert!(frames[0].metadata.capture_duration.is_some());
        assert_eq!(script.lock().unwrap().immediate, vec![true, false]);
        Ok(())
    }

    #[test]
    fn transient_source_error_reports_failed_and_allows_retry() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        script
            .lock()
            .unwrap()
            .results
            .push_back(Err(CaptureError::AccessLost));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(0.0)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);
        session.start(false)?;
        wait_outcomes(&mut session, 2);

        assert_eq!(
            session.handler().outcomes,
            vec![OutcomeKind::Failed, OutcomeKind::Done]
        );
        Ok(())
    }

    #[test]
    fn permanent_source_error_reports_fatal() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        script
            .lock()
            .unwrap()
            .results
            .push_back(Err(CaptureError::OutputLost));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(0.0)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);

        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Fatal]);
        assert_eq!(session.state(), SessionState::Dead);
        session.destroy();
        assert_eq!(script.lock().unwrap().dropped, 1);
        Ok(())
    }

    #[test]
    fn rate_limit_spaces_out_cycles() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(10.0)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);
        session.start(false)?;
        wait_outcomes(&mut session, 2);

        let frames = &session.handler().frames;
        let first = frames[0].metadata.capture_time.unwrap();
        let second = frames[1].metadata.capture_time.unwrap();
        assert!(second.duration_since(first) >= Duration::from_millis(99));
        Ok(())
    }

    #[test]
    fn stop_cancels_a_rate_limited_cycle_before_it_grabs() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(1.0)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);
        session.start(false)?;
        session.stop();

        assert_eq!(session.dispatch_timeout(Duration::from_millis(100)), 0);
        assert_eq!(script.lock().unwrap().grabs, 1);
        assert_eq!(session.state(), SessionState::Idle);
        Ok(())
    }

    #[test]
    fn cursor_changes_are_reported_as_events() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        script.lock().unwrap().cursors.extend([
            CursorState {
                visible: true,
                hotspot_x: 2,
                hotspot_y: 4,
            },
            CursorState {
                visible: true,
                hotspot_x: 2,
                hotspot_y: 4,
            },
            CursorState {
                visible: false,
                hotspot_x: 2,
                hotspot_y: 4,
            },
        ]);
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(0.0)
            .create_cursor(output(), Recorder::default())?;

        for cycle in 1..=3 {
            session.start(false)?;
            wait_outcomes(&mut session, cycle);
        }
        session.dispatch();

        assert_eq!(
            session.handler().cursor,
            vec![
                CursorEvent::Enter,
                CursorEvent::Hotspot { x: 2, y: 4 },
                CursorEvent::Leave
            ]
        );
        Ok(())
    }

    #[test]
    fn rendered_cursor_is_not_polled() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        script.lock().unwrap().cursors.push_back(CursorState {
            visible: true,
            hotspot_x: 0,
            hotspot_y: 0,
        });
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(0.0)
            .render_cursor(true)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);

        assert!(session.handler().cursor.is_empty());
        assert_eq!(script.lock().unwrap().cursors.len(), 1);
        Ok(())
    }

    #[test]
    fn unrepresentable_interval_waits_instead_of_panicking() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let backend = backend(&script);
        let request = CaptureRequest {
            output: output(),
            kind: CaptureKind::Output,
            render_cursor: false,
            rate_limit: 1e-20,
            enable_gpu_buffers: false,
        };
        let (events_tx, events) = mpsc::channel();
        let mut capturer = backend.create(&request, CaptureContext::new(events_tx.clone()))?;

        capturer.start(false, Completion::new(1, events_tx.clone()))?;
        assert!(events.recv_timeout(Duration::from_secs(5)).is_ok());
        capturer.start(false, Completion::new(2, events_tx))?;
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
        capturer.stop();
        drop(capturer);

        let script = script.lock().unwrap();
        assert_eq!(script.grabs, 1);
        assert_eq!(script.dropped, 1);
        Ok(())
    }

    #[test]
    fn open_failure_fails_session_creation() {
        let script = Arc::new(Mutex::new(Script::default()));
        let result = CaptureSessionBuilder::new(backend(&script))
            .create(OutputId::new(9, "missing", 0, 0), Recorder::default());
        assert!(matches!(result, Err(CaptureError::InvalidTarget(_))));
    }

    #[test]
    fn destroy_joins_the_worker_and_drops_the_source() -> CaptureResult<()> {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut session = CaptureSessionBuilder::new(backend(&script))
            .rate_limit(1.0)
            .create(output(), Recorder::default())?;

        session.start(false)?;
        wait_outcomes(&mut session, 1);
        // The next cycle sits in the rate limit wait when destroy lands.
        session.start(false)?;
        session.destroy();

        let script = script.lock().unwrap();
        assert_eq!(script.dropped, 1);
        assert_eq!(script.grabs, 1);
        Ok(())
    }
}
