use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::backend::{
    CaptureBackend, CaptureContext, CaptureKind, CaptureOutcome, CaptureRequest, Capturer,
    Completion, CursorEvent, OutcomeKind, SessionEvent,
};
use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::output::OutputId;

/// Receives the results of a [`CaptureSession`].
///
/// Callbacks run inside [`CaptureSession::dispatch`] on the caller's
/// thread, never concurrently for one session.
pub trait CaptureHandler: Send {
    /// Called once per accepted `start` that was not stopped. A `Done`
    /// frame is handed over by value; drop it to release it.
    fn on_done(&mut self, outcome: CaptureOutcome);

    fn cursor_enter(&mut self) {}

    fn cursor_leave(&mut self) {}

    fn cursor_hotspot(&mut self, _x: i32, _y: i32) {}
}

impl<H: CaptureHandler + ?Sized> CaptureHandler for Box<H> {
    fn on_done(&mut self, outcome: CaptureOutcome) {
        (**self).on_done(outcome);
    }

    fn cursor_enter(&mut self) {
        (**self).cursor_enter();
    }

    fn cursor_leave(&mut self) {
        (**self).cursor_leave();
    }

    fn cursor_hotspot(&mut self, x: i32, y: i32) {
        (**self).cursor_hotspot(x, y);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CaptureSessionConfig {
    /// Composite the pointer into frames. When `false` the pointer is
    /// reported through cursor callbacks instead.
    pub render_cursor: bool,
    /// Maximum capture cycles per second the backend should perform.
    /// `0.0` disables throttling. Fixed once the session is created.
    pub rate_limit: f64,
    /// Allow the zero-copy GPU buffer path when the backend has one.
    pub enable_gpu_buffers: bool,
}

impl Default for CaptureSessionConfig {
    fn default() -> Self {
        Self {
            render_cursor: false,
            rate_limit: 30.0,
            enable_gpu_buffers: false,
        }
    }
}

pub struct CaptureSessionBuilder {
    backend: Arc<dyn CaptureBackend>,
    config: CaptureSessionConfig,
}

impl CaptureSessionBuilder {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            config: CaptureSessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CaptureSessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn render_cursor(mut self, enabled: bool) -> Self {
        self.config.render_cursor = enabled;
        self
    }

    pub fn rate_limit(mut self, captures_per_second: f64) -> Self {
        self.config.rate_limit = captures_per_second;
        self
    }

    pub fn gpu_buffers(mut self, enabled: bool) -> Self {
        self.config.enable_gpu_buffers = enabled;
        self
    }

    /// Bind a full-frame capture session to `output`.
    pub fn create<H: CaptureHandler>(
        self,
        output: OutputId,
        handler: H,
    ) -> CaptureResult<CaptureSession<H>> {
        self.build(output, CaptureKind::Output, handler)
    }

    /// Bind a cursor-only capture session to `output`.
    pub fn create_cursor<H: CaptureHandler>(
        self,
        output: OutputId,
        handler: H,
    ) -> CaptureResult<CaptureSession<H>> {
        self.build(output, CaptureKind::Cursor, handler)
    }

    fn build<H: CaptureHandler>(
        self,
        output: OutputId,
        kind: CaptureKind,
        handler: H,
    ) -> CaptureResult<CaptureSession<H>> {
        let rate_limit = self.config.rate_limit;
        if !rate_limit.is_finite() || rate_limit < 0.0 {
            return Err(CaptureError::InvalidConfig(format!(
                "rate limit must be a non-negative number, got {rate_limit}"
            )));
        }
        if rate_limit > 0.0 && Duration::try_from_secs_f64(rate_limit.recip()).is_err() {
            return Err(CaptureError::InvalidConfig(format!(
                "rate limit {rate_limit} is too small to pace captures"
            )));
        }

        let request = CaptureRequest {
            output,
            kind,
            render_cursor: kind == CaptureKind::Output && self.config.render_cursor,
            rate_limit,
            enable_gpu_buffers: self.config.enable_gpu_buffers,
        };

        let (events_tx, events) = mpsc::channel();
        let context = CaptureContext::new(events_tx.clone());
        let capturer = match kind {
            CaptureKind::Output => self.backend.create(&request, context),
            CaptureKind::Cursor => self.backend.create_cursor(&request, context),
        }
        .inspect_err(|error| {
            debug!(
                backend = self.backend.name(),
                output = %request.output,
                ?kind,
                %error,
                "backend refused to bind capture session"
            );
        })?;

        debug!(
            backend = self.backend.name(),
            output = %request.output,
            ?kind,
            render_cursor = request.render_cursor,
            rate_limit = request.rate_limit,
            "capture session created"
        );

        Ok(CaptureSession {
            backend_name: self.backend.name(),
            request,
            capturer,
            handler,
            events_tx,
            events,
            state: State::Idle,
            next_cycle: 0,
        })
    }
}

/// Externally visible lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No capture in flight; `start` is accepted.
    Idle,
    /// A capture cycle is in flight.
    Started,
    /// A fatal outcome was delivered. Only `destroy` remains.
    Dead,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Started { cycle: u64, since: Instant },
    Dead,
}

/// One capture relationship with an output or its cursor.
///
/// At most one capture cycle is in flight at a time. Results are queued
/// by the backend and delivered to the handler by [`dispatch`] or
/// [`dispatch_timeout`]. Results for a cycle that was stopped are
/// discarded at that point, so nothing is delivered for it even if the
/// backend had already finished.
///
/// Dropping the session is the same as [`destroy`].
///
/// [`dispatch`]: CaptureSession::dispatch
/// [`dispatch_timeout`]: CaptureSession::dispatch_timeout
/// [`destroy`]: CaptureSession::destroy
pub struct CaptureSession<H: CaptureHandler> {
    backend_name: &'static str,
    request: CaptureRequest,
    capturer: Box<dyn Capturer>,
    handler: H,
    events_tx: mpsc::Sender<SessionEvent>,
    events: mpsc::Receiver<SessionEvent>,
    state: State,
    next_cycle: u64,
}

impl<H: CaptureHandler> CaptureSession<H> {
    pub fn output(&self) -> &OutputId {
        &self.request.output
    }

    pub fn kind(&self) -> CaptureKind {
        self.request.kind
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn render_cursor(&self) -> bool {
        self.request.render_cursor
    }

    pub fn rate_limit(&self) -> f64 {
        self.request.rate_limit
    }

    pub fn gpu_buffers_enabled(&self) -> bool {
        self.request.enable_gpu_buffers
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            State::Idle => SessionState::Idle,
            State::Started { .. } => SessionState::Started,
            State::Dead => SessionState::Dead,
        }
    }

    /// How long the current cycle has been in flight. Consumers that want
    /// a timeout build it on this.
    pub fn in_flight_for(&self) -> Option<Duration> {
        match self.state {
            State::Started { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Request one capture cycle.
    ///
    /// The outcome is delivered through the handler, never through the
    /// return value. Returns `AlreadyStarted` while a cycle is in flight
    /// and `SessionDead` after a fatal outcome.
    pub fn start(&mut self, immediate: bool) -> CaptureResult<()> {
        match self.state {
            State::Idle => {}
            State::Started { cycle, .. } => {
                warn!(
                    output = %self.request.output,
                    cycle,
                    "start called while a capture is already in flight"
                );
                return Err(CaptureError::AlreadyStarted);
            }
            State::Dead => return Err(CaptureError::SessionDead),
        }

        self.next_cycle = self.next_cycle.wrapping_add(1);
        let cycle = self.next_cycle;
        let completion = Completion::new(cycle, self.events_tx.clone());
        self.state = State::Started {
            cycle,
            since: Instant::now(),
        };

        if let Err(error) = self.capturer.start(immediate, completion) {
            // Whatever the dropped completion queued is stale now.
            self.state = State::Idle;
            debug!(
                backend = self.backend_name,
                output = %self.request.output,
                cycle,
                %error,
                "backend rejected capture start"
            );
            return Err(error);
        }

        trace!(output = %self.request.output, cycle, immediate, "capture cycle started");
        Ok(())
    }

    /// Cancel the in-flight cycle, if any. No outcome is delivered for it
    /// afterwards. Calling this with nothing in flight does nothing.
    pub fn stop(&mut self) {
        if let State::Started { cycle, .. } = self.state {
            self.capturer.stop();
            self.state = State::Idle;
            debug!(output = %self.request.output, cycle, "capture cycle stopped");
        }
    }

    /// Stop any in-flight capture and release the backend.
    pub fn destroy(self) {
        drop(self);
    }

    /// Deliver every queued event without blocking. Returns how many
    /// callbacks ran.
    pub fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.events.try_recv() {
            delivered += usize::from(self.deliver(event));
        }
        delivered
    }

    /// Wait up to `timeout` for an event, then deliver everything queued.
    /// Returns how many callbacks ran.
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> usize {
        match self.events.recv_timeout(timeout) {
            Ok(event) => usize::from(self.deliver(event)) + self.dispatch(),
            Err(_) => 0,
        }
    }

    fn deliver(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Completed { cycle, outcome } => {
                let current = match self.state {
                    State::Started { cycle: current, .. } => Some(current),
                    _ => None,
                };
                if current != Some(cycle) {
                    trace!(
                        output = %self.request.output,
                        cycle,
                        outcome = ?outcome.kind(),
                        "discarding outcome of a stopped capture cycle"
                    );
                    return false;
                }

                let kind = outcome.kind();
                self.state = match kind {
                    OutcomeKind::Fatal => State::Dead,
                    OutcomeKind::Done | OutcomeKind::Failed => State::Idle,
                };
                match kind {
                    OutcomeKind::Fatal => warn!(
                        backend = self.backend_name,
                        output = %self.request.output,
                        cycle,
                        "capture session is no longer usable"
                    ),
                    OutcomeKind::Failed => debug!(
                        output = %self.request.output,
                        cycle,
                        "capture cycle failed"
                    ),
                    OutcomeKind::Done => {
                        trace!(output = %self.request.output, cycle, "capture cycle done")
                    }
                }
                self.handler.on_done(outcome);
                true
            }
            SessionEvent::Cursor(event) => {
                match event {
                    CursorEvent::Enter => self.handler.cursor_enter(),
                    CursorEvent::Leave => self.handler.cursor_leave(),
                    CursorEvent::Hotspot { x, y } => self.handler.cursor_hotspot(x, y),
                }
                true
            }
        }
    }
}

impl<H: CaptureHandler> Drop for CaptureSession<H> {
    fn drop(&mut self) {
        self.stop();
        debug!(
            backend = self.backend_name,
            output = %self.request.output,
            "capture session destroyed"
        );
    }
}

#[derive(Default)]
struct OneShot {
    outcome: Option<CaptureOutcome>,
}

impl CaptureHandler for OneShot {
    fn on_done(&mut self, outcome: CaptureOutcome) {
        self.outcome = Some(outcome);
    }
}

/// Capture a single frame of `output` with the most recent content,
/// waiting at most `timeout`.
pub fn capture_once(
    backend: Arc<dyn CaptureBackend>,
    output: OutputId,
    timeout: Duration,
) -> CaptureResult<Frame> {
    let mut session = CaptureSessionBuilder::new(backend)
        .rate_limit(0.0)
        .create(output, OneShot::default())?;
    session.start(true)?;

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CaptureError::Timeout);
        }
        session.dispatch_timeout(remaining);
        match session.handler_mut().outcome.take() {
            Some(CaptureOutcome::Done(frame)) => return Ok(frame),
            Some(CaptureOutcome::Failed) => return Err(CaptureError::CaptureFailed),
            Some(CaptureOutcome::Fatal) => return Err(CaptureError::SessionDead),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Shared {
        pending: Vec<(bool, Completion)>,
        requests: Vec<CaptureRequest>,
        contexts: Vec<CaptureContext>,
        stops: usize,
        destroyed: usize,
        reject_start: bool,
    }

    struct ManualBackend {
        shared: Arc<Mutex<Shared>>,
        cursor_supported: bool,
    }

    struct ManualCapturer {
        shared: Arc<Mutex<Shared>>,
    }

    impl Capturer for ManualCapturer {
        fn start(&mut self, immediate: bool, completion: Completion) -> CaptureResult<()> {
            let mut shared = self.shared.lock().unwrap();
            if shared.reject_start {
                return Err(CaptureError::Platform(anyhow::anyhow!("mock start rejected")));
            }
            shared.pending.push((immediate, completion));
            Ok(())
        }

        fn stop(&mut self) {
            self.shared.lock().unwrap().stops += 1;
        }
    }

    impl Drop for ManualCapturer {
        fn drop(&mut self) {
            self.shared.lock().unwrap().destroyed += 1;
        }
    }

    impl ManualBackend {
        fn bind(
            &self,
            request: &CaptureRequest,
            context: CaptureContext,
        ) -> CaptureResult<Box<dyn Capturer>> {
            if request.output.name() == "disconnected" {
                return Err(CaptureError::OutputLost);
            }
            let mut shared = self.shared.lock().unwrap();
            shared.requests.push(request.clone());
            shared.contexts.push(context);
            Ok(Box::new(ManualCapturer {
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    impl CaptureBackend for ManualBackend {
        fn name(&self) -> &'static str {
            "manual"
        }

        fn create(
            &self,
            request: &CaptureRequest,
            context: CaptureContext,
        ) -> CaptureResult<Box<dyn Capturer>> {
            self.bind(request, context)
        }

        fn create_cursor(
            &self,
            request: &CaptureRequest,
            context: CaptureContext,
        ) -> CaptureResult<Box<dyn Capturer>> {
            if !self.cursor_supported {
                return Err(CaptureError::BackendUnavailable("no cursor capture".into()));
            }
            self.bind(request, context)
        }
    }

    #[derive(Default)]
    struct Recorder {
        outcomes: Vec<OutcomeKind>,
        frame_sizes: Vec<(u32, u32)>,
        cursor: Vec<CursorEvent>,
    }

    impl CaptureHandler for Recorder {
        fn on_done(&mut self, outcome: CaptureOutcome) {
            if let CaptureOutcome::Done(frame) = &outcome {
                self.frame_sizes.push(frame.dimensions());
            }
            self.outcomes.push(outcome.kind());
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

    fn backend() -> (Arc<Mutex<Shared>>, Arc<dyn CaptureBackend>) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let backend = Arc::new(ManualBackend {
            shared: Arc::clone(&shared),
            cursor_supported: true,
        });
        (shared, backend)
    }

    fn output() -> OutputId {
        OutputId::new(7, "HDMI-A-1", 64, 64)
    }

    fn session(backend: &Arc<dyn CaptureBackend>) -> CaptureSession<Recorder> {
        CaptureSessionBuilder::new(Arc::clone(backend))
            .create(output(), Recorder::default())
            .unwrap()
    }

    fn take_pending(shared: &Arc<Mutex<Shared>>) -> Completion {
        shared.lock().unwrap().pending.remove(0).1
    }

    fn small_frame() -> Frame {
        Frame::zeroed(4, 4, 16, PixelFormat::Xrgb8888).unwrap()
    }

    #[test]
    fn create_fails_for_unbindable_output() {
        let (_, backend) = backend();
        let result = CaptureSessionBuilder::new(backend).create(
            OutputId::new(1, "disconnected", 0, 0),
            Recorder::default(),
        );
        assert!(matches!(result, Err(CaptureError::OutputLost)));
    }

    #[test]
    fn cursor_session_fails_when_backend_lacks_support() {
        let backend: Arc<dyn CaptureBackend> = Arc::new(ManualBackend {
            shared: Arc::default(),
            cursor_supported: false,
        });
        let result =
            CaptureSessionBuilder::new(backend).create_cursor(output(), Recorder::default());
        assert!(matches!(result, Err(CaptureError::BackendUnavailable(_))));
    }

    #[test]
    fn config_reaches_backend_request() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let _frame_session = CaptureSessionBuilder::new(Arc::clone(&backend))
            .render_cursor(true)
            .rate_limit(12.5)
            .gpu_buffers(true)
            .create(output(), Recorder::default())?;
        let _cursor_session = CaptureSessionBuilder::new(backend)
            .render_cursor(true)
            .create_cursor(output(), Recorder::default())?;

        let shared = shared.lock().unwrap();
        let frame_request = &shared.requests[0];
        assert_eq!(frame_request.kind, CaptureKind::Output);
        assert!(frame_request.render_cursor);
        assert_eq!(frame_request.rate_limit, 12.5);
        assert!(frame_request.enable_gpu_buffers);

        let cursor_request = &shared.requests[1];
        assert_eq!(cursor_request.kind, CaptureKind::Cursor);
        assert!(!cursor_request.render_cursor);
        Ok(())
    }

    #[test]
    fn invalid_rate_limit_is_rejected() {
        let (shared, backend) = backend();
        for rate_limit in [f64::NAN, -1.0, f64::INFINITY, 1e-20, f64::MIN_POSITIVE] {
            let result = CaptureSessionBuilder::new(Arc::clone(&backend))
                .rate_limit(rate_limit)
                .create(output(), Recorder::default());
            assert!(
                matches!(result, Err(CaptureError::InvalidConfig(_))),
                "rate limit {rate_limit} was accepted"
            );
        }
        assert!(shared.lock().unwrap().requests.is_empty());
    }

    #[test]
    fn done_is_delivered_exactly_once() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        assert_eq!(session.state(), SessionState::Started);
        assert!(!shared.lock().unwrap().pending[0].0);

        take_pending(&shared).done(small_frame());
        assert_eq!(session.dispatch(), 1);
        assert_eq!(session.dispatch(), 0);

        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Done]);
        assert_eq!(session.handler().frame_sizes, vec![(4, 4)]);
        assert_eq!(session.state(), SessionState::Idle);
        Ok(())
    }

    #[test]
    fn second_start_while_in_flight_is_rejected() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(true)?;
        assert!(matches!(session.start(true), Err(CaptureError::AlreadyStarted)));
        assert_eq!(shared.lock().unwrap().pending.len(), 1);
        assert_eq!(session.state(), SessionState::Started);
        Ok(())
    }

    #[test]
    fn stop_suppresses_an_already_queued_outcome() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        take_pending(&shared).done(small_frame());
        session.stop();
        assert_eq!(session.dispatch(), 0);
        assert!(session.handler().outcomes.is_empty());

        session.start(false)?;
        take_pending(&shared).failed();
        assert_eq!(session.dispatch(), 1);
        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Failed]);
        Ok(())
    }

    #[test]
    fn late_outcome_after_stop_and_restart_is_ignored() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        let stale = take_pending(&shared);
        session.stop();
        session.start(false)?;
        let current = take_pending(&shared);

        stale.done(small_frame());
        assert_eq!(session.dispatch(), 0);
        assert_eq!(session.state(), SessionState::Started);

        current.failed();
        assert_eq!(session.dispatch(), 1);
        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Failed]);
        Ok(())
    }

    #[test]
    fn stop_without_capture_is_a_no_op() {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.stop();
        session.stop();
        assert_eq!(shared.lock().unwrap().stops, 0);
    }

    #[test]
    fn failed_outcome_allows_retry() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        take_pending(&shared).failed();
        session.dispatch();
        session.start(false)?;
        take_pending(&shared).done(small_frame());
        session.dispatch();

        assert_eq!(
            session.handler().outcomes,
            vec![OutcomeKind::Failed, OutcomeKind::Done]
        );
        Ok(())
    }

    #[test]
    fn fatal_outcome_kills_the_session() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        take_pending(&shared).fatal();
        session.dispatch();

        assert_eq!(session.state(), SessionState::Dead);
        assert!(matches!(session.start(false), Err(CaptureError::SessionDead)));
        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Fatal]);
        Ok(())
    }

    #[test]
    fn forgotten_completion_reports_failure() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        drop(take_pending(&shared));
        assert_eq!(session.dispatch(), 1);
        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Failed]);
        Ok(())
    }

    #[test]
    fn rejected_backend_start_leaves_session_idle() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        shared.lock().unwrap().reject_start = true;
        assert!(session.start(false).is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.dispatch(), 0);

        shared.lock().unwrap().reject_start = false;
        session.start(false)?;
        take_pending(&shared).done(small_frame());
        assert_eq!(session.dispatch(), 1);
        Ok(())
    }

    #[test]
    fn destroy_stops_in_flight_capture_and_releases_backend() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(false)?;
        let completion = take_pending(&shared);
        session.destroy();

        {
            let shared = shared.lock().unwrap();
            assert_eq!(shared.stops, 1);
            assert_eq!(shared.destroyed, 1);
        }
        // Resolving after destroy must be harmless.
        completion.done(small_frame());
        Ok(())
    }

    #[test]
    fn cursor_events_are_delivered_independently_of_cycles() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = CaptureSessionBuilder::new(backend)
            .create_cursor(output(), Recorder::default())?;

        let context = shared.lock().unwrap().contexts[0].clone();
        context.cursor_enter();
        context.cursor_hotspot(3, 5);
        context.cursor_leave();

        assert_eq!(session.dispatch(), 3);
        assert_eq!(
            session.handler().cursor,
            vec![
                CursorEvent::Enter,
                CursorEvent::Hotspot { x: 3, y: 5 },
                CursorEvent::Leave
            ]
        );
        assert!(session.handler().outcomes.is_empty());
        Ok(())
    }

    #[test]
    fn dispatch_timeout_waits_for_cross_thread_completion() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let mut session = session(&backend);

        session.start(true)?;
        let completion = take_pending(&shared);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completion.done(small_frame());
        });

        let mut delivered = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered == 0 && Instant::now() < deadline {
            delivered += session.dispatch_timeout(Duration::from_millis(100));
        }
        worker.join().unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(session.handler().outcomes, vec![OutcomeKind::Done]);
        Ok(())
    }

    #[test]
    fn boxed_handlers_are_accepted() -> CaptureResult<()> {
        let (shared, backend) = backend();
        let handler: Box<dyn CaptureHandler> = Box::new(Recorder::default());
        let mut session = CaptureSessionBuilder::new(backend).create(output(), handler)?;

        session.start(false)?;
        take_pending(&shared).failed();
        assert_eq!(session.dispatch(), 1);
        Ok(())
    }
}
