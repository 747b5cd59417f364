//! The capture backend contract.
//!
//! A [`CaptureBackend`] binds to an output and hands back a [`Capturer`]
//! for one session. The capturer runs capture cycles asynchronously and
//! reports through two handles:
//!
//! - [`CaptureContext`], given at creation, for cursor notifications that
//!   may arrive at any time;
//! - [`Completion`], given to each [`Capturer::start`], which resolves that
//!   cycle exactly once.
//!
//! Both post into the owning session's event queue. Nothing reaches the
//! consumer until the session dispatches, so a session can drop events
//! for a cycle it already stopped.

use std::sync::mpsc;
use std::time::Duration;

use crate::error::{CaptureError, CaptureResult};
use crate::frame::Frame;
use crate::output::OutputId;

/// Outcome of one capture cycle.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// A populated frame.
    Done(Frame),
    /// The backend could not produce a frame this cycle. Starting again
    /// is allowed.
    Failed,
    /// The session can no longer capture and must be destroyed.
    Fatal,
}

impl CaptureOutcome {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Done(_) => OutcomeKind::Done,
            Self::Failed => OutcomeKind::Failed,
            Self::Fatal => OutcomeKind::Fatal,
        }
    }

    /// Map a backend error onto an outcome by its class.
    pub fn from_error(error: &CaptureError) -> Self {
        if error.is_retryable() {
            Self::Failed
        } else {
            Self::Fatal
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeKind {
    Done,
    Failed,
    Fatal,
}

/// Cursor notifications. These are best-effort and never gate frame
/// completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorEvent {
    Enter,
    Leave,
    Hotspot { x: i32, y: i32 },
}

/// What a session captures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureKind {
    /// Full output frames, with or without the cursor composited.
    Output,
    /// Only the cursor image and hotspot.
    Cursor,
}

/// Parameters a backend receives when binding a session to an output.
/// These are fixed for the session's lifetime.
#[derive(Clone, Debug)]
pub struct CaptureRequest {
    pub output: OutputId,
    pub kind: CaptureKind,
    /// Composite the pointer into frames instead of reporting it through
    /// cursor events. Always `false` for cursor sessions.
    pub render_cursor: bool,
    /// Maximum capture cycles per second. `0.0` means unlimited.
    pub rate_limit: f64,
    /// Allow the zero-copy GPU buffer path when the backend has one.
    pub enable_gpu_buffers: bool,
}

impl CaptureRequest {
    /// Minimum interval between two completed cycles implied by
    /// `rate_limit`. A rate too small for the interval to be represented
    /// saturates to `Duration::MAX`.
    pub fn min_interval(&self) -> Option<Duration> {
        if self.rate_limit > 0.0 && self.rate_limit.is_finite() {
            Some(Duration::try_from_secs_f64(1.0 / self.rate_limit).unwrap_or(Duration::MAX))
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub(crate) enum SessionEvent {
    Completed { cycle: u64, outcome: CaptureOutcome },
    Cursor(CursorEvent),
}

/// Reporting handle for notifications that are not tied to a cycle.
#[derive(Clone, Debug)]
pub struct CaptureContext {
    events: mpsc::Sender<SessionEvent>,
}

impl CaptureContext {
    pub(crate) fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self { events }
    }

    pub fn cursor_enter(&self) {
        self.cursor(CursorEvent::Enter);
    }

    pub fn cursor_leave(&self) {
        self.cursor(CursorEvent::Leave);
    }

    pub fn cursor_hotspot(&self, x: i32, y: i32) {
        self.cursor(CursorEvent::Hotspot { x, y });
    }

    pub fn cursor(&self, event: CursorEvent) {
        // The session may already be gone.
        let _ = self.events.send(SessionEvent::Cursor(event));
    }
}

/// One-shot resolver for a single capture cycle.
///
/// Consuming methods make a second resolution impossible. A completion
/// dropped without being resolved reports [`CaptureOutcome::Failed`].
#[derive(Debug)]
pub struct Completion {
    cycle: u64,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl Completion {
    pub(crate) fn new(cycle: u64, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            cycle,
            events: Some(events),
        }
    }

    /// Session-local cycle number, increasing with every accepted start.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn done(self, frame: Frame) {
        self.resolve(CaptureOutcome::Done(frame));
    }

    pub fn failed(self) {
        self.resolve(CaptureOutcome::Failed);
    }

    pub fn fatal(self) {
        self.resolve(CaptureOutcome::Fatal);
    }

    pub fn resolve(mut self, outcome: CaptureOutcome) {
        self.send(outcome);
    }

    /// Drop the cycle without reporting anything. For backends that
    /// observed a `stop` for this cycle.
    pub fn cancel(mut self) {
        self.events = None;
    }

    fn send(&mut self, outcome: CaptureOutcome) {
        if let Some(events) = self.events.take() {
            let _ = events.send(SessionEvent::Completed {
                cycle: self.cycle,
                outcome,
            });
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(CaptureOutcome::Failed);
    }
}

/// Per-session backend state. Dropping it releases everything the
/// backend allocated for the session.
pub trait Capturer: Send {
    /// Begin one capture cycle and resolve `completion` when it ends.
    ///
    /// `immediate` asks for the most recently presented content instead
    /// of waiting for new damage. Backends without that distinction may
    /// ignore it. An `Err` means the request itself was rejected; the
    /// session then discards whatever `completion` reports.
    fn start(&mut self, immediate: bool, completion: Completion) -> CaptureResult<()>;

    /// Cancel the in-flight cycle, if any. Must not block on the cycle
    /// finishing.
    fn stop(&mut self);
}

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(
        &self,
        request: &CaptureRequest,
        context: CaptureContext,
    ) -> CaptureResult<Box<dyn Capturer>>;

    fn create_cursor(
        &self,
        _request: &CaptureRequest,
        _context: CaptureContext,
    ) -> CaptureResult<Box<dyn Capturer>> {
        Err(CaptureError::BackendUnavailable(format!(
            "cursor capture is not supported by the {} backend",
            self.name()
        )))
    }
}
