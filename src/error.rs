use std::fmt;

#[derive(Debug)]
pub enum CaptureError {
    InvalidTarget(String),

    /// The output a session was bound to disappeared.
    OutputLost,

    AccessLost,

    Timeout,

    BufferOverflow,

    InvalidConfig(String),

    WorkerDead,

    BackendUnavailable(String),

    Canceled,

    /// The backend reported a transient failure for a capture cycle.
    CaptureFailed,

    /// `start` was called while a capture cycle is still in flight.
    AlreadyStarted,

    /// The session received a fatal outcome and must be destroyed.
    SessionDead,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl CaptureError {
    pub fn class(&self) -> CaptureErrorClass {
        match self {
            Self::InvalidTarget(_) | Self::InvalidConfig(_) | Self::AlreadyStarted => {
                CaptureErrorClass::InvalidInput
            }
            Self::BackendUnavailable(_) => CaptureErrorClass::Unsupported,
            Self::AccessLost
            | Self::Timeout
            | Self::Canceled
            | Self::CaptureFailed => CaptureErrorClass::Transient,
            Self::OutputLost
            | Self::WorkerDead
            | Self::SessionDead
            | Self::BufferOverflow
            | Self::Platform(_) => CaptureErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), CaptureErrorClass::Transient)
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget(id) => {
                write!(f, "requested output is not available to this backend: {id}")
            }
            Self::OutputLost => write!(f, "requested output is no longer available"),
            Self::AccessLost => write!(f, "capture access lost"),
            Self::Timeout => write!(f, "failed to acquire a frame within timeout"),
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::InvalidConfig(message) => write!(f, "invalid capture configuration: {message}"),
            Self::WorkerDead => write!(f, "capture worker is not running"),
            Self::BackendUnavailable(message) => {
                write!(f, "no available backend implementation: {message}")
            }
            Self::Canceled => write!(f, "capture request was canceled"),
            Self::CaptureFailed => write!(f, "backend could not produce a frame this cycle"),
            Self::AlreadyStarted => write!(f, "a capture is already in flight on this session"),
            Self::SessionDead => {
                write!(f, "capture session hit a fatal error and must be destroyed")
            }
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(CaptureError::Timeout.is_retryable());
        assert!(CaptureError::AccessLost.is_retryable());
        assert!(!CaptureError::OutputLost.is_retryable());
        assert!(!CaptureError::AlreadyStarted.is_retryable());
    }

    #[test]
    fn platform_errors_are_fatal_and_keep_their_source() {
        use std::error::Error as _;

        let error = CaptureError::Platform(anyhow::anyhow!("compositor went away"));
        assert_eq!(error.to_string(), "compositor went away");
        assert_eq!(error.class(), CaptureErrorClass::Fatal);
        assert!(error.source().is_some());
        assert_eq!(
            CaptureError::BackendUnavailable("none".into()).class(),
            CaptureErrorClass::Unsupported
        );
    }
}
