pub mod backend;
pub mod capture_session;
pub mod damage;
pub(crate) mod env_config;
pub mod error;
pub mod frame;
pub mod hash;
pub mod output;
mod parallel;
pub mod pipeline;
pub mod region;
pub mod threaded;

pub use backend::{
    CaptureBackend, CaptureContext, CaptureKind, CaptureOutcome, CaptureRequest, Capturer,
    Completion, CursorEvent, OutcomeKind,
};
pub use capture_session::{
    CaptureHandler, CaptureSession, CaptureSessionBuilder, CaptureSessionConfig, SessionState,
    capture_once,
};
pub use damage::{DamageRefinery, TILE_SIZE, TileHashStore};
pub use error::{CaptureError, CaptureErrorClass, CaptureResult};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use output::{OutputId, OutputKey};
pub use parallel::warmup;
pub use pipeline::{
    DamageEvent, OutputPipeline, PipelineConfig, PipelineEnd, PipelineExit, PipelineHandle,
    PipelineSet, PipelineStats, PipelineStatsSnapshot,
};
pub use region::{DirtyRect, Region};
pub use threaded::{CursorState, FrameSource, FrameSourceFactory, ThreadedBackend};

#[cfg(feature = "tokio-stream")]
pub use pipeline::AsyncPipelineHandle;
