//! # recorder-core
//!
//! Supervision logic for continuous RTSP camera recording: launches an external
//! encoder that writes fixed-duration segments, watches that the segments keep
//! growing, restarts the encoder when it exits or stalls, and keeps the
//! recording directory inside its count and size limits.
//!
//! ## Design Principles
//!
//! - **Synchronous**: Plain threads and channels, no async runtime.
//! - **One encoder at a time**: A replacement is launched only after the
//!   previous process has been reaped.
//! - **Filenames are the clock**: Segment order comes from the timestamp in the
//!   file name, never from filesystem metadata.
//! - **Never give up**: Launch failures and crashes back off, they do not stop
//!   the daemon. Only a shutdown request ends a run.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use recorder_core::{FfmpegLauncher, RecorderConfig, ShutdownFlag, Supervisor};
//! use std::sync::Arc;
//!
//! let config = Arc::new(RecorderConfig::new("rtsp://camera.local/stream"));
//! let shutdown = ShutdownFlag::new();
//! let launcher = FfmpegLauncher::new(Arc::clone(&config));
//! let stats = Supervisor::new(config, launcher, shutdown).run();
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod liveness;
pub mod restart;
pub mod retention;
pub mod segment;
pub mod session;
pub mod shutdown;
pub mod supervisor;

pub use config::{ConfigLayer, RecorderConfig, RtspTransport};
pub use encoder::{EncoderLauncher, EncoderProcess, FfmpegLauncher, FfmpegProcess};
pub use error::{ConfigError, LaunchError, RetentionError};
pub use liveness::{LivenessMonitor, LivenessVerdict, StaleReason};
pub use restart::{ExitClass, RestartDecision, RestartPolicy, Termination};
pub use retention::{sweep, ActiveSegment, RetentionPolicy, RetentionWorker, SweepReport};
pub use segment::SegmentFile;
pub use session::{EncoderExit, RecordingSession, SessionState};
pub use shutdown::{request_stop, EscalationStage, EscalationTimeouts, ShutdownFlag, StopOutcome};
pub use supervisor::{Supervisor, SupervisorStats};
