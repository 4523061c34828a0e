//! Error types for the Vessel build engine.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. The variants map onto the failure classes of the build pipeline:
//! recipe parsing, bootstrap sources, mounts, scripts and orchestration.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for build engine operations.
pub type Result<T> = std::result::Result<T, VesselError>;

/// Main error type for the build engine.
#[derive(Error, Debug)]
pub enum VesselError {
    // Recipe errors
    #[error("invalid section(s) specified: {}", sections.join(", "))]
    InvalidSection { sections: Vec<String> },

    #[error("invalid recipe header: {reason}")]
    InvalidHeader { reason: String },

    #[error("empty definition file")]
    EmptyDefinition,

    #[error("no stages found in definition file")]
    NoStages,

    #[error("recipe parse error: {reason}")]
    RecipeParse { reason: String },

    // Bootstrap source errors
    #[error("unknown bootstrap agent: {kind}")]
    UnknownBootstrap { kind: String },

    #[error("conveyor failed to get: {reason}")]
    ConveyorFailed { reason: String },

    #[error("packer failed to pack: {reason}")]
    PackerFailed { reason: String },

    #[error("undefined image cache")]
    UndefinedImageCache,

    // Stage errors
    #[error("stage {stage} was not found")]
    StageLookup { stage: String },

    #[error("{name} script failed: {reason}")]
    ScriptFailure { name: String, reason: String },

    // Mount and driver errors
    #[error("mount inoperable: {reason}")]
    MountInoperable { reason: String },

    // Orchestration errors
    #[error("build interrupted")]
    Interrupted,

    #[error("unsupported operation: {operation}. {reason}")]
    UnsupportedOperation { operation: String, reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VesselError {
    /// Wrap an `io::Error` with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Process exit code for a failed build: signal-driven termination exits
    /// with 1, everything else with the engine failure code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 1,
            _ => 2,
        }
    }
}
