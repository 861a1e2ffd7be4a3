//! Typed error taxonomy for the core pipeline and its callers.
//!
//! Each core component raises one of these variants; `anyhow::Result` is
//! used only at the outer (binary / HTTP-handler) boundary to add context
//! while propagating a `CoreError` up the stack.

use thiserror::Error;

/// Errors surfaced by the audio/video → WAV pre-processing stages.
#[derive(Debug, Error)]
pub enum AudioProcessingError {
    #[error("ffmpeg exited with a non-zero status: {0}")]
    FfmpegFailed(String),
    #[error("failed to spawn external process: {0}")]
    SpawnFailed(#[from] std::io::Error),
    #[error("unsupported media container: {0}")]
    UnsupportedContainer(String),
}

/// Errors surfaced by the ASR adapter.
#[derive(Debug, Error)]
pub enum AsrError {
    #[error("ASR engine call failed: {0}")]
    EngineFailure(String),
    #[error("ASR engine returned malformed output: {0}")]
    MalformedOutput(String),
}

/// Errors surfaced by the four-phase corrector when a phase cannot recover.
#[derive(Debug, Error)]
pub enum CorrectionError {
    #[error("hotword file could not be loaded: {0}")]
    HotwordLoadFailed(String),
    #[error("LLM batch correction failed irrecoverably: {0}")]
    BatchFailed(String),
}

/// Errors surfaced by rule parsing and the compliance audit engine.
#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("rule file could not be decoded with any supported codec")]
    UndecodableRuleFile,
    #[error("rule file parse error: {0}")]
    RuleParseFailed(String),
    #[error("xlsx support unavailable: {0}")]
    XlsxUnavailable(String),
}

/// Errors surfaced by the persistence layer on write failure.
///
/// Reads never raise `StorageError` — a missing or corrupt file on a read
/// path is tolerated and surfaced as `None`, per spec.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create task directory {path}: {source}")]
    DirCreateFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the LLM client's transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("LLM transport error after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("LLM server returned a non-retryable error ({status}): {body}")]
    ServerError { status: u16, body: String },
}

/// Raised by the task-store timeout wrapper.
#[derive(Debug, Error)]
#[error("task exceeded its timeout of {0} seconds")]
pub struct TaskTimeoutError(pub u64);

/// Umbrella error type unifying every typed component error, used anywhere
/// a function can fail across component boundaries (e.g. a pipeline stage).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Audio(#[from] AudioProcessingError),
    #[error(transparent)]
    Asr(#[from] AsrError),
    #[error(transparent)]
    Correction(#[from] CorrectionError),
    #[error(transparent)]
    Compliance(#[from] ComplianceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timeout(#[from] TaskTimeoutError),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for CoreError {
    fn from(value: anyhow::Error) -> Self {
        CoreError::Other(value.to_string())
    }
}
