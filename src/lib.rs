//! Copernicus Audit - video/audio compliance transcription pipeline.
//!
//! A multi-stage asynchronous pipeline that turns uploaded audio/video into
//! a speaker-attributed, LLM-polished transcript, then evaluates that
//! transcript against a user-supplied rule set for compliance violations.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use copernicus_audit::config::Config;
//! use copernicus_audit::persistence::PersistenceService;
//! use copernicus_audit::task_store::TaskStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let persistence = Arc::new(PersistenceService::new(&config.persistence.uploads_dir)?);
//!     let store = Arc::new(TaskStore::new(config, persistence));
//!     store.restore_from_disk().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod compliance;
pub mod config;
pub mod corrector;
pub mod diarizer;
pub mod error;
pub mod evaluator;
pub mod llm;
pub mod model_manager;
pub mod persistence;
pub mod pipeline;
pub mod server;
pub mod task_store;
pub mod text;
pub mod types;

pub use config::Config;
pub use error::CoreError;
pub use task_store::TaskStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - video/audio compliance transcription pipeline", NAME, VERSION)
}
