//! The transcript production pipeline: a fixed sequence of stages driven by
//! an [`orchestrator::Orchestrator`] over one [`context::PipelineContext`].
//! See spec §4.9.

pub mod context;
pub mod orchestrator;
pub mod stages;

pub use context::{PipelineContext, ProgressCallback, Stage};
pub use orchestrator::Orchestrator;
