//! The shared mutable state threaded through every pipeline stage, plus the
//! `Stage` trait stages implement. Grounded on `pipeline/base.py`.

use crate::types::{Segment, TaskStatus, TranscriptEntry};
use async_trait::async_trait;
use std::path::PathBuf;

/// Accumulated pipeline state. Each stage reads what earlier stages wrote
/// and writes its own output; nothing is removed, so a later stage (or a
/// resumed task) can always inspect what ran before it.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub task_id: String,
    pub source_path: Option<PathBuf>,
    pub media_type: String,
    pub audio_path: Option<PathBuf>,
    pub video_path: Option<PathBuf>,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub segments: Vec<Segment>,
    pub keyframe_paths: Vec<PathBuf>,
    pub ocr_events: Vec<(i64, String, String)>,
    pub visual_events: Vec<(i64, String)>,
    pub transcript: Vec<TranscriptEntry>,
    pub eval_only: bool,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub hotwords: Vec<String>,
    /// Per-segment corrected text keyed by its index in `segments`, built by
    /// `TextCorrectionStage` and consumed by `TranscriptBuildStage`.
    pub correction_map: std::collections::HashMap<usize, String>,
    pub keyframes: Vec<crate::types::KeyFrame>,
    pub ocr_records: Vec<crate::types::OcrRecord>,
    pub processing_times: std::collections::HashMap<String, f64>,
}

impl PipelineContext {
    pub fn new(task_id: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            media_type: media_type.into(),
            ..Default::default()
        }
    }
}

/// A reporting callback stages use to publish `(status, current, total)`
/// progress as they run; the task store turns this into `TaskProgress`.
pub type ProgressCallback = Box<dyn Fn(TaskStatus, u32, u32) + Send + Sync>;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this stage applies to the current context — e.g. the video
    /// stages no-op for audio-only uploads, OCR/visual stages no-op when
    /// no rule in the uploaded set needs visual evidence.
    fn should_run(&self, ctx: &PipelineContext) -> bool;

    async fn execute(
        &self,
        ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext>;
}
