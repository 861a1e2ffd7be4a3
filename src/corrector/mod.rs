//! Four-phase transcript correction: rule-based cleanup, hotword
//! replacement, an optional light CSC (Chinese Spelling Correction) pass,
//! and batched LLM polish. Grounded on `text_corrector.py` and
//! `hotword_replacer.py`. See spec §4.6.

mod hotwords;
mod llm_polish;
mod rule_clean;

pub use hotwords::HotwordReplacer;
pub use llm_polish::{polish_batches, polish_batches_with_progress, CorrectionCollaborator};

use crate::config::CorrectorConfig;
use crate::types::Segment;

/// External collaborator for the optional light-CSC phase. Defaults to the
/// identity pass (`None` below) when no collaborator is configured, exactly
/// matching spec's "falls back to identity" requirement.
#[async_trait::async_trait]
pub trait LightCscCollaborator: Send + Sync {
    async fn correct(&self, text: &str) -> anyhow::Result<String>;
}

pub struct Corrector {
    config: CorrectorConfig,
    hotwords: HotwordReplacer,
    light_csc: Option<Box<dyn LightCscCollaborator>>,
}

impl Corrector {
    pub fn new(config: CorrectorConfig, hotwords: HotwordReplacer) -> Self {
        Self {
            config,
            hotwords,
            light_csc: None,
        }
    }

    pub fn with_light_csc(mut self, collaborator: Box<dyn LightCscCollaborator>) -> Self {
        self.light_csc = Some(collaborator);
        self
    }

    /// Run phases 1-3 (rule clean, hotword replace, light CSC) over every
    /// segment's text in place. Phase 4 (LLM polish) is driven separately by
    /// the pipeline stage since it needs an `LlmClient` and operates on
    /// pre-merged batches rather than individual segments.
    pub async fn correct_segments(&self, segments: &mut [Segment]) -> anyhow::Result<()> {
        for seg in segments.iter_mut() {
            if crate::text::is_noise_segment(&seg.text) {
                continue;
            }
            let mut text = rule_clean::clean(&seg.text);
            text = self.hotwords.replace(&text);
            if let Some(collaborator) = &self.light_csc {
                text = collaborator.correct(&text).await?;
            }
            seg.text = text;
        }
        Ok(())
    }

    pub fn merge_gap_ms(&self) -> i64 {
        self.config.pre_merge_gap_ms
    }

    pub fn confidence_skip_threshold(&self) -> f64 {
        self.config.confidence_skip_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubSentence;

    fn seg(text: &str) -> Segment {
        Segment {
            text: text.to_string(),
            start_ms: 0,
            end_ms: 1000,
            confidence: 0.9,
            speaker: 0,
            sub_sentences: vec![SubSentence {
                text: text.to_string(),
                start_ms: 0,
                end_ms: 1000,
            }],
        }
    }

    #[tokio::test]
    async fn correct_segments_skips_pure_noise() {
        let corrector = Corrector::new(CorrectorConfig::default(), HotwordReplacer::empty());
        let mut segments = vec![seg("嗯"), seg("保本理财产品")];
        corrector.correct_segments(&mut segments).await.unwrap();
        assert_eq!(segments[0].text, "嗯");
    }
}
