//! Linear stage runner. Grounded on `pipeline/orchestrator.py`'s
//! `PipelineOrchestrator.register`/`.run`: stages execute strictly in
//! registration order, a stage whose `should_run` returns false is skipped
//! (not removed — it still occupies a slot in the progress total), and each
//! stage's wall time is recorded before the next one starts.

use super::context::{PipelineContext, ProgressCallback, Stage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Builds a fixed stage sequence, then drives every registered task through
/// it. Never reorders, never reruns, never parallelizes a stage — the
/// process-global GPU contention (see spec §5) precludes running stages
/// concurrently within one task.
#[derive(Default)]
pub struct Orchestrator {
    stages: Vec<Arc<dyn Stage>>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn register(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Run every registered stage over `ctx` in order, skipping those whose
    /// `should_run` predicate is false. `on_stage_progress` receives
    /// `(stage_name, stage_index, total_stages)` once per stage boundary;
    /// stages themselves drive the finer-grained `(current, total)` callback.
    pub async fn run(
        &self,
        mut ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let total_stages = self.stages.len();
        let mut elapsed: HashMap<String, f64> = HashMap::new();

        for (idx, stage) in self.stages.iter().enumerate() {
            if !stage.should_run(&ctx) {
                info!(stage = stage.name(), "skipping stage (should_run=false)");
                continue;
            }

            info!(stage = stage.name(), index = idx, total = total_stages, "running stage");
            let start = Instant::now();
            ctx = stage.execute(ctx, progress).await?;
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            elapsed.insert(stage.name().to_string(), elapsed_ms);
            info!(stage = stage.name(), elapsed_ms, "stage completed");
        }

        ctx.processing_times = elapsed;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingStage {
        label: &'static str,
        runs: Arc<std::sync::Mutex<Vec<&'static str>>>,
        should_run: bool,
    }

    #[async_trait]
    impl Stage for RecordingStage {
        fn name(&self) -> &'static str {
            self.label
        }
        fn should_run(&self, _ctx: &PipelineContext) -> bool {
            self.should_run
        }
        async fn execute(
            &self,
            ctx: PipelineContext,
            _progress: &ProgressCallback,
        ) -> anyhow::Result<PipelineContext> {
            self.runs.lock().unwrap().push(self.label);
            Ok(ctx)
        }
    }

    #[tokio::test]
    async fn runs_stages_in_order_and_skips_disabled_ones() {
        let runs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new()
            .register(Arc::new(RecordingStage { label: "a", runs: runs.clone(), should_run: true }))
            .register(Arc::new(RecordingStage { label: "b", runs: runs.clone(), should_run: false }))
            .register(Arc::new(RecordingStage { label: "c", runs: runs.clone(), should_run: true }));

        let ctx = PipelineContext::new("task1", "audio");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let progress: ProgressCallback = Box::new(move |_status: TaskStatus, _cur, _total| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        let result = orchestrator.run(ctx, &progress).await.unwrap();
        assert_eq!(*runs.lock().unwrap(), vec!["a", "c"]);
        assert!(result.processing_times.contains_key("a"));
        assert!(result.processing_times.contains_key("c"));
        assert!(!result.processing_times.contains_key("b"));
    }
}
