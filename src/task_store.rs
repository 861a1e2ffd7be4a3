//! Task registry: id -> task state, hash dedup, timeout-guarded worker
//! spawning, and eviction. Grounded on `task_store.py`. See spec §4.10.

use crate::adapters::{HttpAsrEngine, HttpCscCollaborator, HttpFaceDetector, HttpOcrEngine, HttpVoiceEmbedder};
use crate::compliance::{rule_registry, rules_parse, ComplianceAuditor};
use crate::config::Config;
use crate::corrector::{Corrector, HotwordReplacer};
use crate::error::TaskTimeoutError;
use crate::evaluator::Evaluator;
use crate::llm::LlmClient;
use crate::model_manager::ModelManager;
use crate::persistence::PersistenceService;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::stages::{build_orchestrator, AsrMode};
use crate::types::{
    ComplianceReport, EvaluationResult, Segment, StructuredRule, SubSentence, TaskProgress, TaskStatus,
    TranscriptEntry, TranscriptResult,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Transcript,
    Evaluation,
    Compliance,
}

#[derive(Debug, Clone)]
pub enum TaskResultPayload {
    Transcript(TranscriptResult),
    Evaluation(EvaluationResult),
    Compliance(ComplianceReport),
}

/// One entry in the in-memory task registry. Cloned out to callers so the
/// registry lock is never held across a response serialization.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub parent_id: Option<String>,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub result: Option<TaskResultPayload>,
    pub error: Option<String>,
}

impl TaskRecord {
    fn pending(id: String, kind: TaskKind, parent_id: Option<String>) -> Self {
        Self {
            id,
            kind,
            parent_id,
            status: TaskStatus::Pending,
            progress: TaskProgress::compute(TaskStatus::Pending, 0, 0, false),
            result: None,
            error: None,
        }
    }
}

struct Registry {
    tasks: HashMap<String, TaskRecord>,
    insertion_order: VecDeque<String>,
    hash_index: HashMap<String, String>,
}

/// Holds the task registry, hash index, pipeline collaborators, evaluator
/// and compliance engine, and the persistence layer. See spec §4.10.
pub struct TaskStore {
    config: Config,
    persistence: Arc<PersistenceService>,
    registry: Arc<AsyncMutex<Registry>>,
    llm: Arc<LlmClient>,
    model_manager: Arc<ModelManager>,
    asr_lock: Arc<AsyncMutex<()>>,
    hotwords: HotwordReplacer,
}

fn parse_asr_mode(mode: &str) -> AsrMode {
    match mode {
        "paraformer" => AsrMode::Paraformer,
        _ => AsrMode::SenseVoice,
    }
}

impl TaskStore {
    pub fn new(config: Config, persistence: Arc<PersistenceService>) -> Self {
        let llm = Arc::new(LlmClient::new(
            config.llm.base_url.clone(),
            config.llm.model.clone(),
            config.llm.max_concurrent,
            config.llm.max_retries,
            config.llm.retry_base_delay_ms,
            config.llm.request_timeout_secs,
        ));
        let hotwords = config
            .corrector
            .hotwords_path
            .as_deref()
            .map(HotwordReplacer::from_file)
            .transpose()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to load hotwords file, continuing without hotwords");
                None
            })
            .unwrap_or_else(HotwordReplacer::empty);

        let registry = Registry {
            tasks: HashMap::new(),
            insertion_order: VecDeque::new(),
            hash_index: persistence.load_hash_index(),
        };

        Self {
            config,
            persistence,
            registry: Arc::new(AsyncMutex::new(registry)),
            llm,
            model_manager: Arc::new(ModelManager::new()),
            asr_lock: Arc::new(AsyncMutex::new(())),
            hotwords,
        }
    }

    fn new_corrector(&self) -> Corrector {
        let corrector = Corrector::new(self.config.corrector.clone(), self.hotwords.clone());
        if self.config.csc.enabled {
            corrector.with_light_csc(Box::new(HttpCscCollaborator::new(&self.config.csc.base_url)))
        } else {
            corrector
        }
    }

    fn build_orchestrator(&self) -> crate::pipeline::Orchestrator {
        let asr_mode = parse_asr_mode(&self.config.asr.mode);
        let asr_engine = Arc::new(HttpAsrEngine::new(&self.config.asr, asr_mode));
        let voice_embedder: Option<Arc<dyn crate::diarizer::VoiceEmbedder>> = if asr_mode == AsrMode::SenseVoice {
            Some(Arc::new(HttpVoiceEmbedder::new(&self.config.embedder)))
        } else {
            None
        };
        let ocr_engine: Option<Arc<dyn crate::pipeline::stages::OcrEngine>> = if self.config.ocr.enabled {
            Some(Arc::new(HttpOcrEngine::new(&self.config.ocr.base_url, self.config.llm.request_timeout_secs)))
        } else {
            None
        };
        let face_detector: Option<Arc<dyn crate::pipeline::stages::FaceDetector>> = if self.config.face_detect.enabled {
            Some(Arc::new(HttpFaceDetector::new(
                &self.config.face_detect.base_url,
                self.config.llm.request_timeout_secs,
            )))
        } else {
            None
        };

        build_orchestrator(
            &self.config,
            self.new_corrector(),
            self.llm.clone(),
            asr_engine,
            voice_embedder,
            ocr_engine,
            face_detector,
            self.model_manager.clone(),
            self.persistence.clone(),
            self.asr_lock.clone(),
        )
    }

    // -- submission entry points -------------------------------------------

    /// Compute the upload's SHA-256; if a prior task with a persisted
    /// transcript shares the hash, return its id with `existing=true`
    /// instead of re-running the pipeline.
    pub async fn submit_transcript(
        self: &Arc<Self>,
        bytes: Vec<u8>,
        filename: String,
        hotwords: Vec<String>,
    ) -> anyhow::Result<(String, bool)> {
        let hash = hex::encode(Sha256::digest(&bytes));

        {
            let registry = self.registry.lock().await;
            if let Some(existing_id) = registry.hash_index.get(&hash).cloned() {
                if self.persistence.has_file(&existing_id, "transcript.json") {
                    return Ok((existing_id, true));
                }
            }
        }

        let task_id = uuid::Uuid::new_v4().simple().to_string();
        let suffix = std::path::Path::new(&filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let is_video = self
            .config
            .video
            .video_extensions
            .iter()
            .any(|v| v.trim_start_matches('.').eq_ignore_ascii_case(suffix.trim_start_matches('.')));
        let media_type = if is_video { "video" } else { "audio" };

        let source_path = if is_video {
            self.persistence.save_video(&task_id, &bytes, &suffix)?
        } else {
            self.persistence.save_audio(&task_id, &bytes, &suffix)?
        };
        self.persistence
            .save_meta(&task_id, &filename, &hash, &suffix, media_type, None)?;

        {
            let mut registry = self.registry.lock().await;
            registry.hash_index.insert(hash.clone(), task_id.clone());
            self.persistence.save_hash_index(&registry.hash_index)?;
            registry.tasks.insert(task_id.clone(), TaskRecord::pending(task_id.clone(), TaskKind::Transcript, None));
            registry.insertion_order.push_back(task_id.clone());
        }
        self.evict_if_needed().await;

        let store = self.clone();
        let id_for_worker = task_id.clone();
        tokio::spawn(async move {
            store.run_transcript_worker(id_for_worker, source_path, media_type.to_string(), hotwords).await;
        });

        Ok((task_id, false))
    }

    pub async fn submit_text_evaluation(self: &Arc<Self>, text: String, parent_id: Option<String>) -> anyhow::Result<String> {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut registry = self.registry.lock().await;
            registry
                .tasks
                .insert(task_id.clone(), TaskRecord::pending(task_id.clone(), TaskKind::Evaluation, parent_id.clone()));
            registry.insertion_order.push_back(task_id.clone());
        }
        self.evict_if_needed().await;

        let store = self.clone();
        let id_for_worker = task_id.clone();
        tokio::spawn(async move {
            store.run_evaluation_worker(id_for_worker, text, parent_id).await;
        });
        Ok(task_id)
    }

    pub async fn submit_compliance_audit(
        self: &Arc<Self>,
        entries: Vec<TranscriptEntry>,
        rules_bytes: Vec<u8>,
        rules_filename: String,
        parent_id: Option<String>,
    ) -> anyhow::Result<String> {
        let task_id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut registry = self.registry.lock().await;
            registry
                .tasks
                .insert(task_id.clone(), TaskRecord::pending(task_id.clone(), TaskKind::Compliance, parent_id.clone()));
            registry.insertion_order.push_back(task_id.clone());
        }
        self.evict_if_needed().await;

        let store = self.clone();
        let id_for_worker = task_id.clone();
        tokio::spawn(async move {
            store
                .run_compliance_worker(id_for_worker, entries, rules_bytes, rules_filename, parent_id)
                .await;
        });
        Ok(task_id)
    }

    /// Reset a transcript task's downstream artifacts and restart the
    /// pipeline on the already-persisted audio/video, keeping the same id.
    pub async fn rerun_transcript(self: &Arc<Self>, task_id: String, hotwords: Vec<String>) -> anyhow::Result<()> {
        let meta = self
            .persistence
            .load_meta(&task_id)
            .ok_or_else(|| anyhow::anyhow!("task {task_id} has no persisted upload"))?;
        let source_path = if meta.media_type == "video" {
            self.persistence
                .find_video(&task_id)
                .ok_or_else(|| anyhow::anyhow!("task {task_id} is missing its source video"))?
        } else {
            self.persistence
                .find_audio(&task_id)
                .ok_or_else(|| anyhow::anyhow!("task {task_id} is missing its source audio"))?
        };

        self.persistence.delete_file(&task_id, "evaluation.json");
        self.persistence.delete_file(&task_id, "compliance.json");

        {
            let mut registry = self.registry.lock().await;
            registry
                .tasks
                .insert(task_id.clone(), TaskRecord::pending(task_id.clone(), TaskKind::Transcript, None));
        }

        let store = self.clone();
        let media_type = meta.media_type.clone();
        tokio::spawn(async move {
            store.run_transcript_worker(task_id, source_path, media_type, hotwords).await;
        });
        Ok(())
    }

    /// Build fresh evaluation text from the parent's corrected transcript
    /// and submit it as a new child evaluation task.
    pub async fn rerun_evaluation(self: &Arc<Self>, parent_id: String) -> anyhow::Result<String> {
        let transcript: TranscriptResult = self
            .persistence
            .load_json(&parent_id, "transcript.json")
            .ok_or_else(|| anyhow::anyhow!("parent task {parent_id} has no transcript"))?;
        self.persistence.delete_file(&parent_id, "evaluation.json");
        let text = transcript
            .transcript
            .iter()
            .map(|e| e.text_corrected.clone())
            .collect::<Vec<_>>()
            .join("\n");
        self.submit_text_evaluation(text, Some(parent_id)).await
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let registry = self.registry.lock().await;
        registry.tasks.get(task_id).cloned()
    }

    pub fn persistence(&self) -> Arc<PersistenceService> {
        self.persistence.clone()
    }

    pub async fn lookup_by_hash(&self, hash: &str) -> Option<String> {
        let registry = self.registry.lock().await;
        registry.hash_index.get(hash).cloned()
    }

    /// Startup scan: rebuild in-memory `Completed` records for every task
    /// directory persisted on disk, so a restart doesn't lose visibility
    /// into already-finished work.
    pub async fn restore_from_disk(&self) {
        let scanned = self.persistence.scan_completed_tasks();
        let mut registry = self.registry.lock().await;
        for task in scanned {
            if !task.has_transcript {
                // A video/audio file with no transcript.json means the
                // process died mid-pipeline; spec §6 scenario 6 / §8 require
                // such tasks stay absent from the registry rather than be
                // auto-resumed or surfaced as failed.
                continue;
            }
            if registry.tasks.contains_key(&task.task_id) {
                continue;
            }
            let record = TaskRecord {
                id: task.task_id.clone(),
                kind: TaskKind::Transcript,
                parent_id: None,
                status: TaskStatus::Completed,
                progress: TaskProgress::compute(TaskStatus::Completed, 0, 0, false),
                result: self
                    .persistence
                    .load_json::<TranscriptResult>(&task.task_id, "transcript.json")
                    .map(TaskResultPayload::Transcript),
                error: None,
            };
            registry.hash_index.entry(task.meta.hash.clone()).or_insert_with(|| task.task_id.clone());
            registry.insertion_order.push_back(task.task_id.clone());
            registry.tasks.insert(task.task_id, record);
        }
        info!(restored = registry.tasks.len(), "restored tasks from disk");
    }

    /// Apply review-status updates to a persisted compliance report.
    pub async fn update_violation_statuses(
        &self,
        task_id: &str,
        updates: &[(usize, crate::types::ViolationStatus)],
    ) -> anyhow::Result<()> {
        let mut report: ComplianceReport = self
            .persistence
            .load_json(task_id, "compliance.json")
            .ok_or_else(|| anyhow::anyhow!("task {task_id} has no compliance report"))?;
        for (index, status) in updates {
            if let Some(v) = report.violations.get_mut(*index) {
                v.status = *status;
            }
        }
        self.persistence.save_json(task_id, "compliance.json", &report)?;

        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.tasks.get_mut(task_id) {
            record.result = Some(TaskResultPayload::Compliance(report));
        }
        Ok(())
    }

    // -- eviction -------------------------------------------------------------

    async fn evict_if_needed(&self) {
        let mut registry = self.registry.lock().await;
        let max = self.config.task_store.max_in_memory;
        while registry.tasks.len() > max {
            let evicted = registry.insertion_order.iter().position(|id| {
                registry
                    .tasks
                    .get(id)
                    .map(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Failed))
                    .unwrap_or(true)
            });
            match evicted {
                Some(pos) => {
                    let id = registry.insertion_order.remove(pos).unwrap();
                    registry.tasks.remove(&id);
                    info!(task_id = %id, "evicted terminal task from in-memory registry");
                }
                None => break,
            }
        }
    }

    // -- progress / status plumbing -------------------------------------------

    async fn set_status(&self, task_id: &str, status: TaskStatus, current: u32, total: u32, eval_only: bool) {
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.tasks.get_mut(task_id) {
            record.status = status;
            record.progress = TaskProgress::compute(status, current, total, eval_only);
        }
    }

    async fn set_failed(&self, task_id: &str, message: String) {
        warn!(task_id, error = %message, "task failed");
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.tasks.get_mut(task_id) {
            record.status = TaskStatus::Failed;
            record.error = Some(message);
        }
    }

    async fn set_completed(&self, task_id: &str, result: TaskResultPayload) {
        let mut registry = self.registry.lock().await;
        if let Some(record) = registry.tasks.get_mut(task_id) {
            record.status = TaskStatus::Completed;
            record.progress = TaskProgress::compute(TaskStatus::Completed, 1, 1, false);
            record.result = Some(result);
        }
    }

    // -- workers ----------------------------------------------------------------

    async fn run_transcript_worker(
        self: Arc<Self>,
        task_id: String,
        source_path: std::path::PathBuf,
        media_type: String,
        hotwords: Vec<String>,
    ) {
        let timeout_secs = self.config.task_store.task_timeout_secs;
        let fut = self.run_transcript_pipeline(task_id.clone(), source_path, media_type, hotwords);
        match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.set_failed(&task_id, e.to_string()).await,
            Err(_) => {
                self.set_failed(&task_id, TaskTimeoutError(timeout_secs).to_string()).await;
            }
        }
    }

    async fn run_transcript_pipeline(
        &self,
        task_id: String,
        source_path: std::path::PathBuf,
        media_type: String,
        hotwords: Vec<String>,
    ) -> anyhow::Result<()> {
        let orchestrator = self.build_orchestrator();
        let mut ctx = PipelineContext::new(task_id.clone(), media_type);
        ctx.source_path = Some(source_path);
        ctx.hotwords = hotwords;

        let store_for_progress = self.registry.clone();
        let task_id_for_progress = task_id.clone();
        let progress: crate::pipeline::context::ProgressCallback = Box::new(move |status, current, total| {
            let registry = store_for_progress.clone();
            let task_id = task_id_for_progress.clone();
            tokio::spawn(async move {
                let mut registry = registry.lock().await;
                if let Some(record) = registry.tasks.get_mut(&task_id) {
                    record.status = status;
                    record.progress = TaskProgress::compute(status, current, total, false);
                }
            });
        });

        let start = Instant::now();
        let ctx = orchestrator.run(ctx, &progress).await?;
        let processing_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let result = TranscriptResult {
            transcript: ctx.transcript,
            processing_time_ms,
        };
        self.persistence.save_json(&task_id, "transcript.json", &result)?;
        self.set_completed(&task_id, TaskResultPayload::Transcript(result)).await;
        Ok(())
    }

    async fn run_evaluation_worker(self: Arc<Self>, task_id: String, text: String, parent_id: Option<String>) {
        let timeout_secs = self.config.task_store.task_timeout_secs;
        self.set_status(&task_id, TaskStatus::Evaluating, 0, 1, true).await;
        let evaluator = Evaluator::new(&self.llm, &self.config.evaluator);
        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), evaluator.evaluate(&text)).await;
        match result {
            Ok(Ok(evaluation)) => {
                if let Some(parent) = &parent_id {
                    if let Err(e) = self.persistence.save_json(parent, "evaluation.json", &evaluation) {
                        warn!(task_id, error = %e, "failed to persist evaluation under parent task");
                    }
                }
                self.persistence
                    .save_json(&task_id, "evaluation.json", &evaluation)
                    .unwrap_or_else(|e| warn!(task_id, error = %e, "failed to persist evaluation"));
                self.set_completed(&task_id, TaskResultPayload::Evaluation(evaluation)).await;
            }
            Ok(Err(e)) => self.set_failed(&task_id, e.to_string()).await,
            Err(_) => self.set_failed(&task_id, TaskTimeoutError(timeout_secs).to_string()).await,
        }
    }

    async fn run_compliance_worker(
        self: Arc<Self>,
        task_id: String,
        entries: Vec<TranscriptEntry>,
        rules_bytes: Vec<u8>,
        rules_filename: String,
        parent_id: Option<String>,
    ) {
        let timeout_secs = self.config.task_store.task_timeout_secs;
        self.set_status(&task_id, TaskStatus::Auditing, 0, 1, false).await;

        let fut = self.run_compliance_audit(entries, rules_bytes, rules_filename, parent_id.clone());
        match tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await {
            Ok(Ok(report)) => {
                let dest = parent_id.as_deref().unwrap_or(&task_id);
                if let Err(e) = self.persistence.save_json(dest, "compliance.json", &report) {
                    warn!(task_id, error = %e, "failed to persist compliance report");
                }
                self.set_completed(&task_id, TaskResultPayload::Compliance(report)).await;
            }
            Ok(Err(e)) => self.set_failed(&task_id, e.to_string()).await,
            Err(_) => self.set_failed(&task_id, TaskTimeoutError(timeout_secs).to_string()).await,
        }
    }

    async fn run_compliance_audit(
        &self,
        entries: Vec<TranscriptEntry>,
        rules_bytes: Vec<u8>,
        rules_filename: String,
        parent_id: Option<String>,
    ) -> anyhow::Result<ComplianceReport> {
        let parsed = rules_parse::parse_rule_file(&rules_filename, &rules_bytes)?;
        let rules: Vec<StructuredRule> = parsed.rules.iter().map(|r| rule_registry::enrich(r.id, &r.content)).collect();

        let segments: Vec<Segment> = entries
            .into_iter()
            .map(|e| Segment {
                text: e.text_corrected.clone(),
                start_ms: e.timestamp_ms,
                end_ms: e.end_ms,
                confidence: 1.0,
                speaker: speaker_index(&e.speaker),
                sub_sentences: vec![SubSentence {
                    text: e.text_corrected,
                    start_ms: e.timestamp_ms,
                    end_ms: e.end_ms,
                }],
            })
            .collect();

        let ocr_events: Vec<(i64, String, String)> = parent_id
            .as_deref()
            .and_then(|parent| self.persistence.load_json::<Vec<crate::types::OcrRecord>>(parent, "ocr_results.json"))
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.timestamp_ms, r.text, r.frame_path))
            .collect();

        let auditor = ComplianceAuditor::new(&self.llm, &self.config.compliance);
        auditor.audit(&segments, &rules, &ocr_events, &parsed.few_shot_examples).await
    }
}

fn speaker_index(label: &str) -> i32 {
    label
        .rsplit(' ')
        .next()
        .and_then(|n| n.parse::<i32>().ok())
        .map(|n| n - 1)
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_index_parses_speaker_label() {
        assert_eq!(speaker_index("Speaker 2"), 1);
        assert_eq!(speaker_index("unknown"), -1);
    }

    #[tokio::test]
    async fn submit_text_evaluation_registers_a_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceService::new(dir.path()).unwrap());
        let store = Arc::new(TaskStore::new(Config::default(), persistence));
        let id = store.submit_text_evaluation("hello".to_string(), None).await.unwrap();
        let record = store.get(&id).await;
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(PersistenceService::new(dir.path()).unwrap());
        let store = TaskStore::new(Config::default(), persistence);
        assert!(store.get("nope").await.is_none());
    }
}
