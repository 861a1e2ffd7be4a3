//! Core data model: tasks, transcript segments, compliance rules and
//! violations. See spec §3 DATA MODEL.

use serde::{Deserialize, Serialize};

/// A task's lifecycle status. Only advances through this ordered set, or
/// jumps directly to `Failed`; `Completed`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    ProcessingAsr,
    ExtractingFrames,
    ScanningVisual,
    Correcting,
    Evaluating,
    Auditing,
    Completed,
    Failed,
}

/// Progress anchors mapping `(status, current_chunk, total_chunks)` to a
/// 0-100 percent, reproduced from the original `TaskInfo.progress` property.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskProgress {
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub percent: f64,
}

impl TaskProgress {
    pub fn compute(status: TaskStatus, current: u32, total: u32, eval_only: bool) -> Self {
        let percent = match status {
            TaskStatus::Pending => 0.0,
            TaskStatus::ProcessingAsr => 5.0,
            TaskStatus::Correcting => {
                if total > 0 {
                    5.0 + (current as f64 / total as f64) * 85.0
                } else {
                    5.0
                }
            }
            TaskStatus::Auditing => {
                if total > 0 {
                    (current as f64 / total as f64) * 100.0
                } else {
                    0.0
                }
            }
            TaskStatus::Evaluating => {
                if eval_only {
                    if total > 0 {
                        (current as f64 / total as f64) * 100.0
                    } else {
                        0.0
                    }
                } else if total > 0 {
                    90.0 + (current as f64 / total as f64) * 10.0
                } else {
                    90.0
                }
            }
            TaskStatus::Completed => 100.0,
            TaskStatus::ExtractingFrames | TaskStatus::ScanningVisual | TaskStatus::Failed => {
                5.0 + (current as f64 / (total.max(1)) as f64) * 85.0
            }
        };
        TaskProgress {
            current_chunk: current,
            total_chunks: total,
            percent: (percent * 10.0).round() / 10.0,
        }
    }
}

/// A fine-grained pre-merge ASR fragment preserved inside a `Segment` so
/// sentence-level timing is never lost across merge operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubSentence {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// One contiguous ASR output. Invariant: `end_ms >= start_ms`; when
/// `sub_sentences` is non-empty its concatenated text equals `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub confidence: f64,
    /// -1 = unknown / not yet assigned.
    pub speaker: i32,
    pub sub_sentences: Vec<SubSentence>,
}

impl Segment {
    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// A finished, display-ready transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// MM:SS display form.
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub end_ms: i64,
    pub speaker: String,
    pub text: String,
    pub text_corrected: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    pub transcript: Vec<TranscriptEntry>,
    pub processing_time_ms: f64,
}

/// A rule as parsed verbatim from the uploaded CSV/XLSX, before enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: i64,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    ForbiddenPhrase,
    Behavioral,
    Document,
    VisualCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    Exact,
    Semantic,
    Visual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Transcript,
    Ocr,
    Vision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Score deduction per spec §4.7.3 step 7.
    pub fn deduction(self) -> f64 {
        match self {
            Severity::High => 15.0,
            Severity::Medium => 8.0,
            Severity::Low => 3.0,
        }
    }

    pub fn parse_or_low(s: &str) -> Self {
        match s {
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Low,
        }
    }
}

/// A rule enriched with the built-in registry's structural metadata. Never
/// persisted — rebuilt per audit from the parsed rule file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRule {
    pub id: i64,
    pub content: String,
    pub category: RuleCategory,
    pub check_mode: CheckMode,
    pub evidence_sources: Vec<EvidenceSource>,
    pub keywords: Vec<String>,
    pub description: String,
    pub severity_default: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: i64,
    pub rule_content: String,
    pub reason: String,
    pub severity: Severity,
    pub confidence: f64,
    pub status: ViolationStatus,
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub end_ms: i64,
    pub speaker: String,
    pub original_text: String,
    pub source: EvidenceSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub total_rules: usize,
    pub total_segments_checked: usize,
    pub violations: Vec<Violation>,
    pub summary: String,
    pub compliance_score: f64,
    pub source_counts: std::collections::BTreeMap<String, usize>,
}

impl ComplianceReport {
    pub fn score_from(violations: &[Violation]) -> f64 {
        let deduction: f64 = violations.iter().map(|v| v.severity.deduction()).sum();
        (100.0 - deduction).max(0.0).clamp(0.0, 100.0)
    }

    pub fn source_counts_from(violations: &[Violation]) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for v in violations {
            let key = match v.source {
                EvidenceSource::Transcript => "transcript",
                EvidenceSource::Ocr => "ocr",
                EvidenceSource::Vision => "vision",
            };
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMeta {
    pub title: String,
    pub category: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationScores {
    pub logic: f64,
    pub info_density: f64,
    pub expression: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationAnalysis {
    pub main_points: Vec<String>,
    pub key_data: Vec<String>,
    pub sentiment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub meta: EvaluationMeta,
    pub scores: EvaluationScores,
    pub analysis: EvaluationAnalysis,
    pub summary: String,
}

/// A single extracted keyframe from video, saved under `frames/<n>.jpg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    pub index: usize,
    pub timestamp_ms: i64,
    pub path: String,
}

/// One OCR recognition result for a keyframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRecord {
    pub timestamp_ms: i64,
    pub text: String,
    pub confidence: f64,
    pub frame_path: String,
    #[serde(default)]
    pub bbox: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualEventType {
    FaceDetected,
    FaceMissing,
    SceneChange,
}

/// A detected visual event (face presence/absence timeline segment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualEvent {
    pub event_type: VisualEventType,
    pub start_ms: i64,
    pub end_ms: i64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_path: Option<String>,
}
