//! Configuration management
//!
//! A single `Config` tree with `#[serde(default)]` nested sub-configs, each
//! carrying free-function defaults — the same pattern the rest of this
//! crate's ancestry uses for its own settings file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub diarizer: DiarizerConfig,
    #[serde(default)]
    pub corrector: CorrectorConfig,
    #[serde(default)]
    pub compliance: ComplianceConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub task_store: TaskStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub keyframe: KeyframeConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub face_detect: FaceDetectConfig,
    #[serde(default)]
    pub asr: AsrAdapterConfig,
    #[serde(default)]
    pub embedder: EmbedderAdapterConfig,
    #[serde(default)]
    pub csc: CscAdapterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            persistence: PersistenceConfig::default(),
            llm: LlmConfig::default(),
            diarizer: DiarizerConfig::default(),
            corrector: CorrectorConfig::default(),
            compliance: ComplianceConfig::default(),
            evaluator: EvaluatorConfig::default(),
            task_store: TaskStoreConfig::default(),
            logging: LoggingConfig::default(),
            video: VideoConfig::default(),
            keyframe: KeyframeConfig::default(),
            ocr: OcrConfig::default(),
            face_detect: FaceDetectConfig::default(),
            asr: AsrAdapterConfig::default(),
            embedder: EmbedderAdapterConfig::default(),
            csc: CscAdapterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted rule-file upload size, in bytes (spec: 2 MB -> 413).
    #[serde(default = "default_max_rule_file_bytes")]
    pub max_rule_file_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_rule_file_bytes() -> usize {
    2 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_rule_file_bytes: default_max_rule_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_llm_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_model() -> String {
    "qwen2.5:14b".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            model: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizerConfig {
    #[serde(default = "default_sliding_threshold_ms")]
    pub sliding_threshold_ms: i64,
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default = "default_step_ms")]
    pub step_ms: i64,
    #[serde(default = "default_min_window_ms")]
    pub min_window_ms: i64,
    #[serde(default = "default_max_windows")]
    pub max_windows: usize,
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f64,
    #[serde(default = "default_max_flicker_ms")]
    pub max_flicker_ms: i64,
}

fn default_sliding_threshold_ms() -> i64 {
    3000
}
fn default_window_ms() -> i64 {
    1500
}
fn default_step_ms() -> i64 {
    750
}
fn default_min_window_ms() -> i64 {
    500
}
fn default_max_windows() -> usize {
    500
}
fn default_distance_threshold() -> f64 {
    0.5
}
fn default_max_flicker_ms() -> i64 {
    1500
}

impl Default for DiarizerConfig {
    fn default() -> Self {
        Self {
            sliding_threshold_ms: default_sliding_threshold_ms(),
            window_ms: default_window_ms(),
            step_ms: default_step_ms(),
            min_window_ms: default_min_window_ms(),
            max_windows: default_max_windows(),
            distance_threshold: default_distance_threshold(),
            max_flicker_ms: default_max_flicker_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectorConfig {
    #[serde(default = "default_hotwords_path")]
    pub hotwords_path: Option<PathBuf>,
    #[serde(default = "default_max_entries_per_batch")]
    pub max_entries_per_batch: usize,
    #[serde(default = "default_max_chars_per_batch")]
    pub max_chars_per_batch: usize,
    #[serde(default = "default_confidence_skip_threshold")]
    pub confidence_skip_threshold: f64,
    #[serde(default = "default_pre_merge_gap_ms")]
    pub pre_merge_gap_ms: i64,
    /// Off by default; the spec's Design Notes flag this as an optional
    /// additional, entry-level smoothing pass (see DESIGN.md).
    #[serde(default)]
    pub enable_entry_level_smoothing: bool,
}

fn default_hotwords_path() -> Option<PathBuf> {
    None
}
fn default_max_entries_per_batch() -> usize {
    15
}
fn default_max_chars_per_batch() -> usize {
    800
}
fn default_confidence_skip_threshold() -> f64 {
    0.95
}
fn default_pre_merge_gap_ms() -> i64 {
    1000
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            hotwords_path: default_hotwords_path(),
            max_entries_per_batch: default_max_entries_per_batch(),
            max_chars_per_batch: default_max_chars_per_batch(),
            confidence_skip_threshold: default_confidence_skip_threshold(),
            pre_merge_gap_ms: default_pre_merge_gap_ms(),
            enable_entry_level_smoothing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_ocr_margin_ms")]
    pub ocr_margin_ms: i64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: i64,
    #[serde(default = "default_evidence_margin_ms")]
    pub evidence_margin_ms: i64,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

fn default_max_text_chars() -> usize {
    60_000
}
fn default_chunk_size() -> usize {
    2_000
}
fn default_ocr_margin_ms() -> i64 {
    10_000
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_dedup_window_ms() -> i64 {
    30_000
}
fn default_evidence_margin_ms() -> i64 {
    10_000
}
fn default_num_ctx() -> u32 {
    8192
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
            chunk_size: default_chunk_size(),
            ocr_margin_ms: default_ocr_margin_ms(),
            confidence_threshold: default_confidence_threshold(),
            dedup_window_ms: default_dedup_window_ms(),
            evidence_margin_ms: default_evidence_margin_ms(),
            num_ctx: default_num_ctx(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_eval_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_eval_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
}

fn default_eval_max_text_chars() -> usize {
    40_000
}
fn default_eval_chunk_size() -> usize {
    6_000
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_text_chars: default_eval_max_text_chars(),
            chunk_size: default_eval_chunk_size(),
            num_ctx: default_num_ctx(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStoreConfig {
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: usize,
}

fn default_task_timeout_secs() -> u64 {
    1800
}
fn default_max_in_memory() -> usize {
    500
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            max_in_memory: default_max_in_memory(),
        }
    }
}

/// Video-to-audio extraction, run before the rest of the pipeline when the
/// uploaded file's extension matches one of `video_extensions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Applies a denoise/normalize filter chain while extracting the WAV
    /// track; disable for already-clean studio recordings.
    #[serde(default = "default_enhance_audio")]
    pub enhance_audio: bool,
}

fn default_video_extensions() -> Vec<String> {
    vec![".mp4", ".mov", ".mkv", ".avi", ".webm"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_enhance_audio() -> bool {
    true
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            video_extensions: default_video_extensions(),
            ffmpeg_path: default_ffmpeg_path(),
            enhance_audio: default_enhance_audio(),
        }
    }
}

/// Keyframe extraction from video sources, feeding the OCR and face-detect
/// stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyframeConfig {
    #[serde(default = "default_keyframe_interval_s")]
    pub interval_s: f64,
    #[serde(default = "default_keyframe_max_count")]
    pub max_count: usize,
}

fn default_keyframe_interval_s() -> f64 {
    5.0
}
fn default_keyframe_max_count() -> usize {
    120
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            interval_s: default_keyframe_interval_s(),
            max_count: default_keyframe_max_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ocr_base_url")]
    pub base_url: String,
}

fn default_ocr_enabled() -> bool {
    true
}

fn default_ocr_base_url() -> String {
    "http://127.0.0.1:8601".to_string()
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: default_ocr_enabled(),
            base_url: default_ocr_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDetectConfig {
    #[serde(default = "default_face_detect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_face_detect_base_url")]
    pub base_url: String,
}

fn default_face_detect_enabled() -> bool {
    true
}

fn default_face_detect_base_url() -> String {
    "http://127.0.0.1:8602".to_string()
}

impl Default for FaceDetectConfig {
    fn default() -> Self {
        Self {
            enabled: default_face_detect_enabled(),
            base_url: default_face_detect_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrAdapterConfig {
    /// "sensevoice" (diarized, noise-stripped) or "paraformer" (engine
    /// supplies its own speaker labels, no diarization pass).
    #[serde(default = "default_asr_mode")]
    pub mode: String,
    #[serde(default = "default_asr_base_url")]
    pub base_url: String,
    #[serde(default = "default_asr_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// SenseVoice segments longer than this are split before diarization;
    /// see `pipeline::stages::split_oversized`.
    #[serde(default = "default_asr_max_segment_ms")]
    pub max_segment_ms: i64,
}

fn default_asr_mode() -> String {
    "sensevoice".to_string()
}

fn default_asr_base_url() -> String {
    "http://127.0.0.1:8603".to_string()
}

fn default_asr_request_timeout_secs() -> u64 {
    120
}

fn default_asr_max_segment_ms() -> i64 {
    20_000
}

impl Default for AsrAdapterConfig {
    fn default() -> Self {
        Self {
            mode: default_asr_mode(),
            base_url: default_asr_base_url(),
            request_timeout_secs: default_asr_request_timeout_secs(),
            max_segment_ms: default_asr_max_segment_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderAdapterConfig {
    #[serde(default = "default_embedder_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedder_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_embedder_base_url() -> String {
    "http://127.0.0.1:8604".to_string()
}

fn default_embedder_request_timeout_secs() -> u64 {
    60
}

impl Default for EmbedderAdapterConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedder_base_url(),
            request_timeout_secs: default_embedder_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CscAdapterConfig {
    #[serde(default = "default_csc_enabled")]
    pub enabled: bool,
    #[serde(default = "default_csc_base_url")]
    pub base_url: String,
}

fn default_csc_enabled() -> bool {
    false
}

fn default_csc_base_url() -> String {
    "http://127.0.0.1:8605".to_string()
}

impl Default for CscAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: default_csc_enabled(),
            base_url: default_csc_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from the on-disk TOML file, writing defaults on
    /// first run.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }
}

/// Default configuration file path.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "copernicus", "copernicus-audit")
        .context("Failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}
