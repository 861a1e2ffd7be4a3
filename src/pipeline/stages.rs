//! Concrete pipeline stages and the external-collaborator traits they drive.
//! Grounded on `pipeline/stages/video_preprocess.py`, `audio_preprocess.py`,
//! `asr_transcribe.py`, `keyframe_extract.py`, `ocr_scan.py`, `face_detect.py`,
//! `speaker_smooth.py`, `text_correction.py` and `transcript_build.py`. See
//! spec §4.4–§4.9.

use super::context::{PipelineContext, ProgressCallback, Stage};
use crate::config::{Config, FaceDetectConfig, KeyframeConfig, OcrConfig, VideoConfig};
use crate::corrector::{polish_batches_with_progress, Corrector, CorrectionCollaborator};
use crate::diarizer::{diarize, DiarizerSettings, VoiceEmbedder};
use crate::error::AudioProcessingError;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::model_manager::ModelManager;
use crate::persistence::PersistenceService;
use crate::types::{
    KeyFrame, OcrRecord, Segment, SubSentence, TaskStatus, TranscriptEntry, VisualEvent,
    VisualEventType,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

// ------------------------------------------------------------------ //
//  ffmpeg helpers
// ------------------------------------------------------------------ //

async fn run_ffmpeg(ffmpeg_path: &str, args: &[String]) -> Result<(), AudioProcessingError> {
    let output = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(AudioProcessingError::SpawnFailed)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AudioProcessingError::FfmpegFailed(stderr.trim().to_string()));
    }
    Ok(())
}

/// Read a mono 16-bit PCM WAV file's samples into `f32` in `[-1.0, 1.0]`.
/// No WAV-decoding crate exists anywhere in the retrieved dependency stack,
/// and the format produced by `run_ffmpeg`'s `-ar 16000 -ac 1` output is
/// simple enough (canonical RIFF/WAVE, 16-bit PCM) that hand-parsing the
/// header is the pragmatic choice, same spirit as the hand-rolled
/// clustering in `diarizer::clustering`.
fn read_wav_pcm16_mono(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 44 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        anyhow::bail!("not a canonical RIFF/WAVE file: {}", path.display());
    }
    let mut sample_rate: u32 = 16_000;
    let mut pos = 12usize;
    let mut data_offset = None;
    let mut data_len = 0usize;
    while pos + 8 <= bytes.len() {
        let chunk_id = &bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body_start = pos + 8;
        if chunk_id == b"fmt " && body_start + 16 <= bytes.len() {
            sample_rate = u32::from_le_bytes(bytes[body_start + 4..body_start + 8].try_into().unwrap());
        } else if chunk_id == b"data" {
            data_offset = Some(body_start);
            data_len = chunk_size.min(bytes.len().saturating_sub(body_start));
        }
        pos = body_start + chunk_size + (chunk_size % 2);
    }
    let data_start = data_offset.ok_or_else(|| anyhow::anyhow!("no data chunk in {}", path.display()))?;
    let data = &bytes[data_start..data_start + data_len];
    let samples = data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect();
    Ok((samples, sample_rate))
}

// ------------------------------------------------------------------ //
//  VideoPrepStage
// ------------------------------------------------------------------ //

/// Extracts a 16 kHz mono WAV track from an uploaded video, optionally
/// running a denoise/normalize filter chain. Grounded on
/// `video_preprocess.py`.
pub struct VideoPrepStage {
    config: VideoConfig,
}

impl VideoPrepStage {
    pub fn new(config: VideoConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for VideoPrepStage {
    fn name(&self) -> &'static str {
        "video_prep"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        ctx.source_path
            .as_ref()
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.config
                    .video_extensions
                    .iter()
                    .any(|v| v.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        _progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let source = ctx
            .source_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no source path for video prep"))?;
        let wav_path = source.with_extension("extracted.wav");

        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            source.display().to_string(),
            "-vn".into(),
            "-ar".into(),
            "16000".into(),
            "-ac".into(),
            "1".into(),
        ];
        if self.config.enhance_audio {
            args.push("-af".into());
            args.push("highpass=f=200,afftdn=nf=-25,dynaudnorm=p=0.9:m=10:s=3".into());
        }
        args.push(wav_path.display().to_string());

        run_ffmpeg(&self.config.ffmpeg_path, &args).await?;

        ctx.video_path = Some(source);
        ctx.audio_path = Some(wav_path);
        ctx.media_type = "video".to_string();
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  AudioPrepStage
// ------------------------------------------------------------------ //

/// Converts a directly uploaded audio file to 16 kHz mono WAV. No-ops when
/// `VideoPrepStage` already produced a WAV. Grounded on
/// `audio_preprocess.py`.
pub struct AudioPrepStage {
    ffmpeg_path: String,
}

impl AudioPrepStage {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self { ffmpeg_path: ffmpeg_path.into() }
    }
}

#[async_trait]
impl Stage for AudioPrepStage {
    fn name(&self) -> &'static str {
        "audio_prep"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        ctx.audio_path.is_none() && ctx.source_path.is_some()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        _progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let source = ctx
            .source_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no source path for audio prep"))?;
        let wav_path = source.with_extension("wav");
        let args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            source.display().to_string(),
            "-ar".into(),
            "16000".into(),
            "-ac".into(),
            "1".into(),
            wav_path.display().to_string(),
        ];
        run_ffmpeg(&self.ffmpeg_path, &args).await?;
        ctx.audio_path = Some(wav_path);
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  ASR external collaborator + adapter stage
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrMode {
    Paraformer,
    SenseVoice,
}

#[derive(Debug, Clone)]
pub struct AsrToken {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub confidence: f64,
}

/// One ASR engine output entry, before SenseVoice post-processing or
/// diarization. Grounded on spec §4.4.
#[derive(Debug, Clone)]
pub struct RawAsrSegment {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub tokens: Vec<AsrToken>,
    /// `Some` in Paraformer mode (the engine supplies speakers itself);
    /// `None` in SenseVoice mode, where the diarizer assigns it later.
    pub speaker: Option<i32>,
}

/// External collaborator: the actual ASR model lives outside this crate's
/// Rust-native scope and is injected at the boundary (spec §1 Out of scope).
#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn transcribe(
        &self,
        wav_path: &Path,
        hotwords: &[String],
        sentence_timestamp: bool,
    ) -> anyhow::Result<Vec<RawAsrSegment>>;

    fn mode(&self) -> AsrMode;
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\|[^|]*\|>").unwrap());
static PUNCT_ONLY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\p{P}\s]*$").unwrap());
static REPEATED_PUNCT_CHARS: &[char] = &['。', '！', '？', '.', '!', '?', ',', '，'];

/// Collapse immediately-repeated punctuation marks (e.g. "。。。" -> "。").
/// Hand-rolled rather than a `(.)\1+` regex since the `regex` crate doesn't
/// support backreferences.
fn collapse_repeated_punctuation(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if REPEATED_PUNCT_CHARS.contains(&c) && prev == Some(c) {
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

fn strip_sensevoice_noise(text: &str) -> String {
    let stripped = TAG_RE.replace_all(text, "");
    let no_emoji: String = stripped
        .chars()
        .filter(|c| !matches!(*c as u32, 0x1F300..=0x1FAFF | 0x2600..=0x27BF))
        .collect();
    collapse_repeated_punctuation(&no_emoji).trim().to_string()
}

fn is_punctuation_token(text: &str) -> bool {
    PUNCT_ONLY_RE.is_match(text)
}

fn mean_token_confidence(tokens: &[AsrToken]) -> f64 {
    let scored: Vec<f64> = tokens
        .iter()
        .filter(|t| !is_punctuation_token(&t.text))
        .map(|t| t.confidence)
        .collect();
    if scored.is_empty() {
        return 0.0;
    }
    scored.iter().sum::<f64>() / scored.len() as f64
}

/// Split a raw segment whose duration exceeds `max_ms`, cutting at the
/// nearest punctuation token to the midpoint of its token timeline,
/// recursing until every piece fits. Grounded on spec §4.4 SenseVoice
/// post-processing step (iv).
fn split_oversized(raw: RawAsrSegment, max_ms: i64) -> Vec<RawAsrSegment> {
    if raw.end_ms - raw.start_ms <= max_ms || raw.tokens.len() < 2 {
        return vec![raw];
    }
    let midpoint = (raw.start_ms + raw.end_ms) / 2;
    let split_idx = raw
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| is_punctuation_token(&t.text))
        .min_by_key(|(_, t)| (t.end_ms - midpoint).abs())
        .map(|(i, _)| i)
        .unwrap_or(raw.tokens.len() / 2);

    if split_idx == 0 || split_idx >= raw.tokens.len() - 1 {
        return vec![raw];
    }

    let (left_tokens, right_tokens) = raw.tokens.split_at(split_idx + 1);
    let left = RawAsrSegment {
        text: left_tokens.iter().map(|t| t.text.as_str()).collect(),
        start_ms: raw.start_ms,
        end_ms: left_tokens.last().map(|t| t.end_ms).unwrap_or(midpoint),
        tokens: left_tokens.to_vec(),
        speaker: raw.speaker,
    };
    let right = RawAsrSegment {
        text: right_tokens.iter().map(|t| t.text.as_str()).collect(),
        start_ms: right_tokens.first().map(|t| t.start_ms).unwrap_or(midpoint),
        end_ms: raw.end_ms,
        tokens: right_tokens.to_vec(),
        speaker: raw.speaker,
    };

    let mut result = split_oversized(left, max_ms);
    result.extend(split_oversized(right, max_ms));
    result
}

fn raw_to_segment(raw: RawAsrSegment) -> Segment {
    let confidence = mean_token_confidence(&raw.tokens);
    Segment {
        text: raw.text,
        start_ms: raw.start_ms,
        end_ms: raw.end_ms,
        confidence,
        speaker: raw.speaker.unwrap_or(-1),
        sub_sentences: vec![],
    }
}

pub struct AsrStage {
    engine: Arc<dyn AsrEngine>,
    embedder: Option<Arc<dyn VoiceEmbedder>>,
    diarizer_settings: DiarizerSettings,
    /// Serializes ASR calls across concurrently-running tasks — the engine
    /// itself is assumed GPU-resident for the process lifetime (spec §4.2),
    /// so concurrent transcript tasks must still take turns on the model.
    asr_lock: Arc<AsyncMutex<()>>,
    max_segment_ms: i64,
}

impl AsrStage {
    pub fn new(
        engine: Arc<dyn AsrEngine>,
        embedder: Option<Arc<dyn VoiceEmbedder>>,
        diarizer_settings: DiarizerSettings,
        asr_lock: Arc<AsyncMutex<()>>,
        max_segment_ms: i64,
    ) -> Self {
        Self { engine, embedder, diarizer_settings, asr_lock, max_segment_ms }
    }
}

#[async_trait]
impl Stage for AsrStage {
    fn name(&self) -> &'static str {
        "asr"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        ctx.audio_path.is_some()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let wav_path = ctx.audio_path.clone().expect("should_run guarantees audio_path");
        progress(TaskStatus::ProcessingAsr, 0, 1);

        let raw_segments = {
            let _guard = self.asr_lock.lock().await;
            self.engine.transcribe(&wav_path, &ctx.hotwords, true).await?
        };

        let mut segments: Vec<Segment> = match self.engine.mode() {
            AsrMode::Paraformer => raw_segments.into_iter().map(raw_to_segment).collect(),
            AsrMode::SenseVoice => {
                let mut built = Vec::new();
                for raw in raw_segments {
                    let cleaned_text = strip_sensevoice_noise(&raw.text);
                    if crate::text::is_noise_segment(&cleaned_text) {
                        continue;
                    }
                    let raw = RawAsrSegment { text: cleaned_text, ..raw };
                    for piece in split_oversized(raw, self.max_segment_ms) {
                        built.push(raw_to_segment(piece));
                    }
                }
                built
            }
        };

        for seg in segments.iter_mut() {
            seg.sub_sentences = vec![SubSentence {
                text: seg.text.clone(),
                start_ms: seg.start_ms,
                end_ms: seg.end_ms,
            }];
        }

        if self.engine.mode() == AsrMode::SenseVoice {
            if let Some(embedder) = &self.embedder {
                let (samples, sample_rate) = read_wav_pcm16_mono(&wav_path)?;
                segments = diarize(segments, &samples, sample_rate, embedder.as_ref(), self.diarizer_settings).await?;
            }
        }

        progress(TaskStatus::ProcessingAsr, 1, 1);
        ctx.segments = segments;
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  KeyframeExtractStage
// ------------------------------------------------------------------ //

pub struct KeyframeExtractStage {
    config: KeyframeConfig,
    ffmpeg_path: String,
    persistence: Arc<PersistenceService>,
}

impl KeyframeExtractStage {
    pub fn new(config: KeyframeConfig, ffmpeg_path: impl Into<String>, persistence: Arc<PersistenceService>) -> Self {
        Self { config, ffmpeg_path: ffmpeg_path.into(), persistence }
    }
}

#[async_trait]
impl Stage for KeyframeExtractStage {
    fn name(&self) -> &'static str {
        "keyframe_extract"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        ctx.video_path.is_some()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        _progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let video_path = ctx.video_path.clone().expect("should_run guarantees video_path");
        let frames_dir = self.persistence.frames_dir(&ctx.task_id)?;

        let pattern = frames_dir.join("%05d.jpg");
        let args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            video_path.display().to_string(),
            "-vf".into(),
            format!("fps=1/{}", self.config.interval_s),
            pattern.display().to_string(),
        ];
        run_ffmpeg(&self.ffmpeg_path, &args).await?;

        let mut frame_paths: Vec<PathBuf> = std::fs::read_dir(&frames_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("jpg"))
            .collect();
        frame_paths.sort();

        // Uniform-sample down to max_count, deleting the frames we drop so
        // disk usage matches what's actually referenced by keyframes.json.
        if frame_paths.len() > self.config.max_count && self.config.max_count > 0 {
            let stride = frame_paths.len() as f64 / self.config.max_count as f64;
            let mut keep_idx: Vec<usize> = (0..self.config.max_count)
                .map(|i| ((i as f64) * stride).round() as usize)
                .map(|i| i.min(frame_paths.len() - 1))
                .collect();
            keep_idx.dedup();
            let keep: std::collections::HashSet<usize> = keep_idx.into_iter().collect();
            let mut kept_paths = Vec::new();
            for (idx, path) in frame_paths.into_iter().enumerate() {
                if keep.contains(&idx) {
                    kept_paths.push(path);
                } else {
                    let _ = std::fs::remove_file(&path);
                }
            }
            frame_paths = kept_paths;
        }

        let keyframes: Vec<KeyFrame> = frame_paths
            .iter()
            .enumerate()
            .map(|(i, path)| KeyFrame {
                index: i,
                timestamp_ms: estimate_frame_timestamp_ms(path, i, self.config.interval_s),
                path: path.display().to_string(),
            })
            .collect();

        self.persistence.save_json(&ctx.task_id, "keyframes.json", &keyframes)?;
        ctx.keyframe_paths = frame_paths;
        ctx.keyframes = keyframes;
        Ok(ctx)
    }
}

/// Prefer the frame's own filename-encoded sequence number (consistent
/// across reruns); fall back to its position in the sorted list times the
/// configured interval. Grounded on `keyframe_extract.py::_estimate_timestamp_ms`.
fn estimate_frame_timestamp_ms(path: &Path, fallback_index: usize, interval_s: f64) -> i64 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let frame_number = stem.trim_start_matches('0').parse::<i64>().ok();
    match frame_number {
        Some(n) if n > 0 => ((n - 1) as f64 * interval_s * 1000.0) as i64,
        _ => (fallback_index as f64 * interval_s * 1000.0) as i64,
    }
}

// ------------------------------------------------------------------ //
//  OCR external collaborator + stage
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Default)]
pub struct OcrFrameResult {
    pub text: String,
    pub confidence: f64,
    pub bbox: Vec<Vec<i64>>,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn scan_frame(&self, image_path: &Path) -> anyhow::Result<OcrFrameResult>;
}

struct OcrModelLoader {
    engine: Arc<dyn OcrEngine>,
}

#[async_trait]
impl crate::model_manager::ModelLoader for OcrModelLoader {
    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn name(&self) -> &str {
        "ocr"
    }
}

pub struct OcrStage {
    engine: Arc<dyn OcrEngine>,
    config: OcrConfig,
    model_manager: Arc<ModelManager>,
    persistence: Arc<PersistenceService>,
}

impl OcrStage {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        config: OcrConfig,
        model_manager: Arc<ModelManager>,
        persistence: Arc<PersistenceService>,
    ) -> Self {
        Self { engine, config, model_manager, persistence }
    }
}

#[async_trait]
impl Stage for OcrStage {
    fn name(&self) -> &'static str {
        "ocr_scan"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        self.config.enabled && !ctx.keyframes.is_empty()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        self.model_manager
            .register_loader(Arc::new(OcrModelLoader { engine: self.engine.clone() }))
            .await;
        self.model_manager.acquire("ocr").await?;

        let total = ctx.keyframes.len();
        let mut records = Vec::with_capacity(total);
        for (i, frame) in ctx.keyframes.iter().enumerate() {
            match self.engine.scan_frame(Path::new(&frame.path)).await {
                Ok(result) if !result.text.trim().is_empty() => {
                    records.push(OcrRecord {
                        timestamp_ms: frame.timestamp_ms,
                        text: result.text,
                        confidence: result.confidence,
                        frame_path: frame.path.clone(),
                        bbox: result.bbox,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(frame = %frame.path, error = %e, "OCR scan failed for frame"),
            }
            progress(TaskStatus::ScanningVisual, (i + 1) as u32, total as u32);
        }

        self.persistence.save_json(&ctx.task_id, "ocr_results.json", &records)?;
        ctx.ocr_records = records;
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  Face-detect external collaborator + stage
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Default)]
pub struct FaceFrameResult {
    pub face_present: bool,
    pub confidence: f64,
}

#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect_frame(&self, image_path: &Path) -> anyhow::Result<FaceFrameResult>;

    /// Collapse per-frame detections into contiguous presence/absence
    /// timeline events. A default implementation is provided since this is
    /// pure post-processing rather than model inference.
    fn analyze_face_timeline(&self, results: &[(i64, FaceFrameResult)], interval_ms: i64) -> Vec<VisualEvent> {
        default_face_timeline(results, interval_ms)
    }
}

fn default_face_timeline(results: &[(i64, FaceFrameResult)], interval_ms: i64) -> Vec<VisualEvent> {
    let mut events = Vec::new();
    let mut current: Option<(bool, i64, i64, f64)> = None; // (present, start, end, max_confidence)
    for (ts, result) in results {
        match &mut current {
            Some((present, _start, end, max_conf)) if *present == result.face_present => {
                *end = ts + interval_ms;
                *max_conf = max_conf.max(result.confidence);
            }
            _ => {
                if let Some((present, start, end, max_conf)) = current.take() {
                    events.push(VisualEvent {
                        event_type: if present { VisualEventType::FaceDetected } else { VisualEventType::FaceMissing },
                        start_ms: start,
                        end_ms: end,
                        confidence: max_conf,
                        frame_path: None,
                    });
                }
                current = Some((result.face_present, *ts, ts + interval_ms, result.confidence));
            }
        }
    }
    if let Some((present, start, end, max_conf)) = current {
        events.push(VisualEvent {
            event_type: if present { VisualEventType::FaceDetected } else { VisualEventType::FaceMissing },
            start_ms: start,
            end_ms: end,
            confidence: max_conf,
            frame_path: None,
        });
    }
    events
}

struct FaceModelLoader;

#[async_trait]
impl crate::model_manager::ModelLoader for FaceModelLoader {
    async fn load(&self) -> anyhow::Result<()> {
        Ok(())
    }
    async fn unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
    fn name(&self) -> &str {
        "face_detect"
    }
}

pub struct FaceDetectStage {
    detector: Arc<dyn FaceDetector>,
    config: FaceDetectConfig,
    model_manager: Arc<ModelManager>,
    persistence: Arc<PersistenceService>,
    interval_ms: i64,
}

impl FaceDetectStage {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        config: FaceDetectConfig,
        model_manager: Arc<ModelManager>,
        persistence: Arc<PersistenceService>,
        interval_ms: i64,
    ) -> Self {
        Self { detector, config, model_manager, persistence, interval_ms }
    }
}

#[async_trait]
impl Stage for FaceDetectStage {
    fn name(&self) -> &'static str {
        "face_detect"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        self.config.enabled && !ctx.keyframes.is_empty()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        self.model_manager.register_loader(Arc::new(FaceModelLoader)).await;
        self.model_manager.acquire("face_detect").await?;

        let total = ctx.keyframes.len();
        let mut per_frame = Vec::with_capacity(total);
        for (i, frame) in ctx.keyframes.iter().enumerate() {
            match self.detector.detect_frame(Path::new(&frame.path)).await {
                Ok(result) => per_frame.push((frame.timestamp_ms, result)),
                Err(e) => {
                    warn!(frame = %frame.path, error = %e, "face detection failed for frame");
                    per_frame.push((frame.timestamp_ms, FaceFrameResult::default()));
                }
            }
            progress(TaskStatus::ScanningVisual, (i + 1) as u32, total as u32);
        }

        let events = self.detector.analyze_face_timeline(&per_frame, self.interval_ms);
        self.persistence.save_json(&ctx.task_id, "visual_events.json", &events)?;
        ctx.visual_events = events
            .into_iter()
            .map(|e| {
                let label = match e.event_type {
                    VisualEventType::FaceDetected => "face_detected",
                    VisualEventType::FaceMissing => "face_missing",
                    VisualEventType::SceneChange => "scene_change",
                };
                (e.start_ms, label.to_string())
            })
            .collect();
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  SpeakerSmoothStage
// ------------------------------------------------------------------ //

pub struct SpeakerSmoothStage {
    max_flicker_ms: i64,
    pre_merge_gap_ms: i64,
}

impl SpeakerSmoothStage {
    pub fn new(max_flicker_ms: i64, pre_merge_gap_ms: i64) -> Self {
        Self { max_flicker_ms, pre_merge_gap_ms }
    }
}

#[async_trait]
impl Stage for SpeakerSmoothStage {
    fn name(&self) -> &'static str {
        "speaker_smooth"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        !ctx.segments.is_empty()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        _progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let smoothed = crate::text::smooth_speakers(ctx.segments, self.max_flicker_ms);
        ctx.segments = crate::text::pre_merge_segments(smoothed, self.pre_merge_gap_ms);
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  TextCorrectionStage
// ------------------------------------------------------------------ //

/// Phase-4 collaborator backed by the real LLM client, issuing the
/// JSON-to-JSON polish request per spec §4.6 phase 4.
struct LlmPolishCollaborator<'a> {
    llm: &'a LlmClient,
    num_ctx: u32,
}

const CORRECTION_SYSTEM_PROMPT: &str = "\
你是一名语音转写文本校对专家。输入是若干条JSON格式的转写片段，每条包含id和text。\
请修正其中的错别字、口误倒装、同音字错误，删除无意义的语气词，但必须保持原意不变。\
严禁新增、删除、合并或拆分任何一条记录的id，严禁改变id的数量与顺序。\
仅输出JSON，格式为{\"entries\":[{\"id\":...,\"text\":\"...\"},...]}，不要输出任何解释性文字。";

#[async_trait]
impl<'a> CorrectionCollaborator for LlmPolishCollaborator<'a> {
    async fn correct_batch(&self, entries: &[(usize, String)]) -> anyhow::Result<HashMap<usize, String>> {
        let payload = serde_json::json!({
            "entries": entries.iter().map(|(id, text)| serde_json::json!({"id": id, "text": text})).collect::<Vec<_>>(),
        });
        let messages = vec![
            ChatMessage::system(CORRECTION_SYSTEM_PROMPT),
            ChatMessage::user(payload.to_string()),
        ];
        let options = ChatOptions {
            temperature: Some(0.2),
            json_format: true,
            num_ctx: Some(self.num_ctx),
            ..Default::default()
        };
        let response = self.llm.chat(&messages, &options).await?;
        Ok(parse_polish_response(&response, entries))
    }
}

fn parse_polish_response(response: &str, entries: &[(usize, String)]) -> HashMap<usize, String> {
    let ids: Vec<usize> = entries.iter().map(|(id, _)| *id).collect();
    if let Some(map) = try_parse_polish_json(response, &ids) {
        return map;
    }
    regex_fallback_parse(response)
}

fn try_parse_polish_json(response: &str, ids: &[usize]) -> Option<HashMap<usize, String>> {
    let cleaned = response.trim();
    let value: serde_json::Value = serde_json::from_str(cleaned).ok().or_else(|| {
        let start = cleaned.find(['{', '['])?;
        let end = cleaned.rfind(['}', ']'])?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&cleaned[start..=end]).ok()
    })?;

    let mut out = HashMap::new();
    let items = match &value {
        serde_json::Value::Object(obj) => obj.get("entries")?.as_array()?.clone(),
        serde_json::Value::Array(arr) => arr.clone(),
        _ => return None,
    };
    for (idx, item) in items.iter().enumerate() {
        let id = item
            .get("id")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .or_else(|| ids.get(idx).copied());
        let text = item.get("text").and_then(|v| v.as_str());
        if let (Some(id), Some(text)) = (id, text) {
            out.insert(id, text.to_string());
        }
    }
    Some(out)
}

static POLISH_REGEX_FALLBACK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""id"\s*:\s*(\d+)\s*,\s*"text"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());

fn regex_fallback_parse(response: &str) -> HashMap<usize, String> {
    let mut out = HashMap::new();
    for caps in POLISH_REGEX_FALLBACK.captures_iter(response) {
        if let Ok(id) = caps[1].parse::<usize>() {
            out.insert(id, caps[2].replace("\\\"", "\""));
        }
    }
    out
}

pub struct TextCorrectionStage {
    corrector: Corrector,
    llm: Arc<LlmClient>,
    num_ctx: u32,
    max_entries_per_batch: usize,
    max_chars_per_batch: usize,
    confidence_skip_threshold: f64,
}

impl TextCorrectionStage {
    pub fn new(
        corrector: Corrector,
        llm: Arc<LlmClient>,
        num_ctx: u32,
        max_entries_per_batch: usize,
        max_chars_per_batch: usize,
        confidence_skip_threshold: f64,
    ) -> Self {
        Self { corrector, llm, num_ctx, max_entries_per_batch, max_chars_per_batch, confidence_skip_threshold }
    }
}

#[async_trait]
impl Stage for TextCorrectionStage {
    fn name(&self) -> &'static str {
        "text_correction"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        !ctx.segments.is_empty()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let noise_mask: Vec<bool> = ctx.segments.iter().map(|s| crate::text::is_noise_segment(&s.text)).collect();

        self.corrector.correct_segments(&mut ctx.segments).await?;

        let has_confidence = ctx.segments.iter().any(|s| s.confidence > 0.0);
        let all_above_threshold = has_confidence
            && ctx
                .segments
                .iter()
                .zip(&noise_mask)
                .all(|(seg, noise)| *noise || seg.confidence >= self.confidence_skip_threshold);

        let mut correction_map: HashMap<usize, String> = HashMap::new();
        let mut needs_llm: Vec<(usize, String)> = Vec::new();

        for (i, seg) in ctx.segments.iter().enumerate() {
            if noise_mask[i] {
                correction_map.insert(i, String::new());
                continue;
            }
            let needs_correction = has_confidence && !all_above_threshold && seg.confidence < self.confidence_skip_threshold;
            if !has_confidence || all_above_threshold || !needs_correction {
                correction_map.insert(i, seg.text.clone());
            } else {
                needs_llm.push((i, seg.text.clone()));
            }
        }

        if !needs_llm.is_empty() {
            let collaborator = LlmPolishCollaborator { llm: &self.llm, num_ctx: self.num_ctx };
            let on_progress = |done: usize, total: usize| {
                progress(TaskStatus::Correcting, done as u32, total as u32);
            };
            let polished = polish_batches_with_progress(
                &collaborator,
                needs_llm.clone(),
                self.max_entries_per_batch,
                self.max_chars_per_batch,
                Some(&on_progress),
            )
            .await;
            for (idx, original) in needs_llm {
                let text = polished.get(&idx).cloned().unwrap_or(original);
                correction_map.insert(idx, text);
            }
        }

        ctx.correction_map = correction_map;
        Ok(ctx)
    }
}

// ------------------------------------------------------------------ //
//  TranscriptBuildStage
// ------------------------------------------------------------------ //

pub struct TranscriptBuildStage {
    entry_gap_ms: i64,
    enable_entry_level_smoothing: bool,
}

impl TranscriptBuildStage {
    pub fn new(entry_gap_ms: i64, enable_entry_level_smoothing: bool) -> Self {
        Self { entry_gap_ms, enable_entry_level_smoothing }
    }
}

#[async_trait]
impl Stage for TranscriptBuildStage {
    fn name(&self) -> &'static str {
        "transcript_build"
    }

    fn should_run(&self, ctx: &PipelineContext) -> bool {
        !ctx.segments.is_empty() && !ctx.correction_map.is_empty()
    }

    async fn execute(
        &self,
        mut ctx: PipelineContext,
        _progress: &ProgressCallback,
    ) -> anyhow::Result<PipelineContext> {
        let mut entries = Vec::new();
        for (i, seg) in ctx.segments.iter().enumerate() {
            let corrected = ctx.correction_map.get(&i).cloned().unwrap_or_else(|| seg.text.clone());
            if corrected.is_empty() {
                continue; // noise-filtered in phase 1
            }
            let speaker_label = if seg.speaker >= 0 {
                format!("Speaker {}", seg.speaker + 1)
            } else {
                "Speaker 1".to_string()
            };

            if seg.sub_sentences.len() > 1 {
                entries.extend(split_entry_by_sub_sentences(seg, &corrected, &speaker_label));
            } else {
                entries.push(TranscriptEntry {
                    timestamp: crate::text::format_timestamp(seg.start_ms),
                    timestamp_ms: seg.start_ms,
                    end_ms: seg.end_ms,
                    speaker: speaker_label,
                    text: seg.text.clone(),
                    text_corrected: corrected,
                });
            }
        }

        if self.enable_entry_level_smoothing {
            entries = crate::text::merge_transcript_entries(entries, self.entry_gap_ms);
        }

        ctx.transcript = entries;
        Ok(ctx)
    }
}

/// Allocate a segment's corrected text across its sub-sentences
/// proportionally to each sub-sentence's share of the segment's original
/// character count, with the last sub-sentence absorbing the remainder —
/// the same proportional-allocation idea the diarizer uses for speaker-turn
/// text splitting.
fn split_entry_by_sub_sentences(seg: &Segment, corrected: &str, speaker_label: &str) -> Vec<TranscriptEntry> {
    let total_original_chars: usize = seg.sub_sentences.iter().map(|s| s.text.chars().count()).sum();
    let corrected_chars: Vec<char> = corrected.chars().collect();
    let mut cursor = 0usize;
    let mut out = Vec::with_capacity(seg.sub_sentences.len());

    for (i, sub) in seg.sub_sentences.iter().enumerate() {
        let share = if total_original_chars == 0 {
            0
        } else {
            (sub.text.chars().count() * corrected_chars.len()) / total_original_chars
        };
        let take = if i == seg.sub_sentences.len() - 1 {
            corrected_chars.len().saturating_sub(cursor)
        } else {
            share.min(corrected_chars.len().saturating_sub(cursor))
        };
        let piece: String = corrected_chars[cursor..cursor + take].iter().collect();
        cursor += take;

        out.push(TranscriptEntry {
            timestamp: crate::text::format_timestamp(sub.start_ms),
            timestamp_ms: sub.start_ms,
            end_ms: sub.end_ms,
            speaker: speaker_label.to_string(),
            text: sub.text.clone(),
            text_corrected: piece,
        });
    }
    out
}

/// Builds the full stage sequence in declared order, honoring the
/// optional-video / optional-visual-evidence branches. Collaborators are
/// injected so the core pipeline never depends on concrete ML model code.
#[allow(clippy::too_many_arguments)]
pub fn build_orchestrator(
    config: &Config,
    corrector: Corrector,
    llm: Arc<LlmClient>,
    asr_engine: Arc<dyn AsrEngine>,
    voice_embedder: Option<Arc<dyn VoiceEmbedder>>,
    ocr_engine: Option<Arc<dyn OcrEngine>>,
    face_detector: Option<Arc<dyn FaceDetector>>,
    model_manager: Arc<ModelManager>,
    persistence: Arc<PersistenceService>,
    asr_lock: Arc<AsyncMutex<()>>,
) -> super::Orchestrator {
    let diarizer_settings = DiarizerSettings {
        sliding_threshold_ms: config.diarizer.sliding_threshold_ms,
        window_ms: config.diarizer.window_ms,
        step_ms: config.diarizer.step_ms,
        min_window_ms: config.diarizer.min_window_ms,
        max_windows: config.diarizer.max_windows,
        distance_threshold: config.diarizer.distance_threshold,
        max_flicker_ms: config.diarizer.max_flicker_ms,
    };

    let mut orchestrator = super::Orchestrator::new()
        .register(Arc::new(VideoPrepStage::new(config.video.clone())))
        .register(Arc::new(AudioPrepStage::new(config.video.ffmpeg_path.clone())))
        .register(Arc::new(AsrStage::new(
            asr_engine,
            voice_embedder,
            diarizer_settings,
            asr_lock,
            config.asr.max_segment_ms,
        )));

    if let Some(ocr_engine) = ocr_engine {
        orchestrator = orchestrator
            .register(Arc::new(KeyframeExtractStage::new(
                config.keyframe.clone(),
                config.video.ffmpeg_path.clone(),
                persistence.clone(),
            )))
            .register(Arc::new(OcrStage::new(
                ocr_engine,
                config.ocr.clone(),
                model_manager.clone(),
                persistence.clone(),
            )));
    }

    if let Some(face_detector) = face_detector {
        let interval_ms = (config.keyframe.interval_s * 1000.0) as i64;
        orchestrator = orchestrator.register(Arc::new(FaceDetectStage::new(
            face_detector,
            config.face_detect.clone(),
            model_manager,
            persistence,
            interval_ms,
        )));
    }

    orchestrator
        .register(Arc::new(SpeakerSmoothStage::new(
            config.diarizer.max_flicker_ms,
            config.corrector.pre_merge_gap_ms,
        )))
        .register(Arc::new(TextCorrectionStage::new(
            corrector,
            llm,
            config.compliance.num_ctx,
            config.corrector.max_entries_per_batch,
            config.corrector.max_chars_per_batch,
            config.corrector.confidence_skip_threshold,
        )))
        .register(Arc::new(TranscriptBuildStage::new(
            5_000,
            config.corrector.enable_entry_level_smoothing,
        )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_sensevoice_noise_removes_tags_and_collapses_punctuation() {
        let cleaned = strip_sensevoice_noise("<|zh|>你好。。。世界");
        assert_eq!(cleaned, "你好。世界");
    }

    #[test]
    fn mean_token_confidence_excludes_punctuation() {
        let tokens = vec![
            AsrToken { text: "你好".into(), start_ms: 0, end_ms: 100, confidence: 0.9 },
            AsrToken { text: "，".into(), start_ms: 100, end_ms: 110, confidence: 0.1 },
            AsrToken { text: "世界".into(), start_ms: 110, end_ms: 200, confidence: 0.7 },
        ];
        let conf = mean_token_confidence(&tokens);
        assert!((conf - 0.8).abs() < 1e-9);
    }

    #[test]
    fn split_oversized_leaves_short_segments_untouched() {
        let raw = RawAsrSegment {
            text: "短句".into(),
            start_ms: 0,
            end_ms: 500,
            tokens: vec![],
            speaker: None,
        };
        let pieces = split_oversized(raw, 60_000);
        assert_eq!(pieces.len(), 1);
    }

    #[test]
    fn parse_polish_response_handles_entries_object() {
        let response = r#"{"entries":[{"id":0,"text":"修正后"}]}"#;
        let entries = vec![(0usize, "原文".to_string())];
        let parsed = parse_polish_response(response, &entries);
        assert_eq!(parsed.get(&0), Some(&"修正后".to_string()));
    }

    #[test]
    fn parse_polish_response_falls_back_to_regex_on_garbage() {
        let response = r#"garbage prefix "id":3,"text":"fixed" trailing junk"#;
        let entries = vec![(3usize, "orig".to_string())];
        let parsed = parse_polish_response(response, &entries);
        assert_eq!(parsed.get(&3), Some(&"fixed".to_string()));
    }

    #[test]
    fn face_timeline_collapses_contiguous_same_state_frames() {
        let detector_results = vec![
            (0i64, FaceFrameResult { face_present: true, confidence: 0.9 }),
            (1000i64, FaceFrameResult { face_present: true, confidence: 0.8 }),
            (2000i64, FaceFrameResult { face_present: false, confidence: 0.95 }),
        ];
        let events = default_face_timeline(&detector_results, 1000);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, VisualEventType::FaceDetected);
        assert_eq!(events[1].event_type, VisualEventType::FaceMissing);
    }

    #[test]
    fn split_entry_by_sub_sentences_allocates_proportionally() {
        let seg = Segment {
            text: "你好世界再见".into(),
            start_ms: 0,
            end_ms: 2000,
            confidence: 0.9,
            speaker: 0,
            sub_sentences: vec![
                SubSentence { text: "你好".into(), start_ms: 0, end_ms: 1000 },
                SubSentence { text: "世界再见".into(), start_ms: 1000, end_ms: 2000 },
            ],
        };
        let entries = split_entry_by_sub_sentences(&seg, "你好啊世界再见啦", "Speaker 1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].timestamp_ms, 1000);
    }
}
