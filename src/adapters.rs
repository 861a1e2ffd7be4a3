//! HTTP-client collaborators for the pipeline's external-model seams.
//!
//! The ASR, voiceprint, OCR, face-detection and CSC models themselves are
//! out of scope for this crate (spec Non-goals): real inference runs behind
//! a model-serving process, and these adapters just speak HTTP to it, the
//! same way [`crate::llm::LlmClient`] speaks to an Ollama-shaped endpoint.
//! Swap any of these out for a different backend by implementing the
//! corresponding trait and passing it to the orchestrator instead.

use crate::config::{AsrAdapterConfig, EmbedderAdapterConfig};
use crate::corrector::LightCscCollaborator;
use crate::diarizer::VoiceEmbedder;
use crate::error::AsrError;
use crate::pipeline::stages::{AsrEngine, AsrMode, AsrToken, FaceDetector, FaceFrameResult, OcrEngine, OcrFrameResult, RawAsrSegment};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("reqwest client build should never fail with static config")
}

/// Talks to an external ASR model server over HTTP. The server is expected
/// to accept a multipart file upload and return a JSON array of segments.
pub struct HttpAsrEngine {
    client: reqwest::Client,
    base_url: String,
    mode: AsrMode,
}

impl HttpAsrEngine {
    pub fn new(config: &AsrAdapterConfig, mode: AsrMode) -> Self {
        Self {
            client: build_client(config.request_timeout_secs),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            mode,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAsrToken {
    text: String,
    start_ms: i64,
    end_ms: i64,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct WireAsrSegment {
    text: String,
    start_ms: i64,
    end_ms: i64,
    #[serde(default)]
    tokens: Vec<WireAsrToken>,
    #[serde(default)]
    speaker: Option<i32>,
}

#[async_trait]
impl AsrEngine for HttpAsrEngine {
    async fn transcribe(
        &self,
        wav_path: &Path,
        hotwords: &[String],
        sentence_timestamp: bool,
    ) -> anyhow::Result<Vec<RawAsrSegment>> {
        let bytes = tokio::fs::read(wav_path)
            .await
            .map_err(|e| AsrError::EngineFailure(format!("failed to read {}: {e}", wav_path.display())))?;
        let file_name = wav_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.wav".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| AsrError::EngineFailure(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("audio", part)
            .text("mode", mode_name(self.mode))
            .text("hotwords", hotwords.join(","))
            .text("sentence_timestamp", sentence_timestamp.to_string());

        let resp = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AsrError::EngineFailure(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AsrError::EngineFailure(format!("{status}: {body}")).into());
        }

        let segments: Vec<WireAsrSegment> = resp
            .json()
            .await
            .map_err(|e| AsrError::MalformedOutput(e.to_string()))?;

        Ok(segments
            .into_iter()
            .map(|s| RawAsrSegment {
                text: s.text,
                start_ms: s.start_ms,
                end_ms: s.end_ms,
                tokens: s
                    .tokens
                    .into_iter()
                    .map(|t| AsrToken {
                        text: t.text,
                        start_ms: t.start_ms,
                        end_ms: t.end_ms,
                        confidence: t.confidence,
                    })
                    .collect(),
                speaker: s.speaker,
            })
            .collect())
    }

    fn mode(&self) -> AsrMode {
        self.mode
    }
}

fn mode_name(mode: AsrMode) -> &'static str {
    match mode {
        AsrMode::Paraformer => "paraformer",
        AsrMode::SenseVoice => "sensevoice",
    }
}

/// Talks to an external voiceprint embedding server. Samples are sent as a
/// raw JSON array of f32s rather than multipart, since they're already
/// decoded PCM floats held in memory by the diarizer.
pub struct HttpVoiceEmbedder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVoiceEmbedder {
    pub fn new(config: &EmbedderAdapterConfig) -> Self {
        Self {
            client: build_client(config.request_timeout_secs),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    samples: &'a [f32],
    sample_rate: u32,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl VoiceEmbedder for HttpVoiceEmbedder {
    async fn embed(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { samples, sample_rate })
            .send()
            .await?
            .error_for_status()?;
        let body: EmbedResponse = resp.json().await?;
        Ok(body.embedding)
    }
}

/// Talks to an external OCR model server, uploading a single keyframe image.
pub struct HttpOcrEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOcrEngine {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn scan_frame(&self, image_path: &Path) -> anyhow::Result<OcrFrameResult> {
        let bytes = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "frame.jpg".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("image", part);
        let result: OcrFrameResult = self
            .client
            .post(format!("{}/ocr", self.base_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

/// Talks to an external face-detection model server, uploading a single
/// keyframe image. Timeline reduction uses the trait's default
/// implementation, since that's pure post-processing, not inference.
pub struct HttpFaceDetector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFaceDetector {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            client: build_client(timeout_secs),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl FaceDetector for HttpFaceDetector {
    async fn detect_frame(&self, image_path: &Path) -> anyhow::Result<FaceFrameResult> {
        let bytes = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "frame.jpg".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("image", part);
        let result: FaceFrameResult = self
            .client
            .post(format!("{}/detect", self.base_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

/// Talks to an external light CSC (Chinese spelling correction) model
/// server. Disabled by default; the corrector treats a `None` collaborator
/// as an identity pass, per spec.
pub struct HttpCscCollaborator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCscCollaborator {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: build_client(30),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(serde::Serialize)]
struct CscRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct CscResponse {
    text: String,
}

#[async_trait]
impl LightCscCollaborator for HttpCscCollaborator {
    async fn correct(&self, text: &str) -> anyhow::Result<String> {
        let resp: CscResponse = self
            .client
            .post(format!("{}/correct", self.base_url))
            .json(&CscRequest { text })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.text)
    }
}
