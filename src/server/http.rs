//! Request handlers for the task submission / polling / result surface.
//! See spec §6. HTTP-specific parsing (multipart fields, mime-type
//! detection) lives entirely here; everything else delegates to
//! `TaskStore` / `PersistenceService`.

use crate::error::CoreError;
use crate::server::ServerState;
use crate::task_store::TaskResultPayload;
use crate::types::{TranscriptEntry, ViolationStatus};
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Typed HTTP-boundary error. Wraps `CoreError` for the 500 case and adds
/// the request-validation statuses spec §7 assigns to this layer.
pub enum AppError {
    Validation(String),
    NotFound(String),
    TooLarge(String),
    Core(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::TooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Core(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Core(e.to_string())
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        AppError::Core(e.to_string())
    }
}

type HandlerResult<T> = Result<T, AppError>;

// -- submission ---------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: String,
    status: &'static str,
    existing: bool,
}

/// `POST /api/v1/tasks/transcript` — multipart `file` (audio/video),
/// optional `hotwords` (JSON string array).
pub async fn submit_transcript(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> HandlerResult<Response> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut hotwords_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                filename = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read file field: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            "hotwords" => {
                hotwords_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::Validation(format!("failed to read hotwords field: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let bytes = file_bytes.ok_or_else(|| AppError::Validation("missing required `file` field".to_string()))?;
    if bytes.is_empty() {
        return Err(AppError::Validation("uploaded file is empty".to_string()));
    }

    let hotwords: Vec<String> = match hotwords_raw {
        Some(raw) if !raw.trim().is_empty() => {
            serde_json::from_str(&raw).map_err(|e| AppError::Validation(format!("invalid hotwords JSON: {e}")))?
        }
        _ => Vec::new(),
    };

    let (task_id, existing) = state
        .store
        .submit_transcript(bytes, filename, hotwords)
        .await
        .map_err(AppError::from)?;

    let body = SubmitResponse {
        task_id,
        status: "pending",
        existing,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
struct ChildSubmitForm {
    #[serde(default)]
    parent_task_id: Option<String>,
}

/// `POST /api/v1/evaluate/text/async` — multipart `text`, optional
/// `parent_task_id`.
pub async fn submit_text_evaluation(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> HandlerResult<Response> {
    let mut text: Option<String> = None;
    let mut parent_task_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "text" => {
                text = Some(field.text().await.map_err(|e| AppError::Validation(e.to_string()))?);
            }
            "parent_task_id" => {
                let value = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                if !value.trim().is_empty() {
                    parent_task_id = Some(value);
                }
            }
            _ => {}
        }
    }

    let text = text.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AppError::Validation("text must not be empty".to_string()));
    }

    let task_id = state
        .store
        .submit_text_evaluation(text, parent_task_id)
        .await
        .map_err(AppError::from)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "pending" })),
    )
        .into_response())
}

/// `POST /api/v1/compliance/audit/async` — multipart `rules_file` (≤ 2 MB),
/// `transcript` (JSON array string), optional `parent_task_id`.
pub async fn submit_compliance_audit(
    State(state): State<ServerState>,
    mut multipart: Multipart,
) -> HandlerResult<Response> {
    let mut rules_bytes: Option<Vec<u8>> = None;
    let mut rules_filename = String::new();
    let mut transcript_raw: Option<String> = None;
    let mut parent_task_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "rules_file" => {
                rules_filename = field.file_name().unwrap_or("rules.csv").to_string();
                let bytes = field.bytes().await.map_err(|e| AppError::Validation(e.to_string()))?;
                if bytes.len() > state.config.server.max_rule_file_bytes {
                    return Err(AppError::TooLarge(format!(
                        "rules_file exceeds the {} byte limit",
                        state.config.server.max_rule_file_bytes
                    )));
                }
                rules_bytes = Some(bytes.to_vec());
            }
            "transcript" => {
                transcript_raw = Some(field.text().await.map_err(|e| AppError::Validation(e.to_string()))?);
            }
            "parent_task_id" => {
                let value = field.text().await.map_err(|e| AppError::Validation(e.to_string()))?;
                if !value.trim().is_empty() {
                    parent_task_id = Some(value);
                }
            }
            _ => {}
        }
    }

    let rules_bytes = rules_bytes.ok_or_else(|| AppError::Validation("missing required `rules_file` field".to_string()))?;
    let transcript_raw =
        transcript_raw.ok_or_else(|| AppError::Validation("missing required `transcript` field".to_string()))?;
    let entries: Vec<TranscriptEntry> =
        serde_json::from_str(&transcript_raw).map_err(|e| AppError::Validation(format!("invalid transcript JSON: {e}")))?;
    if entries.is_empty() {
        return Err(AppError::Validation("transcript must not be empty".to_string()));
    }

    let task_id = state
        .store
        .submit_compliance_audit(entries, rules_bytes, rules_filename, parent_task_id)
        .await
        .map_err(AppError::from)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "status": "pending" })),
    )
        .into_response())
}

// -- polling / results ----------------------------------------------------------

fn result_to_json(payload: &TaskResultPayload) -> serde_json::Value {
    match payload {
        TaskResultPayload::Transcript(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
        TaskResultPayload::Evaluation(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
        TaskResultPayload::Compliance(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
    }
}

/// `GET /api/v1/tasks/{id}` — status, progress, result-if-completed,
/// error-if-failed.
pub async fn get_task(State(state): State<ServerState>, Path(id): Path<String>) -> HandlerResult<Response> {
    let record = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("unknown task {id}")))?;

    Ok(Json(json!({
        "task_id": record.id,
        "status": record.status,
        "progress": {
            "current_chunk": record.progress.current_chunk,
            "total_chunks": record.progress.total_chunks,
            "percent": record.progress.percent,
        },
        "result": record.result.as_ref().map(result_to_json),
        "error": record.error,
    }))
    .into_response())
}

/// `GET /api/v1/tasks/{id}/results` — full persisted bundle, for clients
/// that poll `/tasks/{id}` for status then fetch the persisted artifacts
/// directly once the task is terminal.
pub async fn get_task_results(State(state): State<ServerState>, Path(id): Path<String>) -> HandlerResult<Response> {
    let persistence = state.store.persistence();
    if persistence.load_meta(&id).is_none() && state.store.get(&id).await.is_none() {
        return Err(AppError::NotFound(format!("unknown task {id}")));
    }

    let transcript: Option<crate::types::TranscriptResult> = persistence.load_json(&id, "transcript.json");
    let evaluation: Option<crate::types::EvaluationResult> = persistence.load_json(&id, "evaluation.json");
    let compliance: Option<crate::types::ComplianceReport> = persistence.load_json(&id, "compliance.json");

    let has_media = persistence.find_video(&id).is_some() || persistence.find_audio(&id).is_some();
    let has_keyframes = persistence.has_file(&id, "keyframes.json");
    let has_ocr = persistence.has_file(&id, "ocr_results.json");
    let has_visual_events = persistence.has_file(&id, "visual_events.json");

    Ok(Json(json!({
        "task_id": id,
        "transcript": transcript,
        "evaluation": evaluation,
        "compliance": compliance,
        "has_media": has_media,
        "has_keyframes": has_keyframes,
        "has_ocr": has_ocr,
        "has_visual_events": has_visual_events,
    }))
    .into_response())
}

// -- file serving -------------------------------------------------------------

async fn serve_file(path: std::path::PathBuf) -> HandlerResult<Response> {
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| AppError::NotFound(format!("artifact not found: {e}")))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}

/// `GET /api/v1/tasks/{id}/media` — the original uploaded file (video or
/// audio, whichever was submitted).
pub async fn get_task_media(State(state): State<ServerState>, Path(id): Path<String>) -> HandlerResult<Response> {
    let persistence = state.store.persistence();
    let path = persistence
        .find_video(&id)
        .or_else(|| persistence.find_audio(&id))
        .ok_or_else(|| AppError::NotFound(format!("no media for task {id}")))?;
    serve_file(path).await
}

/// `GET /api/v1/tasks/{id}/audio` — the ASR-ready mono WAV: the extracted
/// track for a video source, or the original upload for an audio source.
pub async fn get_task_audio(State(state): State<ServerState>, Path(id): Path<String>) -> HandlerResult<Response> {
    let persistence = state.store.persistence();
    let path = persistence
        .find_extracted_wav(&id)
        .or_else(|| persistence.find_audio(&id))
        .or_else(|| persistence.find_video(&id))
        .ok_or_else(|| AppError::NotFound(format!("no audio for task {id}")))?;
    serve_file(path).await
}

/// `GET /api/v1/tasks/{id}/frames/{filename}` — one extracted keyframe.
/// Rejects path separators in `filename` so a client can't escape the
/// task's frames directory.
pub async fn get_task_frame(
    State(state): State<ServerState>,
    Path((id, filename)): Path<(String, String)>,
) -> HandlerResult<Response> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(AppError::Validation("invalid frame filename".to_string()));
    }
    let persistence = state.store.persistence();
    let dir = persistence
        .frames_dir(&id)
        .map_err(|e| AppError::Core(e.to_string()))?;
    serve_file(dir.join(filename)).await
}

// -- rerun / patch --------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct RerunTranscriptBody {
    #[serde(default)]
    pub hotwords: Vec<String>,
}

/// `POST /api/v1/tasks/{id}/rerun-transcript` — same task id restarts.
/// Body is an optional JSON object `{"hotwords": [...]}`; an empty or
/// absent body reruns with no hotwords.
pub async fn rerun_transcript(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> HandlerResult<Response> {
    let hotwords = if body.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice::<RerunTranscriptBody>(&body)
            .map_err(|e| AppError::Validation(format!("invalid request body: {e}")))?
            .hotwords
    };
    state
        .store
        .rerun_transcript(id.clone(), hotwords)
        .await
        .map_err(AppError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": id, "status": "pending" }))).into_response())
}

/// `POST /api/v1/tasks/{id}/rerun-evaluation` — new child task id.
pub async fn rerun_evaluation(State(state): State<ServerState>, Path(id): Path<String>) -> HandlerResult<Response> {
    let child_id = state.store.rerun_evaluation(id).await.map_err(AppError::from)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": child_id, "status": "pending" }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ViolationUpdate {
    pub index: usize,
    pub status: ViolationStatus,
}

#[derive(Debug, Deserialize)]
pub struct PatchViolationsBody {
    pub updates: Vec<ViolationUpdate>,
}

/// `PATCH /api/v1/tasks/{id}/compliance/violations` — mutate per-violation
/// review status in the persisted report.
pub async fn patch_violations(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(body): Json<PatchViolationsBody>,
) -> HandlerResult<Response> {
    let updates: Vec<(usize, ViolationStatus)> = body.updates.into_iter().map(|u| (u.index, u.status)).collect();
    state
        .store
        .update_violation_statuses(&id, &updates)
        .await
        .map_err(AppError::from)?;
    Ok((StatusCode::OK, Json(json!({ "task_id": id, "updated": updates.len() }))).into_response())
}
