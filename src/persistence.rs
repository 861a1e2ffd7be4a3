//! Per-task JSON persistence under `uploads_dir/{task_id}/`, plus the
//! content-hash dedup index. See spec §4.1.

use crate::error::StorageError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub filename: String,
    pub hash: String,
    pub audio_suffix: String,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_suffix: Option<String>,
}

fn default_media_type() -> String {
    "audio".to_string()
}

/// Summary of a task directory discovered by `scan_completed_tasks`.
#[derive(Debug, Clone)]
pub struct ScannedTask {
    pub task_id: String,
    pub meta: TaskMeta,
    pub has_transcript: bool,
    pub has_evaluation: bool,
    pub has_compliance: bool,
    pub audio_path: Option<PathBuf>,
    pub has_video: bool,
    pub keyframe_count: usize,
    pub has_ocr_results: bool,
    pub has_visual_events: bool,
}

#[derive(Clone)]
pub struct PersistenceService {
    uploads_dir: PathBuf,
}

impl PersistenceService {
    pub fn new(uploads_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let uploads_dir = uploads_dir.into();
        std::fs::create_dir_all(&uploads_dir)?;
        Ok(Self { uploads_dir })
    }

    pub fn task_dir(&self, task_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.uploads_dir.join(task_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn task_dir_existing(&self, task_id: &str) -> PathBuf {
        self.uploads_dir.join(task_id)
    }

    // -- JSON read / write -------------------------------------------------

    pub fn save_json<T: Serialize>(
        &self,
        task_id: &str,
        filename: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let dir = self
            .task_dir(task_id)
            .map_err(|e| StorageError::DirCreateFailed {
                path: task_id.to_string(),
                source: e,
            })?;
        let dest = dir.join(filename);
        let content = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
        atomic_write(&dest, content.as_bytes())?;
        info!(task_id, filename, "persisted JSON artifact");
        Ok(())
    }

    /// Tolerates a missing or corrupt file by returning `None`; never raises.
    pub fn load_json<T: DeserializeOwned>(&self, task_id: &str, filename: &str) -> Option<T> {
        let path = self.task_dir_existing(task_id).join(filename);
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(task_id, filename, error = %e, "failed to parse persisted JSON");
                    None
                }
            },
            Err(e) => {
                warn!(task_id, filename, error = %e, "failed to read persisted JSON");
                None
            }
        }
    }

    pub fn has_file(&self, task_id: &str, filename: &str) -> bool {
        self.task_dir_existing(task_id).join(filename).exists()
    }

    pub fn delete_file(&self, task_id: &str, filename: &str) {
        let path = self.task_dir_existing(task_id).join(filename);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(task_id, filename, error = %e, "failed to delete artifact");
            } else {
                info!(task_id, filename, "deleted artifact");
            }
        }
    }

    // -- meta ----------------------------------------------------------------

    pub fn save_meta(
        &self,
        task_id: &str,
        filename: &str,
        file_hash: &str,
        audio_suffix: &str,
        media_type: &str,
        video_suffix: Option<&str>,
    ) -> Result<(), StorageError> {
        let meta = TaskMeta {
            filename: filename.to_string(),
            hash: file_hash.to_string(),
            audio_suffix: audio_suffix.to_string(),
            media_type: media_type.to_string(),
            created_at: Utc::now().to_rfc3339(),
            video_suffix: video_suffix.map(|s| s.to_string()),
        };
        self.save_json(task_id, "meta.json", &meta)
    }

    pub fn load_meta(&self, task_id: &str) -> Option<TaskMeta> {
        self.load_json(task_id, "meta.json")
    }

    // -- audio / video --------------------------------------------------------

    pub fn save_audio(&self, task_id: &str, bytes: &[u8], suffix: &str) -> Result<PathBuf, StorageError> {
        let dir = self
            .task_dir(task_id)
            .map_err(|e| StorageError::DirCreateFailed { path: task_id.to_string(), source: e })?;
        let dest = dir.join(format!("audio{}", suffix));
        std::fs::write(&dest, bytes).map_err(|e| StorageError::WriteFailed {
            path: dest.display().to_string(),
            source: e,
        })?;
        info!(task_id, bytes = bytes.len(), "saved audio");
        Ok(dest)
    }

    pub fn find_audio(&self, task_id: &str) -> Option<PathBuf> {
        let dir = self.task_dir_existing(task_id);
        if !dir.exists() {
            return None;
        }
        glob_first(&dir, "audio.")
    }

    pub fn save_video(&self, task_id: &str, bytes: &[u8], suffix: &str) -> Result<PathBuf, StorageError> {
        let dir = self
            .task_dir(task_id)
            .map_err(|e| StorageError::DirCreateFailed { path: task_id.to_string(), source: e })?;
        let dest = dir.join(format!("video{}", suffix));
        std::fs::write(&dest, bytes).map_err(|e| StorageError::WriteFailed {
            path: dest.display().to_string(),
            source: e,
        })?;
        info!(task_id, bytes = bytes.len(), "saved video");
        Ok(dest)
    }

    pub fn find_video(&self, task_id: &str) -> Option<PathBuf> {
        let dir = self.task_dir_existing(task_id);
        if !dir.exists() {
            return None;
        }
        glob_first(&dir, "video.")
    }

    /// The 16 kHz mono WAV extracted from an uploaded video by the
    /// video-prep stage, if one was produced.
    pub fn find_extracted_wav(&self, task_id: &str) -> Option<PathBuf> {
        let dir = self.task_dir_existing(task_id);
        if !dir.exists() {
            return None;
        }
        glob_suffix(&dir, ".extracted.wav")
    }

    pub fn frames_dir(&self, task_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.task_dir(task_id)?.join("frames");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    // -- hash index ------------------------------------------------------------

    fn hash_index_path(&self) -> PathBuf {
        self.uploads_dir.join("hash_index.json")
    }

    pub fn load_hash_index(&self) -> std::collections::HashMap<String, String> {
        let path = self.hash_index_path();
        if !path.exists() {
            return Default::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "failed to load hash index");
                Default::default()
            }
        }
    }

    pub fn save_hash_index(
        &self,
        index: &std::collections::HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(index).unwrap_or_else(|_| "{}".to_string());
        atomic_write(&self.hash_index_path(), content.as_bytes())
    }

    // -- scan ------------------------------------------------------------------

    pub fn scan_completed_tasks(&self) -> Vec<ScannedTask> {
        let mut results = Vec::new();
        let entries = match std::fs::read_dir(&self.uploads_dir) {
            Ok(e) => e,
            Err(_) => return results,
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let task_id = match dir.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let meta: TaskMeta = match self.load_json(&task_id, "meta.json") {
                Some(m) => m,
                None => continue,
            };
            let audio_path = self.find_audio(&task_id);
            let video_path = self.find_video(&task_id);
            let frames_dir = dir.join("frames");
            let keyframe_count = if frames_dir.is_dir() {
                std::fs::read_dir(&frames_dir).map(|it| it.count()).unwrap_or(0)
            } else {
                0
            };
            results.push(ScannedTask {
                has_transcript: self.has_file(&task_id, "transcript.json"),
                has_evaluation: self.has_file(&task_id, "evaluation.json"),
                has_compliance: self.has_file(&task_id, "compliance.json"),
                has_video: video_path.is_some(),
                has_ocr_results: self.has_file(&task_id, "ocr_results.json"),
                has_visual_events: self.has_file(&task_id, "visual_events.json"),
                keyframe_count,
                audio_path,
                task_id,
                meta,
            });
        }
        info!(count = results.len(), "scanned persisted tasks from disk");
        results
    }
}

fn glob_first(dir: &Path, prefix: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let path = entry.path();
        let name = path.file_name()?.to_str()?;
        if name.starts_with(prefix) {
            Some(path)
        } else {
            None
        }
    })
}

fn glob_suffix(dir: &Path, suffix: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let path = entry.path();
        let name = path.file_name()?.to_str()?;
        if name.ends_with(suffix) {
            Some(path)
        } else {
            None
        }
    })
}

/// Write via temp-file-then-rename so readers never observe a partial file.
fn atomic_write(dest: &Path, content: &[u8]) -> Result<(), StorageError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let write_result = std::fs::write(&tmp_path, content);
    match write_result {
        Ok(()) => std::fs::rename(&tmp_path, dest).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            StorageError::WriteFailed {
                path: dest.display().to_string(),
                source: e,
            }
        }),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(StorageError::WriteFailed {
                path: dest.display().to_string(),
                source: e,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PersistenceService::new(dir.path()).unwrap();
        let report = serde_json::json!({"a": 1});
        svc.save_json("task1", "x.json", &report).unwrap();
        let loaded: serde_json::Value = svc.load_json("task1", "x.json").unwrap();
        assert_eq!(loaded, report);
    }

    #[test]
    fn load_json_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PersistenceService::new(dir.path()).unwrap();
        let loaded: Option<serde_json::Value> = svc.load_json("nope", "x.json");
        assert!(loaded.is_none());
    }

    #[test]
    fn load_json_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PersistenceService::new(dir.path()).unwrap();
        let task_dir = svc.task_dir("task1").unwrap();
        std::fs::write(task_dir.join("x.json"), b"{not json").unwrap();
        let loaded: Option<serde_json::Value> = svc.load_json("task1", "x.json");
        assert!(loaded.is_none());
    }

    #[test]
    fn hash_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PersistenceService::new(dir.path()).unwrap();
        let mut idx = std::collections::HashMap::new();
        idx.insert("deadbeef".to_string(), "task1".to_string());
        svc.save_hash_index(&idx).unwrap();
        let loaded = svc.load_hash_index();
        assert_eq!(loaded.get("deadbeef"), Some(&"task1".to_string()));
    }

    #[test]
    fn scan_completed_tasks_finds_meta() {
        let dir = tempfile::tempdir().unwrap();
        let svc = PersistenceService::new(dir.path()).unwrap();
        svc.save_meta("task1", "a.wav", "hash1", ".wav", "audio", None).unwrap();
        svc.save_audio("task1", b"fake audio", ".wav").unwrap();
        let scanned = svc.scan_completed_tasks();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].task_id, "task1");
        assert!(scanned[0].audio_path.is_some());
    }
}
