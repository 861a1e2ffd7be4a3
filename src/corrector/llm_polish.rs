//! Phase 4: LLM-based polish, batched by entry count and character budget.
//! Tolerates three JSON response shapes and falls back to a regex-based
//! extraction when the model doesn't return clean JSON. Grounded on
//! `text_corrector.py`'s batch-polish phase and `evaluator.py`'s
//! `_extract_json` helper (the same tolerant-parsing idiom reused here).

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

#[async_trait]
pub trait CorrectionCollaborator: Send + Sync {
    /// Given an array of `(id, text)` pairs, return a map of id -> corrected
    /// text. Entries the model skips keep their original text.
    async fn correct_batch(&self, entries: &[(usize, String)]) -> anyhow::Result<HashMap<usize, String>>;
}

static THINK_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());
static JSON_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap());

fn strip_think_tags(text: &str) -> String {
    THINK_TAG_RE.replace_all(text, "").trim().to_string()
}

fn extract_json_object(text: &str) -> Option<Value> {
    let cleaned = strip_think_tags(text);
    if let Some(caps) = JSON_FENCE_RE.captures(&cleaned) {
        if let Ok(v) = serde_json::from_str(caps[1].trim()) {
            return Some(v);
        }
    }
    if let Ok(v) = serde_json::from_str(&cleaned) {
        return Some(v);
    }
    let start = cleaned.find(['{', '['])?;
    let end = cleaned.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&cleaned[start..=end]).ok()
}

/// Parse a model response tolerating: a JSON object keyed by string id, a
/// JSON array of `{"id": ..., "text": ...}` objects, or a bare array of
/// strings aligned positionally with `ids`.
fn parse_corrections(text: &str, ids: &[usize]) -> HashMap<usize, String> {
    let mut out = HashMap::new();
    let Some(value) = extract_json_object(text) else {
        return out;
    };
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if let (Ok(id), Some(text)) = (key.parse::<usize>(), val.as_str()) {
                    out.insert(id, text.to_string());
                }
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                match item {
                    Value::Object(obj) => {
                        let id = obj
                            .get("id")
                            .and_then(|v| v.as_u64())
                            .map(|v| v as usize)
                            .or_else(|| ids.get(idx).copied());
                        let text = obj.get("text").and_then(|v| v.as_str());
                        if let (Some(id), Some(text)) = (id, text) {
                            out.insert(id, text.to_string());
                        }
                    }
                    Value::String(s) => {
                        if let Some(&id) = ids.get(idx) {
                            out.insert(id, s.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

fn build_batches(
    entries: &[(usize, String)],
    max_entries: usize,
    max_chars: usize,
) -> Vec<Vec<(usize, String)>> {
    let mut batches = Vec::new();
    let mut current: Vec<(usize, String)> = Vec::new();
    let mut current_chars = 0usize;
    for entry in entries {
        let entry_chars = entry.1.chars().count();
        let would_overflow = !current.is_empty()
            && (current.len() >= max_entries || current_chars + entry_chars > max_chars);
        if would_overflow {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += entry_chars;
        current.push(entry.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Run phase-4 LLM polish over `entries` (id, text pairs), respecting batch
/// limits and skipping entries whose confidence already clears
/// `confidence_skip_threshold` (the caller filters those out beforehand).
/// Entries the model doesn't return a correction for keep their original
/// text, so a malformed response degrades gracefully rather than dropping
/// content.
pub async fn polish_batches(
    collaborator: &dyn CorrectionCollaborator,
    entries: Vec<(usize, String)>,
    max_entries: usize,
    max_chars: usize,
) -> HashMap<usize, String> {
    polish_batches_with_progress(collaborator, entries, max_entries, max_chars, None).await
}

/// Same as [`polish_batches`], additionally reporting `(completed, total)`
/// batch counts through `on_progress` as each batch finishes — used by the
/// text-correction stage to surface per-batch task progress.
pub async fn polish_batches_with_progress(
    collaborator: &dyn CorrectionCollaborator,
    entries: Vec<(usize, String)>,
    max_entries: usize,
    max_chars: usize,
    on_progress: Option<&(dyn Fn(usize, usize) + Send + Sync)>,
) -> HashMap<usize, String> {
    let mut result = HashMap::new();
    let batches = build_batches(&entries, max_entries, max_chars);
    let total = batches.len();
    for (done, batch) in batches.into_iter().enumerate() {
        match collaborator.correct_batch(&batch).await {
            Ok(corrections) => result.extend(corrections),
            Err(e) => {
                tracing::warn!(error = %e, batch_size = batch.len(), "LLM polish batch failed, keeping original text");
            }
        }
        if let Some(cb) = on_progress {
            cb(done + 1, total);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_strips_think_tags_and_fences() {
        let text = "<think>reasoning</think>```json\n{\"0\": \"fixed\"}\n```";
        let parsed = parse_corrections(text, &[0]);
        assert_eq!(parsed.get(&0), Some(&"fixed".to_string()));
    }

    #[test]
    fn parse_corrections_handles_array_of_objects() {
        let text = r#"[{"id": 3, "text": "a"}, {"id": 5, "text": "b"}]"#;
        let parsed = parse_corrections(text, &[3, 5]);
        assert_eq!(parsed.get(&3), Some(&"a".to_string()));
        assert_eq!(parsed.get(&5), Some(&"b".to_string()));
    }

    #[test]
    fn parse_corrections_handles_bare_string_array_positionally() {
        let text = r#"["fixed1", "fixed2"]"#;
        let parsed = parse_corrections(text, &[10, 20]);
        assert_eq!(parsed.get(&10), Some(&"fixed1".to_string()));
        assert_eq!(parsed.get(&20), Some(&"fixed2".to_string()));
    }

    #[test]
    fn parse_corrections_returns_empty_on_garbage() {
        let parsed = parse_corrections("not json at all", &[1]);
        assert!(parsed.is_empty());
    }

    #[test]
    fn build_batches_respects_entry_count_limit() {
        let entries: Vec<(usize, String)> = (0..10).map(|i| (i, "x".to_string())).collect();
        let batches = build_batches(&entries, 3, 10_000);
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() <= 3));
    }

    #[test]
    fn build_batches_respects_char_budget() {
        let entries = vec![
            (0, "a".repeat(50)),
            (1, "b".repeat(50)),
            (2, "c".repeat(50)),
        ];
        let batches = build_batches(&entries, 100, 80);
        assert_eq!(batches.len(), 3);
    }

    struct FailingCollaborator;
    #[async_trait]
    impl CorrectionCollaborator for FailingCollaborator {
        async fn correct_batch(&self, _entries: &[(usize, String)]) -> anyhow::Result<HashMap<usize, String>> {
            anyhow::bail!("llm unreachable")
        }
    }

    #[tokio::test]
    async fn polish_batches_degrades_gracefully_on_failure() {
        let entries = vec![(0, "text".to_string())];
        let result = polish_batches(&FailingCollaborator, entries, 10, 1000).await;
        assert!(result.is_empty());
    }
}
