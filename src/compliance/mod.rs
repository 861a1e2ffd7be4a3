//! Map/reduce compliance audit: chunks the transcript, asks the LLM to flag
//! violations per chunk against the enriched rule set, merges and filters
//! the results into a final `ComplianceReport`. Grounded on
//! `compliance.py` / `rule_registry.py` / `compliance_filters.py`.

pub mod filters;
pub mod rule_registry;
pub mod rules_parse;

use crate::config::ComplianceConfig;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::types::{
    ComplianceReport, EvidenceSource, Segment, Severity, StructuredRule, Violation, ViolationStatus,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

const AUDIT_SYSTEM_PROMPT: &str = "\
你是一名保险产品讲解合规审核员。给定一段销售讲解的转写文本和一组合规规则，请找出文本中\
违反规则的片段。只标记有明确证据支持的违规，疑似违规按medium处理，不要臆测更高等级。\
对禁止性用语类规则，只要原文出现对应关键词（即使存在谐音噪音）即应触发。对每条违规给出：\
rule_id（规则编号）、reason（简要说明为何违规）、severity（high/medium/low）、confidence（0到1\
之间的小数）、quote（原文片段）、timestamp（该片段开头的时间戳，格式为文本中出现的[MM:SS]）。\
如果没有发现违规，返回空列表。仅输出JSON数组或JSON对象，不要输出解释性文字。\
\n\n输出格式：{\"violations\": [{\"rule_id\": 1, \"reason\": \"...\", \"severity\": \"high\", \"confidence\": 0.9, \"quote\": \"...\", \"timestamp\": \"00:00\"}]}";

const STRICT_JSON_REMINDER: &str = "请严格只输出JSON，不要包含任何解释性文字或Markdown代码块标记。";

const SUMMARY_SYSTEM_PROMPT: &str = "\
你是一名保险合规审核负责人。给定本次讲解检测到的全部违规条目，请用简练的中文写一段总结，\
概述主要风险点和整体合规情况，不超过200字。仅输出总结文字。";

#[derive(Debug, Deserialize)]
struct RawViolation {
    rule_id: i64,
    reason: String,
    #[serde(default = "default_severity")]
    severity: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    quote: String,
    #[serde(default)]
    timestamp: String,
}

fn default_severity() -> String {
    "low".to_string()
}
fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Default)]
struct RawAuditResponse {
    #[serde(default)]
    violations: Vec<RawViolation>,
}

pub struct ComplianceAuditor<'a> {
    llm: &'a LlmClient,
    config: &'a ComplianceConfig,
}

impl<'a> ComplianceAuditor<'a> {
    pub fn new(llm: &'a LlmClient, config: &'a ComplianceConfig) -> Self {
        Self { llm, config }
    }

    /// Run the full audit: chunk the transcript, map each chunk against the
    /// rule set concurrently-free (sequential; LLM client enforces its own
    /// concurrency bound), merge, filter and score. A chunk whose LLM call
    /// fails twice (original attempt plus one "strict JSON only" retry)
    /// contributes zero violations rather than aborting the whole audit.
    pub async fn audit(
        &self,
        segments: &[Segment],
        rules: &[StructuredRule],
        ocr_events: &[(i64, String, String)],
        few_shot_examples: &[String],
    ) -> anyhow::Result<ComplianceReport> {
        let full_text = render_transcript(segments);
        let truncated: String = full_text.chars().take(self.config.max_text_chars).collect();
        let chunks = crate::text::chunk_text(&truncated, self.config.chunk_size);

        let timestamp_map = build_timestamp_map(segments);
        let chunk_ranges = build_chunk_time_ranges(segments, &chunks);

        let rule_listing = render_rule_listing(rules);
        let few_shot_listing = render_few_shot_examples(few_shot_examples);
        let mut all_violations = Vec::new();

        for (idx, chunk) in chunks.iter().enumerate() {
            let (range_start, range_end) = chunk_ranges
                .get(idx)
                .copied()
                .unwrap_or((0, i64::MAX));
            let ocr_excerpt = ocr_aligned_to_range(ocr_events, range_start, range_end, self.config.ocr_margin_ms);
            let violations = self
                .audit_chunk_with_retry(chunk, &rule_listing, &few_shot_listing, &ocr_excerpt, rules, &timestamp_map)
                .await;
            all_violations.extend(violations);
        }

        let filtered = filters::run_chain(all_violations, self.config, rules, &truncated, ocr_events);

        let summary = self.summarize(&filtered).await.unwrap_or_else(|_| {
            if filtered.is_empty() {
                "未发现合规问题。".to_string()
            } else {
                format!("共发现 {} 项潜在合规问题，详见下方列表。", filtered.len())
            }
        });

        let compliance_score = ComplianceReport::score_from(&filtered);
        let source_counts = ComplianceReport::source_counts_from(&filtered);

        Ok(ComplianceReport {
            total_rules: rules.len(),
            total_segments_checked: segments.len(),
            violations: filtered,
            summary,
            compliance_score,
            source_counts,
        })
    }

    /// Audit one chunk, retrying once with a "strict JSON only" reminder if
    /// the call fails or the response is unparseable. A chunk that fails
    /// both attempts contributes zero violations (spec §4.7.3 step 3).
    async fn audit_chunk_with_retry(
        &self,
        chunk: &str,
        rule_listing: &str,
        few_shot_listing: &str,
        ocr_excerpt: &str,
        rules: &[StructuredRule],
        timestamp_map: &std::collections::HashMap<String, TimestampInfo>,
    ) -> Vec<Violation> {
        match self
            .audit_chunk(chunk, rule_listing, few_shot_listing, ocr_excerpt, false)
            .await
        {
            Ok(response) => return parse_violations(&response, rules, timestamp_map),
            Err(e) => warn!(error = %e, "audit chunk call failed, retrying with strict JSON reminder"),
        }

        match self
            .audit_chunk(chunk, rule_listing, few_shot_listing, ocr_excerpt, true)
            .await
        {
            Ok(response) => parse_violations(&response, rules, timestamp_map),
            Err(e) => {
                warn!(error = %e, "audit chunk retry failed, contributing zero violations");
                Vec::new()
            }
        }
    }

    async fn audit_chunk(
        &self,
        chunk: &str,
        rule_listing: &str,
        few_shot_listing: &str,
        ocr_excerpt: &str,
        strict_reminder: bool,
    ) -> anyhow::Result<String> {
        let mut user_prompt = format!("规则列表：\n{rule_listing}\n\n待审核文本：\n{chunk}");
        if !few_shot_listing.is_empty() {
            user_prompt.push_str("\n\n历史审核参考：\n");
            user_prompt.push_str(few_shot_listing);
        }
        if !ocr_excerpt.is_empty() {
            user_prompt.push_str("\n\n同一时间段内的画面文字识别(OCR)记录：\n");
            user_prompt.push_str(ocr_excerpt);
        }
        if strict_reminder {
            user_prompt.push('\n');
            user_prompt.push_str(STRICT_JSON_REMINDER);
        }
        let messages = vec![
            ChatMessage::system(AUDIT_SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ];
        let options = ChatOptions {
            temperature: Some(0.0),
            json_format: true,
            num_ctx: Some(self.config.num_ctx),
            ..Default::default()
        };
        Ok(self.llm.chat(&messages, &options).await?)
    }

    async fn summarize(&self, violations: &[Violation]) -> anyhow::Result<String> {
        if violations.is_empty() {
            return Ok("未发现合规问题。".to_string());
        }
        let listing = violations
            .iter()
            .map(|v| format!("- 规则{}: {} ({})", v.rule_id, v.reason, v.severity_label()))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(listing),
        ];
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        self.llm.chat(&messages, &options).await
    }
}

impl Violation {
    fn severity_label(&self) -> &'static str {
        match self.severity {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

/// Matches `TranscriptBuildStage`'s speaker-label convention so compliance
/// violations reference the same speaker names a caller sees in the
/// transcript.
fn speaker_label(speaker: i32) -> String {
    if speaker >= 0 {
        format!("Speaker {}", speaker + 1)
    } else {
        "Speaker 1".to_string()
    }
}

fn render_transcript(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| format!("[{}] {}: {}", crate::text::format_timestamp(s.start_ms), speaker_label(s.speaker), s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
struct TimestampInfo {
    start_ms: i64,
    end_ms: i64,
    speaker: String,
}

/// Maps each segment's rendered `[MM:SS]` string back to its precise
/// millisecond timing, so a violation the LLM reports by timestamp string
/// can be resolved to exact ms (spec §4.7.3 step 4). Later segments sharing
/// the same rounded-to-second timestamp overwrite earlier ones, which is
/// fine since `dedup_filter` collapses near-duplicates regardless.
fn build_timestamp_map(segments: &[Segment]) -> std::collections::HashMap<String, TimestampInfo> {
    segments
        .iter()
        .map(|s| {
            (
                crate::text::format_timestamp(s.start_ms),
                TimestampInfo {
                    start_ms: s.start_ms,
                    end_ms: s.end_ms,
                    speaker: speaker_label(s.speaker),
                },
            )
        })
        .collect()
}

fn render_rule_listing(rules: &[StructuredRule]) -> String {
    rules
        .iter()
        .map(|r| format!("{}. {} ({})", r.id, r.content, r.description))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Up to 5 few-shot examples, per spec §4.7.3 step 3.
fn render_few_shot_examples(examples: &[String]) -> String {
    examples.iter().take(5).cloned().collect::<Vec<_>>().join("\n")
}

/// Approximates each text chunk's covered time range by locating the
/// segment(s) whose rendered `[MM:SS]` lines fall inside it. `chunk_text`
/// splits on sentence boundaries, not segments, so this is a best-effort
/// span derived from counting how many of the rendered lines precede each
/// chunk boundary in the concatenated text.
fn build_chunk_time_ranges(segments: &[Segment], chunks: &[String]) -> Vec<(i64, i64)> {
    if segments.is_empty() || chunks.is_empty() {
        return Vec::new();
    }
    let total_chars: usize = chunks.iter().map(|c| c.chars().count()).sum();
    if total_chars == 0 {
        return chunks.iter().map(|_| (0, i64::MAX)).collect();
    }
    let total_span = segments.last().map(|s| s.end_ms).unwrap_or(0) - segments.first().map(|s| s.start_ms).unwrap_or(0);
    let base = segments.first().map(|s| s.start_ms).unwrap_or(0);

    let mut ranges = Vec::with_capacity(chunks.len());
    let mut consumed = 0usize;
    for chunk in chunks {
        let chunk_len = chunk.chars().count();
        let start_frac = consumed as f64 / total_chars as f64;
        let end_frac = (consumed + chunk_len) as f64 / total_chars as f64;
        let start_ms = base + (start_frac * total_span as f64) as i64;
        let end_ms = base + (end_frac * total_span as f64) as i64;
        ranges.push((start_ms, end_ms));
        consumed += chunk_len;
    }
    ranges
}

/// OCR records within `[range_start - margin, range_end + margin]`,
/// deduplicated within the same `(timestamp, text)` pair.
fn ocr_aligned_to_range(
    ocr_events: &[(i64, String, String)],
    range_start: i64,
    range_end: i64,
    margin_ms: i64,
) -> String {
    let lo = range_start.saturating_sub(margin_ms);
    let hi = range_end.saturating_add(margin_ms);
    let mut seen = std::collections::HashSet::new();
    let mut lines = Vec::new();
    for (ts, text, _frame_path) in ocr_events {
        if *ts < lo || *ts > hi {
            continue;
        }
        let key = (*ts, text.clone());
        if !seen.insert(key) {
            continue;
        }
        lines.push(format!("[{}] {}", crate::text::format_timestamp(*ts), text));
    }
    lines.join("\n")
}

fn parse_violations(
    response: &str,
    rules: &[StructuredRule],
    timestamp_map: &std::collections::HashMap<String, TimestampInfo>,
) -> Vec<Violation> {
    let raw_violations = parse_raw_violations(response);

    raw_violations
        .into_iter()
        .filter_map(|raw| {
            let rule = rules.iter().find(|r| r.id == raw.rule_id)?;
            let resolved = timestamp_map.get(raw.timestamp.trim());
            let (timestamp, timestamp_ms, end_ms, speaker) = match resolved {
                Some(info) => (raw.timestamp.clone(), info.start_ms, info.end_ms, info.speaker.clone()),
                None => ("00:00".to_string(), 0, 0, "未知".to_string()),
            };
            Some(Violation {
                rule_id: raw.rule_id,
                rule_content: rule.content.clone(),
                reason: raw.reason,
                severity: Severity::parse_or_low(&raw.severity),
                confidence: raw.confidence.clamp(0.0, 1.0),
                status: ViolationStatus::Pending,
                timestamp,
                timestamp_ms,
                end_ms,
                speaker,
                original_text: raw.quote,
                source: EvidenceSource::Transcript,
                evidence_url: None,
                evidence_text: None,
                rule_ref: Some(rule.description.clone()),
                reasoning: None,
            })
        })
        .collect()
}

fn extract_json(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let start = text.find(['{', '['])?;
    let end = text.rfind(['}', ']'])?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Tolerantly parses an audit response in any of the shapes a model may
/// emit: `{"violations": [...]}`, a bare `[...]` array, or a single
/// violation object with no wrapping array (spec §4.9 open question 3).
fn parse_raw_violations(response: &str) -> Vec<RawViolation> {
    let Some(value) = extract_json(response) else {
        return Vec::new();
    };
    match value {
        Value::Object(ref map) if map.contains_key("violations") => {
            serde_json::from_value::<RawAuditResponse>(value.clone())
                .map(|r| r.violations)
                .unwrap_or_default()
        }
        Value::Array(_) => serde_json::from_value::<Vec<RawViolation>>(value).unwrap_or_default(),
        Value::Object(_) => serde_json::from_value::<RawViolation>(value)
            .map(|v| vec![v])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleCategory;

    fn rule() -> StructuredRule {
        StructuredRule {
            id: 1,
            content: "不得承诺保本".to_string(),
            category: RuleCategory::ForbiddenPhrase,
            check_mode: crate::types::CheckMode::Exact,
            evidence_sources: vec![EvidenceSource::Transcript],
            keywords: vec!["保本".to_string()],
            description: "禁止承诺保本".to_string(),
            severity_default: Severity::High,
        }
    }

    fn empty_timestamp_map() -> std::collections::HashMap<String, TimestampInfo> {
        std::collections::HashMap::new()
    }

    #[test]
    fn parse_violations_reads_well_formed_response() {
        let response = r#"{"violations": [{"rule_id": 1, "reason": "承诺保本", "severity": "high", "confidence": 0.95, "quote": "这个产品绝对保本", "timestamp": "00:05"}]}"#;
        let rules = vec![rule()];
        let violations = parse_violations(response, &rules, &empty_timestamp_map());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::High);
    }

    #[test]
    fn parse_violations_resolves_timestamp_against_map() {
        let response = r#"{"violations": [{"rule_id": 1, "reason": "承诺保本", "severity": "high", "confidence": 0.95, "quote": "这个产品绝对保本", "timestamp": "00:05"}]}"#;
        let rules = vec![rule()];
        let mut map = empty_timestamp_map();
        map.insert(
            "00:05".to_string(),
            TimestampInfo { start_ms: 5000, end_ms: 7000, speaker: "坐席0".to_string() },
        );
        let violations = parse_violations(response, &rules, &map);
        assert_eq!(violations[0].timestamp_ms, 5000);
        assert_eq!(violations[0].speaker, "坐席0");
    }

    #[test]
    fn parse_violations_ignores_unknown_rule_ids() {
        let response = r#"{"violations": [{"rule_id": 99, "reason": "x", "severity": "low", "confidence": 0.5, "quote": "y", "timestamp": "00:00"}]}"#;
        let rules = vec![rule()];
        let violations = parse_violations(response, &rules, &empty_timestamp_map());
        assert!(violations.is_empty());
    }

    #[test]
    fn parse_violations_tolerates_garbage() {
        let violations = parse_violations("not json", &[rule()], &empty_timestamp_map());
        assert!(violations.is_empty());
    }

    #[test]
    fn render_rule_listing_includes_id_and_description() {
        let listing = render_rule_listing(&[rule()]);
        assert!(listing.contains("不得承诺保本"));
        assert!(listing.contains("禁止承诺保本"));
    }

    #[test]
    fn parse_violations_accepts_bare_array_shape() {
        let response = r#"[{"rule_id": 1, "reason": "承诺保本", "severity": "high", "confidence": 0.9, "quote": "q", "timestamp": "00:00"}]"#;
        let violations = parse_violations(response, &[rule()], &empty_timestamp_map());
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn parse_violations_accepts_single_object_shape() {
        let response = r#"{"rule_id": 1, "reason": "承诺保本", "severity": "high", "confidence": 0.9, "quote": "q", "timestamp": "00:00"}"#;
        let violations = parse_violations(response, &[rule()], &empty_timestamp_map());
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn render_few_shot_examples_caps_at_five() {
        let examples: Vec<String> = (0..10).map(|i| format!("example {i}")).collect();
        let rendered = render_few_shot_examples(&examples);
        assert_eq!(rendered.lines().count(), 5);
    }

    #[test]
    fn ocr_aligned_to_range_dedups_same_timestamp_and_text() {
        let events = vec![
            (5_000, "示范条款".to_string(), "f1.jpg".to_string()),
            (5_000, "示范条款".to_string(), "f2.jpg".to_string()),
            (60_000, "不相关".to_string(), "f3.jpg".to_string()),
        ];
        let rendered = ocr_aligned_to_range(&events, 0, 10_000, 2_000);
        assert_eq!(rendered.lines().count(), 1);
    }
}
