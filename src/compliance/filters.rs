//! Post-map, pre-reduce filter chain applied to raw LLM-flagged violations:
//! `ConfidenceFilter -> ExactMatchValidator -> DeduplicationFilter ->
//! EvidenceEnricher`. Grounded on `compliance_filters.py::run_filters`. See
//! spec §4.7.4.

use crate::config::ComplianceConfig;
use crate::types::{CheckMode, EvidenceSource, Severity, StructuredRule, Violation, ViolationStatus};
use regex::Regex;

/// Stage 1: drop violations whose confidence doesn't clear the configured
/// threshold — these are treated as LLM noise, not findings.
pub fn confidence_filter(violations: Vec<Violation>, threshold: f64) -> Vec<Violation> {
    violations.into_iter().filter(|v| v.confidence >= threshold).collect()
}

/// A compiled literal-keyword regex plus the pinyin syllable string for each
/// keyword of one exact-mode rule, built once per audit from its
/// `StructuredRule.keywords`.
struct ExactPattern<'a> {
    rule: &'a StructuredRule,
    regex: Option<Regex>,
    /// (keyword, keyword's pinyin syllables, syllable count)
    pinyin: Vec<(String, String, usize)>,
}

fn build_exact_patterns(rules: &[StructuredRule]) -> Vec<ExactPattern<'_>> {
    rules
        .iter()
        .filter(|r| r.check_mode == CheckMode::Exact)
        .map(|rule| {
            let regex = if rule.keywords.is_empty() {
                None
            } else {
                let alternation = rule
                    .keywords
                    .iter()
                    .map(|kw| regex::escape(kw))
                    .collect::<Vec<_>>()
                    .join("|");
                Regex::new(&alternation).ok()
            };
            let pinyin = rule
                .keywords
                .iter()
                .map(|kw| {
                    let syllables = crate::text::pinyin_syllables(kw);
                    (kw.clone(), syllables.join(" "), syllables.len())
                })
                .collect();
            ExactPattern { rule, regex, pinyin }
        })
        .collect()
}

/// Toneless-pinyin sliding-window match: returns the matched keyword if any
/// fixed-length window of `text`'s pinyin syllables equals a keyword's
/// pinyin syllables.
fn pinyin_match(text: &str, patterns: &[(String, String, usize)]) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let text_pinyin = crate::text::pinyin_syllables(text);
    for (keyword, keyword_pinyin, keyword_len) in patterns {
        if *keyword_len == 0 || text_pinyin.len() < *keyword_len {
            continue;
        }
        for window in text_pinyin.windows(*keyword_len) {
            if window.join(" ") == *keyword_pinyin {
                return Some(keyword.clone());
            }
        }
    }
    None
}

/// Stage 2: re-validate every `check_mode=exact` violation against its
/// rule's keyword regex (falling back to the pinyin-homophone match), then
/// scan the full transcript for any exact rule the LLM didn't report at all.
pub fn exact_match_validate(
    violations: Vec<Violation>,
    rules: &[StructuredRule],
    full_text: &str,
) -> Vec<Violation> {
    let patterns = build_exact_patterns(rules);
    if patterns.is_empty() {
        return violations;
    }
    let exact_rule_ids: std::collections::HashSet<i64> =
        patterns.iter().map(|p| p.rule.id).collect();

    let mut validated: Vec<Violation> = Vec::new();
    for v in violations {
        if !exact_rule_ids.contains(&v.rule_id) {
            validated.push(v);
            continue;
        }
        let Some(pattern) = patterns.iter().find(|p| p.rule.id == v.rule_id) else {
            validated.push(v);
            continue;
        };
        let regex_hit = pattern
            .regex
            .as_ref()
            .map(|re| re.is_match(&v.original_text))
            .unwrap_or(false);
        if regex_hit {
            validated.push(v);
        } else if pinyin_match(&v.original_text, &pattern.pinyin).is_some() {
            validated.push(v);
        }
        // else: false positive, dropped.
    }

    let reported: std::collections::HashSet<i64> = validated.iter().map(|v| v.rule_id).collect();
    for pattern in &patterns {
        if reported.contains(&pattern.rule.id) {
            continue;
        }
        if let Some(re) = &pattern.regex {
            if let Some(m) = re.find(full_text) {
                validated.push(Violation {
                    rule_id: pattern.rule.id,
                    rule_content: pattern.rule.content.clone(),
                    reason: format!("精确匹配检测到禁止用语「{}」", m.as_str()),
                    severity: pattern.rule.severity_default,
                    confidence: 1.0,
                    status: ViolationStatus::Pending,
                    timestamp: "00:00".to_string(),
                    timestamp_ms: 0,
                    end_ms: 0,
                    speaker: String::new(),
                    original_text: extract_context(full_text, m.start(), 80),
                    source: EvidenceSource::Transcript,
                    evidence_url: None,
                    evidence_text: None,
                    rule_ref: Some(pattern.rule.description.clone()),
                    reasoning: None,
                });
                continue;
            }
        }
        if let Some(keyword) = pinyin_match(full_text, &pattern.pinyin) {
            validated.push(Violation {
                rule_id: pattern.rule.id,
                rule_content: pattern.rule.content.clone(),
                reason: format!("拼音匹配检测到禁止用语同音字（对应「{keyword}」）"),
                severity: pattern.rule.severity_default,
                confidence: 0.95,
                status: ViolationStatus::Pending,
                timestamp: "00:00".to_string(),
                timestamp_ms: 0,
                end_ms: 0,
                speaker: String::new(),
                original_text: extract_context(full_text, 0, 80),
                source: EvidenceSource::Transcript,
                evidence_url: None,
                evidence_text: None,
                rule_ref: Some(pattern.rule.description.clone()),
                reasoning: None,
            });
        }
    }
    validated
}

fn extract_context(text: &str, byte_pos: usize, radius_chars: usize) -> String {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let center = chars.iter().position(|(i, _)| *i >= byte_pos).unwrap_or(chars.len());
    let start = center.saturating_sub(radius_chars);
    let end = (center + radius_chars).min(chars.len());
    chars[start..end].iter().map(|(_, c)| *c).collect()
}

/// Stage 3: collapse repeated flags of the same rule within `window_ms` of
/// each other (the map/reduce pass commonly re-flags the same violation
/// across overlapping chunks); keeps the highest-confidence instance.
pub fn dedup_filter(violations: Vec<Violation>, window_ms: i64) -> Vec<Violation> {
    if violations.is_empty() {
        return violations;
    }
    let mut sorted = violations;
    sorted.sort_by(|a, b| a.rule_id.cmp(&b.rule_id).then(a.timestamp_ms.cmp(&b.timestamp_ms)));

    let mut result: Vec<Violation> = Vec::new();
    for v in sorted {
        if let Some(prev) = result.last() {
            if prev.rule_id == v.rule_id && (v.timestamp_ms - prev.timestamp_ms).abs() < window_ms {
                if v.confidence > prev.confidence {
                    *result.last_mut().unwrap() = v;
                }
                continue;
            }
        }
        result.push(v);
    }
    result
}

/// Stage 4: for surviving transcript-sourced violations with no evidence
/// yet, attach the nearest OCR record's text and frame filename, within
/// `margin_ms`, tie-breaking on the earlier record.
pub fn evidence_enrich(
    mut violations: Vec<Violation>,
    ocr_events: &[(i64, String, String)],
    margin_ms: i64,
) -> Vec<Violation> {
    if ocr_events.is_empty() {
        return violations;
    }
    for v in violations.iter_mut() {
        if v.evidence_text.is_some() || v.source != EvidenceSource::Transcript {
            continue;
        }
        let mut best: Option<&(i64, String, String)> = None;
        let mut best_diff = margin_ms + 1;
        for ocr in ocr_events {
            let diff = (ocr.0 - v.timestamp_ms).abs();
            if diff < best_diff {
                best_diff = diff;
                best = Some(ocr);
            }
        }
        if let Some((_, text, frame_path)) = best {
            v.evidence_text = Some(text.clone());
            let filename = std::path::Path::new(frame_path)
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or(frame_path)
                .to_string();
            v.evidence_url = Some(filename);
        }
    }
    violations
}

/// Run the full four-stage chain in order, re-sorting by `timestamp_ms`
/// before returning (spec §4.7.4, last line).
pub fn run_chain(
    violations: Vec<Violation>,
    config: &ComplianceConfig,
    rules: &[StructuredRule],
    full_text: &str,
    ocr_events: &[(i64, String, String)],
) -> Vec<Violation> {
    let violations = confidence_filter(violations, config.confidence_threshold);
    let violations = exact_match_validate(violations, rules, full_text);
    let mut violations = dedup_filter(violations, config.dedup_window_ms);
    violations = evidence_enrich(violations, ocr_events, config.evidence_margin_ms);
    violations.sort_by_key(|v| v.timestamp_ms);
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckMode, RuleCategory, ViolationStatus};

    fn violation(rule_id: i64, ts: i64, confidence: f64, original_text: &str) -> Violation {
        Violation {
            rule_id,
            rule_content: "test rule".to_string(),
            reason: "flagged".to_string(),
            severity: Severity::Medium,
            confidence,
            status: ViolationStatus::Pending,
            timestamp: crate::text::format_timestamp(ts),
            timestamp_ms: ts,
            end_ms: ts + 1000,
            speaker: "坐席0".to_string(),
            original_text: original_text.to_string(),
            source: EvidenceSource::Transcript,
            evidence_url: None,
            evidence_text: None,
            rule_ref: None,
            reasoning: None,
        }
    }

    fn exact_rule() -> StructuredRule {
        StructuredRule {
            id: 1,
            content: "不得承诺保本".to_string(),
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Exact,
            evidence_sources: vec![EvidenceSource::Transcript],
            keywords: vec!["保证水平".to_string()],
            description: "禁止承诺保本".to_string(),
            severity_default: Severity::High,
        }
    }

    #[test]
    fn confidence_filter_drops_low_confidence() {
        let violations = vec![violation(1, 0, 0.9, "x"), violation(2, 0, 0.3, "y")];
        let filtered = confidence_filter(violations, 0.7);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].rule_id, 1);
    }

    #[test]
    fn exact_match_keeps_literal_keyword_hit() {
        let violations = vec![violation(1, 1000, 0.9, "我们保证水平很高")];
        let validated = exact_match_validate(violations, &[exact_rule()], "无关全文");
        assert_eq!(validated.len(), 1);
    }

    #[test]
    fn exact_match_drops_false_positive_without_keyword_or_homophone() {
        let violations = vec![violation(1, 1000, 0.9, "完全无关的文本")];
        let validated = exact_match_validate(violations, &[exact_rule()], "无关全文");
        assert!(validated.is_empty());
    }

    #[test]
    fn exact_match_recovers_homophone_via_pinyin() {
        // "保正水平" is a homophone of "保证水平" (different chars, same pinyin).
        let violations: Vec<Violation> = vec![];
        let full_text = "这款产品的保正水平非常稳定";
        let validated = exact_match_validate(violations, &[exact_rule()], full_text);
        assert_eq!(validated.len(), 1);
        assert!((validated[0].confidence - 0.95).abs() < 1e-9);
        assert!(validated[0].reason.contains("拼音匹配"));
    }

    #[test]
    fn exact_match_adds_missing_literal_violation_from_full_text_scan() {
        let violations: Vec<Violation> = vec![];
        let full_text = "我们向客户保证水平收益";
        let validated = exact_match_validate(violations, &[exact_rule()], full_text);
        assert_eq!(validated.len(), 1);
        assert!((validated[0].confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn dedup_filter_collapses_nearby_duplicates_keeping_highest_confidence() {
        let violations = vec![
            violation(1, 1000, 0.6, "a"),
            violation(1, 1500, 0.9, "b"),
            violation(1, 50_000, 0.8, "c"),
        ];
        let deduped = dedup_filter(violations, 30_000);
        assert_eq!(deduped.len(), 2);
        assert!(deduped.iter().any(|v| (v.confidence - 0.9).abs() < 1e-9));
    }

    #[test]
    fn evidence_enrich_attaches_nearest_ocr_text_and_frame_basename() {
        let violations = vec![violation(1, 10_000, 0.9, "x")];
        let ocr_events = vec![(15_000, "条款文字".to_string(), "/tmp/task1/frames/3.jpg".to_string())];
        let enriched = evidence_enrich(violations, &ocr_events, 10_000);
        assert_eq!(enriched[0].evidence_text.as_deref(), Some("条款文字"));
        assert_eq!(enriched[0].evidence_url.as_deref(), Some("3.jpg"));
    }

    #[test]
    fn evidence_enrich_skips_violations_outside_margin() {
        let violations = vec![violation(1, 10_000, 0.9, "x")];
        let ocr_events = vec![(30_000, "条款文字".to_string(), "f.jpg".to_string())];
        let enriched = evidence_enrich(violations, &ocr_events, 10_000);
        assert!(enriched[0].evidence_text.is_none());
    }

    #[test]
    fn run_chain_resorts_by_timestamp_after_all_stages() {
        let violations = vec![violation(2, 5000, 0.9, "a"), violation(3, 1000, 0.9, "b")];
        let config = ComplianceConfig::default();
        let result = run_chain(violations, &config, &[], "", &[]);
        assert_eq!(result[0].timestamp_ms, 1000);
        assert_eq!(result[1].timestamp_ms, 5000);
    }
}
