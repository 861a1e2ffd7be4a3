//! Transcript quality evaluation: short transcripts are scored directly,
//! long ones are map/reduced — each chunk summarized independently, then
//! the summaries merged into one final scorecard. Grounded on
//! `evaluator.py`.

use crate::config::EvaluatorConfig;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::types::{EvaluationAnalysis, EvaluationMeta, EvaluationResult, EvaluationScores};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

const EVALUATION_SYSTEM_PROMPT: &str = "\
你是一名保险产品讲解质量评估专家。请根据以下转写文本，从逻辑性、信息密度、表达能力三个维度\
对讲解质量进行评分（每项0到100分），并给出总分（三项的平均值）。同时提取讲解的标题、类别、\
关键词，概括主要论点、关键数据，并判断整体语气倾向。仅输出JSON，不要输出解释性文字。\
\n\n输出格式：{\"meta\": {\"title\": \"...\", \"category\": \"...\", \"keywords\": [\"...\"]}, \
\"scores\": {\"logic\": 0, \"info_density\": 0, \"expression\": 0, \"total\": 0}, \
\"analysis\": {\"main_points\": [\"...\"], \"key_data\": [\"...\"], \"sentiment\": \"...\"}, \
\"summary\": \"...\"}";

const MAP_SYSTEM_PROMPT: &str = "\
你是一名保险产品讲解质量评估专家。给定讲解文本的一个片段，请提炼出该片段的要点，包括主要\
论点、提到的关键数据，以及语气倾向。仅输出JSON，不要输出解释性文字。\
\n\n输出格式：{\"main_points\": [\"...\"], \"key_data\": [\"...\"], \"sentiment\": \"...\"}";

static THINK_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

fn strip_think_tags(text: &str) -> String {
    THINK_TAG_RE.replace_all(text, "").trim().to_string()
}

fn extract_json(text: &str) -> Option<Value> {
    let cleaned = strip_think_tags(text);
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

#[derive(Debug, Default, serde::Deserialize)]
struct ChunkSummary {
    #[serde(default)]
    main_points: Vec<String>,
    #[serde(default)]
    key_data: Vec<String>,
    #[serde(default)]
    sentiment: String,
}

pub struct Evaluator<'a> {
    llm: &'a LlmClient,
    config: &'a EvaluatorConfig,
}

impl<'a> Evaluator<'a> {
    pub fn new(llm: &'a LlmClient, config: &'a EvaluatorConfig) -> Self {
        Self { llm, config }
    }

    pub async fn evaluate(&self, transcript_text: &str) -> anyhow::Result<EvaluationResult> {
        let truncated: String = transcript_text.chars().take(self.config.max_text_chars).collect();
        if truncated.chars().count() <= self.config.chunk_size {
            self.evaluate_direct(&truncated).await
        } else {
            self.evaluate_map_reduce(&truncated).await
        }
    }

    async fn evaluate_direct(&self, text: &str) -> anyhow::Result<EvaluationResult> {
        let response = self.call_evaluation_llm(text, 1).await?;
        if let Some(result) = parse_evaluation(&response) {
            return Ok(result);
        }
        warn!("evaluation response unparseable, retrying with stricter reminder");
        let response = self.call_evaluation_llm(text, 2).await?;
        parse_evaluation(&response).ok_or_else(|| anyhow::anyhow!("evaluation LLM returned unparseable JSON"))
    }

    async fn evaluate_map_reduce(&self, text: &str) -> anyhow::Result<EvaluationResult> {
        let chunks = crate::text::chunk_text(text, self.config.chunk_size);
        let mut summaries = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            summaries.push(self.map_chunk(chunk).await);
        }
        self.reduce(&summaries).await
    }

    /// Summarize one chunk; on any failure, degrade to a truncated-text
    /// fallback rather than losing the chunk's contribution entirely.
    async fn map_chunk(&self, chunk: &str) -> ChunkSummary {
        let messages = vec![
            ChatMessage::system(MAP_SYSTEM_PROMPT),
            ChatMessage::user(chunk.to_string()),
        ];
        let options = ChatOptions {
            temperature: Some(0.0),
            json_format: true,
            num_ctx: Some(self.config.num_ctx),
            ..Default::default()
        };
        match self.llm.chat(&messages, &options).await {
            Ok(response) => extract_json(&response)
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_else(|| fallback_summary(chunk)),
            Err(e) => {
                warn!(error = %e, "map-chunk evaluation call failed, using fallback summary");
                fallback_summary(chunk)
            }
        }
    }

    async fn reduce(&self, summaries: &[ChunkSummary]) -> anyhow::Result<EvaluationResult> {
        let merged = summaries
            .iter()
            .map(|s| {
                format!(
                    "要点: {}\n数据: {}\n语气: {}",
                    s.main_points.join("; "),
                    s.key_data.join("; "),
                    s.sentiment
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n");
        let response = self.call_evaluation_llm(&merged, 1).await?;
        if let Some(result) = parse_evaluation(&response) {
            return Ok(result);
        }
        warn!("reduce response unparseable, retrying with stricter reminder");
        let response = self.call_evaluation_llm(&merged, 2).await?;
        parse_evaluation(&response).ok_or_else(|| anyhow::anyhow!("reduce LLM returned unparseable JSON"))
    }

    async fn call_evaluation_llm(&self, text: &str, attempt: u32) -> anyhow::Result<String> {
        let user_prompt = if attempt > 1 {
            format!("{text}\n\n请严格按照指定的JSON格式输出，不要包含任何其他文字。")
        } else {
            text.to_string()
        };
        let messages = vec![
            ChatMessage::system(EVALUATION_SYSTEM_PROMPT),
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
}

fn fallback_summary(chunk: &str) -> ChunkSummary {
    let snippet: String = chunk.chars().take(500).collect();
    ChunkSummary {
        main_points: vec![snippet],
        key_data: Vec::new(),
        sentiment: "中性".to_string(),
    }
}

fn parse_evaluation(response: &str) -> Option<EvaluationResult> {
    let value = extract_json(response)?;
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_evaluation_reads_well_formed_response() {
        let response = r#"{"meta": {"title": "t", "category": "c", "keywords": ["k"]},
            "scores": {"logic": 80, "info_density": 70, "expression": 90, "total": 80},
            "analysis": {"main_points": ["p"], "key_data": ["d"], "sentiment": "正面"},
            "summary": "总结"}"#;
        let result = parse_evaluation(response).unwrap();
        assert_eq!(result.meta.title, "t");
        assert_eq!(result.scores.total, 80.0);
    }

    #[test]
    fn parse_evaluation_strips_think_tags() {
        let response = "<think>内部推理</think>{\"meta\":{\"title\":\"t\",\"category\":\"c\",\"keywords\":[]},\"scores\":{\"logic\":1,\"info_density\":1,\"expression\":1,\"total\":1},\"analysis\":{\"main_points\":[],\"key_data\":[],\"sentiment\":\"x\"},\"summary\":\"s\"}";
        let result = parse_evaluation(response);
        assert!(result.is_some());
    }

    #[test]
    fn parse_evaluation_returns_none_on_garbage() {
        assert!(parse_evaluation("not json").is_none());
    }

    #[test]
    fn fallback_summary_truncates_to_500_chars() {
        let long_text = "字".repeat(1000);
        let summary = fallback_summary(&long_text);
        assert_eq!(summary.main_points[0].chars().count(), 500);
    }

    #[allow(dead_code)]
    fn assert_types_exist(_: EvaluationMeta, _: EvaluationScores, _: EvaluationAnalysis) {}
}
