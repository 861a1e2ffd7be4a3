//! Built-in structural metadata for the 13 standard compliance rules.
//! Uploaded rule files supply only `(id, content)`; this registry attaches
//! category / check-mode / evidence-source / keyword / severity defaults so
//! the audit engine knows how to evaluate each rule. Grounded on
//! `rule_registry.py`.

use crate::types::{CheckMode, EvidenceSource, RuleCategory, Severity, StructuredRule};
use once_cell::sync::Lazy;

struct RuleTemplate {
    keywords: &'static [&'static str],
    category: RuleCategory,
    check_mode: CheckMode,
    evidence_sources: &'static [EvidenceSource],
    description: &'static str,
    severity_default: Severity,
}

static TEMPLATES: Lazy<Vec<RuleTemplate>> = Lazy::new(|| {
    vec![
        RuleTemplate {
            keywords: &["保本", "无风险", "保证收益"],
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Exact,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "禁止承诺保本或无风险收益",
            severity_default: Severity::High,
        },
        RuleTemplate {
            keywords: &["国家", "政府", "监管机构"],
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Exact,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "禁止暗示产品由国家或监管机构担保",
            severity_default: Severity::High,
        },
        RuleTemplate {
            keywords: &["最高", "第一", "唯一"],
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "禁止使用绝对化用语夸大产品优势",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["历史业绩", "过往收益"],
            category: RuleCategory::Behavioral,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "展示历史业绩时须同时说明不代表未来表现",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["犹豫期", "冷静期"],
            category: RuleCategory::Behavioral,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "须明确告知客户犹豫期权利",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["退保", "退保损失"],
            category: RuleCategory::Behavioral,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "须说明提前退保可能产生的损失",
            severity_default: Severity::High,
        },
        RuleTemplate {
            keywords: &["健康告知", "如实告知"],
            category: RuleCategory::Behavioral,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "须提示投保人如实进行健康告知",
            severity_default: Severity::High,
        },
        RuleTemplate {
            keywords: &["免责", "除外责任"],
            category: RuleCategory::Document,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript, EvidenceSource::Ocr],
            description: "须说明保险合同的责任免除条款",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["投保提示书", "产品说明书"],
            category: RuleCategory::Document,
            check_mode: CheckMode::Visual,
            evidence_sources: &[EvidenceSource::Ocr, EvidenceSource::Vision],
            description: "须向客户出示投保提示书或产品说明书",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["销售人员", "执业证"],
            category: RuleCategory::VisualCheck,
            check_mode: CheckMode::Visual,
            evidence_sources: &[EvidenceSource::Vision],
            description: "销售人员须出示展业证件",
            severity_default: Severity::Low,
        },
        RuleTemplate {
            keywords: &["分红", "不确定"],
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "分红型产品须说明分红具有不确定性",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["万能险", "最低保证利率"],
            category: RuleCategory::Document,
            check_mode: CheckMode::Semantic,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "万能险须说明最低保证利率及实际结算利率差异",
            severity_default: Severity::Medium,
        },
        RuleTemplate {
            keywords: &["银行存款", "等同于存款"],
            category: RuleCategory::ForbiddenPhrase,
            check_mode: CheckMode::Exact,
            evidence_sources: &[EvidenceSource::Transcript],
            description: "禁止将保险产品等同或混淆于银行存款",
            severity_default: Severity::High,
        },
    ]
});

/// Enrich a parsed `(id, content)` rule pair with registry metadata by
/// matching its content against each template's keyword set; the
/// highest-scoring template wins, falling back to a generic catch-all
/// template (behavioral / semantic / transcript / low) when nothing
/// matches closely.
pub fn enrich(id: i64, content: &str) -> StructuredRule {
    let mut best: Option<(&RuleTemplate, usize)> = None;
    for template in TEMPLATES.iter() {
        let score = template
            .keywords
            .iter()
            .filter(|kw| content.contains(*kw))
            .count();
        if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
            best = Some((template, score));
        }
    }

    match best {
        Some((template, _)) => StructuredRule {
            id,
            content: content.to_string(),
            category: template.category,
            check_mode: template.check_mode,
            evidence_sources: template.evidence_sources.to_vec(),
            keywords: template.keywords.iter().map(|s| s.to_string()).collect(),
            description: template.description.to_string(),
            severity_default: template.severity_default,
        },
        None => StructuredRule {
            id,
            content: content.to_string(),
            category: RuleCategory::Behavioral,
            check_mode: CheckMode::Semantic,
            evidence_sources: vec![EvidenceSource::Transcript],
            keywords: Vec::new(),
            description: "未匹配内置规则模板，按通用语义规则处理".to_string(),
            severity_default: Severity::Low,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_matches_guaranteed_return_rule() {
        let rule = enrich(1, "不得承诺保本保收益");
        assert_eq!(rule.category, RuleCategory::ForbiddenPhrase);
        assert_eq!(rule.severity_default, Severity::High);
    }

    #[test]
    fn enrich_falls_back_for_unmatched_content() {
        let rule = enrich(99, "与内置规则无关的自定义条款");
        assert_eq!(rule.severity_default, Severity::Low);
        assert!(rule.keywords.is_empty());
    }

    #[test]
    fn registry_has_thirteen_templates() {
        assert_eq!(TEMPLATES.len(), 13);
    }
}
