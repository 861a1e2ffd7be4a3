//! Parses an uploaded compliance rule file (CSV or XLSX) into rules plus
//! few-shot examples mined from historical check-result columns. Grounded
//! on `rule_registry.py`'s rule-file loader and spec §4.7.1.
//!
//! Column A holds the rule text, with an optional leading digit run as the
//! rule id (`"4全程双录"` -> id=4, content="全程双录"); columns B-G hold
//! freeform historical check results, mined as few-shot examples. Rows
//! whose column A starts with a header keyword are skipped; a row whose
//! column A starts with `存在的问题` terminates parsing entirely.

use crate::error::ComplianceError;
use crate::types::ComplianceRule;
use calamine::Reader;

const HEADER_KEYWORDS: [&str; 5] = ["必备要素", "检查", "标准", "序号", "注："];
const TERMINATOR_KEYWORD: &str = "存在的问题";

pub struct ParsedRuleFile {
    pub rules: Vec<ComplianceRule>,
    pub few_shot_examples: Vec<String>,
}

pub fn parse_rule_file(filename: &str, bytes: &[u8]) -> Result<ParsedRuleFile, ComplianceError> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        parse_xlsx(bytes)
    } else {
        parse_csv(bytes)
    }
}

fn decode_bytes(bytes: &[u8]) -> Result<String, ComplianceError> {
    if let Some(stripped) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(text) = std::str::from_utf8(stripped) {
            return Ok(text.to_string());
        }
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Ok(text.to_string());
    }
    for encoding in [encoding_rs::GBK, encoding_rs::GB18030] {
        let (text, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return Ok(text.into_owned());
        }
    }
    Err(ComplianceError::UndecodableRuleFile)
}

/// Splits a rule-text cell into `(id, content)`. A leading run of ASCII
/// digits becomes the id; everything after it (trimmed) is the content. If
/// no leading digit run is found, `row_index` (1-based) is used as the id
/// and the whole cell is the content.
fn split_leading_id(cell: &str, row_index: i64) -> (i64, String) {
    let trimmed = cell.trim();
    let digit_len = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digit_len > 0 {
        if let Ok(id) = trimmed[..digit_len].parse::<i64>() {
            let content = trimmed[digit_len..].trim().to_string();
            if !content.is_empty() {
                return (id, content);
            }
        }
    }
    (row_index, trimmed.to_string())
}

fn is_header_row(col_a: &str) -> bool {
    HEADER_KEYWORDS.iter().any(|kw| col_a.starts_with(kw))
}

fn is_terminator_row(col_a: &str) -> bool {
    col_a.starts_with(TERMINATOR_KEYWORD)
}

/// Formats a historical-result cell as a few-shot example line, or `None`
/// if the cell is empty/boilerplate.
fn few_shot_line(rule_id: i64, rule_content: &str, cell: &str) -> Option<String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    Some(format!("规则{rule_id}({rule_content}): {cell}"))
}

fn parse_csv(bytes: &[u8]) -> Result<ParsedRuleFile, ComplianceError> {
    let text = decode_bytes(bytes)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rules = Vec::new();
    let mut few_shot_examples = Vec::new();
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ComplianceError::RuleParseFailed(e.to_string()))?;
        if record.is_empty() {
            continue;
        }
        let col_a = record.get(0).unwrap_or("").trim();
        if col_a.is_empty() {
            continue;
        }
        if is_terminator_row(col_a) {
            break;
        }
        if is_header_row(col_a) {
            continue;
        }
        let (id, content) = split_leading_id(col_a, row_idx as i64 + 1);
        if content.is_empty() {
            continue;
        }
        for cell in record.iter().skip(1).take(6) {
            if let Some(line) = few_shot_line(id, &content, cell) {
                few_shot_examples.push(line);
            }
        }
        rules.push(ComplianceRule { id, content });
    }
    Ok(ParsedRuleFile { rules, few_shot_examples })
}

fn parse_xlsx(bytes: &[u8]) -> Result<ParsedRuleFile, ComplianceError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut workbook: calamine::Xlsx<_> = calamine::Xlsx::new(cursor)
        .map_err(|e| ComplianceError::XlsxUnavailable(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ComplianceError::RuleParseFailed("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ComplianceError::RuleParseFailed(e.to_string()))?;

    let mut rules = Vec::new();
    let mut few_shot_examples = Vec::new();
    for (row_idx, row) in range.rows().enumerate() {
        if row_idx == 0 {
            continue; // header
        }
        if row.is_empty() {
            continue;
        }
        let col_a = row.first().map(|c| c.to_string()).unwrap_or_default();
        let col_a = col_a.trim();
        if col_a.is_empty() {
            continue;
        }
        if is_terminator_row(col_a) {
            break;
        }
        if is_header_row(col_a) {
            continue;
        }
        let (id, content) = split_leading_id(col_a, row_idx as i64);
        if content.is_empty() {
            continue;
        }
        for cell in row.iter().skip(1).take(6) {
            let text = cell.to_string();
            if let Some(line) = few_shot_line(id, &content, &text) {
                few_shot_examples.push(line);
            }
        }
        rules.push(ComplianceRule { id, content });
    }
    Ok(ParsedRuleFile { rules, few_shot_examples })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_splits_leading_digit_id_from_content() {
        let csv = "id,result\n4全程双录,已核实\n7不得承诺保本,存在违规\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.rules.len(), 2);
        assert_eq!(parsed.rules[0].id, 4);
        assert_eq!(parsed.rules[0].content, "全程双录");
        assert_eq!(parsed.rules[1].id, 7);
        assert_eq!(parsed.rules[1].content, "不得承诺保本");
    }

    #[test]
    fn parse_csv_strips_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice("id,result\n1测试规则,ok\n".as_bytes());
        let parsed = parse_rule_file("rules.csv", &bytes).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].content, "测试规则");
    }

    #[test]
    fn parse_csv_auto_assigns_row_index_when_no_leading_digit() {
        let csv = "id,result\n不得承诺保本,ok\n须提示犹豫期,ok\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.rules[0].id, 1);
        assert_eq!(parsed.rules[1].id, 2);
    }

    #[test]
    fn parse_csv_skips_header_keyword_rows() {
        let csv = "a,b\n必备要素说明,skip\n序号备注,skip\n4全程双录,ok\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].id, 4);
    }

    #[test]
    fn parse_csv_stops_at_terminator_row() {
        let csv = "a,b\n4全程双录,ok\n存在的问题汇总,x\n7不得承诺保本,ok\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].id, 4);
    }

    #[test]
    fn parse_csv_mines_few_shot_examples_from_historical_columns() {
        let csv = "a,b,c\n4全程双录,已核实双录,无问题\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.few_shot_examples.len(), 2);
        assert!(parsed.few_shot_examples[0].starts_with("规则4(全程双录): 已核实双录"));
    }

    #[test]
    fn parse_csv_skips_empty_historical_cells() {
        let csv = "a,b,c\n4全程双录,,无问题\n";
        let parsed = parse_rule_file("rules.csv", csv.as_bytes()).unwrap();
        assert_eq!(parsed.few_shot_examples.len(), 1);
    }
}
