//! Phase 2: hotword replacement from a user-supplied word list. Supports
//! `wrong->right` correction pairs, bare protect-words (left untouched but
//! recorded so later phases don't "correct" them away), and `#` comments.
//! Grounded on `hotword_replacer.py`.

use crate::error::CorrectionError;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone)]
pub struct HotwordReplacer {
    /// Longest-first so multi-char patterns take priority over substrings.
    replacements: Vec<(String, String)>,
    protected: Vec<String>,
}

impl HotwordReplacer {
    pub fn empty() -> Self {
        Self {
            replacements: Vec::new(),
            protected: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, CorrectionError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CorrectionError::HotwordLoadFailed(e.to_string()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut replacements = BTreeMap::new();
        let mut protected = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((wrong, right)) = line.split_once("->") {
                let wrong = wrong.trim();
                let right = right.trim();
                if !wrong.is_empty() && !right.is_empty() {
                    replacements.insert(wrong.to_string(), right.to_string());
                }
            } else {
                protected.push(line.to_string());
            }
        }
        let mut replacements: Vec<(String, String)> = replacements.into_iter().collect();
        replacements.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        Self {
            replacements,
            protected,
        }
    }

    /// Apply every configured `wrong -> right` replacement, longest pattern
    /// first so a longer hotword always wins over a shorter substring.
    pub fn replace(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (wrong, right) in &self.replacements {
            if result.contains(wrong.as_str()) {
                result = result.replace(wrong.as_str(), right);
            }
        }
        result
    }

    pub fn protected_words(&self) -> &[String] {
        &self.protected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_replacement_pairs_and_protected_words() {
        let replacer = HotwordReplacer::parse(
            "# comment\n保本->不保本\n友邦保险\n\n增额->增额终身寿",
        );
        assert_eq!(replacer.replace("这是保本产品"), "这是不保本产品");
        assert_eq!(replacer.protected_words(), &["友邦保险".to_string()]);
    }

    #[test]
    fn longest_pattern_wins_over_substring() {
        let replacer = HotwordReplacer::parse("增额终身寿->ABC\n增额->XYZ");
        assert_eq!(replacer.replace("增额终身寿产品"), "ABC产品");
    }

    #[test]
    fn empty_replacer_is_identity() {
        let replacer = HotwordReplacer::empty();
        assert_eq!(replacer.replace("不变"), "不变");
    }
}
