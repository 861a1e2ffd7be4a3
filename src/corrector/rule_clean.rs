//! Phase 1: deterministic rule-based cleanup - repeated-English-filler-prefix
//! stripping, fragment-stutter collapsing (including single-character runs),
//! and Chinese digit-year normalization. Grounded on `text_corrector.py`'s
//! rule-clean phase.
//!
//! The `regex` crate does not support backreferences, so fragment
//! collapsing (`那个那个` -> `那个`) is hand-rolled rather than expressed as
//! a single `(.{2,6})\1+` pattern.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// English filler words whose immediate repetition at the start of an
/// entry is ASR stutter noise, not content - e.g. "the the new policy"
/// -> "new policy".
static ENGLISH_FILLERS: &[&str] = &["the", "yeah", "um", "uh", "ah", "er", "hmm", "mm", "like", "so"];

/// Single Chinese filler characters whose 2+ repeat runs collapse to one
/// occurrence (documented spec example: `嗯嗯嗯` -> `嗯`). Kept separate
/// from the general fragment collapse below so ordinary reduplicated
/// Chinese words (e.g. `高高兴兴`) aren't mistaken for stutter.
static SINGLE_CHAR_FILLERS: &[char] = &['嗯', '啊', '呃', '哦', '唉', '呀', '噢', '喔', '哈', '诶'];

static SINGLE_CHAR_FILLER_SET: Lazy<HashSet<char>> = Lazy::new(|| SINGLE_CHAR_FILLERS.iter().copied().collect());

pub fn clean(text: &str) -> String {
    let text = strip_filler_prefix(text);
    let text = collapse_repeated_fragments(&text);
    crate::text::normalize_cn_digits(&text)
}

/// Strip a leading run of 2+ repeats of the same English filler word,
/// matched case-insensitively on whole words, e.g. "the the X" -> "X".
fn strip_filler_prefix(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut idx = 0;
    loop {
        if idx >= words.len() {
            break;
        }
        let word = words[idx].to_lowercase();
        if !ENGLISH_FILLERS.contains(&word.as_str()) {
            break;
        }
        let mut run_end = idx + 1;
        while run_end < words.len() && words[run_end].to_lowercase() == word {
            run_end += 1;
        }
        if run_end - idx >= 2 {
            idx = run_end;
        } else {
            break;
        }
    }
    if idx == 0 {
        text.to_string()
    } else {
        words[idx..].join(" ")
    }
}

/// Collapse immediately-repeated fragments of 1-6 chars down to a single
/// occurrence. A 1-char unit only collapses when it's a known filler
/// character (`嗯嗯嗯` -> `嗯`); units of 2-6 chars collapse regardless of
/// content (`那个那个` -> `那个`, `这个这个产品` -> `这个产品`).
fn collapse_repeated_fragments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        let remaining = chars.len() - i;
        let max_unit = remaining / 2;
        let mut collapsed = false;
        for unit_len in 1..=max_unit.min(6) {
            if unit_len == 1 && !SINGLE_CHAR_FILLER_SET.contains(&chars[i]) {
                continue;
            }
            let unit = &chars[i..i + unit_len];
            let mut repeats = 1;
            while i + (repeats + 1) * unit_len <= chars.len() && &chars[i + repeats * unit_len..i + (repeats + 1) * unit_len] == unit {
                repeats += 1;
            }
            if repeats >= 2 {
                out.extend(unit.iter());
                i += repeats * unit_len;
                collapsed = true;
                break;
            }
        }
        if !collapsed {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_stutter_repeats() {
        assert_eq!(clean("这个这个产品挺好"), "这个产品挺好");
    }

    #[test]
    fn normalizes_digits_before_collapsing() {
        assert_eq!(clean("二零二四年"), "2024年");
    }

    #[test]
    fn leaves_non_repeated_text_untouched() {
        assert_eq!(clean("保本理财产品"), "保本理财产品");
    }

    #[test]
    fn collapses_single_char_filler_stutter() {
        assert_eq!(clean("嗯嗯嗯这个产品"), "嗯这个产品");
    }

    #[test]
    fn leaves_legitimate_reduplicated_words_untouched() {
        assert_eq!(clean("高高兴兴看看产品"), "高高兴兴看看产品");
    }

    #[test]
    fn strips_repeated_filler_prefix() {
        assert_eq!(strip_filler_prefix("the the new policy"), "new policy");
        assert_eq!(strip_filler_prefix("yeah yeah yeah that's good"), "that's good");
    }

    #[test]
    fn leaves_non_prefixed_text_untouched() {
        assert_eq!(strip_filler_prefix("the new policy is the best"), "the new policy is the best");
    }
}
