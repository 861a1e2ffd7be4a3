//! Text utilities shared by the ASR, correction and compliance stages:
//! chunking, sentence splitting, noise-segment filtering, Chinese-digit
//! normalization, speaker smoothing and pinyin conversion. Grounded on the
//! original `utils/text.py` and `asr.py`'s noise-filter tables.

use crate::types::{Segment, TranscriptEntry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Filler / background-noise ASR outputs that carry no content and are
/// dropped before correction ever sees them.
static NOISE_WORDS_CN: &[&str] = &[
    "嗯", "啊", "呃", "哦", "唉", "呀", "噢", "喔", "哈", "诶", "这个", "那个", "就是说",
];
static NOISE_WORDS_EN: &[&str] = &["um", "uh", "ah", "er", "hmm", "mm"];

static NOISE_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    NOISE_WORDS_CN
        .iter()
        .chain(NOISE_WORDS_EN.iter())
        .copied()
        .collect()
});

static CN_DIGITS: Lazy<[(char, char); 10]> = Lazy::new(|| {
    [
        ('零', '0'),
        ('一', '1'),
        ('二', '2'),
        ('三', '3'),
        ('四', '4'),
        ('五', '5'),
        ('六', '6'),
        ('七', '7'),
        ('八', '8'),
        ('九', '9'),
    ]
});

static SENTENCE_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[。！？.!?]+|(?:\r?\n)+)").unwrap());

/// A segment whose stripped text is entirely filler (no other content).
pub fn is_noise_segment(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return true;
    }
    NOISE_SET.contains(trimmed) || NOISE_SET.contains(trimmed.to_lowercase().as_str())
}

/// Render milliseconds as `MM:SS`, per spec's display format.
pub fn format_timestamp(ms: i64) -> String {
    let total_secs = (ms.max(0)) / 1000;
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;
    format!("{minutes:02}:{seconds:02}")
}

/// Replace ASCII-adjacent Chinese numerals with their digit form, leaving
/// compound numeral words (十/百/千/万) untouched — those require a
/// dedicated numeral parser out of scope here.
pub fn normalize_cn_digits(text: &str) -> String {
    let table = *CN_DIGITS;
    text.chars()
        .map(|c| {
            table
                .iter()
                .find(|(cn, _)| *cn == c)
                .map(|(_, ascii)| *ascii)
                .unwrap_or(c)
        })
        .collect()
}

/// Split text into sentences on CJK/ASCII terminal punctuation and newlines.
pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_SPLIT_RE
        .split(text)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Split `text` into chunks of at most `chunk_size` chars, breaking on
/// sentence boundaries where possible so no chunk cuts a sentence in half.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    if text.chars().count() <= chunk_size {
        return vec![text.to_string()];
    }
    let sentences = split_sentences(text);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        if current.chars().count() + sentence.chars().count() > chunk_size && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&sentence);
        while current.chars().count() > chunk_size {
            let cut: String = current.chars().take(chunk_size).collect();
            chunks.push(cut.clone());
            current = current.chars().skip(chunk_size).collect();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Merge adjacent segments of the same speaker separated by a gap no wider
/// than `gap_ms`, concatenating text and preserving sub-sentences.
pub fn pre_merge_segments(segments: Vec<Segment>, gap_ms: i64) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    for seg in segments {
        if let Some(last) = merged.last_mut() {
            if last.speaker == seg.speaker && seg.start_ms - last.end_ms <= gap_ms {
                last.sub_sentences.push(crate::types::SubSentence {
                    text: seg.text.clone(),
                    start_ms: seg.start_ms,
                    end_ms: seg.end_ms,
                });
                last.text.push_str(&seg.text);
                last.end_ms = seg.end_ms;
                last.confidence = last.confidence.min(seg.confidence);
                continue;
            }
        }
        let mut new_seg = seg;
        if new_seg.sub_sentences.is_empty() {
            new_seg.sub_sentences.push(crate::types::SubSentence {
                text: new_seg.text.clone(),
                start_ms: new_seg.start_ms,
                end_ms: new_seg.end_ms,
            });
        }
        merged.push(new_seg);
    }
    merged
}

/// Reassign short, isolated speaker flickers (runs shorter than
/// `max_flicker_ms`) to the speaker on either side when both agree,
/// smoothing out diarization jitter at segment boundaries.
pub fn smooth_speakers(mut segments: Vec<Segment>, max_flicker_ms: i64) -> Vec<Segment> {
    if segments.len() < 3 {
        return segments;
    }
    for i in 1..segments.len() - 1 {
        let dur = segments[i].duration_ms();
        if dur > max_flicker_ms {
            continue;
        }
        let prev_speaker = segments[i - 1].speaker;
        let next_speaker = segments[i + 1].speaker;
        if prev_speaker == next_speaker && segments[i].speaker != prev_speaker {
            segments[i].speaker = prev_speaker;
        }
    }
    segments
}

/// Optional, off-by-default entry-level smoothing pass operating on final
/// display entries rather than raw segments (see DESIGN.md open question).
pub fn merge_transcript_entries(entries: Vec<TranscriptEntry>, gap_ms: i64) -> Vec<TranscriptEntry> {
    let mut merged: Vec<TranscriptEntry> = Vec::new();
    for entry in entries {
        if let Some(last) = merged.last_mut() {
            if last.speaker == entry.speaker && entry.timestamp_ms - last.end_ms <= gap_ms {
                last.text.push_str(&entry.text);
                last.text_corrected.push_str(&entry.text_corrected);
                last.end_ms = entry.end_ms;
                continue;
            }
        }
        merged.push(entry);
    }
    merged
}

/// Toneless pinyin syllables for each Han character in `text`, used by the
/// compliance homophone fallback. Non-Han characters pass through as
/// single-character "syllables".
pub fn pinyin_syllables(text: &str) -> Vec<String> {
    use pinyin::ToPinyin;
    text.chars()
        .map(|c| match c.to_pinyin() {
            Some(p) => p.plain().to_string(),
            None => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubSentence;

    #[test]
    fn noise_segment_detects_filler_only() {
        assert!(is_noise_segment("嗯"));
        assert!(is_noise_segment("  "));
        assert!(!is_noise_segment("嗯这个产品很好"));
    }

    #[test]
    fn format_timestamp_pads_minutes_and_seconds() {
        assert_eq!(format_timestamp(65_000), "01:05");
        assert_eq!(format_timestamp(0), "00:00");
    }

    #[test]
    fn normalize_cn_digits_maps_single_chars() {
        assert_eq!(normalize_cn_digits("二零二四年"), "2024年");
    }

    #[test]
    fn chunk_text_respects_limit() {
        let text = "一二三。四五六。七八九。".repeat(5);
        let chunks = chunk_text(&text, 20);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20 + 1));
    }

    #[test]
    fn pre_merge_segments_joins_same_speaker_within_gap() {
        let segs = vec![
            seg("你好", 0, 500, 0),
            seg("世界", 600, 1000, 0),
            seg("再见", 5000, 5500, 1),
        ];
        let merged = pre_merge_segments(segs, 1000);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "你好世界");
    }

    #[test]
    fn smooth_speakers_fixes_isolated_flicker() {
        let segs = vec![
            seg("a", 0, 2000, 0),
            seg("b", 2000, 2200, 1),
            seg("c", 2200, 4000, 0),
        ];
        let smoothed = smooth_speakers(segs, 1500);
        assert_eq!(smoothed[1].speaker, 0);
    }

    #[test]
    fn pinyin_syllables_converts_han_chars() {
        let syllables = pinyin_syllables("保本");
        assert_eq!(syllables.len(), 2);
    }

    fn seg(text: &str, start_ms: i64, end_ms: i64, speaker: i32) -> Segment {
        Segment {
            text: text.to_string(),
            start_ms,
            end_ms,
            confidence: 0.9,
            speaker,
            sub_sentences: vec![SubSentence {
                text: text.to_string(),
                start_ms,
                end_ms,
            }],
        }
    }
}
