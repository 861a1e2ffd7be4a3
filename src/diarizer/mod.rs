//! Speaker diarization: sliding-window voiceprint extraction feeding
//! agglomerative clustering, majority-vote segment labelling, and
//! same-segment multi-speaker turn splitting. Grounded on
//! `asr.py::_diarize_with_campplus` / `_extract_sliding_window_embeddings` /
//! `_split_by_speaker_turns`. See spec §4.4.

pub mod clustering;

use crate::types::Segment;
use async_trait::async_trait;

/// External collaborator producing a fixed-size voiceprint embedding for a
/// span of raw audio samples. The concrete embedder (e.g. CAM++) lives
/// outside this crate's Rust-native scope and is injected at the boundary.
#[async_trait]
pub trait VoiceEmbedder: Send + Sync {
    async fn embed(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy)]
pub struct DiarizerSettings {
    pub sliding_threshold_ms: i64,
    pub window_ms: i64,
    pub step_ms: i64,
    pub min_window_ms: i64,
    pub max_windows: usize,
    pub distance_threshold: f64,
    pub max_flicker_ms: i64,
}

struct Window {
    start_ms: i64,
    end_ms: i64,
    segment_idx: usize,
}

/// Build the sliding windows for one segment, growing `step_ms` rather than
/// truncating the segment's coverage if the naive step would blow past
/// `budget` windows remaining for the whole utterance.
fn windows_for_segment(seg: &Segment, idx: usize, settings: &DiarizerSettings, budget: usize) -> Vec<Window> {
    let duration = seg.duration_ms();
    if duration < settings.sliding_threshold_ms || budget == 0 {
        return vec![Window { start_ms: seg.start_ms, end_ms: seg.end_ms, segment_idx: idx }];
    }

    let naive_count = ((duration - settings.window_ms).max(0) / settings.step_ms.max(1) + 1) as usize;
    let step_ms = if naive_count > budget && budget > 0 {
        // grow the step so the segment fits within its window budget instead
        // of silently dropping its tail.
        let spread = (duration - settings.window_ms).max(0);
        (spread / budget.max(1) as i64).max(settings.step_ms)
    } else {
        settings.step_ms
    };

    let mut windows = Vec::new();
    let mut cursor = seg.start_ms;
    while cursor < seg.end_ms && windows.len() < budget {
        let win_end = (cursor + settings.window_ms).min(seg.end_ms);
        if win_end - cursor >= settings.min_window_ms {
            windows.push(Window { start_ms: cursor, end_ms: win_end, segment_idx: idx });
        }
        cursor += step_ms;
    }
    if windows.is_empty() {
        windows.push(Window { start_ms: seg.start_ms, end_ms: seg.end_ms, segment_idx: idx });
    }
    windows
}

/// Assign a `speaker` label to every segment using sliding-window voiceprint
/// clustering, then split any segment whose windows voted for more than one
/// speaker into consecutive per-speaker turns. Returns the (possibly larger)
/// re-labeled segment list.
pub async fn diarize(
    segments: Vec<Segment>,
    samples: &[f32],
    sample_rate: u32,
    embedder: &dyn VoiceEmbedder,
    settings: DiarizerSettings,
) -> anyhow::Result<Vec<Segment>> {
    if segments.is_empty() {
        return Ok(segments);
    }

    let mut windows: Vec<Window> = Vec::new();
    for (idx, seg) in segments.iter().enumerate() {
        let remaining_budget = settings.max_windows.saturating_sub(windows.len());
        if remaining_budget == 0 {
            windows.push(Window { start_ms: seg.start_ms, end_ms: seg.end_ms, segment_idx: idx });
            continue;
        }
        windows.extend(windows_for_segment(seg, idx, &settings, remaining_budget));
    }

    if windows.is_empty() {
        return Ok(segments);
    }

    let mut embeddings = Vec::with_capacity(windows.len());
    for window in &windows {
        let slice = samples_for_range(samples, sample_rate, window.start_ms, window.end_ms);
        embeddings.push(embedder.embed(&slice, sample_rate).await?);
    }

    let labels = clustering::cluster_embeddings(&embeddings, settings.distance_threshold);

    let mut windows_by_segment: Vec<Vec<(i64, i64, usize)>> = vec![Vec::new(); segments.len()];
    for (window, &label) in windows.iter().zip(labels.iter()) {
        windows_by_segment[window.segment_idx].push((window.start_ms, window.end_ms, label));
    }

    let mut result: Vec<Segment> = Vec::with_capacity(segments.len());
    for (idx, seg) in segments.into_iter().enumerate() {
        let segment_windows = &mut windows_by_segment[idx];
        segment_windows.sort_by_key(|(start, _, _)| *start);

        let distinct_labels: std::collections::HashSet<usize> =
            segment_windows.iter().map(|(_, _, label)| *label).collect();

        if distinct_labels.len() <= 1 {
            let label = segment_windows.first().map(|(_, _, l)| *l).unwrap_or(0);
            let mut seg = seg;
            seg.speaker = label as i32;
            result.push(seg);
        } else {
            result.extend(split_by_speaker_turns(seg, segment_windows));
        }
    }

    Ok(crate::text::smooth_speakers(result, settings.max_flicker_ms))
}

/// Split a segment that straddles a speaker change into consecutive turns,
/// one per contiguous run of same-label windows, with the original text
/// allocated to each turn in proportion to its share of the segment's
/// duration (the final turn absorbs any rounding remainder).
fn split_by_speaker_turns(seg: Segment, windows: &[(i64, i64, usize)]) -> Vec<Segment> {
    let mut turns: Vec<(i64, i64, usize)> = Vec::new();
    for &(start, end, label) in windows {
        match turns.last_mut() {
            Some((_, turn_end, turn_label)) if *turn_label == label => {
                *turn_end = end.max(*turn_end);
            }
            _ => turns.push((start, end, label)),
        }
    }
    // windows overlap (sliding step < window length); snap each turn's start
    // to the previous turn's end so turns tile the segment without gaps.
    for i in 1..turns.len() {
        turns[i].0 = turns[i - 1].1;
    }
    if let Some(first) = turns.first_mut() {
        first.0 = seg.start_ms;
    }
    if let Some(last) = turns.last_mut() {
        last.1 = seg.end_ms;
    }

    let total_chars = seg.text.chars().count().max(1);
    let total_duration = (seg.end_ms - seg.start_ms).max(1);
    let chars: Vec<char> = seg.text.chars().collect();

    let mut out = Vec::with_capacity(turns.len());
    let mut char_cursor = 0usize;
    for (i, &(start, end, label)) in turns.iter().enumerate() {
        let share = (end - start).max(0) as f64 / total_duration as f64;
        let take = if i + 1 == turns.len() {
            total_chars.saturating_sub(char_cursor)
        } else {
            ((total_chars as f64) * share).round() as usize
        };
        let take = take.min(total_chars.saturating_sub(char_cursor));
        let text: String = chars[char_cursor..char_cursor + take].iter().collect();
        char_cursor += take;
        out.push(Segment {
            text,
            start_ms: start,
            end_ms: end,
            confidence: seg.confidence,
            speaker: label as i32,
            sub_sentences: seg
                .sub_sentences
                .iter()
                .filter(|s| s.start_ms >= start && s.start_ms < end)
                .cloned()
                .collect(),
        });
    }
    out
}

fn samples_for_range(samples: &[f32], sample_rate: u32, start_ms: i64, end_ms: i64) -> Vec<f32> {
    let start = ((start_ms as f64 / 1000.0) * sample_rate as f64) as usize;
    let end = ((end_ms as f64 / 1000.0) * sample_rate as f64) as usize;
    let start = start.min(samples.len());
    let end = end.min(samples.len()).max(start);
    samples[start..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubSentence;

    struct FixedEmbedder {
        vectors: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl VoiceEmbedder for FixedEmbedder {
        async fn embed(&self, samples: &[f32], _sample_rate: u32) -> anyhow::Result<Vec<f32>> {
            // Deterministic stand-in: derive a vector from mean amplitude so
            // distinct test fixtures cluster distinctly.
            let mean: f32 = if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f32>() / samples.len() as f32
            };
            let _ = &self.vectors;
            Ok(vec![mean, 1.0 - mean])
        }
    }

    fn seg(text: &str, start_ms: i64, end_ms: i64) -> Segment {
        Segment {
            text: text.to_string(),
            start_ms,
            end_ms,
            confidence: 0.9,
            speaker: -1,
            sub_sentences: vec![SubSentence {
                text: text.to_string(),
                start_ms,
                end_ms,
            }],
        }
    }

    #[tokio::test]
    async fn diarize_assigns_speaker_labels() {
        let segments = vec![seg("a", 0, 1000), seg("b", 1000, 2000)];
        let samples: Vec<f32> = (0..32000).map(|i| if i < 16000 { 0.9 } else { 0.1 }).collect();
        let embedder = FixedEmbedder { vectors: vec![] };
        let settings = DiarizerSettings {
            sliding_threshold_ms: 3000,
            window_ms: 1500,
            step_ms: 750,
            min_window_ms: 200,
            max_windows: 500,
            distance_threshold: 0.5,
            max_flicker_ms: 1500,
        };
        let segments = diarize(segments, &samples, 16000, &embedder, settings)
            .await
            .unwrap();
        assert!(segments[0].speaker >= 0);
        assert!(segments[1].speaker >= 0);
    }

    #[tokio::test]
    async fn diarize_noop_on_empty_segments() {
        let segments: Vec<Segment> = vec![];
        let embedder = FixedEmbedder { vectors: vec![] };
        let settings = DiarizerSettings {
            sliding_threshold_ms: 3000,
            window_ms: 1500,
            step_ms: 750,
            min_window_ms: 200,
            max_windows: 500,
            distance_threshold: 0.5,
            max_flicker_ms: 1500,
        };
        let segments = diarize(segments, &[], 16000, &embedder, settings)
            .await
            .unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn diarize_splits_segment_with_two_speaker_clusters() {
        // One long segment whose first half sounds like one speaker and
        // second half like another — windows should split it into two turns.
        let segments = vec![seg("你好 这是产品介绍 谢谢", 0, 6000)];
        let samples: Vec<f32> = (0..96_000)
            .map(|i| if i < 48_000 { 0.9 } else { 0.05 })
            .collect();
        let embedder = FixedEmbedder { vectors: vec![] };
        let settings = DiarizerSettings {
            sliding_threshold_ms: 3000,
            window_ms: 1500,
            step_ms: 750,
            min_window_ms: 200,
            max_windows: 500,
            distance_threshold: 0.5,
            max_flicker_ms: 0,
        };
        let segments = diarize(segments, &samples, 16000, &embedder, settings)
            .await
            .unwrap();
        assert!(segments.len() >= 2, "expected the segment to split into multiple turns");
        let total_chars: usize = segments.iter().map(|s| s.text.chars().count()).sum();
        assert_eq!(total_chars, "你好 这是产品介绍 谢谢".chars().count());
    }

    #[tokio::test]
    async fn diarize_grows_step_instead_of_truncating_when_window_budget_is_tight() {
        let segments = vec![seg("a", 0, 20_000)];
        let samples: Vec<f32> = vec![0.5; 320_000];
        let embedder = FixedEmbedder { vectors: vec![] };
        let settings = DiarizerSettings {
            sliding_threshold_ms: 3000,
            window_ms: 1500,
            step_ms: 750,
            min_window_ms: 200,
            max_windows: 3,
            distance_threshold: 0.5,
            max_flicker_ms: 1500,
        };
        let segments = diarize(segments, &samples, 16000, &embedder, settings)
            .await
            .unwrap();
        // the single segment must still cover its full original span.
        assert_eq!(segments.iter().map(|s| s.start_ms).min(), Some(0));
        assert_eq!(segments.iter().map(|s| s.end_ms).max(), Some(20_000));
    }
}
