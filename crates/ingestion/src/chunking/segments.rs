//! Coarse segment splitting for the parallel executor.
//!
//! Segments partition the source text into contiguous ranges of at most
//! `segment_size` bytes, cut at boundary positions so that no segment
//! starts mid-sentence or inside a fenced code block or table. The ranges
//! always cover `[0, len)` with no gaps, which is what lets the executor
//! recover global chunk ordinals from per-segment counts.

use corpusforge_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::boundaries::{block_split, protected_spans, sentence_bounds};
use super::Language;

/// How segment cut points are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStrategy {
    FixedSize,
    Sentence,
    Paragraph,
    Semantic,
}

impl SegmentStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fixed_size" => Ok(SegmentStrategy::FixedSize),
            "sentence" => Ok(SegmentStrategy::Sentence),
            "paragraph" => Ok(SegmentStrategy::Paragraph),
            "semantic" => Ok(SegmentStrategy::Semantic),
            other => Err(AppError::Configuration {
                message: format!("unknown segment strategy: {other}"),
            }),
        }
    }
}

/// Split `text` into contiguous segments of at most `segment_size` bytes.
///
/// A segment may exceed `segment_size` only when no admissible cut point
/// exists inside it (one giant sentence or protected block).
pub fn split_segments(
    text: &str,
    segment_size: usize,
    strategy: SegmentStrategy,
    language: Language,
) -> Vec<Range<usize>> {
    let len = text.len();
    if len == 0 {
        return Vec::new();
    }
    if len <= segment_size {
        return vec![0..len];
    }
    let segment_size = segment_size.max(1);

    let protected = protected_spans(text);
    let admissible = |pos: usize| -> bool {
        text.is_char_boundary(pos) && !protected.iter().any(|&(s, e, _)| pos > s && pos < e)
    };

    let mut cuts: Vec<usize> = match strategy {
        SegmentStrategy::FixedSize => {
            // Candidate cuts on a fixed grid, nudged off protected spans
            // and char boundaries.
            let mut cuts = Vec::new();
            let mut pos = segment_size;
            while pos < len {
                let mut p = pos;
                while p < len && !admissible(p) {
                    p += 1;
                }
                if p >= len {
                    break;
                }
                cuts.push(p);
                pos = p + segment_size;
            }
            cuts
        }
        SegmentStrategy::Sentence => sentence_bounds(text, language)
            .into_iter()
            .filter(|&p| admissible(p))
            .collect(),
        SegmentStrategy::Paragraph => block_split(text, true)
            .into_iter()
            .map(|b| b.start)
            .filter(|&p| p > 0 && admissible(p))
            .collect(),
        SegmentStrategy::Semantic => {
            // Paragraph starts plus sentence bounds as a fallback grid
            let mut cuts: Vec<usize> = block_split(text, true)
                .into_iter()
                .map(|b| b.start)
                .filter(|&p| p > 0)
                .collect();
            cuts.extend(sentence_bounds(text, language));
            cuts.retain(|&p| admissible(p));
            cuts.sort_unstable();
            cuts.dedup();
            cuts
        }
    };

    if strategy == SegmentStrategy::FixedSize {
        // The grid already packs exactly
        let mut ranges = Vec::with_capacity(cuts.len() + 1);
        let mut start = 0;
        for cut in cuts {
            ranges.push(start..cut);
            start = cut;
        }
        ranges.push(start..len);
        return ranges;
    }

    cuts.sort_unstable();
    cuts.dedup();

    // Greedy packing: take the furthest cut within budget; if none exists,
    // take the nearest cut past the budget (oversized segment rather than
    // a forbidden split).
    let mut ranges = Vec::new();
    let mut start = 0usize;
    while len - start > segment_size {
        let limit = start + segment_size;
        let within = cuts
            .iter()
            .copied()
            .filter(|&c| c > start && c <= limit)
            .max();
        let cut = match within {
            Some(c) => c,
            None => match cuts.iter().copied().find(|&c| c > limit) {
                Some(c) => c,
                None => break,
            },
        };
        ranges.push(start..cut);
        start = cut;
    }
    if start < len {
        ranges.push(start..len);
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(text: &str, ranges: &[Range<usize>]) {
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert_eq!(ranges.last().map(|r| r.end), Some(text.len()));
        for w in ranges.windows(2) {
            assert_eq!(w[0].end, w[1].start, "gap or overlap between segments");
        }
    }

    #[test]
    fn test_small_text_single_segment() {
        let ranges = split_segments("short", 100, SegmentStrategy::Sentence, Language::English);
        assert_eq!(ranges, vec![0..5]);
    }

    #[test]
    fn test_sentence_segments_partition_text() {
        let text = "A sentence here. ".repeat(100);
        let ranges = split_segments(&text, 200, SegmentStrategy::Sentence, Language::English);
        assert!(ranges.len() > 1);
        assert_partition(&text, &ranges);
        for r in &ranges {
            assert!(r.end - r.start <= 200 || r.end == text.len());
        }
    }

    #[test]
    fn test_twelve_one_mb_segments() {
        // A 12 "MB" document at 1 "MB" segment size, scaled down 1000x
        let sentence = "Exactly ten byt. "; // 17 bytes
        let text = sentence.repeat(12_000 / 17 + 1);
        let ranges = split_segments(&text, 1_000, SegmentStrategy::Sentence, Language::English);
        assert_partition(&text, &ranges);
        assert!((12..=13).contains(&ranges.len()), "got {} segments", ranges.len());
    }

    #[test]
    fn test_segments_never_cut_inside_fence() {
        let text = format!(
            "{}\n\n```\n{}\n```\n\n{}",
            "Lead sentence. ".repeat(10),
            "fenced code line\n".repeat(30),
            "Tail sentence. ".repeat(10)
        );
        for strategy in [
            SegmentStrategy::FixedSize,
            SegmentStrategy::Sentence,
            SegmentStrategy::Paragraph,
            SegmentStrategy::Semantic,
        ] {
            let ranges = split_segments(&text, 120, strategy, Language::English);
            assert_partition(&text, &ranges);
            let spans = protected_spans(&text);
            let (fs, fe, _) = spans[0];
            for r in &ranges {
                assert!(
                    !(r.start > fs && r.start < fe),
                    "{strategy:?} cut at {} inside fence {fs}..{fe}",
                    r.start
                );
            }
        }
    }

    #[test]
    fn test_fixed_size_partition() {
        let text = "abcdefghij".repeat(10);
        let ranges = split_segments(&text, 30, SegmentStrategy::FixedSize, Language::English);
        assert_partition(&text, &ranges);
        for r in &ranges {
            assert!(r.end - r.start <= 30 + 1);
        }
    }
}
