//! Text chunking
//!
//! Every chunker is a pure function from `(text, params)` to an ordered
//! list of chunk pieces with boundary metadata. One family covers all
//! modes, parameterized by boundary priorities:
//!
//! - `recursive_markdown`: one chunk per leaf block, prefixed with its
//!   heading path so each chunk stands alone
//! - `hierarchical`: packs blocks within heading sections, emitting the
//!   heading path as metadata
//! - `semantic`: packs blocks across the whole text at paragraph/sentence
//!   boundaries
//! - `code_aware` / `table_aware`: semantic packing with fenced code and
//!   table blocks kept whole and isolated
//! - `fixed`: plain size-based splitting
//!
//! Two rules hold everywhere: no chunk splits a fenced code block or a
//! table row, and no chunk exceeds `chunk_size` unless a single atomic
//! block is larger (such a chunk is flagged `oversized`).

pub mod boundaries;
mod family;
mod segments;

pub use segments::{split_segments, SegmentStrategy};

use serde::{Deserialize, Serialize};

use corpusforge_common::errors::{AppError, Result};

/// Document language, for sentence splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    English,
    Chinese,
}

/// Chunking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    RecursiveMarkdown,
    Hierarchical,
    Semantic,
    CodeAware,
    TableAware,
    Fixed,
}

impl ChunkKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "recursive_markdown" => Ok(ChunkKind::RecursiveMarkdown),
            "hierarchical" => Ok(ChunkKind::Hierarchical),
            "semantic" => Ok(ChunkKind::Semantic),
            "code_aware" => Ok(ChunkKind::CodeAware),
            "table_aware" => Ok(ChunkKind::TableAware),
            "fixed" => Ok(ChunkKind::Fixed),
            other => Err(AppError::Configuration {
                message: format!("unknown chunking type: {other}"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::RecursiveMarkdown => "recursive_markdown",
            ChunkKind::Hierarchical => "hierarchical",
            ChunkKind::Semantic => "semantic",
            ChunkKind::CodeAware => "code_aware",
            ChunkKind::TableAware => "table_aware",
            ChunkKind::Fixed => "fixed",
        }
    }
}

/// Labeled break points with priorities. When a split point must be
/// chosen, the highest priority wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryKind {
    SectionBreak,
    Heading,
    CodeBlock,
    Table,
    HorizontalRule,
    Paragraph,
    Quote,
    ListItem,
    Sentence,
}

impl BoundaryKind {
    pub fn priority(&self) -> f32 {
        match self {
            BoundaryKind::SectionBreak => 1.0,
            BoundaryKind::Heading => 1.0,
            BoundaryKind::CodeBlock => 1.0,
            BoundaryKind::Table => 1.0,
            BoundaryKind::HorizontalRule => 0.9,
            BoundaryKind::Paragraph => 0.8,
            BoundaryKind::Quote => 0.8,
            BoundaryKind::ListItem => 0.7,
            BoundaryKind::Sentence => 0.5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryKind::SectionBreak => "section_break",
            BoundaryKind::Heading => "heading",
            BoundaryKind::CodeBlock => "code_block",
            BoundaryKind::Table => "table",
            BoundaryKind::HorizontalRule => "horizontal_rule",
            BoundaryKind::Paragraph => "paragraph",
            BoundaryKind::Quote => "quote",
            BoundaryKind::ListItem => "list_item",
            BoundaryKind::Sentence => "sentence",
        }
    }
}

/// Chunker parameters, chosen by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub kind: ChunkKind,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub respect_structure: bool,
    pub language: Language,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            kind: ChunkKind::Semantic,
            chunk_size: 1024,
            chunk_overlap: 20,
            respect_structure: true,
            language: Language::English,
        }
    }
}

/// Metadata attached to each produced chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Boundary at which this chunk begins
    pub boundary: Option<BoundaryKind>,
    /// Ancestor heading titles (hierarchical and markdown modes)
    pub heading_path: Vec<String>,
    /// Set when a single atomic block exceeded chunk_size
    pub oversized: bool,
    /// Source byte offsets of the chunk's own content (overlap and heading
    /// prefixes excluded)
    pub start: usize,
    pub end: usize,
}

/// A produced chunk: normalized text plus boundary metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPiece {
    pub text: String,
    pub meta: ChunkMeta,
}

/// Chunk `text` under the given parameters.
///
/// Pure and deterministic: identical input always yields identical chunks,
/// which the incremental path and idempotent re-ingests rely on.
pub fn chunk(text: &str, params: &ChunkingParams) -> Vec<ChunkPiece> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match params.kind {
        ChunkKind::RecursiveMarkdown => family::recursive_markdown(text, params),
        ChunkKind::Hierarchical => family::hierarchical(text, params),
        ChunkKind::Semantic => family::semantic(text, params, None),
        ChunkKind::CodeAware => family::semantic(text, params, Some(BoundaryKind::CodeBlock)),
        ChunkKind::TableAware => family::semantic(text, params, Some(BoundaryKind::Table)),
        ChunkKind::Fixed => family::fixed(text, params),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(kind: ChunkKind, size: usize, overlap: usize) -> ChunkingParams {
        ChunkingParams {
            kind,
            chunk_size: size,
            chunk_overlap: overlap,
            respect_structure: true,
            language: Language::English,
        }
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        for kind in [
            ChunkKind::RecursiveMarkdown,
            ChunkKind::Semantic,
            ChunkKind::Fixed,
        ] {
            assert!(chunk("   \n  ", &params(kind, 100, 0)).is_empty());
        }
    }

    #[test]
    fn test_small_markdown_carries_heading() {
        let text = "# Title\n\npara one.\n\npara two.";
        let chunks = chunk(text, &params(ChunkKind::RecursiveMarkdown, 40, 0));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "# Title\n\npara one.");
        assert_eq!(chunks[1].text, "# Title\n\npara two.");
        assert_eq!(chunks[0].meta.heading_path, vec!["Title".to_string()]);
    }

    #[test]
    fn test_oversized_code_block_is_never_split() {
        let body = "x = 1\n".repeat(320); // ~1920 bytes
        let text = format!("```python\n{body}```");
        assert!(text.len() >= 1900);

        let chunks = chunk(&text, &params(ChunkKind::CodeAware, 500, 0));
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].meta.oversized);
        assert_eq!(chunks[0].meta.boundary, Some(BoundaryKind::CodeBlock));
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_no_chunk_exceeds_size_except_atomic() {
        let text = format!(
            "{}\n\n```\n{}\n```\n\n{}",
            "First paragraph with some words. ".repeat(20),
            "code line\n".repeat(100),
            "Second paragraph with more words. ".repeat(20),
        );
        let p = params(ChunkKind::Semantic, 300, 0);
        for piece in chunk(&text, &p) {
            assert!(
                piece.text.len() <= p.chunk_size || piece.meta.oversized,
                "chunk of {} bytes not flagged oversized",
                piece.text.len()
            );
        }
    }

    #[test]
    fn test_chunks_never_split_inside_fence() {
        let text = format!(
            "Intro paragraph.\n\n```rust\nfn main() {{}}\nlet x = 2;\n```\n\n{}",
            "Outro sentence here. ".repeat(30)
        );
        let chunks = chunk(&text, &params(ChunkKind::Semantic, 120, 0));
        let with_fence: Vec<_> = chunks.iter().filter(|c| c.text.contains("```")).collect();
        for c in &with_fence {
            assert_eq!(c.text.matches("```").count() % 2, 0, "unbalanced fence in chunk");
        }
        assert!(!with_fence.is_empty());
    }

    #[test]
    fn test_chunk_is_deterministic() {
        let text = "# H\n\nSome words here. More words there.\n\n- a\n- b\n\nFinal paragraph.";
        let p = params(ChunkKind::Semantic, 48, 8);
        assert_eq!(chunk(text, &p), chunk(text, &p));
    }

    #[test]
    fn test_overlap_bounded_by_param() {
        let text = "One sentence here. Two sentence here. Three sentence here. Four sentence here. Five sentence here.";
        let p = params(ChunkKind::Semantic, 45, 20);
        let chunks = chunk(text, &p);
        assert!(chunks.len() >= 2);
        for w in chunks.windows(2) {
            // Overlap shows up as a shared suffix/prefix no longer than the limit
            let prev = &w[0].text;
            let next = &w[1].text;
            let overlap = (1..=p.chunk_overlap.min(prev.len()).min(next.len()))
                .rev()
                .find(|&n| prev.is_char_boundary(prev.len() - n) && next[..n] == prev[prev.len() - n..])
                .unwrap_or(0);
            assert!(overlap <= p.chunk_overlap);
        }
    }

    #[test]
    fn test_boundary_priorities_follow_spec() {
        assert_eq!(BoundaryKind::Heading.priority(), 1.0);
        assert_eq!(BoundaryKind::HorizontalRule.priority(), 0.9);
        assert_eq!(BoundaryKind::Paragraph.priority(), 0.8);
        assert_eq!(BoundaryKind::ListItem.priority(), 0.7);
        assert_eq!(BoundaryKind::Sentence.priority(), 0.5);
    }
}
