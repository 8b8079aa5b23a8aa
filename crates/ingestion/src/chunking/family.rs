//! The chunker implementations.
//!
//! All modes share the same machinery: structural blocks from the boundary
//! scanner, greedy packing up to `chunk_size`, sentence-level splitting for
//! oversized prose, and atomic passthrough (with the `oversized` flag) for
//! code fences and tables that exceed the budget.

use super::boundaries::{block_split, heading_of, sentence_bounds, Block};
use super::{BoundaryKind, ChunkMeta, ChunkPiece, ChunkingParams, Language};

/// Paragraph/sentence packing over the whole text.
///
/// `isolate` forces atomic blocks of the given kind into their own chunks
/// instead of packing them with neighboring prose.
pub(super) fn semantic(
    text: &str,
    params: &ChunkingParams,
    isolate: Option<BoundaryKind>,
) -> Vec<ChunkPiece> {
    let blocks = block_split(text, params.respect_structure);
    let pieces = pack_blocks(text, &blocks, params, isolate, &[]);
    apply_overlap(text, pieces, params, &blocks)
}

/// Heading-section packing with `heading_path` metadata.
pub(super) fn hierarchical(text: &str, params: &ChunkingParams) -> Vec<ChunkPiece> {
    let blocks = block_split(text, true);
    let mut out = Vec::new();
    let mut path: Vec<(u8, String)> = Vec::new();
    let mut section: Vec<Block> = Vec::new();

    let flush = |out: &mut Vec<ChunkPiece>, section: &mut Vec<Block>, path: &[(u8, String)]| {
        if section.is_empty() {
            return;
        }
        let titles: Vec<String> = path.iter().map(|(_, t)| t.clone()).collect();
        let pieces = pack_blocks(text, section, params, None, &titles);
        out.extend(pieces);
        section.clear();
    };

    for block in blocks {
        let first_line = text[block.start..block.end].lines().next().unwrap_or("");
        if !block.atomic {
            if let Some((level, title)) = heading_of(first_line) {
                // Chunks never cross heading boundaries
                flush(&mut out, &mut section, &path);
                while path.last().map(|(l, _)| *l >= level).unwrap_or(false) {
                    path.pop();
                }
                path.push((level, title.to_string()));
                section.push(block);
                continue;
            }
        }
        section.push(block);
    }
    flush(&mut out, &mut section, &path);
    out
}

/// One chunk per leaf block, prefixed with the heading path so every chunk
/// stands alone. Oversized prose recurses into sentences; oversized atomic
/// blocks pass through flagged.
pub(super) fn recursive_markdown(text: &str, params: &ChunkingParams) -> Vec<ChunkPiece> {
    struct PathEntry {
        level: u8,
        title: String,
        raw: String,
        emitted: bool,
    }

    let blocks = block_split(text, true);
    let mut out: Vec<ChunkPiece> = Vec::new();
    let mut path: Vec<PathEntry> = Vec::new();

    // A heading popped before anything was emitted under it still deserves
    // a chunk of its own, or it would vanish from the index.
    fn pop_to(path: &mut Vec<PathEntry>, level: u8, out: &mut Vec<ChunkPiece>, end: usize) {
        while path.last().map(|e| e.level >= level).unwrap_or(false) {
            let entry = path.pop().expect("non-empty path");
            if !entry.emitted {
                let mut lines: Vec<&str> = path.iter().map(|e| e.raw.as_str()).collect();
                lines.push(&entry.raw);
                let heading_titles: Vec<String> = path
                    .iter()
                    .map(|e| e.title.clone())
                    .chain(std::iter::once(entry.title.clone()))
                    .collect();
                out.push(ChunkPiece {
                    text: lines.join("\n"),
                    meta: ChunkMeta {
                        boundary: Some(BoundaryKind::Heading),
                        heading_path: heading_titles,
                        oversized: false,
                        start: end,
                        end,
                    },
                });
                for parent in path.iter_mut() {
                    parent.emitted = true;
                }
            }
        }
    }

    for block in blocks {
        let block_text = &text[block.start..block.end];
        let first_line = block_text.lines().next().unwrap_or("");

        if !block.atomic {
            if let Some((level, title)) = heading_of(first_line) {
                pop_to(&mut path, level, &mut out, block.start);
                path.push(PathEntry {
                    level,
                    title: title.to_string(),
                    raw: first_line.trim_start().to_string(),
                    emitted: false,
                });
                continue;
            }
        }

        let prefix: String = path
            .iter()
            .map(|e| e.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let titles: Vec<String> = path.iter().map(|e| e.title.clone()).collect();
        let budget = if prefix.is_empty() {
            params.chunk_size
        } else {
            params.chunk_size.saturating_sub(prefix.len() + 2)
        };

        fn emit(
            out: &mut Vec<ChunkPiece>,
            text: &str,
            prefix: &str,
            titles: &[String],
            span_start: usize,
            span_end: usize,
            boundary: BoundaryKind,
            oversized: bool,
        ) {
            let body = &text[span_start..span_end];
            let chunk_text = if prefix.is_empty() {
                body.to_string()
            } else {
                format!("{prefix}\n\n{body}")
            };
            out.push(ChunkPiece {
                text: chunk_text,
                meta: ChunkMeta {
                    boundary: Some(boundary),
                    heading_path: titles.to_vec(),
                    oversized,
                    start: span_start,
                    end: span_end,
                },
            });
        }

        if block.atomic {
            // Oversized atomic blocks stay whole; the prefix is dropped
            // when it alone would push a fitting block over the chunk size.
            if block.len() <= budget {
                emit(&mut out, text, &prefix, &titles, block.start, block.end, block.kind, false);
            } else {
                let oversized = block.len() > params.chunk_size;
                emit(&mut out, text, "", &titles, block.start, block.end, block.kind, oversized);
            }
        } else if block.len() <= budget {
            emit(&mut out, text, &prefix, &titles, block.start, block.end, block.kind, false);
        } else {
            let spans =
                split_span_by_sentences(text, block.start, block.end, budget.max(1), params.language);
            for (i, (s, e)) in spans.iter().enumerate() {
                let boundary = if i == 0 { block.kind } else { BoundaryKind::Sentence };
                emit(&mut out, text, &prefix, &titles, *s, *e, boundary, false);
            }
        }

        for entry in path.iter_mut() {
            entry.emitted = true;
        }
    }

    pop_to(&mut path, 0, &mut out, text.len());
    out
}

/// Plain size-based splitting via text-splitter.
pub(super) fn fixed(text: &str, params: &ChunkingParams) -> Vec<ChunkPiece> {
    use text_splitter::{ChunkConfig, TextSplitter};

    let splitter = TextSplitter::new(ChunkConfig::new(params.chunk_size));
    let mut out = Vec::new();
    let mut pos = 0usize;

    for piece in splitter.chunks(text) {
        let start = text[pos..].find(piece).map(|p| pos + p).unwrap_or(pos);
        let end = start + piece.len();
        out.push(ChunkPiece {
            text: piece.to_string(),
            meta: ChunkMeta {
                boundary: None,
                heading_path: Vec::new(),
                oversized: false,
                start,
                end,
            },
        });
        pos = end;
    }

    out
}

/// Greedy packing of blocks into chunks of at most `chunk_size` bytes.
fn pack_blocks(
    text: &str,
    blocks: &[Block],
    params: &ChunkingParams,
    isolate: Option<BoundaryKind>,
    heading_path: &[String],
) -> Vec<ChunkPiece> {
    let mut out: Vec<ChunkPiece> = Vec::new();
    // Current chunk: (start, end, boundary of first block)
    let mut current: Option<(usize, usize, BoundaryKind)> = None;

    let flush = |out: &mut Vec<ChunkPiece>, current: &mut Option<(usize, usize, BoundaryKind)>| {
        if let Some((start, end, boundary)) = current.take() {
            out.push(ChunkPiece {
                text: text[start..end].to_string(),
                meta: ChunkMeta {
                    boundary: Some(boundary),
                    heading_path: heading_path.to_vec(),
                    oversized: false,
                    start,
                    end,
                },
            });
        }
    };

    for block in blocks {
        let isolated = block.atomic && isolate == Some(block.kind);

        // Atomic blocks larger than the budget become their own chunk
        if block.atomic && (block.len() > params.chunk_size || isolated) {
            flush(&mut out, &mut current);
            out.push(ChunkPiece {
                text: text[block.start..block.end].to_string(),
                meta: ChunkMeta {
                    boundary: Some(block.kind),
                    heading_path: heading_path.to_vec(),
                    oversized: block.len() > params.chunk_size,
                    start: block.start,
                    end: block.end,
                },
            });
            continue;
        }

        // Oversized prose recurses into sentences
        if !block.atomic && block.len() > params.chunk_size {
            flush(&mut out, &mut current);
            let spans = split_span_by_sentences(
                text,
                block.start,
                block.end,
                params.chunk_size,
                params.language,
            );
            for (i, (s, e)) in spans.iter().enumerate() {
                let boundary = if i == 0 { block.kind } else { BoundaryKind::Sentence };
                out.push(ChunkPiece {
                    text: text[*s..*e].to_string(),
                    meta: ChunkMeta {
                        boundary: Some(boundary),
                        heading_path: heading_path.to_vec(),
                        oversized: false,
                        start: *s,
                        end: *e,
                    },
                });
            }
            continue;
        }

        match current {
            None => current = Some((block.start, block.end, block.kind)),
            Some((start, _, boundary)) => {
                if block.end - start <= params.chunk_size {
                    current = Some((start, block.end, boundary));
                } else {
                    flush(&mut out, &mut current);
                    current = Some((block.start, block.end, block.kind));
                }
            }
        }
    }
    flush(&mut out, &mut current);
    out
}

/// Prepend each chunk (except the first) with trailing context from its
/// predecessor: at most `chunk_overlap` bytes, starting at the
/// highest-priority boundary that fits the window, and never growing a
/// chunk past `chunk_size`.
fn apply_overlap(
    text: &str,
    pieces: Vec<ChunkPiece>,
    params: &ChunkingParams,
    blocks: &[Block],
) -> Vec<ChunkPiece> {
    if params.chunk_overlap == 0 || pieces.len() < 2 {
        return pieces;
    }

    // Candidate overlap starts: block starts (with their boundary
    // priority) and sentence bounds outside atomic blocks.
    let mut candidates: Vec<(usize, f32)> = blocks
        .iter()
        .filter(|b| !b.atomic)
        .map(|b| (b.start, b.kind.priority()))
        .collect();
    for bound in sentence_bounds(text, params.language) {
        let inside_atomic = blocks
            .iter()
            .any(|b| b.atomic && bound > b.start && bound < b.end);
        if !inside_atomic {
            candidates.push((bound, BoundaryKind::Sentence.priority()));
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::with_capacity(pieces.len());
    let mut prev: Option<ChunkMeta> = None;

    for piece in pieces {
        let meta = piece.meta.clone();
        let mut chunk_text = piece.text;

        if let Some(prev_meta) = &prev {
            // Overlap only between directly adjacent source ranges, and
            // never out of an atomic/oversized predecessor.
            let contiguous = prev_meta.end <= meta.start;
            if contiguous && !prev_meta.oversized && meta.start > 0 {
                let allowed = params
                    .chunk_overlap
                    .min(params.chunk_size.saturating_sub(meta.end - meta.start));
                if allowed > 0 {
                    let window_lo = meta.start.saturating_sub(allowed).max(prev_meta.start);
                    let best = candidates
                        .iter()
                        .filter(|(pos, _)| *pos >= window_lo && *pos < meta.start)
                        .max_by(|a, b| {
                            a.1.partial_cmp(&b.1)
                                .unwrap_or(std::cmp::Ordering::Equal)
                                // Prefer the earliest among equal priorities
                                .then(b.0.cmp(&a.0))
                        });
                    if let Some(&(pos, _)) = best {
                        if text.is_char_boundary(pos) {
                            chunk_text = text[pos..meta.end].to_string();
                        }
                    }
                }
            }
        }

        prev = Some(meta.clone());
        out.push(ChunkPiece {
            text: chunk_text,
            meta,
        });
    }

    out
}

/// Split `[start, end)` at sentence boundaries into spans of at most
/// `max_len` bytes, hard-splitting single sentences that are still too
/// long.
fn split_span_by_sentences(
    text: &str,
    start: usize,
    end: usize,
    max_len: usize,
    language: Language,
) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut bounds: Vec<usize> = sentence_bounds(slice, language)
        .into_iter()
        .map(|b| b + start)
        .collect();
    bounds.push(end);

    let mut spans = Vec::new();
    let mut span_start = start;
    let mut prev_bound = start;

    for bound in bounds {
        if bound - span_start > max_len && prev_bound > span_start {
            spans.push((span_start, prev_bound));
            span_start = prev_bound;
        }
        // A single sentence longer than max_len gets hard-split
        if bound - span_start > max_len {
            let mut s = span_start;
            while bound - s > max_len {
                let mut cut = s + max_len;
                while cut > s && !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                if cut == s {
                    break;
                }
                spans.push((s, cut));
                s = cut;
            }
            span_start = s;
        }
        prev_bound = bound;
    }
    if span_start < end {
        spans.push((span_start, end));
    }

    spans
}
