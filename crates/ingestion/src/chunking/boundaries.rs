//! Boundary scanning shared by the chunker family.
//!
//! Produces the structural blocks (headings, paragraphs, list items,
//! quotes, fenced code, tables) and sentence break positions that the
//! chunkers pack into chunks. Fenced code blocks and tables are *atomic*:
//! no split point is ever produced inside them.

use super::{BoundaryKind, Language};

/// A structural block of source text. `start..end` are byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    pub kind: BoundaryKind,
    /// Atomic blocks (code fences, tables) must never be split
    pub atomic: bool,
}

impl Block {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Byte spans that must never contain a split point: fenced code blocks
/// and table blocks. Sorted, non-overlapping.
pub fn protected_spans(text: &str) -> Vec<(usize, usize, BoundaryKind)> {
    let mut spans = Vec::new();

    // Fenced code blocks: a ``` line opens, the next ``` line closes.
    // An unclosed fence extends to the end of the text.
    let mut fence_open: Option<usize> = None;
    for (line_start, line) in lines_with_offsets(text) {
        if line.trim_start().starts_with("```") {
            match fence_open.take() {
                None => fence_open = Some(line_start),
                Some(open) => {
                    let end = line_start + line.len();
                    spans.push((open, end, BoundaryKind::CodeBlock));
                }
            }
        }
    }
    if let Some(open) = fence_open {
        spans.push((open, text.len(), BoundaryKind::CodeBlock));
    }

    // Table blocks: two or more consecutive lines starting with '|',
    // outside of fences.
    let mut run_start: Option<usize> = None;
    let mut run_lines = 0usize;
    let mut run_end = 0usize;
    for (line_start, line) in lines_with_offsets(text) {
        let in_fence = spans
            .iter()
            .any(|&(s, e, _)| line_start >= s && line_start < e);
        let is_table_row = !in_fence && line.trim_start().starts_with('|');
        if is_table_row {
            if run_start.is_none() {
                run_start = Some(line_start);
                run_lines = 0;
            }
            run_lines += 1;
            run_end = line_start + line.len();
        } else if let Some(start) = run_start.take() {
            if run_lines >= 2 {
                spans.push((start, run_end, BoundaryKind::Table));
            }
        }
    }
    if let Some(start) = run_start {
        if run_lines >= 2 {
            spans.push((start, run_end, BoundaryKind::Table));
        }
    }

    spans.sort_by_key(|&(s, _, _)| s);
    spans
}

/// Lines of `text` with their starting byte offsets. Line text excludes
/// the trailing newline.
fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.strip_suffix('\n').unwrap_or(raw))
    })
}

/// Markdown ATX heading: level and title.
pub fn heading_of(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if let Some(title) = rest.strip_prefix(' ') {
            return Some((hashes as u8, title.trim()));
        }
    }
    None
}

fn is_horizontal_rule(line: &str) -> bool {
    let t = line.trim();
    t.len() >= 3
        && (t.chars().all(|c| c == '-')
            || t.chars().all(|c| c == '*')
            || t.chars().all(|c| c == '_'))
}

fn is_list_item(line: &str) -> bool {
    let t = line.trim_start();
    if let Some(rest) = t.strip_prefix(['-', '*', '+']) {
        return rest.starts_with(' ');
    }
    let digits = t.bytes().take_while(|b| b.is_ascii_digit()).count();
    digits > 0 && t[digits..].starts_with(". ")
}

/// Classify a non-atomic block by its first line.
fn classify(first_line: &str) -> BoundaryKind {
    if heading_of(first_line).is_some() {
        BoundaryKind::Heading
    } else if is_horizontal_rule(first_line) {
        BoundaryKind::HorizontalRule
    } else if first_line.trim_start().starts_with('>') {
        BoundaryKind::Quote
    } else if is_list_item(first_line) {
        BoundaryKind::ListItem
    } else {
        BoundaryKind::Paragraph
    }
}

/// Split text into ordered structural blocks. Protected spans become
/// atomic blocks; the rest splits at blank lines.
pub fn block_split(text: &str, respect_structure: bool) -> Vec<Block> {
    let protected = if respect_structure {
        protected_spans(text)
    } else {
        Vec::new()
    };

    let mut blocks = Vec::new();
    let mut cursor = 0usize;

    let mut push_prose = |blocks: &mut Vec<Block>, start: usize, end: usize| {
        for block in split_prose(text, start, end) {
            blocks.push(block);
        }
    };

    for &(span_start, span_end, kind) in &protected {
        if cursor < span_start {
            push_prose(&mut blocks, cursor, span_start);
        }
        blocks.push(Block {
            start: span_start,
            end: span_end,
            kind,
            atomic: true,
        });
        cursor = span_end;
    }
    if cursor < text.len() {
        push_prose(&mut blocks, cursor, text.len());
    }

    blocks
}

/// Split a prose region at blank lines, trimming each piece.
fn split_prose(text: &str, start: usize, end: usize) -> Vec<Block> {
    let region = &text[start..end];
    let mut blocks = Vec::new();
    let mut piece_start = 0usize;

    let bytes = region.as_bytes();
    let mut i = 0usize;
    loop {
        // Find the next blank-line gap: newline, optional spaces/tabs,
        // another newline.
        let gap = find_blank_gap(bytes, i);
        let (piece_end, next_start) = match gap {
            Some((gap_start, gap_end)) => (gap_start, gap_end),
            None => (region.len(), region.len()),
        };

        if let Some(block) = trimmed_block(region, piece_start, piece_end, start) {
            blocks.push(block);
        }

        if next_start >= region.len() {
            break;
        }
        piece_start = next_start;
        i = next_start;
    }

    blocks
}

fn find_blank_gap(bytes: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t' || bytes[j] == b'\r') {
                j += 1;
            }
            if j < bytes.len() && bytes[j] == b'\n' {
                // Extend over any further blank lines
                let mut k = j + 1;
                loop {
                    let mut m = k;
                    while m < bytes.len()
                        && (bytes[m] == b' ' || bytes[m] == b'\t' || bytes[m] == b'\r')
                    {
                        m += 1;
                    }
                    if m < bytes.len() && bytes[m] == b'\n' {
                        k = m + 1;
                    } else {
                        break;
                    }
                }
                return Some((i, k));
            }
        }
        i += 1;
    }
    None
}

fn trimmed_block(region: &str, start: usize, end: usize, base: usize) -> Option<Block> {
    let piece = &region[start..end];
    let trimmed = piece.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lead = piece.len() - piece.trim_start().len();
    let trail = piece.len() - piece.trim_end().len();
    let abs_start = base + start + lead;
    let abs_end = base + end - trail;
    let first_line = trimmed.lines().next().unwrap_or("");
    Some(Block {
        start: abs_start,
        end: abs_end,
        kind: classify(first_line),
        atomic: false,
    })
}

const CJK_ENDERS: [char; 5] = ['。', '！', '？', '；', '…'];
const CLOSING_QUOTES: [char; 8] = ['"', '\'', '”', '’', '」', '』', '）', ')'];

/// Sentence break positions (byte offsets where a new sentence may start).
///
/// English breaks after `.!?` followed by whitespace; Chinese breaks after
/// `。！？；…` with closing quotes paired onto the finished sentence.
pub fn sentence_bounds(text: &str, language: Language) -> Vec<usize> {
    let mut bounds = Vec::new();
    let chars: Vec<(usize, char)> = text.char_indices().collect();

    let mut i = 0usize;
    while i < chars.len() {
        let (_, c) = chars[i];
        let is_cjk_end = CJK_ENDERS.contains(&c);
        let is_ascii_end = matches!(c, '.' | '!' | '?');

        let ends_sentence = match language {
            Language::Chinese => is_cjk_end || is_ascii_end,
            Language::English => is_ascii_end || is_cjk_end,
        };

        if ends_sentence {
            // Attach closing quotes to the finished sentence
            let mut j = i + 1;
            while j < chars.len() && CLOSING_QUOTES.contains(&chars[j].1) {
                j += 1;
            }

            if is_cjk_end {
                let bound = chars.get(j).map(|&(o, _)| o).unwrap_or(text.len());
                push_bound(&mut bounds, bound, text.len());
                i = j;
                continue;
            }

            // ASCII enders need trailing whitespace to count, so "3.14"
            // and "e.g." stay whole.
            if j < chars.len() && chars[j].1.is_whitespace() {
                let mut k = j;
                while k < chars.len() && chars[k].1.is_whitespace() {
                    k += 1;
                }
                let bound = chars.get(k).map(|&(o, _)| o).unwrap_or(text.len());
                push_bound(&mut bounds, bound, text.len());
                i = k;
                continue;
            } else if j >= chars.len() {
                push_bound(&mut bounds, text.len(), text.len());
            }
        }
        i += 1;
    }

    bounds
}

fn push_bound(bounds: &mut Vec<usize>, bound: usize, len: usize) {
    if bound > 0 && bound < len && bounds.last() != Some(&bound) {
        bounds.push(bound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_protection() {
        let text = "before\n\n```rust\nlet x = 1;\n\nlet y = 2;\n```\n\nafter";
        let spans = protected_spans(text);
        assert_eq!(spans.len(), 1);
        let (s, e, kind) = spans[0];
        assert_eq!(kind, BoundaryKind::CodeBlock);
        assert!(text[s..e].starts_with("```rust"));
        assert!(text[s..e].ends_with("```"));
    }

    #[test]
    fn test_unclosed_fence_extends_to_end() {
        let text = "intro\n\n```\ncode without close\nmore";
        let spans = protected_spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].1, text.len());
    }

    #[test]
    fn test_table_protection() {
        let text = "intro\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\noutro";
        let spans = protected_spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].2, BoundaryKind::Table);
        assert!(text[spans[0].0..spans[0].1].contains("| 1 | 2 |"));
    }

    #[test]
    fn test_single_pipe_line_is_not_a_table() {
        let text = "a | b in prose\n\n| lonely\n\nmore prose";
        assert!(protected_spans(text).is_empty());
    }

    #[test]
    fn test_block_split_kinds() {
        let text = "# Heading\n\nplain paragraph\n\n- item one\n\n> quoted\n\n---\n\nlast";
        let blocks = block_split(text, true);
        let kinds: Vec<BoundaryKind> = blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BoundaryKind::Heading,
                BoundaryKind::Paragraph,
                BoundaryKind::ListItem,
                BoundaryKind::Quote,
                BoundaryKind::HorizontalRule,
                BoundaryKind::Paragraph,
            ]
        );
    }

    #[test]
    fn test_block_offsets_recover_text() {
        let text = "first block\n\nsecond block";
        let blocks = block_split(text, true);
        assert_eq!(&text[blocks[0].start..blocks[0].end], "first block");
        assert_eq!(&text[blocks[1].start..blocks[1].end], "second block");
    }

    #[test]
    fn test_english_sentence_bounds() {
        let text = "First one. Second two! Third three? Not 3.14 though.";
        let bounds = sentence_bounds(text, Language::English);
        let starts: Vec<&str> = bounds.iter().map(|&b| &text[b..b + 5]).collect();
        assert_eq!(starts, vec!["Secon", "Third", "Not 3"]);
    }

    #[test]
    fn test_chinese_sentence_bounds_with_quote_pairing() {
        let text = "他说：“你好。”然后离开了。最后一句";
        let bounds = sentence_bounds(text, Language::Chinese);
        assert_eq!(bounds.len(), 2);
        // First bound lands after the closing quote
        assert!(text[..bounds[0]].ends_with('”'));
        assert!(text[bounds[0]..].starts_with("然后"));
    }

    #[test]
    fn test_heading_parse() {
        assert_eq!(heading_of("## Sub Title"), Some((2, "Sub Title")));
        assert_eq!(heading_of("#not-a-heading"), None);
        assert_eq!(heading_of("plain"), None);
    }
}
