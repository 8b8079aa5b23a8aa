//! Document analyzer and processing-plan selection.
//!
//! Inspects a document's text once, extracts structural features, and
//! turns them into a `ProcessingPlan`: which chunker to run with which
//! parameters, whether to normalize to markdown first, and whether the
//! parallel or incremental paths apply.

use serde::{Deserialize, Serialize};

use corpusforge_common::config::AppConfig;
use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::state::FileType;

use crate::chunking::{
    boundaries, ChunkKind, ChunkingParams, Language, SegmentStrategy,
};

/// Structural features extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFeatures {
    pub size_bytes: u64,
    pub char_count: usize,
    pub line_count: usize,
    /// Estimated page count (3000 chars per page)
    pub page_count: usize,
    /// Non-whitespace fraction of the text
    pub text_density: f32,
    pub has_tables: bool,
    pub has_code: bool,
    pub has_images: bool,
    pub heading_count: usize,
    pub heading_depth: u8,
    pub language: Language,
    /// Rough token estimate (4 chars per token)
    pub estimated_tokens: usize,
    pub avg_sentence_len: f32,
}

/// Document complexity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// The plan the pipeline engine and executor follow for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingPlan {
    pub convert_to_markdown: bool,
    pub chunking: ChunkingParams,
    pub use_parallel: bool,
    pub segment_size: usize,
    pub segment_strategy: SegmentStrategy,
    pub use_incremental: bool,
    pub allow_partial: bool,
    pub datasource: String,
    pub complexity: Complexity,
}

/// Caller-supplied overrides applied on top of the analyzer's plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOverrides {
    pub chunking_type: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub use_parallel: Option<bool>,
    pub segment_size: Option<usize>,
    pub use_incremental: Option<bool>,
    pub allow_partial: Option<bool>,
    pub datasource: Option<String>,
}

/// Chars per estimated token.
const CHARS_PER_TOKEN: usize = 4;
/// Chars per estimated page.
const CHARS_PER_PAGE: usize = 3000;

pub struct Analyzer {
    config: AppConfig,
}

impl Analyzer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Analyze document text and produce features plus a plan.
    ///
    /// Fails with `UnsupportedFileType` for unknown types whose content
    /// does not look like text.
    pub fn analyze(
        &self,
        file_type: FileType,
        text: &str,
        size_bytes: u64,
    ) -> Result<(DocumentFeatures, ProcessingPlan)> {
        if file_type == FileType::Other && !looks_like_text(text) {
            return Err(AppError::UnsupportedFileType {
                file_type: "other".to_string(),
            });
        }

        let features = self.extract_features(text, size_bytes);
        let plan = self.plan_for(file_type, &features);
        Ok((features, plan))
    }

    pub fn apply_overrides(&self, plan: &mut ProcessingPlan, overrides: &PlanOverrides) -> Result<()> {
        if let Some(kind) = &overrides.chunking_type {
            plan.chunking.kind = ChunkKind::parse(kind)?;
        }
        if let Some(size) = overrides.chunk_size {
            plan.chunking.chunk_size = size.max(1);
        }
        if let Some(overlap) = overrides.chunk_overlap {
            plan.chunking.chunk_overlap = overlap;
        }
        if let Some(parallel) = overrides.use_parallel {
            plan.use_parallel = parallel;
        }
        if let Some(size) = overrides.segment_size {
            plan.segment_size = size.max(1);
        }
        if let Some(incremental) = overrides.use_incremental {
            plan.use_incremental = incremental;
        }
        if let Some(partial) = overrides.allow_partial {
            plan.allow_partial = partial;
        }
        if let Some(datasource) = &overrides.datasource {
            plan.datasource = datasource.clone();
        }
        Ok(())
    }

    fn extract_features(&self, text: &str, size_bytes: u64) -> DocumentFeatures {
        let char_count = text.chars().count();
        let line_count = text.lines().count();

        let non_ws = text.chars().filter(|c| !c.is_whitespace()).count();
        let text_density = if char_count == 0 {
            0.0
        } else {
            non_ws as f32 / char_count as f32
        };

        let mut heading_count = 0usize;
        let mut heading_depth = 0u8;
        let mut has_images = false;
        for line in text.lines() {
            if let Some((level, _)) = boundaries::heading_of(line) {
                heading_count += 1;
                heading_depth = heading_depth.max(level);
            }
            if line.contains("![") && line.contains("](") {
                has_images = true;
            }
        }

        let spans = boundaries::protected_spans(text);
        let has_code = spans
            .iter()
            .any(|(_, _, k)| *k == crate::chunking::BoundaryKind::CodeBlock);
        let has_tables = spans
            .iter()
            .any(|(_, _, k)| *k == crate::chunking::BoundaryKind::Table);

        let language = detect_language(text);

        let bounds = boundaries::sentence_bounds(text, language);
        let sentence_count = bounds.len() + 1;
        let avg_sentence_len = char_count as f32 / sentence_count as f32;

        DocumentFeatures {
            size_bytes,
            char_count,
            line_count,
            page_count: (char_count / CHARS_PER_PAGE).max(1),
            text_density,
            has_tables,
            has_code,
            has_images,
            heading_count,
            heading_depth,
            language,
            estimated_tokens: char_count / CHARS_PER_TOKEN,
            avg_sentence_len,
        }
    }

    fn classify(&self, features: &DocumentFeatures) -> Complexity {
        let structural_richness = [
            features.has_tables,
            features.has_code,
            features.has_images,
            features.heading_depth >= 3,
        ]
        .iter()
        .filter(|&&b| b)
        .count();

        if features.size_bytes >= 4 * 1024 * 1024
            || features.estimated_tokens >= 500_000
            || structural_richness >= 3
        {
            Complexity::High
        } else if features.size_bytes >= 256 * 1024
            || features.estimated_tokens >= 50_000
            || structural_richness >= 1
        {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }

    fn plan_for(&self, file_type: FileType, features: &DocumentFeatures) -> ProcessingPlan {
        let complexity = self.classify(features);

        let convert_to_markdown = match file_type {
            FileType::Code | FileType::Txt => false,
            FileType::Pdf | FileType::Docx | FileType::Html => complexity >= Complexity::Medium,
            _ => false,
        };

        let kind = match file_type {
            FileType::Md => ChunkKind::RecursiveMarkdown,
            FileType::Code => ChunkKind::CodeAware,
            FileType::Table => ChunkKind::TableAware,
            _ if features.heading_count >= 5 && features.heading_depth >= 2 => {
                ChunkKind::Hierarchical
            }
            _ => ChunkKind::Semantic,
        };

        let (chunk_size, mut chunk_overlap) = chunk_table(file_type, complexity, &self.config);

        // Long sentences need more overlap to keep context across cuts
        if features.avg_sentence_len > 120.0 {
            chunk_overlap = (chunk_overlap * 2).min(chunk_size / 4);
        }

        let use_parallel = self.config.parallel.enabled
            && (features.size_bytes >= self.config.parallel.threshold_bytes
                || features.estimated_tokens >= self.config.parallel.token_threshold);

        // Structured documents split at semantic boundaries so segments do
        // not cut through sections; plain prose splits at sentences.
        let structured = matches!(file_type, FileType::Md | FileType::Html)
            || features.heading_count >= 3
            || features.has_code
            || features.has_tables;
        let segment_strategy = if structured {
            SegmentStrategy::Semantic
        } else {
            SegmentStrategy::parse(&self.config.parallel.strategy)
                .unwrap_or(SegmentStrategy::Sentence)
        };

        ProcessingPlan {
            convert_to_markdown,
            chunking: ChunkingParams {
                kind,
                chunk_size,
                chunk_overlap,
                respect_structure: self.config.chunking.respect_markdown,
                language: features.language,
            },
            use_parallel,
            segment_size: self.config.parallel.segment_size,
            segment_strategy,
            use_incremental: self.config.incremental.enabled,
            allow_partial: false,
            datasource: "primary".to_string(),
            complexity,
        }
    }
}

/// Chunk size and overlap keyed by (file type, complexity).
fn chunk_table(file_type: FileType, complexity: Complexity, config: &AppConfig) -> (usize, usize) {
    let base = config.chunking.chunk_size;
    let overlap = config.chunking.chunk_overlap;

    match (file_type, complexity) {
        (FileType::Code, _) => (base.max(1536), overlap),
        (FileType::Table, _) => (base, overlap / 2),
        (FileType::Md, Complexity::Low) => (base / 2, overlap),
        (FileType::Md, _) => (base, overlap),
        (_, Complexity::Low) => (base / 2, overlap),
        (_, Complexity::Medium) => (base, overlap),
        (_, Complexity::High) => (base + base / 2, overlap * 2),
    }
}

/// Unknown file types fall back to text extraction when the content is
/// mostly printable.
fn looks_like_text(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let sample: Vec<char> = text.chars().take(4096).collect();
    let control = sample
        .iter()
        .filter(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        .count();
    (control as f32 / sample.len() as f32) < 0.05
}

/// Chinese when a meaningful share of characters are CJK.
fn detect_language(text: &str) -> Language {
    let sample: Vec<char> = text.chars().take(8192).collect();
    if sample.is_empty() {
        return Language::English;
    }
    let cjk = sample
        .iter()
        .filter(|&&c| ('\u{4e00}'..='\u{9fff}').contains(&c))
        .count();
    if cjk as f32 / sample.len() as f32 > 0.2 {
        Language::Chinese
    } else {
        Language::English
    }
}
