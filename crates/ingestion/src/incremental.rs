//! Incremental update manager.
//!
//! On re-ingest, decides between three paths by diffing content hashes:
//! identical file → untouched; small delta → delete/re-embed only the
//! changed chunks; large delta (or a structural shift that would break
//! ordinal contiguity) → full reprocess.
//!
//! The delta ratio comes from a longest-common-subsequence over the chunk
//! hash sequences. Chunk reuse itself is position-aligned: a chunk is kept
//! only when the same hash sits at the same ordinal, because chunk ids
//! encode ordinals and persisted ordinals must stay contiguous. A shifted
//! but otherwise unchanged tail therefore re-embeds under the changed
//! path, and edits that move everything effectively reprocess in full.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use corpusforge_common::config::AppConfig;
use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::Result;
use corpusforge_common::hashing;
use corpusforge_common::index::{Node, VectorIndex};
use corpusforge_common::state::{DocumentState, DocumentStatus, StateStore};

use crate::chunking;
use crate::pipeline::{Context, StageOutcome};

/// What the incremental manager decided (and, for `Updated`, already did).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalOutcome {
    /// File hash identical; index untouched
    Unchanged { node_count: usize },
    /// Delta at or above the threshold; caller must run the full path
    FullReprocessRequired { delta_ratio_permille: u32 },
    /// Changed chunks were swapped in place
    Updated {
        added: usize,
        removed: usize,
        unchanged: usize,
        node_count: usize,
    },
}

/// Hash-sequence delta statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaStats {
    pub lcs_len: usize,
    pub changed: usize,
    pub delta_ratio: f64,
}

/// Diff two chunk-hash sequences by longest common subsequence.
pub fn diff_hashes(old: &[String], new: &[String]) -> DeltaStats {
    let longest = old.len().max(new.len());
    if longest == 0 {
        return DeltaStats {
            lcs_len: 0,
            changed: 0,
            delta_ratio: 0.0,
        };
    }

    let lcs_len = lcs_length(old, new);
    let changed = longest - lcs_len;
    DeltaStats {
        lcs_len,
        changed,
        delta_ratio: changed as f64 / longest as f64,
    }
}

/// Two-row LCS. For pathological sizes the quadratic table is skipped in
/// favor of a positional comparison, which can only over-estimate the
/// delta (pushing toward full reprocess, never toward a wrong reuse).
fn lcs_length(old: &[String], new: &[String]) -> usize {
    const MAX_CELLS: usize = 16_000_000;
    if old.len().saturating_mul(new.len()) > MAX_CELLS {
        return old
            .iter()
            .zip(new.iter())
            .filter(|(a, b)| a == b)
            .count();
    }

    let mut prev = vec![0u32; new.len() + 1];
    let mut curr = vec![0u32; new.len() + 1];
    for a in old {
        for (j, b) in new.iter().enumerate() {
            curr[j + 1] = if a == b {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[new.len()] as usize
}

pub struct IncrementalManager {
    state: Arc<dyn StateStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: AppConfig,
}

impl IncrementalManager {
    pub fn new(
        state: Arc<dyn StateStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: AppConfig,
    ) -> Self {
        Self {
            state,
            index,
            embedder,
            config,
        }
    }

    /// Attempt the incremental path for a re-ingest.
    ///
    /// Retry-safe: deletes are by id and upserts are idempotent, so a
    /// second run after a crash converges to the same index.
    #[tracing::instrument(skip(self, ctx, prior), fields(doc_id = %ctx.doc_id))]
    pub async fn process(
        &self,
        ctx: &Context,
        prior: &DocumentState,
    ) -> Result<IncrementalOutcome> {
        if prior.file_hash == ctx.file_hash {
            tracing::info!(doc_id = %ctx.doc_id, "Content unchanged, skipping reprocess");
            self.state
                .finish_processing(
                    &ctx.doc_id,
                    DocumentStatus::Completed,
                    Some(prior.chunk_ids.len()),
                    None,
                )
                .await?;
            return Ok(IncrementalOutcome::Unchanged {
                node_count: prior.chunk_ids.len(),
            });
        }

        let chunks = chunking::chunk(ctx.content(), &ctx.plan.chunking);
        let new_hashes: Vec<String> = chunks.iter().map(|c| hashing::hash_text(&c.text)).collect();

        let stats = diff_hashes(&prior.chunk_hashes, &new_hashes);
        let threshold = self.config.incremental.force_reprocess_threshold;
        tracing::info!(
            doc_id = %ctx.doc_id,
            old_chunks = prior.chunk_hashes.len(),
            new_chunks = new_hashes.len(),
            changed = stats.changed,
            delta_ratio = stats.delta_ratio,
            "Incremental delta computed"
        );

        if stats.delta_ratio >= threshold {
            return Ok(IncrementalOutcome::FullReprocessRequired {
                delta_ratio_permille: (stats.delta_ratio * 1000.0) as u32,
            });
        }

        // Position-aligned reuse: same hash at the same ordinal
        let aligned: Vec<bool> = (0..new_hashes.len())
            .map(|i| prior.chunk_hashes.get(i) == Some(&new_hashes[i]))
            .collect();
        let unchanged = aligned.iter().filter(|&&b| b).count();

        // Delete removed and changed chunks by their old ids
        let delete_ids: Vec<String> = prior
            .chunk_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| !aligned.get(*i).copied().unwrap_or(false))
            .map(|(_, id)| id.clone())
            .collect();
        let removed = delete_ids.len();

        if !delete_ids.is_empty() {
            (ctx.cancel)()?;
            self.index.delete_by_ids(&delete_ids).await?;
        }

        // Embed and upsert only the added/changed positions
        let pending: Vec<usize> = (0..chunks.len()).filter(|&i| !aligned[i]).collect();
        let added = pending.len();
        if !pending.is_empty() {
            (ctx.cancel)()?;
            let texts: Vec<String> = pending.iter().map(|&i| chunks[i].text.clone()).collect();
            let embeddings = self.embedder.embed(&texts).await?;

            let nodes: Vec<Node> = pending
                .iter()
                .zip(embeddings)
                .map(|(&i, embedding)| {
                    let chunk = &chunks[i];
                    Node {
                        chunk_id: Node::chunk_id_for(&ctx.doc_id, i),
                        doc_id: ctx.doc_id.clone(),
                        ordinal: i,
                        text: chunk.text.clone(),
                        embedding,
                        metadata: json!({
                            "file_type": ctx.file_type.as_str(),
                            "datasource": ctx.plan.datasource,
                            "boundary_kind": chunk.meta.boundary.map(|b| b.as_str()),
                            "heading_path": chunk.meta.heading_path,
                            "oversized": chunk.meta.oversized,
                            "start": chunk.meta.start,
                            "end": chunk.meta.end,
                        }),
                        content_hash: new_hashes[i].clone(),
                    }
                })
                .collect();
            self.index.upsert(&nodes).await?;
        }

        // New state: ids are ordinal-derived, so reused positions keep
        // their prior ids by construction
        let chunk_ids: Vec<String> = (0..chunks.len())
            .map(|i| Node::chunk_id_for(&ctx.doc_id, i))
            .collect();
        let node_count = chunk_ids.len();

        self.state
            .save_state(&DocumentState {
                doc_id: ctx.doc_id.clone(),
                file_hash: ctx.file_hash.clone(),
                chunk_hashes: new_hashes,
                chunk_ids,
                last_processed_at: Utc::now(),
                metadata_snapshot: ctx.metadata.clone(),
            })
            .await?;
        self.state
            .finish_processing(&ctx.doc_id, DocumentStatus::Completed, Some(node_count), None)
            .await?;

        tracing::info!(
            doc_id = %ctx.doc_id,
            added,
            removed,
            unchanged,
            "Incremental update applied"
        );

        Ok(IncrementalOutcome::Updated {
            added,
            removed,
            unchanged,
            node_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::chunking::{ChunkKind, ChunkingParams};
    use crate::pipeline::no_cancel;
    use corpusforge_common::embeddings::MockEmbedder;
    use corpusforge_common::state::{DocumentRecord, FileType, MemoryStateStore};
    use corpusforge_common::index::MemoryIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hashes(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_diff_identical() {
        let old = hashes(&["a", "b", "c"]);
        let stats = diff_hashes(&old, &old);
        assert_eq!(stats.changed, 0);
        assert_eq!(stats.delta_ratio, 0.0);
    }

    #[test]
    fn test_diff_replacement_ratio() {
        // 100 chunks, 3 replaced in place
        let old: Vec<String> = (0..100).map(|i| format!("h{i}")).collect();
        let mut new = old.clone();
        for i in 40..43 {
            new[i] = format!("edited{i}");
        }
        let stats = diff_hashes(&old, &new);
        assert_eq!(stats.lcs_len, 97);
        assert_eq!(stats.changed, 3);
        assert!((stats.delta_ratio - 0.03).abs() < 1e-9);
    }

    #[test]
    fn test_diff_insertion_uses_lcs() {
        let old = hashes(&["a", "b", "c", "d"]);
        let new = hashes(&["a", "x", "b", "c", "d"]);
        let stats = diff_hashes(&old, &new);
        assert_eq!(stats.lcs_len, 4);
        assert_eq!(stats.changed, 1);
        assert!((stats.delta_ratio - 0.2).abs() < 1e-9);
    }

    /// Embedder that counts how many texts it was asked to embed.
    struct CountingEmbedder {
        inner: MockEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    struct Fixture {
        manager: IncrementalManager,
        index: Arc<MemoryIndex>,
        state: Arc<MemoryStateStore>,
        embedder: Arc<CountingEmbedder>,
    }

    fn fixture() -> Fixture {
        let index = Arc::new(MemoryIndex::new());
        let state = Arc::new(MemoryStateStore::new());
        let embedder = Arc::new(CountingEmbedder {
            inner: MockEmbedder::new(16),
            calls: AtomicUsize::new(0),
        });
        let manager = IncrementalManager::new(
            state.clone() as Arc<dyn StateStore>,
            index.clone() as Arc<dyn VectorIndex>,
            embedder.clone() as Arc<dyn Embedder>,
            AppConfig::default(),
        );
        Fixture {
            manager,
            index,
            state,
            embedder,
        }
    }

    fn paragraphs(n: usize, edit: Option<(usize, usize)>) -> String {
        (0..n)
            .map(|i| {
                let edited = edit.map(|(s, e)| i >= s && i <= e).unwrap_or(false);
                if edited {
                    format!("Edited paragraph number {i} with different words entirely.")
                } else {
                    format!("Original paragraph number {i} with stable words.")
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn context(doc_id: &str, text: &str) -> Context {
        let analyzer = Analyzer::new(AppConfig::default());
        let (_, mut plan) = analyzer
            .analyze(FileType::Txt, text, text.len() as u64)
            .unwrap();
        // One paragraph per chunk
        plan.chunking = ChunkingParams {
            kind: ChunkKind::Semantic,
            chunk_size: 70,
            chunk_overlap: 0,
            respect_structure: true,
            language: crate::chunking::Language::English,
        };
        plan.use_incremental = true;
        Context {
            doc_id: doc_id.into(),
            source_path: format!("mem://{doc_id}"),
            file_type: FileType::Txt,
            metadata: json!({}),
            plan,
            size_bytes: text.len() as u64,
            file_hash: hashing::hash_text(text),
            cancel: no_cancel(),
            text: text.into(),
            markdown: None,
            chunks: Vec::new(),
            nodes: Vec::new(),
            outcome: None,
        }
    }

    /// First ingest done by hand so the fixture controls every node.
    async fn seed(f: &Fixture, ctx: &Context) -> usize {
        f.state
            .upsert_document(&DocumentRecord::new(
                ctx.doc_id.clone(),
                ctx.source_path.clone(),
                FileType::Txt,
            ))
            .await
            .unwrap();

        let chunks = chunking::chunk(ctx.content(), &ctx.plan.chunking);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = f.embedder.inner.embed(&texts).await.unwrap();
        let nodes: Vec<Node> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (c, e))| Node {
                chunk_id: Node::chunk_id_for(&ctx.doc_id, i),
                doc_id: ctx.doc_id.clone(),
                ordinal: i,
                text: c.text.clone(),
                embedding: e,
                metadata: json!({}),
                content_hash: hashing::hash_text(&c.text),
            })
            .collect();
        f.index.upsert(&nodes).await.unwrap();

        f.state
            .save_state(&DocumentState {
                doc_id: ctx.doc_id.clone(),
                file_hash: ctx.file_hash.clone(),
                chunk_hashes: nodes.iter().map(|n| n.content_hash.clone()).collect(),
                chunk_ids: nodes.iter().map(|n| n.chunk_id.clone()).collect(),
                last_processed_at: Utc::now(),
                metadata_snapshot: json!({}),
            })
            .await
            .unwrap();
        nodes.len()
    }

    #[tokio::test]
    async fn test_unchanged_short_circuit() {
        let f = fixture();
        let text = paragraphs(10, None);
        let ctx = context("inc-same", &text);
        let count = seed(&f, &ctx).await;
        f.state.try_begin_processing("inc-same").await.unwrap();

        let prior = f.state.load_state("inc-same").await.unwrap().unwrap();
        let outcome = f.manager.process(&ctx, &prior).await.unwrap();
        assert_eq!(outcome, IncrementalOutcome::Unchanged { node_count: count });
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_small_edit_touches_only_changed_chunks() {
        let f = fixture();
        let original = paragraphs(100, None);
        let seed_ctx = context("inc-edit", &original);
        let count = seed(&f, &seed_ctx).await;
        assert_eq!(count, 100);

        // Replace paragraphs 40..=42
        let edited = paragraphs(100, Some((40, 42)));
        let ctx = context("inc-edit", &edited);
        f.state.try_begin_processing("inc-edit").await.unwrap();

        let before: Vec<Node> = (0..100)
            .map(|i| f.index.get(&Node::chunk_id_for("inc-edit", i)).unwrap())
            .collect();

        let prior = f.state.load_state("inc-edit").await.unwrap().unwrap();
        let outcome = f.manager.process(&ctx, &prior).await.unwrap();

        assert_eq!(
            outcome,
            IncrementalOutcome::Updated {
                added: 3,
                removed: 3,
                unchanged: 97,
                node_count: 100,
            }
        );
        // Embeddings recomputed only for the 3 changed chunks
        assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 3);

        // The other 97 nodes are bit-identical
        for i in (0..40).chain(43..100) {
            let after = f.index.get(&Node::chunk_id_for("inc-edit", i)).unwrap();
            assert_eq!(after, before[i], "untouched chunk {i} changed");
        }
        for i in 40..43 {
            let after = f.index.get(&Node::chunk_id_for("inc-edit", i)).unwrap();
            assert!(after.text.contains("Edited"));
        }

        let record = f.state.get_document("inc-edit").await.unwrap().unwrap();
        assert_eq!(record.status, DocumentStatus::Completed);
        assert_eq!(record.node_count, 100);
    }

    #[tokio::test]
    async fn test_large_delta_forces_full_reprocess() {
        let f = fixture();
        let original = paragraphs(10, None);
        let seed_ctx = context("inc-big", &original);
        seed(&f, &seed_ctx).await;

        // Rewrite 6 of 10 paragraphs: delta 0.6 >= 0.5
        let rewritten = paragraphs(10, Some((0, 5)));
        let ctx = context("inc-big", &rewritten);
        f.state.try_begin_processing("inc-big").await.unwrap();

        let prior = f.state.load_state("inc-big").await.unwrap().unwrap();
        let outcome = f.manager.process(&ctx, &prior).await.unwrap();
        assert!(matches!(
            outcome,
            IncrementalOutcome::FullReprocessRequired { .. }
        ));
        // Nothing touched yet; that is the caller's job
        assert_eq!(f.index.count_by_doc("inc-big").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_incremental_apply_is_idempotent() {
        let f = fixture();
        let original = paragraphs(20, None);
        let seed_ctx = context("inc-retry", &original);
        seed(&f, &seed_ctx).await;

        let edited = paragraphs(20, Some((5, 6)));
        let ctx = context("inc-retry", &edited);
        f.state.try_begin_processing("inc-retry").await.unwrap();
        let prior = f.state.load_state("inc-retry").await.unwrap().unwrap();
        f.manager.process(&ctx, &prior).await.unwrap();

        // Retry with the state as it was before the first apply
        f.state.try_begin_processing("inc-retry").await.unwrap();
        let outcome = f.manager.process(&ctx, &prior).await.unwrap();
        assert!(matches!(outcome, IncrementalOutcome::Updated { .. }));

        let ordinals = f.index.ordinals_for_doc("inc-retry");
        assert_eq!(ordinals, (0..20).collect::<Vec<_>>());
    }
}
