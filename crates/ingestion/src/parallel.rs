//! Parallel/segmented executor.
//!
//! Large documents fan out into coarse segments. Each segment runs a
//! minimal sub-pipeline (chunk → embed → upsert) as a broker task on the
//! `document.segment` queue; a merge step on `document.merging` validates
//! ordinal contiguity and finalizes the document.
//!
//! Segment tasks commute with respect to the index because each carries a
//! disjoint set of chunk ids: global ordinals are `ordinal_base +
//! local_ordinal`, with bases assigned up front by chunking each segment
//! once during the split (chunking is pure, so the counts the tasks later
//! produce are identical).
//!
//! Failure policy: if a segment fails after retries, outstanding segment
//! tasks are canceled and the partial writes of the succeeded ones are
//! rolled back by id, unless the plan opted into `allow_partial`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use corpusforge_common::broker::{
    queues, GroupOutcome, SubmitOptions, TaskBroker, TaskSpec, TaskState,
};
use corpusforge_common::config::AppConfig;
use corpusforge_common::embeddings::Embedder;
use corpusforge_common::errors::{AppError, Result};
use corpusforge_common::index::VectorIndex;
use corpusforge_common::metrics::record_segment;
use corpusforge_common::state::{DocumentState, DocumentStatus, StateStore};

use crate::chunking::{self, split_segments};
use crate::pipeline::processors::build_nodes;
use crate::pipeline::{Context, StageOutcome};

/// A coarse slice of one document dispatched as a unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub doc_id: String,
    /// Global ordinal of this segment's first chunk
    pub ordinal_base: usize,
    pub text: String,
    pub byte_range: (usize, usize),
}

/// Per-segment task result payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentResult {
    segment_index: usize,
    ordinal_base: usize,
    count: usize,
    chunk_ids: Vec<String>,
    chunk_hashes: Vec<String>,
}

pub struct ParallelExecutor {
    broker: TaskBroker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    state: Arc<dyn StateStore>,
    config: AppConfig,
}

impl ParallelExecutor {
    pub fn new(
        broker: TaskBroker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        state: Arc<dyn StateStore>,
        config: AppConfig,
    ) -> Self {
        Self {
            broker,
            embedder,
            index,
            state,
            config,
        }
    }

    /// Split the document and return segments with assigned ordinal bases
    /// and the expected total chunk count.
    pub fn split(&self, ctx: &Context) -> (Vec<Segment>, usize) {
        let content = ctx.content();
        let ranges = split_segments(
            content,
            ctx.plan.segment_size,
            ctx.plan.segment_strategy,
            ctx.plan.chunking.language,
        );

        let mut segments = Vec::with_capacity(ranges.len());
        let mut base = 0usize;
        for (i, range) in ranges.iter().enumerate() {
            let text = content[range.clone()].to_string();
            let count = chunking::chunk(&text, &ctx.plan.chunking).len();
            segments.push(Segment {
                segment_id: format!("{}:seg:{i}", ctx.doc_id),
                doc_id: ctx.doc_id.clone(),
                ordinal_base: base,
                text,
                byte_range: (range.start, range.end),
            });
            base += count;
        }
        (segments, base)
    }

    /// Run the full parallel path for an analyzed document.
    #[tracing::instrument(skip(self, ctx), fields(doc_id = %ctx.doc_id))]
    pub async fn execute(&self, ctx: &Context) -> Result<StageOutcome> {
        let (segments, expected_total) = self.split(ctx);
        tracing::info!(
            segments = segments.len(),
            expected_chunks = expected_total,
            strategy = ?ctx.plan.segment_strategy,
            "Dispatching segment tasks"
        );

        let specs: Vec<(TaskSpec, SubmitOptions)> = segments
            .iter()
            .map(|segment| (self.segment_spec(ctx, segment), self.segment_opts()))
            .collect();

        // Bounded dispatch keeps memory flat for very large documents;
        // default mode fans everything out and lets the queue semaphore
        // do the limiting.
        let outcome = if self.config.parallel.memory_efficient {
            self.dispatch_batched(ctx, specs).await?
        } else {
            let group = self.broker.group(specs).await?;
            let watcher = self.spawn_cancel_watcher(ctx, group.clone());
            let outcome = group.join_fail_fast(&self.broker).await?;
            watcher.abort();
            outcome
        };

        for record in &outcome.records {
            record_segment(record.state.as_str());
        }

        if outcome.all_succeeded() {
            self.merge(ctx, &outcome, expected_total).await
        } else {
            self.handle_failure(ctx, &outcome).await
        }
    }

    fn segment_opts(&self) -> SubmitOptions {
        SubmitOptions {
            max_retries: Some(self.config.broker.max_retries),
            soft_time_limit: Some(self.config.task_soft_time_limit()),
            time_limit: Some(self.config.task_time_limit()),
        }
    }

    /// The segment task body: chunk → embed → upsert, with cancellation
    /// checked between steps.
    fn segment_spec(&self, ctx: &Context, segment: &Segment) -> TaskSpec {
        let embedder = self.embedder.clone();
        let index = self.index.clone();
        let params = ctx.plan.chunking.clone();
        let datasource = ctx.plan.datasource.clone();
        let file_type = ctx.file_type;
        let doc_metadata = ctx.metadata.clone();
        let segment = segment.clone();
        let segment_index: usize = segment
            .segment_id
            .rsplit(':')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        TaskSpec::new(
            format!("segment:{}", segment.segment_id),
            queues::DOCUMENT_SEGMENT,
            move |tctx| {
                let embedder = embedder.clone();
                let index = index.clone();
                let params = params.clone();
                let datasource = datasource.clone();
                let doc_metadata = doc_metadata.clone();
                let segment = segment.clone();
                async move {
                    tctx.checkpoint()?;
                    let chunks = chunking::chunk(&segment.text, &params);

                    tctx.report_progress(json!({
                        "stage": "embedding",
                        "segment": segment.segment_id,
                        "chunks": chunks.len(),
                    }))
                    .await;

                    let cancel_ctx = tctx.clone();
                    let cancel: crate::pipeline::CancelCheck =
                        Arc::new(move || cancel_ctx.checkpoint());

                    let nodes = build_nodes(
                        &embedder,
                        &segment.doc_id,
                        file_type,
                        &datasource,
                        &doc_metadata,
                        &chunks,
                        segment.ordinal_base,
                        &cancel,
                    )
                    .await?;

                    tctx.checkpoint()?;
                    index.upsert(&nodes).await?;

                    tctx.report_progress(json!({
                        "stage": "complete",
                        "segment": segment.segment_id,
                        "count": nodes.len(),
                    }))
                    .await;

                    let result = SegmentResult {
                        segment_index,
                        ordinal_base: segment.ordinal_base,
                        count: nodes.len(),
                        chunk_ids: nodes.iter().map(|n| n.chunk_id.clone()).collect(),
                        chunk_hashes: nodes.iter().map(|n| n.content_hash.clone()).collect(),
                    };
                    Ok(serde_json::to_value(result)?)
                }
            },
        )
    }

    /// Submit segments in bounded batches, stopping at the first batch
    /// with a failure.
    async fn dispatch_batched(
        &self,
        ctx: &Context,
        specs: Vec<(TaskSpec, SubmitOptions)>,
    ) -> Result<GroupOutcome> {
        let batch_size = self.config.parallel.batch_size.max(1);
        let mut records = Vec::with_capacity(specs.len());
        let mut specs = specs.into_iter().peekable();

        while specs.peek().is_some() {
            let batch: Vec<_> = specs.by_ref().take(batch_size).collect();
            let group = self.broker.group(batch).await?;
            let watcher = self.spawn_cancel_watcher(ctx, group.clone());
            let outcome = group.join_fail_fast(&self.broker).await?;
            watcher.abort();
            let ok = outcome.all_succeeded();
            records.extend(outcome.records);
            if !ok {
                break;
            }
        }

        Ok(GroupOutcome { records })
    }

    /// Propagate a document-level cancel to in-flight segment tasks.
    fn spawn_cancel_watcher(
        &self,
        ctx: &Context,
        group: corpusforge_common::broker::GroupHandle,
    ) -> tokio::task::JoinHandle<()> {
        let cancel = ctx.cancel.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            loop {
                if (cancel)().is_err() {
                    group.cancel_all(&broker).await;
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
    }

    /// Aggregate segment results, validate global ordinal contiguity, and
    /// finalize the document. Runs as a task on `document.merging`.
    async fn merge(
        &self,
        ctx: &Context,
        outcome: &GroupOutcome,
        expected_total: usize,
    ) -> Result<StageOutcome> {
        let mut results: Vec<SegmentResult> = outcome
            .results()
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?;
        results.sort_by_key(|r| r.ordinal_base);

        let state = self.state.clone();
        let doc_id = ctx.doc_id.clone();
        let file_hash = ctx.file_hash.clone();
        let metadata = ctx.metadata.clone();

        let spec = TaskSpec::new(
            format!("merge:{doc_id}"),
            queues::DOCUMENT_MERGING,
            move |_tctx| {
                let state = state.clone();
                let doc_id = doc_id.clone();
                let file_hash = file_hash.clone();
                let metadata = metadata.clone();
                let results = results.clone();
                async move {
                    // Global ordinals must cover [0, total) with no gaps
                    let mut next = 0usize;
                    for r in &results {
                        if r.ordinal_base != next {
                            return Err(AppError::Internal {
                                message: format!(
                                    "segment ordinal gap for {doc_id}: expected base {next}, got {}",
                                    r.ordinal_base
                                ),
                            });
                        }
                        next += r.count;
                    }
                    if next != expected_total {
                        return Err(AppError::Internal {
                            message: format!(
                                "segment count mismatch for {doc_id}: {next} != {expected_total}"
                            ),
                        });
                    }

                    let chunk_ids: Vec<String> =
                        results.iter().flat_map(|r| r.chunk_ids.clone()).collect();
                    let chunk_hashes: Vec<String> =
                        results.iter().flat_map(|r| r.chunk_hashes.clone()).collect();
                    let node_count = chunk_ids.len();

                    state
                        .save_state(&DocumentState {
                            doc_id: doc_id.clone(),
                            file_hash,
                            chunk_hashes,
                            chunk_ids,
                            last_processed_at: Utc::now(),
                            metadata_snapshot: metadata,
                        })
                        .await?;
                    state
                        .finish_processing(
                            &doc_id,
                            DocumentStatus::Completed,
                            Some(node_count),
                            None,
                        )
                        .await?;

                    Ok(json!({ "node_count": node_count }))
                }
            },
        );

        let merge_id = self.broker.submit(spec, self.segment_opts()).await?;
        let merge_result = self.broker.wait_result(merge_id).await?;
        let node_count = merge_result["node_count"].as_u64().unwrap_or(0) as usize;

        tracing::info!(doc_id = %ctx.doc_id, node_count, "Parallel ingest merged");
        Ok(StageOutcome::Completed { node_count })
    }

    /// Rollback (default) or partial-complete (opt-in) after segment
    /// failures.
    async fn handle_failure(&self, ctx: &Context, outcome: &GroupOutcome) -> Result<StageOutcome> {
        let succeeded: Vec<SegmentResult> = outcome
            .results()
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        let failed: Vec<&corpusforge_common::broker::TaskRecord> = outcome
            .records
            .iter()
            .filter(|r| r.state == TaskState::Failed)
            .collect();
        let summary = format!(
            "{} succeeded, {} failed, {} canceled",
            outcome.count(TaskState::Succeeded),
            outcome.count(TaskState::Failed),
            outcome.count(TaskState::Canceled),
        );
        let first_error = failed
            .first()
            .and_then(|r| r.error.clone())
            .unwrap_or_else(|| "segment task failed".to_string());

        if ctx.plan.allow_partial {
            // Keep the succeeded segments, record the gaps
            let mut results = succeeded;
            results.sort_by_key(|r| r.ordinal_base);
            let node_count: usize = results.iter().map(|r| r.count).sum();
            let failed_segments: Vec<usize> = outcome
                .records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.state != TaskState::Succeeded)
                .map(|(i, _)| i)
                .collect();

            self.state
                .save_state(&DocumentState {
                    doc_id: ctx.doc_id.clone(),
                    file_hash: ctx.file_hash.clone(),
                    chunk_hashes: results.iter().flat_map(|r| r.chunk_hashes.clone()).collect(),
                    chunk_ids: results.iter().flat_map(|r| r.chunk_ids.clone()).collect(),
                    last_processed_at: Utc::now(),
                    metadata_snapshot: ctx.metadata.clone(),
                })
                .await?;
            self.state
                .finish_processing(
                    &ctx.doc_id,
                    DocumentStatus::Partial,
                    Some(node_count),
                    Some(format!("partial ingest: {summary}; first error: {first_error}")),
                )
                .await?;

            tracing::warn!(doc_id = %ctx.doc_id, %summary, "Partial ingest kept");
            return Ok(StageOutcome::Partial {
                node_count,
                failed_segments,
            });
        }

        // Best-effort rollback of everything the succeeded segments wrote;
        // idempotent upserts make a later retry safe either way.
        let to_delete: Vec<String> = succeeded
            .iter()
            .flat_map(|r| r.chunk_ids.clone())
            .collect();
        if !to_delete.is_empty() {
            if let Err(e) = self.index.delete_by_ids(&to_delete).await {
                tracing::error!(doc_id = %ctx.doc_id, error = %e, "Rollback delete failed");
            }
        }

        self.state
            .finish_processing(
                &ctx.doc_id,
                DocumentStatus::Failed,
                Some(0),
                Some(format!("segment failure ({summary}): {first_error}; rolled back")),
            )
            .await?;

        tracing::error!(doc_id = %ctx.doc_id, %summary, "Parallel ingest rolled back");

        let failed_ordinal = outcome
            .records
            .iter()
            .position(|r| r.state == TaskState::Failed)
            .unwrap_or(0);
        Err(AppError::SegmentFailure {
            doc_id: ctx.doc_id.clone(),
            ordinal: failed_ordinal,
            message: format!("{summary}: {first_error}"),
        })
    }
}
