//! Weighted score fusion.
//!
//! Each result list is min–max normalized to [0, 1] within itself, then
//! combined as `fused = w_v · vector + w_l · lexical`, with a result
//! missing from one list contributing 0 on that side. Duplicates (same
//! chunk in both lists) keep the maximum fused score.

use std::collections::HashMap;

use corpusforge_common::index::ScoredNode;

use super::RetrievalResult;

#[derive(Debug, Clone)]
pub struct WeightedFusion {
    pub w_vector: f32,
    pub w_lexical: f32,
}

impl Default for WeightedFusion {
    fn default() -> Self {
        Self {
            w_vector: 0.7,
            w_lexical: 0.3,
        }
    }
}

/// Min–max normalize in place. A degenerate list (all scores equal) maps
/// to 1.0 so a lone perfect hit is not zeroed out.
fn min_max_normalize(hits: &mut [ScoredNode]) {
    let Some(max) = hits
        .iter()
        .map(|h| h.score)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return;
    };
    let min = hits
        .iter()
        .map(|h| h.score)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or(max);

    let range = max - min;
    for hit in hits {
        hit.score = if range > 0.0 {
            (hit.score - min) / range
        } else {
            1.0
        };
    }
}

impl WeightedFusion {
    pub fn new(w_vector: f32, w_lexical: f32) -> Self {
        Self { w_vector, w_lexical }
    }

    /// Fuse the two result lists into ranked `RetrievalResult`s.
    pub fn fuse(
        &self,
        mut vector_hits: Vec<ScoredNode>,
        mut lexical_hits: Vec<ScoredNode>,
    ) -> Vec<RetrievalResult> {
        min_max_normalize(&mut vector_hits);
        min_max_normalize(&mut lexical_hits);

        let mut merged: HashMap<String, RetrievalResult> = HashMap::new();

        for hit in vector_hits {
            let fused = self.w_vector * hit.score;
            merged.insert(
                hit.chunk_id.clone(),
                RetrievalResult {
                    chunk_id: hit.chunk_id,
                    doc_id: hit.doc_id,
                    text: hit.text,
                    metadata: hit.metadata,
                    vector_score: hit.score,
                    lexical_score: 0.0,
                    fused_score: fused,
                    rerank_score: None,
                    highlight: None,
                },
            );
        }

        for hit in lexical_hits {
            let highlight = (!hit.spans.is_empty()).then(|| hit.spans.clone());
            match merged.get_mut(&hit.chunk_id) {
                Some(existing) => {
                    existing.lexical_score = hit.score;
                    let fused = self.w_vector * existing.vector_score + self.w_lexical * hit.score;
                    // Dedupe keeps the max fused score
                    existing.fused_score = existing.fused_score.max(fused);
                    existing.highlight = highlight;
                }
                None => {
                    let fused = self.w_lexical * hit.score;
                    merged.insert(
                        hit.chunk_id.clone(),
                        RetrievalResult {
                            chunk_id: hit.chunk_id,
                            doc_id: hit.doc_id,
                            text: hit.text,
                            metadata: hit.metadata,
                            vector_score: 0.0,
                            lexical_score: hit.score,
                            fused_score: fused,
                            rerank_score: None,
                            highlight,
                        },
                    );
                }
            }
        }

        let mut results: Vec<RetrievalResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Stable order for equal scores
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results
    }
}
