//! In-memory vector index.
//!
//! Backs tests and single-process evaluation. Dense search is exact cosine
//! similarity; lexical search is term-frequency scoring with byte spans for
//! highlighting.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{Filter, IndexManagement, Node, ScoredNode, VectorIndex};
use crate::errors::{AppError, Result};

#[derive(Default)]
pub struct MemoryIndex {
    nodes: RwLock<HashMap<String, Node>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all chunk ids for a document, ordered by ordinal.
    pub fn chunk_ids_for_doc(&self, doc_id: &str) -> Vec<String> {
        let nodes = self.nodes.read().expect("index lock");
        let mut ids: Vec<(usize, String)> = nodes
            .values()
            .filter(|n| n.doc_id == doc_id)
            .map(|n| (n.ordinal, n.chunk_id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Ordinals persisted for a document, sorted.
    pub fn ordinals_for_doc(&self, doc_id: &str) -> Vec<usize> {
        let nodes = self.nodes.read().expect("index lock");
        let mut ordinals: Vec<usize> = nodes
            .values()
            .filter(|n| n.doc_id == doc_id)
            .map(|n| n.ordinal)
            .collect();
        ordinals.sort_unstable();
        ordinals
    }

    pub fn get(&self, chunk_id: &str) -> Option<Node> {
        self.nodes.read().expect("index lock").get(chunk_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Case-insensitive occurrences of `term` in `text`, as byte spans.
fn term_spans(text: &str, term: &str) -> Vec<(usize, usize)> {
    if term.is_empty() {
        return Vec::new();
    }
    let haystack = text.to_lowercase();
    let needle = term.to_lowercase();
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        spans.push((start, start + needle.len()));
        from = start + needle.len();
    }
    spans
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn ensure_collection(
        &self,
        _name: &str,
        dim: usize,
        _management: IndexManagement,
    ) -> Result<()> {
        if dim == 0 {
            return Err(AppError::Configuration {
                message: "embedding dimension must be positive".to_string(),
            });
        }
        Ok(())
    }

    async fn upsert(&self, nodes: &[Node]) -> Result<()> {
        let mut map = self.nodes.write().expect("index lock");
        for node in nodes {
            map.insert(node.chunk_id.clone(), node.clone());
        }
        Ok(())
    }

    async fn delete_by_doc(&self, doc_id: &str) -> Result<usize> {
        let mut map = self.nodes.write().expect("index lock");
        let before = map.len();
        map.retain(|_, n| n.doc_id != doc_id);
        Ok(before - map.len())
    }

    async fn delete_by_ids(&self, chunk_ids: &[String]) -> Result<usize> {
        let mut map = self.nodes.write().expect("index lock");
        let mut removed = 0;
        for id in chunk_ids {
            if map.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        let nodes = self.nodes.read().expect("index lock");
        let mut hits: Vec<ScoredNode> = nodes
            .values()
            .filter(|n| filter.map_or(true, |f| f.matches(&n.doc_id, &n.metadata)))
            .map(|n| ScoredNode {
                chunk_id: n.chunk_id.clone(),
                doc_id: n.doc_id.clone(),
                ordinal: n.ordinal,
                text: n.text.clone(),
                metadata: n.metadata.clone(),
                score: cosine(query, &n.embedding),
                spans: Vec::new(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn lexical_search(
        &self,
        terms: &[String],
        k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredNode>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let nodes = self.nodes.read().expect("index lock");
        let mut hits: Vec<ScoredNode> = Vec::new();

        for n in nodes.values() {
            if !filter.map_or(true, |f| f.matches(&n.doc_id, &n.metadata)) {
                continue;
            }

            let mut spans = Vec::new();
            let mut matched_terms = 0usize;
            let mut occurrences = 0usize;
            for term in terms {
                let s = term_spans(&n.text, term);
                if !s.is_empty() {
                    matched_terms += 1;
                    occurrences += s.len();
                    spans.extend(s);
                }
            }
            if matched_terms == 0 {
                continue;
            }

            spans.sort_unstable();
            // Coverage-weighted term frequency, normalized by text length so
            // short exact matches outrank long documents with stray hits.
            let coverage = matched_terms as f32 / terms.len() as f32;
            let tf = occurrences as f32 / (1.0 + (n.text.len() as f32).ln().max(0.0));
            hits.push(ScoredNode {
                chunk_id: n.chunk_id.clone(),
                doc_id: n.doc_id.clone(),
                ordinal: n.ordinal,
                text: n.text.clone(),
                metadata: n.metadata.clone(),
                score: coverage * tf,
                spans,
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn count_by_doc(&self, doc_id: &str) -> Result<usize> {
        let nodes = self.nodes.read().expect("index lock");
        Ok(nodes.values().filter(|n| n.doc_id == doc_id).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(doc: &str, ordinal: usize, text: &str, embedding: Vec<f32>) -> Node {
        Node {
            chunk_id: Node::chunk_id_for(doc, ordinal),
            doc_id: doc.to_string(),
            ordinal,
            text: text.to_string(),
            embedding,
            metadata: json!({"file_type": "md"}),
            content_hash: crate::hashing::hash_text(text),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let index = MemoryIndex::new();
        let nodes = vec![node("d1", 0, "alpha", vec![1.0, 0.0])];
        index.upsert(&nodes).await.unwrap();
        index.upsert(&nodes).await.unwrap();
        assert_eq!(index.count_by_doc("d1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_chunk_id() {
        let index = MemoryIndex::new();
        index
            .upsert(&[node("d1", 0, "old text", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(&[node("d1", 0, "new text", vec![0.0, 1.0])])
            .await
            .unwrap();
        let n = index.get(&Node::chunk_id_for("d1", 0)).unwrap();
        assert_eq!(n.text, "new text");
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_doc_and_ids() {
        let index = MemoryIndex::new();
        index
            .upsert(&[
                node("d1", 0, "a", vec![1.0]),
                node("d1", 1, "b", vec![1.0]),
                node("d2", 0, "c", vec![1.0]),
            ])
            .await
            .unwrap();

        assert_eq!(
            index.delete_by_ids(&[Node::chunk_id_for("d1", 1)]).await.unwrap(),
            1
        );
        assert_eq!(index.delete_by_doc("d1").await.unwrap(), 1);
        assert_eq!(index.count_by_doc("d1").await.unwrap(), 0);
        assert_eq!(index.count_by_doc("d2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vector_search_ranks_by_cosine() {
        let index = MemoryIndex::new();
        index
            .upsert(&[
                node("d1", 0, "x", vec![1.0, 0.0]),
                node("d1", 1, "y", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = index.vector_search(&[1.0, 0.1], 10, None).await.unwrap();
        assert_eq!(hits[0].ordinal, 0);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_lexical_search_reports_spans() {
        let index = MemoryIndex::new();
        index
            .upsert(&[node("d1", 0, "Milvus supports HNSW index", vec![1.0])])
            .await
            .unwrap();

        let hits = index
            .lexical_search(&["hnsw".to_string(), "index".to_string()], 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(!hits[0].spans.is_empty());
        let (start, end) = hits[0].spans[0];
        assert_eq!(&hits[0].text[start..end], "HNSW");
    }

    #[tokio::test]
    async fn test_filters_restrict_results() {
        let index = MemoryIndex::new();
        let mut a = node("d1", 0, "alpha beta", vec![1.0, 0.0]);
        a.metadata = json!({"file_type": "md"});
        let mut b = node("d2", 0, "alpha beta", vec![1.0, 0.0]);
        b.metadata = json!({"file_type": "pdf"});
        index.upsert(&[a, b]).await.unwrap();

        let filter = Filter::eq("file_type", "pdf");
        let hits = index
            .vector_search(&[1.0, 0.0], 10, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "d2");
    }
}
