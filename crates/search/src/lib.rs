//! CorpusForge search
//!
//! The hybrid retrieval engine: dense vector search and lexical search
//! executed in parallel, fused with weighted min–max normalized scores,
//! optionally reranked by a cross-encoder.

pub mod retrieval;

pub use retrieval::{
    HybridRetriever, RetrievalResult, Retriever, SearchRequest, SearchResponse,
};
