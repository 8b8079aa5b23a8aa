//! Metrics and observability utilities
//!
//! Prometheus-style metrics via the `metrics` facade with standardized
//! naming for the ingest pipeline, the broker, and retrieval.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all CorpusForge metrics
pub const METRICS_PREFIX: &str = "corpusforge";

/// Register all metric descriptions
pub fn register_metrics() {
    // Ingestion metrics
    describe_counter!(
        format!("{METRICS_PREFIX}_documents_ingested_total"),
        Unit::Count,
        "Total documents ingested"
    );

    describe_counter!(
        format!("{METRICS_PREFIX}_chunks_indexed_total"),
        Unit::Count,
        "Total chunks written to the vector index"
    );

    describe_histogram!(
        format!("{METRICS_PREFIX}_ingest_duration_seconds"),
        Unit::Seconds,
        "Document ingest latency in seconds"
    );

    describe_counter!(
        format!("{METRICS_PREFIX}_segments_processed_total"),
        Unit::Count,
        "Segment tasks by outcome"
    );

    // Embedding metrics
    describe_counter!(
        format!("{METRICS_PREFIX}_embedding_requests_total"),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{METRICS_PREFIX}_embedding_duration_seconds"),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Broker metrics
    describe_gauge!(
        format!("{METRICS_PREFIX}_broker_queue_depth"),
        Unit::Count,
        "Tasks currently queued or running per queue"
    );

    describe_counter!(
        format!("{METRICS_PREFIX}_broker_tasks_total"),
        Unit::Count,
        "Finished broker tasks by terminal state"
    );

    // Retrieval metrics
    describe_counter!(
        format!("{METRICS_PREFIX}_search_queries_total"),
        Unit::Count,
        "Total search queries"
    );

    describe_histogram!(
        format!("{METRICS_PREFIX}_search_duration_seconds"),
        Unit::Seconds,
        "Search query latency in seconds"
    );

    describe_gauge!(
        format!("{METRICS_PREFIX}_search_results_count"),
        Unit::Count,
        "Number of results returned from search"
    );

    tracing::info!("Metrics registered");
}

/// Record a completed document ingest
pub fn record_ingest(duration_secs: f64, chunks_indexed: usize, outcome: &str) {
    counter!(
        format!("{METRICS_PREFIX}_documents_ingested_total"),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    counter!(format!("{METRICS_PREFIX}_chunks_indexed_total")).increment(chunks_indexed as u64);

    histogram!(format!("{METRICS_PREFIX}_ingest_duration_seconds")).record(duration_secs);
}

/// Record a segment task outcome (succeeded, failed, canceled)
pub fn record_segment(outcome: &str) {
    counter!(
        format!("{METRICS_PREFIX}_segments_processed_total"),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an embedding call
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{METRICS_PREFIX}_embedding_requests_total"),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{METRICS_PREFIX}_embedding_duration_seconds"),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Record a finished broker task
pub fn record_task(queue: &str, state: &str) {
    counter!(
        format!("{METRICS_PREFIX}_broker_tasks_total"),
        "queue" => queue.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set the current depth of a broker queue
pub fn set_queue_depth(queue: &str, depth: usize) {
    gauge!(
        format!("{METRICS_PREFIX}_broker_queue_depth"),
        "queue" => queue.to_string()
    )
    .set(depth as f64);
}

/// Record a search query
pub fn record_search(duration_secs: f64, mode: &str, result_count: usize) {
    counter!(
        format!("{METRICS_PREFIX}_search_queries_total"),
        "mode" => mode.to_string()
    )
    .increment(1);

    histogram!(
        format!("{METRICS_PREFIX}_search_duration_seconds"),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{METRICS_PREFIX}_search_results_count"),
        "mode" => mode.to_string()
    )
    .set(result_count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_does_not_panic() {
        register_metrics();
        record_ingest(1.25, 42, "completed");
        record_segment("succeeded");
        record_embedding(0.2, "mock", true);
        record_task("document.segment", "succeeded");
        set_queue_depth("document.segment", 3);
        record_search(0.05, "hybrid", 10);
    }
}
