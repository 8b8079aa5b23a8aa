//! CorpusForge ingestion worker
//!
//! Brings up the process singletons in order (state store, vector index,
//! embedder, broker), serves ingest tasks until shutdown, and tears down
//! in reverse. `test` mode runs a single document through the pipeline
//! and exits, which is handy against a scratch database.

use std::sync::Arc;

use corpusforge_common::broker::TaskBroker;
use corpusforge_common::config::AppConfig;
use corpusforge_common::db::DbPool;
use corpusforge_common::embeddings::create_embedder;
use corpusforge_common::index::{create_index, IndexManagement, MemoryIndex, VectorIndex};
use corpusforge_common::metrics::register_metrics;
use corpusforge_common::source::FsSourceStore;
use corpusforge_common::state::{MemoryStateStore, SqlStateStore, StateStore};
use corpusforge_common::VERSION;
use corpusforge_ingestion::pipeline::no_cancel;
use corpusforge_ingestion::IngestionService;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.observability.log_level.clone()));
    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting CorpusForge ingestion worker v{VERSION}");
    register_metrics();

    // State store and vector index: Postgres-backed, or in-memory for
    // local evaluation when database.url = "memory"
    let (state, index): (Arc<dyn StateStore>, Arc<dyn VectorIndex>) =
        if config.database.url == "memory" {
            info!("Using in-memory state store and vector index");
            (
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryIndex::new()),
            )
        } else {
            info!("Connecting to database...");
            let pool = DbPool::new(&config.database).await?;
            pool.ping().await?;
            if config.vector_store.overwrite {
                info!(collection = %config.vector_store.collection, "Overwrite set, dropping collection");
                pool.execute_raw(&format!(
                    "DROP TABLE IF EXISTS {}",
                    config.vector_store.collection
                ))
                .await?;
            }
            let index = create_index(&config.vector_store, Some(pool.clone()))?;
            let state = SqlStateStore::new(pool);
            state.ensure_schema().await?;
            (Arc::new(state) as Arc<dyn StateStore>, index)
        };

    let management = IndexManagement::parse(&config.vector_store.index_management)?;
    index
        .ensure_collection(
            &config.vector_store.collection,
            config.embedding.dimension,
            management,
        )
        .await?;

    let embedder = create_embedder(&config.embedding)?;
    info!(
        model = %embedder.model_name(),
        dimension = embedder.dimension(),
        "Embedder initialized"
    );
    if embedder.dimension() != config.embedding.dimension {
        error!(
            configured = config.embedding.dimension,
            actual = embedder.dimension(),
            "Embedding dimension mismatch"
        );
        anyhow::bail!("embedding dimension mismatch is fatal at startup");
    }

    let broker = TaskBroker::new(config.broker.clone());
    let service = IngestionService::new(
        config.clone(),
        broker.clone(),
        embedder,
        index,
        state,
        Arc::new(FsSourceStore),
    );

    // Test mode: ingest one local file and exit
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 && args[1] == "test" {
        let path = args.get(2).map(String::as_str).unwrap_or("README.md");
        let doc_id = format!("local:{path}");
        info!(%doc_id, path, "Running one-shot ingest");

        match service
            .process_document(&doc_id, path, serde_json::json!({}), None, no_cancel())
            .await
        {
            Ok(outcome) => {
                println!("Ingest complete: {} chunks indexed", outcome.node_count());
            }
            Err(e) => {
                error!(error = %e, "Ingest failed");
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    info!("Ingestion worker ready, waiting for work (ctrl-c to stop)");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, draining broker...");
    broker.drain().await;
    info!("Ingestion worker shut down");
    Ok(())
}
