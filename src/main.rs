use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use regmatch::cache::{CacheStore, InMemoryCache};
use regmatch::config::Config;
use regmatch::embedding::local::LocalEmbeddingProvider;
use regmatch::embedding::openai::OpenAIEmbeddingProvider;
use regmatch::embedding::{CachedEmbedder, EmbeddingProvider};
use regmatch::logging;
use regmatch::metrics::MetricsRecorder;
use regmatch::search::HybridSearcher;
use regmatch::store::postgres::PostgresClauseStore;
use regmatch::store::remote::RemoteVectorIndex;

#[derive(Parser)]
#[command(name = "regmatch", version, about = "Hybrid retrieval of regulatory clauses")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations and exit
    Migrate,
    /// Rank clauses for a query with every enabled signal
    Search(QueryArgs),
    /// Find clauses closest to a piece of clause text by embedding only
    Similar(QueryArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// Query text; "-" reads it from stdin
    text: String,

    /// Number of results (derived from the text when omitted)
    #[arg(long)]
    top_k: Option<usize>,

    /// Only return clauses of this regulation
    #[arg(long)]
    scope: Option<String>,
}

impl QueryArgs {
    fn read_text(&self) -> Result<String> {
        if self.text == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        } else {
            Ok(self.text.clone())
        }
    }
}

/// Create the embedding provider based on configuration.
async fn create_embedding_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding.provider.as_str() {
        "openai" => {
            let api_key = config.embedding.openai_api_key.clone()
                .ok_or_else(|| anyhow::anyhow!(
                    "OpenAI API key required when provider is 'openai'. \
                     Set REGMATCH_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in regmatch.toml"
                ))?;
            Ok(Arc::new(OpenAIEmbeddingProvider::new(
                config.embedding.openai_base_url.clone(),
                api_key,
                config.embedding.openai_model.clone(),
                config.search.embedding_timeout(),
            )?))
        }
        "local" => Ok(Arc::new(LocalEmbeddingProvider::new(&config.embedding.cache_dir).await?)),
        other => anyhow::bail!("Unknown embedding provider '{}' (expected 'local' or 'openai')", other),
    }
}

/// Wire the store, remote index, embedder and caches into a searcher.
async fn create_searcher(config: &Config, run_migrations: bool) -> Result<HybridSearcher> {
    let provider = create_embedding_provider(config).await?;
    tracing::info!(model = provider.model_name(), dimension = provider.dimension(), "Embedding provider ready");

    let store = Arc::new(
        PostgresClauseStore::connect_lazy(&config.database_url)?
            .with_embedding_model(provider.model_name()),
    );
    if run_migrations {
        // An unreachable database only disables the signals it serves.
        match store.migrate().await {
            Ok(()) => tracing::info!("PostgreSQL clause store initialized"),
            Err(e) => tracing::warn!(error = %e, "Database unavailable at startup, continuing without migrations"),
        }
    }

    let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCache::new(config.cache.max_entries));

    let embedder = Arc::new(CachedEmbedder::new(
        provider,
        Arc::clone(&cache),
        Duration::from_secs(config.embedding.cache_ttl_secs),
        config.search.embedding_timeout(),
        config.search.single_flight_lease(),
    ));

    let metrics = MetricsRecorder::new(
        Arc::clone(&cache),
        config.cache.metrics_bucket_secs,
        Duration::from_secs(config.cache.metrics_ttl_secs),
    );

    let mut builder = HybridSearcher::builder(config.search.clone(), embedder, cache)
        .dense_backend(store.clone())
        .text_backend(store.clone())
        .term_index(store)
        .metrics(metrics);

    if config.remote_index.enabled {
        let url = config.remote_index.url.clone()
            .ok_or_else(|| anyhow::anyhow!("remote_index.url is required when the remote index is enabled"))?;
        let remote = RemoteVectorIndex::new(
            url,
            config.remote_index.api_key.clone(),
            config.remote_index.namespace.clone(),
            Duration::from_millis(config.remote_index.timeout_ms),
        )?;
        builder = builder.dense_backend(Arc::new(remote));
        tracing::info!("Remote vector index enabled as dense fallback");
    }

    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // Logging goes to stderr; stdout carries the JSON results.
    logging::init_logging(&config);

    match cli.command {
        Commands::Migrate => {
            tracing::info!("Running database migrations...");
            PostgresClauseStore::new(&config.database_url, true).await?;
            println!("Migrations completed successfully.");
        }

        Commands::Search(args) => {
            let text = args.read_text()?;
            let searcher = create_searcher(&config, !cli.skip_migrate).await?;
            let results = searcher
                .hybrid_search(&text, args.top_k, args.scope.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Commands::Similar(args) => {
            let text = args.read_text()?;
            let searcher = create_searcher(&config, !cli.skip_migrate).await?;
            let results = searcher
                .find_similar_clauses(&text, args.top_k, args.scope.as_deref())
                .await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
