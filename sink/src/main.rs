use std::process::ExitCode;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replay_sink::bus::{BusError, PgConsumer, PgProducer};
use replay_sink::clock::SystemClock;
use replay_sink::config::{ConfigError, PipelineConfig};
use replay_sink::error::PipelineError;
use replay_sink::ingest::IngestLoop;
use replay_sink::search::{BusSearchIndexer, Indexer, NoopIndexer};
use replay_sink::state::PipelineState;
use replay_sink::store::PgStore;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("database unreachable: {0}")]
    Database(#[from] sqlx::Error),
    #[error("bus consumer: {0}")]
    Bus(#[from] BusError),
    #[error("ingestion loop: {0}")]
    Pipeline(#[from] PipelineError),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_sink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "replay sink stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config = PipelineConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;

    let consumer = PgConsumer::connect(
        pool.clone(),
        &config.group,
        &config.topic_raw_web,
        config.partitions,
        config.consumer_poll_limit,
        config.consumer_idle,
    )
    .await?;
    let producer = Arc::new(PgProducer::new(pool.clone(), config.partitions));

    let indexer = match &config.topic_search {
        Some(topic) => Indexer::Bus(BusSearchIndexer::new(producer.clone(), topic.clone())),
        None => {
            tracing::info!("REPLAY_TOPIC_SEARCH unset; search indexing disabled");
            Indexer::Disabled(NoopIndexer)
        }
    };

    let store = Arc::new(PgStore::new(pool, config.store_timeout));
    let state = PipelineState::new(store, Arc::new(indexer), Arc::new(SystemClock), &config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("termination signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        group = %config.group,
        topic = %config.topic_raw_web,
        partitions = config.partitions,
        "replay sink started"
    );

    let mut ingest = IngestLoop::new(state, consumer, producer, &config);
    ingest.run(shutdown_rx).await?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
