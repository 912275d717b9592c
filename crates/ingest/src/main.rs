use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_ingest::deserializer::CsvLineDeserializer;
use courier_ingest::object_store::PgObjectStore;
use courier_ingest::record_store::PgRecordStore;
use courier_ingest::service::IngestService;
use courier_ingest::worker::IngestHandler;
use courier_queue::{QueueConfig, QueueConsumer, RedisQueue};

const INGEST_BATCH_SIZE: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_ingest=info,courier_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier ingest worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = redis_pool::connect_queue_backend(&config.redis_url).await?;
    let events = Arc::new(RedisQueue::new(
        redis,
        QueueConfig::pipeline(&config.queue_object_events, &config),
    ));

    let service = Arc::new(IngestService::new(
        Arc::new(PgObjectStore::new(pool.clone())),
        Arc::new(PgRecordStore::new(pool, config.fanout_shards)),
        Arc::new(CsvLineDeserializer),
    ));

    let consumer = QueueConsumer::new(
        events,
        Arc::new(IngestHandler::new(service)),
        INGEST_BATCH_SIZE,
        config.poll_interval(),
    );

    tokio::select! {
        result = consumer.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Ingest consumer exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier ingest worker stopped.");
    Ok(())
}
