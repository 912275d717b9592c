use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_fanout::{FanoutConfig, FanoutConsumer, NotificationBuilder};
use courier_ingest::record_store::PgRecordStore;
use courier_queue::{QueueConfig, RedisQueue};
use tokio::task::JoinSet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_fanout=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier fanout starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let stream = Arc::new(PgRecordStore::new(pool, config.fanout_shards));

    let redis = redis_pool::connect_queue_backend(&config.redis_url).await?;
    let work_queue = Arc::new(RedisQueue::new(
        redis.clone(),
        QueueConfig::pipeline(&config.queue_notifications, &config),
    ));
    let dead_letters = Arc::new(RedisQueue::new(
        redis,
        QueueConfig::terminal(&config.queue_fanout_dlq, &config),
    ));

    let mut shards = JoinSet::new();
    for shard in 0..config.fanout_shards.max(1) as i32 {
        let consumer = FanoutConsumer::new(
            stream.clone(),
            work_queue.clone(),
            dead_letters.clone(),
            NotificationBuilder::new(&config.recipient_field),
            FanoutConfig::from_app_config(&config, shard),
        );
        shards.spawn(async move { consumer.run().await });
    }

    tracing::info!(shards = shards.len(), "Fanout consumers running");

    tokio::select! {
        Some(result) = shards.join_next() => {
            let err = match result {
                Ok(Ok(())) => anyhow::anyhow!("Fanout consumer stopped unexpectedly"),
                Ok(Err(e)) => e,
                Err(e) => anyhow::Error::new(e),
            };
            tracing::error!(error = %err, "Fanout consumer exited with error");
            return Err(err);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            shards.shutdown().await;
        }
    }

    tracing::info!("Courier fanout stopped.");
    Ok(())
}
