use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_notifier::feedback::FeedbackSink;
use courier_notifier::store::PgDeliveryStore;
use courier_queue::{QueueConfig, QueueConsumer, RedisQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_feedback=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier feedback sink starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = redis_pool::connect_queue_backend(&config.redis_url).await?;
    let feedback_queue = Arc::new(RedisQueue::new(
        redis,
        QueueConfig::pipeline(&config.queue_feedback, &config),
    ));

    let consumer = QueueConsumer::new(
        feedback_queue,
        Arc::new(FeedbackSink::new(Arc::new(PgDeliveryStore::new(pool)))),
        config.feedback_batch_size,
        config.poll_interval(),
    );

    tokio::select! {
        result = consumer.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Feedback sink exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier feedback sink stopped.");
    Ok(())
}
