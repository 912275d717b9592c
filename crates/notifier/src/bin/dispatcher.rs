use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_common::{db, redis_pool};
use courier_notifier::dispatcher::Dispatcher;
use courier_notifier::sender::mailer_from_config;
use courier_notifier::store::PgDeliveryStore;
use courier_queue::{QueueConfig, QueueConsumer, RedisQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_dispatcher=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier dispatcher starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = redis_pool::connect_queue_backend(&config.redis_url).await?;
    let work_queue = Arc::new(RedisQueue::new(
        redis,
        QueueConfig::pipeline(&config.queue_notifications, &config),
    ));

    let dispatcher = Dispatcher::new(
        mailer_from_config(&config)?,
        Arc::new(PgDeliveryStore::new(pool)),
    );
    let consumer = QueueConsumer::new(
        work_queue,
        Arc::new(dispatcher),
        config.dispatch_batch_size,
        config.poll_interval(),
    );

    tokio::select! {
        result = consumer.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatcher exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Courier dispatcher stopped.");
    Ok(())
}
