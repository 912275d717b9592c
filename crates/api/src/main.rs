//! Courier gateway binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_common::redis_pool::connect_queue_backend;
use courier_fanout::NotificationBuilder;
use courier_ingest::intake::ObjectIntake;
use courier_ingest::object_store::PgObjectStore;
use courier_notifier::store::PgDeliveryStore;
use courier_queue::{MessageQueue, QueueConfig, RedisQueue, Topic};

use courier_api::routes::create_router;
use courier_api::state::{AppState, DeadLetterRoute};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_ingest=info,courier_queue=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = connect_queue_backend(&config.redis_url).await?;
    let pipeline_queue = |name: &str| -> Arc<dyn MessageQueue> {
        Arc::new(RedisQueue::new(redis.clone(), QueueConfig::pipeline(name, &config)))
    };
    let terminal_queue = |name: &str| -> Arc<dyn MessageQueue> {
        Arc::new(RedisQueue::new(redis.clone(), QueueConfig::terminal(name, &config)))
    };
    let dead_letters_of = |name: &str| terminal_queue(&AppConfig::dead_letter_queue_name(name));

    let object_events = pipeline_queue(&config.queue_object_events);
    let notifications = pipeline_queue(&config.queue_notifications);
    let feedback = pipeline_queue(&config.queue_feedback);

    let routes = vec![
        (
            "ingest".to_string(),
            DeadLetterRoute::Queue {
                dead_letters: dead_letters_of(&config.queue_object_events),
                source: object_events.clone(),
            },
        ),
        (
            "dispatch".to_string(),
            DeadLetterRoute::Queue {
                dead_letters: dead_letters_of(&config.queue_notifications),
                source: notifications.clone(),
            },
        ),
        (
            "feedback".to_string(),
            DeadLetterRoute::Queue {
                dead_letters: dead_letters_of(&config.queue_feedback),
                source: feedback.clone(),
            },
        ),
        (
            "fanout".to_string(),
            DeadLetterRoute::Stream {
                dead_letters: terminal_queue(&config.queue_fanout_dlq),
                work_queue: notifications,
                builder: NotificationBuilder::new(&config.recipient_field),
            },
        ),
    ];

    let intake = ObjectIntake::new(
        Arc::new(PgObjectStore::new(pool.clone())),
        object_events,
        config.object_bucket.clone(),
    );
    let feedback_topic = Topic::new(&config.queue_feedback).subscribe(feedback);

    let state = AppState::new(
        Arc::new(intake),
        Arc::new(PgDeliveryStore::new(pool)),
        Arc::new(feedback_topic),
    )
    .with_dead_letter_routes(routes);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
