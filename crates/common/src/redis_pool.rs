use redis::Client;
use redis::aio::ConnectionManager;

/// Open a Redis connection manager for the queue backend.
///
/// The manager reconnects transparently, so one instance is cloned into every
/// queue handle of a worker.
pub async fn connect_queue_backend(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;

    tracing::info!("Connected to Redis queue backend");
    Ok(manager)
}
