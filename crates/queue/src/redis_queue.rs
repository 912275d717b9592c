//! Redis-backed queue.
//!
//! Layout under `courier:queue:<name>`:
//! - `:ready`    list of visible message ids (LPOP from the head)
//! - `:inflight` sorted set of received ids scored by visibility deadline (ms)
//! - `:bodies`   hash id → body
//! - `:receives` hash id → receive count
//! - `:errors`   hash id → last recorded processing error
//!
//! A receipt handle is `<id>:<receive count>`; ack and nack compare the count
//! with `:receives` so a handle from an earlier receive cannot touch a
//! redelivered message.
//!
//! Receive and dead-letter routing run as one Lua script so a message is never
//! both delivered and dead-lettered. Assumes a single Redis node: the
//! dead-letter keys of another queue are touched from the same script.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::{
    MessageQueue, QueueConfig, QueueDepth, QueueError, ReceivedMessage, parse_receipt, receipt_handle,
};

const RECEIVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local visibility = tonumber(ARGV[2])
local max_messages = tonumber(ARGV[3])
local max_receives = tonumber(ARGV[4])

local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for i = #expired, 1, -1 do
    redis.call('ZREM', KEYS[2], expired[i])
    redis.call('LPUSH', KEYS[1], expired[i])
end

local out = {}
while #out < max_messages do
    local id = redis.call('LPOP', KEYS[1])
    if not id then
        break
    end
    local body = redis.call('HGET', KEYS[3], id)
    if body then
        local count = tonumber(redis.call('HGET', KEYS[4], id) or '0')
        if max_receives > 0 and count >= max_receives then
            local letter = { source = ARGV[5], body = body, attempts = count, failedAt = now }
            local last_error = redis.call('HGET', KEYS[5], id)
            if last_error then
                letter['lastError'] = last_error
            end
            redis.call('HDEL', KEYS[3], id)
            redis.call('HDEL', KEYS[4], id)
            redis.call('HDEL', KEYS[5], id)
            redis.call('HSET', KEYS[7], id, cjson.encode(letter))
            redis.call('HSET', KEYS[8], id, 0)
            redis.call('RPUSH', KEYS[6], id)
        else
            count = count + 1
            redis.call('HSET', KEYS[4], id, count)
            redis.call('ZADD', KEYS[2], now + visibility, id)
            table.insert(out, { id, body, count })
        end
    end
end
return out
"#;

const ACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

const NACK_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Redis key names of one queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    ready: String,
    inflight: String,
    bodies: String,
    receives: String,
    errors: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        let prefix = format!("courier:queue:{}", name);
        Self {
            ready: format!("{}:ready", prefix),
            inflight: format!("{}:inflight", prefix),
            bodies: format!("{}:bodies", prefix),
            receives: format!("{}:receives", prefix),
            errors: format!("{}:errors", prefix),
        }
    }
}

/// Queue stored in Redis; cheap to clone.
#[derive(Clone)]
pub struct RedisQueue {
    redis: ConnectionManager,
    config: QueueConfig,
    keys: QueueKeys,
    dead_letter_keys: Option<QueueKeys>,
}

impl RedisQueue {
    pub fn new(redis: ConnectionManager, config: QueueConfig) -> Self {
        let keys = QueueKeys::new(&config.name);
        let dead_letter_keys = config
            .redrive
            .as_ref()
            .map(|r| QueueKeys::new(&r.dead_letter_queue));
        Self {
            redis,
            config,
            keys,
            dead_letter_keys,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }

    async fn send(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let mut conn = self.redis.clone();

        let _: () = redis::pipe()
            .atomic()
            .hset(&self.keys.bodies, &id, body)
            .ignore()
            .hset(&self.keys.receives, &id, 0)
            .ignore()
            .rpush(&self.keys.ready, &id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let visibility_ms = self.config.visibility_timeout.as_millis() as i64;
        let max_receives = self
            .config
            .redrive
            .as_ref()
            .map(|r| r.max_receive_count)
            .unwrap_or(0);
        // Without redrive the script never touches KEYS[6..8].
        let dlq = self.dead_letter_keys.as_ref().unwrap_or(&self.keys);

        let rows: Vec<(String, String, u32)> = Script::new(RECEIVE_SCRIPT)
            .key(&self.keys.ready)
            .key(&self.keys.inflight)
            .key(&self.keys.bodies)
            .key(&self.keys.receives)
            .key(&self.keys.errors)
            .key(&dlq.ready)
            .key(&dlq.bodies)
            .key(&dlq.receives)
            .arg(now)
            .arg(visibility_ms)
            .arg(max_messages)
            .arg(max_receives)
            .arg(&self.config.name)
            .invoke_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, body, receive_count)| ReceivedMessage {
                receipt_handle: receipt_handle(&id, receive_count),
                message_id: id,
                body,
                receive_count,
            })
            .collect())
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let Some((id, count)) = parse_receipt(receipt_handle) else {
            return Ok(());
        };
        let mut conn = self.redis.clone();

        let removed: i32 = Script::new(ACK_SCRIPT)
            .key(&self.keys.inflight)
            .key(&self.keys.bodies)
            .key(&self.keys.receives)
            .key(&self.keys.errors)
            .arg(id)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            tracing::debug!(queue = %self.config.name, receipt_handle, "Ignoring ack for superseded receipt");
        }

        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, error: &str) -> Result<(), QueueError> {
        let Some((id, count)) = parse_receipt(receipt_handle) else {
            return Ok(());
        };
        let mut conn = self.redis.clone();
        let _: i32 = Script::new(NACK_SCRIPT)
            .key(&self.keys.receives)
            .key(&self.keys.errors)
            .arg(id)
            .arg(count)
            .arg(error)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.redis.clone();
        let (total, in_flight): (u64, u64) = redis::pipe()
            .hlen(&self.keys.bodies)
            .zcard(&self.keys.inflight)
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth {
            visible: total.saturating_sub(in_flight),
            in_flight,
        })
    }
}
