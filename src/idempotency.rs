use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

/// Replays the stored response for a repeated `Idempotency-Key`. Keys are
/// scoped per caller. Redis is used when configured, otherwise an in-process
/// map with the same TTL.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (Instant, String)>>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(redis_url: Option<&str>, ttl: Duration) -> Self {
        let redis = redis_url.and_then(|url| match redis::Client::open(url) {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(target = "fixedprice.api", error = %err, "redis_unavailable_using_memory");
                None
            }
        });
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, caller: &str, key: &str) -> Option<T> {
        let scoped = scoped_key(caller, key);
        let raw = match &self.redis {
            Some(client) => redis_get(client, &scoped).await,
            None => {
                let mut guard = self.local.lock().await;
                match guard.get(&scoped) {
                    Some((stored_at, _)) if stored_at.elapsed() >= self.ttl => {
                        guard.remove(&scoped);
                        None
                    }
                    Some((_, json)) => Some(json.clone()),
                    None => None,
                }
            }
        }?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn put<T: Serialize>(&self, caller: &str, key: &str, value: &T) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        let scoped = scoped_key(caller, key);
        match &self.redis {
            Some(client) => redis_set(client, &scoped, json, self.ttl).await,
            None => {
                let mut guard = self.local.lock().await;
                let ttl = self.ttl;
                guard.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
                guard.insert(scoped, (Instant::now(), json));
            }
        }
    }
}

fn scoped_key(caller: &str, key: &str) -> String {
    format!("idem:{caller}:{key}")
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<String> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "fixedprice.api", error = %err, "redis_get_failed");
            return None;
        }
    };
    let value: Option<String> = conn.get(key).await.ok()?;
    value
}

async fn redis_set(client: &redis::Client, key: &str, json: String, ttl: Duration) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
        let _: Result<(), _> = conn.set_ex(key, json, ttl.as_secs().max(1)).await;
    }
}
