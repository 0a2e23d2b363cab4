use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Per-identity request timestamps.
///
/// The default [`MemoryRateLimitStore`] is process-local, so a restart resets
/// every window and separate instances do not share quotas. A shared cache can
/// be swapped in behind this trait without touching [`RateLimiter`].
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get(&self, identity: &str) -> Vec<DateTime<Utc>>;
    async fn set(&self, identity: &str, timestamps: Vec<DateTime<Utc>>);
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get(&self, identity: &str) -> Vec<DateTime<Utc>> {
        self.windows
            .lock()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    async fn set(&self, identity: &str, timestamps: Vec<DateTime<Utc>>) {
        let mut windows = self.windows.lock().await;
        if timestamps.is_empty() {
            windows.remove(identity);
        } else {
            windows.insert(identity.to_string(), timestamps);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<Duration>,
}

/// Sliding-window limiter: a call is allowed while fewer than `limit`
/// timestamps fall inside the trailing window.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    // get/set pairs are serialized so concurrent calls in one process cannot
    // both observe the same free slot
    gate: Mutex<()>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            gate: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()))
    }

    pub async fn check(&self, identity: &str, limit: u32, window: Duration) -> RateLimitDecision {
        self.check_at(identity, limit, window, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        identity: &str,
        limit: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let window =
            chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
        let window_start = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let _gate = self.gate.lock().await;
        let mut timestamps: Vec<DateTime<Utc>> = self
            .store
            .get(identity)
            .await
            .into_iter()
            .filter(|ts| *ts > window_start)
            .collect();
        timestamps.sort();

        let count = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        if count >= limit {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let reset_at = oldest + window;
            let retry_after = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
            self.store.set(identity, timestamps).await;
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after: Some(retry_after),
            };
        }

        timestamps.push(now);
        let oldest = timestamps.first().copied().unwrap_or(now);
        self.store.set(identity, timestamps).await;
        RateLimitDecision {
            allowed: true,
            remaining: limit - count - 1,
            reset_at: oldest + window,
            retry_after: None,
        }
    }
}
