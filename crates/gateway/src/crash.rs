//! Downstream crash tracking
//!
//! Counts crashes per server. Once a server reaches the configured number of
//! crashes it is in a hard-error state: health probes skip it and the
//! connection pool refuses to reconnect until a reconnection attempt resets it.

use std::collections::HashMap;

use async_trait::async_trait;
use metagate_shared::ServerId;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Crash bookkeeping consumed by the pool, health monitor and reconnect coordinator
#[async_trait]
pub trait CrashTracker: Send + Sync {
    /// Record a crash. Returns true when the server just entered the error state.
    async fn record_crash(&self, server_uuid: ServerId) -> bool;

    async fn is_in_error_state(&self, server_uuid: ServerId) -> bool;

    async fn reset(&self, server_uuid: ServerId);
}

#[derive(Debug, Clone, Serialize)]
pub struct CrashRecord {
    pub crash_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_crash_at: OffsetDateTime,
}

/// In-process crash tracker
pub struct ServerErrorTracker {
    max_attempts: u32,
    crashes: RwLock<HashMap<ServerId, CrashRecord>>,
}

impl ServerErrorTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            crashes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, server_uuid: ServerId) -> Option<CrashRecord> {
        self.crashes.read().await.get(&server_uuid).cloned()
    }
}

#[async_trait]
impl CrashTracker for ServerErrorTracker {
    async fn record_crash(&self, server_uuid: ServerId) -> bool {
        let mut crashes = self.crashes.write().await;
        let record = crashes.entry(server_uuid).or_insert(CrashRecord {
            crash_count: 0,
            last_crash_at: OffsetDateTime::now_utc(),
        });
        record.crash_count += 1;
        record.last_crash_at = OffsetDateTime::now_utc();

        let entered = record.crash_count == self.max_attempts;
        if entered {
            tracing::warn!(
                server_uuid = %server_uuid,
                crash_count = record.crash_count,
                "Server entered error state"
            );
        }
        entered
    }

    async fn is_in_error_state(&self, server_uuid: ServerId) -> bool {
        self.crashes
            .read()
            .await
            .get(&server_uuid)
            .map(|r| r.crash_count >= self.max_attempts)
            .unwrap_or(false)
    }

    async fn reset(&self, server_uuid: ServerId) {
        if self.crashes.write().await.remove(&server_uuid).is_some() {
            tracing::debug!(server_uuid = %server_uuid, "Crash state reset");
        }
    }
}
