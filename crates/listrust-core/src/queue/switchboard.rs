//! Switchboard - durable file-backed queues
//!
//! Each queue is a directory under `queue/`. A pending record is a file
//! named `{scheduled_micros}+{id}.pck`; records are written through the
//! storage layer's atomic store, so a partially written record is never
//! visible. Claiming renames the file to `{stem}@{claimed_millis}.bak`, which
//! only one runner can win. Finishing deletes the claim; a crashed runner's
//! claims are renamed back to `.pck` by [`Switchboard::recover`].
//!
//! Records that fail permanently are moved to `queue/bad` as
//! `{queue}+{stem}.psv` with the error attached.

use crate::message::Message;
use crate::metadata::MessageData;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use listrust_common::config::QueueConfig;
use listrust_common::types::QueueItemId;
use listrust_common::{Error, Result};
use listrust_storage::FileStorage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Well-known queue names
pub mod queues {
    pub const IN: &str = "in";
    pub const DIGEST: &str = "digest";
    pub const OUT: &str = "out";
    pub const HELD: &str = "held";
    pub const BAD: &str = "bad";
}

const PENDING_EXT: &str = ".pck";
const CLAIMED_EXT: &str = ".bak";
const SHUNTED_EXT: &str = ".psv";

/// Retry policy for one queue
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before the next delivery after `attempts` failures
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2_i64.saturating_pow(attempts.saturating_sub(1).min(30));
        let delay = self.base.num_seconds().saturating_mul(factor);
        std::cmp::min(Duration::seconds(delay), self.max)
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::seconds(config.retry_base_secs as i64),
            max: Duration::seconds(config.retry_max_secs as i64),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// On-disk queue record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    id: QueueItemId,
    queue: String,
    enqueued_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    last_error: Option<String>,
    /// Base64 of the raw message
    message: String,
    metadata: MessageData,
}

impl QueueRecord {
    fn stem(&self) -> String {
        format!("{:020}+{}", self.scheduled_at.timestamp_micros().max(0), self.id)
    }

    fn decode(bytes: &[u8]) -> Result<(Self, Message)> {
        let record: QueueRecord = serde_json::from_slice(bytes)?;
        let raw = BASE64
            .decode(record.message.as_bytes())
            .map_err(|e| Error::Parse(format!("Bad message encoding: {}", e)))?;
        let message = if raw.is_empty() {
            Message::empty()
        } else {
            Message::from_bytes(raw)?
        };
        Ok((record, message))
    }
}

/// A claimed item
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub message: Message,
    pub metadata: MessageData,
    pub enqueued_at: DateTime<Utc>,
    /// Failed deliveries so far
    pub attempts: u32,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub shunted: u64,
}

/// A named durable queue
pub struct Switchboard {
    name: String,
    storage: Arc<dyn FileStorage>,
    retry: RetryPolicy,
    /// Claim file per item claimed through this switchboard
    claims: Mutex<HashMap<QueueItemId, String>>,
}

impl Switchboard {
    pub fn new(name: impl Into<String>, storage: Arc<dyn FileStorage>, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            storage,
            retry,
            claims: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn dir(&self) -> String {
        format!("queue/{}", self.name)
    }

    fn path(&self, file: &str) -> String {
        format!("queue/{}/{}", self.name, file)
    }

    fn bad_path(&self, stem: &str) -> String {
        format!("queue/{}/{}+{}{}", queues::BAD, self.name, stem, SHUNTED_EXT)
    }

    /// Persist a message; returns once the record is durable
    pub async fn enqueue(
        &self,
        message: &Message,
        mut metadata: MessageData,
        extras: Map<String, Value>,
    ) -> Result<QueueItemId> {
        metadata.extend(extras);

        let now = Utc::now();
        let record = QueueRecord {
            id: Uuid::now_v7(),
            queue: self.name.clone(),
            enqueued_at: now,
            scheduled_at: now,
            attempts: 0,
            last_error: None,
            message: BASE64.encode(message.raw()),
            metadata,
        };

        self.write_pending(&record).await?;

        debug!(queue = %self.name, item_id = %record.id, "Enqueued item");

        Ok(record.id)
    }

    async fn write_pending(&self, record: &QueueRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        let path = self.path(&format!("{}{}", record.stem(), PENDING_EXT));
        self.storage.store(&path, &bytes).await?;
        Ok(())
    }

    /// Claim the oldest due item, if any
    pub async fn dequeue(&self) -> Result<Option<QueueItem>> {
        let mut pending: Vec<String> = self
            .storage
            .list(&self.dir())
            .await?
            .into_iter()
            .filter(|name| name.ends_with(PENDING_EXT))
            .collect();
        pending.sort();

        let now_micros = Utc::now().timestamp_micros();

        for file in pending {
            let stem = &file[..file.len() - PENDING_EXT.len()];
            let due = stem
                .split('+')
                .next()
                .and_then(|s| s.parse::<i64>().ok())
                .map(|scheduled| scheduled <= now_micros)
                .unwrap_or(true);
            if !due {
                // Names sort by schedule time
                break;
            }

            let claim = format!("{}@{}{}", stem, Utc::now().timestamp_millis(), CLAIMED_EXT);
            match self.storage.rename(&self.path(&file), &self.path(&claim)).await {
                Ok(()) => {}
                // Another runner won this one
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }

            let bytes = self.storage.read(&self.path(&claim)).await?;
            match QueueRecord::decode(&bytes) {
                Ok((record, message)) => {
                    self.claims.lock().await.insert(record.id, claim);
                    debug!(queue = %self.name, item_id = %record.id, "Dequeued item");
                    return Ok(Some(QueueItem {
                        id: record.id,
                        message,
                        metadata: record.metadata,
                        enqueued_at: record.enqueued_at,
                        attempts: record.attempts,
                    }));
                }
                Err(e) => {
                    error!(queue = %self.name, file = %claim, error = %e, "Unreadable queue record, shunting");
                    self.storage
                        .rename(&self.path(&claim), &self.bad_path(stem))
                        .await?;
                }
            }
        }

        Ok(None)
    }

    async fn take_claim(&self, id: QueueItemId) -> Result<String> {
        self.claims
            .lock()
            .await
            .remove(&id)
            .ok_or_else(|| Error::Queue(format!("Item {} is not claimed on {}", id, self.name)))
    }

    /// Drop a successfully processed item
    pub async fn finish(&self, id: QueueItemId) -> Result<()> {
        let claim = self.take_claim(id).await?;
        match self.storage.delete(&self.path(&claim)).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!(queue = %self.name, item_id = %id, "Finished item");
        Ok(())
    }

    /// Put a claimed item back after a transient failure, or shunt it once
    /// it has used up its attempts
    pub async fn retry(&self, id: QueueItemId, reason: &str) -> Result<()> {
        let claim = self.take_claim(id).await?;
        let bytes = self.storage.read(&self.path(&claim)).await?;
        let (mut record, _) = QueueRecord::decode(&bytes)?;
        let stem = claim_stem(&claim).to_string();

        record.attempts += 1;
        record.last_error = Some(reason.to_string());

        if record.attempts >= self.retry.max_attempts {
            error!(
                queue = %self.name,
                item_id = %id,
                attempts = record.attempts,
                error = %reason,
                "Item exceeded max attempts"
            );
            return self.move_to_bad(&record, &claim, &stem).await;
        }

        let delay = self.retry.backoff(record.attempts);
        record.scheduled_at = Utc::now() + delay;
        self.write_pending(&record).await?;
        self.storage.delete(&self.path(&claim)).await?;

        warn!(
            queue = %self.name,
            item_id = %id,
            attempts = record.attempts,
            retry_at = %record.scheduled_at,
            error = %reason,
            "Item scheduled for retry"
        );

        Ok(())
    }

    /// Move a claimed item to the bad queue with the error attached
    pub async fn shunt(&self, id: QueueItemId, reason: &str) -> Result<()> {
        let claim = self.take_claim(id).await?;
        let stem = claim_stem(&claim).to_string();
        let bytes = self.storage.read(&self.path(&claim)).await?;

        match QueueRecord::decode(&bytes) {
            Ok((mut record, _)) => {
                record.last_error = Some(reason.to_string());
                error!(queue = %self.name, item_id = %id, error = %reason, "Shunting queue item");
                self.move_to_bad(&record, &claim, &stem).await
            }
            Err(_) => {
                error!(queue = %self.name, item_id = %id, error = %reason, "Shunting unreadable queue item");
                self.storage
                    .rename(&self.path(&claim), &self.bad_path(&stem))
                    .await
            }
        }
    }

    async fn move_to_bad(&self, record: &QueueRecord, claim: &str, stem: &str) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.storage.store(&self.bad_path(stem), &bytes).await?;
        self.storage.delete(&self.path(claim)).await
    }

    /// Return abandoned claims to the queue
    ///
    /// With `stale_after` set only claims older than that are recovered;
    /// `None` recovers every claim, which is only safe before runners start.
    pub async fn recover(&self, stale_after: Option<std::time::Duration>) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let held: Vec<String> = self.claims.lock().await.values().cloned().collect();
        let mut recovered = 0;

        for file in self.storage.list(&self.dir()).await? {
            if !file.ends_with(CLAIMED_EXT) || held.contains(&file) {
                continue;
            }

            let claimed_at = file[..file.len() - CLAIMED_EXT.len()]
                .rsplit_once('@')
                .and_then(|(_, millis)| millis.parse::<i64>().ok())
                .unwrap_or(0);

            if let Some(stale_after) = stale_after {
                if now - claimed_at < stale_after.as_millis() as i64 {
                    continue;
                }
            }

            let pending = format!("{}{}", claim_stem(&file), PENDING_EXT);
            match self.storage.rename(&self.path(&file), &self.path(&pending)).await {
                Ok(()) => recovered += 1,
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if recovered > 0 {
            info!(queue = %self.name, recovered, "Recovered abandoned claims");
        }

        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        for file in self.storage.list(&self.dir()).await? {
            if file.ends_with(PENDING_EXT) {
                stats.pending += 1;
            } else if file.ends_with(CLAIMED_EXT) {
                stats.claimed += 1;
            }
        }

        let prefix = format!("{}+", self.name);
        stats.shunted = self
            .storage
            .list(&format!("queue/{}", queues::BAD))
            .await?
            .iter()
            .filter(|file| file.starts_with(&prefix) && file.ends_with(SHUNTED_EXT))
            .count() as u64;

        Ok(stats)
    }
}

/// `{stem}@{millis}.bak` -> `{stem}`
fn claim_stem(claim: &str) -> &str {
    let base = claim.strip_suffix(CLAIMED_EXT).unwrap_or(claim);
    base.rsplit_once('@').map(|(stem, _)| stem).unwrap_or(base)
}
