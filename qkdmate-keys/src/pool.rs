//! Thread-safe pool of single-use quantum keys
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use crate::key_types::{KeyId, PoolConfig, PoolSnapshot, PoolStatus, QuantumKey};
use crate::source::KeySource;
use chrono::{DateTime, Utc};
use qkdmate_client::DeliveredKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct PoolState {
    available: HashMap<KeyId, QuantumKey>,
    used: HashMap<KeyId, QuantumKey>,
}

struct MaintenanceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Pool of single-use quantum keys for one node
///
/// Holds two disjoint sets, available and used; a key moves from the first
/// to the second exactly once and is eventually evicted by expiry. All
/// state mutations happen under one pool-wide lock; network fetches for
/// refill run before that lock is taken.
pub struct KeyPool {
    config: PoolConfig,
    source: Arc<dyn KeySource>,
    state: Mutex<PoolState>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl KeyPool {
    /// Create a pool, reloading any persisted snapshot best-effort
    pub async fn new(config: PoolConfig, source: Arc<dyn KeySource>) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            source,
            state: Mutex::new(PoolState::default()),
            maintenance: Mutex::new(None),
        });
        pool.load_from_storage().await;
        let status = pool.status().await;
        info!(
            node = %pool.config.node_id,
            available = status.available_keys,
            min = pool.config.min_keys,
            max = pool.config.max_keys,
            "Key pool initialized"
        );
        pool
    }

    /// Take the oldest available key out of the pool, refilling first if
    /// the pool is empty
    ///
    /// Consumption is strict FIFO by creation time, which bounds the age of
    /// material in use. An empty pool after the inline refill attempt is a
    /// definite exhaustion failure, not retried here.
    pub async fn acquire_fresh_key(&self) -> KeyResult<QuantumKey> {
        let empty = self.state.lock().await.available.is_empty();
        if empty {
            warn!(node = %self.config.node_id, "Key pool empty, refilling inline");
            if let Err(e) = self.refill(None).await {
                warn!(error = %e, "Inline refill failed");
            }
        }

        let mut state = self.state.lock().await;
        let oldest = state
            .available
            .iter()
            .min_by_key(|(_, key)| key.created_at)
            .map(|(id, _)| id.clone());
        let key_id = match oldest {
            Some(id) => id,
            None => {
                return Err(KeyError::Exhausted(format!(
                    "No quantum keys available for node {}",
                    self.config.node_id
                )))
            }
        };
        let mut key = match state.available.remove(&key_id) {
            Some(key) => key,
            None => {
                return Err(KeyError::Exhausted(format!(
                    "No quantum keys available for node {}",
                    self.config.node_id
                )))
            }
        };
        key.used_at = Some(Utc::now());
        key.is_used = true;
        state.used.insert(key_id.clone(), key.clone());
        info!(key_id = %key_id, "Quantum key consumed");
        Ok(key)
    }

    /// Top the pool up when it is below the minimum threshold
    ///
    /// Requests `max_keys - available` keys (or `target` when given) and
    /// inserts the delivery capped at capacity. The network fetch happens
    /// before the pool lock is re-acquired so slow KMEs do not block
    /// readers. Returns the number of keys added.
    pub async fn refill(&self, target: Option<usize>) -> KeyResult<usize> {
        let deficit = {
            let state = self.state.lock().await;
            let available = state.available.len();
            if available >= self.config.min_keys {
                return Ok(0);
            }
            let room = self.config.max_keys - available;
            target.map_or(room, |t| t.min(room))
        };
        if deficit == 0 {
            return Ok(0);
        }

        info!(count = deficit, "Requesting quantum keys from KME");
        let delivered = self.source.fetch_new(deficit).await?;
        let added = self.insert_delivered(delivered).await;
        Ok(added)
    }

    /// Unconditionally fetch `count` keys (defaults to the pool capacity),
    /// regardless of the threshold
    pub async fn force_refresh(&self, count: Option<usize>) -> KeyResult<usize> {
        let count = count.unwrap_or(self.config.max_keys);
        info!(count, "Forced key pool refresh");
        let delivered = self.source.fetch_new(count).await?;
        let added = self.insert_delivered(delivered).await;
        Ok(added)
    }

    /// Slave-side import: retrieve keys issued to the partner by id and
    /// add them to the available set
    pub async fn retrieve_keys(&self, key_ids: &[String]) -> KeyResult<usize> {
        if key_ids.is_empty() {
            return Err(KeyError::Validation(
                "No key identifiers to retrieve".to_string(),
            ));
        }
        let delivered = self.source.fetch_by_ids(key_ids).await?;
        let added = self.insert_delivered(delivered).await;
        Ok(added)
    }

    async fn insert_delivered(&self, delivered: Vec<DeliveredKey>) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut added = 0;
        for (index, key) in delivered.into_iter().enumerate() {
            if state.available.len() >= self.config.max_keys {
                warn!("Key pool at capacity, discarding surplus delivery");
                break;
            }
            let key_id = key.key_id.unwrap_or_else(|| {
                synthesize_key_id(&self.config.node_id, now, index, &key.material)
            });
            if state.available.contains_key(&key_id) || state.used.contains_key(&key_id) {
                debug!(key_id = %key_id, "Skipping duplicate key delivery");
                continue;
            }
            state.available.insert(
                key_id.clone(),
                QuantumKey {
                    key_id,
                    key_data: key.material,
                    created_at: now,
                    used_at: None,
                    partner: self.config.partner_id.clone(),
                    is_used: false,
                },
            );
            added += 1;
        }
        if added > 0 {
            info!(added, available = state.available.len(), "Added quantum keys to pool");
        }
        added
    }

    /// Evict available keys older than `max_age` by creation time and used
    /// keys older than `max_age` by use time; the two sets age independently
    pub async fn expire(&self, max_age: chrono::Duration) -> (usize, usize) {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock().await;

        let before_available = state.available.len();
        state.available.retain(|_, key| key.created_at >= cutoff);
        let evicted_available = before_available - state.available.len();

        let before_used = state.used.len();
        state
            .used
            .retain(|_, key| key.used_at.map_or(true, |used_at| used_at >= cutoff));
        let evicted_used = before_used - state.used.len();

        if evicted_available > 0 || evicted_used > 0 {
            info!(evicted_available, evicted_used, "Expired stale quantum keys");
        }
        (evicted_available, evicted_used)
    }

    /// Look a key up by id in the available or used set
    ///
    /// Falling through to the used set lets a resent envelope still
    /// decrypt, at the cost of strict one-time-use; see DESIGN.md.
    pub async fn find_key(&self, key_id: &str) -> Option<QuantumKey> {
        let state = self.state.lock().await;
        state
            .available
            .get(key_id)
            .or_else(|| state.used.get(key_id))
            .cloned()
    }

    /// Move a key to the used set; no-op when it already is there
    pub async fn mark_used(&self, key_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(mut key) = state.available.remove(key_id) {
            key.used_at = Some(Utc::now());
            key.is_used = true;
            state.used.insert(key_id.to_string(), key);
            debug!(key_id, "Key marked as used");
        }
    }

    /// Current pool counters
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let oldest_key_age_secs = state
            .available
            .values()
            .map(|key| key.created_at)
            .min()
            .map(|created| (Utc::now() - created).num_seconds());
        PoolStatus {
            node_id: self.config.node_id.clone(),
            available_keys: state.available.len(),
            used_keys: state.used.len(),
            min_threshold: self.config.min_keys,
            max_capacity: self.config.max_keys,
            oldest_key_age_secs,
        }
    }

    /// Write both key sets to the snapshot file, if one is configured
    pub async fn persist(&self) -> KeyResult<()> {
        let path = match &self.config.storage_path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };
        let snapshot = {
            let state = self.state.lock().await;
            PoolSnapshot {
                key_pool: state.available.clone(),
                used_keys: state.used.clone(),
                saved_at: Utc::now(),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "Key pool persisted");
        Ok(())
    }

    /// Best-effort reload: a missing or corrupt snapshot leaves the pool
    /// empty rather than failing startup
    async fn load_from_storage(&self) {
        let path = match &self.config.storage_path {
            Some(path) => path.clone(),
            None => return,
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to read pool snapshot");
                }
                return;
            }
        };
        let snapshot: PoolSnapshot = match serde_json::from_str(&content) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt pool snapshot, starting empty");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.available = snapshot.key_pool;
        state.used = snapshot.used_keys;

        // Re-establish the invariants after an untrusted reload: no id in
        // both sets, available capped at capacity (oldest kept).
        let duplicates: Vec<KeyId> = state
            .available
            .keys()
            .filter(|id| state.used.contains_key(*id))
            .cloned()
            .collect();
        for id in duplicates {
            state.available.remove(&id);
        }
        if state.available.len() > self.config.max_keys {
            let mut by_age: Vec<(KeyId, DateTime<Utc>)> = state
                .available
                .iter()
                .map(|(id, key)| (id.clone(), key.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);
            for (id, _) in by_age.into_iter().skip(self.config.max_keys) {
                state.available.remove(&id);
            }
        }

        info!(loaded = state.available.len(), "Key pool loaded from storage");
    }

    /// One maintenance cycle: refill, expire, persist
    ///
    /// Failures are logged and do not stop the loop; the next cycle gets
    /// another chance.
    pub async fn run_maintenance_once(&self) {
        if let Err(e) = self.refill(None).await {
            warn!(error = %e, "Maintenance refill failed");
        }
        self.expire(chrono::Duration::hours(self.config.max_key_age_hours))
            .await;
        if let Err(e) = self.persist().await {
            warn!(error = %e, "Maintenance persistence failed");
        }
    }

    /// Start the periodic maintenance task; no-op if already running
    pub async fn start_maintenance(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.maintenance.lock().await;
        if guard.is_some() {
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let pool = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.run_maintenance_once().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        });
        *guard = Some(MaintenanceHandle { stop, task });
        info!(interval_secs = interval.as_secs(), "Pool maintenance started");
    }

    /// Signal the maintenance task to stop and wait for it, bounded
    pub async fn stop_maintenance(&self) {
        let handle = self.maintenance.lock().await.take();
        if let Some(MaintenanceHandle { stop, task }) = handle {
            let _ = stop.send(true);
            if tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("Maintenance task did not stop within 5s");
            } else {
                info!("Pool maintenance stopped");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn inject_for_test(&self, key: QuantumKey) {
        let mut state = self.state.lock().await;
        state.available.insert(key.key_id.clone(), key);
    }
}

/// Locally unique id for key material delivered without one: hash of the
/// node, delivery time, index within the batch, and the material itself
fn synthesize_key_id(
    node_id: &str,
    timestamp: DateTime<Utc>,
    index: usize,
    material: &[u8],
) -> KeyId {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(material);
    hex::encode(hasher.finalize())[..16].to_string()
}
