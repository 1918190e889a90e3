pub mod queue;

use crate::error::TillError;
use crate::store::queue::{Operation, QueueItem, QueueStatus};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};
use zeroize::Zeroizing;

const STORE_FILE: &str = "store.till";
const STORE_HMAC_FILE: &str = "store.till.hmac";

/// Global catalog entry, shared across businesses and keyed by barcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub barcode: String,
    pub name: String,
    #[serde(default)]
    pub brand: Option<String>,
    pub category: String,
    pub unit: String,
    pub verified: bool,
    pub created_at_micros: u64,
    pub updated_at_micros: u64,
}

impl CatalogEntry {
    /// Stand-in entry created when an unknown barcode is scanned; real
    /// details arrive later through catalog sync or operator edits.
    pub fn placeholder(barcode: &str, now_micros: u64) -> Self {
        Self {
            barcode: barcode.to_string(),
            name: format!("Product {barcode}"),
            brand: None,
            category: "uncategorized".into(),
            unit: "unit".into(),
            verified: false,
            created_at_micros: now_micros,
            updated_at_micros: now_micros,
        }
    }
}

/// Business-scoped price/stock override for one catalog entry. At most one
/// exists per (business, barcode) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOverride {
    pub barcode: String,
    pub business_id: String,
    pub price_minor: i64,
    #[serde(default)]
    pub cost_minor: Option<i64>,
    pub stock: i64,
    pub min_stock: i64,
    pub vat_bps: u32,
    pub updated_at_micros: u64,
    #[serde(default)]
    pub last_synced_micros: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub value: serde_json::Value,
    pub updated_at_micros: u64,
}

/// Result of [`LocalStore::record_scan`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub global: CatalogEntry,
    pub local: LocalOverride,
    /// True when the scan created a placeholder override.
    pub created: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    catalog: BTreeMap<String, CatalogEntry>,
    overrides: BTreeMap<String, LocalOverride>,
    queue: Vec<QueueItem>,
    settings: BTreeMap<String, SettingEntry>,
    next_seq: u64,
}

/// Durable single-node store for catalog entries, local overrides, the
/// settings cache and the sync queue.
///
/// Single writer, concurrent readers: every mutation takes the write lock,
/// applies, and persists write-through before returning. The at-rest format
/// is MessagePack, zstd-compressed, with a SHA-256 trailer and an optional
/// HMAC side file; anything unverifiable on open is logged and replaced by
/// an empty state rather than crashing.
pub struct LocalStore {
    dir: PathBuf,
    path: PathBuf,
    hmac_path: PathBuf,
    business_id: String,
    default_max_retries: u32,
    hmac_key: Option<Arc<Zeroizing<Vec<u8>>>>,
    state: RwLock<StoreState>,
}

impl LocalStore {
    pub fn open(
        dir: &Path,
        business_id: impl Into<String>,
        default_max_retries: u32,
        hmac_key: Option<Arc<Zeroizing<Vec<u8>>>>,
    ) -> Result<Self, TillError> {
        let path = dir.join(STORE_FILE);
        let hmac_path = dir.join(STORE_HMAC_FILE);
        let mut state = match load_state(&path, &hmac_path, hmac_key.as_deref()) {
            Ok(Some(state)) => state,
            Ok(None) => StoreState::default(),
            Err(err) => {
                warn!(
                    error = %err,
                    code = err.code_str(),
                    "local store unreadable; starting empty"
                );
                StoreState::default()
            }
        };

        // Anything caught mid-publish by a crash is tried again; the ledger
        // publish is idempotent, so a possibly-committed resubmission is a
        // no-op at the boundary.
        let mut reverted = 0usize;
        for item in &mut state.queue {
            if item.status == QueueStatus::Syncing {
                item.status = QueueStatus::Pending;
                reverted += 1;
            }
        }

        let store = Self {
            dir: dir.to_path_buf(),
            path,
            hmac_path,
            business_id: business_id.into(),
            default_max_retries,
            hmac_key,
            state: RwLock::new(state),
        };
        if reverted > 0 {
            info!(reverted, "interrupted sync items returned to pending");
            let state = store.state.read();
            store.persist(&state)?;
        }
        Ok(store)
    }

    pub fn business_id(&self) -> &str {
        &self.business_id
    }

    // --- catalog + overrides -------------------------------------------------

    /// Idempotent by barcode. The original creation stamp survives repeats.
    pub fn upsert_global_entry(&self, mut entry: CatalogEntry) -> Result<CatalogEntry, TillError> {
        let mut state = self.state.write();
        if let Some(existing) = state.catalog.get(&entry.barcode) {
            entry.created_at_micros = existing.created_at_micros;
        }
        state.catalog.insert(entry.barcode.clone(), entry.clone());
        self.persist(&state)?;
        Ok(entry)
    }

    /// Idempotent by barcode within this store's business.
    pub fn upsert_local_override(
        &self,
        override_entry: LocalOverride,
    ) -> Result<LocalOverride, TillError> {
        if override_entry.business_id != self.business_id {
            return Err(TillError::Validation(format!(
                "override belongs to business '{}', store is scoped to '{}'",
                override_entry.business_id, self.business_id
            )));
        }
        let mut state = self.state.write();
        state
            .overrides
            .insert(override_entry.barcode.clone(), override_entry.clone());
        self.persist(&state)?;
        Ok(override_entry)
    }

    /// Rapid-fire scan path. A missing override becomes a placeholder with
    /// price 0 and stock 1 (scanning never blocks on missing catalog data);
    /// a present one gets its stock incremented by exactly one. The write
    /// lock makes repeated rapid calls lose no updates.
    pub fn record_scan(&self, barcode: &str) -> Result<ScanOutcome, TillError> {
        let now = crate::now_micros();
        let mut state = self.state.write();

        let global = match state.catalog.get(barcode) {
            Some(entry) => entry.clone(),
            None => {
                let entry = CatalogEntry::placeholder(barcode, now);
                state.catalog.insert(barcode.to_string(), entry.clone());
                entry
            }
        };

        let (local, created) = match state.overrides.get_mut(barcode) {
            Some(existing) => {
                existing.stock += 1;
                existing.updated_at_micros = now;
                (existing.clone(), false)
            }
            None => {
                let placeholder = LocalOverride {
                    barcode: barcode.to_string(),
                    business_id: self.business_id.clone(),
                    price_minor: 0,
                    cost_minor: None,
                    stock: 1,
                    min_stock: 0,
                    vat_bps: 0,
                    updated_at_micros: now,
                    last_synced_micros: None,
                };
                state
                    .overrides
                    .insert(barcode.to_string(), placeholder.clone());
                (placeholder, true)
            }
        };

        self.persist(&state)?;
        Ok(ScanOutcome {
            global,
            local,
            created,
        })
    }

    pub fn catalog_entry(&self, barcode: &str) -> Option<CatalogEntry> {
        self.state.read().catalog.get(barcode).cloned()
    }

    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.state.read().catalog.values().cloned().collect()
    }

    pub fn override_entry(&self, barcode: &str) -> Option<LocalOverride> {
        self.state.read().overrides.get(barcode).cloned()
    }

    // --- settings cache ------------------------------------------------------

    /// Caches the last-known value of a remotely-sourced fact (for example a
    /// commission rate) for offline fallback.
    pub fn remember_setting(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TillError> {
        let mut state = self.state.write();
        state.settings.insert(
            key.into(),
            SettingEntry {
                value,
                updated_at_micros: crate::now_micros(),
            },
        );
        self.persist(&state)
    }

    pub fn recall_setting(&self, key: &str) -> Option<serde_json::Value> {
        self.state
            .read()
            .settings
            .get(key)
            .map(|entry| entry.value.clone())
    }

    // --- sync queue ----------------------------------------------------------

    pub fn enqueue(&self, op: Operation) -> Result<QueueItem, TillError> {
        let mut state = self.state.write();
        let seq = state.next_seq;
        state.next_seq += 1;
        let item = QueueItem::new(seq, op, self.default_max_retries, crate::now_micros());
        state.queue.push(item.clone());
        self.persist(&state)?;
        Ok(item)
    }

    pub fn list_by_status(&self, status: QueueStatus) -> Vec<QueueItem> {
        self.state
            .read()
            .queue
            .iter()
            .filter(|item| item.status == status)
            .cloned()
            .collect()
    }

    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.state.read().queue.clone()
    }

    pub fn queue_item(&self, id: &str) -> Option<QueueItem> {
        self.state
            .read()
            .queue
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    pub(crate) fn mark_syncing(&self, id: &str) -> Result<QueueItem, TillError> {
        self.transition(id, |item, now| item.begin_sync(now))
    }

    pub(crate) fn mark_completed(
        &self,
        id: &str,
        content_ref: String,
    ) -> Result<QueueItem, TillError> {
        self.transition(id, move |item, _now| item.complete(content_ref))
    }

    pub(crate) fn mark_failed(&self, id: &str, error: String) -> Result<QueueItem, TillError> {
        self.transition(id, move |item, now| item.fail(error, now))
    }

    pub(crate) fn revert_to_pending(&self, id: &str) -> Result<QueueItem, TillError> {
        self.transition(id, |item, _now| item.revert_to_pending())
    }

    /// Explicit operator retry of one failed item.
    pub fn retry(&self, id: &str) -> Result<QueueItem, TillError> {
        self.transition(id, |item, _now| item.requeue())
    }

    /// Moves every failed item back to pending, preserving each item's
    /// failure history. Completed and syncing items are untouched.
    pub fn retry_all(&self) -> Result<usize, TillError> {
        let mut state = self.state.write();
        let mut moved = 0usize;
        for item in &mut state.queue {
            if item.status == QueueStatus::Failed {
                item.requeue()?;
                moved += 1;
            }
        }
        if moved > 0 {
            self.persist(&state)?;
        }
        Ok(moved)
    }

    /// Irreversible operator removal of one pending or failed item. Syncing
    /// items cannot be removed; completed items leave via
    /// [`clear_completed`](Self::clear_completed).
    pub fn remove(&self, id: &str) -> Result<QueueItem, TillError> {
        let mut state = self.state.write();
        let index = state
            .queue
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| TillError::QueueItemNotFound {
                item_id: id.to_string(),
            })?;
        match state.queue[index].status {
            QueueStatus::Pending | QueueStatus::Failed => {
                let removed = state.queue.remove(index);
                self.persist(&state)?;
                Ok(removed)
            }
            QueueStatus::Syncing => Err(TillError::Validation(format!(
                "queue item '{id}' is syncing and cannot be removed"
            ))),
            QueueStatus::Completed => Err(TillError::Validation(format!(
                "queue item '{id}' is completed; use clear_completed"
            ))),
        }
    }

    /// Purges completed items only. Idempotent.
    pub fn clear_completed(&self) -> Result<usize, TillError> {
        let mut state = self.state.write();
        let before = state.queue.len();
        state.queue.retain(|item| item.status != QueueStatus::Completed);
        let purged = before - state.queue.len();
        if purged > 0 {
            self.persist(&state)?;
        }
        Ok(purged)
    }

    /// Returns the next publishable item per entity, preserving per-entity
    /// creation order.
    ///
    /// An entity whose earliest unresolved item is syncing, or failed with
    /// its retries exhausted, is blocked: none of its later items are
    /// eligible. Failed items below the cap are promoted back to pending
    /// once their backoff delay (from `retry_delay_micros`) has elapsed.
    pub(crate) fn next_sync_batch(
        &self,
        now_micros: u64,
        retry_delay_micros: impl Fn(u32) -> u64,
    ) -> Result<Vec<QueueItem>, TillError> {
        let mut state = self.state.write();
        let mut claimed = HashSet::new();
        let mut batch = Vec::new();
        let mut promoted = false;

        for item in &mut state.queue {
            let key = (item.entity_type, item.entity_key.clone());
            if claimed.contains(&key) {
                continue;
            }
            match item.status {
                // Resolved; the entity's next item may lead.
                QueueStatus::Completed => continue,
                QueueStatus::Syncing => {
                    claimed.insert(key);
                }
                QueueStatus::Pending => {
                    claimed.insert(key);
                    batch.push(item.clone());
                }
                QueueStatus::Failed => {
                    claimed.insert(key);
                    if item.retry_count >= item.max_retries {
                        continue;
                    }
                    let ready_at = item
                        .last_attempt_micros
                        .unwrap_or(0)
                        .saturating_add(retry_delay_micros(item.retry_count));
                    if now_micros >= ready_at {
                        item.requeue()?;
                        promoted = true;
                        batch.push(item.clone());
                    }
                }
            }
        }

        if promoted {
            self.persist(&state)?;
        }
        Ok(batch)
    }

    fn transition(
        &self,
        id: &str,
        apply: impl FnOnce(&mut QueueItem, u64) -> Result<(), TillError>,
    ) -> Result<QueueItem, TillError> {
        let now = crate::now_micros();
        let mut state = self.state.write();
        let item = state
            .queue
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| TillError::QueueItemNotFound {
                item_id: id.to_string(),
            })?;
        apply(item, now)?;
        let snapshot = item.clone();
        self.persist(&state)?;
        Ok(snapshot)
    }

    // --- persistence ---------------------------------------------------------

    fn persist(&self, state: &StoreState) -> Result<(), TillError> {
        let encoded = rmp_serde::to_vec(state).map_err(|e| TillError::Encode(e.to_string()))?;
        let compressed = zstd::stream::encode_all(encoded.as_slice(), 3)?;
        let hash = Sha256::digest(&compressed);
        let mut payload = compressed;
        payload.extend_from_slice(&hash);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&payload)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| TillError::Io(e.error))?;

        if let Some(key) = &self.hmac_key {
            let signature = hmac_hex(key, &payload)?;
            fs::write(&self.hmac_path, signature)?;
            fsync_file(&self.hmac_path)?;
        }
        Ok(())
    }
}

fn load_state(
    path: &Path,
    hmac_path: &Path,
    hmac_key: Option<&Zeroizing<Vec<u8>>>,
) -> Result<Option<StoreState>, TillError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(TillError::Io(err)),
    };
    if let Some(key) = hmac_key {
        let signature = fs::read_to_string(hmac_path).map_err(|_| TillError::StorageCorrupt {
            message: "store signature missing".into(),
        })?;
        verify_hmac(key, &bytes, signature.trim())?;
    }
    if bytes.len() < 32 {
        return Err(TillError::StorageCorrupt {
            message: "store file too small".into(),
        });
    }
    let (compressed, trailer) = bytes.split_at(bytes.len() - 32);
    let actual = Sha256::digest(compressed);
    if actual.as_slice() != trailer {
        return Err(TillError::StorageCorrupt {
            message: "store hash mismatch".into(),
        });
    }
    let decompressed =
        zstd::stream::decode_all(compressed).map_err(|e| TillError::StorageCorrupt {
            message: format!("store decompression failed: {e}"),
        })?;
    rmp_serde::from_slice(&decompressed).map(Some).map_err(|e| {
        TillError::StorageCorrupt {
            message: format!("store decode failed: {e}"),
        }
    })
}

fn hmac_hex(key: &Zeroizing<Vec<u8>>, bytes: &[u8]) -> Result<String, TillError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|e| TillError::InvalidConfig {
            message: format!("invalid store hmac key: {e}"),
        })?;
    mac.update(bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_hmac(
    key: &Zeroizing<Vec<u8>>,
    bytes: &[u8],
    signature: &str,
) -> Result<(), TillError> {
    let expected = hex::decode(signature).map_err(|_| TillError::StorageCorrupt {
        message: "store signature malformed".into(),
    })?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|e| TillError::InvalidConfig {
            message: format!("invalid store hmac key: {e}"),
        })?;
    mac.update(bytes);
    mac.verify_slice(&expected)
        .map_err(|_| TillError::StorageCorrupt {
            message: "store signature mismatch".into(),
        })
}

fn fsync_file(path: &Path) -> Result<(), TillError> {
    let file = fs::File::open(path)?;
    file.sync_all()?;
    Ok(())
}
