pub mod config;
pub mod connectivity;
pub mod error;
pub mod permission;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod store;

pub use crate::config::TillConfig;
pub use crate::connectivity::{ConnectivityProbe, ConnectivitySignal};
pub use crate::error::{TillError, TillErrorCode};
pub use crate::permission::{Action, CriticalAction, PermissionContext, PermissionEngine};
pub use crate::reconcile::SyncReport;
pub use crate::remote::{Credentials, IdentityProvider, LedgerPublisher, RoleAuthority};
pub use crate::session::{Role, SessionRecord, Validity};
pub use crate::store::queue::{EntityType, Operation, OperationKind, QueueItem, QueueStatus};
pub use crate::store::{CatalogEntry, LocalOverride, ScanOutcome};

use crate::reconcile::{BackoffPolicy, Reconciler, ReconcilerHandle};
use crate::session::SessionManager;
use crate::session::store::EncryptedSessionStore;
use crate::store::LocalStore;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Creates a directory with restrictive permissions (0o700 on Unix) so the
/// node's local data is not readable by other users on shared hardware.
fn create_private_dir_all(path: &Path) -> Result<(), TillError> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;
        if !path.exists() {
            DirBuilder::new().recursive(true).mode(0o700).create(path)?;
        }
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// The external collaborators a till node is wired to.
#[derive(Clone)]
pub struct Remotes {
    pub identity: Arc<dyn IdentityProvider>,
    pub authority: Arc<dyn RoleAuthority>,
    pub ledger: Arc<dyn LedgerPublisher>,
}

/// One point-of-sale node's embedded core.
///
/// Owns the encrypted session cache, the permission engine, the durable
/// local store with its sync queue, and the background reconciler. Construct
/// with [`open`](Self::open) (inside a tokio runtime), drive connectivity
/// through [`set_online`](Self::set_online), and finish with
/// [`shutdown`](Self::shutdown).
pub struct TillInstance {
    config: TillConfig,
    dir: PathBuf,
    sessions: Arc<SessionManager>,
    permissions: PermissionEngine,
    store: Arc<LocalStore>,
    connectivity: Arc<ConnectivitySignal>,
    reconciler: Arc<Reconciler>,
    task: Mutex<Option<ReconcilerHandle>>,
}

impl TillInstance {
    pub fn open(config: TillConfig, dir: &Path, remotes: Remotes) -> Result<Self, TillError> {
        config.validate()?;
        create_private_dir_all(dir)?;
        info!(
            business_id = %config.business_id,
            max_retries = config.max_retries,
            remote_timeout_ms = config.remote_timeout_ms,
            reconcile_interval_ms = config.reconcile_interval_ms,
            backoff_base_ms = config.backoff_base_ms,
            backoff_cap_ms = config.backoff_cap_ms,
            store_hmac_enabled = config.store_hmac_key.is_some(),
            "till config"
        );

        let remote_timeout = Duration::from_millis(config.remote_timeout_ms);
        // Connectivity starts pessimistic; the embedding layer reports the
        // first real transition through the signal.
        let connectivity = Arc::new(ConnectivitySignal::new(false));
        let store = Arc::new(LocalStore::open(
            dir,
            config.business_id.clone(),
            config.max_retries,
            config.store_hmac_key.clone(),
        )?);
        let sessions = Arc::new(SessionManager::new(
            EncryptedSessionStore::new(dir, config.session_encryption_key.clone()),
            Arc::clone(&remotes.identity),
            Arc::clone(&remotes.authority),
            remote_timeout,
        ));
        let permissions = PermissionEngine::new(
            Arc::clone(&sessions),
            Arc::clone(&remotes.authority),
            Arc::clone(&connectivity) as Arc<dyn ConnectivityProbe>,
            remote_timeout,
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&remotes.ledger),
            Arc::clone(&connectivity),
            remote_timeout,
            BackoffPolicy::from_config(&config),
        ));
        let task = Arc::clone(&reconciler).spawn(config.reconcile_interval_ms);

        Ok(Self {
            config,
            dir: dir.to_path_buf(),
            sessions,
            permissions,
            store,
            connectivity,
            reconciler,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &TillConfig {
        &self.config
    }

    /// Stops the background reconciler. Interrupted publishes are re-tried
    /// on the next open; all store writes are already durable.
    pub async fn shutdown(&self) -> Result<(), TillError> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        info!(business_id = %self.config.business_id, "till instance shut down");
        Ok(())
    }

    // --- connectivity --------------------------------------------------------

    /// Reports a connectivity transition. Going online wakes the reconciler
    /// and kicks off a background session refresh.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
        if online {
            Arc::clone(&self.sessions).refresh_in_background(true);
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    // --- sessions ------------------------------------------------------------

    pub async fn login(&self, credentials: &Credentials) -> Result<SessionRecord, TillError> {
        self.sessions.login(credentials, self.is_online()).await
    }

    pub fn logout(&self) -> Result<(), TillError> {
        self.sessions.logout()
    }

    pub fn validate_session(&self) -> Validity {
        self.sessions.validate(now_micros(), self.is_online())
    }

    pub fn session(&self) -> Option<SessionRecord> {
        self.sessions.snapshot()
    }

    /// Fire-and-forget token refresh; a no-op while offline.
    pub fn refresh_session_in_background(&self) {
        Arc::clone(&self.sessions).refresh_in_background(self.is_online());
    }

    // --- permissions ---------------------------------------------------------

    pub async fn has_permission(
        &self,
        resource: &str,
        action: Action,
        ctx: Option<&PermissionContext>,
    ) -> bool {
        self.permissions.has_permission(resource, action, ctx).await
    }

    pub async fn require_permission(
        &self,
        resource: &str,
        action: Action,
        ctx: Option<&PermissionContext>,
    ) -> Result<(), TillError> {
        self.permissions
            .require_permission(resource, action, ctx)
            .await
    }

    pub fn requires_online_block(&self, action: CriticalAction) -> bool {
        self.permissions.requires_online_block(action)
    }

    // --- catalog, overrides, settings ----------------------------------------

    /// Upserts a shared catalog entry and queues it for reconciliation.
    pub fn upsert_global_entry(&self, entry: CatalogEntry) -> Result<QueueItem, TillError> {
        let entry = self.store.upsert_global_entry(entry)?;
        self.enqueue_payload(
            OperationKind::Update,
            EntityType::CatalogEntry,
            entry.barcode.clone(),
            &entry,
        )
    }

    /// Upserts this business's override and queues it for reconciliation.
    pub fn upsert_local_override(
        &self,
        override_entry: LocalOverride,
    ) -> Result<QueueItem, TillError> {
        let override_entry = self.store.upsert_local_override(override_entry)?;
        self.enqueue_payload(
            OperationKind::Update,
            EntityType::Override,
            override_entry.barcode.clone(),
            &override_entry,
        )
    }

    /// Registers one scanned unit of `barcode` and queues the resulting
    /// override state. Never blocks on missing catalog data.
    pub fn record_scan(&self, barcode: &str) -> Result<ScanOutcome, TillError> {
        let outcome = self.store.record_scan(barcode)?;
        let kind = if outcome.created {
            OperationKind::Create
        } else {
            OperationKind::Update
        };
        self.enqueue_payload(kind, EntityType::Override, barcode.to_string(), &outcome.local)?;
        Ok(outcome)
    }

    pub fn catalog_entry(&self, barcode: &str) -> Option<CatalogEntry> {
        self.store.catalog_entry(barcode)
    }

    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.store.catalog_entries()
    }

    pub fn override_entry(&self, barcode: &str) -> Option<LocalOverride> {
        self.store.override_entry(barcode)
    }

    /// Caches the last-known value of a remotely-sourced fact for offline
    /// fallback (for example the commission rate).
    pub fn remember_setting(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TillError> {
        self.store.remember_setting(key, value)
    }

    pub fn recall_setting(&self, key: &str) -> Option<serde_json::Value> {
        self.store.recall_setting(key)
    }

    // --- sync queue ----------------------------------------------------------

    pub fn enqueue(&self, op: Operation) -> Result<QueueItem, TillError> {
        self.store.enqueue(op)
    }

    pub fn list_by_status(&self, status: QueueStatus) -> Vec<QueueItem> {
        self.store.list_by_status(status)
    }

    pub fn queue_items(&self) -> Vec<QueueItem> {
        self.store.queue_items()
    }

    pub fn queue_item(&self, id: &str) -> Option<QueueItem> {
        self.store.queue_item(id)
    }

    pub fn retry(&self, id: &str) -> Result<QueueItem, TillError> {
        self.store.retry(id)
    }

    pub fn retry_all(&self) -> Result<usize, TillError> {
        self.store.retry_all()
    }

    pub fn remove(&self, id: &str) -> Result<QueueItem, TillError> {
        self.store.remove(id)
    }

    pub fn clear_completed(&self) -> Result<usize, TillError> {
        self.store.clear_completed()
    }

    /// Runs one reconciliation pass immediately. A no-op while offline; the
    /// background task performs the same pass on connectivity changes and on
    /// its timer.
    pub async fn sync_now(&self) -> SyncReport {
        if !self.is_online() {
            return SyncReport::default();
        }
        self.reconciler.drain().await
    }

    fn enqueue_payload<T: serde::Serialize>(
        &self,
        kind: OperationKind,
        entity_type: EntityType,
        entity_key: String,
        payload: &T,
    ) -> Result<QueueItem, TillError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| TillError::Encode(e.to_string()))?;
        self.store.enqueue(Operation {
            kind,
            entity_type,
            entity_key,
            payload,
        })
    }
}
