use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use till::remote::{LoginGrant, TokenGrant};
use till::{
    Credentials, EntityType, IdentityProvider, LedgerPublisher, Operation, OperationKind,
    QueueStatus, Remotes, Role, RoleAuthority, TillConfig, TillError, TillInstance,
};

struct StaticIdentity;

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, TillError> {
        Ok(LoginGrant {
            account_id: credentials.identifier.clone(),
            verified_address: "0xabc".into(),
            token: "tok-1".into(),
            expires_at_micros: till::now_micros() + 3_600_000_000,
            device_authorized: true,
        })
    }

    async fn refresh(&self, _token: &str) -> Result<TokenGrant, TillError> {
        Ok(TokenGrant {
            token: "tok-2".into(),
            expires_at_micros: till::now_micros() + 3_600_000_000,
        })
    }
}

struct StaticAuthority;

#[async_trait]
impl RoleAuthority for StaticAuthority {
    async fn role_of(&self, _account_id: &str) -> Result<Role, TillError> {
        Ok(Role::Admin)
    }

    async fn check_permission(
        &self,
        _account_id: &str,
        _resource: &str,
        _action: &str,
    ) -> Result<bool, TillError> {
        Ok(true)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum LedgerMode {
    Accept,
    RejectEntity,
    Stall,
}

/// Ledger that records the order of accepted publishes and can reject one
/// entity's payloads or stall past the remote timeout.
struct ScriptedLedger {
    mode: Mutex<LedgerMode>,
    reject_entity: String,
    accepted: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedLedger {
    fn new(mode: LedgerMode, reject_entity: &str) -> Self {
        Self {
            mode: Mutex::new(mode),
            reject_entity: reject_entity.to_string(),
            accepted: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_mode(&self, mode: LedgerMode) {
        *self.mode.lock() = mode;
    }

    fn accepted(&self) -> Vec<String> {
        self.accepted.lock().clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerPublisher for ScriptedLedger {
    async fn publish(&self, payload: &serde_json::Value) -> Result<String, TillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock();
        if mode == LedgerMode::Stall {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        let entity = payload["entity"].as_str().unwrap_or_default().to_string();
        if mode == LedgerMode::RejectEntity && entity == self.reject_entity {
            return Err(TillError::Validation("ledger rejected payload".into()));
        }
        self.accepted.lock().push(entity.clone());
        use sha2::{Digest, Sha256};
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        Ok(format!("bafy{}", hex::encode(&Sha256::digest(&bytes)[..8])))
    }
}

fn config() -> TillConfig {
    TillConfig::new("biz-1", [7u8; 32])
        .with_reconcile_interval_ms(3_600_000)
        .with_remote_timeout_ms(150)
        .with_backoff(1, 2, 0.0)
}

fn remotes(ledger: Arc<ScriptedLedger>) -> Remotes {
    Remotes {
        identity: Arc::new(StaticIdentity),
        authority: Arc::new(StaticAuthority),
        ledger,
    }
}

fn op(entity_key: &str, note: &str) -> Operation {
    Operation {
        kind: OperationKind::Update,
        entity_type: EntityType::Order,
        entity_key: entity_key.into(),
        payload: serde_json::json!({"entity": entity_key, "note": note}),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn a_blocked_entity_never_lets_later_items_skip_ahead() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(ScriptedLedger::new(LedgerMode::RejectEntity, "order-a"));
    let till = TillInstance::open(config(), dir.path(), remotes(Arc::clone(&ledger)))
        .expect("open");
    till.shutdown().await.expect("stop background task");
    till.set_online(true);

    let a1 = till.enqueue(op("order-a", "first")).expect("enqueue");
    let a2 = till.enqueue(op("order-a", "second")).expect("enqueue");
    let b1 = till.enqueue(op("order-b", "first")).expect("enqueue");

    // First pass: order-a's head fails, order-b completes.
    till.sync_now().await;
    assert_eq!(
        till.queue_item(&b1.id).expect("item").status,
        QueueStatus::Completed
    );

    // Exhaust order-a's head. Its second item must stay pending throughout.
    for _ in 0..2 {
        settle().await;
        till.sync_now().await;
    }
    assert!(till.queue_item(&a1.id).expect("item").exhausted());
    assert_eq!(
        till.queue_item(&a2.id).expect("item").status,
        QueueStatus::Pending
    );

    // Even with retries exhausted, further passes never publish a2.
    settle().await;
    let report = till.sync_now().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(ledger.accepted(), vec!["order-b".to_string()]);

    // Operator unblocks the head; order strictly a1 then a2.
    ledger.set_mode(LedgerMode::Accept);
    till.retry(&a1.id).expect("retry");
    till.sync_now().await;
    till.sync_now().await;
    assert_eq!(
        ledger.accepted(),
        vec![
            "order-b".to_string(),
            "order-a".to_string(),
            "order-a".to_string()
        ]
    );
    let a1 = till.queue_item(&a1.id).expect("item");
    let a2 = till.queue_item(&a2.id).expect("item");
    assert_eq!(a1.status, QueueStatus::Completed);
    assert_eq!(a2.status, QueueStatus::Completed);
    assert!(a1.content_ref.is_some());
}

#[tokio::test]
async fn a_publish_timeout_is_treated_as_going_offline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(ScriptedLedger::new(LedgerMode::Stall, ""));
    let till = TillInstance::open(config(), dir.path(), remotes(Arc::clone(&ledger)))
        .expect("open");
    till.shutdown().await.expect("stop background task");
    till.set_online(true);

    let item = till.enqueue(op("order-1", "stalled")).expect("enqueue");
    let report = till.sync_now().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.deferred, 1);

    // No retry consumed, nothing failed: the item is simply pending again.
    let item = till.queue_item(&item.id).expect("item");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.retry_count, 0);
    assert_eq!(ledger.calls(), 1);

    // Once the ledger responds, the same item goes through.
    ledger.set_mode(LedgerMode::Accept);
    till.sync_now().await;
    assert_eq!(
        till.queue_item(&item.id).expect("item").status,
        QueueStatus::Completed
    );
}

#[tokio::test]
async fn completed_work_survives_restart_and_is_never_republished() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(ScriptedLedger::new(LedgerMode::Accept, ""));

    let (done_id, pending_id, content_ref) = {
        let till = TillInstance::open(config(), dir.path(), remotes(Arc::clone(&ledger)))
            .expect("open");
        till.shutdown().await.expect("stop background task");
        till.set_online(true);

        let done = till.enqueue(op("order-1", "ships")).expect("enqueue");
        till.sync_now().await;
        let done = till.queue_item(&done.id).expect("item");
        assert_eq!(done.status, QueueStatus::Completed);

        till.set_online(false);
        let pending = till.enqueue(op("order-2", "waits")).expect("enqueue");
        (done.id, pending.id, done.content_ref.expect("content ref"))
    };
    let calls_before = ledger.calls();

    let till = TillInstance::open(config(), dir.path(), remotes(Arc::clone(&ledger)))
        .expect("reopen");
    till.shutdown().await.expect("stop background task");
    till.set_online(true);

    let done = till.queue_item(&done_id).expect("item");
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.content_ref.as_deref(), Some(content_ref.as_str()));

    till.sync_now().await;
    assert_eq!(
        till.queue_item(&pending_id).expect("item").status,
        QueueStatus::Completed
    );
    // Only the pending item was published after the restart.
    assert_eq!(ledger.calls(), calls_before + 1);
}

#[tokio::test]
async fn regained_connectivity_wakes_the_background_reconciler() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(ScriptedLedger::new(LedgerMode::Accept, ""));
    let till = TillInstance::open(config(), dir.path(), remotes(Arc::clone(&ledger)))
        .expect("open");

    let item = till.enqueue(op("order-1", "queued offline")).expect("enqueue");
    till.set_online(true);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if till.queue_item(&item.id).expect("item").status == QueueStatus::Completed {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background reconciler never drained the queue"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    till.shutdown().await.expect("shutdown");
}
