use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
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

/// Ledger whose acceptance is steerable per test and which counts every
/// publish attempt.
struct SteerableLedger {
    accept: Mutex<bool>,
    calls: AtomicUsize,
}

impl SteerableLedger {
    fn new(accept: bool) -> Self {
        Self {
            accept: Mutex::new(accept),
            calls: AtomicUsize::new(0),
        }
    }

    fn set_accept(&self, accept: bool) {
        *self.accept.lock() = accept;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerPublisher for SteerableLedger {
    async fn publish(&self, payload: &serde_json::Value) -> Result<String, TillError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.accept.lock() {
            Ok(content_ref(payload))
        } else {
            Err(TillError::Validation("ledger rejected payload".into()))
        }
    }
}

/// Content-addressed reference: identical payloads map to identical refs,
/// which is what makes resubmission a no-op at the ledger boundary.
fn content_ref(payload: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    format!("bafy{}", hex::encode(&Sha256::digest(&bytes)[..8]))
}

/// Opens an instance with the background reconciler already stopped so every
/// drain in the test is an explicit `sync_now`.
async fn open_deterministic(
    dir: &std::path::Path,
    ledger: Arc<SteerableLedger>,
) -> TillInstance {
    let till = TillInstance::open(
        TillConfig::new("biz-1", [7u8; 32])
            .with_reconcile_interval_ms(3_600_000)
            .with_remote_timeout_ms(500)
            .with_backoff(1, 2, 0.0),
        dir,
        Remotes {
            identity: Arc::new(StaticIdentity),
            authority: Arc::new(StaticAuthority),
            ledger,
        },
    )
    .expect("open");
    till.shutdown().await.expect("stop background task");
    till.set_online(true);
    till
}

fn order_op(entity_key: &str) -> Operation {
    Operation {
        kind: OperationKind::Create,
        entity_type: EntityType::Order,
        entity_key: entity_key.into(),
        payload: serde_json::json!({"entity": entity_key, "total": 1250}),
    }
}

async fn wait_for_backoff() {
    // Backoff base is 1-2ms in these tests; 20ms clears it with margin.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

#[tokio::test]
async fn three_strikes_then_operator_action_is_required() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SteerableLedger::new(false));
    let till = open_deterministic(dir.path(), Arc::clone(&ledger)).await;

    let item = till.enqueue(order_op("order-1")).expect("enqueue");

    for expected_retries in 1..=3u32 {
        wait_for_backoff().await;
        let report = till.sync_now().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        let item = till.queue_item(&item.id).expect("item");
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, expected_retries);
        assert!(item.last_error.is_some());
    }
    assert_eq!(ledger.calls(), 3);

    // No fourth automatic attempt, no matter how often the reconciler runs.
    for _ in 0..5 {
        wait_for_backoff().await;
        let report = till.sync_now().await;
        assert_eq!(report.attempted, 0);
    }
    assert_eq!(ledger.calls(), 3);
    let stuck = till.queue_item(&item.id).expect("item");
    assert_eq!(stuck.status, QueueStatus::Failed);
    assert_eq!(stuck.retry_count, 3);

    // Explicit operator retry gets exactly one more attempt.
    ledger.set_accept(true);
    till.retry(&item.id).expect("operator retry");
    let report = till.sync_now().await;
    assert_eq!(report.completed, 1);
    assert_eq!(ledger.calls(), 4);
    let done = till.queue_item(&item.id).expect("item");
    assert_eq!(done.status, QueueStatus::Completed);
    assert!(done.content_ref.is_some());
}

#[tokio::test]
async fn retry_all_requeues_only_failures_and_clear_completed_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SteerableLedger::new(true));
    let till = open_deterministic(dir.path(), Arc::clone(&ledger)).await;

    let good = till.enqueue(order_op("order-good")).expect("enqueue");
    till.sync_now().await;
    assert_eq!(
        till.queue_item(&good.id).expect("item").status,
        QueueStatus::Completed
    );

    ledger.set_accept(false);
    let bad_a = till.enqueue(order_op("order-bad-a")).expect("enqueue");
    let bad_b = till.enqueue(order_op("order-bad-b")).expect("enqueue");
    for _ in 0..3 {
        wait_for_backoff().await;
        till.sync_now().await;
    }
    assert!(till.queue_item(&bad_a.id).expect("item").exhausted());
    assert!(till.queue_item(&bad_b.id).expect("item").exhausted());

    let moved = till.retry_all().expect("retry all");
    assert_eq!(moved, 2);
    for id in [&bad_a.id, &bad_b.id] {
        let item = till.queue_item(id).expect("item");
        assert_eq!(item.status, QueueStatus::Pending);
        // Failure history stays visible.
        assert_eq!(item.retry_count, 3);
    }
    assert_eq!(
        till.queue_item(&good.id).expect("item").status,
        QueueStatus::Completed
    );

    ledger.set_accept(true);
    till.sync_now().await;
    assert_eq!(till.list_by_status(QueueStatus::Completed).len(), 3);

    assert_eq!(till.clear_completed().expect("purge"), 3);
    assert_eq!(till.clear_completed().expect("noop"), 0);
    assert!(till.queue_items().is_empty());
}

#[tokio::test]
async fn removing_items_is_limited_to_pending_and_failed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(SteerableLedger::new(true));
    let till = open_deterministic(dir.path(), Arc::clone(&ledger)).await;

    let pending = till.enqueue(order_op("order-1")).expect("enqueue");
    till.remove(&pending.id).expect("removable while pending");

    let completed = till.enqueue(order_op("order-2")).expect("enqueue");
    till.sync_now().await;
    let err = till.remove(&completed.id).expect_err("completed");
    assert_eq!(err.code_str(), "validation");

    let err = till.remove("no-such-id").expect_err("unknown id");
    assert_eq!(err.code_str(), "queue_item_not_found");
}
