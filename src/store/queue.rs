use crate::error::TillError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Failed,
    Completed,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::Pending => write!(f, "pending"),
            QueueStatus::Syncing => write!(f, "syncing"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    CatalogEntry,
    Override,
    Setting,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Order => write!(f, "order"),
            EntityType::CatalogEntry => write!(f, "catalog_entry"),
            EntityType::Override => write!(f, "override"),
            EntityType::Setting => write!(f, "setting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// A mutation waiting to be published to the external ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_key: String,
    pub payload: serde_json::Value,
}

/// One entry of the sync queue.
///
/// Status moves monotonically toward a terminal state: `Completed` is
/// immutable, `retry_count` never exceeds `max_retries`, and items for the
/// same entity are totally ordered by `seq` (assigned at creation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub seq: u64,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub entity_key: String,
    pub payload: serde_json::Value,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at_micros: u64,
    #[serde(default)]
    pub last_attempt_micros: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub content_ref: Option<String>,
}

impl QueueItem {
    pub(crate) fn new(seq: u64, op: Operation, max_retries: u32, now_micros: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            seq,
            kind: op.kind,
            entity_type: op.entity_type,
            entity_key: op.entity_key,
            payload: op.payload,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at_micros: now_micros,
            last_attempt_micros: None,
            last_error: None,
            content_ref: None,
        }
    }

    /// A failed item that used up its automatic attempts; only an explicit
    /// operator retry can move it again.
    pub fn exhausted(&self) -> bool {
        self.status == QueueStatus::Failed && self.retry_count >= self.max_retries
    }

    fn illegal(&self, to: QueueStatus) -> TillError {
        TillError::InvalidTransition {
            item_id: self.id.clone(),
            from: self.status,
            to,
        }
    }

    pub(crate) fn begin_sync(&mut self, now_micros: u64) -> Result<(), TillError> {
        if self.status != QueueStatus::Pending {
            return Err(self.illegal(QueueStatus::Syncing));
        }
        self.status = QueueStatus::Syncing;
        self.last_attempt_micros = Some(now_micros);
        Ok(())
    }

    pub(crate) fn complete(&mut self, content_ref: String) -> Result<(), TillError> {
        if self.status != QueueStatus::Syncing {
            return Err(self.illegal(QueueStatus::Completed));
        }
        self.status = QueueStatus::Completed;
        self.content_ref = Some(content_ref);
        self.last_error = None;
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: String, now_micros: u64) -> Result<(), TillError> {
        if self.status != QueueStatus::Syncing {
            return Err(self.illegal(QueueStatus::Failed));
        }
        self.status = QueueStatus::Failed;
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_error = Some(error);
        self.last_attempt_micros = Some(now_micros);
        Ok(())
    }

    /// Undoes an interrupted publish attempt (timeout or restart). Does not
    /// consume a retry; idempotent publish semantics make the re-attempt safe.
    pub(crate) fn revert_to_pending(&mut self) -> Result<(), TillError> {
        if self.status != QueueStatus::Syncing {
            return Err(self.illegal(QueueStatus::Pending));
        }
        self.status = QueueStatus::Pending;
        Ok(())
    }

    /// Returns a failed item to pending, for an explicit operator retry or a
    /// backoff-gated automatic one. Leaves `retry_count` untouched so the
    /// failure history stays visible.
    pub(crate) fn requeue(&mut self) -> Result<(), TillError> {
        if self.status != QueueStatus::Failed {
            return Err(self.illegal(QueueStatus::Pending));
        }
        self.status = QueueStatus::Pending;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{EntityType, Operation, OperationKind, QueueItem, QueueStatus};
    use crate::error::TillErrorCode;

    fn item(max_retries: u32) -> QueueItem {
        QueueItem::new(
            1,
            Operation {
                kind: OperationKind::Create,
                entity_type: EntityType::Order,
                entity_key: "order-1".into(),
                payload: serde_json::json!({"total": 12_50}),
            },
            max_retries,
            1_000,
        )
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut item = item(3);
        item.begin_sync(2_000).expect("syncing");
        item.complete("bafy-1".into()).expect("completed");
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.content_ref.as_deref(), Some("bafy-1"));
    }

    #[test]
    fn completed_is_terminal() {
        let mut item = item(3);
        item.begin_sync(2_000).expect("syncing");
        item.complete("bafy-1".into()).expect("completed");
        assert_eq!(
            item.begin_sync(3_000).expect_err("terminal").code(),
            TillErrorCode::InvalidTransition
        );
        assert_eq!(
            item.fail("boom".into(), 3_000).expect_err("terminal").code(),
            TillErrorCode::InvalidTransition
        );
        assert_eq!(
            item.requeue().expect_err("terminal").code(),
            TillErrorCode::InvalidTransition
        );
    }

    #[test]
    fn retry_count_never_exceeds_the_cap() {
        let mut item = item(2);
        for attempt in 0..5 {
            if item.status == QueueStatus::Failed {
                item.requeue().expect("retry");
            }
            item.begin_sync(attempt).expect("syncing");
            item.fail("boom".into(), attempt).expect("failed");
            assert!(item.retry_count <= item.max_retries);
        }
        assert_eq!(item.retry_count, 2);
        assert!(item.exhausted());
    }

    #[test]
    fn requeue_preserves_failure_history() {
        let mut item = item(3);
        item.begin_sync(1).expect("syncing");
        item.fail("boom".into(), 2).expect("failed");
        item.requeue().expect("pending again");
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn revert_does_not_consume_a_retry() {
        let mut item = item(3);
        item.begin_sync(1).expect("syncing");
        item.revert_to_pending().expect("pending");
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn pending_items_cannot_be_retried_or_completed() {
        let mut item = item(3);
        assert!(item.requeue().is_err());
        assert!(item.complete("bafy-1".into()).is_err());
    }
}
