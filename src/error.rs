use crate::store::queue::QueueStatus;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TillErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    StorageCorrupt,
    AuthExpired,
    PermissionDenied,
    NetworkUnavailable,
    SyncExhausted,
    QueueItemNotFound,
    InvalidTransition,
}

impl TillErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TillErrorCode::Io => "io",
            TillErrorCode::Encode => "encode",
            TillErrorCode::Decode => "decode",
            TillErrorCode::Validation => "validation",
            TillErrorCode::InvalidConfig => "invalid_config",
            TillErrorCode::StorageCorrupt => "storage_corrupt",
            TillErrorCode::AuthExpired => "auth_expired",
            TillErrorCode::PermissionDenied => "permission_denied",
            TillErrorCode::NetworkUnavailable => "network_unavailable",
            TillErrorCode::SyncExhausted => "sync_exhausted",
            TillErrorCode::QueueItemNotFound => "queue_item_not_found",
            TillErrorCode::InvalidTransition => "invalid_transition",
        }
    }
}

/// Crate-wide error type.
///
/// The first group of variants is infrastructure plumbing; the second group
/// is the caller-visible taxonomy: `AuthExpired` means "log back in",
/// `NetworkUnavailable` means "wait for connectivity", `PermissionDenied`
/// means "not allowed", `SyncExhausted` means a queue item needs an explicit
/// operator retry. `StorageCorrupt` is always recovered at the component
/// boundary by treating the affected state as absent.
#[derive(Debug, Error)]
pub enum TillError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("local storage corrupt: {message}")]
    StorageCorrupt { message: String },
    #[error("session expired: {reason}")]
    AuthExpired { reason: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("queue item '{item_id}' exhausted {retries} sync attempts; operator retry required")]
    SyncExhausted { item_id: String, retries: u32 },
    #[error("queue item '{item_id}' not found")]
    QueueItemNotFound { item_id: String },
    #[error("queue item '{item_id}': illegal transition {from} -> {to}")]
    InvalidTransition {
        item_id: String,
        from: QueueStatus,
        to: QueueStatus,
    },
}

impl TillError {
    pub fn code(&self) -> TillErrorCode {
        match self {
            TillError::Io(_) => TillErrorCode::Io,
            TillError::Encode(_) => TillErrorCode::Encode,
            TillError::Decode(_) => TillErrorCode::Decode,
            TillError::Validation(_) => TillErrorCode::Validation,
            TillError::InvalidConfig { .. } => TillErrorCode::InvalidConfig,
            TillError::StorageCorrupt { .. } => TillErrorCode::StorageCorrupt,
            TillError::AuthExpired { .. } => TillErrorCode::AuthExpired,
            TillError::PermissionDenied(_) => TillErrorCode::PermissionDenied,
            TillError::NetworkUnavailable => TillErrorCode::NetworkUnavailable,
            TillError::SyncExhausted { .. } => TillErrorCode::SyncExhausted,
            TillError::QueueItemNotFound { .. } => TillErrorCode::QueueItemNotFound,
            TillError::InvalidTransition { .. } => TillErrorCode::InvalidTransition,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::{TillError, TillErrorCode};
    use crate::store::queue::QueueStatus;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(TillErrorCode::AuthExpired.as_str(), "auth_expired");
        assert_eq!(TillErrorCode::StorageCorrupt.as_str(), "storage_corrupt");
        assert_eq!(
            TillErrorCode::NetworkUnavailable.as_str(),
            "network_unavailable"
        );
        assert_eq!(TillErrorCode::SyncExhausted.as_str(), "sync_exhausted");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = TillError::SyncExhausted {
            item_id: "q-1".into(),
            retries: 3,
        };
        assert_eq!(err.code(), TillErrorCode::SyncExhausted);
        assert_eq!(err.code_str(), "sync_exhausted");

        let err = TillError::InvalidTransition {
            item_id: "q-2".into(),
            from: QueueStatus::Completed,
            to: QueueStatus::Pending,
        };
        assert_eq!(err.code_str(), "invalid_transition");
    }
}
