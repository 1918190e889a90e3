use crate::error::TillError;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Runtime configuration for a till instance.
#[derive(Debug, Clone)]
pub struct TillConfig {
    /// Business the local overrides and queued mutations belong to.
    pub business_id: String,
    /// Automatic sync attempts per queue item before operator action is required.
    pub max_retries: u32,
    /// Upper bound on every remote call (identity, authority, ledger).
    /// A timeout is treated exactly like being offline.
    pub remote_timeout_ms: u64,
    /// Period of the reconciler's background timer.
    pub reconcile_interval_ms: u64,
    /// Base delay before the first automatic retry of a failed queue item.
    pub backoff_base_ms: u64,
    /// Ceiling for the exponential retry delay.
    pub backoff_cap_ms: u64,
    /// Down-jitter factor applied to retry delays, in `[0, 1)`.
    pub backoff_jitter: f64,
    /// Key for the at-rest session blob. Wrapped in Arc<Zeroizing<>> so the
    /// key is securely zeroed from memory when the last reference is dropped.
    pub session_encryption_key: Arc<Zeroizing<[u8; 32]>>,
    /// Optional HMAC key for local store integrity. Wrapped in
    /// Arc<Zeroizing<>> for the same reason.
    pub store_hmac_key: Option<Arc<Zeroizing<Vec<u8>>>>,
}

impl TillConfig {
    pub fn new(business_id: impl Into<String>, session_key: [u8; 32]) -> Self {
        Self {
            business_id: business_id.into(),
            max_retries: 3,
            remote_timeout_ms: 4_000,
            reconcile_interval_ms: 30_000,
            backoff_base_ms: 5_000,
            backoff_cap_ms: 300_000,
            backoff_jitter: 0.25,
            session_encryption_key: Arc::new(Zeroizing::new(session_key)),
            store_hmac_key: None,
        }
    }

    /// Profile for live terminals: store integrity signing on top of the
    /// defaults.
    pub fn production(
        business_id: impl Into<String>,
        session_key: [u8; 32],
        store_hmac_key: Vec<u8>,
    ) -> Self {
        Self {
            store_hmac_key: Some(Arc::new(Zeroizing::new(store_hmac_key))),
            ..Self::new(business_id, session_key)
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_remote_timeout_ms(mut self, remote_timeout_ms: u64) -> Self {
        self.remote_timeout_ms = remote_timeout_ms;
        self
    }

    pub fn with_reconcile_interval_ms(mut self, reconcile_interval_ms: u64) -> Self {
        self.reconcile_interval_ms = reconcile_interval_ms;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_store_hmac_key(mut self, key: Vec<u8>) -> Self {
        self.store_hmac_key = Some(Arc::new(Zeroizing::new(key)));
        self
    }

    /// Returns a reference to the session encryption key, dereferencing
    /// through the Arc<Zeroizing<>> wrapper.
    pub fn session_key(&self) -> &[u8; 32] {
        &self.session_encryption_key
    }

    /// Returns a reference to the store HMAC key, dereferencing through the
    /// Arc<Zeroizing<>> wrapper.
    pub fn hmac_key(&self) -> Option<&[u8]> {
        self.store_hmac_key.as_ref().map(|arc| &***arc as &[u8])
    }

    pub fn validate(&self) -> Result<(), TillError> {
        if self.business_id.is_empty() {
            return Err(TillError::InvalidConfig {
                message: "business_id must not be empty".into(),
            });
        }
        if self.max_retries == 0 {
            return Err(TillError::InvalidConfig {
                message: "max_retries must be at least 1".into(),
            });
        }
        if self.remote_timeout_ms == 0 || self.reconcile_interval_ms == 0 {
            return Err(TillError::InvalidConfig {
                message: "remote_timeout_ms and reconcile_interval_ms must be non-zero".into(),
            });
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(TillError::InvalidConfig {
                message: "backoff_cap_ms must be >= backoff_base_ms >= 1".into(),
            });
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(TillError::InvalidConfig {
                message: "backoff_jitter must be in [0, 1)".into(),
            });
        }
        Ok(())
    }
}
