use crate::error::TillError;
use crate::session::Role;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Credentials handed to the external identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

/// Result of a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginGrant {
    pub account_id: String,
    pub verified_address: String,
    pub token: String,
    pub expires_at_micros: u64,
    pub device_authorized: bool,
}

/// Result of a successful token refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at_micros: u64,
}

/// External identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, TillError>;
    async fn refresh(&self, token: &str) -> Result<TokenGrant, TillError>;
}

/// Remote permission/role authority. Best-effort: callers must tolerate
/// errors and timeouts, but an explicit deny is authoritative.
#[async_trait]
pub trait RoleAuthority: Send + Sync {
    async fn role_of(&self, account_id: &str) -> Result<Role, TillError>;
    async fn check_permission(
        &self,
        account_id: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, TillError>;
}

/// External ledger / content-addressed publisher. `publish` must be
/// idempotent under resubmission; the returned string is the content
/// reference for the committed payload.
#[async_trait]
pub trait LedgerPublisher: Send + Sync {
    async fn publish(&self, payload: &serde_json::Value) -> Result<String, TillError>;
}

/// Bounds a remote call by the configured timeout. An elapsed timeout is
/// indistinguishable from being offline, so it surfaces as
/// [`TillError::NetworkUnavailable`].
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, TillError>
where
    F: Future<Output = Result<T, TillError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TillError::NetworkUnavailable),
    }
}

#[cfg(test)]
mod tests {
    use super::bounded;
    use crate::error::{TillError, TillErrorCode};
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let ok = bounded(Duration::from_millis(50), async { Ok(7u32) }).await;
        assert_eq!(ok.expect("ok"), 7);
    }

    #[tokio::test]
    async fn bounded_maps_timeout_to_network_unavailable() {
        let res: Result<(), TillError> = bounded(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(
            res.expect_err("timeout").code(),
            TillErrorCode::NetworkUnavailable
        );
    }
}
