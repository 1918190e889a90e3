pub mod store;

use crate::error::TillError;
use crate::remote::{Credentials, IdentityProvider, RoleAuthority, bounded};
use crate::session::store::EncryptedSessionStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const MICROS_PER_HOUR: u64 = 3_600_000_000;
const MICROS_PER_DAY: u64 = 24 * MICROS_PER_HOUR;

/// Closed role set, ordered by trust (ascending).
///
/// Trust ordering matters for the grace rules below: the most trusted role
/// gets the least offline leeway, because the blast radius of a stale Root
/// session is the whole node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Operator,
    Partner,
    Admin,
    Root,
}

impl Role {
    /// Maximum staleness after token expiry before a cached session stops
    /// being usable without live reverification. Process-wide constant.
    ///
    /// Root has no grace period at all: it must always reverify live.
    pub fn grace_period_micros(self) -> u64 {
        match self {
            Role::Root => 0,
            Role::Admin => MICROS_PER_DAY,
            Role::Partner | Role::Operator => 7 * MICROS_PER_DAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Operator => "OPERATOR",
            Role::Partner => "PARTNER",
            Role::Admin => "ADMIN",
            Role::Root => "ROOT",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single cached identity/session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub account_id: String,
    pub verified_address: String,
    pub role: Role,
    pub token: String,
    pub expires_at_micros: u64,
    pub cached_at_micros: u64,
    pub device_authorized: bool,
    #[serde(default)]
    pub last_refresh_micros: Option<u64>,
}

impl SessionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: impl Into<String>,
        verified_address: impl Into<String>,
        role: Role,
        token: impl Into<String>,
        expires_at_micros: u64,
        cached_at_micros: u64,
        device_authorized: bool,
    ) -> Result<Self, TillError> {
        if expires_at_micros <= cached_at_micros {
            return Err(TillError::Validation(
                "session must expire after it was cached".into(),
            ));
        }
        Ok(Self {
            account_id: account_id.into(),
            verified_address: verified_address.into(),
            role,
            token: token.into(),
            expires_at_micros,
            cached_at_micros,
            device_authorized,
            last_refresh_micros: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    NoSession,
    RootOffline,
    TokenExpired,
    GraceExpired,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidReason::NoSession => "no cached session",
            InvalidReason::RootOffline => "root requires live verification while offline",
            InvalidReason::TokenExpired => "token expired and must be reverified",
            InvalidReason::GraceExpired => "token expired beyond the role's grace period",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid {
        reason: InvalidReason,
        requires_online: bool,
    },
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// Decides whether a cached session is still usable at `now_micros` given
/// current connectivity. Pure; all clocking is the caller's.
///
/// Root never operates on a grace period: offline, or expired even while
/// online, it must reverify live. Every other role stays valid until its
/// token has been expired for longer than the role's grace period.
pub fn validate_session(
    session: Option<&SessionRecord>,
    now_micros: u64,
    online: bool,
) -> Validity {
    let Some(session) = session else {
        return Validity::Invalid {
            reason: InvalidReason::NoSession,
            requires_online: false,
        };
    };
    let expired = now_micros > session.expires_at_micros;
    if session.role == Role::Root {
        if !online {
            return Validity::Invalid {
                reason: InvalidReason::RootOffline,
                requires_online: true,
            };
        }
        if expired {
            return Validity::Invalid {
                reason: InvalidReason::TokenExpired,
                requires_online: true,
            };
        }
        return Validity::Valid;
    }
    if expired
        && now_micros - session.expires_at_micros > session.role.grace_period_micros()
    {
        return Validity::Invalid {
            reason: InvalidReason::GraceExpired,
            requires_online: true,
        };
    }
    Validity::Valid
}

/// Owns the cached session and its encrypted at-rest copy.
///
/// Created on successful login, refreshed in the background while online,
/// discarded on logout or when validation fails unrecoverably.
pub struct SessionManager {
    store: EncryptedSessionStore,
    identity: Arc<dyn IdentityProvider>,
    authority: Arc<dyn RoleAuthority>,
    current: Mutex<Option<SessionRecord>>,
    remote_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        store: EncryptedSessionStore,
        identity: Arc<dyn IdentityProvider>,
        authority: Arc<dyn RoleAuthority>,
        remote_timeout: Duration,
    ) -> Self {
        let cached = store.load();
        if let Some(session) = &cached {
            info!(account_id = %session.account_id, role = %session.role, "cached session restored");
        }
        Self {
            store,
            identity,
            authority,
            current: Mutex::new(cached),
            remote_timeout,
        }
    }

    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.current.lock().clone()
    }

    pub fn validate(&self, now_micros: u64, online: bool) -> Validity {
        validate_session(self.current.lock().as_ref(), now_micros, online)
    }

    /// Live login against the identity provider and role authority. Only
    /// possible online; both calls are bounded by the remote timeout.
    pub async fn login(
        &self,
        credentials: &Credentials,
        online: bool,
    ) -> Result<SessionRecord, TillError> {
        if !online {
            return Err(TillError::NetworkUnavailable);
        }
        let grant = bounded(self.remote_timeout, self.identity.login(credentials)).await?;
        let role = bounded(self.remote_timeout, self.authority.role_of(&grant.account_id)).await?;
        let now = crate::now_micros();
        let session = SessionRecord::new(
            grant.account_id,
            grant.verified_address,
            role,
            grant.token,
            grant.expires_at_micros,
            now,
            grant.device_authorized,
        )?;
        self.store.save(&session)?;
        *self.current.lock() = Some(session.clone());
        info!(account_id = %session.account_id, role = %session.role, "session established");
        Ok(session)
    }

    pub fn logout(&self) -> Result<(), TillError> {
        self.store.clear()?;
        if self.current.lock().take().is_some() {
            info!("session discarded");
        }
        Ok(())
    }

    /// Fire-and-forget token refresh. Never blocks the caller; failure is
    /// logged and the previous session remains authoritative until its own
    /// grace period lapses. Concurrent refreshes are last-write-wins.
    pub fn refresh_in_background(self: Arc<Self>, online: bool) {
        if !online {
            return;
        }
        let manager = self;
        tokio::spawn(async move {
            if let Err(err) = manager.refresh_once().await {
                warn!(
                    error = %err,
                    code = err.code_str(),
                    "background session refresh failed; cached session remains authoritative"
                );
            }
        });
    }

    pub(crate) async fn refresh_once(&self) -> Result<(), TillError> {
        let (token, account_id) = match self.current.lock().as_ref() {
            Some(session) => (session.token.clone(), session.account_id.clone()),
            None => {
                return Err(TillError::AuthExpired {
                    reason: "no cached session to refresh".into(),
                });
            }
        };
        let grant = bounded(self.remote_timeout, self.identity.refresh(&token)).await?;
        // Role downgrades surface here, at the next successful refresh; a
        // failed role lookup keeps the cached role.
        let role = bounded(self.remote_timeout, self.authority.role_of(&account_id))
            .await
            .ok();
        let now = crate::now_micros();
        let mut current = self.current.lock();
        if let Some(session) = current.as_mut() {
            session.token = grant.token;
            session.expires_at_micros = grant.expires_at_micros;
            session.cached_at_micros = now;
            session.last_refresh_micros = Some(now);
            if let Some(role) = role {
                session.role = role;
            }
            self.store.save(session)?;
        }
        Ok(())
    }
}
