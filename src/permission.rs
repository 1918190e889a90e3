use crate::connectivity::ConnectivityProbe;
use crate::error::TillError;
use crate::remote::{RoleAuthority, bounded};
use crate::session::{Role, SessionManager, SessionRecord, Validity, validate_session};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Actions a rule can grant on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of actions that Root may only perform while the node can
/// reach the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalAction {
    SystemHalt,
    CommissionChange,
    DeviceAuthorization,
    RoleChange,
    EmergencyOverride,
}

/// Resource names used by the static role table.
pub mod resources {
    pub const ORDERS: &str = "orders";
    pub const CATALOG: &str = "catalog";
    pub const OVERRIDES: &str = "overrides";
    pub const SETTINGS: &str = "settings";
    pub const STAFF: &str = "staff";
    pub const REPORTS: &str = "reports";
    pub const DEVICES: &str = "devices";
}

/// One row of the static role table: a resource, the actions granted on it,
/// and whether the grant only applies to resources the caller owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRule {
    pub resource: &'static str,
    pub actions: &'static [Action],
    pub owner_only: bool,
}

impl ResourceRule {
    const fn new(resource: &'static str, actions: &'static [Action], owner_only: bool) -> Self {
        Self {
            resource,
            actions,
            owner_only,
        }
    }
}

use Action::{Create, Delete, Read, Update};

const ADMIN_RULES: &[ResourceRule] = &[
    ResourceRule::new(resources::ORDERS, &[Create, Read, Update, Delete], false),
    ResourceRule::new(resources::CATALOG, &[Create, Read, Update, Delete], false),
    ResourceRule::new(resources::OVERRIDES, &[Create, Read, Update, Delete], false),
    ResourceRule::new(resources::SETTINGS, &[Read, Update], false),
    ResourceRule::new(resources::STAFF, &[Create, Read, Update, Delete], false),
    ResourceRule::new(resources::REPORTS, &[Read], false),
    ResourceRule::new(resources::DEVICES, &[Read, Update], false),
];

const PARTNER_RULES: &[ResourceRule] = &[
    ResourceRule::new(resources::ORDERS, &[Create, Read], false),
    ResourceRule::new(resources::CATALOG, &[Create, Read, Update], true),
    ResourceRule::new(resources::OVERRIDES, &[Create, Read, Update], true),
    ResourceRule::new(resources::REPORTS, &[Read], true),
    ResourceRule::new(resources::SETTINGS, &[Read], false),
];

const OPERATOR_RULES: &[ResourceRule] = &[
    ResourceRule::new(resources::ORDERS, &[Create, Read, Update], false),
    ResourceRule::new(resources::CATALOG, &[Read], false),
    ResourceRule::new(resources::OVERRIDES, &[Read, Update], false),
    ResourceRule::new(resources::SETTINGS, &[Read], false),
];

/// Static rule set per role. Root is the universal wildcard and has no
/// explicit rows.
pub fn rules_for(role: Role) -> &'static [ResourceRule] {
    match role {
        Role::Root => &[],
        Role::Admin => ADMIN_RULES,
        Role::Partner => PARTNER_RULES,
        Role::Operator => OPERATOR_RULES,
    }
}

/// Ownership context for resource-scoped checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionContext {
    pub owner_id: Option<String>,
}

impl PermissionContext {
    pub fn owned_by(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoRule,
    ActionNotGranted,
    NotOwner,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NoRule => "no rule for resource",
            DenyReason::ActionNotGranted => "action not granted",
            DenyReason::NotOwner => "ownership constraint not satisfied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDecision {
    Allow,
    Deny(DenyReason),
}

/// Static-table decision for an already-validated session (steps 2-4 of the
/// check). Pure and side-effect free; the remote authority overlay lives in
/// [`PermissionEngine`].
///
/// Ownership rules fail closed: when a rule is owner-scoped and the caller
/// supplied no owner, the answer is deny.
pub fn local_decision(
    session: &SessionRecord,
    resource: &str,
    action: Action,
    ctx: Option<&PermissionContext>,
) -> LocalDecision {
    if session.role == Role::Root {
        return LocalDecision::Allow;
    }
    let Some(rule) = rules_for(session.role)
        .iter()
        .find(|rule| rule.resource == resource)
    else {
        return LocalDecision::Deny(DenyReason::NoRule);
    };
    if !rule.actions.contains(&action) {
        return LocalDecision::Deny(DenyReason::ActionNotGranted);
    }
    if rule.owner_only {
        match ctx.and_then(|ctx| ctx.owner_id.as_deref()) {
            Some(owner) if owner == session.account_id => {}
            _ => return LocalDecision::Deny(DenyReason::NotOwner),
        }
    }
    LocalDecision::Allow
}

/// True only for the combination that must not proceed: a Root session,
/// one of the critical actions, and no connectivity. The [`CriticalAction`]
/// enum is the fixed critical set.
pub fn requires_online_block(_action: CriticalAction, role: Role, online: bool) -> bool {
    role == Role::Root && !online
}

/// Resolves allow/deny for a (resource, action) pair against the session,
/// the static role table, the ownership constraint, and -- while online --
/// the remote authority.
///
/// Fail closed: an authoritative remote deny overrides a local allow. An
/// authority timeout or transport error is swallowed and the local decision
/// stands. Checks are side-effect-free reads.
pub struct PermissionEngine {
    sessions: Arc<SessionManager>,
    authority: Arc<dyn RoleAuthority>,
    probe: Arc<dyn ConnectivityProbe>,
    remote_timeout: Duration,
}

impl PermissionEngine {
    pub fn new(
        sessions: Arc<SessionManager>,
        authority: Arc<dyn RoleAuthority>,
        probe: Arc<dyn ConnectivityProbe>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            authority,
            probe,
            remote_timeout,
        }
    }

    pub async fn has_permission(
        &self,
        resource: &str,
        action: Action,
        ctx: Option<&PermissionContext>,
    ) -> bool {
        self.require_permission(resource, action, ctx).await.is_ok()
    }

    pub async fn require_permission(
        &self,
        resource: &str,
        action: Action,
        ctx: Option<&PermissionContext>,
    ) -> Result<(), TillError> {
        let online = self.probe.is_online();
        let now = crate::now_micros();
        let session = self.sessions.snapshot();
        let session = match &session {
            Some(session) => session,
            None => {
                return Err(TillError::AuthExpired {
                    reason: "no cached session".into(),
                });
            }
        };
        if let Validity::Invalid { reason, .. } = validate_session(Some(session), now, online) {
            return Err(TillError::AuthExpired {
                reason: reason.as_str().into(),
            });
        }
        if let LocalDecision::Deny(reason) = local_decision(session, resource, action, ctx) {
            return Err(TillError::PermissionDenied(format!(
                "{} may not {action} {resource}: {}",
                session.role,
                reason.as_str()
            )));
        }
        if online {
            let verdict = bounded(
                self.remote_timeout,
                self.authority
                    .check_permission(&session.account_id, resource, action.as_str()),
            )
            .await;
            match verdict {
                Ok(false) => {
                    warn!(
                        account_id = %session.account_id,
                        resource,
                        action = %action,
                        "remote authority denied a locally-allowed action"
                    );
                    return Err(TillError::PermissionDenied(format!(
                        "remote authority denied {action} on {resource}"
                    )));
                }
                Ok(true) => {}
                Err(err) => {
                    debug!(error = %err, "authority unreachable; local decision stands");
                }
            }
        }
        Ok(())
    }

    /// Connectivity gate for destructive Root actions; see
    /// [`requires_online_block`].
    pub fn requires_online_block(&self, action: CriticalAction) -> bool {
        match self.sessions.snapshot() {
            Some(session) => {
                requires_online_block(action, session.role, self.probe.is_online())
            }
            None => false,
        }
    }
}
