//! Authentication and authorization.
//!
//! A pluggable backend identifies the caller; ACL roles map the caller to
//! capability sets per entity type. With no ACLs configured, authorization
//! defers entirely to the plugin (effectively disabled with the default
//! AllowAll plugin). Both checks run exactly once per request, before any
//! store operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use etre_core::{Error, Result, TRACE_HEADER};
use serde::{Deserialize, Serialize};

// ============================================================================
// TYPES
// ============================================================================

/// Authenticated principal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Caller {
    pub name: String,

    /// Roles matched against ACLs. Roles without an ACL are ignored.
    pub roles: Vec<String>,

    /// Metric groups this caller's requests are counted under.
    pub metric_groups: Vec<String>,

    /// Trace pairs from the plugin and the trace header.
    pub trace: Option<HashMap<String, String>>,
}

/// One ACL role and its capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acl {
    pub role: String,

    /// Admin passes every check.
    #[serde(default)]
    pub admin: bool,

    /// Entity types this role may read.
    #[serde(default)]
    pub read: Vec<String>,

    /// Entity types this role may write.
    #[serde(default)]
    pub write: Vec<String>,

    /// Whether this role may consume the change feed.
    #[serde(default)]
    pub cdc: bool,

    /// Trace keys the caller must supply.
    #[serde(default)]
    pub trace_keys_required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclOp {
    Read,
    Write,
    Cdc,
}

/// What the caller is trying to do.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Empty for CDC actions.
    pub entity_type: String,
    pub op: AclOp,
}

impl Action {
    pub fn read(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            op: AclOp::Read,
        }
    }

    pub fn write(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            op: AclOp::Write,
        }
    }

    pub fn cdc() -> Self {
        Self {
            entity_type: String::new(),
            op: AclOp::Cdc,
        }
    }
}

// ============================================================================
// PLUGIN
// ============================================================================

/// Pluggable authentication backend.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Caller>;

    /// Only consulted when no ACLs are configured.
    async fn authorize(&self, caller: &Caller, action: &Action) -> Result<()>;
}

/// Default plugin: anonymous caller, everything allowed.
pub struct AllowAll;

#[async_trait]
impl AuthPlugin for AllowAll {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<Caller> {
        Ok(Caller {
            name: String::new(),
            roles: Vec::new(),
            metric_groups: vec!["etre".to_string()],
            trace: None,
        })
    }

    async fn authorize(&self, _caller: &Caller, _action: &Action) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct Manager {
    acls: Vec<Acl>,
    plugin: Arc<dyn AuthPlugin>,
}

impl Manager {
    pub fn new(acls: Vec<Acl>, plugin: Arc<dyn AuthPlugin>) -> Self {
        Self { acls, plugin }
    }

    /// Identify the caller: plugin first (its error is returned as-is),
    /// then trace-header merge, then required-trace-key checks when ACLs
    /// are configured.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Caller> {
        let mut caller = self.plugin.authenticate(headers).await?;

        merge_trace_header(&mut caller, headers);

        if !self.acls.is_empty() {
            self.check_trace_keys(&caller)?;
        }

        Ok(caller)
    }

    /// Check one action against the caller's roles. Without ACLs the
    /// decision belongs to the plugin.
    pub async fn authorize(&self, caller: &Caller, action: &Action) -> Result<()> {
        if self.acls.is_empty() {
            return self.plugin.authorize(caller, action).await;
        }

        for role in &caller.roles {
            let Some(acl) = self.acls.iter().find(|a| &a.role == role) else {
                continue;
            };
            if acl.admin {
                return Ok(());
            }
            let allowed = match action.op {
                AclOp::Read => acl.read.iter().any(|t| t == &action.entity_type),
                AclOp::Write => acl.write.iter().any(|t| t == &action.entity_type),
                AclOp::Cdc => acl.cdc,
            };
            if allowed {
                return Ok(());
            }
        }

        Err(Error::access_denied(format!(
            "caller {} is not allowed to {:?} {}",
            caller.name, action.op, action.entity_type
        )))
    }

    fn check_trace_keys(&self, caller: &Caller) -> Result<()> {
        for role in &caller.roles {
            let Some(acl) = self.acls.iter().find(|a| &a.role == role) else {
                continue;
            };
            for key in &acl.trace_keys_required {
                let present = caller
                    .trace
                    .as_ref()
                    .is_some_and(|t| t.contains_key(key));
                if !present {
                    return Err(Error::auth_error(format!(
                        "role {} requires trace key {}",
                        role, key
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Merge `X-Etre-Trace` pairs into the caller's trace. Keys already set by
/// the plugin win; malformed pairs are silently dropped; an empty or absent
/// header leaves the trace untouched.
fn merge_trace_header(caller: &mut Caller, headers: &HeaderMap) {
    let Some(raw) = headers.get(TRACE_HEADER).and_then(|h| h.to_str().ok()) else {
        return;
    };
    if raw.is_empty() {
        return;
    }

    for pair in raw.split(',') {
        let mut parts = pair.splitn(2, '=');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let trace = caller.trace.get_or_insert_with(HashMap::new);
        trace
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
}
