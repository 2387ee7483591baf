//! Authorization checks against the PROCESS_DEFINITION resource.

use crate::rejection::CommandError;
use crate::types::DEFAULT_TENANT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Wildcard for users and resource ids in a [`PermissionTable`].
pub const WILDCARD: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    CreateProcessInstance,
    UpdateProcessInstance,
    ModifyProcessInstance,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateProcessInstance => "CREATE_PROCESS_INSTANCE",
            Self::UpdateProcessInstance => "UPDATE_PROCESS_INSTANCE",
            Self::ModifyProcessInstance => "MODIFY_PROCESS_INSTANCE",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who sent a command and which tenants they may see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_tenants")]
    pub authorized_tenants: Vec<String>,
}

fn default_tenants() -> Vec<String> {
    vec![DEFAULT_TENANT.to_string()]
}

impl Default for RequestMetadata {
    fn default() -> Self {
        Self {
            username: None,
            authorized_tenants: default_tenants(),
        }
    }
}

impl RequestMetadata {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            ..Self::default()
        }
    }

    pub fn with_tenants<I, S>(mut self, tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_tenants = tenants.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_tenant_authorized(&self, tenant_id: &str) -> bool {
        self.authorized_tenants.iter().any(|t| t == tenant_id)
    }

    /// Tenant check applied by commands. Without multi-tenancy every tenant
    /// is visible.
    pub(crate) fn sees_tenant(&self, multi_tenancy: bool, tenant_id: &str) -> bool {
        !multi_tenancy || self.is_tenant_authorized(tenant_id)
    }
}

/// Decides whether a user holds a permission on one process definition.
pub trait AuthorizationChecker: Send + Sync {
    fn is_authorized(&self, username: Option<&str>, permission: Permission, bpmn_process_id: &str) -> bool;
}

/// Grants everything. The default when authorization is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AuthorizationChecker for AllowAll {
    fn is_authorized(&self, _: Option<&str>, _: Permission, _: &str) -> bool {
        true
    }
}

/// Static grants: user -> permission -> process ids.
///
/// Both the user and the process id may be [`WILDCARD`]. Anonymous requests
/// only match wildcard users.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionTable {
    grants: BTreeMap<String, BTreeMap<Permission, BTreeSet<String>>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user: &str, permission: Permission, bpmn_process_id: &str) -> Self {
        self.grants
            .entry(user.to_string())
            .or_default()
            .entry(permission)
            .or_default()
            .insert(bpmn_process_id.to_string());
        self
    }

    /// ```yaml
    /// grants:
    ///   - user: alice
    ///     permission: MODIFY_PROCESS_INSTANCE
    ///     process_ids: ["*"]
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: PermissionsYaml = serde_yaml::from_str(yaml).context("Parsing permission table")?;
        let mut table = Self::new();
        for grant in raw.grants {
            for process_id in &grant.process_ids {
                table = table.grant(&grant.user, grant.permission, process_id);
            }
        }
        Ok(table)
    }

    fn holds(&self, user: &str, permission: Permission, bpmn_process_id: &str) -> bool {
        self.grants
            .get(user)
            .and_then(|by_permission| by_permission.get(&permission))
            .is_some_and(|ids| ids.contains(WILDCARD) || ids.contains(bpmn_process_id))
    }
}

impl AuthorizationChecker for PermissionTable {
    fn is_authorized(&self, username: Option<&str>, permission: Permission, bpmn_process_id: &str) -> bool {
        let named = username.is_some_and(|user| self.holds(user, permission, bpmn_process_id));
        named || self.holds(WILDCARD, permission, bpmn_process_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PermissionsYaml {
    #[serde(default)]
    grants: Vec<GrantYaml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GrantYaml {
    user: String,
    permission: Permission,
    process_ids: Vec<String>,
}

/// FORBIDDEN unless the requester holds `permission` on the process.
pub(crate) fn require(
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    permission: Permission,
    bpmn_process_id: &str,
) -> Result<(), CommandError> {
    if checker.is_authorized(metadata.username.as_deref(), permission, bpmn_process_id) {
        return Ok(());
    }
    tracing::debug!(
        username = ?metadata.username,
        %permission,
        bpmn_process_id,
        "permission denied"
    );
    Err(CommandError::Forbidden(format!(
        "Insufficient permissions to perform operation '{permission}' on resource 'PROCESS_DEFINITION', required resource identifiers are one of '[*, {bpmn_process_id}]'"
    )))
}
