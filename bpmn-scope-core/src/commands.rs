//! Inbound commands accepted by the engine.
//!
//! Commands are plain serde values so hosts and the CLI script can send
//! them as YAML or JSON:
//!
//! ```yaml
//! command: create
//! bpmn_process_id: order
//! start_instructions: [ship]
//! tags: ["priority:high"]
//! ```

use crate::events::Intent;
use crate::modification::ModifyCommand;
use crate::types::{Document, Key, RuntimeInstruction, DEFAULT_TENANT};
use serde::{Deserialize, Serialize};

pub use crate::auth::RequestMetadata;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Create(CreateCommand),
    Modify(ModifyCommand),
    ActivateElement {
        process_instance_key: Key,
        element_id: String,
        #[serde(default)]
        ancestor_scope_key: Option<Key>,
    },
    TerminateElement {
        element_instance_key: Key,
    },
    CompleteElement {
        element_instance_key: Key,
        #[serde(default)]
        variables: Document,
    },
    Cancel {
        process_instance_key: Key,
    },
    Suspend {
        process_instance_key: Key,
    },
    Resume {
        process_instance_key: Key,
    },
    CorrelateMessage {
        name: String,
        correlation_key: String,
        #[serde(default = "default_tenant")]
        tenant_id: String,
        #[serde(default)]
        variables: Document,
    },
    TriggerTimer {
        subscription_key: Key,
    },
    ResolveIncident {
        incident_key: Key,
    },
    SetVariables {
        scope_key: Key,
        variables: Document,
        /// Write every variable on the scope itself instead of propagating.
        #[serde(default)]
        local: bool,
    },
    Migrate(MigrateCommand),
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl Command {
    pub fn intent(&self) -> Intent {
        match self {
            Self::Create(_) => Intent::Create,
            Self::Modify(_) => Intent::Modify,
            Self::ActivateElement { .. } => Intent::ActivateElement,
            Self::TerminateElement { .. } => Intent::TerminateElement,
            Self::CompleteElement { .. } => Intent::CompleteElement,
            Self::Cancel { .. } => Intent::Cancel,
            Self::Suspend { .. } => Intent::Suspend,
            Self::Resume { .. } => Intent::Resume,
            Self::CorrelateMessage { .. } => Intent::Correlate,
            Self::TriggerTimer { .. } => Intent::TriggerTimer,
            Self::ResolveIncident { .. } => Intent::ResolveIncident,
            Self::SetVariables { .. } => Intent::SetVariables,
            Self::Migrate(_) => Intent::Migrate,
        }
    }

    /// The key the command addresses, used for rejection records.
    pub fn target_key(&self) -> Option<Key> {
        match self {
            Self::Create(_) | Self::CorrelateMessage { .. } => None,
            Self::Modify(modify) => Some(modify.process_instance_key),
            Self::ActivateElement {
                process_instance_key,
                ..
            }
            | Self::Cancel {
                process_instance_key,
            }
            | Self::Suspend {
                process_instance_key,
            }
            | Self::Resume {
                process_instance_key,
            } => Some(*process_instance_key),
            Self::TerminateElement {
                element_instance_key,
            }
            | Self::CompleteElement {
                element_instance_key,
                ..
            } => Some(*element_instance_key),
            Self::TriggerTimer { subscription_key } => Some(*subscription_key),
            Self::ResolveIncident { incident_key } => Some(*incident_key),
            Self::SetVariables { scope_key, .. } => Some(*scope_key),
            Self::Migrate(migrate) => Some(migrate.process_instance_key),
        }
    }
}

// ─── Create ───────────────────────────────────────────────────

/// CREATE_PROCESS_INSTANCE. The process is addressed by definition key, or
/// by BPMN process id with an optional version (latest otherwise).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpmn_process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_definition_key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default)]
    pub variables: Document,
    /// Element ids to start at instead of the none start event.
    #[serde(default)]
    pub start_instructions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_id: Option<String>,
    #[serde(default)]
    pub runtime_instructions: Vec<RuntimeInstruction>,
}

impl Default for CreateCommand {
    fn default() -> Self {
        Self {
            bpmn_process_id: None,
            process_definition_key: None,
            version: None,
            tenant_id: default_tenant(),
            variables: Document::new(),
            start_instructions: Vec::new(),
            tags: Vec::new(),
            business_id: None,
            runtime_instructions: Vec::new(),
        }
    }
}

impl CreateCommand {
    pub fn by_id(bpmn_process_id: impl Into<String>) -> Self {
        Self {
            bpmn_process_id: Some(bpmn_process_id.into()),
            ..Self::default()
        }
    }

    pub fn by_key(process_definition_key: Key) -> Self {
        Self {
            process_definition_key: Some(process_definition_key),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn variables(mut self, variables: Document) -> Self {
        self.variables = variables;
        self
    }

    pub fn start_at(mut self, element_id: impl Into<String>) -> Self {
        self.start_instructions.push(element_id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn business_id(mut self, business_id: impl Into<String>) -> Self {
        self.business_id = Some(business_id.into());
        self
    }

    pub fn suspend_after(mut self, element_id: impl Into<String>) -> Self {
        self.runtime_instructions
            .push(RuntimeInstruction::SuspendProcessInstance {
                after_element_id: element_id.into(),
            });
        self
    }

    pub fn terminate_after(mut self, element_id: impl Into<String>) -> Self {
        self.runtime_instructions
            .push(RuntimeInstruction::TerminateProcessInstance {
                after_element_id: element_id.into(),
            });
        self
    }
}

// ─── Migrate ──────────────────────────────────────────────────

/// MIGRATE_PROCESS_INSTANCE to another deployed definition. Active elements
/// keep their ids unless a mapping names a different target element.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrateCommand {
    pub process_instance_key: Key,
    pub target_process_definition_key: Key,
    #[serde(default)]
    pub mappings: Vec<MigrationMapping>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMapping {
    pub source_element_id: String,
    pub target_element_id: String,
}

impl MigrateCommand {
    pub fn new(process_instance_key: Key, target_process_definition_key: Key) -> Self {
        Self {
            process_instance_key,
            target_process_definition_key,
            mappings: Vec::new(),
        }
    }

    pub fn map(mut self, source_element_id: impl Into<String>, target_element_id: impl Into<String>) -> Self {
        self.mappings.push(MigrationMapping {
            source_element_id: source_element_id.into(),
            target_element_id: target_element_id.into(),
        });
        self
    }

    pub(crate) fn target_of<'a>(&'a self, source_element_id: &'a str) -> &'a str {
        self.mappings
            .iter()
            .find(|m| m.source_element_id == source_element_id)
            .map_or(source_element_id, |m| m.target_element_id.as_str())
    }
}
