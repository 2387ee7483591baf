use crate::types::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a record is a command, an event, or a command rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Command,
    Event,
    CommandRejection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    // ── element lifecycle commands ──
    ActivateElement,
    CompleteElement,
    TerminateElement,

    // ── element lifecycle events ──
    ElementActivating,
    ElementActivated,
    ElementCompleting,
    ElementCompleted,
    ElementTerminating,
    ElementTerminated,
    ElementSuspending,
    ElementSuspended,
    ElementResuming,
    ElementResumed,
    ElementMigrated,
    SequenceFlowTaken,

    // ── inbound commands ──
    Create,
    Modify,
    Migrate,
    Cancel,
    Suspend,
    Resume,
    Correlate,
    TriggerTimer,
    ResolveIncident,
    SetVariables,

    // ── command outcomes ──
    Created,
    Modified,
    Migrated,

    VariableCreated,
    VariableUpdated,

    SubscriptionOpened,
    SubscriptionCorrelated,
    SubscriptionDeleted,

    JobCreated,
    JobCompleted,
    JobCanceled,

    UserTaskCreated,
    UserTaskCompleted,
    UserTaskCanceled,

    IncidentCreated,
    IncidentResolved,

    /// A runtime instruction terminated the instance after its element completed.
    RuntimeInstructionInterrupted,
    /// A runtime instruction suspended the instance after its element completed.
    RuntimeInstructionSuspended,
}

impl Intent {
    /// Short lifecycle name used in logs and test expectations, e.g. `ACTIVATING`.
    pub fn short_name(&self) -> &'static str {
        match self {
            Intent::ActivateElement => "ACTIVATE_ELEMENT",
            Intent::CompleteElement => "COMPLETE_ELEMENT",
            Intent::TerminateElement => "TERMINATE_ELEMENT",
            Intent::ElementActivating => "ACTIVATING",
            Intent::ElementActivated => "ACTIVATED",
            Intent::ElementCompleting => "COMPLETING",
            Intent::ElementCompleted => "COMPLETED",
            Intent::ElementTerminating => "TERMINATING",
            Intent::ElementTerminated => "TERMINATED",
            Intent::ElementSuspending => "SUSPENDING",
            Intent::ElementSuspended => "SUSPENDED",
            Intent::ElementResuming => "RESUMING",
            Intent::ElementResumed => "RESUMED",
            Intent::ElementMigrated => "MIGRATED",
            Intent::SequenceFlowTaken => "SEQUENCE_FLOW_TAKEN",
            Intent::Create => "CREATE",
            Intent::Modify => "MODIFY",
            Intent::Migrate => "MIGRATE",
            Intent::Cancel => "CANCEL",
            Intent::Suspend => "SUSPEND",
            Intent::Resume => "RESUME",
            Intent::Correlate => "CORRELATE",
            Intent::TriggerTimer => "TRIGGER",
            Intent::ResolveIncident => "RESOLVE",
            Intent::SetVariables => "UPDATE",
            Intent::Created => "CREATED",
            Intent::Modified => "MODIFIED",
            Intent::Migrated => "MIGRATED",
            Intent::VariableCreated => "CREATED",
            Intent::VariableUpdated => "UPDATED",
            Intent::SubscriptionOpened => "OPENED",
            Intent::SubscriptionCorrelated => "CORRELATED",
            Intent::SubscriptionDeleted => "DELETED",
            Intent::JobCreated => "CREATED",
            Intent::JobCompleted => "COMPLETED",
            Intent::JobCanceled => "CANCELED",
            Intent::UserTaskCreated => "CREATED",
            Intent::UserTaskCompleted => "COMPLETED",
            Intent::UserTaskCanceled => "CANCELED",
            Intent::IncidentCreated => "CREATED",
            Intent::IncidentResolved => "RESOLVED",
            Intent::RuntimeInstructionInterrupted => "INTERRUPTED",
            Intent::RuntimeInstructionSuspended => "SUSPENDED",
        }
    }
}

// ─── Record values ────────────────────────────────────────────

/// Element instance record: what every lifecycle event carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub bpmn_process_id: String,
    pub version: u32,
    pub process_definition_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub bpmn_element_type: BpmnElementType,
    pub flow_scope_key: Key,
    pub parent_process_instance_key: Key,
    pub parent_element_instance_key: Key,
    pub tenant_id: String,
    /// Keys from the outermost root (across call activities) down to this instance.
    pub element_instance_path: Vec<Key>,
    /// Process definition keys from the outermost root down to this instance's process.
    pub process_definition_path: Vec<Key>,
    /// 1-based index inside a multi-instance body, 0 otherwise.
    #[serde(default)]
    pub loop_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_id: Option<String>,
}

impl ElementRecord {
    pub fn is_root(&self) -> bool {
        self.flow_scope_key == NO_KEY
    }

    pub fn has_parent_process(&self) -> bool {
        self.parent_process_instance_key != NO_KEY
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlowRecord {
    pub element_id: String,
    pub bpmn_process_id: String,
    pub process_instance_key: Key,
    pub flow_scope_key: Key,
    pub target_element_id: String,
    /// The target is a joining parallel gateway that waits for this flow.
    pub target_is_join: bool,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreationRecord {
    pub process_instance_key: Key,
    pub process_definition_key: Key,
    pub bpmn_process_id: String,
    pub version: u32,
    pub tenant_id: String,
    pub start_instructions: Vec<String>,
    pub tags: Vec<String>,
    pub business_id: Option<String>,
    pub runtime_instructions: Vec<RuntimeInstruction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub process_instance_key: Key,
    pub root_process_instance_key: Key,
    pub bpmn_process_id: String,
    pub tenant_id: String,
    pub activated_element_ids: Vec<String>,
    pub terminated_element_instance_keys: Vec<Key>,
    /// Keys of existing or synthesized scopes the activations were placed under.
    pub ancestor_scope_keys: Vec<Key>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub process_instance_key: Key,
    pub target_process_definition_key: Key,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableRecord {
    pub name: String,
    pub value: serde_json::Value,
    pub scope_key: Key,
    pub process_instance_key: Key,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRecord {
    Message { name: String, correlation_key: String },
    Timer { due_date: Timestamp },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// The scope the subscription is bound to.
    pub scope_key: Key,
    /// Id of the catching element: a catch event, receive task, boundary
    /// event or event sub-process start event.
    pub catch_element_id: String,
    pub process_instance_key: Key,
    pub bpmn_process_id: String,
    pub trigger: TriggerRecord,
    pub interrupting: bool,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub job_type: String,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserTaskRecord {
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub element_instance_key: Key,
    pub process_instance_key: Key,
    pub element_id: String,
    pub error_type: ErrorType,
    pub error_message: String,
    pub tenant_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeInstructionRecord {
    pub process_instance_key: Key,
    pub element_id: String,
    pub instruction: RuntimeInstruction,
    pub tenant_id: String,
}

/// Written for every rejected command. Carries enough context for the caller
/// to diagnose the rejection without querying state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub rejection_type: RejectionType,
    pub reason: String,
    pub process_instance_key: Key,
    pub root_process_instance_key: Key,
    pub tenant_id: String,
    pub element_id: String,
    pub bpmn_element_type: BpmnElementType,
    pub flow_scope_key: Key,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordValue {
    ProcessInstance(ElementRecord),
    SequenceFlow(SequenceFlowRecord),
    Creation(CreationRecord),
    Modification(ModificationRecord),
    Migration(MigrationRecord),
    Variable(VariableRecord),
    Subscription(SubscriptionRecord),
    Job(JobRecord),
    UserTask(UserTaskRecord),
    Incident(IncidentRecord),
    RuntimeInstruction(RuntimeInstructionRecord),
    Rejection(RejectionRecord),
}

// ─── Record ───────────────────────────────────────────────────

/// One immutable entry of the partition log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: u64,
    pub key: Key,
    pub timestamp: Timestamp,
    pub record_type: RecordType,
    pub intent: Intent,
    pub value: RecordValue,
}

impl Record {
    pub fn element(&self) -> Option<&ElementRecord> {
        match &self.value {
            RecordValue::ProcessInstance(r) => Some(r),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectionRecord> {
        match &self.value {
            RecordValue::Rejection(r) => Some(r),
            _ => None,
        }
    }

    pub fn variable(&self) -> Option<&VariableRecord> {
        match &self.value {
            RecordValue::Variable(r) => Some(r),
            _ => None,
        }
    }

    pub fn subscription(&self) -> Option<&SubscriptionRecord> {
        match &self.value {
            RecordValue::Subscription(r) => Some(r),
            _ => None,
        }
    }

    pub fn process_instance_key(&self) -> Key {
        match &self.value {
            RecordValue::ProcessInstance(r) => r.process_instance_key,
            RecordValue::SequenceFlow(r) => r.process_instance_key,
            RecordValue::Creation(r) => r.process_instance_key,
            RecordValue::Modification(r) => r.process_instance_key,
            RecordValue::Migration(r) => r.process_instance_key,
            RecordValue::Variable(r) => r.process_instance_key,
            RecordValue::Subscription(r) => r.process_instance_key,
            RecordValue::Job(r) => r.process_instance_key,
            RecordValue::UserTask(r) => r.process_instance_key,
            RecordValue::Incident(r) => r.process_instance_key,
            RecordValue::RuntimeInstruction(r) => r.process_instance_key,
            RecordValue::Rejection(r) => r.process_instance_key,
        }
    }

    /// Element id the record refers to, or an empty string.
    pub fn element_id(&self) -> &str {
        match &self.value {
            RecordValue::ProcessInstance(r) => &r.element_id,
            RecordValue::SequenceFlow(r) => &r.element_id,
            RecordValue::Subscription(r) => &r.catch_element_id,
            RecordValue::Job(r) => &r.element_id,
            RecordValue::UserTask(r) => &r.element_id,
            RecordValue::Incident(r) => &r.element_id,
            RecordValue::RuntimeInstruction(r) => &r.element_id,
            RecordValue::Rejection(r) => &r.element_id,
            RecordValue::Variable(r) => &r.name,
            RecordValue::Creation(r) => &r.bpmn_process_id,
            RecordValue::Modification(r) => &r.bpmn_process_id,
            RecordValue::Migration(_) => "",
        }
    }

    pub fn bpmn_element_type(&self) -> BpmnElementType {
        match &self.value {
            RecordValue::ProcessInstance(r) => r.bpmn_element_type,
            RecordValue::SequenceFlow(_) => BpmnElementType::SequenceFlow,
            RecordValue::Rejection(r) => r.bpmn_element_type,
            _ => BpmnElementType::Unspecified,
        }
    }

    pub fn flow_scope_key(&self) -> Key {
        match &self.value {
            RecordValue::ProcessInstance(r) => r.flow_scope_key,
            RecordValue::SequenceFlow(r) => r.flow_scope_key,
            RecordValue::Rejection(r) => r.flow_scope_key,
            RecordValue::Variable(r) => r.scope_key,
            RecordValue::Subscription(r) => r.scope_key,
            _ => NO_KEY,
        }
    }

    pub fn tenant_id(&self) -> &str {
        match &self.value {
            RecordValue::ProcessInstance(r) => &r.tenant_id,
            RecordValue::SequenceFlow(r) => &r.tenant_id,
            RecordValue::Creation(r) => &r.tenant_id,
            RecordValue::Modification(r) => &r.tenant_id,
            RecordValue::Migration(r) => &r.tenant_id,
            RecordValue::Variable(r) => &r.tenant_id,
            RecordValue::Subscription(r) => &r.tenant_id,
            RecordValue::Job(r) => &r.tenant_id,
            RecordValue::UserTask(r) => &r.tenant_id,
            RecordValue::Incident(r) => &r.tenant_id,
            RecordValue::RuntimeInstruction(r) => &r.tenant_id,
            RecordValue::Rejection(r) => &r.tenant_id,
        }
    }

    /// Serialized size used for batch limits.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

impl fmt::Display for Record {
    /// Compact form, e.g. `PROCESS_INSTANCE USER_TASK:ACTIVATED A k=2251799813685251`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value_type = match &self.value {
            RecordValue::ProcessInstance(_) => "PROCESS_INSTANCE",
            RecordValue::SequenceFlow(_) => "PROCESS_INSTANCE",
            RecordValue::Creation(_) => "CREATION",
            RecordValue::Modification(_) => "MODIFICATION",
            RecordValue::Migration(_) => "MIGRATION",
            RecordValue::Variable(_) => "VARIABLE",
            RecordValue::Subscription(_) => "SUBSCRIPTION",
            RecordValue::Job(_) => "JOB",
            RecordValue::UserTask(_) => "USER_TASK",
            RecordValue::Incident(_) => "INCIDENT",
            RecordValue::RuntimeInstruction(_) => "RUNTIME_INSTRUCTION",
            RecordValue::Rejection(_) => "REJECTION",
        };
        write!(
            f,
            "{value_type} {}:{} {} k={}",
            self.bpmn_element_type(),
            self.intent.short_name(),
            self.element_id(),
            self.key
        )
    }
}
