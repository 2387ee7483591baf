use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Scalar aliases ───────────────────────────────────────────

/// Partition-unique record key. Element instances, variables, subscriptions,
/// jobs and incidents all draw from the same generator.
pub type Key = i64;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Placeholder for "no key", e.g. the flow scope of a process instance root.
pub const NO_KEY: Key = -1;

pub const DEFAULT_TENANT: &str = "<default>";

/// A JSON object of variables, e.g. a completion payload or a message body.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Number of low bits reserved for the per-partition counter.
const KEY_BITS: u32 = 51;

/// Largest partition id whose keys stay positive.
pub const MAX_PARTITION_ID: u16 = (1 << (63 - KEY_BITS)) - 1;

// ─── Key generator ────────────────────────────────────────────

/// Monotonic key source for one partition.
///
/// Keys encode the partition id in their upper bits. Replay keeps the
/// generator in step by observing every key that appears in a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGenerator {
    partition_id: u16,
    next: Key,
}

impl KeyGenerator {
    /// `partition_id` must not exceed [`MAX_PARTITION_ID`]; `EngineConfig`
    /// rejects larger ids.
    pub fn new(partition_id: u16) -> Self {
        debug_assert!(partition_id <= MAX_PARTITION_ID);
        Self {
            partition_id,
            next: ((partition_id as i64) << KEY_BITS) + 1,
        }
    }

    pub fn next_key(&mut self) -> Key {
        let key = self.next;
        self.next += 1;
        key
    }

    /// Advance past a key written by this partition.
    pub fn observe(&mut self, key: Key) {
        if key > 0 && (key >> KEY_BITS) == self.partition_id as i64 && key >= self.next {
            self.next = key + 1;
        }
    }

    pub fn partition_id(&self) -> u16 {
        self.partition_id
    }
}

// ─── BPMN element types ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BpmnElementType {
    Unspecified,
    Process,
    SubProcess,
    EventSubProcess,
    StartEvent,
    EndEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
    ServiceTask,
    UserTask,
    ReceiveTask,
    ManualTask,
    Task,
    ExclusiveGateway,
    ParallelGateway,
    EventBasedGateway,
    CallActivity,
    SequenceFlow,
    MultiInstanceBody,
}

impl BpmnElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Process => "PROCESS",
            Self::SubProcess => "SUB_PROCESS",
            Self::EventSubProcess => "EVENT_SUB_PROCESS",
            Self::StartEvent => "START_EVENT",
            Self::EndEvent => "END_EVENT",
            Self::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
            Self::IntermediateThrowEvent => "INTERMEDIATE_THROW_EVENT",
            Self::BoundaryEvent => "BOUNDARY_EVENT",
            Self::ServiceTask => "SERVICE_TASK",
            Self::UserTask => "USER_TASK",
            Self::ReceiveTask => "RECEIVE_TASK",
            Self::ManualTask => "MANUAL_TASK",
            Self::Task => "TASK",
            Self::ExclusiveGateway => "EXCLUSIVE_GATEWAY",
            Self::ParallelGateway => "PARALLEL_GATEWAY",
            Self::EventBasedGateway => "EVENT_BASED_GATEWAY",
            Self::CallActivity => "CALL_ACTIVITY",
            Self::SequenceFlow => "SEQUENCE_FLOW",
            Self::MultiInstanceBody => "MULTI_INSTANCE_BODY",
        }
    }

    /// Element types that own child element instances.
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Process | Self::SubProcess | Self::EventSubProcess | Self::MultiInstanceBody
        )
    }

    /// Types that boundary events may be attached to.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Self::SubProcess
                | Self::ServiceTask
                | Self::UserTask
                | Self::ReceiveTask
                | Self::ManualTask
                | Self::Task
                | Self::CallActivity
        )
    }

    /// Types that can never be the direct target of an activate or start
    /// instruction. The process itself is only ever started through creation.
    pub fn is_unsupported_activation_target(&self) -> bool {
        matches!(
            self,
            Self::Unspecified
                | Self::Process
                | Self::StartEvent
                | Self::SequenceFlow
                | Self::BoundaryEvent
        )
    }

    pub fn supported_activation_targets() -> Vec<BpmnElementType> {
        ALL_ELEMENT_TYPES
            .iter()
            .copied()
            .filter(|t| !t.is_unsupported_activation_target() && *t != Self::MultiInstanceBody)
            .collect()
    }
}

const ALL_ELEMENT_TYPES: [BpmnElementType; 20] = [
    BpmnElementType::Unspecified,
    BpmnElementType::Process,
    BpmnElementType::SubProcess,
    BpmnElementType::EventSubProcess,
    BpmnElementType::StartEvent,
    BpmnElementType::EndEvent,
    BpmnElementType::IntermediateCatchEvent,
    BpmnElementType::IntermediateThrowEvent,
    BpmnElementType::BoundaryEvent,
    BpmnElementType::ServiceTask,
    BpmnElementType::UserTask,
    BpmnElementType::ReceiveTask,
    BpmnElementType::ManualTask,
    BpmnElementType::Task,
    BpmnElementType::ExclusiveGateway,
    BpmnElementType::ParallelGateway,
    BpmnElementType::EventBasedGateway,
    BpmnElementType::CallActivity,
    BpmnElementType::SequenceFlow,
    BpmnElementType::MultiInstanceBody,
];

impl fmt::Display for BpmnElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Lifecycle ────────────────────────────────────────────────

/// Lifecycle state of one element instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Activating,
    Activated,
    Completing,
    Completed,
    Terminating,
    Terminated,
    Suspending,
    Suspended,
    Resuming,
}

impl LifecycleState {
    /// ACTIVATING or ACTIVATED. Only these states accept new children.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Activating | Self::Activated)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activating => "ELEMENT_ACTIVATING",
            Self::Activated => "ELEMENT_ACTIVATED",
            Self::Completing => "ELEMENT_COMPLETING",
            Self::Completed => "ELEMENT_COMPLETED",
            Self::Terminating => "ELEMENT_TERMINATING",
            Self::Terminated => "ELEMENT_TERMINATED",
            Self::Suspending => "ELEMENT_SUSPENDING",
            Self::Suspended => "ELEMENT_SUSPENDED",
            Self::Resuming => "ELEMENT_RESUMING",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Rejections ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    NotFound,
    InvalidArgument,
    InvalidState,
    Forbidden,
    ExceededBatchRecordSize,
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::InvalidState => "INVALID_STATE",
            Self::Forbidden => "FORBIDDEN",
            Self::ExceededBatchRecordSize => "EXCEEDED_BATCH_RECORD_SIZE",
        })
    }
}

// ─── Incidents ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    IoMappingError,
    ExtractValueError,
    ConditionError,
    CalledElementError,
}

// ─── Runtime instructions ─────────────────────────────────────

/// Instruction attached at creation time that fires when the named element
/// completes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeInstruction {
    SuspendProcessInstance { after_element_id: String },
    TerminateProcessInstance { after_element_id: String },
}

impl RuntimeInstruction {
    pub fn after_element_id(&self) -> &str {
        match self {
            Self::SuspendProcessInstance { after_element_id }
            | Self::TerminateProcessInstance { after_element_id } => after_element_id,
        }
    }
}

/// Epoch milliseconds now.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_generator_encodes_partition_and_observes_replayed_keys() {
        let mut keys = KeyGenerator::new(1);
        let first = keys.next_key();
        assert_eq!(first >> KEY_BITS, 1);
        assert_eq!(keys.next_key(), first + 1);

        let mut replayed = KeyGenerator::new(1);
        replayed.observe(first + 1);
        assert_eq!(replayed.next_key(), first + 2);

        // keys of another partition never move the counter
        replayed.observe((2i64 << KEY_BITS) + 100);
        assert_eq!(replayed.next_key(), first + 3);
    }

    #[test]
    fn highest_partition_keeps_keys_positive_across_replay() {
        let mut keys = KeyGenerator::new(MAX_PARTITION_ID);
        let first = keys.next_key();
        assert!(first > 0);
        assert_eq!(first >> KEY_BITS, MAX_PARTITION_ID as i64);

        let mut replayed = KeyGenerator::new(MAX_PARTITION_ID);
        replayed.observe(first);
        assert_ne!(replayed.next_key(), first);
    }

    #[test]
    fn only_activating_and_activated_are_active() {
        assert!(LifecycleState::Activating.is_active());
        assert!(LifecycleState::Activated.is_active());
        for state in [
            LifecycleState::Completing,
            LifecycleState::Terminating,
            LifecycleState::Suspended,
            LifecycleState::Completed,
        ] {
            assert!(!state.is_active(), "{state} must not be active");
        }
    }

    #[test]
    fn supported_targets_exclude_start_events_and_flows() {
        let supported = BpmnElementType::supported_activation_targets();
        assert!(!supported.contains(&BpmnElementType::StartEvent));
        assert!(!supported.contains(&BpmnElementType::SequenceFlow));
        assert!(!supported.contains(&BpmnElementType::BoundaryEvent));
        assert!(!supported.contains(&BpmnElementType::MultiInstanceBody));
        assert!(supported.contains(&BpmnElementType::UserTask));
    }
}
