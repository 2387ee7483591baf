//! Partition state and the event applier.
//!
//! `PartitionState` is only ever changed by [`PartitionState::apply`]. The
//! processor writes events into a batch, the batch applies each one to its
//! working copy, and replaying a committed log through the same applier
//! rebuilds an identical state.
//!
//! Each component sits behind an `Arc`, so the batch's working copy shares
//! everything with the committed state until a record changes a component.
//! Only the components a command touches are copied.

use crate::events::{
    ElementRecord, IncidentRecord, Intent, JobRecord, Record, RecordType, RecordValue,
    UserTaskRecord,
};
use crate::scope_tree::{ElementInstance, ScopeTree};
use crate::subscriptions::SubscriptionStore;
use crate::types::{BpmnElementType, Key, KeyGenerator, LifecycleState, RuntimeInstruction, NO_KEY};
use crate::variables::VariableStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub keys: KeyGenerator,
    pub tree: Arc<ScopeTree>,
    pub variables: Arc<VariableStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    /// job key -> job
    pub jobs: Arc<BTreeMap<Key, JobRecord>>,
    /// user task key -> user task
    pub user_tasks: Arc<BTreeMap<Key, UserTaskRecord>>,
    /// incident key -> incident
    pub incidents: Arc<BTreeMap<Key, IncidentRecord>>,
    /// process instance key -> instructions still waiting for their element
    pub runtime_instructions: Arc<BTreeMap<Key, Vec<RuntimeInstruction>>>,
    /// Position of the last applied record.
    pub last_position: u64,
}

impl PartitionState {
    pub fn new(partition_id: u16) -> Self {
        Self {
            keys: KeyGenerator::new(partition_id),
            tree: Arc::default(),
            variables: Arc::default(),
            subscriptions: Arc::default(),
            jobs: Arc::default(),
            user_tasks: Arc::default(),
            incidents: Arc::default(),
            runtime_instructions: Arc::default(),
            last_position: 0,
        }
    }

    /// Rebuild state from a committed log.
    pub fn replay<'a>(partition_id: u16, records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut state = Self::new(partition_id);
        for record in records {
            state.apply(record);
        }
        state
    }

    // ── queries ──

    pub fn jobs_of(&self, element_instance_key: Key) -> Vec<Key> {
        self.jobs
            .iter()
            .filter(|(_, job)| job.element_instance_key == element_instance_key)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn user_tasks_of(&self, element_instance_key: Key) -> Vec<Key> {
        self.user_tasks
            .iter()
            .filter(|(_, task)| task.element_instance_key == element_instance_key)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn incidents_of(&self, element_instance_key: Key) -> Vec<Key> {
        self.incidents
            .iter()
            .filter(|(_, incident)| incident.element_instance_key == element_instance_key)
            .map(|(key, _)| *key)
            .collect()
    }

    /// True while the outermost process instance owning `key` is suspended
    /// or on its way there.
    pub fn is_suspended(&self, key: Key) -> bool {
        self.tree.root_process_instance_of(key).is_some_and(|root| {
            matches!(
                root.state,
                LifecycleState::Suspending | LifecycleState::Suspended
            )
        })
    }

    // ── applier ──

    /// Apply one record. Commands and rejections only advance the position
    /// and the key generator.
    pub fn apply(&mut self, record: &Record) {
        self.last_position = record.position;
        self.keys.observe(record.key);
        if record.record_type != RecordType::Event {
            return;
        }

        match (&record.value, record.intent) {
            (RecordValue::ProcessInstance(element), intent) => {
                self.apply_element(record.key, element, intent)
            }
            (RecordValue::SequenceFlow(flow), Intent::SequenceFlowTaken) => {
                if flow.target_is_join && self.tree.contains(flow.flow_scope_key) {
                    if let Some(scope) = Arc::make_mut(&mut self.tree).get_mut(flow.flow_scope_key) {
                        scope
                            .pending_joins
                            .entry(flow.target_element_id.clone())
                            .or_default()
                            .insert(flow.element_id.clone());
                    }
                }
            }
            (RecordValue::Variable(variable), Intent::VariableCreated | Intent::VariableUpdated) => {
                Arc::make_mut(&mut self.variables).apply_set(record.key, variable)
            }
            (RecordValue::Subscription(sub), Intent::SubscriptionOpened) => {
                Arc::make_mut(&mut self.subscriptions).insert(record.key, sub.clone())
            }
            (RecordValue::Subscription(_), Intent::SubscriptionDeleted) => {
                Arc::make_mut(&mut self.subscriptions).remove(record.key)
            }
            (RecordValue::Job(job), Intent::JobCreated) => {
                Arc::make_mut(&mut self.jobs).insert(record.key, job.clone());
            }
            (RecordValue::Job(_), Intent::JobCompleted | Intent::JobCanceled) => {
                Arc::make_mut(&mut self.jobs).remove(&record.key);
            }
            (RecordValue::UserTask(task), Intent::UserTaskCreated) => {
                Arc::make_mut(&mut self.user_tasks).insert(record.key, task.clone());
            }
            (RecordValue::UserTask(_), Intent::UserTaskCompleted | Intent::UserTaskCanceled) => {
                Arc::make_mut(&mut self.user_tasks).remove(&record.key);
            }
            (RecordValue::Incident(incident), Intent::IncidentCreated) => {
                Arc::make_mut(&mut self.incidents).insert(record.key, incident.clone());
            }
            (RecordValue::Incident(_), Intent::IncidentResolved) => {
                Arc::make_mut(&mut self.incidents).remove(&record.key);
            }
            (RecordValue::Creation(creation), Intent::Created) => {
                if !creation.runtime_instructions.is_empty() {
                    Arc::make_mut(&mut self.runtime_instructions).insert(
                        creation.process_instance_key,
                        creation.runtime_instructions.clone(),
                    );
                }
            }
            (
                RecordValue::RuntimeInstruction(fired),
                Intent::RuntimeInstructionInterrupted | Intent::RuntimeInstructionSuspended,
            ) => {
                let pending = Arc::make_mut(&mut self.runtime_instructions);
                if let Some(waiting) = pending.get_mut(&fired.process_instance_key) {
                    waiting.retain(|instruction| instruction != &fired.instruction);
                    if waiting.is_empty() {
                        pending.remove(&fired.process_instance_key);
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_element(&mut self, key: Key, element: &ElementRecord, intent: Intent) {
        let tree = Arc::make_mut(&mut self.tree);
        match intent {
            Intent::ElementActivating => {
                if let Some(scope) = tree.get_mut(element.flow_scope_key) {
                    // a joining gateway consumes the flows that arrived for it
                    scope.pending_joins.remove(&element.element_id);
                    if scope.is_multi_instance_body() && scope.element_id() == element.element_id {
                        scope.spawned_inner += 1;
                    }
                }
                if element.is_root() && element.parent_element_instance_key != NO_KEY {
                    if let Some(call_activity) = tree.get_mut(element.parent_element_instance_key) {
                        call_activity.called_child = Some(key);
                    }
                }
                tree.insert(ElementInstance::new(key, element.clone()));
            }
            Intent::ElementActivated | Intent::ElementResumed => {
                tree.set_state(key, LifecycleState::Activated)
            }
            Intent::ElementCompleting => tree.set_state(key, LifecycleState::Completing),
            Intent::ElementTerminating => tree.set_state(key, LifecycleState::Terminating),
            Intent::ElementSuspending => tree.set_state(key, LifecycleState::Suspending),
            Intent::ElementSuspended => tree.set_state(key, LifecycleState::Suspended),
            Intent::ElementResuming => tree.set_state(key, LifecycleState::Resuming),
            Intent::ElementCompleted | Intent::ElementTerminated => {
                if let Some(removed) = tree.remove(key) {
                    if removed.record.is_root() {
                        if let Some(call_activity) = tree.get_mut(removed.record.parent_element_instance_key) {
                            if call_activity.called_child == Some(key) {
                                call_activity.called_child = None;
                            }
                        }
                        if self.runtime_instructions.contains_key(&key) {
                            Arc::make_mut(&mut self.runtime_instructions).remove(&key);
                        }
                    }
                }
                if self.variables.has_scope(key) {
                    Arc::make_mut(&mut self.variables).remove_scope(key);
                }
            }
            Intent::ElementMigrated => {
                if let Some(instance) = tree.get_mut(key) {
                    instance.record = element.clone();
                }
                if self.jobs.values().any(|job| job.element_instance_key == key) {
                    for job in Arc::make_mut(&mut self.jobs).values_mut() {
                        if job.element_instance_key == key {
                            job.element_id = element.element_id.clone();
                        }
                    }
                }
                if self.user_tasks.values().any(|task| task.element_instance_key == key) {
                    for task in Arc::make_mut(&mut self.user_tasks).values_mut() {
                        if task.element_instance_key == key {
                            task.element_id = element.element_id.clone();
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Number of live element instances of one type.
    pub fn count_of_type(&self, element_type: BpmnElementType) -> usize {
        self.tree
            .iter()
            .filter(|instance| instance.element_type() == element_type)
            .count()
    }
}
