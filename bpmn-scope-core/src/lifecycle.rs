//! Element lifecycle state machine.
//!
//! ```text
//! ACTIVATING ──► ACTIVATED ──► COMPLETING ──► COMPLETED
//!      │             │
//!      └─────────────┴──► TERMINATING ──► TERMINATED
//!
//! (root) ACTIVATED ──► SUSPENDING ──► SUSPENDED ──► RESUMING ──► ACTIVATED
//! ```
//!
//! Activations and completions run as queued follow-up commands so that one
//! inbound command can drive the instance as far as it goes without waiting.
//! Terminations and suspensions run inline: they cascade depth-first
//! through the scope tree, including called process instances.

use crate::events::{
    ElementRecord, IncidentRecord, Intent, JobRecord, RecordValue, RuntimeInstructionRecord,
    SequenceFlowRecord, UserTaskRecord,
};
use crate::model::{ElementDef, ProcessModel};
use crate::rejection::CommandError;
use crate::repository::ProcessDefinition;
use crate::scope_tree::{ElementInstance, ScopeTree};
use crate::side_effects::{self, SUSPENSION_HANDLERS, TERMINATION_HANDLERS};
use crate::subscriptions::{self, CorrelationKeyError};
use crate::types::{
    BpmnElementType, Document, ErrorType, Key, LifecycleState, RuntimeInstruction, NO_KEY,
};
use crate::variables;
use crate::writer::{Batch, FollowUp, Route};
use serde_json::Value;
use std::sync::Arc;

// ─── Records ──────────────────────────────────────────────────

/// Record of a new instance of `element` inside `flow_scope`.
///
/// Elements with a multi-instance marker get a body first; the inner
/// instances are created inside that body with the element's own type.
pub(crate) fn element_record(flow_scope: &ElementInstance, element: &ElementDef, key: Key) -> ElementRecord {
    let inside_own_body =
        flow_scope.is_multi_instance_body() && flow_scope.element_id() == element.id;
    let bpmn_element_type = if element.is_multi_instance() && !inside_own_body {
        BpmnElementType::MultiInstanceBody
    } else {
        element.element_type
    };
    let mut element_instance_path = flow_scope.record.element_instance_path.clone();
    element_instance_path.push(key);

    ElementRecord {
        bpmn_process_id: flow_scope.record.bpmn_process_id.clone(),
        version: flow_scope.record.version,
        process_definition_key: flow_scope.record.process_definition_key,
        process_instance_key: flow_scope.process_instance_key(),
        element_id: element.id.clone(),
        bpmn_element_type,
        flow_scope_key: flow_scope.key,
        parent_process_instance_key: flow_scope.record.parent_process_instance_key,
        parent_element_instance_key: flow_scope.record.parent_element_instance_key,
        tenant_id: flow_scope.record.tenant_id.clone(),
        element_instance_path,
        process_definition_path: flow_scope.record.process_definition_path.clone(),
        loop_counter: 0,
        business_id: flow_scope.record.business_id.clone(),
    }
}

/// Record of a process instance root.
pub(crate) fn root_record(
    definition: &ProcessDefinition,
    key: Key,
    parent: Option<&ElementInstance>,
    business_id: Option<String>,
) -> ElementRecord {
    let (parent_process_instance_key, parent_element_instance_key, mut instance_path, mut definition_path) =
        match parent {
            Some(call_activity) => (
                call_activity.process_instance_key(),
                call_activity.key,
                call_activity.record.element_instance_path.clone(),
                call_activity.record.process_definition_path.clone(),
            ),
            None => (NO_KEY, NO_KEY, Vec::new(), Vec::new()),
        };
    instance_path.push(key);
    definition_path.push(definition.key);

    ElementRecord {
        bpmn_process_id: definition.bpmn_process_id.clone(),
        version: definition.version,
        process_definition_key: definition.key,
        process_instance_key: key,
        element_id: definition.bpmn_process_id.clone(),
        bpmn_element_type: BpmnElementType::Process,
        flow_scope_key: NO_KEY,
        parent_process_instance_key,
        parent_element_instance_key,
        tenant_id: definition.tenant_id.clone(),
        element_instance_path: instance_path,
        process_definition_path: definition_path,
        loop_counter: 0,
        business_id,
    }
}

/// Instances in these states still accept work from their children.
/// Suspension only withholds jobs and subscriptions.
pub(crate) fn is_live_scope(tree: &ScopeTree, key: Key) -> bool {
    tree.get(key).is_some_and(|instance| {
        !matches!(
            instance.state,
            LifecycleState::Completing
                | LifecycleState::Completed
                | LifecycleState::Terminating
                | LifecycleState::Terminated
        )
    })
}

// ─── Requests ─────────────────────────────────────────────────

/// Write ACTIVATE_ELEMENT for a pre-assigned key and queue the activation.
pub(crate) fn enqueue_activation(
    batch: &mut Batch<'_>,
    key: Key,
    record: ElementRecord,
    trigger: Option<Document>,
) {
    batch.command(
        key,
        Intent::ActivateElement,
        RecordValue::ProcessInstance(record.clone()),
    );
    batch.enqueue(FollowUp::Activate {
        key,
        record,
        trigger,
    });
}

/// Activate `element` inside the given flow scope instance.
pub(crate) fn request_activation(
    batch: &mut Batch<'_>,
    flow_scope_key: Key,
    element: &ElementDef,
    trigger: Option<Document>,
) -> Option<Key> {
    let scope = batch.state.tree.get(flow_scope_key)?.clone();
    let key = batch.next_key();
    let record = element_record(&scope, element, key);
    enqueue_activation(batch, key, record, trigger);
    Some(key)
}

pub(crate) fn request_completion(
    batch: &mut Batch<'_>,
    key: Key,
    variables: Document,
    route: Option<Route>,
) {
    let Some(record) = batch.state.tree.get(key).map(|i| i.record.clone()) else {
        return;
    };
    batch.command(key, Intent::CompleteElement, RecordValue::ProcessInstance(record));
    batch.enqueue(FollowUp::Complete {
        key,
        variables,
        route,
    });
}

/// Process queued follow-ups until the queue is empty.
pub(crate) fn drain(batch: &mut Batch<'_>) -> Result<(), CommandError> {
    while let Some(follow_up) = batch.next_follow_up()? {
        match follow_up {
            FollowUp::Activate {
                key,
                record,
                trigger,
            } => activate(batch, key, record, trigger),
            FollowUp::Complete {
                key,
                variables,
                route,
            } => complete(batch, key, variables, route),
            FollowUp::Suspend {
                process_instance_key,
            } => {
                if let Err(err) = suspend_instance(batch, process_instance_key) {
                    tracing::debug!(process_instance_key, %err, "dropping suspension");
                }
            }
        }
    }
    Ok(())
}

// ─── Activation ───────────────────────────────────────────────

/// Why an activation could not proceed. Raised as an incident for regular
/// activations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ActivationFailure {
    pub error_type: ErrorType,
    pub message: String,
}

impl From<CorrelationKeyError> for ActivationFailure {
    fn from(err: CorrelationKeyError) -> Self {
        Self {
            error_type: ErrorType::ExtractValueError,
            message: err.to_string(),
        }
    }
}

fn activate(batch: &mut Batch<'_>, key: Key, record: ElementRecord, trigger: Option<Document>) {
    let owner = if record.is_root() {
        record.parent_element_instance_key
    } else {
        record.flow_scope_key
    };
    if owner != NO_KEY && !is_live_scope(&batch.state.tree, owner) {
        tracing::debug!(
            key,
            element_id = %record.element_id,
            "dropping activation, flow scope is no longer active"
        );
        return;
    }
    batch.event(
        key,
        Intent::ElementActivating,
        RecordValue::ProcessInstance(record),
    );
    continue_activation(batch, key, trigger);
}

/// Everything after ELEMENT_ACTIVATING. Also the retry path after an
/// incident is resolved.
fn continue_activation(batch: &mut Batch<'_>, key: Key, trigger: Option<Document>) {
    if let Err(failure) = prepare_activation(batch, key, trigger.as_ref()) {
        raise_incident(batch, key, failure);
        return;
    }
    let Some(record) = batch.state.tree.get(key).map(|i| i.record.clone()) else {
        return;
    };
    batch.event(key, Intent::ElementActivated, RecordValue::ProcessInstance(record));
    run_activation_behavior(batch, key, trigger);
}

fn prepare_activation(
    batch: &mut Batch<'_>,
    key: Key,
    trigger: Option<&Document>,
) -> Result<(), ActivationFailure> {
    let Some(instance) = batch.state.tree.get(key).cloned() else {
        return Ok(());
    };
    let Some(definition) = batch.definition_of(&instance.record) else {
        return Ok(());
    };
    let Some(def) = definition.element(instance.element_id()).cloned() else {
        return Ok(());
    };

    if instance.record.is_root() {
        // variables handed over by a call activity
        if let Some(document) = trigger {
            variables::set_local_document(batch, key, document);
        }
    } else if !instance.is_multi_instance_body() {
        if instance.record.loop_counter > 0 {
            variables::set_local(
                batch,
                key,
                "loopCounter",
                Value::from(instance.record.loop_counter),
            );
        }
        apply_input_mappings(batch, key, &def)?;
        match def.element_type {
            BpmnElementType::ExclusiveGateway => {
                choose_exclusive_flow(batch, &definition, &def, instance.flow_scope_key())?;
            }
            BpmnElementType::CallActivity => {
                called_definition(batch, &def, &instance.record.tenant_id)?;
            }
            _ => {}
        }
    }

    if !batch.state.is_suspended(key) {
        let own_already_triggered = trigger.is_some() && !instance.record.is_root();
        subscriptions::open_for_instance(batch, key, own_already_triggered)?;
    }
    Ok(())
}

fn apply_input_mappings(batch: &mut Batch<'_>, key: Key, def: &ElementDef) -> Result<(), ActivationFailure> {
    let mut mapped = Vec::with_capacity(def.input_mappings.len());
    for mapping in &def.input_mappings {
        let value = batch
            .state
            .variables
            .get_visible(&batch.state.tree, key, &mapping.source)
            .cloned()
            .ok_or_else(|| ActivationFailure {
                error_type: ErrorType::IoMappingError,
                message: format!(
                    "failed to evaluate expression '{0}': no variable found for name '{0}'",
                    mapping.source
                ),
            })?;
        mapped.push((mapping.target.clone(), value));
    }
    for (target, value) in mapped {
        variables::set_local(batch, key, &target, value);
    }
    Ok(())
}

/// Flow an exclusive gateway leaves through: the first outgoing flow whose
/// condition holds, else the default flow. `None` for a gateway without
/// outgoing flows.
fn choose_exclusive_flow(
    batch: &Batch<'_>,
    model: &ProcessModel,
    gateway: &ElementDef,
    scope_key: Key,
) -> Result<Option<String>, ActivationFailure> {
    if gateway.outgoing.is_empty() {
        return Ok(None);
    }
    for flow_id in &gateway.outgoing {
        if gateway.default_flow.as_ref() == Some(flow_id) {
            continue;
        }
        let Some(flow) = model.element(flow_id) else {
            continue;
        };
        let taken = match &flow.condition {
            None => true,
            Some(condition) => condition.holds(batch.state.variables.get_visible(
                &batch.state.tree,
                scope_key,
                &condition.variable,
            )),
        };
        if taken {
            return Ok(Some(flow_id.clone()));
        }
    }
    gateway.default_flow.clone().map(Some).ok_or_else(|| ActivationFailure {
        error_type: ErrorType::ConditionError,
        message: format!(
            "Expected at least one condition to evaluate to true, or to have a default flow, but gateway '{}' has neither",
            gateway.id
        ),
    })
}

fn called_definition(
    batch: &Batch<'_>,
    call_activity: &ElementDef,
    tenant_id: &str,
) -> Result<Arc<ProcessDefinition>, ActivationFailure> {
    let process_id = call_activity.called_process_id.as_deref().unwrap_or_default();
    batch
        .repository()
        .latest_by_id(process_id, tenant_id)
        .ok_or_else(|| ActivationFailure {
            error_type: ErrorType::CalledElementError,
            message: format!(
                "Expected process with BPMN process id '{process_id}' to be deployed, but not found."
            ),
        })
}

pub(crate) fn raise_incident(batch: &mut Batch<'_>, key: Key, failure: ActivationFailure) {
    let Some(instance) = batch.state.tree.get(key) else {
        return;
    };
    let record = IncidentRecord {
        element_instance_key: key,
        process_instance_key: instance.process_instance_key(),
        element_id: instance.element_id().to_string(),
        error_type: failure.error_type,
        error_message: failure.message,
        tenant_id: instance.record.tenant_id.clone(),
    };
    tracing::warn!(
        element_instance_key = key,
        element_id = %record.element_id,
        error_type = ?record.error_type,
        message = %record.error_message,
        "activation failed, raising incident"
    );
    let incident_key = batch.next_key();
    batch.event(incident_key, Intent::IncidentCreated, RecordValue::Incident(record));
}

fn run_activation_behavior(batch: &mut Batch<'_>, key: Key, trigger: Option<Document>) {
    let Some(instance) = batch.state.tree.get(key).cloned() else {
        return;
    };
    let Some(definition) = batch.definition_of(&instance.record) else {
        return;
    };
    let Some(def) = definition.element(instance.element_id()).cloned() else {
        return;
    };
    let suspended = batch.state.is_suspended(key);

    match instance.element_type() {
        BpmnElementType::Process | BpmnElementType::SubProcess => {
            match definition.none_start_event(&def.id) {
                Some(start) => {
                    request_activation(batch, key, start, None);
                }
                None => request_completion(batch, key, Document::new(), None),
            }
        }
        BpmnElementType::EventSubProcess => match definition.event_start_event(&def.id) {
            Some(start) => {
                request_activation(batch, key, start, trigger);
            }
            None => request_completion(batch, key, Document::new(), None),
        },
        BpmnElementType::MultiInstanceBody => {
            let (sequential, cardinality) = def
                .multi_instance
                .as_ref()
                .map_or((false, 0), |mi| (mi.sequential, mi.cardinality));
            if cardinality == 0 {
                request_completion(batch, key, Document::new(), None);
            } else if sequential {
                spawn_inner(batch, key, &def, 1);
            } else {
                for loop_counter in 1..=cardinality {
                    spawn_inner(batch, key, &def, loop_counter);
                }
            }
        }
        BpmnElementType::ServiceTask => {
            if !suspended {
                create_job(batch, &instance, &def);
            }
        }
        BpmnElementType::UserTask => {
            if !suspended {
                create_user_task(batch, &instance);
            }
        }
        BpmnElementType::IntermediateCatchEvent | BpmnElementType::ReceiveTask => {
            if let Some(payload) = trigger {
                request_completion(batch, key, payload, None);
            }
        }
        BpmnElementType::EventBasedGateway => {}
        BpmnElementType::StartEvent | BpmnElementType::BoundaryEvent => {
            request_completion(batch, key, trigger.unwrap_or_default(), None);
        }
        BpmnElementType::CallActivity => start_called_process(batch, &instance, &def),
        _ => request_completion(batch, key, Document::new(), None),
    }
}

fn spawn_inner(batch: &mut Batch<'_>, body_key: Key, def: &ElementDef, loop_counter: u32) {
    let Some(body) = batch.state.tree.get(body_key).cloned() else {
        return;
    };
    let key = batch.next_key();
    let mut record = element_record(&body, def, key);
    record.loop_counter = loop_counter;
    enqueue_activation(batch, key, record, None);
}

pub(crate) fn create_job(batch: &mut Batch<'_>, instance: &ElementInstance, def: &ElementDef) {
    let record = JobRecord {
        element_instance_key: instance.key,
        process_instance_key: instance.process_instance_key(),
        element_id: instance.element_id().to_string(),
        job_type: def.job_type.clone().unwrap_or_default(),
        tenant_id: instance.record.tenant_id.clone(),
    };
    let job_key = batch.next_key();
    batch.event(job_key, Intent::JobCreated, RecordValue::Job(record));
}

pub(crate) fn create_user_task(batch: &mut Batch<'_>, instance: &ElementInstance) {
    let record = UserTaskRecord {
        element_instance_key: instance.key,
        process_instance_key: instance.process_instance_key(),
        element_id: instance.element_id().to_string(),
        tenant_id: instance.record.tenant_id.clone(),
    };
    let task_key = batch.next_key();
    batch.event(task_key, Intent::UserTaskCreated, RecordValue::UserTask(record));
}

fn start_called_process(batch: &mut Batch<'_>, call_activity: &ElementInstance, def: &ElementDef) {
    let called = match called_definition(batch, def, &call_activity.record.tenant_id) {
        Ok(called) => called,
        Err(failure) => {
            raise_incident(batch, call_activity.key, failure);
            return;
        }
    };
    let child_key = batch.next_key();
    let record = root_record(
        &called,
        child_key,
        Some(call_activity),
        call_activity.record.business_id.clone(),
    );
    let handed_over = batch
        .state
        .variables
        .visible_document(&batch.state.tree, call_activity.key);
    tracing::debug!(
        call_activity = call_activity.key,
        child = child_key,
        process_id = %called.bpmn_process_id,
        "starting called process instance"
    );
    enqueue_activation(batch, child_key, record, Some(handed_over));
}

// ─── Completion ───────────────────────────────────────────────

fn complete(batch: &mut Batch<'_>, key: Key, variables: Document, route: Option<Route>) {
    let Some(instance) = batch.state.tree.get(key).cloned() else {
        tracing::debug!(key, "dropping completion of unknown element instance");
        return;
    };
    if instance.state != LifecycleState::Activated
        || (!instance.record.is_root() && !is_live_scope(&batch.state.tree, instance.flow_scope_key()))
    {
        tracing::debug!(key, state = %instance.state, "dropping completion");
        return;
    }
    let Some(definition) = batch.definition_of(&instance.record) else {
        return;
    };
    let Some(def) = definition.element(instance.element_id()).cloned() else {
        return;
    };

    batch.event(
        key,
        Intent::ElementCompleting,
        RecordValue::ProcessInstance(instance.record.clone()),
    );
    apply_completion_variables(batch, &instance, &def, &variables);
    subscriptions::close_for_scope(batch, key);
    for job_key in batch.state.jobs_of(key) {
        if let Some(job) = batch.state.jobs.get(&job_key).cloned() {
            batch.event(job_key, Intent::JobCompleted, RecordValue::Job(job));
        }
    }
    for task_key in batch.state.user_tasks_of(key) {
        if let Some(task) = batch.state.user_tasks.get(&task_key).cloned() {
            batch.event(task_key, Intent::UserTaskCompleted, RecordValue::UserTask(task));
        }
    }
    let child_result = (instance.record.is_root() && instance.record.has_parent_process())
        .then(|| batch.state.variables.local_document(key));
    batch.event(
        key,
        Intent::ElementCompleted,
        RecordValue::ProcessInstance(instance.record.clone()),
    );

    continue_after_completion(batch, &instance, &definition, &def, route, child_result);
}

fn apply_completion_variables(
    batch: &mut Batch<'_>,
    instance: &ElementInstance,
    def: &ElementDef,
    document: &Document,
) {
    if instance.record.is_root() {
        variables::set_local_document(batch, instance.key, document);
        return;
    }
    let scope_key = instance.flow_scope_key();
    if def.output_mappings.is_empty() || instance.is_multi_instance_body() {
        variables::propagate(batch, scope_key, document);
        return;
    }
    variables::set_local_document(batch, instance.key, document);
    let mut mapped = Document::new();
    for mapping in &def.output_mappings {
        let value = batch
            .state
            .variables
            .get_visible(&batch.state.tree, instance.key, &mapping.source)
            .cloned()
            .unwrap_or(Value::Null);
        mapped.insert(mapping.target.clone(), value);
    }
    variables::propagate(batch, scope_key, &mapped);
}

fn continue_after_completion(
    batch: &mut Batch<'_>,
    instance: &ElementInstance,
    definition: &ProcessDefinition,
    def: &ElementDef,
    route: Option<Route>,
    child_result: Option<Document>,
) {
    if instance.record.is_root() {
        if let Some(result) = child_result {
            request_completion(batch, instance.record.parent_element_instance_key, result, None);
        }
        return;
    }

    let Some(scope) = batch.state.tree.get(instance.flow_scope_key()).cloned() else {
        return;
    };
    let inner = scope.is_multi_instance_body() && scope.element_id() == instance.element_id();
    if inner {
        let sequential = def.multi_instance.as_ref().is_some_and(|mi| mi.sequential);
        let cardinality = def.multi_instance.as_ref().map_or(0, |mi| mi.cardinality);
        if sequential && scope.spawned_inner < cardinality {
            spawn_inner(batch, scope.key, def, scope.spawned_inner + 1);
        } else if batch.state.tree.active_child_count(scope.key) == 0
            && !batch.has_queued_activation_in(scope.key)
        {
            request_completion(batch, scope.key, Document::new(), None);
        }
        return;
    }

    let pending_instruction = batch
        .state
        .runtime_instructions
        .get(&instance.process_instance_key())
        .and_then(|pending| {
            pending
                .iter()
                .find(|i| i.after_element_id() == instance.element_id())
                .cloned()
        });
    if let Some(instruction) = pending_instruction {
        let process_instance_key = instance.process_instance_key();
        let record = RuntimeInstructionRecord {
            process_instance_key,
            element_id: instance.element_id().to_string(),
            instruction: instruction.clone(),
            tenant_id: instance.record.tenant_id.clone(),
        };
        let record_key = batch.next_key();
        match instruction {
            RuntimeInstruction::TerminateProcessInstance { .. } => {
                batch.event(
                    record_key,
                    Intent::RuntimeInstructionInterrupted,
                    RecordValue::RuntimeInstruction(record),
                );
                terminate_tree(batch, process_instance_key);
                return;
            }
            RuntimeInstruction::SuspendProcessInstance { .. } => {
                batch.event(
                    record_key,
                    Intent::RuntimeInstructionSuspended,
                    RecordValue::RuntimeInstruction(record),
                );
                take_outgoing_flows(batch, instance, definition, def, route);
                batch.enqueue(FollowUp::Suspend {
                    process_instance_key,
                });
                return;
            }
        }
    }

    take_outgoing_flows(batch, instance, definition, def, route);
}

fn take_outgoing_flows(
    batch: &mut Batch<'_>,
    instance: &ElementInstance,
    definition: &ProcessDefinition,
    def: &ElementDef,
    route: Option<Route>,
) {
    let scope_key = instance.flow_scope_key();
    let flow_ids: Vec<String> = match (&route, def.element_type) {
        (Some(route), _) => def
            .outgoing
            .iter()
            .filter(|id| {
                definition
                    .element(id)
                    .and_then(|f| f.target.as_deref())
                    == Some(route.target_element_id.as_str())
            })
            .cloned()
            .collect(),
        (None, BpmnElementType::ExclusiveGateway) => {
            match choose_exclusive_flow(batch, definition, def, scope_key) {
                Ok(flow) => flow.into_iter().collect(),
                Err(failure) => {
                    tracing::warn!(element_id = %def.id, message = %failure.message, "no flow to take");
                    Vec::new()
                }
            }
        }
        (None, _) => def
            .outgoing
            .iter()
            .filter(|id| {
                definition
                    .element(id)
                    .and_then(|f| f.condition.as_ref())
                    .map_or(true, |condition| {
                        condition.holds(batch.state.variables.get_visible(
                            &batch.state.tree,
                            scope_key,
                            &condition.variable,
                        ))
                    })
            })
            .cloned()
            .collect(),
    };

    let mut trigger = route.map(|r| r.trigger);
    let mut taken = 0;
    for flow_id in flow_ids {
        let Some(target) = definition
            .element(&flow_id)
            .and_then(|f| f.target.as_deref())
            .and_then(|t| definition.element(t))
        else {
            continue;
        };
        let target_is_join =
            target.element_type == BpmnElementType::ParallelGateway && target.incoming.len() > 1;
        let flow_key = batch.next_key();
        batch.event(
            flow_key,
            Intent::SequenceFlowTaken,
            RecordValue::SequenceFlow(SequenceFlowRecord {
                element_id: flow_id.clone(),
                bpmn_process_id: instance.record.bpmn_process_id.clone(),
                process_instance_key: instance.process_instance_key(),
                flow_scope_key: scope_key,
                target_element_id: target.id.clone(),
                target_is_join,
                tenant_id: instance.record.tenant_id.clone(),
            }),
        );
        taken += 1;

        if target_is_join {
            let arrived = batch
                .state
                .tree
                .get(scope_key)
                .and_then(|scope| scope.pending_joins.get(&target.id))
                .map_or(0, |flows| flows.len());
            if arrived >= target.incoming.len() {
                request_activation(batch, scope_key, target, None);
            }
        } else {
            request_activation(batch, scope_key, target, trigger.take());
        }
    }

    if taken == 0 {
        maybe_complete_scope(batch, scope_key);
    }
}

/// Complete a scope that has nothing left to do.
pub(crate) fn maybe_complete_scope(batch: &mut Batch<'_>, scope_key: Key) {
    let Some(scope) = batch.state.tree.get(scope_key) else {
        return;
    };
    if scope.state != LifecycleState::Activated
        || scope.is_multi_instance_body()
        || scope.has_pending_joins()
        || batch.state.tree.active_child_count(scope_key) > 0
        || batch.has_queued_activation_in(scope_key)
    {
        return;
    }
    request_completion(batch, scope_key, Document::new(), None);
}

// ─── Termination ──────────────────────────────────────────────

/// Terminate an instance and everything below it, including called process
/// instances. Every instance becomes TERMINATING with its side effects run
/// top-down; TERMINATED is then written bottom-up so no scope ends before
/// its children.
pub(crate) fn terminate_tree(batch: &mut Batch<'_>, key: Key) {
    let mut terminated = Vec::new();
    let mut stack = vec![key];
    while let Some(next) = stack.pop() {
        let Some(instance) = batch.state.tree.get(next).cloned() else {
            continue;
        };
        if instance.state == LifecycleState::Terminating {
            continue;
        }
        batch.event(
            next,
            Intent::ElementTerminating,
            RecordValue::ProcessInstance(instance.record.clone()),
        );
        side_effects::run_all(TERMINATION_HANDLERS, batch, next);
        stack.extend(batch.state.tree.dependent_keys(next).into_iter().rev());
        terminated.push(instance);
    }
    for instance in terminated.into_iter().rev() {
        batch.event(
            instance.key,
            Intent::ElementTerminated,
            RecordValue::ProcessInstance(instance.record),
        );
    }
}

// ─── Suspension ───────────────────────────────────────────────

fn root_of(batch: &Batch<'_>, process_instance_key: Key) -> Result<ElementInstance, CommandError> {
    batch
        .state
        .tree
        .get(process_instance_key)
        .filter(|root| root.record.is_root())
        .cloned()
        .ok_or_else(|| {
            CommandError::NotFound(format!(
                "Expected to find process instance with key '{process_instance_key}', but none was found"
            ))
        })
}

/// Called process instances below a root, in pre-order.
fn child_roots(batch: &Batch<'_>, root_key: Key) -> Vec<ElementInstance> {
    batch
        .state
        .tree
        .descendants(root_key)
        .into_iter()
        .filter_map(|key| batch.state.tree.get(key))
        .filter(|instance| instance.record.is_root())
        .cloned()
        .collect()
}

pub(crate) fn suspend_instance(batch: &mut Batch<'_>, process_instance_key: Key) -> Result<(), CommandError> {
    let root = root_of(batch, process_instance_key)?;
    if root.state != LifecycleState::Activated {
        return Err(CommandError::InvalidState(format!(
            "Expected to suspend process instance with key '{process_instance_key}', but it is in state '{}'",
            root.state
        )));
    }

    batch.event(
        root.key,
        Intent::ElementSuspending,
        RecordValue::ProcessInstance(root.record.clone()),
    );
    let children = child_roots(batch, root.key);
    for child in &children {
        batch.event(
            child.key,
            Intent::ElementSuspending,
            RecordValue::ProcessInstance(child.record.clone()),
        );
    }
    let mut scopes = vec![root.key];
    scopes.extend(batch.state.tree.descendants(root.key));
    for scope_key in scopes {
        side_effects::run_all(SUSPENSION_HANDLERS, batch, scope_key);
    }
    for child in children.iter().rev() {
        batch.event(
            child.key,
            Intent::ElementSuspended,
            RecordValue::ProcessInstance(child.record.clone()),
        );
    }
    batch.event(
        root.key,
        Intent::ElementSuspended,
        RecordValue::ProcessInstance(root.record),
    );
    tracing::info!(process_instance_key, "process instance suspended");
    Ok(())
}

pub(crate) fn resume_instance(batch: &mut Batch<'_>, process_instance_key: Key) -> Result<(), CommandError> {
    let root = root_of(batch, process_instance_key)?;
    if root.state != LifecycleState::Suspended {
        return Err(CommandError::InvalidState(format!(
            "Expected to resume process instance with key '{process_instance_key}', but it is not suspended"
        )));
    }

    batch.event(
        root.key,
        Intent::ElementResuming,
        RecordValue::ProcessInstance(root.record.clone()),
    );
    let children = child_roots(batch, root.key);
    for child in &children {
        batch.event(
            child.key,
            Intent::ElementResuming,
            RecordValue::ProcessInstance(child.record.clone()),
        );
    }

    let mut scopes = vec![root.key];
    scopes.extend(batch.state.tree.descendants(root.key));
    for scope_key in scopes {
        restore_side_effects(batch, scope_key);
    }

    for child in children.iter().rev() {
        batch.event(
            child.key,
            Intent::ElementResumed,
            RecordValue::ProcessInstance(child.record.clone()),
        );
        maybe_complete_scope(batch, child.key);
    }
    batch.event(
        root.key,
        Intent::ElementResumed,
        RecordValue::ProcessInstance(root.record),
    );
    maybe_complete_scope(batch, root.key);
    tracing::info!(process_instance_key, "process instance resumed");
    Ok(())
}

/// Re-create what suspension canceled for one waiting instance.
fn restore_side_effects(batch: &mut Batch<'_>, key: Key) {
    let Some(instance) = batch.state.tree.get(key).cloned() else {
        return;
    };
    if !matches!(
        instance.state,
        LifecycleState::Activated | LifecycleState::Resuming
    ) {
        return;
    }
    if let Err(err) = subscriptions::open_for_instance(batch, key, false) {
        raise_incident(batch, key, err.into());
    }
    let Some(definition) = batch.definition_of(&instance.record) else {
        return;
    };
    let Some(def) = definition.element(instance.element_id()) else {
        return;
    };
    match instance.element_type() {
        BpmnElementType::ServiceTask if batch.state.jobs_of(key).is_empty() => {
            create_job(batch, &instance, def)
        }
        BpmnElementType::UserTask if batch.state.user_tasks_of(key).is_empty() => {
            create_user_task(batch, &instance)
        }
        _ => {}
    }
}

// ─── Incidents ────────────────────────────────────────────────

pub(crate) fn resolve_incident(batch: &mut Batch<'_>, incident_key: Key) -> Result<(), CommandError> {
    let incident = batch
        .state
        .incidents
        .get(&incident_key)
        .cloned()
        .ok_or_else(|| {
            CommandError::NotFound(format!(
                "Expected to resolve incident with key '{incident_key}', but no such incident was found"
            ))
        })?;
    let element_instance_key = incident.element_instance_key;
    batch.event(
        incident_key,
        Intent::IncidentResolved,
        RecordValue::Incident(incident),
    );

    let Some(instance) = batch.state.tree.get(element_instance_key).cloned() else {
        return Ok(());
    };
    match (instance.state, instance.element_type()) {
        (LifecycleState::Activating, _) => continue_activation(batch, element_instance_key, None),
        // the called process was not deployed when the call activity activated
        (LifecycleState::Activated, BpmnElementType::CallActivity)
            if instance.called_child.is_none() =>
        {
            let def = batch
                .definition_of(&instance.record)
                .and_then(|definition| definition.element(instance.element_id()).cloned());
            if let Some(def) = def {
                start_called_process(batch, &instance, &def);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Subscriptions for a scope created directly by a modification or a start
/// instruction. Such scopes never run their activation behavior.
pub(crate) fn activate_synthesized_scope(
    batch: &mut Batch<'_>,
    key: Key,
    record: ElementRecord,
) -> Result<(), CorrelationKeyError> {
    batch.event(
        key,
        Intent::ElementActivating,
        RecordValue::ProcessInstance(record.clone()),
    );
    if !batch.state.is_suspended(key) {
        subscriptions::open_for_instance(batch, key, false)?;
    }
    batch.event(key, Intent::ElementActivated, RecordValue::ProcessInstance(record));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::events::RecordType;
    use crate::model::ProcessBuilder;
    use crate::repository::ProcessRepository;
    use crate::state::PartitionState;

    fn run(repository: &ProcessRepository, process_id: &str) -> (PartitionState, Vec<crate::events::Record>) {
        let config = EngineConfig::default();
        let mut batch = Batch::new(PartitionState::new(1), repository, &config, 0);
        let definition = repository
            .latest_by_id(process_id, crate::types::DEFAULT_TENANT)
            .unwrap();
        let key = batch.next_key();
        let record = root_record(&definition, key, None, None);
        enqueue_activation(&mut batch, key, record, None);
        drain(&mut batch).unwrap();
        batch.into_parts()
    }

    fn lifecycle(records: &[crate::events::Record]) -> Vec<String> {
        records
            .iter()
            .filter(|r| r.record_type == RecordType::Event)
            .filter(|r| r.element().is_some())
            .map(|r| format!("{}:{}", r.element_id(), r.intent.short_name()))
            .collect()
    }

    #[test]
    fn straight_through_process_completes() {
        let mut repository = ProcessRepository::new();
        repository.deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .task("A")
                .end_event("end")
                .chain(&["start", "A", "end"])
                .build()
                .unwrap(),
        );
        let (state, records) = run(&repository, "p");
        assert!(state.tree.is_empty());
        assert_eq!(
            lifecycle(&records),
            vec![
                "p:ACTIVATING",
                "p:ACTIVATED",
                "start:ACTIVATING",
                "start:ACTIVATED",
                "start:COMPLETING",
                "start:COMPLETED",
                "A:ACTIVATING",
                "A:ACTIVATED",
                "A:COMPLETING",
                "A:COMPLETED",
                "end:ACTIVATING",
                "end:ACTIVATED",
                "end:COMPLETING",
                "end:COMPLETED",
                "p:COMPLETING",
                "p:COMPLETED",
            ]
        );
    }

    #[test]
    fn parallel_join_waits_for_all_branches() {
        let mut repository = ProcessRepository::new();
        repository.deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .parallel_gateway("fork")
                .task("A")
                .task("B")
                .parallel_gateway("join")
                .end_event("end")
                .chain(&["start", "fork", "A", "join", "end"])
                .chain(&["fork", "B", "join"])
                .build()
                .unwrap(),
        );
        let (state, records) = run(&repository, "p");
        assert!(state.tree.is_empty());
        let joins = lifecycle(&records)
            .into_iter()
            .filter(|e| e == "join:ACTIVATED")
            .count();
        assert_eq!(joins, 1);
    }

    #[test]
    fn parallel_multi_instance_spawns_all_inner_instances() {
        let mut repository = ProcessRepository::new();
        repository.deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .user_task("A")
                .with(|a| a.multi_instance = Some(crate::model::MultiInstanceSpec { sequential: false, cardinality: 3 }))
                .chain(&["start", "A"])
                .build()
                .unwrap(),
        );
        let (state, _) = run(&repository, "p");
        assert_eq!(state.count_of_type(BpmnElementType::MultiInstanceBody), 1);
        assert_eq!(state.count_of_type(BpmnElementType::UserTask), 3);
        assert_eq!(state.user_tasks.len(), 3);
    }

    #[test]
    fn exclusive_gateway_without_match_raises_incident() {
        let mut repository = ProcessRepository::new();
        repository.deploy(
            ProcessBuilder::new("p")
                .start_event("start")
                .exclusive_gateway("gw")
                .end_event("a")
                .chain(&["start", "gw"])
                .conditional_flow(
                    "to_a",
                    "gw",
                    "a",
                    crate::model::Condition {
                        variable: "go".into(),
                        equals: None,
                    },
                )
                .build()
                .unwrap(),
        );
        let (state, _) = run(&repository, "p");
        assert_eq!(state.incidents.len(), 1);
        let incident = state.incidents.values().next().unwrap();
        assert_eq!(incident.error_type, ErrorType::ConditionError);
        let gateway = state.tree.get(incident.element_instance_key).unwrap();
        assert_eq!(gateway.state, LifecycleState::Activating);
    }
}
