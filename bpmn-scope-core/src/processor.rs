//! Command dispatch.
//!
//! One inbound command becomes one batch. Handlers write into the batch and
//! drain its follow-ups; any [`CommandError`] drops the batch and the command
//! is answered with a single rejection record instead.

use crate::auth::{self, AuthorizationChecker, Permission, RequestMetadata};
use crate::commands::{Command, MigrateCommand};
use crate::config::EngineConfig;
use crate::creation;
use crate::events::{Intent, MigrationRecord, Record, RecordValue, TriggerRecord};
use crate::lifecycle;
use crate::modification;
use crate::rejection::{quote_join, CommandError, Rejection, RejectionContext};
use crate::repository::ProcessRepository;
use crate::scope_tree::ElementInstance;
use crate::state::PartitionState;
use crate::subscriptions;
use crate::types::{Document, Key, LifecycleState, Timestamp, NO_KEY};
use crate::variables;
use crate::writer::Batch;

/// Result of processing one command against a state.
#[derive(Debug, Clone, PartialEq)]
pub struct Processed {
    /// State after the batch; unchanged apart from the position for rejections.
    pub state: PartitionState,
    pub records: Vec<Record>,
    /// Key of the created or addressed entity, or the rejection.
    pub outcome: Result<Key, Rejection>,
}

pub struct CommandProcessor<'a> {
    repository: &'a ProcessRepository,
    config: &'a EngineConfig,
    checker: &'a dyn AuthorizationChecker,
}

impl<'a> CommandProcessor<'a> {
    pub fn new(
        repository: &'a ProcessRepository,
        config: &'a EngineConfig,
        checker: &'a dyn AuthorizationChecker,
    ) -> Self {
        Self {
            repository,
            config,
            checker,
        }
    }

    pub fn process(
        &self,
        state: &PartitionState,
        command: &Command,
        metadata: &RequestMetadata,
        now: Timestamp,
    ) -> Processed {
        let intent = command.intent();
        tracing::debug!(intent = intent.short_name(), key = ?command.target_key(), "processing command");

        // shares every component with `state` until a record changes it
        let mut batch = Batch::new(state.clone(), self.repository, self.config, now);
        match self.dispatch(&mut batch, command, metadata) {
            Ok(key) => {
                let (state, records) = batch.into_parts();
                tracing::debug!(intent = intent.short_name(), key, records = records.len(), "command accepted");
                Processed {
                    state,
                    records,
                    outcome: Ok(key),
                }
            }
            Err(err) => {
                let context = rejection_context(state, command);
                let rejection = Rejection::new(&err, &context).for_command(intent);
                tracing::info!(
                    intent = intent.short_name(),
                    rejection_type = %rejection.rejection_type,
                    reason = %rejection.reason,
                    "command rejected"
                );
                let mut batch = Batch::new(state.clone(), self.repository, self.config, now);
                batch.rejection(
                    command.target_key().unwrap_or(NO_KEY),
                    intent,
                    RecordValue::Rejection(rejection.to_record(&context)),
                );
                let (state, records) = batch.into_parts();
                Processed {
                    state,
                    records,
                    outcome: Err(rejection),
                }
            }
        }
    }

    fn dispatch(
        &self,
        batch: &mut Batch<'_>,
        command: &Command,
        metadata: &RequestMetadata,
    ) -> Result<Key, CommandError> {
        let checker = self.checker;
        match command {
            Command::Create(create) => creation::create(batch, checker, metadata, create),
            Command::Modify(modify) => modification::modify(batch, checker, metadata, modify),
            Command::ActivateElement {
                process_instance_key,
                element_id,
                ancestor_scope_key,
            } => modification::activate_element(
                batch,
                checker,
                metadata,
                *process_instance_key,
                element_id,
                *ancestor_scope_key,
            ),
            Command::TerminateElement {
                element_instance_key,
            } => modification::terminate_element(batch, checker, metadata, *element_instance_key),
            Command::CompleteElement {
                element_instance_key,
                variables,
            } => complete_element(batch, metadata, *element_instance_key, variables),
            Command::Cancel {
                process_instance_key,
            } => self.cancel(batch, metadata, *process_instance_key),
            Command::Suspend {
                process_instance_key,
            } => {
                let root = self.updatable_root(batch, metadata, *process_instance_key, "suspend")?;
                lifecycle::suspend_instance(batch, root.key)?;
                lifecycle::drain(batch)?;
                Ok(root.key)
            }
            Command::Resume {
                process_instance_key,
            } => {
                let root = self.updatable_root(batch, metadata, *process_instance_key, "resume")?;
                lifecycle::resume_instance(batch, root.key)?;
                lifecycle::drain(batch)?;
                Ok(root.key)
            }
            Command::CorrelateMessage {
                name,
                correlation_key,
                tenant_id,
                variables,
            } => {
                if !metadata.sees_tenant(self.config.multi_tenancy, tenant_id) {
                    return Err(CommandError::NotFound(format!(
                        "Expected to correlate message '{name}' with correlation key '{correlation_key}', but no subscription was found"
                    )));
                }
                let correlated =
                    subscriptions::correlate_message(batch, name, correlation_key, tenant_id, variables)?;
                lifecycle::drain(batch)?;
                Ok(correlated.first().copied().unwrap_or(NO_KEY))
            }
            Command::TriggerTimer { subscription_key } => trigger_timer(batch, *subscription_key),
            Command::ResolveIncident { incident_key } => {
                let owner = batch
                    .state
                    .incidents
                    .get(incident_key)
                    .map(|incident| incident.tenant_id.clone());
                if owner.is_some_and(|tenant| !metadata.sees_tenant(self.config.multi_tenancy, &tenant)) {
                    return Err(CommandError::NotFound(format!(
                        "Expected to resolve incident with key '{incident_key}', but no such incident was found"
                    )));
                }
                lifecycle::resolve_incident(batch, *incident_key)?;
                lifecycle::drain(batch)?;
                Ok(*incident_key)
            }
            Command::SetVariables {
                scope_key,
                variables,
                local,
            } => set_variables(batch, metadata, *scope_key, variables, *local),
            Command::Migrate(migrate) => self.migrate(batch, metadata, migrate),
        }
    }

    // ─── Process instance commands ────────────────────────────

    /// Root of a process instance the requester may update. Child instances
    /// are only updated through their root.
    fn updatable_root(
        &self,
        batch: &Batch<'_>,
        metadata: &RequestMetadata,
        process_instance_key: Key,
        action: &str,
    ) -> Result<ElementInstance, CommandError> {
        let root = visible_root(batch, metadata, process_instance_key).ok_or_else(|| {
            CommandError::NotFound(format!(
                "Expected to {action} a process instance with key '{process_instance_key}', but no such process was found"
            ))
        })?;
        if root.record.has_parent_process() {
            let outermost = batch
                .state
                .tree
                .root_process_instance_of(process_instance_key)
                .map_or(process_instance_key, |r| r.key);
            let capitalized = capitalize(action);
            return Err(CommandError::InvalidState(format!(
                "Expected to {action} a process instance with key '{process_instance_key}', but it is created by a parent process instance. {capitalized} the root process instance '{outermost}' instead."
            )));
        }
        auth::require(
            self.checker,
            metadata,
            Permission::UpdateProcessInstance,
            &root.record.bpmn_process_id,
        )?;
        Ok(root)
    }

    fn cancel(&self, batch: &mut Batch<'_>, metadata: &RequestMetadata, process_instance_key: Key) -> Result<Key, CommandError> {
        let root = self.updatable_root(batch, metadata, process_instance_key, "cancel")?;
        tracing::info!(process_instance_key, state = %root.state, "canceling process instance");
        lifecycle::terminate_tree(batch, root.key);
        lifecycle::drain(batch)?;
        Ok(root.key)
    }

    fn migrate(&self, batch: &mut Batch<'_>, metadata: &RequestMetadata, command: &MigrateCommand) -> Result<Key, CommandError> {
        let process_instance_key = command.process_instance_key;
        let root = self.updatable_root(batch, metadata, process_instance_key, "migrate")?;
        if batch.state.is_suspended(process_instance_key) {
            return Err(CommandError::InvalidState(format!(
                "Expected to migrate process instance with key '{process_instance_key}', but it is suspended"
            )));
        }
        let target = self
            .repository
            .get(command.target_process_definition_key)
            .filter(|target| target.tenant_id == root.record.tenant_id)
            .ok_or_else(|| {
                CommandError::NotFound(format!(
                    "Expected to migrate process instance to process definition with key '{}', but no such process definition was found",
                    command.target_process_definition_key
                ))
            })?;

        let instances: Vec<ElementInstance> = batch
            .state
            .tree
            .instance_keys_of(process_instance_key)
            .into_iter()
            .filter_map(|key| batch.state.tree.get(key).cloned())
            .collect();

        let mut unmapped = Vec::new();
        let mut moved_scope = Vec::new();
        for instance in instances.iter().filter(|i| !i.record.is_root()) {
            let target_id = command.target_of(instance.element_id());
            let Some(target_def) = target.element(target_id) else {
                unmapped.push(instance.element_id().to_string());
                continue;
            };
            let source_type = batch
                .definition_of(&instance.record)
                .and_then(|source| source.element(instance.element_id()).map(|e| e.element_type));
            if source_type != Some(target_def.element_type) {
                unmapped.push(instance.element_id().to_string());
                continue;
            }
            let mut flow_scope = batch.state.tree.get_flow_scope(instance.key);
            while let Some(body) = flow_scope.filter(|s| s.is_multi_instance_body()) {
                flow_scope = batch.state.tree.get_flow_scope(body.key);
            }
            let expected_scope = flow_scope
                .map(|scope| {
                    if scope.record.is_root() {
                        target.bpmn_process_id.clone()
                    } else {
                        command.target_of(scope.element_id()).to_string()
                    }
                });
            if target_def.flow_scope != expected_scope {
                moved_scope.push(instance.element_id().to_string());
            }
        }
        if !unmapped.is_empty() {
            return Err(CommandError::InvalidArgument(format!(
                "Expected to migrate process instance '{process_instance_key}' but active elements with ids '{}' are not mapped to an element of the same type in process definition '{}'",
                quote_join(dedup(unmapped)),
                target.key
            )));
        }
        if !moved_scope.is_empty() {
            return Err(CommandError::InvalidArgument(format!(
                "Expected to migrate process instance '{process_instance_key}' but the flow scope of active elements with ids '{}' would change",
                quote_join(dedup(moved_scope))
            )));
        }

        for instance in &instances {
            let mut record = instance.record.clone();
            record.bpmn_process_id = target.bpmn_process_id.clone();
            record.version = target.version;
            record.process_definition_key = target.key;
            record.element_id = if record.is_root() {
                target.bpmn_process_id.clone()
            } else {
                command.target_of(instance.element_id()).to_string()
            };
            if let Some(last) = record.process_definition_path.last_mut() {
                *last = target.key;
            }
            batch.event(instance.key, Intent::ElementMigrated, RecordValue::ProcessInstance(record));
        }
        for instance in &instances {
            if !batch.state.tree.is_active(instance.key) {
                continue;
            }
            subscriptions::close_for_scope(batch, instance.key);
            subscriptions::open_for_instance(batch, instance.key, false)
                .map_err(|err| CommandError::InvalidArgument(err.to_string()))?;
        }

        batch.event(
            process_instance_key,
            Intent::Migrated,
            RecordValue::Migration(MigrationRecord {
                process_instance_key,
                target_process_definition_key: target.key,
                tenant_id: root.record.tenant_id.clone(),
            }),
        );
        tracing::info!(process_instance_key, target = target.key, "process instance migrated");
        Ok(process_instance_key)
    }
}

// ─── Element commands ─────────────────────────────────────────

fn complete_element(
    batch: &mut Batch<'_>,
    metadata: &RequestMetadata,
    key: Key,
    variables: &Document,
) -> Result<Key, CommandError> {
    let multi_tenancy = batch.config().multi_tenancy;
    let instance = batch
        .state
        .tree
        .get(key)
        .filter(|instance| metadata.sees_tenant(multi_tenancy, &instance.record.tenant_id))
        .cloned()
        .ok_or_else(|| {
            CommandError::NotFound(format!(
                "Expected to complete element instance with key '{key}', but no such element instance was found"
            ))
        })?;
    if batch.state.is_suspended(key) {
        return Err(CommandError::InvalidState(format!(
            "Expected to complete element of process instance with key '{}', but it is suspended",
            instance.process_instance_key()
        )));
    }
    if instance.state != LifecycleState::Activated {
        return Err(CommandError::InvalidState(format!(
            "Expected to complete element instance with key '{key}', but it is in state '{}'",
            instance.state
        )));
    }
    if instance.is_multi_instance_body() || batch.state.tree.active_child_count(key) > 0 {
        return Err(CommandError::InvalidState(format!(
            "Expected to complete element instance with key '{key}', but it has active child instances"
        )));
    }
    if !instance.record.is_root() && !lifecycle::is_live_scope(&batch.state.tree, instance.flow_scope_key()) {
        return Err(CommandError::InvalidState(format!(
            "Expected to complete element instance with key '{key}', but its flow scope is not active"
        )));
    }

    lifecycle::request_completion(batch, key, variables.clone(), None);
    lifecycle::drain(batch)?;
    Ok(key)
}

fn trigger_timer(batch: &mut Batch<'_>, subscription_key: Key) -> Result<Key, CommandError> {
    let is_timer = batch
        .state
        .subscriptions
        .get(subscription_key)
        .is_some_and(|s| matches!(s.trigger, TriggerRecord::Timer { .. }));
    if !is_timer {
        return Err(CommandError::NotFound(format!(
            "Expected to trigger timer with key '{subscription_key}', but no such timer was found"
        )));
    }
    subscriptions::trigger(batch, subscription_key, Document::new());
    lifecycle::drain(batch)?;
    Ok(subscription_key)
}

fn set_variables(
    batch: &mut Batch<'_>,
    metadata: &RequestMetadata,
    scope_key: Key,
    document: &Document,
    local: bool,
) -> Result<Key, CommandError> {
    let multi_tenancy = batch.config().multi_tenancy;
    let visible = batch
        .state
        .tree
        .get(scope_key)
        .is_some_and(|instance| metadata.sees_tenant(multi_tenancy, &instance.record.tenant_id));
    if !visible {
        return Err(CommandError::NotFound(format!(
            "Expected to update variables for element with key '{scope_key}', but no such element was found"
        )));
    }
    if local {
        variables::set_local_document(batch, scope_key, document);
    } else {
        variables::propagate(batch, scope_key, document);
    }
    Ok(scope_key)
}

// ─── Helpers ──────────────────────────────────────────────────

fn visible_root(batch: &Batch<'_>, metadata: &RequestMetadata, process_instance_key: Key) -> Option<ElementInstance> {
    batch
        .state
        .tree
        .get(process_instance_key)
        .filter(|root| root.record.is_root())
        .filter(|root| metadata.sees_tenant(batch.config().multi_tenancy, &root.record.tenant_id))
        .cloned()
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !result.contains(&item) {
            result.push(item);
        }
    }
    result
}

/// Identity of what the command addressed, as far as the state knows it.
fn rejection_context(state: &PartitionState, command: &Command) -> RejectionContext {
    let tree = &state.tree;
    let element_key = match command {
        Command::Create(create) => {
            let mut context = RejectionContext::unknown(NO_KEY, create.tenant_id.clone());
            context.element_id = create.bpmn_process_id.clone().unwrap_or_default();
            return context;
        }
        Command::CorrelateMessage { tenant_id, .. } => {
            return RejectionContext::unknown(NO_KEY, tenant_id.clone());
        }
        Command::TriggerTimer { subscription_key } => state
            .subscriptions
            .get(*subscription_key)
            .map_or(NO_KEY, |s| s.scope_key),
        Command::ResolveIncident { incident_key } => state
            .incidents
            .get(incident_key)
            .map_or(NO_KEY, |i| i.element_instance_key),
        other => other.target_key().unwrap_or(NO_KEY),
    };

    match tree.get(element_key) {
        Some(instance) => RejectionContext {
            process_instance_key: instance.process_instance_key(),
            root_process_instance_key: tree
                .root_process_instance_of(element_key)
                .map_or(instance.process_instance_key(), |root| root.key),
            tenant_id: instance.record.tenant_id.clone(),
            element_id: instance.element_id().to_string(),
            bpmn_element_type: instance.element_type(),
            flow_scope_key: instance.flow_scope_key(),
        },
        None => RejectionContext::unknown(element_key, crate::types::DEFAULT_TENANT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::commands::CreateCommand;
    use crate::events::RecordType;
    use crate::model::ProcessBuilder;
    use crate::types::RejectionType;
    use std::sync::Arc;

    fn repository() -> ProcessRepository {
        let mut repository = ProcessRepository::new();
        repository.deploy(
            ProcessBuilder::new("order")
                .start_event("start")
                .user_task("A")
                .end_event("end")
                .chain(&["start", "A", "end"])
                .build()
                .unwrap(),
        );
        repository
    }

    #[test]
    fn rejection_writes_exactly_one_record() {
        let repository = repository();
        let config = EngineConfig::default();
        let processor = CommandProcessor::new(&repository, &config, &AllowAll);
        let state = PartitionState::new(1);

        let processed = processor.process(
            &state,
            &Command::Cancel {
                process_instance_key: 99,
            },
            &RequestMetadata::default(),
            0,
        );
        assert_eq!(processed.records.len(), 1);
        assert_eq!(processed.records[0].record_type, RecordType::CommandRejection);
        let rejection = processed.outcome.unwrap_err();
        assert_eq!(rejection.rejection_type, RejectionType::NotFound);
        assert_eq!(processed.state.tree, state.tree);
    }

    #[test]
    fn completing_a_user_task_finishes_the_instance() {
        let repository = repository();
        let config = EngineConfig::default();
        let processor = CommandProcessor::new(&repository, &config, &AllowAll);
        let metadata = RequestMetadata::default();

        let created = processor.process(
            &PartitionState::new(1),
            &Command::Create(CreateCommand::by_id("order")),
            &metadata,
            0,
        );
        let task = created
            .state
            .tree
            .iter()
            .find(|i| i.element_id() == "A")
            .map(|i| i.key)
            .unwrap();

        let completed = processor.process(
            &created.state,
            &Command::CompleteElement {
                element_instance_key: task,
                variables: Document::new(),
            },
            &metadata,
            0,
        );
        assert_eq!(completed.outcome, Ok(task));
        assert!(completed.state.tree.is_empty());
        assert!(completed.state.user_tasks.is_empty());
    }

    #[test]
    fn untouched_components_stay_shared_with_the_committed_state() {
        let repository = repository();
        let config = EngineConfig::default();
        let processor = CommandProcessor::new(&repository, &config, &AllowAll);
        let metadata = RequestMetadata::default();
        let created = processor.process(
            &PartitionState::new(1),
            &Command::Create(CreateCommand::by_id("order")),
            &metadata,
            0,
        );
        let root = *created.outcome.as_ref().unwrap();

        let updated = processor.process(
            &created.state,
            &Command::SetVariables {
                scope_key: root,
                variables: serde_json::json!({"x": 1}).as_object().cloned().unwrap(),
                local: false,
            },
            &metadata,
            0,
        );
        assert!(updated.outcome.is_ok());
        assert!(Arc::ptr_eq(&updated.state.tree, &created.state.tree));
        assert!(Arc::ptr_eq(&updated.state.user_tasks, &created.state.user_tasks));
        assert!(!Arc::ptr_eq(&updated.state.variables, &created.state.variables));
        assert!(created.state.variables.get_local(root, "x").is_none());
        assert!(updated.state.variables.get_local(root, "x").is_some());
    }

    #[test]
    fn capitalize_first_letter() {
        assert_eq!(capitalize("cancel"), "Cancel");
        assert_eq!(capitalize(""), "");
    }
}
