//! CREATE_PROCESS_INSTANCE, with and without start instructions.
//!
//! Without start instructions the root activates normally and runs from its
//! none start event. With start instructions the root is synthesized, the
//! flow scopes of every target are created top-down and only the targets
//! themselves are activated.

use crate::auth::{self, AuthorizationChecker, Permission, RequestMetadata};
use crate::commands::CreateCommand;
use crate::events::{CreationRecord, Intent, RecordValue};
use crate::lifecycle;
use crate::rejection::{quote_join, CommandError};
use crate::repository::{ProcessDefinition, ProcessRepository};
use crate::start_instructions::{self, ScopeResolver};
use crate::types::{BpmnElementType, Key, DEFAULT_TENANT};
use crate::variables;
use crate::writer::Batch;
use regex::Regex;
use std::sync::{Arc, OnceLock};

const TAG_FORMAT: &str = r"^[A-Za-z][A-Za-z0-9_.:-]{0,99}$";

static TAG_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn is_valid_tag(tag: &str) -> bool {
    TAG_PATTERN
        .get_or_init(|| Regex::new(TAG_FORMAT).ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(tag))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CreationError {
    #[error("Expected at least a bpmnProcessId or a key greater than -1, but the bpmnProcessId was '' and the key was '-1'")]
    NoProcessReference,

    #[error("Expected to find process definition with process ID '{0}', but none found")]
    ProcessIdNotFound(String),

    #[error("Expected to find process definition with process ID '{process_id}' and version '{version}', but none found")]
    VersionNotFound { process_id: String, version: u32 },

    #[error("Expected to find process definition with key '{0}', but none found")]
    KeyNotFound(Key),

    #[error("The provided number of tags exceeds the limit of {0}.")]
    TooManyTags(usize),

    #[error("The provided tag '{0}' is not valid. Tags must start with a letter (a-z, A-Z), followed by alphanumerics, underscores, minuses, colons, or periods. It must not be blank and must be 100 characters or less.")]
    InvalidTag(String),

    #[error("Expected to create instance of process with start instructions but no element found with id '{0}'.")]
    StartElementNotFound(String),

    #[error("Expected to create instance of process with start instructions but the element with id '{ids}' targets unsupported element type '{types}'. Supported element types are: [{supported}]")]
    UnsupportedStartElement {
        ids: String,
        types: String,
        supported: String,
    },

    #[error("Expected to create instance of process with start instructions but the element with id '{0}' is inside a multi-instance subprocess. The creation of elements inside a multi-instance subprocess is not supported.")]
    StartInsideMultiInstance(String),

    #[error("Expected to create instance of process with start instructions but the element with id '{0}' belongs to an event-based gateway. The creation of elements belonging to an event-based gateway is not supported.")]
    StartAtEventBasedGatewayMember(String),

    #[error("Expected to create instance of process with runtime instructions but no element found with id '{0}'.")]
    RuntimeInstructionElementNotFound(String),

    #[error("Expected to create instance of process with tenant identifier '{0}', but user is not authorized for this tenant")]
    TenantNotAuthorized(String),

    #[error("Expected to create instance of process with tenant identifier '{0}', but multi-tenancy is disabled")]
    MultiTenancyDisabled(String),

    #[error("Expected to subscribe to catch event(s) of '{element_id}' but {message}")]
    SubscriptionFailed { element_id: String, message: String },
}

impl From<CreationError> for CommandError {
    fn from(err: CreationError) -> Self {
        let message = err.to_string();
        match err {
            CreationError::ProcessIdNotFound(_)
            | CreationError::VersionNotFound { .. }
            | CreationError::KeyNotFound(_) => CommandError::NotFound(message),
            CreationError::TenantNotAuthorized(_) => CommandError::Forbidden(message),
            _ => CommandError::InvalidArgument(message),
        }
    }
}

// ─── Validation ───────────────────────────────────────────────

fn lookup(repository: &ProcessRepository, command: &CreateCommand) -> Result<Arc<ProcessDefinition>, CreationError> {
    let process_id = command
        .bpmn_process_id
        .as_deref()
        .filter(|id| !id.trim().is_empty());
    match (process_id, command.process_definition_key) {
        (Some(process_id), _) => match command.version {
            Some(version) => repository
                .by_id_and_version(process_id, version, &command.tenant_id)
                .ok_or_else(|| CreationError::VersionNotFound {
                    process_id: process_id.to_string(),
                    version,
                }),
            None => repository
                .latest_by_id(process_id, &command.tenant_id)
                .ok_or_else(|| CreationError::ProcessIdNotFound(process_id.to_string())),
        },
        (None, Some(key)) => repository.get(key).ok_or(CreationError::KeyNotFound(key)),
        (None, None) => Err(CreationError::NoProcessReference),
    }
}

fn validate_tags(tags: &[String], max_tags: usize) -> Result<(), CreationError> {
    if tags.len() > max_tags {
        return Err(CreationError::TooManyTags(max_tags));
    }
    match tags.iter().find(|tag| !is_valid_tag(tag)) {
        Some(tag) => Err(CreationError::InvalidTag(tag.clone())),
        None => Ok(()),
    }
}

fn validate_start_instructions(definition: &ProcessDefinition, command: &CreateCommand) -> Result<(), CreationError> {
    let ids = &command.start_instructions;

    let missing: Vec<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| !definition.contains(id))
        .collect();
    if !missing.is_empty() {
        return Err(CreationError::StartElementNotFound(quote_join(missing)));
    }

    let elements: Vec<_> = ids.iter().filter_map(|id| definition.element(id)).collect();

    let unsupported: Vec<_> = elements
        .iter()
        .filter(|e| start_instructions::has_unsupported_type(e))
        .collect();
    if !unsupported.is_empty() {
        let supported: Vec<&str> = BpmnElementType::supported_activation_targets()
            .iter()
            .map(BpmnElementType::as_str)
            .collect();
        return Err(CreationError::UnsupportedStartElement {
            ids: quote_join(unsupported.iter().map(|e| &e.id)),
            types: quote_join(unsupported.iter().map(|e| e.element_type)),
            supported: supported.join(", "),
        });
    }

    let inside_multi_instance: Vec<&str> = elements
        .iter()
        .filter(|e| start_instructions::enclosing_multi_instance(definition, &e.id).is_some())
        .map(|e| e.id.as_str())
        .collect();
    if !inside_multi_instance.is_empty() {
        return Err(CreationError::StartInsideMultiInstance(quote_join(inside_multi_instance)));
    }

    let gateway_members: Vec<&str> = elements
        .iter()
        .filter(|e| start_instructions::belongs_to_event_based_gateway(e))
        .map(|e| e.id.as_str())
        .collect();
    if !gateway_members.is_empty() {
        return Err(CreationError::StartAtEventBasedGatewayMember(quote_join(gateway_members)));
    }

    let unknown_after: Vec<&str> = command
        .runtime_instructions
        .iter()
        .map(|instruction| instruction.after_element_id())
        .filter(|id| !definition.contains(id))
        .collect();
    if !unknown_after.is_empty() {
        return Err(CreationError::RuntimeInstructionElementNotFound(quote_join(unknown_after)));
    }
    Ok(())
}

fn validate_tenant(multi_tenancy: bool, metadata: &RequestMetadata, tenant_id: &str) -> Result<(), CreationError> {
    if !multi_tenancy {
        if tenant_id != DEFAULT_TENANT {
            return Err(CreationError::MultiTenancyDisabled(tenant_id.to_string()));
        }
        return Ok(());
    }
    if metadata.is_tenant_authorized(tenant_id) {
        Ok(())
    } else {
        Err(CreationError::TenantNotAuthorized(tenant_id.to_string()))
    }
}

pub(crate) fn validate(
    repository: &ProcessRepository,
    multi_tenancy: bool,
    max_tags: usize,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    command: &CreateCommand,
) -> Result<Arc<ProcessDefinition>, CommandError> {
    let definition = lookup(repository, command)?;
    validate_tags(&command.tags, max_tags)?;
    validate_start_instructions(&definition, command)?;
    auth::require(
        checker,
        metadata,
        Permission::CreateProcessInstance,
        &definition.bpmn_process_id,
    )?;
    validate_tenant(multi_tenancy, metadata, &definition.tenant_id)?;
    Ok(definition)
}

// ─── Execution ────────────────────────────────────────────────

pub(crate) fn create(
    batch: &mut Batch<'_>,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    command: &CreateCommand,
) -> Result<Key, CommandError> {
    let config = batch.config();
    let definition = validate(
        batch.repository(),
        config.multi_tenancy,
        config.max_tags,
        checker,
        metadata,
        command,
    )?;

    let key = batch.next_key();
    let tenant_id = definition.tenant_id.clone();
    let record = lifecycle::root_record(&definition, key, None, command.business_id.clone());
    for (name, value) in &command.variables {
        variables::write_variable(batch, key, key, &tenant_id, name, value.clone());
    }

    if command.start_instructions.is_empty() {
        lifecycle::enqueue_activation(batch, key, record, None);
    } else {
        lifecycle::activate_synthesized_scope(batch, key, record).map_err(|err| {
            CreationError::SubscriptionFailed {
                element_id: err.catch_element_id.clone(),
                message: err.to_string(),
            }
        })?;
        let mut started = Vec::new();
        for element_id in &command.start_instructions {
            if started.contains(element_id) {
                continue;
            }
            start_at(batch, &definition, key, element_id)?;
            started.push(element_id.clone());
        }
    }

    batch.event(
        key,
        Intent::Created,
        RecordValue::Creation(CreationRecord {
            process_instance_key: key,
            process_definition_key: definition.key,
            bpmn_process_id: definition.bpmn_process_id.clone(),
            version: definition.version,
            tenant_id,
            start_instructions: command.start_instructions.clone(),
            tags: command.tags.clone(),
            business_id: command.business_id.clone(),
            runtime_instructions: command.runtime_instructions.clone(),
        }),
    );
    tracing::info!(
        process_instance_key = key,
        process_id = %definition.bpmn_process_id,
        version = definition.version,
        "process instance created"
    );
    lifecycle::drain(batch)?;
    Ok(key)
}

/// Synthesize the missing flow scopes of one start instruction and queue the
/// target. Scopes synthesized for an earlier instruction are reused.
fn start_at(
    batch: &mut Batch<'_>,
    definition: &ProcessDefinition,
    process_instance_key: Key,
    element_id: &str,
) -> Result<(), CommandError> {
    let plan = ScopeResolver::new(definition, &batch.state.tree, process_instance_key)
        .resolve(element_id, None)
        .map_err(|err| CommandError::InvalidArgument(err.to_string()))?;

    let mut flow_scope_key = plan.attach_to;
    for scope_id in &plan.create {
        let (Some(scope_def), Some(flow_scope)) = (
            definition.element(scope_id),
            batch.state.tree.get(flow_scope_key).cloned(),
        ) else {
            return Ok(());
        };
        let key = batch.next_key();
        let record = lifecycle::element_record(&flow_scope, scope_def, key);
        lifecycle::activate_synthesized_scope(batch, key, record).map_err(|err| {
            CreationError::SubscriptionFailed {
                element_id: scope_id.clone(),
                message: err.to_string(),
            }
        })?;
        flow_scope_key = key;
    }

    let (Some(target), Some(flow_scope)) = (
        definition.element(element_id),
        batch.state.tree.get(flow_scope_key).cloned(),
    ) else {
        return Ok(());
    };
    let key = batch.next_key();
    let record = lifecycle::element_record(&flow_scope, target, key);
    lifecycle::enqueue_activation(batch, key, record, None);
    Ok(())
}
