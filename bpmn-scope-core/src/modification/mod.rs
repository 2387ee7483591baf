//! Process instance modification: activate, terminate and move element
//! instances of a running process instance in one atomic command.
//!
//! Validation reads the state as of command receipt and writes nothing; only
//! a fully valid command reaches [`execute`].

mod error;
mod execute;
mod instructions;
mod validate;

pub use error::ModificationError;
pub use instructions::{
    ActivateInstruction, AncestorSelection, ModificationInstruction, ModifyCommand, MoveInstruction,
    TerminateInstruction,
};
pub(crate) use validate::topmost_active_instances;

use crate::auth::{AuthorizationChecker, RequestMetadata};
use crate::rejection::CommandError;
use crate::types::Key;
use crate::writer::Batch;

pub(crate) fn modify(
    batch: &mut Batch<'_>,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    command: &ModifyCommand,
) -> Result<Key, CommandError> {
    let validated = validate::validate(
        &batch.state,
        batch.repository(),
        batch.config(),
        checker,
        metadata,
        command,
    )?;
    tracing::debug!(
        process_instance_key = command.process_instance_key,
        terminations = validated.terminations.len(),
        activations = validated.activations.len(),
        "modification validated"
    );
    execute::execute(batch, validated)?;
    Ok(command.process_instance_key)
}

/// ACTIVATE_ELEMENT: a modification with one activate instruction.
pub(crate) fn activate_element(
    batch: &mut Batch<'_>,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    process_instance_key: Key,
    element_id: &str,
    ancestor_scope_key: Option<Key>,
) -> Result<Key, CommandError> {
    let mut instruction = ActivateInstruction::new(element_id);
    instruction.ancestor_scope_key = ancestor_scope_key;
    let command = ModifyCommand::new(process_instance_key).activate(instruction);
    modify(batch, checker, metadata, &command)
}

/// TERMINATE_ELEMENT: a modification with one terminate instruction, addressed
/// by element instance key alone.
pub(crate) fn terminate_element(
    batch: &mut Batch<'_>,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    element_instance_key: Key,
) -> Result<Key, CommandError> {
    let process_instance_key = batch
        .state
        .tree
        .get(element_instance_key)
        .map(|instance| instance.process_instance_key())
        .ok_or_else(|| {
            CommandError::NotFound(format!(
                "Expected to terminate element instance with key '{element_instance_key}', but no such element instance was found"
            ))
        })?;
    let command = ModifyCommand::new(process_instance_key).terminate_key(element_instance_key);
    modify(batch, checker, metadata, &command)
}
