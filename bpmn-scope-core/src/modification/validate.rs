//! Validation of a MODIFY command against the current partition state.
//!
//! Checks run in a fixed order and stop at the first failing kind; all
//! offenders of that kind are reported together. Nothing here writes.

use super::error::ModificationError;
use super::instructions::{
    ActivateInstruction, AncestorSelection, ModificationInstruction, ModifyCommand, MoveInstruction,
    TerminateInstruction,
};
use crate::auth::{self, AuthorizationChecker, Permission, RequestMetadata};
use crate::config::EngineConfig;
use crate::rejection::{quote_join, CommandError};
use crate::repository::{ProcessDefinition, ProcessRepository};
use crate::scope_tree::ScopeTree;
use crate::start_instructions::{self, ActivationPlan, ScopeResolver};
use crate::state::PartitionState;
use crate::types::{BpmnElementType, Key};
use crate::variables::{self, VariableInstruction, VariableScopeError};
use std::collections::BTreeSet;
use std::sync::Arc;

/// A modification that passed validation, with moves already expanded into
/// terminations and activations.
#[derive(Debug, Clone)]
pub(crate) struct ValidatedModification {
    pub process_instance_key: Key,
    pub definition: Arc<ProcessDefinition>,
    pub tenant_id: String,
    /// Instances to terminate, in instruction order, without duplicates.
    pub terminations: Vec<Key>,
    pub activations: Vec<PlannedActivation>,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedActivation {
    pub plan: ActivationPlan,
    pub ancestor_scope_key: Option<Key>,
    pub variable_instructions: Vec<VariableInstruction>,
}

/// An activation before placement: explicit, or derived from a move.
struct Activation {
    element_id: String,
    ancestor_scope_key: Option<Key>,
    variable_instructions: Vec<VariableInstruction>,
}

pub(crate) fn validate(
    state: &PartitionState,
    repository: &ProcessRepository,
    config: &EngineConfig,
    checker: &dyn AuthorizationChecker,
    metadata: &RequestMetadata,
    command: &ModifyCommand,
) -> Result<ValidatedModification, CommandError> {
    let process_instance_key = command.process_instance_key;
    let tree = &state.tree;

    let root = tree
        .get(process_instance_key)
        .filter(|root| root.record.is_root())
        .filter(|root| metadata.sees_tenant(config.multi_tenancy, &root.record.tenant_id))
        .ok_or(ModificationError::ProcessInstanceNotFound(process_instance_key))?;
    let definition = repository
        .get(root.record.process_definition_key)
        .ok_or(ModificationError::ProcessInstanceNotFound(process_instance_key))?;
    auth::require(
        checker,
        metadata,
        Permission::ModifyProcessInstance,
        &definition.bpmn_process_id,
    )?;
    if state.is_suspended(process_instance_key) {
        return Err(ModificationError::Suspended(process_instance_key).into());
    }

    let mut activates = Vec::new();
    let mut terminates = Vec::new();
    let mut moves = Vec::new();
    for instruction in &command.instructions {
        match instruction {
            ModificationInstruction::Activate(a) => activates.push(a),
            ModificationInstruction::Terminate(t) => terminates.push(t),
            ModificationInstruction::Move(m) => moves.push(m),
        }
    }

    let checks = Checks {
        tree,
        definition: definition.as_ref(),
        process_id: definition.bpmn_process_id.clone(),
        process_instance_key,
        config,
    };
    checks.activation_elements_exist(&activates, &moves)?;
    checks.terminations(&terminates)?;
    checks.moves(&moves)?;

    let mut terminations = Vec::new();
    for terminate in &terminates {
        match (terminate.element_instance_key, terminate.element()) {
            (Some(key), _) => terminations.push(key),
            (None, Some(element_id)) => {
                terminations.extend(topmost_active_instances(tree, process_instance_key, element_id))
            }
            (None, None) => {}
        }
    }
    let mut activations: Vec<Activation> = activates
        .iter()
        .map(|a| Activation {
            element_id: a.element_id.clone(),
            ancestor_scope_key: a.ancestor_scope_key,
            variable_instructions: a.variable_instructions.clone(),
        })
        .collect();
    for instruction in &moves {
        checks.expand_move(instruction, &mut terminations, &mut activations);
    }
    let terminations = distinct(terminations);

    checks.supported_targets(&activations)?;
    checks.ancestors(&activations)?;
    let planned = checks.placements(activations)?;
    checks.required_scopes_survive(&planned, &terminations)?;
    checks.variable_scopes(&planned)?;

    Ok(ValidatedModification {
        process_instance_key,
        tenant_id: root.record.tenant_id.clone(),
        definition: definition.clone(),
        terminations,
        activations: planned,
    })
}

struct Checks<'a> {
    tree: &'a ScopeTree,
    definition: &'a ProcessDefinition,
    process_id: String,
    process_instance_key: Key,
    config: &'a EngineConfig,
}

impl Checks<'_> {
    fn activation_elements_exist(
        &self,
        activates: &[&ActivateInstruction],
        moves: &[&MoveInstruction],
    ) -> Result<(), ModificationError> {
        let targets = activates
            .iter()
            .map(|a| a.element_id.as_str())
            .chain(
                moves
                    .iter()
                    .map(|m| m.target_element_id.as_str())
                    .filter(|id| !id.trim().is_empty()),
            );
        let unknown = distinct(targets.filter(|id| !self.definition.contains(id)));
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ModificationError::ActivateElementNotFound {
            process_id: self.process_id.clone(),
            ids: quote_join(unknown),
        })
    }

    fn terminations(&self, terminates: &[&TerminateInstruction]) -> Result<(), ModificationError> {
        let both: Vec<String> = terminates
            .iter()
            .filter_map(|t| Some(format!("'({}, {})'", t.element_instance_key?, t.element()?)))
            .collect();
        if !both.is_empty() {
            return Err(ModificationError::TerminateKeyAndElementId {
                process_id: self.process_id.clone(),
                pairs: both.join(", "),
            });
        }

        let neither: Vec<usize> = terminates
            .iter()
            .enumerate()
            .filter(|(_, t)| t.element_instance_key.is_none() && t.element().is_none())
            .map(|(index, _)| index)
            .collect();
        if !neither.is_empty() {
            return Err(ModificationError::TerminateNeitherKeyNorElementId {
                process_id: self.process_id.clone(),
                indexes: quote_join(neither),
            });
        }

        let keys: Vec<Key> = distinct(terminates.iter().filter_map(|t| t.element_instance_key));
        let missing: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| !self.tree.contains(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ModificationError::TerminateInstanceNotFound {
                process_id: self.process_id.clone(),
                keys: quote_join(missing),
            });
        }
        let foreign: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| !self.belongs_to_instance(*key))
            .collect();
        if !foreign.is_empty() {
            return Err(ModificationError::TerminateInstanceOfOtherProcess {
                process_id: self.process_id.clone(),
                keys: quote_join(foreign),
            });
        }

        let unknown = distinct(
            terminates
                .iter()
                .filter_map(|t| t.element())
                .filter(|id| !self.definition.contains(id)),
        );
        if !unknown.is_empty() {
            return Err(ModificationError::TerminateElementNotFound {
                process_id: self.process_id.clone(),
                ids: quote_join(unknown),
            });
        }
        Ok(())
    }

    fn moves(&self, moves: &[&MoveInstruction]) -> Result<(), ModificationError> {
        let missing: Vec<usize> = moves
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                m.target_element_id.trim().is_empty()
                    || (m.source_id().is_none() && m.source_element_instance_key.is_none())
            })
            .map(|(index, _)| index)
            .collect();
        if !missing.is_empty() {
            return Err(ModificationError::MoveElementIdMissing {
                process_id: self.process_id.clone(),
                indexes: quote_join(missing),
            });
        }

        let both: Vec<String> = moves
            .iter()
            .filter_map(|m| Some(format!("'({}, {})'", m.source_element_instance_key?, m.source_id()?)))
            .collect();
        if !both.is_empty() {
            return Err(ModificationError::MoveKeyAndElementId {
                process_id: self.process_id.clone(),
                pairs: both.join(", "),
            });
        }

        let mut seen = BTreeSet::new();
        let duplicates = distinct(moves.iter().filter_map(|m| m.source_id()).filter(|id| !seen.insert(*id)));
        if !duplicates.is_empty() {
            return Err(ModificationError::MoveDuplicateSource {
                process_id: self.process_id.clone(),
                ids: quote_join(duplicates),
            });
        }

        let keys = distinct(moves.iter().filter_map(|m| m.source_element_instance_key));
        let missing: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| !self.tree.contains(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ModificationError::MoveSourceInstanceNotFound {
                process_id: self.process_id.clone(),
                keys: quote_join(missing),
            });
        }
        let foreign: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| !self.belongs_to_instance(*key))
            .collect();
        if !foreign.is_empty() {
            return Err(ModificationError::MoveSourceInstanceOfOtherProcess {
                process_id: self.process_id.clone(),
                keys: quote_join(foreign),
            });
        }

        let unknown = distinct(
            moves
                .iter()
                .filter_map(|m| m.source_id())
                .filter(|id| !self.definition.contains(id)),
        );
        if !unknown.is_empty() {
            return Err(ModificationError::MoveSourceElementNotFound {
                process_id: self.process_id.clone(),
                ids: quote_join(unknown),
            });
        }
        Ok(())
    }

    /// One termination and one activation per source instance.
    fn expand_move(
        &self,
        instruction: &MoveInstruction,
        terminations: &mut Vec<Key>,
        activations: &mut Vec<Activation>,
    ) {
        let sources = match (instruction.source_element_instance_key, instruction.source_id()) {
            (Some(key), _) => vec![key],
            (None, Some(element_id)) => {
                topmost_active_instances(self.tree, self.process_instance_key, element_id)
            }
            (None, None) => Vec::new(),
        };
        for source in sources {
            let ancestor_scope_key = match instruction.ancestor {
                AncestorSelection::Auto => None,
                AncestorSelection::Direct(key) => Some(key),
                AncestorSelection::SourceParent => self
                    .tree
                    .get_flow_scope(source)
                    .map(|scope| scope.key),
                AncestorSelection::Inferred => {
                    Some(self.inferred_ancestor(source, &instruction.target_element_id))
                }
            };
            terminations.push(source);
            activations.push(Activation {
                element_id: instruction.target_element_id.clone(),
                ancestor_scope_key,
                variable_instructions: instruction.variable_instructions.clone(),
            });
        }
    }

    /// Nearest flow scope of `source` whose element statically encloses the
    /// target. Falls back to the process instance.
    fn inferred_ancestor(&self, source: Key, target_element_id: &str) -> Key {
        let mut current = self.tree.get_flow_scope(source);
        while let Some(scope) = current {
            if !scope.is_multi_instance_body()
                && self
                    .definition
                    .is_flow_scope_ancestor(scope.element_id(), target_element_id)
            {
                return scope.key;
            }
            current = self.tree.get_flow_scope(scope.key);
        }
        self.process_instance_key
    }

    fn supported_targets(&self, activations: &[Activation]) -> Result<(), ModificationError> {
        let mut ids = Vec::new();
        let mut types = Vec::new();
        let mut event_based_gateway = false;
        let mut multi_instance = false;

        for activation in activations {
            let Some(element) = self.definition.element(&activation.element_id) else {
                continue;
            };
            if start_instructions::has_unsupported_type(element) {
                ids.push(element.id.clone());
                types.push(element.element_type);
            } else if start_instructions::belongs_to_event_based_gateway(element) {
                ids.push(element.id.clone());
                event_based_gateway = true;
            } else if start_instructions::multi_instance_violation(
                self.definition,
                self.tree,
                self.process_instance_key,
                &element.id,
                activation.ancestor_scope_key,
            )
            .is_some()
            {
                ids.push(element.id.clone());
                multi_instance = true;
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        let mut details = Vec::new();
        if !types.is_empty() {
            let supported: Vec<&str> = BpmnElementType::supported_activation_targets()
                .iter()
                .map(BpmnElementType::as_str)
                .collect();
            details.push(format!(
                "The activation of elements with type '{}' is not supported. Supported element types are: [{}]",
                quote_join(distinct(types)),
                supported.join(", ")
            ));
        }
        if event_based_gateway {
            details.push(
                "The activation of events belonging to an event-based gateway is not supported".to_string(),
            );
        }
        if multi_instance {
            details.push(
                "The activation of elements that require a new multi-instance body is not supported"
                    .to_string(),
            );
        }
        Err(ModificationError::UnsupportedElements {
            process_id: self.process_id.clone(),
            ids: quote_join(distinct(ids)),
            details: details.join(". "),
        })
    }

    fn ancestors(&self, activations: &[Activation]) -> Result<(), ModificationError> {
        let keys = distinct(activations.iter().filter_map(|a| a.ancestor_scope_key));

        let inactive: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| {
                !self
                    .tree
                    .get(*key)
                    .is_some_and(|i| self.config.ancestor_state_policy.allows(i.state))
            })
            .collect();
        if !inactive.is_empty() {
            return Err(ModificationError::AncestorNotFound {
                process_id: self.process_id.clone(),
                keys: quote_join(inactive),
            });
        }

        let foreign: Vec<Key> = keys
            .iter()
            .copied()
            .filter(|key| !self.belongs_to_instance(*key))
            .collect();
        if !foreign.is_empty() {
            return Err(ModificationError::AncestorOfOtherProcess {
                process_id: self.process_id.clone(),
                keys: quote_join(foreign),
            });
        }

        let mut lines = String::new();
        for activation in activations {
            let Some(ancestor_key) = activation.ancestor_scope_key else {
                continue;
            };
            let Some(ancestor) = self.tree.get(ancestor_key) else {
                continue;
            };
            if !self
                .definition
                .is_flow_scope_ancestor(ancestor.element_id(), &activation.element_id)
            {
                lines.push_str(&format!(
                    "\n- instance '{}' of element '{}' is not an ancestor of element '{}'",
                    ancestor_key,
                    ancestor.element_id(),
                    activation.element_id
                ));
            }
        }
        if !lines.is_empty() {
            return Err(ModificationError::AncestorNotFlowScope {
                process_id: self.process_id.clone(),
                lines,
            });
        }
        Ok(())
    }

    fn placements(&self, activations: Vec<Activation>) -> Result<Vec<PlannedActivation>, ModificationError> {
        let resolver = ScopeResolver::new(self.definition, self.tree, self.process_instance_key);
        let mut planned = Vec::with_capacity(activations.len());
        let mut ambiguous = Vec::new();
        for activation in activations {
            match resolver.resolve(&activation.element_id, activation.ancestor_scope_key) {
                Ok(plan) => planned.push(PlannedActivation {
                    plan,
                    ancestor_scope_key: activation.ancestor_scope_key,
                    variable_instructions: activation.variable_instructions,
                }),
                Err(err) => ambiguous.push(err.flow_scope_id),
            }
        }
        if !ambiguous.is_empty() {
            return Err(ModificationError::AmbiguousFlowScope {
                process_id: self.process_id.clone(),
                ids: quote_join(distinct(ambiguous)),
            });
        }
        Ok(planned)
    }

    fn required_scopes_survive(
        &self,
        planned: &[PlannedActivation],
        terminations: &[Key],
    ) -> Result<(), ModificationError> {
        let mut conflicts = Vec::new();
        for activation in planned {
            let terminated = terminations
                .iter()
                .find(|key| self.tree.is_ancestor_or_self(**key, activation.plan.attach_to));
            if let Some(key) = terminated {
                conflicts.push(format!(
                    "element '{}' requires flow scope instance '{}' which is being terminated",
                    activation.plan.element_id, key
                ));
            }
        }
        let conflicts = distinct(conflicts);
        if conflicts.is_empty() {
            return Ok(());
        }
        Err(ModificationError::RequiredScopeTerminated {
            process_id: self.process_id.clone(),
            details: conflicts.join(", "),
        })
    }

    fn variable_scopes(&self, planned: &[PlannedActivation]) -> Result<(), ModificationError> {
        let mut not_found = Vec::new();
        let mut not_flow_scope = Vec::new();
        for activation in planned {
            for instruction in &activation.variable_instructions {
                match variables::check_scope(self.definition, &activation.plan.element_id, instruction) {
                    Ok(()) => {}
                    Err(VariableScopeError::ScopeNotFound(id)) => not_found.push(id),
                    Err(VariableScopeError::ScopeNotFlowScope(id)) => not_flow_scope.push(id),
                }
            }
        }
        if !not_found.is_empty() {
            return Err(ModificationError::VariableScopeNotFound {
                process_id: self.process_id.clone(),
                ids: quote_join(distinct(not_found)),
            });
        }
        if !not_flow_scope.is_empty() {
            return Err(ModificationError::VariableScopeNotFlowScope {
                process_id: self.process_id.clone(),
                ids: quote_join(distinct(not_flow_scope)),
            });
        }
        Ok(())
    }

    fn belongs_to_instance(&self, key: Key) -> bool {
        self.tree
            .get(key)
            .is_some_and(|instance| instance.process_instance_key() == self.process_instance_key)
    }
}

/// Active instances of an element that are not nested in another instance of
/// the same element, so a multi-instance body stands for its inner instances.
pub(crate) fn topmost_active_instances(tree: &ScopeTree, process_instance_key: Key, element_id: &str) -> Vec<Key> {
    tree.instance_keys_of(process_instance_key)
        .into_iter()
        .filter_map(|key| tree.get(key))
        .filter(|instance| instance.element_id() == element_id && instance.is_active())
        .filter(|instance| {
            !tree
                .get_flow_scope(instance.key)
                .is_some_and(|scope| scope.element_id() == element_id)
        })
        .map(|instance| instance.key)
        .collect()
}

/// First occurrence of every item, in order.
fn distinct<T: PartialEq>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut result: Vec<T> = Vec::new();
    for item in items {
        if !result.contains(&item) {
            result.push(item);
        }
    }
    result
}
