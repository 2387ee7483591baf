//! Applying a validated modification to a batch.

use super::error::ModificationError;
use super::validate::ValidatedModification;
use crate::events::{Intent, ModificationRecord, RecordValue};
use crate::lifecycle;
use crate::rejection::CommandError;
use crate::types::Key;
use crate::variables;
use crate::writer::Batch;
use std::collections::{BTreeMap, BTreeSet};

/// Where one activation goes: the scopes to synthesize below `attach_to`
/// as (flow scope key, element id, key), and the target's own key.
struct Placement<'a> {
    element_id: &'a str,
    attach_to: Key,
    chain: Vec<(Key, &'a str, Key)>,
    flow_scope_key: Key,
    key: Key,
}

pub(crate) fn execute(batch: &mut Batch<'_>, modification: ValidatedModification) -> Result<(), CommandError> {
    let process_instance_key = modification.process_instance_key;
    let process_id = modification.definition.bpmn_process_id.clone();

    // scopes every activation needs, from the outermost root down
    let required: BTreeSet<Key> = modification
        .activations
        .iter()
        .flat_map(|a| batch.state.tree.compute_ancestor_path(a.plan.attach_to))
        .collect();

    for &key in &modification.terminations {
        let Some(instance) = batch.state.tree.get(key).cloned() else {
            continue;
        };
        if !instance.is_active() {
            continue;
        }
        if instance.record.is_root() {
            if instance.record.has_parent_process() {
                return Err(ModificationError::TerminatesChildProcess { process_id }.into());
            }
            lifecycle::terminate_tree(batch, key);
            continue;
        }
        tracing::debug!(key, element_id = %instance.element_id(), "terminating element instance");
        lifecycle::terminate_tree(batch, key);
        terminate_empty_flow_scopes(batch, instance.flow_scope_key(), &required, &process_id)?;
    }

    // keys first: variables of every activation precede the first activation
    let mut allocated: BTreeMap<(Key, String), Key> = BTreeMap::new();
    let mut placements = Vec::with_capacity(modification.activations.len());
    for activation in &modification.activations {
        let plan = &activation.plan;
        let mut scope_keys: BTreeMap<String, Key> = batch
            .state
            .tree
            .compute_ancestor_path(plan.attach_to)
            .into_iter()
            .filter_map(|key| batch.state.tree.get(key))
            .filter(|instance| instance.process_instance_key() == process_instance_key)
            .map(|instance| (instance.element_id().to_string(), instance.key))
            .collect();
        let mut chain = Vec::with_capacity(plan.create.len());
        let mut parent = plan.attach_to;
        for scope_id in &plan.create {
            let key = match allocated.get(&(parent, scope_id.clone())) {
                Some(key) => *key,
                None => {
                    let key = batch.next_key();
                    allocated.insert((parent, scope_id.clone()), key);
                    key
                }
            };
            scope_keys.insert(scope_id.clone(), key);
            chain.push((parent, scope_id.as_str(), key));
            parent = key;
        }
        let target_key = batch.next_key();
        scope_keys.insert(plan.element_id.clone(), target_key);

        let global_scope = activation.ancestor_scope_key.unwrap_or(process_instance_key);
        for instruction in &activation.variable_instructions {
            let Some(scope_key) = variables::resolve_scope(instruction, global_scope, &scope_keys) else {
                continue;
            };
            for (name, value) in &instruction.variables {
                variables::write_variable(
                    batch,
                    scope_key,
                    process_instance_key,
                    &modification.tenant_id,
                    name,
                    value.clone(),
                );
            }
        }
        placements.push(Placement {
            element_id: plan.element_id.as_str(),
            attach_to: plan.attach_to,
            chain,
            flow_scope_key: parent,
            key: target_key,
        });
    }

    let mut synthesized = BTreeSet::new();
    let mut ancestor_scope_keys = Vec::new();
    let mut activated_element_ids = Vec::new();
    for placement in placements {
        let Some(target) = modification.definition.element(placement.element_id) else {
            continue;
        };
        ancestor_scope_keys.push(placement.attach_to);
        for (flow_scope_key, scope_id, key) in placement.chain {
            ancestor_scope_keys.push(key);
            if !synthesized.insert(key) {
                continue;
            }
            let Some(scope_def) = modification.definition.element(scope_id) else {
                continue;
            };
            let Some(flow_scope) = batch.state.tree.get(flow_scope_key).cloned() else {
                continue;
            };
            let record = lifecycle::element_record(&flow_scope, scope_def, key);
            lifecycle::activate_synthesized_scope(batch, key, record).map_err(|err| {
                ModificationError::SubscriptionFailed {
                    element_id: scope_id.to_string(),
                    message: err.to_string(),
                }
            })?;
        }

        let Some(flow_scope) = batch.state.tree.get(placement.flow_scope_key).cloned() else {
            continue;
        };
        let record = lifecycle::element_record(&flow_scope, target, placement.key);
        lifecycle::enqueue_activation(batch, placement.key, record, None);
        activated_element_ids.push(placement.element_id.to_string());
    }

    let mut ancestors_seen = BTreeSet::new();
    ancestor_scope_keys.retain(|key| ancestors_seen.insert(*key));
    let root_process_instance_key = batch
        .state
        .tree
        .root_process_instance_of(process_instance_key)
        .map_or(process_instance_key, |root| root.key);
    batch.event(
        process_instance_key,
        Intent::Modified,
        RecordValue::Modification(ModificationRecord {
            process_instance_key,
            root_process_instance_key,
            bpmn_process_id: process_id,
            tenant_id: modification.tenant_id.clone(),
            activated_element_ids,
            terminated_element_instance_keys: modification.terminations.clone(),
            ancestor_scope_keys,
        }),
    );

    lifecycle::drain(batch)?;

    if batch.encoded_len() > batch.config().max_message_size {
        return Err(ModificationError::TooLarge(process_instance_key).into());
    }
    Ok(())
}

/// Terminate the flow scopes a termination left empty, walking upward until
/// a scope still has work or is needed by an activation of this command.
fn terminate_empty_flow_scopes(
    batch: &mut Batch<'_>,
    mut scope_key: Key,
    required: &BTreeSet<Key>,
    process_id: &str,
) -> Result<(), ModificationError> {
    loop {
        let Some(scope) = batch.state.tree.get(scope_key).cloned() else {
            return Ok(());
        };
        let tree = &batch.state.tree;
        if required.contains(&scope_key)
            || !scope.is_active()
            || scope.has_pending_joins()
            || tree.active_child_count(scope_key) > 0
            || batch.has_queued_activation_in(scope_key)
        {
            return Ok(());
        }
        if scope.record.is_root() && scope.record.has_parent_process() {
            return Err(ModificationError::TerminatesChildProcess {
                process_id: process_id.to_string(),
            });
        }
        tracing::debug!(scope_key, element_id = %scope.element_id(), "terminating empty flow scope");
        lifecycle::terminate_tree(batch, scope_key);
        if scope.record.is_root() {
            return Ok(());
        }
        scope_key = scope.flow_scope_key();
    }
}
