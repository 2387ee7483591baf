//! Variable storage and propagation.
//!
//! Variables are bound to element instance keys. A lookup walks the flow
//! scope chain from the asking instance to its process instance root; it
//! never crosses into a parent process. Writes always go through
//! [`set_local`] or [`propagate`], which emit `VARIABLE` events; the store
//! itself is only changed by the event applier.

use crate::events::{Intent, RecordValue, VariableRecord};
use crate::model::ProcessModel;
use crate::scope_tree::ScopeTree;
use crate::types::{Document, Key, NO_KEY};
use crate::writer::Batch;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub key: Key,
    pub value: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableStore {
    by_scope: BTreeMap<Key, BTreeMap<String, Variable>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_local(&self, scope_key: Key, name: &str) -> Option<&Variable> {
        self.by_scope.get(&scope_key).and_then(|vars| vars.get(name))
    }

    /// Local variables of one scope as a document.
    pub fn local_document(&self, scope_key: Key) -> Document {
        self.by_scope
            .get(&scope_key)
            .map(|vars| {
                vars.iter()
                    .map(|(name, var)| (name.clone(), var.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nearest scope from `scope_key` upward that holds `name`.
    pub fn find_scope_with(&self, tree: &ScopeTree, scope_key: Key, name: &str) -> Option<Key> {
        scope_chain(tree, scope_key)
            .into_iter()
            .find(|key| self.get_local(*key, name).is_some())
    }

    pub fn get_visible(&self, tree: &ScopeTree, scope_key: Key, name: &str) -> Option<&Value> {
        self.find_scope_with(tree, scope_key, name)
            .and_then(|key| self.get_local(key, name))
            .map(|var| &var.value)
    }

    /// Every variable visible from `scope_key`; nearer scopes shadow outer ones.
    pub fn visible_document(&self, tree: &ScopeTree, scope_key: Key) -> Document {
        let mut document = Document::new();
        for key in scope_chain(tree, scope_key).into_iter().rev() {
            for (name, value) in self.local_document(key) {
                document.insert(name, value);
            }
        }
        document
    }

    pub fn len(&self) -> usize {
        self.by_scope.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_scope.is_empty()
    }

    pub fn has_scope(&self, scope_key: Key) -> bool {
        self.by_scope.contains_key(&scope_key)
    }

    // ── applier ──

    pub(crate) fn apply_set(&mut self, key: Key, record: &VariableRecord) {
        self.by_scope.entry(record.scope_key).or_default().insert(
            record.name.clone(),
            Variable {
                key,
                value: record.value.clone(),
            },
        );
    }

    /// Variables of removed scopes disappear without events.
    pub(crate) fn remove_scope(&mut self, scope_key: Key) {
        self.by_scope.remove(&scope_key);
    }
}

/// `scope_key` and its flow scopes, nearest first, stopping at the process
/// instance root.
fn scope_chain(tree: &ScopeTree, scope_key: Key) -> Vec<Key> {
    let mut chain = Vec::new();
    let mut current = scope_key;
    while current != NO_KEY {
        let Some(instance) = tree.get(current) else {
            break;
        };
        chain.push(current);
        current = instance.flow_scope_key();
    }
    chain
}

// ─── Writes ───────────────────────────────────────────────────

/// Set a variable on exactly this scope. Emits CREATED for a new variable,
/// UPDATED for a changed value and nothing for an unchanged one.
pub(crate) fn set_local(batch: &mut Batch<'_>, scope_key: Key, name: &str, value: Value) {
    let Some(instance) = batch.state.tree.get(scope_key) else {
        tracing::debug!(scope_key, name, "skipping variable for unknown scope");
        return;
    };
    let process_instance_key = instance.process_instance_key();
    let tenant_id = instance.record.tenant_id.clone();
    write_variable(batch, scope_key, process_instance_key, &tenant_id, name, value);
}

/// Like [`set_local`], for a scope key that is allocated but not activated
/// yet. Creation and modification write variables this way before the
/// scopes they belong to emit ELEMENT_ACTIVATING.
pub(crate) fn write_variable(
    batch: &mut Batch<'_>,
    scope_key: Key,
    process_instance_key: Key,
    tenant_id: &str,
    name: &str,
    value: Value,
) {
    let record = VariableRecord {
        name: name.to_string(),
        value,
        scope_key,
        process_instance_key,
        tenant_id: tenant_id.to_string(),
    };
    match batch.state.variables.get_local(scope_key, name) {
        Some(existing) if existing.value == record.value => {}
        Some(existing) => {
            let key = existing.key;
            batch.event(key, Intent::VariableUpdated, RecordValue::Variable(record));
        }
        None => {
            let key = batch.next_key();
            batch.event(key, Intent::VariableCreated, RecordValue::Variable(record));
        }
    }
}

pub(crate) fn set_local_document(batch: &mut Batch<'_>, scope_key: Key, document: &Document) {
    for (name, value) in document {
        set_local(batch, scope_key, name, value.clone());
    }
}

/// Write each variable at the nearest scope from `start_scope` upward that
/// already has it, otherwise at the process instance root.
pub(crate) fn propagate(batch: &mut Batch<'_>, start_scope: Key, document: &Document) {
    let Some(root) = batch
        .state
        .tree
        .get(start_scope)
        .map(|instance| instance.process_instance_key())
    else {
        return;
    };
    for (name, value) in document {
        let target = batch
            .state
            .variables
            .find_scope_with(&batch.state.tree, start_scope, name)
            .unwrap_or(root);
        set_local(batch, target, name, value.clone());
    }
}

// ─── Instructions ─────────────────────────────────────────────

/// Variables to set while activating an element. Without an element id the
/// variables are global: they go to the selected ancestor, or the process
/// instance.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableInstruction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default)]
    pub variables: Document,
}

impl VariableInstruction {
    pub fn global(variables: Document) -> Self {
        Self {
            element_id: None,
            variables,
        }
    }

    pub fn local(element_id: impl Into<String>, variables: Document) -> Self {
        Self {
            element_id: Some(element_id.into()),
            variables,
        }
    }

    /// The scope element id, or `None` for a global instruction.
    pub fn scope_element(&self) -> Option<&str> {
        self.element_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VariableScopeError {
    #[error("no element with id '{0}'")]
    ScopeNotFound(String),
    #[error("element '{0}' is not a flow scope of the activated element")]
    ScopeNotFlowScope(String),
}

/// Check that a local instruction names the activated element itself or one
/// of its static flow scopes.
pub fn check_scope(
    model: &ProcessModel,
    activated_element_id: &str,
    instruction: &VariableInstruction,
) -> Result<(), VariableScopeError> {
    let Some(scope_id) = instruction.scope_element() else {
        return Ok(());
    };
    if !model.contains(scope_id) {
        return Err(VariableScopeError::ScopeNotFound(scope_id.to_string()));
    }
    if scope_id == activated_element_id || model.is_flow_scope_ancestor(scope_id, activated_element_id)
    {
        Ok(())
    } else {
        Err(VariableScopeError::ScopeNotFlowScope(scope_id.to_string()))
    }
}

/// Resolve the scope key an instruction writes to.
///
/// `scope_keys` maps the element ids on the activation's ancestor path
/// (existing or synthesized in this command) to their instance keys.
pub fn resolve_scope(
    instruction: &VariableInstruction,
    global_scope: Key,
    scope_keys: &BTreeMap<String, Key>,
) -> Option<Key> {
    match instruction.scope_element() {
        None => Some(global_scope),
        Some(id) => scope_keys.get(id).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ElementRecord;
    use crate::model::ProcessBuilder;
    use crate::scope_tree::ElementInstance;
    use crate::types::BpmnElementType;
    use serde_json::json;

    fn record(element_id: &str, flow_scope_key: Key) -> ElementRecord {
        ElementRecord {
            bpmn_process_id: "p".into(),
            version: 1,
            process_definition_key: 1,
            process_instance_key: 1,
            element_id: element_id.into(),
            bpmn_element_type: BpmnElementType::SubProcess,
            flow_scope_key,
            parent_process_instance_key: NO_KEY,
            parent_element_instance_key: NO_KEY,
            tenant_id: "<default>".into(),
            element_instance_path: vec![],
            process_definition_path: vec![1],
            loop_counter: 0,
            business_id: None,
        }
    }

    fn variable(name: &str, value: Value, scope_key: Key) -> VariableRecord {
        VariableRecord {
            name: name.into(),
            value,
            scope_key,
            process_instance_key: 1,
            tenant_id: "<default>".into(),
        }
    }

    #[test]
    fn nearer_scopes_shadow_outer_ones() {
        let mut tree = ScopeTree::new();
        tree.insert(ElementInstance::new(1, record("p", NO_KEY)));
        tree.insert(ElementInstance::new(2, record("sub", 1)));
        let mut store = VariableStore::new();
        store.apply_set(10, &variable("x", json!(1), 1));
        store.apply_set(11, &variable("x", json!(2), 2));
        store.apply_set(12, &variable("y", json!("a"), 1));

        assert_eq!(store.get_visible(&tree, 2, "x"), Some(&json!(2)));
        assert_eq!(store.get_visible(&tree, 1, "x"), Some(&json!(1)));
        assert_eq!(store.find_scope_with(&tree, 2, "y"), Some(1));
        let doc = store.visible_document(&tree, 2);
        assert_eq!(doc.get("x"), Some(&json!(2)));
        assert_eq!(doc.get("y"), Some(&json!("a")));

        store.remove_scope(2);
        assert_eq!(store.get_visible(&tree, 2, "x"), Some(&json!(1)));
    }

    #[test]
    fn local_scope_must_be_target_or_ancestor() {
        let model = ProcessBuilder::new("p")
            .start_event("start")
            .sub_process("sub", |s| s.user_task("A"))
            .user_task("B")
            .connect("start", "sub")
            .build()
            .unwrap();
        let doc = Document::new();
        assert!(check_scope(&model, "A", &VariableInstruction::local("sub", doc.clone())).is_ok());
        assert!(check_scope(&model, "A", &VariableInstruction::local("A", doc.clone())).is_ok());
        assert!(check_scope(&model, "A", &VariableInstruction::local("p", doc.clone())).is_ok());
        assert_eq!(
            check_scope(&model, "A", &VariableInstruction::local("B", doc.clone())),
            Err(VariableScopeError::ScopeNotFlowScope("B".into()))
        );
        assert_eq!(
            check_scope(&model, "A", &VariableInstruction::local("nope", doc)),
            Err(VariableScopeError::ScopeNotFound("nope".into()))
        );
    }

    #[test]
    fn global_resolves_to_given_scope() {
        let keys = BTreeMap::from([("sub".to_string(), 7)]);
        let global = VariableInstruction::global(Document::new());
        assert_eq!(resolve_scope(&global, 1, &keys), Some(1));
        let local = VariableInstruction::local("sub", Document::new());
        assert_eq!(resolve_scope(&local, 1, &keys), Some(7));
    }
}
