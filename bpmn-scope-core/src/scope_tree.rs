//! Arena of live element instances.
//!
//! Every instance is stored by key and references its flow scope by key.
//! A child index per scope and an index per process instance keep child scans
//! and per-instance lookups proportional to what they return. Mutation only
//! happens through the event applier.

use crate::events::ElementRecord;
use crate::types::{BpmnElementType, Key, LifecycleState, NO_KEY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementInstance {
    pub key: Key,
    pub state: LifecycleState,
    pub record: ElementRecord,
    /// Multi-instance bodies: inner instances created so far.
    pub spawned_inner: u32,
    /// Joining gateway id -> ids of incoming flows taken and not yet consumed.
    pub pending_joins: BTreeMap<String, BTreeSet<String>>,
    /// Call activities: root key of the called process instance.
    pub called_child: Option<Key>,
}

impl ElementInstance {
    pub fn new(key: Key, record: ElementRecord) -> Self {
        Self {
            key,
            state: LifecycleState::Activating,
            record,
            spawned_inner: 0,
            pending_joins: BTreeMap::new(),
            called_child: None,
        }
    }

    pub fn element_id(&self) -> &str {
        &self.record.element_id
    }

    pub fn element_type(&self) -> BpmnElementType {
        self.record.bpmn_element_type
    }

    pub fn flow_scope_key(&self) -> Key {
        self.record.flow_scope_key
    }

    pub fn process_instance_key(&self) -> Key {
        self.record.process_instance_key
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_multi_instance_body(&self) -> bool {
        self.record.bpmn_element_type == BpmnElementType::MultiInstanceBody
    }

    pub fn has_pending_joins(&self) -> bool {
        self.pending_joins.values().any(|flows| !flows.is_empty())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeTree {
    instances: BTreeMap<Key, ElementInstance>,
    children: BTreeMap<Key, BTreeSet<Key>>,
    by_process_instance: BTreeMap<Key, BTreeSet<Key>>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    // ── read model ──

    pub fn get(&self, key: Key) -> Option<&ElementInstance> {
        self.instances.get(&key)
    }

    pub fn contains(&self, key: Key) -> bool {
        self.instances.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All live instances in key order.
    pub fn iter(&self) -> impl Iterator<Item = &ElementInstance> {
        self.instances.values()
    }

    /// The flow scope instance, or `None` for roots and unknown keys.
    pub fn get_flow_scope(&self, key: Key) -> Option<&ElementInstance> {
        self.get(key)
            .map(|instance| instance.flow_scope_key())
            .filter(|scope| *scope != NO_KEY)
            .and_then(|scope| self.get(scope))
    }

    /// Direct children in key order.
    pub fn get_children(&self, scope_key: Key) -> Vec<&ElementInstance> {
        self.child_keys(scope_key)
            .into_iter()
            .filter_map(|key| self.get(key))
            .collect()
    }

    pub fn child_keys(&self, scope_key: Key) -> Vec<Key> {
        self.children
            .get(&scope_key)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn active_child_count(&self, scope_key: Key) -> usize {
        self.get_children(scope_key)
            .iter()
            .filter(|child| child.is_active())
            .count()
    }

    /// True only for ACTIVATING and ACTIVATED instances.
    pub fn is_active(&self, key: Key) -> bool {
        self.get(key).is_some_and(ElementInstance::is_active)
    }

    /// Keys from the outermost root to `key`, crossing call-activity
    /// boundaries. Empty for unknown keys.
    pub fn compute_ancestor_path(&self, key: Key) -> Vec<Key> {
        let mut path = Vec::new();
        let mut current = self.get(key);
        while let Some(instance) = current {
            path.push(instance.key);
            let parent = if instance.record.is_root() {
                instance.record.parent_element_instance_key
            } else {
                instance.flow_scope_key()
            };
            current = if parent == NO_KEY { None } else { self.get(parent) };
        }
        path.reverse();
        path
    }

    /// Children scopes a termination or suspension must visit: direct children
    /// plus the called process instance of a call activity.
    pub fn dependent_keys(&self, key: Key) -> Vec<Key> {
        let mut keys = self.child_keys(key);
        if let Some(child) = self.get(key).and_then(|i| i.called_child) {
            if self.contains(child) {
                keys.push(child);
            }
        }
        keys
    }

    /// All instances below `key` (crossing call activities), pre-order.
    pub fn descendants(&self, key: Key) -> Vec<Key> {
        let mut result = Vec::new();
        let mut stack: Vec<Key> = self.dependent_keys(key).into_iter().rev().collect();
        while let Some(next) = stack.pop() {
            result.push(next);
            stack.extend(self.dependent_keys(next).into_iter().rev());
        }
        result
    }

    /// True when `ancestor` is `key` itself or one of its flow scopes.
    pub fn is_ancestor_or_self(&self, ancestor: Key, key: Key) -> bool {
        let mut current = Some(key);
        while let Some(k) = current {
            if k == ancestor {
                return true;
            }
            current = self.get(k).map(|i| i.flow_scope_key()).filter(|s| *s != NO_KEY);
        }
        false
    }

    /// Keys of all live instances of one process instance, in key order.
    pub fn instance_keys_of(&self, process_instance_key: Key) -> Vec<Key> {
        self.by_process_instance
            .get(&process_instance_key)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active instances of an element inside one process instance. Multi-instance
    /// bodies share their element id with the inner instances and are excluded.
    pub fn active_instances_of(&self, process_instance_key: Key, element_id: &str) -> Vec<&ElementInstance> {
        self.instance_keys_of(process_instance_key)
            .into_iter()
            .filter_map(|key| self.get(key))
            .filter(|i| i.element_id() == element_id && i.is_active() && !i.is_multi_instance_body())
            .collect()
    }

    /// The root instance of the process instance that owns `key`.
    pub fn process_instance_of(&self, key: Key) -> Option<&ElementInstance> {
        self.get(key)
            .and_then(|instance| self.get(instance.process_instance_key()))
    }

    /// Root of the outermost process instance that owns `key`.
    pub fn root_process_instance_of(&self, key: Key) -> Option<&ElementInstance> {
        self.compute_ancestor_path(key)
            .first()
            .and_then(|root| self.get(*root))
    }

    // ── mutation (applier only) ──

    pub(crate) fn insert(&mut self, instance: ElementInstance) {
        let key = instance.key;
        let scope = instance.flow_scope_key();
        let process_instance = instance.process_instance_key();
        if scope != NO_KEY {
            self.children.entry(scope).or_default().insert(key);
        }
        self.by_process_instance
            .entry(process_instance)
            .or_default()
            .insert(key);
        self.instances.insert(key, instance);
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut ElementInstance> {
        self.instances.get_mut(&key)
    }

    pub(crate) fn set_state(&mut self, key: Key, state: LifecycleState) {
        if let Some(instance) = self.instances.get_mut(&key) {
            instance.state = state;
        }
    }

    pub(crate) fn remove(&mut self, key: Key) -> Option<ElementInstance> {
        let instance = self.instances.remove(&key)?;
        let scope = instance.flow_scope_key();
        if let Some(siblings) = self.children.get_mut(&scope) {
            siblings.remove(&key);
            if siblings.is_empty() {
                self.children.remove(&scope);
            }
        }
        self.children.remove(&key);
        let process_instance = instance.process_instance_key();
        if let Some(keys) = self.by_process_instance.get_mut(&process_instance) {
            keys.remove(&key);
            if keys.is_empty() {
                self.by_process_instance.remove(&process_instance);
            }
        }
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: Key, element_id: &str, flow_scope_key: Key, pi: Key) -> ElementRecord {
        ElementRecord {
            bpmn_process_id: "p".into(),
            version: 1,
            process_definition_key: 1,
            process_instance_key: pi,
            element_id: element_id.into(),
            bpmn_element_type: if flow_scope_key == NO_KEY {
                BpmnElementType::Process
            } else {
                BpmnElementType::SubProcess
            },
            flow_scope_key,
            parent_process_instance_key: NO_KEY,
            parent_element_instance_key: NO_KEY,
            tenant_id: "<default>".into(),
            element_instance_path: vec![key],
            process_definition_path: vec![1],
            loop_counter: 0,
            business_id: None,
        }
    }

    fn tree() -> ScopeTree {
        let mut tree = ScopeTree::new();
        tree.insert(ElementInstance::new(1, record(1, "p", NO_KEY, 1)));
        tree.insert(ElementInstance::new(2, record(2, "sub", 1, 1)));
        tree.insert(ElementInstance::new(3, record(3, "A", 2, 1)));
        tree.insert(ElementInstance::new(4, record(4, "B", 1, 1)));
        tree
    }

    #[test]
    fn flow_scope_and_children_lookups() {
        let tree = tree();
        assert_eq!(tree.get_flow_scope(3).map(|i| i.key), Some(2));
        assert!(tree.get_flow_scope(1).is_none());
        let children: Vec<Key> = tree.get_children(1).iter().map(|i| i.key).collect();
        assert_eq!(children, vec![2, 4]);
        assert_eq!(tree.active_child_count(2), 1);
    }

    #[test]
    fn ancestor_path_runs_root_to_self() {
        let tree = tree();
        assert_eq!(tree.compute_ancestor_path(3), vec![1, 2, 3]);
        assert!(tree.compute_ancestor_path(99).is_empty());
        assert!(tree.is_ancestor_or_self(1, 3));
        assert!(!tree.is_ancestor_or_self(4, 3));
    }

    #[test]
    fn ancestor_path_crosses_call_activity() {
        let mut tree = tree();
        let mut child_root = record(10, "child", NO_KEY, 10);
        child_root.parent_process_instance_key = 1;
        child_root.parent_element_instance_key = 4;
        tree.insert(ElementInstance::new(10, child_root));
        tree.get_mut(4).unwrap().called_child = Some(10);

        assert_eq!(tree.compute_ancestor_path(10), vec![1, 4, 10]);
        assert_eq!(tree.descendants(1), vec![2, 3, 4, 10]);
        assert_eq!(tree.root_process_instance_of(10).map(|i| i.key), Some(1));
    }

    #[test]
    fn removal_clears_indexes() {
        let mut tree = tree();
        tree.set_state(3, LifecycleState::Terminating);
        assert!(!tree.is_active(3));
        tree.remove(3);
        assert!(tree.get_children(2).is_empty());
        assert_eq!(tree.instance_keys_of(1), vec![1, 2, 4]);
    }
}
