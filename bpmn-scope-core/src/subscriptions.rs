//! Message and timer subscriptions bound to scopes.
//!
//! A subscription is identified by the scope it is bound to and the id of
//! the catching element, so opening twice is a no-op. Subscriptions are
//! opened while a scope activates and deleted when it completes, terminates
//! or is suspended.

use crate::events::{Intent, RecordValue, SubscriptionRecord, TriggerRecord};
use crate::lifecycle;
use crate::model::{CorrelationKey, ElementDef, EventDefinition, ProcessModel};
use crate::rejection::CommandError;
use crate::scope_tree::{ElementInstance, ScopeTree};
use crate::types::{BpmnElementType, Document, Key, Timestamp};
use crate::writer::{Batch, Route};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ─── Store ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStore {
    by_key: BTreeMap<Key, SubscriptionRecord>,
    by_scope: BTreeMap<Key, BTreeSet<Key>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Key) -> Option<&SubscriptionRecord> {
        self.by_key.get(&key)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &SubscriptionRecord)> {
        self.by_key.iter().map(|(key, record)| (*key, record))
    }

    /// Keys of the subscriptions bound to one scope, in key order.
    pub fn keys_for_scope(&self, scope_key: Key) -> Vec<Key> {
        self.by_scope
            .get(&scope_key)
            .map(|keys| keys.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn find(&self, scope_key: Key, catch_element_id: &str) -> Option<Key> {
        self.keys_for_scope(scope_key).into_iter().find(|key| {
            self.get(*key)
                .is_some_and(|s| s.catch_element_id == catch_element_id)
        })
    }

    /// Message subscriptions matching a published message, in key order.
    pub fn matching_messages(&self, name: &str, correlation_key: &str, tenant_id: &str) -> Vec<Key> {
        self.iter()
            .filter(|(_, s)| s.tenant_id == tenant_id)
            .filter(|(_, s)| {
                matches!(&s.trigger, TriggerRecord::Message { name: n, correlation_key: k }
                    if n == name && k == correlation_key)
            })
            .map(|(key, _)| key)
            .collect()
    }

    /// Timer subscriptions due at `now`, in key order.
    pub fn due_timers(&self, now: Timestamp) -> Vec<Key> {
        self.iter()
            .filter(|(_, s)| matches!(s.trigger, TriggerRecord::Timer { due_date } if due_date <= now))
            .map(|(key, _)| key)
            .collect()
    }

    // ── applier ──

    pub(crate) fn insert(&mut self, key: Key, record: SubscriptionRecord) {
        self.by_scope.entry(record.scope_key).or_default().insert(key);
        self.by_key.insert(key, record);
    }

    pub(crate) fn remove(&mut self, key: Key) {
        if let Some(record) = self.by_key.remove(&key) {
            if let Some(keys) = self.by_scope.get_mut(&record.scope_key) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.by_scope.remove(&record.scope_key);
                }
            }
        }
    }
}

// ─── Opening ──────────────────────────────────────────────────

/// The correlation key of a message subscription could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to extract the correlation key for '{variable}': The value must be either a string or a number, but was '{found}'.")]
pub struct CorrelationKeyError {
    pub catch_element_id: String,
    pub variable: String,
    pub found: &'static str,
}

/// True for the inner instances of a multi-instance body.
pub(crate) fn is_inner_instance(tree: &ScopeTree, instance: &ElementInstance) -> bool {
    tree.get_flow_scope(instance.key).is_some_and(|scope| {
        scope.is_multi_instance_body() && scope.element_id() == instance.element_id()
    })
}

/// Elements whose triggers an instance subscribes to while it is active.
pub(crate) fn catch_elements<'m>(
    model: &'m ProcessModel,
    tree: &ScopeTree,
    instance: &ElementInstance,
) -> Vec<&'m ElementDef> {
    let Some(def) = model.element(instance.element_id()) else {
        return Vec::new();
    };
    let element_type = instance.element_type();
    if element_type == BpmnElementType::MultiInstanceBody {
        return model.boundary_events(&def.id);
    }

    let mut catches = Vec::new();
    if element_type.is_container() {
        catches.extend(model.event_sub_process_starts(&def.id));
    }
    if element_type.is_activity() && !is_inner_instance(tree, instance) {
        catches.extend(model.boundary_events(&def.id));
    }
    match element_type {
        BpmnElementType::IntermediateCatchEvent | BpmnElementType::ReceiveTask
            if def.event.is_some() =>
        {
            catches.push(def)
        }
        BpmnElementType::EventBasedGateway => catches.extend(model.gateway_events(&def.id)),
        _ => {}
    }
    catches
}

fn value_type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "NULL",
        Some(Value::Bool(_)) => "BOOLEAN",
        Some(Value::Number(_)) => "NUMBER",
        Some(Value::String(_)) => "STRING",
        Some(Value::Array(_)) => "LIST",
        Some(Value::Object(_)) => "CONTEXT",
    }
}

fn evaluate_trigger(
    batch: &Batch<'_>,
    scope_key: Key,
    catch: &ElementDef,
) -> Result<Option<TriggerRecord>, CorrelationKeyError> {
    match &catch.event {
        None => Ok(None),
        Some(EventDefinition::Timer { duration_ms }) => Ok(Some(TriggerRecord::Timer {
            due_date: batch.now() + *duration_ms as Timestamp,
        })),
        Some(EventDefinition::Message {
            name,
            correlation_key,
        }) => {
            let key = match correlation_key {
                CorrelationKey::Static(value) => value.clone(),
                CorrelationKey::Variable(variable) => {
                    let value = batch
                        .state
                        .variables
                        .get_visible(&batch.state.tree, scope_key, variable);
                    match value {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Number(n)) => n.to_string(),
                        other => {
                            return Err(CorrelationKeyError {
                                catch_element_id: catch.id.clone(),
                                variable: variable.clone(),
                                found: value_type_name(other),
                            })
                        }
                    }
                }
            };
            Ok(Some(TriggerRecord::Message {
                name: name.clone(),
                correlation_key: key,
            }))
        }
    }
}

fn is_interrupting(model: &ProcessModel, catch: &ElementDef) -> bool {
    if catch.element_type == BpmnElementType::StartEvent {
        catch
            .flow_scope
            .as_deref()
            .and_then(|esp| model.element(esp))
            .map_or(true, |esp| esp.interrupting)
    } else {
        catch.interrupting
    }
}

/// Open every subscription the instance needs. All correlation keys are
/// evaluated before the first subscription is written, so a failure leaves
/// nothing behind. With `skip_own`, a catch event that was already triggered
/// does not subscribe to its own event.
pub(crate) fn open_for_instance(
    batch: &mut Batch<'_>,
    key: Key,
    skip_own: bool,
) -> Result<(), CorrelationKeyError> {
    let Some(instance) = batch.state.tree.get(key).cloned() else {
        return Ok(());
    };
    let Some(definition) = batch.definition_of(&instance.record) else {
        return Ok(());
    };

    let mut pending = Vec::new();
    for catch in catch_elements(&definition, &batch.state.tree, &instance) {
        if skip_own && catch.id == instance.element_id() {
            continue;
        }
        if batch.state.subscriptions.find(key, &catch.id).is_some() {
            continue;
        }
        if let Some(trigger) = evaluate_trigger(batch, key, catch)? {
            pending.push(SubscriptionRecord {
                scope_key: key,
                catch_element_id: catch.id.clone(),
                process_instance_key: instance.process_instance_key(),
                bpmn_process_id: instance.record.bpmn_process_id.clone(),
                trigger,
                interrupting: is_interrupting(&definition, catch),
                tenant_id: instance.record.tenant_id.clone(),
            });
        }
    }

    for record in pending {
        let sub_key = batch.next_key();
        batch.event(
            sub_key,
            Intent::SubscriptionOpened,
            RecordValue::Subscription(record),
        );
    }
    Ok(())
}

pub(crate) fn delete(batch: &mut Batch<'_>, sub_key: Key) {
    if let Some(record) = batch.state.subscriptions.get(sub_key).cloned() {
        batch.event(
            sub_key,
            Intent::SubscriptionDeleted,
            RecordValue::Subscription(record),
        );
    }
}

/// Delete every subscription bound to the scope.
pub(crate) fn close_for_scope(batch: &mut Batch<'_>, scope_key: Key) {
    for sub_key in batch.state.subscriptions.keys_for_scope(scope_key) {
        delete(batch, sub_key);
    }
}

// ─── Correlation ──────────────────────────────────────────────

/// Correlate a message to at most one subscription per process instance.
/// Returns the triggered subscription keys.
pub(crate) fn correlate_message(
    batch: &mut Batch<'_>,
    name: &str,
    correlation_key: &str,
    tenant_id: &str,
    variables: &Document,
) -> Result<Vec<Key>, CommandError> {
    let candidates = batch
        .state
        .subscriptions
        .matching_messages(name, correlation_key, tenant_id);

    let mut seen_instances = BTreeSet::new();
    let mut correlated = Vec::new();
    for sub_key in candidates {
        // an earlier trigger may have closed this one
        let Some(record) = batch.state.subscriptions.get(sub_key) else {
            continue;
        };
        if !seen_instances.insert(record.process_instance_key) {
            continue;
        }
        trigger(batch, sub_key, variables.clone());
        correlated.push(sub_key);
    }

    if correlated.is_empty() {
        return Err(CommandError::NotFound(format!(
            "Expected to correlate message '{name}' with correlation key '{correlation_key}', but no subscription was found"
        )));
    }
    Ok(correlated)
}

/// Fire one subscription with the given payload.
pub(crate) fn trigger(batch: &mut Batch<'_>, sub_key: Key, payload: Document) {
    let Some(record) = batch.state.subscriptions.get(sub_key).cloned() else {
        return;
    };
    let Some(scope) = batch.state.tree.get(record.scope_key).cloned() else {
        tracing::debug!(sub_key, "subscription scope is gone, ignoring trigger");
        return;
    };
    let Some(definition) = batch.definition_of(&scope.record) else {
        return;
    };
    let Some(catch) = definition.element(&record.catch_element_id).cloned() else {
        return;
    };

    batch.event(
        sub_key,
        Intent::SubscriptionCorrelated,
        RecordValue::Subscription(record.clone()),
    );
    let is_timer = matches!(record.trigger, TriggerRecord::Timer { .. });

    match catch.element_type {
        BpmnElementType::StartEvent => {
            // event sub-process start, bound to the enclosing scope
            let Some(esp) = catch
                .flow_scope
                .as_deref()
                .and_then(|id| definition.element(id))
                .cloned()
            else {
                return;
            };
            lifecycle::request_activation(batch, scope.key, &esp, Some(payload));
            if record.interrupting {
                for key in batch.state.subscriptions.keys_for_scope(scope.key) {
                    let is_esp_start = batch
                        .state
                        .subscriptions
                        .get(key)
                        .and_then(|s| definition.element(&s.catch_element_id))
                        .is_some_and(|e| e.element_type == BpmnElementType::StartEvent);
                    if is_esp_start {
                        delete(batch, key);
                    }
                }
                for child in batch.state.tree.child_keys(scope.key) {
                    if batch.state.tree.is_active(child) {
                        lifecycle::terminate_tree(batch, child);
                    }
                }
            } else if is_timer {
                delete(batch, sub_key);
            }
        }
        BpmnElementType::BoundaryEvent => {
            lifecycle::request_activation(batch, scope.flow_scope_key(), &catch, Some(payload));
            if record.interrupting {
                lifecycle::terminate_tree(batch, scope.key);
            } else if is_timer {
                delete(batch, sub_key);
            }
        }
        _ if scope.element_type() == BpmnElementType::EventBasedGateway => {
            close_for_scope(batch, scope.key);
            lifecycle::request_completion(
                batch,
                scope.key,
                Document::new(),
                Some(Route {
                    target_element_id: catch.id.clone(),
                    trigger: payload,
                }),
            );
        }
        _ => {
            delete(batch, sub_key);
            lifecycle::request_completion(batch, scope.key, payload, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(scope_key: Key, catch: &str, name: &str, key: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            scope_key,
            catch_element_id: catch.into(),
            process_instance_key: 1,
            bpmn_process_id: "p".into(),
            trigger: TriggerRecord::Message {
                name: name.into(),
                correlation_key: key.into(),
            },
            interrupting: true,
            tenant_id: "<default>".into(),
        }
    }

    #[test]
    fn store_indexes_by_scope_and_message() {
        let mut store = SubscriptionStore::new();
        store.insert(10, message(1, "esp_start", "cancel", "k1"));
        store.insert(11, message(2, "boundary", "cancel", "k1"));
        store.insert(12, message(2, "other", "ping", "k1"));

        assert_eq!(store.keys_for_scope(2), vec![11, 12]);
        assert_eq!(store.find(2, "other"), Some(12));
        assert_eq!(store.matching_messages("cancel", "k1", "<default>"), vec![10, 11]);
        assert!(store.matching_messages("cancel", "k1", "tenant-b").is_empty());

        store.remove(11);
        assert_eq!(store.keys_for_scope(2), vec![12]);
        store.remove(12);
        assert!(store.keys_for_scope(2).is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn due_timers_respect_due_date() {
        let mut store = SubscriptionStore::new();
        let mut timer = message(1, "t", "", "");
        timer.trigger = TriggerRecord::Timer { due_date: 1_000 };
        store.insert(20, timer);
        assert!(store.due_timers(999).is_empty());
        assert_eq!(store.due_timers(1_000), vec![20]);
    }

    #[test]
    fn correlation_key_error_names_type() {
        let err = CorrelationKeyError {
            catch_element_id: "msg".into(),
            variable: "orderId".into(),
            found: value_type_name(Some(&serde_json::json!(true))),
        };
        assert_eq!(
            err.to_string(),
            "Failed to extract the correlation key for 'orderId': The value must be either a string or a number, but was 'BOOLEAN'."
        );
    }
}
