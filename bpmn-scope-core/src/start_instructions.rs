//! Where a new element instance goes when it is activated out of order.
//!
//! Creation with start instructions and modification activations both name
//! an element id and, optionally, an ancestor instance. The resolver walks
//! the element's static flow-scope chain and stops at the first scope it can
//! reuse: the explicit ancestor, the single active instance of that scope, or
//! the process instance root. Every scope passed on the way is synthesized.

use crate::model::{ElementDef, ProcessModel};
use crate::scope_tree::ScopeTree;
use crate::types::{BpmnElementType, Key};

/// Resolved placement of one activation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivationPlan {
    pub element_id: String,
    /// Existing instance below which the activation happens.
    pub attach_to: Key,
    /// Scope element ids to synthesize below `attach_to`, outermost first.
    pub create: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("flow scope '{flow_scope_id}' of element '{element_id}' has more than one active instance")]
pub struct AmbiguousFlowScope {
    pub element_id: String,
    pub flow_scope_id: String,
}

pub struct ScopeResolver<'a> {
    model: &'a ProcessModel,
    tree: &'a ScopeTree,
    process_instance_key: Key,
}

impl<'a> ScopeResolver<'a> {
    pub fn new(model: &'a ProcessModel, tree: &'a ScopeTree, process_instance_key: Key) -> Self {
        Self {
            model,
            tree,
            process_instance_key,
        }
    }

    pub fn resolve(&self, element_id: &str, ancestor: Option<Key>) -> Result<ActivationPlan, AmbiguousFlowScope> {
        let mut create = Vec::new();
        let mut attach_to = self.process_instance_key;

        for scope in self.model.flow_scope_chain(element_id) {
            if scope.element_type == BpmnElementType::Process {
                break;
            }
            match ancestor {
                Some(ancestor_key) => {
                    let matches = self.tree.get(ancestor_key).is_some_and(|instance| {
                        instance.element_id() == scope.id && !instance.is_multi_instance_body()
                    });
                    if matches {
                        attach_to = ancestor_key;
                        break;
                    }
                    create.push(scope.id.clone());
                }
                None => {
                    let active = self
                        .tree
                        .active_instances_of(self.process_instance_key, &scope.id);
                    match active.as_slice() {
                        [] => create.push(scope.id.clone()),
                        [single] => {
                            attach_to = single.key;
                            break;
                        }
                        _ => {
                            return Err(AmbiguousFlowScope {
                                element_id: element_id.to_string(),
                                flow_scope_id: scope.id.clone(),
                            })
                        }
                    }
                }
            }
        }

        create.reverse();
        Ok(ActivationPlan {
            element_id: element_id.to_string(),
            attach_to,
            create,
        })
    }
}

// ─── Shared target checks ─────────────────────────────────────

pub(crate) fn has_unsupported_type(element: &ElementDef) -> bool {
    element.element_type.is_unsupported_activation_target()
}

pub(crate) fn belongs_to_event_based_gateway(element: &ElementDef) -> bool {
    element.connected_to_event_based_gateway
}

/// First multi-instance scope enclosing the element, if any.
pub(crate) fn enclosing_multi_instance<'m>(model: &'m ProcessModel, element_id: &str) -> Option<&'m ElementDef> {
    model
        .flow_scope_chain(element_id)
        .into_iter()
        .find(|scope| scope.is_multi_instance())
}

/// Multi-instance element whose body an activation would have to create.
///
/// An activation may only enter a multi-instance scope through an existing
/// inner instance: either the explicit ancestor lies at or below one, or,
/// without an ancestor, at least one inner instance is active. Ancestors that
/// do not exist in this process instance are left to the ancestor checks.
pub(crate) fn multi_instance_violation(
    model: &ProcessModel,
    tree: &ScopeTree,
    process_instance_key: Key,
    element_id: &str,
    ancestor: Option<Key>,
) -> Option<String> {
    let element = model.element(element_id)?;
    if element.is_multi_instance() {
        return Some(element.id.clone());
    }
    if let Some(ancestor_key) = ancestor {
        let known = tree
            .get(ancestor_key)
            .is_some_and(|instance| instance.process_instance_key() == process_instance_key);
        if !known {
            return None;
        }
    }

    for scope in model.flow_scope_chain(element_id) {
        if !scope.is_multi_instance() {
            continue;
        }
        let reachable = match ancestor {
            Some(ancestor_key) => is_at_or_below_inner_instance(tree, ancestor_key, &scope.id),
            None => !tree
                .active_instances_of(process_instance_key, &scope.id)
                .is_empty(),
        };
        if !reachable {
            return Some(scope.id.clone());
        }
    }
    None
}

fn is_at_or_below_inner_instance(tree: &ScopeTree, key: Key, multi_instance_id: &str) -> bool {
    let mut current = tree.get(key);
    while let Some(instance) = current {
        if instance.element_id() == multi_instance_id && !instance.is_multi_instance_body() {
            return true;
        }
        current = tree.get_flow_scope(instance.key);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ElementRecord;
    use crate::model::ProcessBuilder;
    use crate::scope_tree::ElementInstance;
    use crate::types::{LifecycleState, NO_KEY};

    fn model() -> ProcessModel {
        ProcessBuilder::new("p")
            .start_event("start")
            .sub_process("outer", |s| {
                s.sub_process("inner", |i| i.user_task("A")).scoped(
                    ElementDef::new("looped", BpmnElementType::SubProcess).multi_instance(false, 2),
                    |l| l.user_task("C"),
                )
            })
            .user_task("B")
            .connect("start", "outer")
            .build()
            .unwrap()
    }

    fn instance(key: Key, element_id: &str, element_type: BpmnElementType, flow_scope_key: Key) -> ElementInstance {
        let mut instance = ElementInstance::new(
            key,
            ElementRecord {
                bpmn_process_id: "p".into(),
                version: 1,
                process_definition_key: 1,
                process_instance_key: 1,
                element_id: element_id.into(),
                bpmn_element_type: element_type,
                flow_scope_key,
                parent_process_instance_key: NO_KEY,
                parent_element_instance_key: NO_KEY,
                tenant_id: "<default>".into(),
                element_instance_path: vec![],
                process_definition_path: vec![1],
                loop_counter: 0,
                business_id: None,
            },
        );
        instance.state = LifecycleState::Activated;
        instance
    }

    #[test]
    fn missing_scopes_are_created_outermost_first() {
        let model = model();
        let mut tree = ScopeTree::new();
        tree.insert(instance(1, "p", BpmnElementType::Process, NO_KEY));

        let plan = ScopeResolver::new(&model, &tree, 1).resolve("A", None).unwrap();
        assert_eq!(plan.attach_to, 1);
        assert_eq!(plan.create, vec!["outer".to_string(), "inner".to_string()]);

        let plan = ScopeResolver::new(&model, &tree, 1).resolve("B", None).unwrap();
        assert_eq!(plan.attach_to, 1);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn single_active_scope_is_reused_and_two_are_ambiguous() {
        let model = model();
        let mut tree = ScopeTree::new();
        tree.insert(instance(1, "p", BpmnElementType::Process, NO_KEY));
        tree.insert(instance(2, "outer", BpmnElementType::SubProcess, 1));

        let plan = ScopeResolver::new(&model, &tree, 1).resolve("A", None).unwrap();
        assert_eq!(plan.attach_to, 2);
        assert_eq!(plan.create, vec!["inner".to_string()]);

        tree.insert(instance(3, "outer", BpmnElementType::SubProcess, 1));
        let err = ScopeResolver::new(&model, &tree, 1).resolve("A", None).unwrap_err();
        assert_eq!(err.flow_scope_id, "outer");

        let plan = ScopeResolver::new(&model, &tree, 1).resolve("A", Some(3)).unwrap();
        assert_eq!(plan.attach_to, 3);
        assert_eq!(plan.create, vec!["inner".to_string()]);
    }

    #[test]
    fn multi_instance_scopes_need_an_inner_instance() {
        let model = model();
        let mut tree = ScopeTree::new();
        tree.insert(instance(1, "p", BpmnElementType::Process, NO_KEY));
        tree.insert(instance(2, "outer", BpmnElementType::SubProcess, 1));

        assert_eq!(
            multi_instance_violation(&model, &tree, 1, "C", None),
            Some("looped".to_string())
        );
        assert_eq!(
            multi_instance_violation(&model, &tree, 1, "looped", None),
            Some("looped".to_string())
        );

        tree.insert(instance(3, "looped", BpmnElementType::MultiInstanceBody, 2));
        tree.insert(instance(4, "looped", BpmnElementType::SubProcess, 3));
        assert_eq!(multi_instance_violation(&model, &tree, 1, "C", None), None);
        assert_eq!(multi_instance_violation(&model, &tree, 1, "C", Some(4)), None);
        assert_eq!(
            multi_instance_violation(&model, &tree, 1, "C", Some(3)),
            Some("looped".to_string())
        );
        assert_eq!(enclosing_multi_instance(&model, "C").map(|e| e.id.as_str()), Some("looped"));
        assert!(enclosing_multi_instance(&model, "A").is_none());
    }
}
