//! Process instance modification through the engine.

mod common;

use bpmn_scope_core::modification::AncestorSelection;
use bpmn_scope_core::model::{CorrelationKey, EventDefinition};
use bpmn_scope_core::variables::VariableInstruction;
use bpmn_scope_core::{
    ActivateInstruction, AncestorStatePolicy, BpmnElementType, Command, CommandResponse, CreateCommand, ElementDef,
    EngineConfig, Intent, ModifyCommand, MoveInstruction, ProcessBuilder, ProcessModel, RejectionType,
};
use common::{doc, RecordingHarness};
use serde_json::json;

/// start → A → B → end
fn two_tasks() -> ProcessModel {
    ProcessBuilder::new("two_tasks")
        .start_event("start")
        .user_task("A")
        .user_task("B")
        .end_event("end")
        .chain(&["start", "A", "B", "end"])
        .build()
        .unwrap()
}

/// start → A → sub(sub_start → B, C) → end
fn order() -> ProcessModel {
    ProcessBuilder::new("order")
        .start_event("start")
        .user_task("A")
        .sub_process("sub", |s| {
            s.start_event("sub_start")
                .user_task("B")
                .user_task("C")
                .connect("sub_start", "B")
        })
        .end_event("end")
        .chain(&["start", "A", "sub", "end"])
        .build()
        .unwrap()
}

/// start → fork → (keep, sub(sub_start → work×3 with a boundary timer))
fn fan_out() -> ProcessModel {
    ProcessBuilder::new("fan_out")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("keep")
        .sub_process("sub", |s| {
            s.start_event("sub_start")
                .element(
                    ElementDef::new("work", BpmnElementType::ServiceTask)
                        .job_type("work")
                        .multi_instance(false, 3),
                )
                .boundary_event("timeout", "work", EventDefinition::Timer { duration_ms: 1_000 })
                .connect("sub_start", "work")
        })
        .connect("start", "fork")
        .connect("fork", "keep")
        .connect("fork", "sub")
        .build()
        .unwrap()
}

fn parent() -> ProcessModel {
    ProcessBuilder::new("parent")
        .start_event("start")
        .call_activity("call", "child")
        .end_event("end")
        .chain(&["start", "call", "end"])
        .build()
        .unwrap()
}

fn child() -> ProcessModel {
    ProcessBuilder::new("child")
        .start_event("start")
        .user_task("T")
        .end_event("end")
        .chain(&["start", "T", "end"])
        .build()
        .unwrap()
}

/// start → work → gateway → (paid | expired) → end, with a boundary timer
/// on work
fn targets() -> ProcessModel {
    ProcessBuilder::new("targets")
        .start_event("start")
        .user_task("work")
        .event_based_gateway("gateway")
        .message_catch_event("paid", "payment", CorrelationKey::Static("k".to_string()))
        .timer_catch_event("expired", 1_000)
        .boundary_event("deadline", "work", EventDefinition::Timer { duration_ms: 5_000 })
        .end_event("end")
        .chain(&["start", "work", "gateway", "paid", "end"])
        .chain(&["gateway", "expired", "end"])
        .connect("deadline", "end")
        .build()
        .unwrap()
}

/// start → sub(sub_start → B) → end, where sub maps a variable the instance
/// does not have
fn mapped() -> ProcessModel {
    ProcessBuilder::new("mapped")
        .start_event("start")
        .scoped(
            ElementDef::new("sub", BpmnElementType::SubProcess).input("amount", "amount"),
            |s| s.start_event("sub_start").user_task("B").connect("sub_start", "B"),
        )
        .end_event("end")
        .chain(&["start", "sub", "end"])
        .build()
        .unwrap()
}

fn rejected_reason(response: &CommandResponse) -> &str {
    response
        .rejection()
        .map(|rejection| rejection.reason.as_str())
        .unwrap_or_default()
}

// ── Activation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn global_variables_are_written_before_the_activation() {
    let mut harness = RecordingHarness::new(vec![two_tasks()]).await;
    let pi = harness.create("two_tasks").await;
    harness.clear();

    let response = harness
        .modify(ModifyCommand::new(pi).activate(
            ActivateInstruction::new("B").variables(VariableInstruction::global(doc(json!({"x": 1})))),
        ))
        .await;
    assert!(response.is_accepted());
    assert_eq!(response.key(), Some(pi));

    let variable = harness
        .position_of(|r| r.intent == Intent::VariableCreated && r.variable().is_some_and(|v| v.scope_key == pi))
        .unwrap();
    let activating = harness
        .position_of(|r| r.intent == Intent::ElementActivating && r.element_id() == "B")
        .unwrap();
    assert!(variable < activating);

    assert_eq!(harness.variable(pi, "x").await, Some(json!(1)));
    assert_eq!(harness.keys_of(pi, "A").await.len(), 1);
    assert_eq!(harness.keys_of(pi, "B").await.len(), 1);
}

#[tokio::test]
async fn activating_twice_into_one_flow_scope_needs_an_ancestor() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    for _ in 0..2 {
        let response = harness
            .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("sub")))
            .await;
        assert!(response.is_accepted());
    }
    let subs = harness.keys_of(pi, "sub").await;
    assert_eq!(subs.len(), 2);

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("C")))
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more activate instructions for an element that has a flow scope with more than one active instance: 'sub'. Can't decide in which instance of the flow scope the element should be activated. Please specify an ancestor element instance key for this activate instruction."
    );

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("C").ancestor(subs[1])))
        .await;
    assert!(response.is_accepted());
    let c = harness.key_of(pi, "C").await;
    assert_eq!(harness.state().await.tree.get(c).unwrap().flow_scope_key(), subs[1]);
}

#[tokio::test]
async fn local_variables_outside_the_flow_scope_are_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    let response = harness
        .modify(ModifyCommand::new(pi).activate(
            ActivateInstruction::new("B").variables(VariableInstruction::local("A", doc(json!({"y": 2})))),
        ))
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more variable instructions with a scope element that doesn't belong to the activating element's flow scope: 'A'. These variables should be set before or after the modification."
    );
    assert!(harness.keys_of(pi, "B").await.is_empty());
}

#[tokio::test]
async fn activate_element_command_uses_regular_resolution() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    harness
        .accept(Command::ActivateElement {
            process_instance_key: pi,
            element_id: "C".to_string(),
            ancestor_scope_key: None,
        })
        .await;
    let sub = harness.key_of(pi, "sub").await;
    let c = harness.key_of(pi, "C").await;
    assert_eq!(harness.state().await.tree.get(c).unwrap().flow_scope_key(), sub);
    assert!(!harness.has_record_for("sub_start"));
}

#[tokio::test]
async fn activations_sharing_a_missing_scope_create_it_once() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    harness.clear();

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .activate(ActivateInstruction::new("B"))
                .activate(ActivateInstruction::new("C")),
        )
        .await;
    assert!(response.is_accepted());

    assert_eq!(harness.element_events(Intent::ElementActivating, "sub").len(), 1);
    let sub = harness.key_of(pi, "sub").await;
    let state = harness.state().await;
    for element_id in ["B", "C"] {
        let instances = state.tree.active_instances_of(pi, element_id);
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].flow_scope_key(), sub);
    }
    assert!(!harness.has_record_for("sub_start"));
    assert_eq!(harness.keys_of(pi, "A").await.len(), 1);
}

// ── Termination ──────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_termination_key_is_rejected_with_context() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    harness.clear();

    let response = harness.modify(ModifyCommand::new(pi).terminate_key(12345)).await;
    let rejection = response.rejection().unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::InvalidArgument);
    assert!(rejection.reason.contains("'12345'"));
    assert_eq!(rejection.process_instance_key, pi);
    assert_eq!(rejection.command, Some(Intent::Modify));
    assert_eq!(response.records().len(), 1);
    assert_eq!(harness.keys_of(pi, "A").await.len(), 1);
}

#[tokio::test]
async fn identical_invalid_commands_are_rejected_identically() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    let command = ModifyCommand::new(pi)
        .terminate_key(777)
        .activate(ActivateInstruction::new("nope"));

    let first = harness.modify(command.clone()).await;
    let second = harness.modify(command).await;
    assert_eq!(first.rejection(), second.rejection());
    assert_eq!(first.records()[0].value, second.records()[0].value);
}

#[tokio::test]
async fn terminating_a_scope_with_a_multi_instance_body_leaves_nothing_open() {
    let mut harness = RecordingHarness::new(vec![fan_out()]).await;
    let pi = harness.create("fan_out").await;
    {
        let state = harness.state().await;
        assert_eq!(state.jobs.len(), 3);
        assert_eq!(state.subscriptions.len(), 1);
    }

    let sub = harness.key_of(pi, "sub").await;
    let response = harness.modify(ModifyCommand::new(pi).terminate_key(sub)).await;
    assert!(response.is_accepted());

    let state = harness.state().await;
    assert!(state.jobs.is_empty());
    assert!(state.subscriptions.is_empty());
    assert!(!state.tree.iter().any(|i| i.element_id() == "work" || i.element_id() == "sub"));
    assert_eq!(harness.keys_of(pi, "keep").await.len(), 1);
}

#[tokio::test]
async fn terminate_element_command_ends_an_emptied_instance() {
    let mut harness = RecordingHarness::new(vec![two_tasks()]).await;
    let pi = harness.create("two_tasks").await;
    let a = harness.key_of(pi, "A").await;

    harness
        .accept(Command::TerminateElement {
            element_instance_key: a,
        })
        .await;
    assert!(harness.state().await.tree.is_empty());
    assert!(harness.events(Intent::ElementTerminated).iter().any(|r| r.key == pi));
}

#[tokio::test]
async fn emptying_a_called_instance_is_rejected() {
    let mut harness = RecordingHarness::new(vec![child(), parent()]).await;
    let root = harness.create("parent").await;
    let call = harness.key_of(root, "call").await;
    let called = harness.state().await.tree.get(call).unwrap().called_child.unwrap();

    let response = harness.modify(ModifyCommand::new(called).terminate_element("T")).await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'child' but the given instructions would terminate the instance. The instance was created by a call activity in the parent process. To terminate this instance please modify the parent process instead."
    );
    assert_eq!(harness.keys_of(called, "T").await.len(), 1);
}

// ── Move ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn move_into_the_source_parent_keeps_the_scope() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness
        .accept(Command::Create(CreateCommand::by_id("order").start_at("B")))
        .await;
    let sub = harness.key_of(pi, "sub").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .move_element(MoveInstruction::by_element("B", "C").ancestor(AncestorSelection::SourceParent)),
        )
        .await;
    assert!(response.is_accepted());

    let c = harness.key_of(pi, "C").await;
    assert_eq!(harness.state().await.tree.get(c).unwrap().flow_scope_key(), sub);
    assert_eq!(harness.element_events(Intent::ElementActivating, "sub").len(), 1);
    assert!(harness.keys_of(pi, "B").await.is_empty());
}

#[tokio::test]
async fn move_with_explicit_ancestor_synthesizes_a_fresh_scope() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness
        .accept(Command::Create(CreateCommand::by_id("order").start_at("B")))
        .await;
    let old_sub = harness.key_of(pi, "sub").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .move_element(MoveInstruction::by_element("B", "C").ancestor(AncestorSelection::Direct(pi))),
        )
        .await;
    assert!(response.is_accepted());

    let new_sub = harness.key_of(pi, "sub").await;
    assert_ne!(new_sub, old_sub);
    let c = harness.key_of(pi, "C").await;
    assert_eq!(harness.state().await.tree.get(c).unwrap().flow_scope_key(), new_sub);
    assert!(harness
        .events(Intent::ElementTerminated)
        .iter()
        .any(|r| r.key == old_sub));
}

// ── Limits and preconditions ─────────────────────────────────────────────

#[tokio::test]
async fn oversized_modification_is_rejected_and_leaves_state_alone() {
    let config = EngineConfig {
        max_message_size: 4_096,
        ..EngineConfig::default()
    };
    let mut harness = RecordingHarness::with_config(config, vec![two_tasks()]).await;
    let pi = harness.create("two_tasks").await;
    let before = harness.state().await;

    let payload = "x".repeat(8_192);
    let response = harness
        .modify(ModifyCommand::new(pi).activate(
            ActivateInstruction::new("B")
                .variables(VariableInstruction::global(doc(json!({ "payload": payload })))),
        ))
        .await;
    let rejection = response.rejection().unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::ExceededBatchRecordSize);
    assert_eq!(
        rejection.reason,
        format!("Unable to modify process instance with key '{pi}' as the size exceeds the maximum batch size. Please reduce the size by splitting the modification into multiple commands.")
    );

    let after = harness.state().await;
    assert_eq!(after.tree, before.tree);
    assert_eq!(after.variables, before.variables);
}

#[tokio::test]
async fn suspended_instance_cannot_be_modified() {
    let mut harness = RecordingHarness::new(vec![two_tasks()]).await;
    let pi = harness.create("two_tasks").await;
    harness
        .accept(Command::Suspend {
            process_instance_key: pi,
        })
        .await;

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("B")))
        .await;
    let rejection = response.rejection().unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::InvalidState);
    assert_eq!(
        rejection.reason,
        format!("Expected to modify process instance with key '{pi}', but it is suspended")
    );
}

// ── Validation ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_activation_targets_are_reported_together() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .activate(ActivateInstruction::new("x"))
                .activate(ActivateInstruction::new("y"))
                .activate(ActivateInstruction::new("x"))
                .move_element(MoveInstruction::by_element("A", "z")),
        )
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more activate instructions with an element that could not be found: 'x', 'y', 'z'"
    );
}

#[tokio::test]
async fn unsupported_targets_share_one_rejection() {
    let mut harness = RecordingHarness::new(vec![targets()]).await;
    let pi = harness.create("targets").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .activate(ActivateInstruction::new("start"))
                .activate(ActivateInstruction::new("deadline"))
                .activate(ActivateInstruction::new("start_to_work"))
                .activate(ActivateInstruction::new("paid")),
        )
        .await;
    let rejection = response.rejection().unwrap();
    assert_eq!(rejection.rejection_type, RejectionType::InvalidArgument);
    assert_eq!(
        rejection.reason,
        "Expected to modify instance of process 'targets' but it contains one or more activate instructions for elements that are unsupported: 'start', 'deadline', 'start_to_work', 'paid'. \
         The activation of elements with type 'START_EVENT', 'BOUNDARY_EVENT', 'SEQUENCE_FLOW' is not supported. \
         Supported element types are: [SUB_PROCESS, EVENT_SUB_PROCESS, END_EVENT, INTERMEDIATE_CATCH_EVENT, \
         INTERMEDIATE_THROW_EVENT, SERVICE_TASK, USER_TASK, RECEIVE_TASK, MANUAL_TASK, TASK, EXCLUSIVE_GATEWAY, \
         PARALLEL_GATEWAY, EVENT_BASED_GATEWAY, CALL_ACTIVITY]. \
         The activation of events belonging to an event-based gateway is not supported."
    );
    assert_eq!(response.records().len(), 1);
}

#[tokio::test]
async fn event_based_gateway_member_alone_is_unsupported() {
    let mut harness = RecordingHarness::new(vec![targets()]).await;
    let pi = harness.create("targets").await;

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("expired")))
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'targets' but it contains one or more activate instructions for elements that are unsupported: 'expired'. The activation of events belonging to an event-based gateway is not supported."
    );
}

#[tokio::test]
async fn activating_ancestor_follows_the_state_policy() {
    let mut harness = RecordingHarness::new(vec![mapped()]).await;
    let pi = harness.create("mapped").await;
    let sub = harness.key_of(pi, "sub").await;
    assert_eq!(harness.state().await.incidents.len(), 1);

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("B").ancestor(sub)))
        .await;
    assert_eq!(
        rejected_reason(&response),
        format!("Expected to modify instance of process 'mapped' but it contains one or more activate instructions with an ancestor scope key that does not exist, or is not in an active state: '{sub}'")
    );

    let config = EngineConfig {
        ancestor_state_policy: AncestorStatePolicy::ActivatingOrActivated,
        ..EngineConfig::default()
    };
    let mut harness = RecordingHarness::with_config(config, vec![mapped()]).await;
    let pi = harness.create("mapped").await;
    let sub = harness.key_of(pi, "sub").await;
    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("B").ancestor(sub)))
        .await;
    assert!(response.is_accepted());
    let b = harness.key_of(pi, "B").await;
    assert_eq!(harness.state().await.tree.get(b).unwrap().flow_scope_key(), sub);
}

#[tokio::test]
async fn ancestor_of_another_instance_is_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    let other = harness.create("order").await;

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("C").ancestor(other)))
        .await;
    assert_eq!(
        rejected_reason(&response),
        format!("Expected to modify instance of process 'order' but it contains one or more activate instructions with an ancestor scope key that does not belong to the modified process instance: '{other}'")
    );
}

#[tokio::test]
async fn ancestor_must_be_a_flow_scope_of_the_target() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness
        .accept(Command::Create(CreateCommand::by_id("order").start_at("B")))
        .await;
    let sub = harness.key_of(pi, "sub").await;

    let response = harness
        .modify(ModifyCommand::new(pi).activate(ActivateInstruction::new("A").ancestor(sub)))
        .await;
    assert_eq!(
        rejected_reason(&response),
        format!("Expected to modify instance of process 'order' but it contains one or more activate instructions with an ancestor scope key that is not an ancestor of the element to activate:\n- instance '{sub}' of element 'sub' is not an ancestor of element 'A'")
    );
}

#[tokio::test]
async fn moves_without_source_or_target_are_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .move_element(MoveInstruction::by_element("A", " "))
                .move_element(MoveInstruction::by_element("", "B")),
        )
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more move instructions with either or both the source or target element id missing: at index '0', '1'"
    );
}

#[tokio::test]
async fn move_source_given_by_key_and_id_is_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;
    let a = harness.key_of(pi, "A").await;

    let response = harness
        .modify(ModifyCommand::new(pi).move_element(MoveInstruction {
            source_element_id: Some("A".to_string()),
            ..MoveInstruction::by_key(a, "B")
        }))
        .await;
    assert_eq!(
        rejected_reason(&response),
        format!("Expected to modify instance of process 'order' but it contains one or more move instructions with both source element instance key and source element id, but only one of them is allowed: '({a}, A)'")
    );
}

#[tokio::test]
async fn moves_from_the_same_source_element_are_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    let response = harness
        .modify(
            ModifyCommand::new(pi)
                .move_element(MoveInstruction::by_element("A", "B"))
                .move_element(MoveInstruction::by_element("A", "C")),
        )
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains multiple move instructions with identical source element ids: 'A'"
    );
}

#[tokio::test]
async fn missing_move_sources_are_rejected() {
    let mut harness = RecordingHarness::new(vec![order()]).await;
    let pi = harness.create("order").await;

    let response = harness
        .modify(ModifyCommand::new(pi).move_element(MoveInstruction::by_key(4242, "B")))
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more move instructions with a source element instance that could not be found: '4242'"
    );

    let response = harness
        .modify(ModifyCommand::new(pi).move_element(MoveInstruction::by_element("nope", "B")))
        .await;
    assert_eq!(
        rejected_reason(&response),
        "Expected to modify instance of process 'order' but it contains one or more move instructions with a source element that could not be found: 'nope'"
    );
    assert_eq!(harness.keys_of(pi, "A").await.len(), 1);
}
