mod common;

use bpmn_runtime_core::definition::{
    DataMapping, GatewayDirection, GatewayType, NodeSpec, ThrowEvent, TriggerDoc,
};
use bpmn_runtime_core::handler::EchoHandler;
use bpmn_runtime_core::{
    AuditEvent, DefinitionSource, EngineConfig, EngineError, EventType, NodeInstanceStatus, ProcessBuilder,
    ProcessDefinition, ProcessStatus, RuntimeEnvironment, RuntimeManager, StrategyKind, Variables,
};
use common::Harness;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

fn vars(pairs: &[(&str, serde_json::Value)]) -> Variables {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// ─── Parallel join ────────────────────────────────────────────

fn fork_join() -> bpmn_runtime_core::ProcessDefinition {
    ProcessBuilder::new("fork-join")
        .start("s")
        .gateway("fork", GatewayType::Parallel, GatewayDirection::Split)
        .task("a", "manual")
        .task("b", "manual")
        .gateway("j", GatewayType::Parallel, GatewayDirection::Join)
        .end("e")
        .connect("s", "fork")
        .connect("fork", "a")
        .connect("fork", "b")
        .connect("a", "j")
        .connect("b", "j")
        .connect("j", "e")
        .build()
        .unwrap()
}

#[tokio::test]
async fn parallel_join_fires_once_in_either_order() {
    for first in ["a", "b"] {
        let h = Harness::new(StrategyKind::PerProcessInstance, vec![fork_join()]).await;
        let pi = h.manager.start_process("fork-join", Variables::new()).await.unwrap();
        assert_eq!(h.active_nodes(pi).await, vec!["a", "b"]);

        let second = if first == "a" { "b" } else { "a" };
        let item = h.work_item(pi, first).await;
        h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
        assert_eq!(h.audit.count_left("j", NodeInstanceStatus::Completed), 0);
        assert_eq!(h.active_nodes(pi).await, vec![second, "j"]);

        let item = h.work_item(pi, second).await;
        h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
        assert_eq!(h.audit.count_left("j", NodeInstanceStatus::Completed), 1);
        assert_eq!(h.audit.count_entered("e"), 1);
        assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    }
}

// ─── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn interrupting_boundary_cancels_the_whole_sub_process() {
    let def = ProcessBuilder::new("cancellable")
        .start("s")
        .sub_process("sp")
        .enter("sp")
        .start("sp_s")
        .gateway("fork", GatewayType::Parallel, GatewayDirection::Split)
        .task("x", "manual")
        .task("y", "manual")
        .boundary("x_late", "x", TriggerDoc::Timer("PT1H".into()), false)
        .gateway("join", GatewayType::Parallel, GatewayDirection::Join)
        .end("sp_e")
        .end("late_e")
        .connect("sp_s", "fork")
        .connect("fork", "x")
        .connect("fork", "y")
        .connect("x", "join")
        .connect("y", "join")
        .connect("join", "sp_e")
        .connect("x_late", "late_e")
        .leave()
        .boundary("cancel", "sp", TriggerDoc::Signal("cancel".into()), true)
        .task("cleanup", "manual")
        .end("e")
        .end("cleanup_e")
        .chain(&["s", "sp", "e"])
        .chain(&["cancel", "cleanup", "cleanup_e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h.manager.start_process("cancellable", Variables::new()).await.unwrap();

    let inst = h.instance(pi).await;
    assert_eq!(inst.timers.len(), 1);
    assert_eq!(inst.subscriptions.len(), 2);
    assert_eq!(h.env.timers.pending_for(pi), 1);

    let reacted = h
        .manager
        .signal_instance(pi, EventType::signal("cancel"), None, None)
        .await
        .unwrap();
    assert_eq!(reacted, 1);

    for node in ["x", "y", "sp"] {
        assert_eq!(h.audit.count_left(node, NodeInstanceStatus::Cancelled), 1, "{node}");
    }
    assert_eq!(h.audit.count_entered("join"), 0);
    assert_eq!(h.audit.count_entered("sp_e"), 0);

    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Active);
    assert!(inst.timers.is_empty());
    assert!(inst.subscriptions.is_empty());
    assert_eq!(h.env.timers.pending_for(pi), 0);
    assert_eq!(h.active_nodes(pi).await, vec!["cleanup"]);
}

#[tokio::test]
async fn unmatched_signal_changes_nothing() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![fork_join()]).await;
    let pi = h.manager.start_process("fork-join", Variables::new()).await.unwrap();
    let before = h.instance(pi).await;

    let reacted = h
        .manager
        .signal_instance(pi, EventType::signal("nobody-listens"), None, None)
        .await
        .unwrap();
    assert_eq!(reacted, 0);
    assert_eq!(h.instance(pi).await, before);
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::SignalIgnored { process_instance_id: Some(p), .. } if *p == pi)));
}

#[tokio::test]
async fn abort_cancels_everything_and_drops_timers() {
    let def = ProcessBuilder::new("waiting")
        .start("s")
        .task("work", "manual")
        .boundary("reminder", "work", TriggerDoc::Timer("PT5M".into()), false)
        .end("e")
        .end("reminded")
        .chain(&["s", "work", "e"])
        .connect("reminder", "reminded")
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h.manager.start_process("waiting", Variables::new()).await.unwrap();
    assert_eq!(h.env.timers.pending_for(pi), 1);

    h.manager.abort_process(pi).await.unwrap();

    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Aborted);
    assert!(inst.node_instances.is_empty());
    assert!(inst.timers.is_empty());
    assert_eq!(h.audit.count_left("work", NodeInstanceStatus::Cancelled), 1);
    assert_eq!(h.env.timers.pending_for(pi), 0);

    let err = h
        .manager
        .signal_instance(pi, EventType::signal("late"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotActive { .. }));
}

// ─── Errors ───────────────────────────────────────────────────

fn with_error_handler(esp: bool) -> bpmn_runtime_core::ProcessDefinition {
    let b = ProcessBuilder::new("guarded")
        .start("s")
        .task("work", "manual")
        .end("e")
        .chain(&["s", "work", "e"]);
    let b = if esp {
        b.event_sub_process("on_e1")
            .enter("on_e1")
            .triggered_start("e1_start", TriggerDoc::Error(Some("E1".into())), true)
            .task("handle", "manual")
            .end("e1_end")
            .chain(&["e1_start", "handle", "e1_end"])
            .leave()
    } else {
        b
    };
    b.build().unwrap()
}

#[tokio::test]
async fn error_event_sub_process_claims_a_delivered_error() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_error_handler(true)]).await;
    let pi = h.manager.start_process("guarded", Variables::new()).await.unwrap();

    let claimed = h
        .manager
        .signal_instance(pi, EventType::error("E1"), None, None)
        .await
        .unwrap();
    assert_eq!(claimed, 1);

    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Active);
    assert_eq!(h.audit.count_left("work", NodeInstanceStatus::Cancelled), 1);
    assert_eq!(h.active_nodes(pi).await, vec!["handle", "on_e1"]);

    let item = h.work_item(pi, "handle").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn unclaimed_error_aborts_the_instance() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_error_handler(false)]).await;
    let pi = h.manager.start_process("guarded", Variables::new()).await.unwrap();

    let err = h
        .manager
        .signal_instance(pi, EventType::error("E1"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionFailure { ref code, .. } if code == "E1"));

    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Aborted);
    assert_eq!(inst.outcome.as_ref().map(|o| o.code.as_str()), Some("E1"));
}

#[tokio::test]
async fn failed_work_item_is_caught_by_its_error_boundary() {
    let def = ProcessBuilder::new("payment")
        .start("s")
        .task("charge", "manual")
        .boundary("declined", "charge", TriggerDoc::Error(Some("CardDeclined".into())), true)
        .end("paid")
        .end("refused")
        .chain(&["s", "charge", "paid"])
        .connect("declined", "refused")
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h.manager.start_process("payment", Variables::new()).await.unwrap();

    let item = h.work_item(pi, "charge").await;
    h.manager
        .fail_work_item(pi, item, "CardDeclined", "insufficient funds")
        .await
        .unwrap();

    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    assert_eq!(h.audit.count_left("charge", NodeInstanceStatus::Cancelled), 1);
    assert_eq!(h.audit.count_entered("refused"), 1);
    assert_eq!(h.audit.count_entered("paid"), 0);
}

// ─── Compensation ─────────────────────────────────────────────

#[tokio::test]
async fn compensation_runs_handlers_in_reverse_completion_order() {
    let def = ProcessBuilder::new("booking")
        .start("s")
        .task("flight", "echo")
        .task("hotel", "echo")
        .compensation("flight_comp", "flight", "cancel_flight")
        .compensation("hotel_comp", "hotel", "cancel_hotel")
        .task("cancel_flight", "undo")
        .task("cancel_hotel", "undo")
        .throw("undo_all", ThrowEvent::Compensation(None))
        .task("hold", "manual")
        .end("e")
        .chain(&["s", "flight", "hotel", "undo_all", "hold", "e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    h.handlers.register("echo", Arc::new(EchoHandler));

    let pi = h.manager.start_process("booking", Variables::new()).await.unwrap();

    let entered: Vec<String> = h
        .audit
        .events()
        .into_iter()
        .filter_map(|e| match e {
            AuditEvent::NodeEntered { node_id, .. } if node_id.starts_with("cancel_") => Some(node_id),
            _ => None,
        })
        .collect();
    assert_eq!(entered, vec!["cancel_hotel", "cancel_flight"]);

    // Handlers are consumed by the first throw.
    let inst = h.instance(pi).await;
    assert!(inst.subscriptions.is_empty());
    assert_eq!(h.active_nodes(pi).await, vec!["cancel_flight", "cancel_hotel", "hold"]);
}

// ─── Gateways ─────────────────────────────────────────────────

fn routing(with_default: bool) -> bpmn_runtime_core::ProcessDefinition {
    let b = ProcessBuilder::new("routing")
        .start("s")
        .gateway("split", GatewayType::Exclusive, GatewayDirection::Split)
        .end("big")
        .end("small")
        .connect("s", "split")
        .connect_when("split", "big", "amount > 100");
    let b = if with_default {
        b.connect_default("split", "small")
    } else {
        b.connect_when("split", "small", "amount < 10")
    };
    b.build().unwrap()
}

#[tokio::test]
async fn exclusive_gateway_takes_the_first_true_branch_or_the_default() {
    let h = Harness::new(StrategyKind::PerRequest, vec![routing(true)]).await;

    let big = h
        .manager
        .start_process("routing", vars(&[("amount", json!(500))]))
        .await
        .unwrap();
    assert_eq!(h.instance(big).await.status, ProcessStatus::Completed);
    assert_eq!(h.audit.count_entered("big"), 1);

    h.manager
        .start_process("routing", vars(&[("amount", json!(50))]))
        .await
        .unwrap();
    assert_eq!(h.audit.count_entered("small"), 1);
    assert_eq!(h.audit.count_entered("big"), 1);
}

#[tokio::test]
async fn exclusive_gateway_without_a_path_fails_the_instance() {
    let h = Harness::new(StrategyKind::PerRequest, vec![routing(false)]).await;

    let err = h
        .manager
        .start_process("routing", vars(&[("amount", json!(50))]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionFailure { ref code, .. } if code == "NoOutgoingPath"));
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::ProcessAborted { code: Some(c), .. } if c == "NoOutgoingPath")));
}

#[tokio::test]
async fn undeployed_process_is_a_definition_error() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![]).await;
    let err = h.manager.start_process("missing", Variables::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Definition { .. }));
}

// ─── Call activities ──────────────────────────────────────────

#[tokio::test]
async fn call_activity_waits_for_its_child() {
    let parent = ProcessBuilder::new("parent")
        .start("s")
        .call_activity("call", "child")
        .end("e")
        .chain(&["s", "call", "e"])
        .build()
        .unwrap();
    let child = ProcessBuilder::new("child")
        .start("cs")
        .task("child_work", "manual")
        .end("ce")
        .chain(&["cs", "child_work", "ce"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![parent, child]).await;

    let pi = h.manager.start_process("parent", Variables::new()).await.unwrap();
    let links = h.instance(pi).await.linked_children();
    assert_eq!(links.len(), 1);
    let (_, child_pi) = links[0];

    let child_inst = h.instance(child_pi).await;
    assert_eq!(child_inst.process_id, "child");
    assert_eq!(child_inst.parent.map(|p| p.process_instance_id), Some(pi));

    let parent_session = h
        .manager
        .bind(&bpmn_runtime_core::ContextKey::ProcessInstance(pi))
        .await
        .unwrap();
    let child_session = h
        .manager
        .bind(&bpmn_runtime_core::ContextKey::ProcessInstance(child_pi))
        .await
        .unwrap();
    assert_eq!(parent_session.id(), child_session.id());

    let item = h.work_item(child_pi, "child_work").await;
    h.manager
        .complete_work_item(child_pi, item, Variables::new())
        .await
        .unwrap();

    assert_eq!(h.instance(child_pi).await.status, ProcessStatus::Completed);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    assert_eq!(h.audit.count_left("call", NodeInstanceStatus::Completed), 1);
}

fn started_child(h: &Harness) -> Uuid {
    h.audit
        .events()
        .into_iter()
        .find_map(|e| match e {
            AuditEvent::ProcessStarted {
                process_instance_id,
                process_id,
                ..
            } if process_id == "child" => Some(process_instance_id),
            _ => None,
        })
        .expect("child started")
}

fn manual_child() -> ProcessDefinition {
    ProcessBuilder::new("child")
        .start("cs")
        .task("child_work", "manual")
        .end("ce")
        .chain(&["cs", "child_work", "ce"])
        .build()
        .unwrap()
}

#[tokio::test]
async fn call_activity_maps_data_in_and_out() {
    let parent = ProcessBuilder::new("parent")
        .start("s")
        .call_activity_with(
            "call",
            "child",
            true,
            false,
            vec![DataMapping::new("customer", "name").with_transform("upper")],
            vec![DataMapping::new("verdict", "decision")],
        )
        .task("after", "manual")
        .end("e")
        .chain(&["s", "call", "after", "e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![parent, manual_child()]).await;

    let pi = h
        .manager
        .start_process("parent", vars(&[("customer", json!("ada"))]))
        .await
        .unwrap();
    let child_pi = started_child(&h);
    let child = h.instance(child_pi).await;
    assert_eq!(child.variables.get("name"), Some(&json!("ADA")));
    assert!(child.variables.get("customer").is_none());

    let item = h.work_item(child_pi, "child_work").await;
    h.manager
        .complete_work_item(child_pi, item, vars(&[("verdict", json!("approved"))]))
        .await
        .unwrap();

    let inst = h.instance(pi).await;
    assert_eq!(inst.variables.get("decision"), Some(&json!("approved")));
    assert_eq!(h.active_nodes(pi).await, vec!["after"]);
}

#[tokio::test]
async fn call_activity_without_waiting_completes_at_once() {
    let parent = ProcessBuilder::new("parent")
        .start("s")
        .call_activity_with("call", "child", false, false, vec![], vec![])
        .end("e")
        .chain(&["s", "call", "e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![parent, manual_child()]).await;

    let pi = h.manager.start_process("parent", Variables::new()).await.unwrap();
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    assert!(h.instance(pi).await.linked_children().is_empty());

    let child_pi = started_child(&h);
    let child = h.instance(child_pi).await;
    assert_eq!(child.status, ProcessStatus::Active);
    assert_eq!(child.parent, None);

    let item = h.work_item(child_pi, "child_work").await;
    h.manager
        .complete_work_item(child_pi, item, Variables::new())
        .await
        .unwrap();
    assert_eq!(h.instance(child_pi).await.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn aborting_the_parent_aborts_only_dependent_children() {
    for independent in [false, true] {
        let parent = ProcessBuilder::new("parent")
            .start("s")
            .call_activity_with("call", "child", true, independent, vec![], vec![])
            .end("e")
            .chain(&["s", "call", "e"])
            .build()
            .unwrap();
        let h = Harness::new(StrategyKind::PerProcessInstance, vec![parent, manual_child()]).await;
        let pi = h.manager.start_process("parent", Variables::new()).await.unwrap();
        let child_pi = started_child(&h);

        h.manager.abort_process(pi).await.unwrap();
        assert_eq!(h.instance(pi).await.status, ProcessStatus::Aborted);

        let child = h.instance(child_pi).await;
        if independent {
            assert_eq!(child.status, ProcessStatus::Active);
            assert_eq!(h.active_nodes(child_pi).await, vec!["child_work"]);
        } else {
            assert_eq!(child.status, ProcessStatus::Aborted);
            assert_eq!(child.outcome.as_ref().map(|o| o.code.as_str()), Some("ParentCancelled"));
        }
    }
}

// ─── Data mapping ─────────────────────────────────────────────

#[tokio::test]
async fn task_mappings_apply_named_transformations() {
    let def = ProcessBuilder::new("mapped")
        .start("s")
        .task_mapped(
            "review",
            "manual",
            vec![DataMapping::new("title", "heading").with_transform("upper")],
            vec![DataMapping::new("Verdict", "verdict").with_transform("lower")],
        )
        .task("hold", "manual")
        .end("e")
        .chain(&["s", "review", "hold", "e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h
        .manager
        .start_process("mapped", vars(&[("title", json!("Quarterly Report"))]))
        .await
        .unwrap();

    let inst = h.instance(pi).await;
    let item = inst.work_items().into_iter().next().cloned().expect("pending review");
    assert_eq!(item.parameters, vars(&[("heading", json!("QUARTERLY REPORT"))]));

    h.manager
        .complete_work_item(pi, item.id, vars(&[("Verdict", json!("APPROVED")), ("noise", json!(1))]))
        .await
        .unwrap();
    let inst = h.instance(pi).await;
    assert_eq!(inst.variables.get("verdict"), Some(&json!("approved")));
    assert!(inst.variables.get("noise").is_none());
    assert!(inst.variables.get("Verdict").is_none());
}

#[tokio::test]
async fn failing_transformation_raises_an_error() {
    let def = ProcessBuilder::new("mapped")
        .start("s")
        .task_mapped(
            "review",
            "manual",
            vec![DataMapping::new("title", "heading").with_transform("upper")],
            vec![],
        )
        .end("e")
        .chain(&["s", "review", "e"])
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;

    let err = h
        .manager
        .start_process("mapped", vars(&[("title", json!(42))]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionFailure { ref code, .. } if code == "TransformError"));
}

// ─── Loops ────────────────────────────────────────────────────

#[tokio::test]
async fn connection_back_to_an_earlier_task_repeats_it() {
    let def = ProcessBuilder::new("retry-loop")
        .start("s")
        .task("work", "manual")
        .gateway("check", GatewayType::Exclusive, GatewayDirection::Split)
        .end("e")
        .chain(&["s", "work", "check"])
        .connect_when("check", "work", "retry == true")
        .connect_default("check", "e")
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h.manager.start_process("retry-loop", Variables::new()).await.unwrap();

    let item = h.work_item(pi, "work").await;
    h.manager
        .complete_work_item(pi, item, vars(&[("retry", json!(true))]))
        .await
        .unwrap();
    assert_eq!(h.audit.count_entered("work"), 2);
    assert_eq!(h.active_nodes(pi).await, vec!["work"]);

    let again = h.work_item(pi, "work").await;
    assert_ne!(again, item);
    h.manager
        .complete_work_item(pi, again, vars(&[("retry", json!(false))]))
        .await
        .unwrap();
    assert_eq!(h.audit.count_entered("work"), 2);
    assert_eq!(h.audit.count_entered("e"), 1);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

// ─── Escalation ───────────────────────────────────────────────

fn with_escalation_handler() -> ProcessDefinition {
    ProcessBuilder::new("escalating")
        .start("s")
        .task("work", "manual")
        .end("e")
        .chain(&["s", "work", "e"])
        .event_sub_process("on_late")
        .enter("on_late")
        .triggered_start("late_start", TriggerDoc::Escalation(Some("LATE".into())), false)
        .task("notify", "manual")
        .end("late_end")
        .chain(&["late_start", "notify", "late_end"])
        .leave()
        .build()
        .unwrap()
}

#[tokio::test]
async fn non_interrupting_escalation_handler_runs_beside_the_work() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_escalation_handler()]).await;
    let pi = h.manager.start_process("escalating", Variables::new()).await.unwrap();

    let claimed = h
        .manager
        .signal_instance(pi, EventType::escalation("LATE"), None, None)
        .await
        .unwrap();
    assert_eq!(claimed, 1);
    assert_eq!(h.active_nodes(pi).await, vec!["notify", "on_late", "work"]);
    assert_eq!(h.audit.count_left("work", NodeInstanceStatus::Cancelled), 0);

    let item = h.work_item(pi, "notify").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.active_nodes(pi).await, vec!["work"]);

    let item = h.work_item(pi, "work").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn unclaimed_escalation_leaves_the_instance_running() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_escalation_handler()]).await;
    let pi = h.manager.start_process("escalating", Variables::new()).await.unwrap();

    let claimed = h
        .manager
        .signal_instance(pi, EventType::escalation("OTHER"), None, None)
        .await
        .unwrap();
    assert_eq!(claimed, 0);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Active);
    assert_eq!(h.active_nodes(pi).await, vec!["work"]);
}

// ─── Inclusive join ───────────────────────────────────────────

fn inclusive() -> ProcessDefinition {
    ProcessBuilder::new("inclusive")
        .start("s")
        .gateway("split", GatewayType::Inclusive, GatewayDirection::Split)
        .task("a", "manual")
        .task("b", "manual")
        .gateway("j", GatewayType::Inclusive, GatewayDirection::Join)
        .end("e")
        .connect("s", "split")
        .connect_when("split", "a", "x > 0")
        .connect_when("split", "b", "y > 0")
        .connect("a", "j")
        .connect("b", "j")
        .connect("j", "e")
        .build()
        .unwrap()
}

#[tokio::test]
async fn inclusive_join_waits_only_for_taken_branches() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![inclusive()]).await;
    let pi = h
        .manager
        .start_process("inclusive", vars(&[("x", json!(1)), ("y", json!(0))]))
        .await
        .unwrap();
    assert_eq!(h.active_nodes(pi).await, vec!["a"]);

    let item = h.work_item(pi, "a").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.audit.count_left("j", NodeInstanceStatus::Completed), 1);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn inclusive_join_waits_while_another_branch_can_still_arrive() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![inclusive()]).await;
    let pi = h
        .manager
        .start_process("inclusive", vars(&[("x", json!(1)), ("y", json!(1))]))
        .await
        .unwrap();
    assert_eq!(h.active_nodes(pi).await, vec!["a", "b"]);

    let item = h.work_item(pi, "a").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.audit.count_left("j", NodeInstanceStatus::Completed), 0);
    assert_eq!(h.audit.count_entered("e"), 0);

    let item = h.work_item(pi, "b").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.audit.count_left("j", NodeInstanceStatus::Completed), 1);
    assert_eq!(h.audit.count_entered("e"), 1);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

// ─── Terminate end ────────────────────────────────────────────

#[tokio::test]
async fn terminate_end_cancels_the_other_branches() {
    let def = ProcessBuilder::new("terminating")
        .start("s")
        .gateway("fork", GatewayType::Parallel, GatewayDirection::Split)
        .task("a", "manual")
        .terminate_end("stop")
        .end("e")
        .connect("s", "fork")
        .connect("fork", "a")
        .connect("fork", "stop")
        .connect("a", "e")
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;

    let pi = h.manager.start_process("terminating", Variables::new()).await.unwrap();
    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Completed);
    assert!(inst.node_instances.is_empty());
    assert_eq!(h.audit.count_left("a", NodeInstanceStatus::Cancelled), 1);
    assert_eq!(h.audit.count_entered("e"), 0);
}

// ─── Message correlation ──────────────────────────────────────

fn awaiting_payment() -> ProcessDefinition {
    ProcessBuilder::new("order")
        .start("s")
        .node(
            "wait",
            NodeSpec::Catch {
                trigger: TriggerDoc::Message("payment".into()),
                output_variable: Some("payment".into()),
                correlation_variable: Some("order_id".into()),
            },
        )
        .end("e")
        .chain(&["s", "wait", "e"])
        .build()
        .unwrap()
}

#[tokio::test]
async fn message_is_delivered_only_with_the_matching_correlation() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![awaiting_payment()]).await;
    let pi = h
        .manager
        .start_process("order", vars(&[("order_id", json!("A-1"))]))
        .await
        .unwrap();

    for correlation in [Some("B-2".to_string()), None] {
        let delivered = h
            .manager
            .signal_instance(pi, EventType::message("payment"), Some(json!({"amount": 10})), correlation)
            .await
            .unwrap();
        assert_eq!(delivered, 0);
    }
    assert_eq!(h.active_nodes(pi).await, vec!["wait"]);

    let delivered = h
        .manager
        .signal_instance(
            pi,
            EventType::message("payment"),
            Some(json!({"amount": 10})),
            Some("A-1".into()),
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);
    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Completed);
    assert_eq!(inst.variables.get("payment"), Some(&json!({"amount": 10})));
}

#[tokio::test]
async fn catch_without_its_correlation_variable_never_starts() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![awaiting_payment()]).await;

    let err = h.manager.start_process("order", Variables::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Definition { .. }));
    assert!(!h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::ProcessStarted { .. })));
}

// ─── Redeployment ─────────────────────────────────────────────

/// Definition source whose one deployment can be swapped underneath
/// running instances.
struct ReplaceableSource {
    current: RwLock<Arc<ProcessDefinition>>,
    revision: AtomicU64,
}

impl ReplaceableSource {
    fn new(definition: ProcessDefinition) -> Self {
        Self {
            current: RwLock::new(Arc::new(definition)),
            revision: AtomicU64::new(1),
        }
    }

    fn replace(&self, definition: ProcessDefinition) {
        *self.current.write().unwrap() = Arc::new(definition);
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl DefinitionSource for ReplaceableSource {
    fn get(&self, process_id: &str, version: Option<&str>) -> Option<Arc<ProcessDefinition>> {
        let def = self.current.read().unwrap().clone();
        (def.id == process_id && version.map_or(true, |v| v == def.version)).then_some(def)
    }

    fn all(&self) -> Vec<Arc<ProcessDefinition>> {
        vec![self.current.read().unwrap().clone()]
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn instance_on_a_replaced_definition_aborts_instead_of_panicking() {
    let original = ProcessBuilder::new("swapped")
        .start("s")
        .task("first", "manual")
        .task("second", "manual")
        .task("third", "manual")
        .end("e")
        .chain(&["s", "first", "second", "third", "e"])
        .build()
        .unwrap();
    let replacement = ProcessBuilder::new("swapped")
        .start("s")
        .end("e")
        .connect("s", "e")
        .build()
        .unwrap();
    assert_eq!(original.version, replacement.version);

    let source = Arc::new(ReplaceableSource::new(original));
    let env = RuntimeEnvironment::builder()
        .config(EngineConfig::with_strategy(StrategyKind::PerProcessInstance))
        .definitions(source.clone())
        .build();
    let manager = RuntimeManager::new(env).await.unwrap();

    let pi = manager.start_process("swapped", Variables::new()).await.unwrap();
    let inst = manager.process_instance(pi).await.unwrap();
    let item = inst.work_items()[0].id;

    source.replace(replacement);
    let err = manager
        .complete_work_item(pi, item, Variables::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Definition { .. }));

    let inst = manager.process_instance(pi).await.unwrap();
    assert_eq!(inst.status, ProcessStatus::Aborted);
    assert_eq!(inst.outcome.as_ref().map(|o| o.code.as_str()), Some("DefinitionError"));
}
