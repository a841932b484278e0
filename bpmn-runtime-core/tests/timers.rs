mod common;

use bpmn_runtime_core::definition::TriggerDoc;
use bpmn_runtime_core::{
    AuditEvent, NodeInstanceStatus, ProcessBuilder, ProcessDefinition, ProcessStatus, StrategyKind, TimerDriver,
    Variables,
};
use common::Harness;
use std::sync::Arc;
use std::time::Duration;

fn with_timeout(spec: &str, cancel: bool) -> ProcessDefinition {
    ProcessBuilder::new("timed")
        .start("s")
        .task("work", "manual")
        .boundary("timeout", "work", TriggerDoc::Timer(spec.into()), cancel)
        .end("done")
        .end("timed_out")
        .chain(&["s", "work", "done"])
        .connect("timeout", "timed_out")
        .build()
        .unwrap()
}

#[tokio::test]
async fn interrupting_timer_cancels_the_task() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_timeout("PT10S", true)]).await;
    let pi = h.manager.start_process("timed", Variables::new()).await.unwrap();
    assert_eq!(h.env.timers.next_deadline(), Some(common::T0 + 10_000));

    assert_eq!(h.advance(9_999).await, 0);
    assert_eq!(h.active_nodes(pi).await, vec!["work"]);

    assert_eq!(h.advance(1).await, 1);
    assert_eq!(h.audit.count_left("work", NodeInstanceStatus::Cancelled), 1);
    assert_eq!(h.audit.count_entered("timeout"), 1);
    assert_eq!(h.audit.count_entered("done"), 0);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    assert_eq!(h.env.timers.pending_for(pi), 0);
}

#[tokio::test]
async fn completing_the_task_first_disarms_the_timer() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_timeout("PT10S", true)]).await;
    let pi = h.manager.start_process("timed", Variables::new()).await.unwrap();

    let item = h.work_item(pi, "work").await;
    h.manager.complete_work_item(pi, item, Variables::new()).await.unwrap();
    assert_eq!(h.env.timers.pending_for(pi), 0);

    assert_eq!(h.advance(10_000).await, 0);
    assert_eq!(h.audit.count_entered("timeout"), 0);
    assert!(!h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::TimerFired { .. })));
}

#[tokio::test]
async fn cycle_timer_fires_its_repeat_count_then_stops() {
    let def = ProcessBuilder::new("ticking")
        .start("s")
        .task("work", "manual")
        .boundary("tick", "work", TriggerDoc::Timer("R3/PT1S".into()), false)
        .end("done")
        .end("tick_done")
        .chain(&["s", "work", "done"])
        .connect("tick", "tick_done")
        .build()
        .unwrap();
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![def]).await;
    let pi = h.manager.start_process("ticking", Variables::new()).await.unwrap();

    let mut fired = 0;
    for _ in 0..4 {
        fired += h.advance(1_000).await;
    }
    assert_eq!(fired, 3);
    assert_eq!(h.audit.count_entered("tick"), 3);

    let inst = h.instance(pi).await;
    assert_eq!(inst.status, ProcessStatus::Active);
    assert!(inst.timers.is_empty());
    assert_eq!(h.active_nodes(pi).await, vec!["work"]);
    assert_eq!(h.env.timers.pending_for(pi), 0);
}

#[tokio::test]
async fn per_request_timers_reach_the_instance() {
    let h = Harness::new(StrategyKind::PerRequest, vec![with_timeout("PT1M", true)]).await;
    let pi = h.manager.start_process("timed", Variables::new()).await.unwrap();

    assert_eq!(h.advance(60_000).await, 1);
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn driver_delivers_due_timers_until_shutdown() {
    let h = Harness::new(StrategyKind::Singleton, vec![with_timeout("PT10S", true)]).await;
    let manager = Arc::new(h.manager);
    let pi = manager.start_process("timed", Variables::new()).await.unwrap();
    h.clock.advance(10_000);

    let (shutdown_tx, handle) = TimerDriver::new(manager.clone()).spawn();

    let mut status = ProcessStatus::Active;
    for _ in 0..200 {
        status = manager.process_instance(pi).await.unwrap().status;
        if status == ProcessStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, ProcessStatus::Completed);
    assert_eq!(h.audit.count_entered("timed_out"), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn timer_rebuilds_a_disposed_session() {
    let h = Harness::new(StrategyKind::PerProcessInstance, vec![with_timeout("PT10S", true)]).await;
    let pi = h.manager.start_process("timed", Variables::new()).await.unwrap();

    let key = bpmn_runtime_core::ContextKey::ProcessInstance(pi);
    let session = h.manager.bind(&key).await.unwrap();
    h.manager.dispose(&session).await.unwrap();
    assert_eq!(h.env.timers.pending_for(pi), 1);

    assert_eq!(h.advance(10_000).await, 1);
    assert!(session.is_disposed());
    assert_eq!(h.instance(pi).await.status, ProcessStatus::Completed);
    assert_eq!(h.audit.count_entered("timed_out"), 1);
}
