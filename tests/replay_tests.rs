//! Single-turn replay behaviour, driven directly through `run_turn`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;
use sagaflow::{Action, DurableOutput, ErrorDetails, Event, EventKind, OrchestrationContext, run_turn, run_turn_with_status};

const INST: &str = "inst";

fn ev(id: u64, source: Option<u64>, kind: EventKind) -> Event {
    Event::with_event_id(id, INST, 1, source, kind)
}

fn started() -> Event {
    ev(
        1,
        None,
        EventKind::OrchestrationStarted {
            name: "Orch".into(),
            version: "1.0.0".into(),
            input: String::new(),
            parent: None,
        },
    )
}

fn scheduled(id: u64, name: &str, input: &str) -> Event {
    ev(
        id,
        None,
        EventKind::ActivityScheduled {
            name: name.into(),
            input: input.into(),
            attempt: 1,
        },
    )
}

fn completed(id: u64, source: u64, result: &str) -> Event {
    ev(id, Some(source), EventKind::ActivityCompleted { result: result.into() })
}

async fn single_activity(ctx: OrchestrationContext) -> Result<String, String> {
    ctx.schedule_activity("A", "1").into_activity().await
}

#[test]
fn first_turn_records_schedule_and_action() {
    let out = run_turn(vec![started()], single_activity);
    assert!(out.output.is_none());
    assert_eq!(out.history.len(), 2);
    assert!(matches!(&out.history[1].kind, EventKind::ActivityScheduled { name, .. } if name == "A"));
    assert_eq!(
        out.actions,
        vec![Action::CallActivity {
            scheduling_event_id: 2,
            name: "A".into(),
            input: "1".into(),
            attempt: 1,
        }]
    );
}

#[test]
fn replay_with_completion_emits_no_new_actions() {
    let history = vec![started(), scheduled(2, "A", "1"), completed(3, 2, "2")];
    let out = run_turn(history, single_activity);
    assert_eq!(out.output, Some(Ok("2".to_string())));
    assert!(out.actions.is_empty());
    assert_eq!(out.history.len(), 3);
}

#[test]
fn activity_failure_surfaces_as_err() {
    let history = vec![
        started(),
        scheduled(2, "A", "1"),
        ev(
            3,
            Some(2),
            EventKind::ActivityFailed {
                details: ErrorDetails::activity_failed("card declined"),
                attempt: 1,
            },
        ),
    ];
    let out = run_turn(history, single_activity);
    assert_eq!(out.output, Some(Err("card declined".to_string())));
}

#[test]
fn swapped_activity_name_is_nondeterministic() {
    let history = vec![started(), scheduled(2, "B", "1")];
    let out = run_turn(history, single_activity);
    assert!(out.output.is_none());
    assert!(out.actions.is_empty());
    let msg = out.nondeterminism.expect("nondeterminism flagged");
    assert!(msg.contains("activity 'A'"), "{msg}");
}

#[test]
fn swapped_kind_is_nondeterministic() {
    let history = vec![started(), ev(2, None, EventKind::TimerCreated { fire_at_ms: 10 })];
    let out = run_turn(history, single_activity);
    assert!(out.nondeterminism.is_some());
}

async fn race(ctx: OrchestrationContext) -> usize {
    let a = ctx.schedule_activity("A", "1");
    let t = ctx.schedule_timer(Duration::from_millis(100));
    ctx.select2(a, t).await.0
}

#[test]
fn select2_picks_earliest_completion_in_history() {
    let timer_first = vec![
        started(),
        scheduled(2, "A", "1"),
        ev(3, None, EventKind::TimerCreated { fire_at_ms: 100 }),
        ev(4, Some(3), EventKind::TimerFired { fire_at_ms: 100 }),
        completed(5, 2, "late"),
    ];
    assert_eq!(run_turn(timer_first, race).output, Some(1));

    let activity_first = vec![
        started(),
        scheduled(2, "A", "1"),
        ev(3, None, EventKind::TimerCreated { fire_at_ms: 100 }),
        completed(4, 2, "early"),
        ev(5, Some(3), EventKind::TimerFired { fire_at_ms: 100 }),
    ];
    assert_eq!(run_turn(activity_first, race).output, Some(0));
}

#[test]
fn select_loser_completion_does_not_resolve_later_wait() {
    // After the timer wins, the late activity completion belongs to the
    // cancelled future and the next schedule is a fresh activity.
    let orch = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let t = ctx.schedule_timer(Duration::from_millis(100));
        let (idx, _) = ctx.select2(a, t).await;
        let next = ctx.schedule_activity("B", "2").into_activity().await;
        (idx, next)
    };
    let history = vec![
        started(),
        scheduled(2, "A", "1"),
        ev(3, None, EventKind::TimerCreated { fire_at_ms: 100 }),
        ev(4, Some(3), EventKind::TimerFired { fire_at_ms: 100 }),
        completed(5, 2, "late"),
    ];
    let out = run_turn(history, orch);
    assert!(out.output.is_none());
    assert!(matches!(&out.actions[..], [Action::CallActivity { name, scheduling_event_id: 6, .. }] if name == "B"));
}

async fn fan_in(ctx: OrchestrationContext) -> Vec<String> {
    let futures = (0..4).map(|i| ctx.schedule_activity("Echo", i.to_string())).collect();
    ctx.join(futures)
        .await
        .into_iter()
        .map(|o| o.into_result().unwrap_or_else(|e| e))
        .collect()
}

#[test]
fn join_returns_results_in_input_order() {
    let first = run_turn(vec![started()], fan_in);
    assert_eq!(first.actions.len(), 4);
    let mut history = first.history;
    // Complete in reverse order.
    for source in (2..=5).rev() {
        let id = history.len() as u64 + 1;
        history.push(completed(id, source, &format!("r{}", source - 2)));
    }
    let out = run_turn(history, fan_in);
    assert_eq!(out.output, Some(vec!["r0".into(), "r1".into(), "r2".into(), "r3".into()]));
    assert!(out.actions.is_empty());
}

async fn child_fan_in(ctx: OrchestrationContext) -> Result<Vec<String>, String> {
    let children = (0..3).map(|i| ctx.schedule_sub_orchestration("Child", i.to_string())).collect();
    ctx.wait_all(children).await.map_err(|e| e.to_string())
}

fn child_completed(id: u64, source: u64, result: &str) -> Event {
    ev(id, Some(source), EventKind::SubOrchestrationCompleted { result: result.into() })
}

#[test]
fn wait_all_over_children_keeps_input_order() {
    let first = run_turn(vec![started()], child_fan_in);
    let children: Vec<_> = first
        .history
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::SubOrchestrationScheduled { instance, .. } => Some((e.event_id, instance.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        children,
        vec![
            (2, "inst::sub::2".to_string()),
            (3, "inst::sub::3".to_string()),
            (4, "inst::sub::4".to_string()),
        ]
    );

    let mut history = first.history;
    for source in (2..=4).rev() {
        let id = history.len() as u64 + 1;
        history.push(child_completed(id, source, &format!("c{}", source - 2)));
    }
    let out = run_turn(history, child_fan_in);
    assert_eq!(out.output, Some(Ok(vec!["c0".into(), "c1".into(), "c2".into()])));
    assert!(out.actions.is_empty());
    assert!(out.nondeterminism.is_none());
}

#[test]
fn event_raised_before_wait_is_delivered() {
    let orch = |ctx: OrchestrationContext| async move { ctx.schedule_wait("Go").into_event().await };
    let history = vec![
        started(),
        ev(
            2,
            None,
            EventKind::ExternalEvent {
                name: "Go".into(),
                data: "early".into(),
            },
        ),
    ];
    let out = run_turn(history, orch);
    assert_eq!(out.output.as_deref(), Some("early"));
    assert!(matches!(&out.actions[..], [Action::WaitExternal { name, .. }] if name == "Go"));
}

#[test]
fn events_match_waits_positionally() {
    let orch = |ctx: OrchestrationContext| async move {
        let first = ctx.schedule_wait("Go").into_event().await;
        let second = ctx.schedule_wait("Go").into_event().await;
        format!("{first},{second}")
    };
    let raised = |id, data: &str| {
        ev(
            id,
            None,
            EventKind::ExternalEvent {
                name: "Go".into(),
                data: data.into(),
            },
        )
    };
    let history = vec![started(), raised(2, "one"), raised(3, "two")];
    let out = run_turn(history, orch);
    assert_eq!(out.output.as_deref(), Some("one,two"));
}

#[test]
fn wait_timeout_leaves_late_event_for_next_wait() {
    let orch = |ctx: OrchestrationContext| async move {
        let first = ctx.schedule_wait_with_timeout("Go", Duration::from_millis(10)).await;
        let second = ctx.schedule_wait("Go").into_event().await;
        (first.is_err(), second)
    };
    let history = vec![
        started(),
        ev(2, None, EventKind::ExternalSubscribed { name: "Go".into() }),
        ev(3, None, EventKind::TimerCreated { fire_at_ms: 10 }),
        ev(4, Some(3), EventKind::TimerFired { fire_at_ms: 10 }),
        ev(
            5,
            None,
            EventKind::ExternalEvent {
                name: "Go".into(),
                data: "late".into(),
            },
        ),
    ];
    let out = run_turn(history, orch);
    assert_eq!(out.output, Some((true, "late".to_string())));
}

#[test]
fn replay_flag_clears_after_new_completion() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let history = vec![started(), scheduled(2, "A", "1"), completed(3, 2, "x")];
    let record = Arc::clone(&seen);
    let out = run_turn_with_status(history, INST, 1, 2, move |ctx: OrchestrationContext| async move {
        record.lock().unwrap().push(ctx.is_replaying());
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        record.lock().unwrap().push(ctx.is_replaying());
    });
    assert_eq!(out.output, Some(()));
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[test]
fn replay_flag_stays_set_across_persisted_history() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let history = vec![started(), scheduled(2, "A", "1"), completed(3, 2, "x")];
    let record = Arc::clone(&seen);
    run_turn_with_status(history, INST, 1, 3, move |ctx: OrchestrationContext| async move {
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        record.lock().unwrap().push(ctx.is_replaying());
        let _ = ctx.schedule_activity("B", "2").into_activity().await;
    });
    assert_eq!(*seen.lock().unwrap(), vec![true]);
}

#[test]
fn logical_clock_follows_consumed_completions() {
    let mut s = started();
    s.timestamp_ms = 1_000;
    let mut done = completed(3, 2, "x");
    done.timestamp_ms = 5_000;
    let history = vec![s, scheduled(2, "A", "1"), done];
    let out = run_turn(history, |ctx: OrchestrationContext| async move {
        let before = ctx.utc_now_ms();
        let _ = ctx.schedule_activity("A", "1").into_activity().await;
        (before, ctx.utc_now_ms())
    });
    assert_eq!(out.output, Some((1_000, 5_000)));
}

#[test]
fn timer_fire_time_uses_logical_clock() {
    let mut s = started();
    s.timestamp_ms = 2_000;
    let out = run_turn(vec![s], |ctx: OrchestrationContext| async move {
        ctx.schedule_timer(Duration::from_millis(250)).into_timer().await;
    });
    assert_eq!(
        out.actions,
        vec![Action::CreateTimer {
            scheduling_event_id: 2,
            fire_at_ms: 2_250,
        }]
    );
}

#[test]
fn child_instance_id_derives_from_parent_and_event_id() {
    let out = run_turn(vec![started()], |ctx: OrchestrationContext| async move {
        ctx.schedule_sub_orchestration("Child", "in").into_sub_orchestration().await
    });
    assert!(matches!(
        &out.actions[..],
        [Action::StartSubOrchestration { instance, scheduling_event_id: 2, .. }] if instance == "inst::sub::2"
    ));
}

#[test]
fn continue_as_new_records_action() {
    let out = run_turn(vec![started()], |ctx: OrchestrationContext| async move {
        ctx.continue_as_new("next").await
    });
    assert!(out.output.is_none());
    assert_eq!(
        out.actions,
        vec![Action::ContinueAsNew {
            input: "next".into(),
            version: None,
        }]
    );
}

#[test]
fn wait_all_reports_every_position() {
    let orch = |ctx: OrchestrationContext| async move {
        let a = ctx.schedule_activity("A", "1");
        let b = ctx.schedule_activity("B", "2");
        ctx.wait_all(vec![a, b]).await
    };
    let history = vec![
        started(),
        scheduled(2, "A", "1"),
        scheduled(3, "B", "2"),
        ev(
            4,
            Some(3),
            EventKind::ActivityFailed {
                details: ErrorDetails::activity_failed("boom"),
                attempt: 1,
            },
        ),
        completed(5, 2, "ok"),
    ];
    let failure = run_turn(history, orch).output.expect("resolved").unwrap_err();
    assert_eq!(failure.results, vec![Ok("ok".to_string()), Err("boom".to_string())]);
    assert_eq!(failure.failures(), vec![(1, "boom".to_string())]);
    assert_eq!(failure.successes(), vec![(0, "ok".to_string())]);
    assert_eq!(failure.to_string(), "1 of 2 tasks failed");
}

#[test]
fn durable_output_flattening() {
    assert_eq!(DurableOutput::Timer.into_result(), Ok(String::new()));
    assert_eq!(DurableOutput::External("x".into()).into_result(), Ok("x".into()));
    assert_eq!(DurableOutput::Activity(Err("e".into())).into_result(), Err("e".into()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Completion arrival order never changes the joined output, and the
    /// final history replays without new work.
    #[test]
    fn join_output_independent_of_completion_order(order in Just(vec![0u64, 1, 2, 3]).prop_shuffle()) {
        let first = run_turn(vec![started()], fan_in);
        let mut history = first.history;
        for idx in &order {
            let id = history.len() as u64 + 1;
            history.push(completed(id, idx + 2, &format!("r{idx}")));
        }
        let out = run_turn(history.clone(), fan_in);
        prop_assert_eq!(out.output, Some(vec!["r0".to_string(), "r1".into(), "r2".into(), "r3".into()]));
        prop_assert!(out.actions.is_empty());
        prop_assert_eq!(out.history.len(), history.len());
        prop_assert!(out.nondeterminism.is_none());
    }

    /// Children finishing in any order still fill `wait_all` by position.
    #[test]
    fn child_wait_all_independent_of_completion_order(order in Just(vec![0u64, 1, 2]).prop_shuffle()) {
        let mut history = run_turn(vec![started()], child_fan_in).history;
        for idx in &order {
            let id = history.len() as u64 + 1;
            history.push(child_completed(id, idx + 2, &format!("c{idx}")));
        }
        let out = run_turn(history, child_fan_in);
        prop_assert_eq!(out.output, Some(Ok(vec!["c0".to_string(), "c1".into(), "c2".into()])));
        prop_assert!(out.actions.is_empty());
    }

    /// Replaying the same history twice yields identical outputs and actions.
    #[test]
    fn replay_is_deterministic(completed_prefix in 0usize..=4) {
        let first = run_turn(vec![started()], fan_in);
        let mut history = first.history;
        for source in 2..(2 + completed_prefix as u64) {
            let id = history.len() as u64 + 1;
            history.push(completed(id, source, "v"));
        }
        let a = run_turn(history.clone(), fan_in);
        let b = run_turn(history, fan_in);
        prop_assert_eq!(a.output, b.output);
        prop_assert_eq!(a.actions, b.actions);
    }
}
