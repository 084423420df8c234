//! Property-based tests and fuzz deserialization tests using proptest.
//!
//! Property tests drive the registry with arbitrary sequences of control
//! and run operations and check that every observed state sequence is a
//! walk of the state machine, that progress never decreases, and that an
//! owner never holds two live tasks. Fuzz tests verify that stored values
//! decode without panicking whatever bytes the store hands back.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use xfer_tasks::{
    ActiveSlot, InMemoryStateStore, TaskError, TaskKind, TaskRecord, TaskRegistry, TaskState,
};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_task_state() -> impl Strategy<Value = TaskState> {
    prop::sample::select(TaskState::ALL.to_vec())
}

fn arb_task_kind() -> impl Strategy<Value = TaskKind> {
    prop::sample::select(vec![TaskKind::Upload, TaskKind::Download, TaskKind::Delete])
}

/// One call a user or an executor may make against a task.
#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Pause,
    Resume,
    Abort,
    Progress,
    Complete,
    Release,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop::sample::select(vec![
        Op::Start,
        Op::Pause,
        Op::Resume,
        Op::Abort,
        Op::Progress,
        Op::Complete,
        Op::Release,
    ])
}

fn registry() -> TaskRegistry {
    TaskRegistry::new(Arc::new(InMemoryStateStore::in_memory()))
}

// ─── Property Tests: State Machine Invariants ───────────────────────────────

proptest! {
    /// Terminal states reject all transitions.
    #[test]
    fn terminal_states_reject_all_transitions(
        from in prop::sample::select(vec![
            TaskState::Aborted,
            TaskState::Completed,
            TaskState::Expired,
        ]),
        to in arb_task_state(),
    ) {
        prop_assert!(!from.can_transition_to(&to));
    }

    /// No state can transition to itself.
    #[test]
    fn no_self_transitions(state in arb_task_state()) {
        prop_assert!(!state.can_transition_to(&state));
    }

    /// is_terminal() holds iff no edge leaves the state.
    #[test]
    fn is_terminal_iff_no_valid_transitions(state in arb_task_state()) {
        let has_any_transition = TaskState::ALL.iter().any(|t| state.can_transition_to(t));
        prop_assert_eq!(state.is_terminal(), !has_any_transition);
    }

    /// validate_transition agrees with can_transition_to.
    #[test]
    fn validate_agrees_with_can_transition(from in arb_task_state(), to in arb_task_state()) {
        prop_assert_eq!(from.validate_transition("t", &to).is_ok(), from.can_transition_to(&to));
    }
}

// ─── Property Tests: Registry Walks ─────────────────────────────────────────

proptest! {
    /// Whatever sequence of calls is made, every state the registry reports
    /// is reachable from the previous one, and progress never decreases.
    #[test]
    fn prop_registry_walks_are_valid(ops in proptest::collection::vec(arb_op(), 0..24)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let registry = registry();
            let task = registry.create_task("prop-owner", TaskKind::Upload).await.unwrap();
            let task_id = task.task_id.clone();

            let mut state = TaskState::Created;
            let mut progress = 0u64;

            for op in ops {
                let result = match op {
                    Op::Start => registry.start(&task_id, "prop-owner", TaskKind::Upload, "run").await,
                    Op::Pause => registry.pause(&task_id, "prop-owner").await,
                    Op::Resume => registry.resume(&task_id, "prop-owner").await,
                    Op::Abort => registry.abort(&task_id, "prop-owner").await,
                    Op::Progress => registry.record_progress(&task_id, "run", progress + 1).await,
                    Op::Complete => registry.complete(&task_id, "run").await,
                    Op::Release => {
                        registry.release_run(&task_id, "run").await.unwrap();
                        registry.get(&task_id, "prop-owner").await
                    },
                };

                match result {
                    Ok(record) => {
                        prop_assert!(
                            record.state == state || state.can_transition_to(&record.state),
                            "{op:?}: {state} -> {} is not an edge", record.state
                        );
                        prop_assert!(record.progress >= progress);
                        state = record.state;
                        progress = record.progress;
                    },
                    Err(
                        TaskError::InvalidTransition { .. } | TaskError::AlreadyAssigned { .. },
                    ) => {},
                    Err(other) => prop_assert!(false, "{op:?}: unexpected error {other}"),
                }
            }

            let final_record = registry.get(&task_id, "prop-owner").await.unwrap();
            prop_assert_eq!(final_record.state, state);
            prop_assert_eq!(final_record.progress, progress);

            Ok(())
        })?;
    }

    /// Creating tasks while settling some of them never leaves an owner with
    /// more than one live task.
    #[test]
    fn prop_owner_has_at_most_one_live_task(
        steps in proptest::collection::vec((arb_task_kind(), any::<bool>()), 1..16)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let registry = registry();
            let mut live: Option<String> = None;

            for (kind, settle) in steps {
                match registry.create_task("prop-owner", kind).await {
                    Ok(record) => {
                        prop_assert!(live.is_none(), "second live task created");
                        live = Some(record.task_id);
                    },
                    Err(TaskError::AlreadyActive { active_task_id, .. }) => {
                        prop_assert_eq!(Some(&active_task_id), live.as_ref());
                    },
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }

                if settle {
                    if let Some(task_id) = live.take() {
                        registry.abort(&task_id, "prop-owner").await.unwrap();
                    }
                }
            }

            Ok(())
        })?;
    }

    /// Creating N tasks for distinct owners always produces unique task IDs.
    #[test]
    fn prop_task_ids_always_unique(n in 1usize..50) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let registry = registry();
            let mut ids = HashSet::new();

            for i in 0..n {
                let record = registry
                    .create_task(&format!("owner-{i}"), TaskKind::Delete)
                    .await
                    .unwrap();
                prop_assert!(ids.insert(record.task_id), "duplicate task ID");
            }

            Ok(())
        })?;
    }
}

// ─── Property Tests: TaskRecord ─────────────────────────────────────────────

proptest! {
    /// A freshly created record is never expired, whatever its TTL. TTLs
    /// that overflow date arithmetic mean "never expires".
    #[test]
    fn fresh_task_record_is_not_expired(secs in 1u64..=u64::MAX) {
        let record = TaskRecord::new(
            "owner".to_string(),
            TaskKind::Upload,
            std::time::Duration::from_secs(secs),
        );
        prop_assert!(!record.is_expired());
    }
}

// ─── Fuzz Deserialization ───────────────────────────────────────────────────

proptest! {
    /// Deserializing arbitrary strings as TaskState must not panic.
    #[test]
    fn fuzz_task_state_deserialization(s in "\\PC*") {
        let json_str = format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        );
        let _ = serde_json::from_str::<TaskState>(&json_str);
    }

    /// Deserializing arbitrary bytes as TaskRecord must not panic.
    #[test]
    fn fuzz_task_record_deserialization_from_bytes(
        bytes in proptest::collection::vec(any::<u8>(), 0..1024)
    ) {
        let _ = serde_json::from_slice::<TaskRecord>(&bytes);
    }

    /// Deserializing arbitrary strings as ActiveSlot must not panic.
    #[test]
    fn fuzz_active_slot_deserialization(s in "\\PC{0,256}") {
        let _ = serde_json::from_str::<ActiveSlot>(&s);
    }
}
