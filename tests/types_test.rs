mod common;

use proptest::prelude::*;

use orc::types::{
    is_valid_task_id, parse_gate_type, parse_phase_status, parse_priority, parse_task_status,
    parse_weight, GateType, PhaseStatus, Priority, Task, TaskStatus, Weight,
};

use common::make_task;

const ALL_STATUSES: [TaskStatus; 10] = [
    TaskStatus::Created,
    TaskStatus::Classifying,
    TaskStatus::Planned,
    TaskStatus::Running,
    TaskStatus::Paused,
    TaskStatus::Blocked,
    TaskStatus::Finalizing,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Resolved,
];

fn any_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(ALL_STATUSES.to_vec())
}

proptest! {
    /// Every transition the mutator accepts is in the status machine, and
    /// every rejected one is outside it. Rejections leave the task intact.
    #[test]
    fn transition_status_matches_machine(from in any_status(), to in any_status()) {
        let mut task = make_task("TASK-001", from);
        let result = task.transition_status(to, false);
        prop_assert_eq!(result.is_ok(), from.is_valid_transition(&to));
        if result.is_ok() {
            prop_assert_eq!(task.status, to);
        } else {
            prop_assert_eq!(task.status, from);
        }
    }

    /// Forced transitions always apply (operator resolve path).
    #[test]
    fn forced_transition_always_applies(from in any_status(), to in any_status()) {
        let mut task = make_task("TASK-001", from);
        prop_assert!(task.transition_status(to, true).is_ok());
        prop_assert_eq!(task.status, to);
    }

    /// Status strings round-trip through the parser.
    #[test]
    fn status_parse_roundtrip(status in any_status()) {
        prop_assert_eq!(parse_task_status(status.as_str()).unwrap(), status);
    }
}

#[test]
fn weight_parse_roundtrip() {
    for weight in [
        Weight::Trivial,
        Weight::Small,
        Weight::Medium,
        Weight::Large,
        Weight::Greenfield,
    ] {
        assert_eq!(parse_weight(weight.as_str()).unwrap(), weight);
    }
}

#[test]
fn priority_parse_roundtrip() {
    for priority in [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ] {
        assert_eq!(parse_priority(priority.as_str()).unwrap(), priority);
    }
}

#[test]
fn gate_parse_roundtrip() {
    for gate in [GateType::Auto, GateType::Human, GateType::Ai, GateType::Skip] {
        assert_eq!(parse_gate_type(gate.as_str()).unwrap(), gate);
    }
}

#[test]
fn phase_status_parse_roundtrip() {
    for status in [
        PhaseStatus::Pending,
        PhaseStatus::Running,
        PhaseStatus::Completed,
        PhaseStatus::Skipped,
        PhaseStatus::Failed,
        PhaseStatus::Blocked,
    ] {
        assert_eq!(parse_phase_status(status.as_str()).unwrap(), status);
    }
}

#[test]
fn task_json_roundtrip_is_structurally_identical() {
    let mut task = make_task("TASK-042", TaskStatus::Blocked);
    task.weight = Weight::Greenfield;
    task.priority = Priority::High;
    task.blocked_by = vec!["TASK-001".to_string(), "TASK-002".to_string()];
    task.related_to = vec!["TASK-003".to_string()];
    task.initiative_id = Some("INIT-001".to_string());
    task.branch_name = Some("feature/custom".to_string());
    task.inline_spec = Some("do the thing".to_string());
    task.metadata
        .insert("pending_gate".to_string(), "review".to_string());
    task.execution.current_phase = Some("review".to_string());
    let mut state = orc::types::PhaseState::new("spec");
    state.status = PhaseStatus::Completed;
    state.commit_sha = Some("abc123".to_string());
    state.iterations = 2;
    state.notes = Some("spec written".to_string());
    task.execution.phases.insert("spec".to_string(), state);
    task.execution.retries_used = 1;

    let json = serde_json::to_string(&task).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();
    assert_eq!(back, task);
}

#[test]
fn historical_status_strings_still_parse() {
    assert_eq!(parse_task_status("new").unwrap(), TaskStatus::Created);
    assert_eq!(parse_task_status("scoping").unwrap(), TaskStatus::Classifying);
    assert_eq!(parse_task_status("ready").unwrap(), TaskStatus::Planned);
    assert_eq!(parse_task_status("in_progress").unwrap(), TaskStatus::Running);
    assert_eq!(parse_task_status("done").unwrap(), TaskStatus::Completed);
}

#[test]
fn task_id_format() {
    assert!(is_valid_task_id("TASK-001"));
    assert!(is_valid_task_id("ORC-9999"));
    assert!(!is_valid_task_id("task 1"));
    assert!(!is_valid_task_id("TASK_001"));
}
