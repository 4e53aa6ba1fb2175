use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::OrcError;
use crate::types::{Task, TaskStatus};

// --- Metadata keys ---

/// Phase id a human gate is waiting on. Cleared by approval.
pub const META_PENDING_GATE: &str = "pending_gate";
/// Reason a finalize-time sync conflict blocked the task. Cleared by unblock.
pub const META_BLOCKED_ERROR: &str = "blocked_error";
/// URL of the PR opened by finalize.
pub const META_PR_URL: &str = "pr_url";

/// True iff the task may be claimed and dispatched.
///
/// A task can run when its status is planned/paused/blocked (failed only
/// with an explicit resume) and every id in `blocked_by` refers to a task
/// whose status is terminal (completed or resolved). A blocker id absent
/// from `all` refers to a deleted task and is treated as satisfied.
///
/// A blocked task stays unrunnable while it waits on a human gate approval
/// or an unresolved sync conflict; both are recorded in metadata and
/// cleared by the operator commands that resolve them.
pub fn can_run(task: &Task, all: &[Task], explicit_resume: bool) -> bool {
    let status_ok = match task.status {
        TaskStatus::Planned | TaskStatus::Paused => true,
        TaskStatus::Blocked => {
            !task.metadata.contains_key(META_PENDING_GATE)
                && !task.metadata.contains_key(META_BLOCKED_ERROR)
        }
        TaskStatus::Failed => explicit_resume,
        _ => false,
    };
    if !status_ok {
        return false;
    }

    task.blocked_by.iter().all(|dep_id| {
        match all.iter().find(|t| t.id == *dep_id) {
            Some(dep) => dep.status.is_terminal(),
            None => true, // deleted blocker = satisfied
        }
    })
}

/// Build a comma-separated summary of unmet blockers for a task.
///
/// Each unmet blocker is formatted as `"dep_id (status)"`. Returns `None`
/// when every blocker is satisfied.
pub fn unmet_blocker_summary(task: &Task, all: &[Task]) -> Option<String> {
    if task.blocked_by.is_empty() {
        return None;
    }
    let unmet: Vec<String> = task
        .blocked_by
        .iter()
        .filter_map(|dep_id| match all.iter().find(|t| t.id == *dep_id) {
            Some(dep) if !dep.status.is_terminal() => {
                Some(format!("{} ({})", dep_id, dep.status))
            }
            _ => None,
        })
        .collect();
    if unmet.is_empty() {
        None
    } else {
        Some(unmet.join(", "))
    }
}

/// Compute the inverse of `blocked_by` across a task set: for each task id,
/// the ids of tasks it blocks, in `TaskId` order.
pub fn blocks_index(all: &[Task]) -> BTreeMap<String, Vec<String>> {
    let mut index: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for task in all {
        for dep in &task.blocked_by {
            index.entry(dep.clone()).or_default().push(task.id.clone());
        }
    }
    for blocked in index.values_mut() {
        blocked.sort();
    }
    index
}

/// Check whether adding `new_blockers` to `task_id` would create a cycle.
///
/// DFS from each candidate blocker through the existing `blocked_by` graph;
/// reaching `task_id` means the edit closes a cycle. Returns the cycle path
/// (`[task_id, blocker, ..., task_id]`) for diagnostics.
pub fn detect_cycle(
    task_id: &str,
    new_blockers: &[String],
    all: &[Task],
) -> Result<(), OrcError> {
    let graph: HashMap<&str, &[String]> = all
        .iter()
        .map(|t| (t.id.as_str(), t.blocked_by.as_slice()))
        .collect();

    for start in new_blockers {
        if start == task_id {
            return Err(OrcError::InvalidInput(format!(
                "Dependency cycle: [{} -> {}]",
                task_id, task_id
            )));
        }
        let mut visited: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = vec![task_id, start.as_str()];
        if dfs_reaches(start.as_str(), task_id, &graph, &mut visited, &mut path) {
            return Err(OrcError::InvalidInput(format!(
                "Dependency cycle: [{}]",
                path.join(" -> ")
            )));
        }
    }
    Ok(())
}

fn dfs_reaches<'a>(
    current: &'a str,
    target: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    if !visited.insert(current) {
        return false;
    }
    let Some(deps) = graph.get(current) else {
        return false;
    };
    for dep in deps.iter() {
        if dep == target {
            path.push(target);
            return true;
        }
        path.push(dep.as_str());
        if dfs_reaches(dep.as_str(), target, graph, visited, path) {
            return true;
        }
        path.pop();
    }
    false
}

/// Validate and apply a blocker edit: cycle check, then replace the list.
///
/// Rejected while the task is mid-execution.
pub fn set_blocked_by(task: &mut Task, blockers: Vec<String>, all: &[Task]) -> Result<(), OrcError> {
    reject_if_executing(task)?;
    detect_cycle(&task.id, &blockers, all)?;
    task.blocked_by = blockers;
    Ok(())
}

/// Apply a weight change: resets execution state back to a clean plan.
///
/// Clears `current_phase`, `current_iteration`, all phase states, the last
/// error, and retry context; preserves `blocked_by`, `related_to`, and the
/// initiative link; sets status to `planned`.
pub fn change_weight(task: &mut Task, weight: crate::types::Weight) -> Result<(), OrcError> {
    reject_if_executing(task)?;
    task.weight = weight;
    task.execution = crate::types::ExecutionState::default();
    task.transition_status(TaskStatus::Planned, false)
}

/// Administrative edits are rejected while a task is running or finalizing;
/// only the claim holder mutates a task in those states.
pub fn reject_if_executing(task: &Task) -> Result<(), OrcError> {
    if matches!(task.status, TaskStatus::Running | TaskStatus::Finalizing) {
        return Err(OrcError::InvalidTransition {
            from: task.status,
            to: task.status,
        });
    }
    Ok(())
}

/// Partition phase states into those the workflow still declares and
/// orphans left behind by an earlier workflow. Orphans are ignored for
/// scheduling but surfaced in display.
pub fn orphan_phases<'a>(
    task: &'a Task,
    workflow: &crate::types::Workflow,
) -> Vec<&'a crate::types::PhaseState> {
    task.execution
        .phases
        .values()
        .filter(|ps| workflow.phase(&ps.phase).is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PhaseTemplate, Weight, Workflow};

    fn make_task(id: &str, status: TaskStatus) -> Task {
        let mut t = Task::new(id, &format!("Test {}", id));
        t.status = status;
        t
    }

    #[test]
    fn can_run_requires_runnable_status() {
        let all = vec![];
        assert!(can_run(&make_task("TASK-001", TaskStatus::Planned), &all, false));
        assert!(can_run(&make_task("TASK-001", TaskStatus::Paused), &all, false));
        assert!(can_run(&make_task("TASK-001", TaskStatus::Blocked), &all, false));
        assert!(!can_run(&make_task("TASK-001", TaskStatus::Failed), &all, false));
        assert!(can_run(&make_task("TASK-001", TaskStatus::Failed), &all, true));
        assert!(!can_run(&make_task("TASK-001", TaskStatus::Running), &all, false));
        assert!(!can_run(&make_task("TASK-001", TaskStatus::Completed), &all, true));
    }

    #[test]
    fn blocked_task_waits_on_pending_gate_and_conflict() {
        let all = vec![];
        let mut gated = make_task("TASK-001", TaskStatus::Blocked);
        gated
            .metadata
            .insert(META_PENDING_GATE.to_string(), "review".to_string());
        assert!(!can_run(&gated, &all, false));

        gated.metadata.remove(META_PENDING_GATE);
        assert!(can_run(&gated, &all, false));

        gated.metadata.insert(
            META_BLOCKED_ERROR.to_string(),
            "Sync conflict with target branch [a.txt]".to_string(),
        );
        assert!(!can_run(&gated, &all, false));
    }

    #[test]
    fn can_run_gates_on_blockers() {
        let mut t = make_task("TASK-002", TaskStatus::Planned);
        t.blocked_by = vec!["TASK-001".to_string()];

        let blocker_running = make_task("TASK-001", TaskStatus::Running);
        assert!(!can_run(&t, std::slice::from_ref(&blocker_running), false));

        let blocker_done = make_task("TASK-001", TaskStatus::Completed);
        assert!(can_run(&t, std::slice::from_ref(&blocker_done), false));

        let blocker_resolved = make_task("TASK-001", TaskStatus::Resolved);
        assert!(can_run(&t, std::slice::from_ref(&blocker_resolved), false));

        // Deleted blocker counts as satisfied
        assert!(can_run(&t, &[], false));
    }

    #[test]
    fn blocks_is_inverse_of_blocked_by() {
        let mut b = make_task("TASK-002", TaskStatus::Planned);
        b.blocked_by = vec!["TASK-001".to_string()];
        let mut c = make_task("TASK-003", TaskStatus::Planned);
        c.blocked_by = vec!["TASK-001".to_string(), "TASK-002".to_string()];
        let all = vec![make_task("TASK-001", TaskStatus::Planned), b, c];

        let index = blocks_index(&all);
        assert_eq!(
            index.get("TASK-001").unwrap(),
            &vec!["TASK-002".to_string(), "TASK-003".to_string()]
        );
        assert_eq!(index.get("TASK-002").unwrap(), &vec!["TASK-003".to_string()]);
        assert!(index.get("TASK-003").is_none());
    }

    #[test]
    fn detect_cycle_reports_path() {
        // A <- B <- C, then C into A's blockers closes the loop
        let a = make_task("TASK-A", TaskStatus::Planned);
        let mut b = make_task("TASK-B", TaskStatus::Planned);
        b.blocked_by = vec!["TASK-A".to_string()];
        let mut c = make_task("TASK-C", TaskStatus::Planned);
        c.blocked_by = vec!["TASK-B".to_string()];
        let all = vec![a, b, c];

        let err = detect_cycle("TASK-A", &["TASK-C".to_string()], &all).unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("TASK-A -> TASK-C -> TASK-B -> TASK-A"),
            "unexpected cycle path: {}",
            msg
        );
    }

    #[test]
    fn detect_cycle_allows_diamond() {
        // B and C both depend on A; D depending on both is a diamond, not a cycle
        let a = make_task("TASK-A", TaskStatus::Planned);
        let mut b = make_task("TASK-B", TaskStatus::Planned);
        b.blocked_by = vec!["TASK-A".to_string()];
        let mut c = make_task("TASK-C", TaskStatus::Planned);
        c.blocked_by = vec!["TASK-A".to_string()];
        let all = vec![a, b, c];

        assert!(detect_cycle(
            "TASK-D",
            &["TASK-B".to_string(), "TASK-C".to_string()],
            &all
        )
        .is_ok());
    }

    #[test]
    fn self_dependency_rejected() {
        let all = vec![make_task("TASK-A", TaskStatus::Planned)];
        assert!(detect_cycle("TASK-A", &["TASK-A".to_string()], &all).is_err());
    }

    #[test]
    fn weight_change_resets_execution_preserves_links() {
        let mut t = make_task("TASK-001", TaskStatus::Failed);
        t.blocked_by = vec!["TASK-000".to_string()];
        t.related_to = vec!["TASK-002".to_string()];
        t.initiative_id = Some("INIT-001".to_string());
        t.execution.current_phase = Some("implement".to_string());
        t.execution.current_iteration = 2;
        t.execution.error = Some("boom".to_string());
        t.execution.phases.insert(
            "spec".to_string(),
            crate::types::PhaseState::new("spec"),
        );

        change_weight(&mut t, Weight::Large).unwrap();

        assert_eq!(t.weight, Weight::Large);
        assert_eq!(t.status, TaskStatus::Planned);
        assert!(t.execution.current_phase.is_none());
        assert_eq!(t.execution.current_iteration, 0);
        assert!(t.execution.phases.is_empty());
        assert!(t.execution.error.is_none());
        assert!(t.execution.retry_context.is_none());
        assert_eq!(t.blocked_by, vec!["TASK-000".to_string()]);
        assert_eq!(t.related_to, vec!["TASK-002".to_string()]);
        assert_eq!(t.initiative_id.as_deref(), Some("INIT-001"));
    }

    #[test]
    fn edits_rejected_while_executing() {
        let mut t = make_task("TASK-001", TaskStatus::Running);
        let err = change_weight(&mut t, Weight::Small).unwrap_err();
        assert!(matches!(err, OrcError::InvalidTransition { .. }));

        let err = set_blocked_by(&mut t, vec![], &[]).unwrap_err();
        assert!(matches!(err, OrcError::InvalidTransition { .. }));
    }

    #[test]
    fn orphan_phases_detected() {
        let mut workflow = Workflow {
            id: "default".to_string(),
            phases: vec![PhaseTemplate::new("spec")],
        };
        workflow.phases.push(PhaseTemplate::new("implement"));

        let mut t = make_task("TASK-001", TaskStatus::Planned);
        t.execution
            .phases
            .insert("spec".to_string(), crate::types::PhaseState::new("spec"));
        t.execution.phases.insert(
            "legacy_phase".to_string(),
            crate::types::PhaseState::new("legacy_phase"),
        );

        let orphans = orphan_phases(&t, &workflow);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].phase, "legacy_phase");
    }
}
