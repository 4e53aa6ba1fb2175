use chrono::Utc;

use crate::config::GatesConfig;
use crate::types::{
    parse_gate_type, GateDecision, GateSource, GateType, PhaseTemplate, Task,
};
use crate::log_warn;

/// Metadata key carrying a task-scoped gate override for one phase.
pub fn override_key(phase_id: &str) -> String {
    format!("gate_override:{}", phase_id)
}

/// The effective gate for a phase plus where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateResolution {
    pub gate: GateType,
    pub source: GateSource,
}

/// Resolve the effective gate for a phase. First match wins:
///
/// 1. Task metadata `gate_override:<phase>`
/// 2. Config `gates.phase_overrides[<phase>]`
/// 3. The workflow phase template's declared gate
/// 4. `auto`
pub fn resolve(
    phase_id: &str,
    task: Option<&Task>,
    template: Option<&PhaseTemplate>,
    gates: &GatesConfig,
) -> GateResolution {
    if let Some(task) = task {
        if let Some(value) = task.metadata.get(&override_key(phase_id)) {
            match parse_gate_type(value) {
                Ok(gate) => {
                    return GateResolution {
                        gate,
                        source: GateSource::TaskOverride,
                    }
                }
                Err(e) => log_warn!("Task {}: ignoring gate override: {}", task.id, e),
            }
        }
    }

    if let Some(value) = gates.phase_overrides.get(phase_id) {
        match parse_gate_type(value) {
            Ok(gate) => {
                return GateResolution {
                    gate,
                    source: GateSource::PhaseOverride,
                }
            }
            Err(e) => log_warn!("Phase {}: ignoring config gate override: {}", phase_id, e),
        }
    }

    if let Some(gate) = template.and_then(|t| t.gate) {
        return GateResolution {
            gate,
            source: GateSource::Workflow,
        };
    }

    GateResolution {
        gate: GateType::Auto,
        source: GateSource::Default,
    }
}

/// What the executor does after a phase ends, given the resolved gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateAction {
    /// Continue to the next phase.
    Advance,
    /// Stop and wait for human approval.
    Block(String),
    /// Rewind to an earlier phase with a fresh conversation.
    Retry { from: String, reason: String },
    /// The task fails.
    Fail(String),
}

/// Decide the post-phase action. Pure: the executor has already run the
/// phase (and, for `ai` gates, the reviewer) and passes the verdicts in.
///
/// - `auto`: advance on success; on failure rewind when the template names
///   a `retry_from` phase and the task retry budget has room, else fail.
/// - `skip`: handled before the agent runs; never reaches here.
/// - `human`: block for approval.
/// - `ai`: the reviewer verdict substitutes for success, then as `auto`.
pub fn decide(
    resolution: GateResolution,
    template: &PhaseTemplate,
    phase_succeeded: bool,
    ai_approved: Option<bool>,
    retries_used: u32,
    retry_budget: u32,
    failure_reason: &str,
) -> GateAction {
    let effective_success = match (resolution.gate, ai_approved) {
        (GateType::Ai, Some(verdict)) => phase_succeeded && verdict,
        _ => phase_succeeded,
    };

    match resolution.gate {
        GateType::Human => GateAction::Block("awaiting human approval".to_string()),
        GateType::Skip => GateAction::Advance,
        GateType::Auto | GateType::Ai => {
            if effective_success {
                GateAction::Advance
            } else {
                match &template.retry_from {
                    Some(from) if retries_used < retry_budget => GateAction::Retry {
                        from: from.clone(),
                        reason: failure_reason.to_string(),
                    },
                    _ => GateAction::Fail(failure_reason.to_string()),
                }
            }
        }
    }
}

/// Build the immutable decision record appended for every path.
pub fn record(
    phase_id: &str,
    resolution: GateResolution,
    approved: bool,
    reason: Option<String>,
) -> GateDecision {
    GateDecision {
        phase: phase_id.to_string(),
        gate: resolution.gate,
        approved,
        reason,
        source: resolution.source.as_str().to_string(),
        timestamp: Utc::now(),
    }
}

/// A later approval supersedes earlier rejections for scheduling: the last
/// decision for the phase wins.
pub fn latest_approval(decisions: &[GateDecision], phase_id: &str) -> Option<bool> {
    decisions
        .iter()
        .filter(|d| d.phase == phase_id)
        .next_back()
        .map(|d| d.approved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    fn template_with_gate(gate: Option<GateType>) -> PhaseTemplate {
        let mut t = PhaseTemplate::new("review");
        t.gate = gate;
        t
    }

    #[test]
    fn task_override_wins_over_everything() {
        let mut task = Task::new("TASK-001", "t");
        task.status = TaskStatus::Planned;
        task.metadata
            .insert(override_key("review"), "human".to_string());

        let mut gates = GatesConfig::default();
        gates
            .phase_overrides
            .insert("review".to_string(), "skip".to_string());

        let template = template_with_gate(Some(GateType::Ai));
        let resolution = resolve("review", Some(&task), Some(&template), &gates);
        assert_eq!(resolution.gate, GateType::Human);
        assert_eq!(resolution.source, GateSource::TaskOverride);
    }

    #[test]
    fn config_override_beats_workflow() {
        let mut gates = GatesConfig::default();
        gates
            .phase_overrides
            .insert("review".to_string(), "skip".to_string());
        let template = template_with_gate(Some(GateType::Human));

        let resolution = resolve("review", None, Some(&template), &gates);
        assert_eq!(resolution.gate, GateType::Skip);
        assert_eq!(resolution.source, GateSource::PhaseOverride);
    }

    #[test]
    fn workflow_gate_then_default() {
        let gates = GatesConfig::default();

        let declared = template_with_gate(Some(GateType::Human));
        let resolution = resolve("review", None, Some(&declared), &gates);
        assert_eq!(resolution.gate, GateType::Human);
        assert_eq!(resolution.source, GateSource::Workflow);

        let undeclared = template_with_gate(None);
        let resolution = resolve("review", None, Some(&undeclared), &gates);
        assert_eq!(resolution.gate, GateType::Auto);
        assert_eq!(resolution.source, GateSource::Default);
    }

    #[test]
    fn invalid_task_override_falls_through() {
        let mut task = Task::new("TASK-001", "t");
        task.metadata
            .insert(override_key("review"), "maybe".to_string());
        let template = template_with_gate(Some(GateType::Skip));

        let resolution = resolve("review", Some(&task), Some(&template), &GatesConfig::default());
        assert_eq!(resolution.gate, GateType::Skip);
        assert_eq!(resolution.source, GateSource::Workflow);
    }

    #[test]
    fn auto_success_advances() {
        let template = template_with_gate(Some(GateType::Auto));
        let resolution = resolve("review", None, Some(&template), &GatesConfig::default());
        let action = decide(resolution, &template, true, None, 0, 3, "");
        assert_eq!(action, GateAction::Advance);
    }

    #[test]
    fn auto_failure_retries_within_budget() {
        let mut template = template_with_gate(Some(GateType::Auto));
        template.retry_from = Some("spec".to_string());
        let resolution = resolve("review", None, Some(&template), &GatesConfig::default());

        let action = decide(resolution, &template, false, None, 1, 3, "tests failed");
        assert_eq!(
            action,
            GateAction::Retry {
                from: "spec".to_string(),
                reason: "tests failed".to_string()
            }
        );

        let action = decide(resolution, &template, false, None, 3, 3, "tests failed");
        assert_eq!(action, GateAction::Fail("tests failed".to_string()));
    }

    #[test]
    fn auto_failure_without_retry_from_fails() {
        let template = template_with_gate(Some(GateType::Auto));
        let resolution = resolve("review", None, Some(&template), &GatesConfig::default());
        let action = decide(resolution, &template, false, None, 0, 3, "boom");
        assert_eq!(action, GateAction::Fail("boom".to_string()));
    }

    #[test]
    fn human_gate_blocks_even_on_success() {
        let template = template_with_gate(Some(GateType::Human));
        let resolution = resolve("review", None, Some(&template), &GatesConfig::default());
        let action = decide(resolution, &template, true, None, 0, 3, "");
        assert!(matches!(action, GateAction::Block(_)));
    }

    #[test]
    fn ai_rejection_behaves_like_failure() {
        let mut template = template_with_gate(Some(GateType::Ai));
        template.retry_from = Some("implement".to_string());
        let resolution = resolve("review", None, Some(&template), &GatesConfig::default());

        let action = decide(resolution, &template, true, Some(false), 0, 3, "reviewer rejected");
        assert!(matches!(action, GateAction::Retry { .. }));

        let action = decide(resolution, &template, true, Some(true), 0, 3, "");
        assert_eq!(action, GateAction::Advance);
    }

    #[test]
    fn latest_decision_wins() {
        let rejection = GateDecision {
            phase: "review".to_string(),
            gate: GateType::Human,
            approved: false,
            reason: Some("awaiting human approval".to_string()),
            source: "workflow".to_string(),
            timestamp: Utc::now(),
        };
        let approval = GateDecision {
            approved: true,
            reason: None,
            ..rejection.clone()
        };
        let decisions = vec![rejection, approval];
        assert_eq!(latest_approval(&decisions, "review"), Some(true));
        assert_eq!(latest_approval(&decisions, "spec"), None);
    }
}
