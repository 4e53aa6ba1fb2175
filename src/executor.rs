use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvocation, AgentRunner};
use crate::config::OrcConfig;
use crate::error::OrcError;
use crate::gate::{self, GateAction};
use crate::host::HostProvider;
use crate::log::phase_label;
use crate::prompt;
use crate::store::Store;
use crate::tasks::META_PENDING_GATE;
use crate::types::{
    AgentOutcome, ExecutionOutcome, GateType, Initiative, PhaseStatus, PhaseTemplate,
    RetryContext, Task, TaskStatus, TranscriptEntry, Workflow,
};
use crate::workflow::WorkflowRegistry;
use crate::worktree::{self, FinalizeOutcome};
use crate::{log_info, log_warn};

/// Everything an executor needs to drive one claimed task. Shared across
/// executors by the scheduler.
pub struct ExecutorContext<R: AgentRunner> {
    pub store: Store,
    pub registry: Arc<WorkflowRegistry>,
    pub config: Arc<OrcConfig>,
    pub runner: Arc<R>,
    pub host: Arc<dyn HostProvider>,
    pub repo_root: PathBuf,
}

/// Determine which phase execution starts from: the recorded current phase
/// if it still has work, else the first phase that is neither completed nor
/// skipped. `None` means every phase is already done.
pub fn start_phase_index(task: &Task, workflow: &Workflow) -> Option<usize> {
    if let Some(ref current) = task.execution.current_phase {
        if let Some(idx) = workflow.phase_index(current) {
            let done = task
                .execution
                .phase_state(current)
                .map(|s| matches!(s.status, PhaseStatus::Completed | PhaseStatus::Skipped))
                .unwrap_or(false);
            if !done {
                return Some(idx);
            }
        }
    }

    workflow.phases.iter().position(|p| {
        task.execution
            .phase_state(&p.id)
            .map(|s| !matches!(s.status, PhaseStatus::Completed | PhaseStatus::Skipped))
            .unwrap_or(true)
    })
}

/// Rewind execution to an earlier phase for a fresh-conversation retry.
///
/// The target phase must hold a checkpoint commit (or declare none); a
/// checkpointing phase without one is `NoCheckpoint` and nothing is mutated.
pub fn rewind(task: &mut Task, workflow: &Workflow, target: &str, reason: &str) -> Result<(), OrcError> {
    let target_idx = workflow
        .phase_index(target)
        .ok_or_else(|| OrcError::NotFound(format!("phase {}", target)))?;

    let template = &workflow.phases[target_idx];
    let has_checkpoint = task
        .execution
        .phase_state(target)
        .and_then(|s| s.commit_sha.as_ref())
        .is_some();
    if template.checkpoint && !has_checkpoint {
        return Err(OrcError::NoCheckpoint(target.to_string()));
    }

    for phase in &workflow.phases[target_idx..] {
        if let Some(state) = task.execution.phases.get_mut(&phase.id) {
            state.status = PhaseStatus::Pending;
            state.commit_sha = None;
            state.completed_at = None;
            state.iterations = 0;
        }
    }
    task.execution.current_phase = Some(target.to_string());
    task.execution.current_iteration = 0;
    task.execution.retry_context = Some(RetryContext {
        from_phase: target.to_string(),
        reason: reason.to_string(),
    });
    task.execution.retries_used += 1;
    Ok(())
}

/// Drive a claimed task end-to-end through its workflow phases.
///
/// The caller (scheduler) owns the claim and applies the final status for
/// `Interrupted`; every other outcome's status is persisted here.
pub async fn execute_task<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task_id: &str,
    cancel: &CancellationToken,
) -> ExecutionOutcome {
    let mut task = match ctx.store.load_task(task_id).await {
        Ok(task) => task,
        Err(e) => return ExecutionOutcome::Failed(format!("Failed to load {}: {}", task_id, e)),
    };

    let workflow = match ctx.registry.resolve(&task) {
        Ok(workflow) => workflow.clone(),
        Err(e) => return fail_task(ctx, &mut task, e.to_string()).await,
    };

    // Prepare the isolated working copy before any phase runs
    let initiative = load_initiative(ctx, &task).await;
    let prep_task = task.clone();
    let prep_initiative = initiative.clone();
    let prep_config = Arc::clone(&ctx.config);
    let prep_root = ctx.repo_root.clone();
    let worktree_path = match tokio::task::spawn_blocking(move || {
        worktree::prepare(&prep_task, prep_initiative.as_ref(), &prep_config, &prep_root)
    })
    .await
    .unwrap_or_else(|e| Err(format!("spawn_blocking panicked: {}", e)))
    {
        Ok(path) => path,
        Err(e) => {
            let err = OrcError::WorktreeUnavailable(e);
            return fail_task(ctx, &mut task, err.to_string()).await;
        }
    };

    let mut idx = match start_phase_index(&task, &workflow) {
        Some(idx) => idx,
        None => workflow.phases.len(), // all phases done; straight to finalize
    };

    while idx < workflow.phases.len() {
        if cancel.is_cancelled() {
            return interrupt(ctx, &mut task).await;
        }

        let template = workflow.phases[idx].clone();
        let resolution = gate::resolve(&template.id, Some(&task), Some(&template), &ctx.config.gates);

        // Skip gates take no agent invocation
        if resolution.gate == GateType::Skip {
            log_info!("{} Gate skip — phase not run", phase_label(&task.id, &template.id));
            let state = task.execution.phase_state_mut(&template.id);
            state.status = PhaseStatus::Skipped;
            state.completed_at = Some(chrono::Utc::now());
            task.execution.current_phase = next_phase_id(&workflow, idx);
            let decision = gate::record(&template.id, resolution, true, None);
            if let Err(e) = ctx.store.append_gate_decision(&task.id, &decision).await {
                return fail_task(ctx, &mut task, e.to_string()).await;
            }
            if let Err(e) = ctx.store.save_task(&mut task).await {
                return fail_task(ctx, &mut task, e.to_string()).await;
            }
            idx += 1;
            continue;
        }

        // Human gates guard entry: block until the latest decision approves
        if resolution.gate == GateType::Human {
            let decisions = match ctx.store.list_gate_decisions(&task.id).await {
                Ok(d) => d,
                Err(e) => return fail_task(ctx, &mut task, e.to_string()).await,
            };
            if gate::latest_approval(&decisions, &template.id) != Some(true) {
                log_info!(
                    "{} Human gate — blocking for approval",
                    phase_label(&task.id, &template.id)
                );
                let decision = gate::record(
                    &template.id,
                    resolution,
                    false,
                    Some("awaiting human approval".to_string()),
                );
                if let Err(e) = ctx.store.append_gate_decision(&task.id, &decision).await {
                    return fail_task(ctx, &mut task, e.to_string()).await;
                }
                task.metadata
                    .insert(META_PENDING_GATE.to_string(), template.id.clone());
                if let Err(e) = task.transition_status(TaskStatus::Blocked, false) {
                    return fail_task(ctx, &mut task, e.to_string()).await;
                }
                if let Err(e) = ctx.store.save_task(&mut task).await {
                    return fail_task(ctx, &mut task, e.to_string()).await;
                }
                let _ = ctx.store.release_claim(&task.id).await;
                return ExecutionOutcome::Blocked("awaiting human approval".to_string());
            }
            task.metadata.remove(META_PENDING_GATE);
        }

        // Run the phase, iterating while the agent asks for another pass
        match run_phase(ctx, &mut task, &workflow, &template, &worktree_path, cancel).await {
            PhaseRun::Completed => {
                // ai gates judge the completed phase; the recorded decision
                // is the reviewer's verdict. Every other gate records the
                // phase's own success.
                if resolution.gate == GateType::Ai {
                    let verdict = match run_ai_review(ctx, &task, &template, &worktree_path, cancel).await
                    {
                        Ok(verdict) => verdict,
                        Err(e) => {
                            if cancel.is_cancelled() {
                                return interrupt(ctx, &mut task).await;
                            }
                            return fail_task(ctx, &mut task, e).await;
                        }
                    };
                    let reason = if verdict {
                        None
                    } else {
                        Some(format!("reviewer rejected phase {}", template.id))
                    };
                    let decision = gate::record(&template.id, resolution, verdict, reason.clone());
                    if let Err(e) = ctx.store.append_gate_decision(&task.id, &decision).await {
                        return fail_task(ctx, &mut task, e.to_string()).await;
                    }
                    if !verdict {
                        let reason = reason.unwrap_or_default();
                        match gate::decide(
                            resolution,
                            &template,
                            false,
                            Some(false),
                            task.execution.retries_used,
                            ctx.config.execution.retry_budget,
                            &reason,
                        ) {
                            GateAction::Retry { from, reason } => {
                                if let Err(e) = rewind(&mut task, &workflow, &from, &reason) {
                                    return fail_task(ctx, &mut task, e.to_string()).await;
                                }
                                if let Err(e) = ctx.store.save_task(&mut task).await {
                                    return fail_task(ctx, &mut task, e.to_string()).await;
                                }
                                idx = workflow.phase_index(&from).unwrap_or(0);
                                continue;
                            }
                            _ => return fail_task(ctx, &mut task, reason).await,
                        }
                    }
                } else {
                    let decision = gate::record(&template.id, resolution, true, None);
                    if let Err(e) = ctx.store.append_gate_decision(&task.id, &decision).await {
                        return fail_task(ctx, &mut task, e.to_string()).await;
                    }
                }

                task.execution.current_phase = next_phase_id(&workflow, idx);
                task.execution.retry_context = None;
                if let Err(e) = ctx.store.save_task(&mut task).await {
                    return fail_task(ctx, &mut task, e.to_string()).await;
                }
                idx += 1;
            }
            PhaseRun::Failed(reason) => {
                let decision = gate::record(&template.id, resolution, false, Some(reason.clone()));
                if let Err(e) = ctx.store.append_gate_decision(&task.id, &decision).await {
                    return fail_task(ctx, &mut task, e.to_string()).await;
                }

                match gate::decide(
                    resolution,
                    &template,
                    false,
                    None,
                    task.execution.retries_used,
                    ctx.config.execution.retry_budget,
                    &reason,
                ) {
                    GateAction::Retry { from, reason } => {
                        log_info!(
                            "{} Rewinding to {} ({})",
                            phase_label(&task.id, &template.id),
                            from,
                            reason
                        );
                        if let Err(e) = rewind(&mut task, &workflow, &from, &reason) {
                            return fail_task(ctx, &mut task, e.to_string()).await;
                        }
                        if let Err(e) = ctx.store.save_task(&mut task).await {
                            return fail_task(ctx, &mut task, e.to_string()).await;
                        }
                        idx = workflow.phase_index(&from).unwrap_or(0);
                    }
                    _ => return fail_task(ctx, &mut task, reason).await,
                }
            }
            PhaseRun::Interrupted => return interrupt(ctx, &mut task).await,
        }
    }

    finalize_task(ctx, &mut task, initiative.as_ref()).await
}

enum PhaseRun {
    Completed,
    Failed(String),
    Interrupted,
}

/// Run one phase with its iteration loop. Persists phase state transitions
/// and streams transcript entries to the store as they arrive.
async fn run_phase<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task: &mut Task,
    workflow: &Workflow,
    template: &PhaseTemplate,
    worktree_path: &Path,
    cancel: &CancellationToken,
) -> PhaseRun {
    let max_iterations = template.effective_max_iterations(task.weight);
    let timeout = Duration::from_secs(ctx.config.execution.phase_timeout_minutes as u64 * 60);
    let grace = Duration::from_secs(ctx.config.execution.agent_grace_period_secs);

    let previous_summary = previous_phase_notes(task, workflow, &template.id);

    log_info!(
        "{} Using {} (model: {})",
        phase_label(&task.id, &template.id),
        ctx.config.agent.cli.display_name(),
        template
            .model
            .as_deref()
            .or(ctx.config.agent.model.as_deref())
            .unwrap_or("default")
    );

    loop {
        if cancel.is_cancelled() {
            return PhaseRun::Interrupted;
        }

        {
            let state = task.execution.phase_state_mut(&template.id);
            state.status = PhaseStatus::Running;
            state.iterations += 1;
            if state.started_at.is_none() {
                state.started_at = Some(chrono::Utc::now());
            }
        }
        task.execution.current_phase = Some(template.id.clone());
        let iteration = task.execution.phase_state(&template.id).map(|s| s.iterations).unwrap_or(1);
        task.execution.current_iteration = iteration;
        if let Err(e) = ctx.store.save_task(task).await {
            return PhaseRun::Failed(e.to_string());
        }

        log_info!(
            "{} Starting phase (iteration {}/{})",
            phase_label(&task.id, &template.id),
            iteration,
            max_iterations
        );

        let result_path = result_file_path(&ctx.repo_root, &task.id, &template.id);
        let invocation = AgentInvocation {
            task_id: task.id.clone(),
            phase: template.id.clone(),
            iteration,
            model: template
                .model
                .clone()
                .or_else(|| ctx.config.agent.model.clone()),
            prompt: prompt::build_prompt(&prompt::PromptParams {
                task: &*task,
                template,
                iteration,
                max_iterations,
                result_path: &result_path,
                previous_summary: previous_summary.as_deref(),
                retry_context: task.execution.retry_context.as_ref(),
            }),
            working_dir: worktree_path.to_path_buf(),
            result_path,
            timeout,
            grace,
        };

        // Transcript entries stream to the store while the agent runs; the
        // writer is drained before the phase result is recorded so readers
        // observe them in program order.
        let (tx, mut rx) = mpsc::channel::<TranscriptEntry>(64);
        let writer_store = ctx.store.clone();
        let writer = tokio::spawn(async move {
            while let Some(mut entry) = rx.recv().await {
                if let Err(e) = writer_store.append_transcript(&mut entry).await {
                    log_warn!("Failed to append transcript entry: {}", e);
                }
            }
        });

        let agent_result = ctx.runner.run_agent(&invocation, tx, cancel).await;
        let _ = writer.await;

        if cancel.is_cancelled() {
            return PhaseRun::Interrupted;
        }

        match agent_result {
            Ok(result) => {
                if result.task_id != task.id || result.phase != template.id {
                    return PhaseRun::Failed(format!(
                        "Result identity mismatch: expected {}/{}, got {}/{}",
                        task.id, template.id, result.task_id, result.phase
                    ));
                }

                match result.outcome {
                    AgentOutcome::Ok => {
                        if template.checkpoint {
                            let wt = worktree_path.to_path_buf();
                            let task_id = task.id.clone();
                            let phase_id = template.id.clone();
                            let summary = result.commit_summary.clone();
                            let sha = tokio::task::spawn_blocking(move || {
                                worktree::checkpoint(&wt, &task_id, &phase_id, summary.as_deref())
                            })
                            .await
                            .unwrap_or_else(|e| Err(format!("spawn_blocking panicked: {}", e)));
                            match sha {
                                Ok(sha) => {
                                    let state = task.execution.phase_state_mut(&template.id);
                                    state.commit_sha = Some(sha);
                                }
                                Err(e) => return PhaseRun::Failed(e),
                            }
                        }
                        let state = task.execution.phase_state_mut(&template.id);
                        state.status = PhaseStatus::Completed;
                        state.completed_at = Some(chrono::Utc::now());
                        state.notes = Some(result.summary.clone());
                        if let Err(e) = ctx.store.save_task(task).await {
                            return PhaseRun::Failed(e.to_string());
                        }
                        return PhaseRun::Completed;
                    }
                    AgentOutcome::NeedsRetry => {
                        if iteration < max_iterations {
                            log_info!(
                                "{} needs_retry (iteration {}/{}): {}",
                                phase_label(&task.id, &template.id),
                                iteration,
                                max_iterations,
                                result.summary
                            );
                            continue;
                        }
                        let state = task.execution.phase_state_mut(&template.id);
                        state.status = PhaseStatus::Failed;
                        return PhaseRun::Failed(format!(
                            "Phase {} exhausted {} iterations: {}",
                            template.id, max_iterations, result.summary
                        ));
                    }
                    AgentOutcome::Failed => {
                        let state = task.execution.phase_state_mut(&template.id);
                        state.status = PhaseStatus::Failed;
                        let reason = result
                            .reason
                            .as_deref()
                            .unwrap_or(&result.summary)
                            .to_string();
                        return PhaseRun::Failed(format!("Phase {} failed: {}", template.id, reason));
                    }
                }
            }
            Err(e) => {
                if cancel.is_cancelled() || e == "Cancelled" || e == "Shutdown requested" {
                    return PhaseRun::Interrupted;
                }
                if iteration < max_iterations {
                    log_info!(
                        "{} Agent error (iteration {}/{}): {}",
                        phase_label(&task.id, &template.id),
                        iteration,
                        max_iterations,
                        e
                    );
                    continue;
                }
                let state = task.execution.phase_state_mut(&template.id);
                state.status = PhaseStatus::Failed;
                return PhaseRun::Failed(format!(
                    "Phase {} failed after {} iterations. Last error: {}",
                    template.id, max_iterations, e
                ));
            }
        }
    }
}

/// Invoke the reviewer agent for an `ai` gate; true means approved.
async fn run_ai_review<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task: &Task,
    template: &PhaseTemplate,
    worktree_path: &Path,
    cancel: &CancellationToken,
) -> Result<bool, String> {
    let phase_summary = task
        .execution
        .phase_state(&template.id)
        .and_then(|s| s.notes.clone())
        .unwrap_or_else(|| "(no summary)".to_string());
    let result_path = result_file_path(&ctx.repo_root, &task.id, &format!("{}-review", template.id));

    let invocation = AgentInvocation {
        task_id: task.id.clone(),
        phase: template.id.clone(),
        iteration: 1,
        model: ctx
            .config
            .agent
            .reviewer
            .clone()
            .or_else(|| ctx.config.agent.model.clone()),
        prompt: prompt::build_review_prompt(task, template, &phase_summary, &result_path),
        working_dir: worktree_path.to_path_buf(),
        result_path,
        timeout: Duration::from_secs(ctx.config.execution.phase_timeout_minutes as u64 * 60),
        grace: Duration::from_secs(ctx.config.execution.agent_grace_period_secs),
    };

    let (tx, mut rx) = mpsc::channel::<TranscriptEntry>(64);
    let writer_store = ctx.store.clone();
    let writer = tokio::spawn(async move {
        while let Some(mut entry) = rx.recv().await {
            if let Err(e) = writer_store.append_transcript(&mut entry).await {
                log_warn!("Failed to append transcript entry: {}", e);
            }
        }
    });
    let result = ctx.runner.run_agent(&invocation, tx, cancel).await;
    let _ = writer.await;

    let result = result?;
    Ok(result.outcome == AgentOutcome::Ok)
}

/// Finalize after the last phase: sync, push, PR. Maps outcomes to statuses.
async fn finalize_task<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task: &mut Task,
    initiative: Option<&Initiative>,
) -> ExecutionOutcome {
    if let Err(e) = task.transition_status(TaskStatus::Finalizing, false) {
        return fail_task(ctx, task, e.to_string()).await;
    }
    if let Err(e) = ctx.store.save_task(task).await {
        return fail_task(ctx, task, e.to_string()).await;
    }

    let last_commit = task
        .execution
        .phases
        .values()
        .filter(|s| s.status == PhaseStatus::Completed)
        .filter_map(|s| s.completed_at.map(|t| (t, s.commit_sha.clone())))
        .max_by_key(|(t, _)| *t)
        .and_then(|(_, sha)| sha);

    let fin_task = task.clone();
    let fin_initiative = initiative.cloned();
    let fin_config = Arc::clone(&ctx.config);
    let fin_root = ctx.repo_root.clone();
    let fin_host = Arc::clone(&ctx.host);
    let outcome = tokio::task::spawn_blocking(move || {
        worktree::finalize(
            &fin_task,
            fin_initiative.as_ref(),
            last_commit.as_deref(),
            &fin_config,
            &fin_root,
            fin_host.as_ref(),
        )
    })
    .await
    .unwrap_or_else(|e| FinalizeOutcome::Fatal(format!("spawn_blocking panicked: {}", e)));

    match outcome {
        FinalizeOutcome::Ok { pr_url } => {
            log_info!("[{}] Finalized — {}", task.id, pr_url);
            task.metadata
                .insert(worktree::META_PR_URL.to_string(), pr_url);
            if let Err(e) = task.transition_status(TaskStatus::Completed, false) {
                return fail_task(ctx, task, e.to_string()).await;
            }
            if let Err(e) = ctx.store.save_task(task).await {
                return fail_task(ctx, task, e.to_string()).await;
            }
            let _ = ctx.store.release_claim(&task.id).await;
            ExecutionOutcome::Completed
        }
        FinalizeOutcome::Conflict { files } => {
            let error = worktree::format_blocked_error(&files);
            log_warn!("[{}] {}", task.id, error);
            task.metadata
                .insert(worktree::META_BLOCKED_ERROR.to_string(), error.clone());
            if let Err(e) = task.transition_status(TaskStatus::Blocked, false) {
                return fail_task(ctx, task, e.to_string()).await;
            }
            if let Err(e) = ctx.store.save_task(task).await {
                return fail_task(ctx, task, e.to_string()).await;
            }
            let _ = ctx.store.release_claim(&task.id).await;
            ExecutionOutcome::Blocked(error)
        }
        FinalizeOutcome::Fatal(e) => fail_task(ctx, task, e).await,
    }
}

/// Record a failure: error persisted, status failed, claim released.
async fn fail_task<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task: &mut Task,
    reason: String,
) -> ExecutionOutcome {
    log_warn!("[{}] Failed: {}", task.id, reason);
    task.execution.error = Some(reason.clone());
    if task.transition_status(TaskStatus::Failed, false).is_err() {
        // Not in a failable state (e.g. workflow missing before dispatch
        // transition); persist the error without forcing the status.
        let _ = ctx.store.save_task(task).await;
        let _ = ctx.store.release_claim(&task.id).await;
        return ExecutionOutcome::Failed(reason);
    }
    if let Err(e) = ctx.store.save_task(task).await {
        log_warn!("[{}] Failed to persist failure: {}", task.id, e);
    }
    let _ = ctx.store.release_claim(&task.id).await;
    ExecutionOutcome::Failed(reason)
}

/// Cancellation observed: the running phase goes back to pending, the
/// partial state is committed, then the claim is released, in that order.
async fn interrupt<R: AgentRunner>(ctx: &ExecutorContext<R>, task: &mut Task) -> ExecutionOutcome {
    if let Some(current) = task.execution.current_phase.clone() {
        if let Some(state) = task.execution.phases.get_mut(&current) {
            if state.status == PhaseStatus::Running {
                state.status = PhaseStatus::Pending;
            }
        }
    }
    if task.transition_status(TaskStatus::Paused, false).is_err() {
        log_warn!("[{}] Could not mark paused from {:?}", task.id, task.status);
    }
    if let Err(e) = ctx.store.save_task(task).await {
        log_warn!("[{}] Failed to persist interrupt state: {}", task.id, e);
    }
    let _ = ctx.store.release_claim(&task.id).await;
    ExecutionOutcome::Interrupted
}

async fn load_initiative<R: AgentRunner>(
    ctx: &ExecutorContext<R>,
    task: &Task,
) -> Option<Initiative> {
    match &task.initiative_id {
        Some(id) => ctx.store.load_initiative(id).await.ok(),
        None => None,
    }
}

fn next_phase_id(workflow: &Workflow, idx: usize) -> Option<String> {
    workflow.phases.get(idx + 1).map(|p| p.id.clone())
}

fn previous_phase_notes(task: &Task, workflow: &Workflow, phase_id: &str) -> Option<String> {
    let idx = workflow.phase_index(phase_id)?;
    workflow.phases[..idx]
        .iter()
        .rev()
        .find_map(|p| task.execution.phase_state(&p.id).and_then(|s| s.notes.clone()))
}

/// Result file location for one phase invocation.
pub fn result_file_path(root: &Path, task_id: &str, phase: &str) -> PathBuf {
    root.join(".orc")
        .join("results")
        .join(format!("{}_{}.json", task_id, phase))
}
