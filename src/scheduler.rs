use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{self, AgentRunner};
use crate::error::OrcError;
use crate::executor::{self, ExecutorContext};
use crate::tasks;
use crate::types::{ExecutionOutcome, Task};
use crate::{log_debug, log_info, log_warn};

// --- Public types ---

/// Result of a scheduler run, returned to the caller for summary display.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub tasks_completed: Vec<String>,
    pub tasks_blocked: Vec<String>,
    pub tasks_failed: Vec<String>,
    pub tasks_interrupted: Vec<String>,
    pub halt_reason: HaltReason,
}

#[derive(Debug, PartialEq, Default)]
pub enum HaltReason {
    #[default]
    AllDoneOrBlocked,
    TargetsSettled,
    ShutdownRequested,
    PauseRequested,
}

/// Parameters for running the orchestrator.
#[derive(Debug, Default, Clone)]
pub struct RunParams {
    /// Restrict dispatch to these task ids. Tasks named here may also be
    /// resumed out of `failed` (explicit resume).
    pub targets: Vec<String>,
}

/// Tracks task ids currently owned by an executor in this process.
#[derive(Default)]
pub struct RunningTasks {
    active: HashSet<String>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.active.contains(task_id)
    }

    pub fn insert(&mut self, task_id: String) {
        self.active.insert(task_id);
    }

    pub fn remove(&mut self, task_id: &str) {
        self.active.remove(task_id);
    }
}

// --- select_ready: pure function ---

/// Select the tasks eligible for dispatch, most urgent first.
///
/// This is a pure function: no I/O, no async, trivially testable.
///
/// Eligibility: `can_run` holds (targets get explicit resume), the task is
/// not already running in this process, and (when targets are given) the
/// task is one of them. Order: priority desc, blocker count asc, creation
/// time asc (FIFO within a tier).
pub fn select_ready<'a>(
    snapshot: &'a [Task],
    running: &RunningTasks,
    settled: &HashSet<String>,
    params: &RunParams,
) -> Vec<&'a Task> {
    let mut ready: Vec<&Task> = snapshot
        .iter()
        .filter(|t| {
            if running.contains(&t.id) || settled.contains(&t.id) {
                return false;
            }
            if !params.targets.is_empty() && !params.targets.contains(&t.id) {
                return false;
            }
            let explicit_resume = params.targets.contains(&t.id);
            tasks::can_run(t, snapshot, explicit_resume)
        })
        .collect();

    ready.sort_by(|a, b| {
        b.priority
            .sort_value()
            .cmp(&a.priority.sort_value())
            .then_with(|| a.blocked_by.len().cmp(&b.blocked_by.len()))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ready
}

/// True when every target reached a settled state: terminal, stuck, or
/// already attempted in this run, and none is running.
fn targets_settled(
    snapshot: &[Task],
    params: &RunParams,
    running: &RunningTasks,
    settled: &HashSet<String>,
) -> bool {
    if params.targets.is_empty() {
        return false;
    }
    params.targets.iter().all(|id| {
        if running.contains(id) {
            return false;
        }
        if settled.contains(id) {
            return true;
        }
        match snapshot.iter().find(|t| t.id == *id) {
            // Deleted target counts as settled
            None => true,
            Some(t) => !tasks::can_run(t, snapshot, true),
        }
    })
}

// --- Main dispatch loop ---

/// Run the orchestrator loop.
///
/// 1. Snapshot all tasks from the store.
/// 2. Partition into ready and waiting via `select_ready` (pure).
/// 3. Claim and spawn executors until the pool is full. `AlreadyClaimed`
///    is skipped silently (another process owns the task).
/// 4. Wait for an executor completion or the poll interval, then repeat.
///
/// Terminates naturally when nothing is ready and nothing is active, or on
/// cancellation, which cancels every executor and waits for each to persist
/// its partial state before returning.
pub async fn run_scheduler<R: AgentRunner + 'static>(
    ctx: Arc<ExecutorContext<R>>,
    params: RunParams,
    cancel: CancellationToken,
) -> Result<RunSummary, OrcError> {
    let mut summary = RunSummary::default();
    let mut running = RunningTasks::new();
    // Tasks that reached an outcome in this run; never re-dispatched so a
    // failing target cannot spin the loop.
    let mut settled: HashSet<String> = HashSet::new();
    let mut join_set: JoinSet<(String, ExecutionOutcome)> = JoinSet::new();

    let pid = std::process::id() as i32;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    log_info!(
        "Orchestrator started (max_concurrent={}, poll_interval={}s)",
        ctx.config.execution.max_concurrent,
        ctx.config.execution.poll_interval_secs
    );

    loop {
        if cancel.is_cancelled() {
            drain(&mut join_set, &mut running, &mut settled, &mut summary).await;
            summary.halt_reason = if agent::is_pause_requested() {
                HaltReason::PauseRequested
            } else {
                HaltReason::ShutdownRequested
            };
            return Ok(summary);
        }

        let snapshot = ctx.store.load_all_tasks().await?;

        if targets_settled(&snapshot, &params, &running, &settled) {
            drain(&mut join_set, &mut running, &mut settled, &mut summary).await;
            summary.halt_reason = HaltReason::TargetsSettled;
            return Ok(summary);
        }

        let ready = select_ready(&snapshot, &running, &settled, &params);

        let max_concurrent = ctx.config.execution.max_concurrent as usize;
        for task in ready {
            if running.len() >= max_concurrent {
                break;
            }

            // Fail fast on an unresolvable workflow without claiming, so
            // the task status stays untouched.
            if let Err(e) = ctx.registry.resolve(task) {
                log_warn!("[{}] Not dispatched: {}", task.id, e);
                settled.insert(task.id.clone());
                if !summary.tasks_failed.contains(&task.id) {
                    summary.tasks_failed.push(task.id.clone());
                }
                continue;
            }

            match ctx
                .store
                .try_claim_task_execution(&task.id, pid, &host)
                .await
            {
                Ok(_claim) => {
                    log_info!("[{}] Claimed — dispatching", task.id);
                    running.insert(task.id.clone());
                    let ctx = Arc::clone(&ctx);
                    let task_id = task.id.clone();
                    let cancel = cancel.clone();
                    join_set.spawn(async move {
                        let outcome = executor::execute_task(&ctx, &task_id, &cancel).await;
                        (task_id, outcome)
                    });
                }
                Err(OrcError::AlreadyClaimed { pid, hostname }) => {
                    log_debug!(
                        "[{}] Already claimed by pid {} on {} — skipping",
                        task.id,
                        pid,
                        hostname
                    );
                }
                Err(e) => {
                    log_warn!("[{}] Claim failed: {}", task.id, e);
                }
            }
        }

        if running.is_empty() {
            // Nothing active; if nothing newly became ready either, we are done
            let ready_now = select_ready(&snapshot, &running, &settled, &params);
            if ready_now.is_empty() {
                summary.halt_reason = if params.targets.is_empty() {
                    HaltReason::AllDoneOrBlocked
                } else {
                    HaltReason::TargetsSettled
                };
                return Ok(summary);
            }
        }

        // React to executor completions immediately; otherwise poll.
        tokio::select! {
            joined = join_set.join_next(), if !join_set.is_empty() => {
                if let Some(result) = joined {
                    record_completion(result, &mut running, &mut settled, &mut summary);
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(ctx.config.execution.poll_interval_secs)) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

fn record_completion(
    result: Result<(String, ExecutionOutcome), tokio::task::JoinError>,
    running: &mut RunningTasks,
    settled: &mut HashSet<String>,
    summary: &mut RunSummary,
) {
    match result {
        Ok((task_id, outcome)) => {
            running.remove(&task_id);
            settled.insert(task_id.clone());
            match outcome {
                ExecutionOutcome::Completed => {
                    log_info!("[{}] Completed", task_id);
                    summary.tasks_completed.push(task_id);
                }
                ExecutionOutcome::Blocked(reason) => {
                    log_info!("[{}] Blocked: {}", task_id, reason);
                    summary.tasks_blocked.push(task_id);
                }
                ExecutionOutcome::Failed(reason) => {
                    log_warn!("[{}] Failed: {}", task_id, reason);
                    summary.tasks_failed.push(task_id);
                }
                ExecutionOutcome::Interrupted => {
                    log_info!("[{}] Interrupted — state saved", task_id);
                    summary.tasks_interrupted.push(task_id);
                }
            }
        }
        Err(e) => {
            log_warn!("Executor task panicked: {}", e);
        }
    }
}

/// Await every in-flight executor; each persists its own partial state and
/// releases its claim before returning.
async fn drain(
    join_set: &mut JoinSet<(String, ExecutionOutcome)>,
    running: &mut RunningTasks,
    settled: &mut HashSet<String>,
    summary: &mut RunSummary,
) {
    while let Some(result) = join_set.join_next().await {
        record_completion(result, running, settled, summary);
    }
}
