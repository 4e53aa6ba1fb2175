use std::path::{Path, PathBuf};

use crate::config::{CompletionConfig, DeveloperConfig, OrcConfig, SyncStrategy};
use crate::git::{self, PushOutcome, Strategy, SyncOutcome};
use crate::host::{HostProvider, PrOptions, PrOutcome};
pub use crate::tasks::{META_BLOCKED_ERROR, META_PR_URL};
use crate::types::{Initiative, Task};
use crate::{log_info, log_warn};

/// Branch a task's work lands on: explicit override or `{prefix}{task_id}`.
pub fn branch_name_for(task: &Task, config: &OrcConfig) -> String {
    match &task.branch_name {
        Some(name) => name.clone(),
        None => format!("{}{}", config.worktree.branch_prefix, task.id),
    }
}

/// Filesystem location of a task's isolated working copy. Partitioned by
/// task id so concurrent executors never touch the same path.
pub fn worktree_path_for(task: &Task, config: &OrcConfig, repo_root: &Path) -> PathBuf {
    repo_root
        .join(&config.worktree.dir)
        .join(format!("orc-{}", task.id))
}

/// Resolve the base/target branch for a task. First non-empty wins:
/// task target, owning initiative's branch base, the developer staging
/// branch (when staging is enabled), project completion target, `main`.
pub fn resolve_base_branch(
    task: &Task,
    initiative: Option<&Initiative>,
    developer: &DeveloperConfig,
    completion: &CompletionConfig,
) -> String {
    if let Some(ref target) = task.target_branch {
        if !target.is_empty() {
            return target.clone();
        }
    }
    if let Some(base) = initiative.and_then(|i| i.branch_base.as_ref()) {
        if !base.is_empty() {
            return base.clone();
        }
    }
    if developer.staging_enabled {
        if let Some(ref staging) = developer.staging_branch {
            if !staging.is_empty() {
                return staging.clone();
            }
        }
    }
    if !completion.target_branch.is_empty() {
        return completion.target_branch.clone();
    }
    "main".to_string()
}

/// Prepare the task's isolated working copy.
///
/// Creates the branch from the resolved base when it does not exist yet.
/// An existing worktree is reused only when it has the expected branch
/// checked out; anything else at that path is recreated.
pub fn prepare(
    task: &Task,
    initiative: Option<&Initiative>,
    config: &OrcConfig,
    repo_root: &Path,
) -> Result<PathBuf, String> {
    let branch = branch_name_for(task, config);
    git::validate_branch_name(&branch)?;

    if !git::branch_exists(&branch, repo_root)? {
        let base = resolve_base_branch(task, initiative, &config.developer, &config.completion);
        log_info!("[{}] Creating branch {} from {}", task.id, branch, base);
        git::create_branch(&branch, &base, repo_root)?;
    }

    let path = worktree_path_for(task, config, repo_root);
    if path.exists() {
        match git::current_branch(&path) {
            Ok(current) if current == branch => {
                log_info!("[{}] Reusing worktree at {}", task.id, path.display());
                return Ok(path);
            }
            Ok(current) => {
                log_warn!(
                    "[{}] Worktree at {} has branch '{}' (expected '{}'), recreating",
                    task.id,
                    path.display(),
                    current,
                    branch
                );
                git::remove_worktree(&path, repo_root)?;
            }
            Err(_) => {
                // Not a usable worktree; clear the path before re-adding
                std::fs::remove_dir_all(&path)
                    .map_err(|e| format!("Failed to remove {}: {}", path.display(), e))?;
            }
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    git::create_worktree(&path, &branch, repo_root)?;
    Ok(path)
}

/// Record a phase checkpoint: stage and commit the worktree, returning the
/// commit sha. Commit message format `[TASK-001][phase] summary`.
pub fn checkpoint(
    worktree: &Path,
    task_id: &str,
    phase: &str,
    summary: Option<&str>,
) -> Result<String, String> {
    if git::is_clean(worktree)? {
        // Nothing to commit: the checkpoint is the current HEAD
        return git::head_sha(worktree);
    }
    let message = build_checkpoint_message(task_id, phase, summary);
    git::commit(worktree, &message)
}

/// Build the checkpoint commit message, stripping a duplicate prefix if the
/// agent already included it.
pub fn build_checkpoint_message(task_id: &str, phase: &str, summary: Option<&str>) -> String {
    let prefix = format!("[{}][{}]", task_id, phase);
    match summary {
        Some(s) => {
            let trimmed = s
                .strip_prefix(&prefix)
                .map(|rest| rest.trim_start())
                .unwrap_or(s);
            format!("{} {}", prefix, trimmed)
        }
        None => format!("{} Phase output", prefix),
    }
}

/// Outcome of the finalize protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// PR opened (or reused); task completes.
    Ok { pr_url: String },
    /// Target branch changes could not be applied; task blocks.
    Conflict { files: Vec<String> },
    /// Unrecoverable; task fails.
    Fatal(String),
}

/// Finalize a task after its last phase succeeded:
///
/// 1. Verify the worktree is clean and HEAD matches the last checkpoint.
/// 2. Sync against the target branch (conflicts block the task).
/// 3. Push the branch with lease semantics.
/// 4. Open a PR; an existing PR for the branch is reused.
/// 5. Clean the worktree when configured.
#[allow(clippy::too_many_arguments)]
pub fn finalize(
    task: &Task,
    initiative: Option<&Initiative>,
    last_commit: Option<&str>,
    config: &OrcConfig,
    repo_root: &Path,
    host: &dyn HostProvider,
) -> FinalizeOutcome {
    let branch = branch_name_for(task, config);
    let path = worktree_path_for(task, config, repo_root);
    let base = resolve_base_branch(task, initiative, &config.developer, &config.completion);

    match git::is_clean(&path) {
        Ok(true) => {}
        Ok(false) => {
            return FinalizeOutcome::Fatal(format!(
                "Worktree {} has uncommitted changes at finalize",
                path.display()
            ))
        }
        Err(e) => return FinalizeOutcome::Fatal(e),
    }

    if let Some(expected) = last_commit {
        match git::head_sha(&path) {
            Ok(head) if head == expected => {}
            Ok(head) => {
                return FinalizeOutcome::Fatal(format!(
                    "Worktree HEAD {} does not match last checkpoint {}",
                    head, expected
                ))
            }
            Err(e) => return FinalizeOutcome::Fatal(e),
        }
    }

    let strategy = match config.completion.sync_strategy {
        SyncStrategy::Rebase => Strategy::Rebase,
        SyncStrategy::Merge => Strategy::Merge,
    };
    match git::sync(&path, &base, strategy) {
        SyncOutcome::Ok => {}
        SyncOutcome::Conflict(files) => return FinalizeOutcome::Conflict { files },
        SyncOutcome::Fatal(e) => return FinalizeOutcome::Fatal(e),
    }

    match git::push("origin", &branch, true, &path) {
        PushOutcome::Ok => {}
        // Remote advanced under us: same handling as a sync conflict
        PushOutcome::NonFastForward => {
            return FinalizeOutcome::Conflict {
                files: vec![format!("push rejected for {}", branch)],
            }
        }
        PushOutcome::Fatal(e) => {
            return FinalizeOutcome::Fatal(format!("{} (retryable: check remote)", e))
        }
    }

    let opts = PrOptions {
        branch: branch.clone(),
        target_branch: base,
        title: task.title.clone(),
        body: build_pr_body(task),
        draft: task.pr_draft || config.completion.pr_draft,
        labels: merged_list(&config.completion.pr_labels, &task.pr_labels),
        reviewers: merged_list(&config.completion.pr_reviewers, &task.pr_reviewers),
    };

    let pr_url = match host.create_pr(repo_root, &opts) {
        PrOutcome::Created(url) => url,
        PrOutcome::Exists(url) => {
            log_info!("[{}] PR already exists, reusing {}", task.id, url);
            url
        }
        PrOutcome::Fatal(e) => return FinalizeOutcome::Fatal(e),
    };

    if config.worktree.cleanup_on_complete {
        if let Err(e) = git::remove_worktree(&path, repo_root) {
            log_warn!("[{}] Failed to clean worktree: {}", task.id, e);
        }
    }

    FinalizeOutcome::Ok { pr_url }
}

/// PR body templated from the task's spec text and phase summaries.
pub fn build_pr_body(task: &Task) -> String {
    let mut sections = Vec::new();

    if let Some(ref description) = task.description {
        sections.push(description.clone());
    }
    if let Some(ref spec) = task.inline_spec {
        sections.push(format!("## Specification\n\n{}", spec));
    }

    let mut summary_lines = Vec::new();
    for state in task.execution.phases.values() {
        if let Some(ref notes) = state.notes {
            summary_lines.push(format!("- **{}**: {}", state.phase, notes));
        }
    }
    if !summary_lines.is_empty() {
        sections.push(format!("## Phase summary\n\n{}", summary_lines.join("\n")));
    }

    sections.push(format!("Automated by orc for {}.", task.id));
    sections.join("\n\n")
}

fn merged_list(base: &[String], extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = base.to_vec();
    for item in extra {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Format the blocked_error metadata value for a sync conflict.
pub fn format_blocked_error(files: &[String]) -> String {
    format!("Sync conflict with target branch [{}]", files.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_uses_prefix_unless_overridden() {
        let config = OrcConfig::default();
        let mut task = Task::new("TASK-007", "t");
        assert_eq!(branch_name_for(&task, &config), "orc/TASK-007");

        task.branch_name = Some("fix/login".to_string());
        assert_eq!(branch_name_for(&task, &config), "fix/login");
    }

    #[test]
    fn worktree_path_is_partitioned_by_task() {
        let config = OrcConfig::default();
        let task = Task::new("TASK-007", "t");
        let path = worktree_path_for(&task, &config, Path::new("/repo"));
        assert_eq!(path, Path::new("/repo/.orc/worktrees/orc-TASK-007"));
    }

    #[test]
    fn base_branch_resolution_order() {
        let completion = CompletionConfig {
            target_branch: "develop".to_string(),
            ..CompletionConfig::default()
        };
        let developer = DeveloperConfig {
            staging_enabled: true,
            staging_branch: Some("staging/me".to_string()),
        };
        let initiative = Initiative {
            id: "INIT-1".to_string(),
            branch_base: Some("init-base".to_string()),
            ..Initiative::default()
        };
        let mut task = Task::new("TASK-001", "t");
        task.target_branch = Some("task-target".to_string());

        assert_eq!(
            resolve_base_branch(&task, Some(&initiative), &developer, &completion),
            "task-target"
        );

        task.target_branch = None;
        assert_eq!(
            resolve_base_branch(&task, Some(&initiative), &developer, &completion),
            "init-base"
        );

        assert_eq!(
            resolve_base_branch(&task, None, &developer, &completion),
            "staging/me"
        );

        let developer_off = DeveloperConfig::default();
        assert_eq!(
            resolve_base_branch(&task, None, &developer_off, &completion),
            "develop"
        );

        let completion_empty = CompletionConfig::default();
        assert_eq!(
            resolve_base_branch(&task, None, &developer_off, &completion_empty),
            "main"
        );
    }

    #[test]
    fn checkpoint_message_strips_duplicate_prefix() {
        assert_eq!(
            build_checkpoint_message("TASK-001", "implement", None),
            "[TASK-001][implement] Phase output"
        );
        assert_eq!(
            build_checkpoint_message("TASK-001", "implement", Some("Add login form")),
            "[TASK-001][implement] Add login form"
        );
        assert_eq!(
            build_checkpoint_message(
                "TASK-001",
                "implement",
                Some("[TASK-001][implement] Add login form")
            ),
            "[TASK-001][implement] Add login form"
        );
        assert_eq!(
            build_checkpoint_message("TASK-001", "implement", Some("[TASK-002][spec] Other")),
            "[TASK-001][implement] [TASK-002][spec] Other"
        );
    }

    #[test]
    fn blocked_error_format_lists_files() {
        assert_eq!(
            format_blocked_error(&["a.txt".to_string(), "b.txt".to_string()]),
            "Sync conflict with target branch [a.txt b.txt]"
        );
    }

    #[test]
    fn pr_body_includes_spec_and_summaries() {
        let mut task = Task::new("TASK-001", "t");
        task.description = Some("Fix the login flow".to_string());
        task.inline_spec = Some("Users can log in with email".to_string());
        let mut state = crate::types::PhaseState::new("implement");
        state.notes = Some("implemented login".to_string());
        task.execution
            .phases
            .insert("implement".to_string(), state);

        let body = build_pr_body(&task);
        assert!(body.contains("Fix the login flow"));
        assert!(body.contains("## Specification"));
        assert!(body.contains("**implement**: implemented login"));
        assert!(body.contains("TASK-001"));
    }
}
