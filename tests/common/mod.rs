#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

use orc::config::OrcConfig;
use orc::store::Store;
use orc::types::{
    AgentOutcome, AgentResult, PhaseTemplate, Task, TaskStatus, Weight, Workflow,
};

/// Creates a `Task` with minimal defaults.
///
/// All optional fields are `None`, collections empty, weight `Medium`. The
/// title is auto-generated as `"Test task {id}"`.
pub fn make_task(id: &str, status: TaskStatus) -> Task {
    let mut task = Task::new(id, &format!("Test task {}", id));
    task.status = status;
    task
}

/// Creates a planned task with the given weight.
pub fn make_weighted_task(id: &str, weight: Weight) -> Task {
    let mut task = make_task(id, TaskStatus::Planned);
    task.weight = weight;
    task
}

/// Creates a workflow from bare phase ids, every template at its defaults
/// (gate undeclared, checkpoint on).
pub fn make_workflow(id: &str, phases: &[&str]) -> Workflow {
    Workflow {
        id: id.to_string(),
        phases: phases.iter().map(|p| PhaseTemplate::new(p)).collect(),
    }
}

/// Creates an in-memory store for tests.
pub async fn test_store() -> Store {
    Store::open_in_memory().await.expect("open in-memory store")
}

/// Creates a file-backed store inside a tempdir, returned with its guard.
pub async fn file_store() -> (Store, TempDir) {
    let dir = TempDir::new().expect("create tempdir");
    let store = Store::open(&dir.path().join("orc.db"))
        .await
        .expect("open file store");
    (store, dir)
}

/// An `ok` agent result for the given task/phase.
pub fn ok_result(task_id: &str, phase: &str) -> Result<AgentResult, String> {
    Ok(AgentResult {
        task_id: task_id.to_string(),
        phase: phase.to_string(),
        outcome: AgentOutcome::Ok,
        summary: format!("{} done", phase),
        reason: None,
        commit_summary: Some(format!("Complete {}", phase)),
    })
}

/// A `needs_retry` agent result.
pub fn retry_result(task_id: &str, phase: &str) -> Result<AgentResult, String> {
    Ok(AgentResult {
        task_id: task_id.to_string(),
        phase: phase.to_string(),
        outcome: AgentOutcome::NeedsRetry,
        summary: "not there yet".to_string(),
        reason: None,
        commit_summary: None,
    })
}

/// A `failed` agent result.
pub fn failed_result(task_id: &str, phase: &str, reason: &str) -> Result<AgentResult, String> {
    Ok(AgentResult {
        task_id: task_id.to_string(),
        phase: phase.to_string(),
        outcome: AgentOutcome::Failed,
        summary: reason.to_string(),
        reason: Some(reason.to_string()),
        commit_summary: None,
    })
}

pub fn git(args: &[&str], dir: &Path) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run git {:?}: {}", args, e));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Create a temporary git repository with an initial commit on `main`.
pub fn setup_temp_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path();

    git(&["init"], path);
    git(&["config", "user.email", "test@test.com"], path);
    git(&["config", "user.name", "Test"], path);

    fs::write(path.join("README.md"), "# Test\n").expect("Failed to write README");
    git(&["add", "README.md"], path);
    git(&["commit", "-m", "Initial commit"], path);
    git(&["branch", "-M", "main"], path);

    dir
}

/// Create a repo plus a bare `origin` remote it can push to.
pub fn setup_repo_with_origin() -> (TempDir, TempDir) {
    let repo = setup_temp_repo();
    let origin = TempDir::new().expect("Failed to create origin dir");

    git(&["init", "--bare"], origin.path());
    let origin_path = origin.path().to_str().expect("utf-8 origin path");
    git(&["remote", "add", "origin", origin_path], repo.path());
    git(&["push", "origin", "main"], repo.path());

    (repo, origin)
}

/// Commit a file change on the given branch of the repo's primary worktree.
pub fn commit_file(repo: &Path, branch: &str, file: &str, contents: &str, message: &str) {
    git(&["checkout", branch], repo);
    fs::write(repo.join(file), contents).expect("write file");
    git(&["add", file], repo);
    git(&["commit", "-m", message], repo);
}

/// Config wired for a test repo: in-repo worktree dir, `main` target,
/// cleanup off so tests can inspect the worktree afterwards.
pub fn test_config() -> OrcConfig {
    let mut config = OrcConfig::default();
    config.completion.target_branch = "main".to_string();
    config.worktree.cleanup_on_complete = false;
    config.execution.poll_interval_secs = 1;
    config
}

/// Absolute worktree path for a task under the given repo root.
pub fn worktree_path(repo: &Path, task_id: &str) -> PathBuf {
    repo.join(".orc/worktrees").join(format!("orc-{}", task_id))
}
