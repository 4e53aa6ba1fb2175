use std::path::Path;
use std::process::Command;

/// Outcome of syncing a task branch against its target branch.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Ok,
    /// Conflicting file names, as reported by the unmerged index.
    Conflict(Vec<String>),
    Fatal(String),
}

/// Outcome of pushing a task branch.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Ok,
    NonFastForward,
    Fatal(String),
}

/// Strategy for applying target-branch changes before finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Rebase,
    Merge,
}

/// Validate a branch name before handing it to git.
///
/// Rejects whitespace, a leading dash, and path separators other than `/`.
/// `..` is rejected because git refuses it anyway and the error is clearer
/// here.
pub fn validate_branch_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Branch name is empty".to_string());
    }
    if name.starts_with('-') {
        return Err(format!("Branch name '{}' must not start with '-'", name));
    }
    if name.chars().any(|c| c.is_whitespace()) {
        return Err(format!("Branch name '{}' must not contain whitespace", name));
    }
    if name.contains('\\') {
        return Err(format!(
            "Branch name '{}' must not contain path separators other than '/'",
            name
        ));
    }
    if name.contains("..") {
        return Err(format!("Branch name '{}' must not contain '..'", name));
    }
    Ok(())
}

/// Verify only that a git repository exists in the given directory.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

pub fn branch_exists(branch: &str, repo_dir: &Path) -> Result<bool, String> {
    validate_branch_name(branch)?;
    let mut cmd = Command::new("git");
    cmd.args([
        "show-ref",
        "--verify",
        "--quiet",
        &format!("refs/heads/{}", branch),
    ]);
    cmd.current_dir(repo_dir);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git show-ref: {}", e))?;
    Ok(output.status.success())
}

pub fn create_branch(branch: &str, base: &str, repo_dir: &Path) -> Result<(), String> {
    validate_branch_name(branch)?;
    validate_branch_name(base)?;
    run_git_command(&["branch", branch, base], repo_dir)?;
    Ok(())
}

pub fn create_worktree(path: &Path, branch: &str, repo_dir: &Path) -> Result<(), String> {
    validate_branch_name(branch)?;
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;
    run_git_command(&["worktree", "add", path_str, branch], repo_dir)?;
    Ok(())
}

pub fn remove_worktree(path: &Path, repo_dir: &Path) -> Result<(), String> {
    let path_str = path
        .to_str()
        .ok_or_else(|| format!("Worktree path contains invalid UTF-8: {:?}", path))?;
    run_git_command(&["worktree", "remove", "--force", path_str], repo_dir)?;
    Ok(())
}

/// The branch a worktree has checked out, from `git branch --show-current`.
pub fn current_branch(worktree: &Path) -> Result<String, String> {
    let output = run_git_command(&["branch", "--show-current"], worktree)?;
    Ok(output.trim().to_string())
}

pub fn is_clean(worktree: &Path) -> Result<bool, String> {
    let output = run_git_command(&["status", "--porcelain"], worktree)?;
    Ok(output.trim().is_empty())
}

/// Stage everything and commit. Returns the new HEAD sha.
pub fn commit(worktree: &Path, message: &str) -> Result<String, String> {
    run_git_command(&["add", "-A"], worktree)?;
    run_git_command(&["commit", "-m", message], worktree)?;
    head_sha(worktree)
}

/// Returns the full 40-character SHA of HEAD.
pub fn head_sha(worktree: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], worktree)?;
    Ok(output.trim().to_string())
}

/// Checks whether `sha` is an ancestor of the worktree's HEAD.
///
/// Uses `git merge-base --is-ancestor`:
/// - Exit 0 → true
/// - Exit 1 → false
/// - Exit 128 → Err (unknown commit / other git error)
pub fn is_ancestor(sha: &str, worktree: &Path) -> Result<bool, String> {
    if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid SHA: '{}'", sha));
    }

    let mut cmd = Command::new("git");
    cmd.args(["merge-base", "--is-ancestor", sha, "HEAD"]);
    cmd.current_dir(worktree);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git merge-base: {}", e))?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git merge-base failed: {}", stderr.trim()))
        }
    }
}

/// Apply target-branch changes onto the worktree's branch.
///
/// On conflict, the unmerged file list is collected and the operation is
/// aborted so the worktree is left usable.
pub fn sync(worktree: &Path, base: &str, strategy: Strategy) -> SyncOutcome {
    if let Err(e) = validate_branch_name(base) {
        return SyncOutcome::Fatal(e);
    }

    let (args, abort_args): (&[&str], &[&str]) = match strategy {
        Strategy::Rebase => (&["rebase", base], &["rebase", "--abort"]),
        Strategy::Merge => (&["merge", "--no-edit", base], &["merge", "--abort"]),
    };

    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.current_dir(worktree);

    let output = match cmd.output() {
        Ok(o) => o,
        Err(e) => return SyncOutcome::Fatal(format!("Failed to run git {}: {}", args[0], e)),
    };

    if output.status.success() {
        return SyncOutcome::Ok;
    }

    let files = match unmerged_files(worktree) {
        Ok(files) => files,
        Err(e) => return SyncOutcome::Fatal(e),
    };

    if files.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return SyncOutcome::Fatal(format!("git {} failed: {}", args[0], stderr.trim()));
    }

    // Leave the worktree on its own branch, not mid-rebase
    let mut abort = Command::new("git");
    abort.args(abort_args);
    abort.current_dir(worktree);
    let _ = abort.output();

    SyncOutcome::Conflict(files)
}

fn unmerged_files(worktree: &Path) -> Result<Vec<String>, String> {
    let output = run_git_command(&["diff", "--name-only", "--diff-filter=U"], worktree)?;
    let mut files: Vec<String> = output
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect();
    files.sort();
    Ok(files)
}

/// Push the branch to the remote with lease semantics: remote history from
/// an origin we have not seen is never clobbered.
pub fn push(remote: &str, branch: &str, with_lease: bool, worktree: &Path) -> PushOutcome {
    if let Err(e) = validate_branch_name(branch) {
        return PushOutcome::Fatal(e);
    }

    let lease = "--force-with-lease".to_string();
    let mut args = vec!["push"];
    if with_lease {
        args.push(&lease);
    }
    args.push(remote);
    args.push(branch);

    let mut cmd = Command::new("git");
    cmd.args(&args);
    cmd.current_dir(worktree);

    let output = match cmd.output() {
        Ok(o) => o,
        Err(e) => return PushOutcome::Fatal(format!("Failed to run git push: {}", e)),
    };

    if output.status.success() {
        return PushOutcome::Ok;
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("non-fast-forward") || stderr.contains("stale info") {
        PushOutcome::NonFastForward
    } else {
        PushOutcome::Fatal(format!("git push failed: {}", stderr.trim()))
    }
}

/// Run a git command and return its stdout as a string.
fn run_git_command(args: &[&str], repo_dir: &Path) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    cmd.current_dir(repo_dir);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
