use std::path::Path;
use std::process::Command;

/// Options for opening a pull request after finalize.
#[derive(Debug, Clone, Default)]
pub struct PrOptions {
    pub branch: String,
    pub target_branch: String,
    pub title: String,
    pub body: String,
    pub draft: bool,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

/// Outcome of a PR create attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PrOutcome {
    /// Created; URL of the new PR.
    Created(String),
    /// A PR already exists for this branch; treated as success upstream.
    Exists(String),
    Fatal(String),
}

/// Narrow interface onto the hosting provider (GitHub/GitLab). The core
/// consumes exactly three operations.
pub trait HostProvider: Send + Sync {
    fn create_pr(&self, repo_dir: &Path, opts: &PrOptions) -> PrOutcome;
    fn get_pr(&self, repo_dir: &Path, branch: &str) -> Result<Option<String>, String>;
    fn pr_merged(&self, repo_dir: &Path, url: &str) -> Result<bool, String>;
}

/// Provider backed by the `gh` CLI.
pub struct GhCliProvider;

impl GhCliProvider {
    pub fn verify_available() -> Result<(), String> {
        let output = Command::new("gh")
            .args(["--version"])
            .output()
            .map_err(|e| format!("gh not found on PATH. Install: https://cli.github.com ({})", e))?;
        if !output.status.success() {
            return Err("gh found but `gh --version` failed".to_string());
        }
        Ok(())
    }
}

impl HostProvider for GhCliProvider {
    fn create_pr(&self, repo_dir: &Path, opts: &PrOptions) -> PrOutcome {
        let mut args: Vec<String> = vec![
            "pr".to_string(),
            "create".to_string(),
            "--head".to_string(),
            opts.branch.clone(),
            "--base".to_string(),
            opts.target_branch.clone(),
            "--title".to_string(),
            opts.title.clone(),
            "--body".to_string(),
            opts.body.clone(),
        ];
        if opts.draft {
            args.push("--draft".to_string());
        }
        for label in &opts.labels {
            args.push("--label".to_string());
            args.push(label.clone());
        }
        for reviewer in &opts.reviewers {
            args.push("--reviewer".to_string());
            args.push(reviewer.clone());
        }

        let output = match Command::new("gh").args(&args).current_dir(repo_dir).output() {
            Ok(o) => o,
            Err(e) => return PrOutcome::Fatal(format!("Failed to run gh pr create: {}", e)),
        };

        if output.status.success() {
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return PrOutcome::Created(url);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            // Reuse the existing PR's URL
            match self.get_pr(repo_dir, &opts.branch) {
                Ok(Some(url)) => return PrOutcome::Exists(url),
                Ok(None) => {
                    return PrOutcome::Fatal(
                        "gh reported an existing PR but none was found".to_string(),
                    )
                }
                Err(e) => return PrOutcome::Fatal(e),
            }
        }

        PrOutcome::Fatal(format!("gh pr create failed: {}", stderr.trim()))
    }

    fn get_pr(&self, repo_dir: &Path, branch: &str) -> Result<Option<String>, String> {
        let output = Command::new("gh")
            .args(["pr", "view", branch, "--json", "url", "--jq", ".url"])
            .current_dir(repo_dir)
            .output()
            .map_err(|e| format!("Failed to run gh pr view: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no pull requests found") {
                return Ok(None);
            }
            return Err(format!("gh pr view failed: {}", stderr.trim()));
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if url.is_empty() {
            Ok(None)
        } else {
            Ok(Some(url))
        }
    }

    fn pr_merged(&self, repo_dir: &Path, url: &str) -> Result<bool, String> {
        let output = Command::new("gh")
            .args(["pr", "view", url, "--json", "state", "--jq", ".state"])
            .current_dir(repo_dir)
            .output()
            .map_err(|e| format!("Failed to run gh pr view: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("gh pr view failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim() == "MERGED")
    }
}

/// Mock provider for finalize tests. Returns a canned outcome and records
/// the options it was called with.
pub struct MockHostProvider {
    outcome: std::sync::Mutex<Vec<PrOutcome>>,
    pub calls: std::sync::Mutex<Vec<PrOptions>>,
}

impl MockHostProvider {
    /// Outcomes are returned in order; the last one repeats.
    pub fn new(outcomes: Vec<PrOutcome>) -> Self {
        let mut reversed = outcomes;
        reversed.reverse();
        Self {
            outcome: std::sync::Mutex::new(reversed),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl HostProvider for MockHostProvider {
    fn create_pr(&self, _repo_dir: &Path, opts: &PrOptions) -> PrOutcome {
        self.calls.lock().unwrap().push(opts.clone());
        let mut outcomes = self.outcome.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop().unwrap()
        } else {
            outcomes
                .last()
                .cloned()
                .unwrap_or(PrOutcome::Created("https://example.test/pr/1".to_string()))
        }
    }

    fn get_pr(&self, _repo_dir: &Path, _branch: &str) -> Result<Option<String>, String> {
        Ok(None)
    }

    fn pr_merged(&self, _repo_dir: &Path, _url: &str) -> Result<bool, String> {
        Ok(false)
    }
}
