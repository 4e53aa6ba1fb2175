use std::path::Path;

use crate::agent::CliAgentRunner;
use crate::config::OrcConfig;
use crate::git;
use crate::store::Store;

/// A single preflight check result.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl CheckResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: None,
        }
    }

    fn fail(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: Some(detail),
        }
    }
}

/// Report of all preflight checks. `run` refuses to start unless `ok()`.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn render(&self) -> String {
        self.checks
            .iter()
            .map(|c| {
                if c.passed {
                    format!("  ok   {}", c.name)
                } else {
                    format!(
                        "  FAIL {} — {}",
                        c.name,
                        c.detail.as_deref().unwrap_or("unknown")
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Run every check the orchestrator depends on before dispatching tasks:
/// a git repository at the root, the agent CLI on PATH, and a reachable
/// store. Config validity is established earlier by the loader; its
/// presence here is the loaded value itself.
pub async fn run_preflight(root: &Path, config: &OrcConfig, store: &Store) -> PreflightReport {
    let mut report = PreflightReport::default();

    report.checks.push(match git::is_git_repo(root) {
        Ok(()) => CheckResult::pass("git repository"),
        Err(e) => CheckResult::fail("git repository", e),
    });

    let runner = CliAgentRunner::new(config.agent.cli.clone());
    report.checks.push(match runner.verify_cli_available() {
        Ok(()) => CheckResult::pass("agent CLI"),
        Err(e) => CheckResult::fail("agent CLI", e),
    });

    report.checks.push(match store.load_all_tasks().await {
        Ok(_) => CheckResult::pass("store"),
        Err(e) => CheckResult::fail("store", e.to_string()),
    });

    report
}
