mod common;

use std::fs;

use tempfile::TempDir;

use orc::config::{self, SyncStrategy};
use orc::gate;
use orc::types::{GateSource, GateType, TaskStatus, Weight};
use orc::workflow::WorkflowRegistry;

use common::make_task;

const FULL_CONFIG: &str = r#"
[project]
prefix = "ORC"
db_path = ".orc/state.db"

[execution]
max_concurrent = 2
poll_interval_secs = 5
phase_timeout_minutes = 45
retry_budget = 1
agent_grace_period_secs = 15

[gates]
phase_overrides = { review = "human", docs = "skip" }

[worktree]
dir = ".orc/trees"
branch_prefix = "work/"
cleanup_on_complete = false

[completion]
target_branch = "develop"
sync_strategy = "merge"
pr_draft = true
pr_labels = ["orc"]
pr_reviewers = ["octocat"]

[agent]
cli = "claude"
model = "opus"

[workflows.feature]
phases = [
    { id = "spec", gate = "auto" },
    { id = "implement", retry_from = "spec", max_iterations = 4 },
    { id = "review", gate = "ai", checkpoint = false },
]
"#;

fn write_config(contents: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("orc.toml"), contents).unwrap();
    dir
}

#[test]
fn full_config_parses() {
    let dir = write_config(FULL_CONFIG);
    let config = config::load_config(dir.path()).unwrap();

    assert_eq!(config.project.prefix, "ORC");
    assert_eq!(config.execution.max_concurrent, 2);
    assert_eq!(config.execution.retry_budget, 1);
    assert_eq!(config.worktree.branch_prefix, "work/");
    assert_eq!(config.completion.sync_strategy, SyncStrategy::Merge);
    assert!(config.completion.pr_draft);
    assert_eq!(config.agent.model.as_deref(), Some("opus"));
    assert_eq!(
        config.gates.phase_overrides.get("review").map(String::as_str),
        Some("human")
    );
}

#[test]
fn declared_workflow_materializes_with_templates() {
    let dir = write_config(FULL_CONFIG);
    let config = config::load_config(dir.path()).unwrap();
    let registry = WorkflowRegistry::from_config(&config);

    let feature = registry.get("feature").unwrap();
    assert_eq!(feature.phases.len(), 3);

    let spec = feature.phase("spec").unwrap();
    assert_eq!(spec.gate, Some(GateType::Auto));
    assert!(spec.checkpoint);

    let implement = feature.phase("implement").unwrap();
    assert_eq!(implement.retry_from.as_deref(), Some("spec"));
    assert_eq!(implement.max_iterations, Some(4));
    assert_eq!(implement.effective_max_iterations(Weight::Small), 4);

    let review = feature.phase("review").unwrap();
    assert_eq!(review.gate, Some(GateType::Ai));
    assert!(!review.checkpoint);

    // The built-in default is still present
    assert!(registry.get("default").is_some());
}

#[test]
fn missing_config_yields_defaults() {
    let dir = TempDir::new().unwrap();
    let config = config::load_config(dir.path()).unwrap();
    assert_eq!(config.project.prefix, "TASK");
    assert_eq!(config.execution.max_concurrent, 4);
    assert_eq!(config.execution.poll_interval_secs, 2);
    assert_eq!(config.execution.retry_budget, 3);
    assert_eq!(config.execution.agent_grace_period_secs, 10);
    assert_eq!(config.worktree.branch_prefix, "orc/");
    assert_eq!(config.completion.sync_strategy, SyncStrategy::Rebase);

    let registry = WorkflowRegistry::from_config(&config);
    let default = registry.get("default").unwrap();
    let ids: Vec<&str> = default.phases.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["spec", "tdd_write", "implement", "review", "docs"]);
}

#[test]
fn explicit_config_path_must_exist() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = config::load_config_from(Some(&missing), dir.path()).unwrap_err();
    assert!(err.contains("not found"));
}

#[test]
fn invalid_gate_override_collected() {
    let dir = write_config(
        r#"
[gates]
phase_overrides = { review = "maybe" }
"#,
    );
    let err = config::load_config(dir.path()).unwrap_err();
    assert!(err.contains("invalid gate type 'maybe'"));
}

#[test]
fn duplicate_phase_ids_collected() {
    let dir = write_config(
        r#"
[workflows.bad]
phases = [
    { id = "spec" },
    { id = "spec" },
]
"#,
    );
    let err = config::load_config(dir.path()).unwrap_err();
    assert!(err.contains("duplicate phase id 'spec'"));
}

#[test]
fn config_override_feeds_gate_resolution() {
    let dir = write_config(FULL_CONFIG);
    let config = config::load_config(dir.path()).unwrap();
    let registry = WorkflowRegistry::from_config(&config);
    let template = registry.get("feature").unwrap().phase("review").unwrap().clone();

    // Config says human for `review` even though the workflow declares ai
    let resolution = gate::resolve("review", None, Some(&template), &config.gates);
    assert_eq!(resolution.gate, GateType::Human);
    assert_eq!(resolution.source, GateSource::PhaseOverride);

    // Task metadata still outranks the config
    let mut task = make_task("TASK-001", TaskStatus::Planned);
    task.metadata
        .insert(gate::override_key("review"), "skip".to_string());
    let resolution = gate::resolve("review", Some(&task), Some(&template), &config.gates);
    assert_eq!(resolution.gate, GateType::Skip);
    assert_eq!(resolution.source, GateSource::TaskOverride);
}
