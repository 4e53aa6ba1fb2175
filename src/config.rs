use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::types::{parse_gate_type, PhaseTemplate, Workflow};

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct OrcConfig {
    pub project: ProjectConfig,
    pub execution: ExecutionConfig,
    pub gates: GatesConfig,
    pub worktree: WorktreeConfig,
    pub completion: CompletionConfig,
    pub agent: AgentConfig,
    pub developer: DeveloperConfig,
    pub workflows: HashMap<String, WorkflowConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Task id prefix (ids look like `TASK-001`).
    pub prefix: String,
    /// Database path relative to the project root.
    pub db_path: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            prefix: "TASK".to_string(),
            db_path: ".orc/orc.db".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent: u32,
    pub poll_interval_secs: u64,
    pub phase_timeout_minutes: u32,
    /// Per-task budget of retry_from rewinds.
    pub retry_budget: u32,
    /// Seconds between SIGTERM and SIGKILL when stopping an agent.
    pub agent_grace_period_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval_secs: 2,
            phase_timeout_minutes: 30,
            retry_budget: 3,
            agent_grace_period_secs: 10,
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatesConfig {
    /// Phase id -> gate type string, consulted between task-scoped metadata
    /// overrides and the workflow's declared gate.
    pub phase_overrides: HashMap<String, String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorktreeConfig {
    pub dir: String,
    pub branch_prefix: String,
    pub cleanup_on_complete: bool,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            dir: ".orc/worktrees".to_string(),
            branch_prefix: "orc/".to_string(),
            cleanup_on_complete: true,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    Rebase,
    Merge,
}

impl Default for SyncStrategy {
    fn default() -> Self {
        SyncStrategy::Rebase
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionConfig {
    /// Fallback target branch when neither the task nor its initiative nor
    /// the developer staging branch names one. Empty means `main`.
    pub target_branch: String,
    pub sync_strategy: SyncStrategy,
    pub pr_draft: bool,
    pub pr_labels: Vec<String>,
    pub pr_reviewers: Vec<String>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CliTool {
    #[default]
    Claude,
    OpenCode,
}

impl CliTool {
    pub fn binary_name(&self) -> &str {
        match self {
            CliTool::Claude => "claude",
            CliTool::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            CliTool::Claude => "Claude CLI",
            CliTool::OpenCode => "OpenCode CLI",
        }
    }

    pub fn build_args(&self, prompt: &str, model: Option<&str>) -> Vec<String> {
        match self {
            CliTool::Claude => {
                let mut args = vec![
                    "--dangerously-skip-permissions".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                ];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push("-p".to_string());
                args.push(prompt.to_string());
                args
            }
            CliTool::OpenCode => {
                let mut args = vec!["run".to_string(), "--print-logs".to_string()];
                if let Some(m) = model {
                    args.push("--model".to_string());
                    args.push(m.to_string());
                }
                args.push(prompt.to_string());
                args
            }
        }
    }

    pub fn version_args(&self) -> Vec<&str> {
        vec!["--version"]
    }

    pub fn install_hint(&self) -> &str {
        match self {
            CliTool::Claude => "Install: https://docs.anthropic.com/en/docs/claude-code",
            CliTool::OpenCode => "Install: https://github.com/opencode-ai/opencode",
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub cli: CliTool,
    pub model: Option<String>,
    /// Agent id invoked for `ai` gate reviews.
    pub reviewer: Option<String>,
}

/// Per-user staging preferences. Mirrors the global record at `~/.orc/orc.db`;
/// a local config entry overrides it.
#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DeveloperConfig {
    pub staging_enabled: bool,
    pub staging_branch: Option<String>,
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub phases: Vec<PhaseTemplateConfig>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseTemplateConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub retry_from: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub checkpoint: Option<bool>,
}

impl OrcConfig {
    /// Materialize the declared workflows as typed `Workflow` values.
    ///
    /// Assumes `validate()` has passed; unknown gate strings fall back to
    /// the template default rather than panicking.
    pub fn build_workflows(&self) -> HashMap<String, Workflow> {
        let mut out = HashMap::new();
        for (id, wf) in &self.workflows {
            let phases = wf
                .phases
                .iter()
                .map(|p| {
                    let mut template = PhaseTemplate::new(&p.id);
                    if let Some(ref name) = p.name {
                        template.name = name.clone();
                    }
                    if let Some(ref gate) = p.gate {
                        if let Ok(g) = parse_gate_type(gate) {
                            template.gate = Some(g);
                        }
                    }
                    template.retry_from = p.retry_from.clone();
                    if let Some(ref agent) = p.agent {
                        template.agent = agent.clone();
                    }
                    template.max_iterations = p.max_iterations;
                    template.model = p.model.clone();
                    if let Some(checkpoint) = p.checkpoint {
                        template.checkpoint = checkpoint;
                    }
                    template
                })
                .collect();
            out.insert(
                id.clone(),
                Workflow {
                    id: id.clone(),
                    phases,
                },
            );
        }
        out
    }
}

/// The workflow every repository gets when the config declares none.
pub fn default_workflow() -> Workflow {
    let phases = [
        ("spec", "Write specification"),
        ("tdd_write", "Write failing tests"),
        ("implement", "Implement to green"),
        ("review", "Review changes"),
        ("docs", "Update documentation"),
    ]
    .iter()
    .map(|(id, name)| {
        let mut t = PhaseTemplate::new(id);
        t.name = name.to_string();
        t
    })
    .collect();

    Workflow {
        id: "default".to_string(),
        phases,
    }
}

pub fn normalize_agent_config(config: &mut OrcConfig) {
    if let Some(ref model) = config.agent.model {
        let trimmed = model.trim();
        if trimmed.is_empty() {
            config.agent.model = None;
        } else {
            config.agent.model = Some(trimmed.to_string());
        }
    }
}

pub fn validate(config: &OrcConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.max_concurrent < 1 {
        errors.push("execution.max_concurrent must be >= 1".to_string());
    }

    if config.execution.poll_interval_secs < 1 {
        errors.push("execution.poll_interval_secs must be >= 1".to_string());
    }

    if !config
        .project
        .prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        || config.project.prefix.is_empty()
    {
        errors.push(
            "project.prefix must be non-empty alphanumeric (hyphens and underscores allowed)"
                .to_string(),
        );
    }

    if let Some(ref model) = config.agent.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "agent.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "agent.model must not start with '-' (flag-like values are rejected)".to_string(),
            );
        }
    }

    for (phase_id, gate) in &config.gates.phase_overrides {
        if parse_gate_type(gate).is_err() {
            errors.push(format!(
                "gates.phase_overrides.{}: invalid gate type '{}'",
                phase_id, gate
            ));
        }
    }

    for (workflow_id, workflow) in &config.workflows {
        if workflow.phases.is_empty() {
            errors.push(format!(
                "workflows.{}: must have at least one phase",
                workflow_id
            ));
        }

        let mut seen_ids = HashSet::new();
        for phase in &workflow.phases {
            if !seen_ids.insert(&phase.id) {
                errors.push(format!(
                    "workflows.{}: duplicate phase id '{}'",
                    workflow_id, phase.id
                ));
            }
            if let Some(ref gate) = phase.gate {
                if parse_gate_type(gate).is_err() {
                    errors.push(format!(
                        "workflows.{}: phase '{}' has invalid gate '{}'",
                        workflow_id, phase.id, gate
                    ));
                }
            }
        }

        // retry_from must name an earlier phase in the same workflow
        for (idx, phase) in workflow.phases.iter().enumerate() {
            if let Some(ref retry_from) = phase.retry_from {
                match workflow.phases.iter().position(|p| &p.id == retry_from) {
                    Some(target) if target <= idx => {}
                    Some(_) => errors.push(format!(
                        "workflows.{}: phase '{}' retry_from '{}' must be an earlier phase",
                        workflow_id, phase.id, retry_from
                    )),
                    None => errors.push(format!(
                        "workflows.{}: phase '{}' retry_from '{}' not in workflow",
                        workflow_id, phase.id, retry_from
                    )),
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/orc.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, a missing
/// `orc.toml` yields defaults.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<OrcConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

fn load_config_at(path: &Path) -> Result<OrcConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    parse_and_validate(&contents, path)
}

pub fn load_config(project_root: &Path) -> Result<OrcConfig, String> {
    let config_path = project_root.join("orc.toml");

    if !config_path.exists() {
        let mut config = OrcConfig::default();
        normalize_agent_config(&mut config);
        return Ok(config);
    }

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;
    parse_and_validate(&contents, &config_path)
}

fn parse_and_validate(contents: &str, path: &Path) -> Result<OrcConfig, String> {
    let mut config: OrcConfig = toml::from_str(contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    normalize_agent_config(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_workflow_has_five_phases() {
        let wf = default_workflow();
        let ids: Vec<&str> = wf.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["spec", "tdd_write", "implement", "review", "docs"]);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = OrcConfig::default();
        config.execution.max_concurrent = 0;
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_concurrent")));
    }

    #[test]
    fn validate_rejects_flag_like_model() {
        let mut config = OrcConfig::default();
        config.agent.model = Some("--model".to_string());
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("agent.model")));
    }

    #[test]
    fn validate_rejects_late_retry_from() {
        let mut config = OrcConfig::default();
        config.workflows.insert(
            "custom".to_string(),
            WorkflowConfig {
                phases: vec![
                    PhaseTemplateConfig {
                        id: "a".to_string(),
                        name: None,
                        gate: None,
                        retry_from: Some("b".to_string()),
                        agent: None,
                        max_iterations: None,
                        model: None,
                        checkpoint: None,
                    },
                    PhaseTemplateConfig {
                        id: "b".to_string(),
                        name: None,
                        gate: None,
                        retry_from: None,
                        agent: None,
                        max_iterations: None,
                        model: None,
                        checkpoint: None,
                    },
                ],
            },
        );
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("retry_from")));
    }

    #[test]
    fn normalize_trims_model() {
        let mut config = OrcConfig::default();
        config.agent.model = Some("  ".to_string());
        normalize_agent_config(&mut config);
        assert!(config.agent.model.is_none());

        config.agent.model = Some(" opus ".to_string());
        normalize_agent_config(&mut config);
        assert_eq!(config.agent.model.as_deref(), Some("opus"));
    }
}
