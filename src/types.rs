use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Created,
    Classifying,
    Planned,
    Running,
    Paused,
    Blocked,
    Finalizing,
    Completed,
    Failed,
    Resolved,
}

impl TaskStatus {
    /// Validates whether a transition from this status to `to` is allowed.
    ///
    /// Rules:
    /// - Classification: Created -> Classifying, and Created/Classifying -> Planned
    /// - Claim + dispatch: Planned/Paused/Blocked/Failed -> Running
    /// - While running: Running -> Running (next phase), Blocked (human gate),
    ///   Paused (pause signal), Finalizing (last phase done), Failed
    /// - Finalize: Finalizing -> Completed, Blocked (sync conflict), Failed
    /// - Operator: Failed -> Resolved
    /// - Weight change: anything not Running/Finalizing -> Planned
    pub fn is_valid_transition(&self, to: &TaskStatus) -> bool {
        use TaskStatus::*;

        // Weight change re-plans any task that is not mid-execution
        if *to == Planned && !matches!(self, Running | Finalizing) {
            return true;
        }

        matches!(
            (self, to),
            (Created, Classifying)
                | (Planned | Paused | Blocked | Failed, Running)
                | (Running, Running)
                | (Running, Blocked)
                | (Running, Paused)
                | (Running, Finalizing)
                | (Finalizing, Completed)
                | (Finalizing, Blocked)
                | (Running | Finalizing, Failed)
                | (Failed, Resolved)
        )
    }

    /// Terminal statuses satisfy dependency edges in `blocked_by`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Classifying => "classifying",
            TaskStatus::Planned => "planned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Finalizing => "finalizing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse a task status string, tolerating historical on-disk forms.
pub fn parse_task_status(s: &str) -> Result<TaskStatus, String> {
    match s.to_lowercase().as_str() {
        "created" | "new" => Ok(TaskStatus::Created),
        "classifying" | "scoping" => Ok(TaskStatus::Classifying),
        "planned" | "ready" => Ok(TaskStatus::Planned),
        "running" | "in_progress" => Ok(TaskStatus::Running),
        "paused" => Ok(TaskStatus::Paused),
        "blocked" => Ok(TaskStatus::Blocked),
        "finalizing" => Ok(TaskStatus::Finalizing),
        "completed" | "done" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "resolved" => Ok(TaskStatus::Resolved),
        _ => Err(format!(
            "Invalid status '{}': expected created, classifying, planned, running, paused, \
             blocked, finalizing, completed, failed, or resolved",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
    Blocked,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Blocked => "blocked",
        }
    }
}

pub fn parse_phase_status(s: &str) -> Result<PhaseStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(PhaseStatus::Pending),
        "running" => Ok(PhaseStatus::Running),
        "completed" | "done" => Ok(PhaseStatus::Completed),
        "skipped" => Ok(PhaseStatus::Skipped),
        "failed" => Ok(PhaseStatus::Failed),
        "blocked" => Ok(PhaseStatus::Blocked),
        _ => Err(format!(
            "Invalid phase status '{}': expected pending, running, completed, skipped, \
             failed, or blocked",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    Small,
    #[default]
    Medium,
    Large,
    Greenfield,
}

impl Weight {
    /// Default iteration cap per phase, overridable on the phase template.
    pub fn default_max_iterations(&self) -> u32 {
        match self {
            Weight::Trivial | Weight::Small => 1,
            Weight::Medium => 2,
            Weight::Large => 3,
            Weight::Greenfield => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Weight::Trivial => "trivial",
            Weight::Small => "small",
            Weight::Medium => "medium",
            Weight::Large => "large",
            Weight::Greenfield => "greenfield",
        }
    }
}

impl std::fmt::Display for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn parse_weight(s: &str) -> Result<Weight, String> {
    match s.to_lowercase().as_str() {
        "trivial" => Ok(Weight::Trivial),
        "small" | "s" => Ok(Weight::Small),
        "medium" | "m" => Ok(Weight::Medium),
        "large" | "l" => Ok(Weight::Large),
        "greenfield" => Ok(Weight::Greenfield),
        _ => Err(format!(
            "Invalid weight '{}': expected trivial, small, medium, large, or greenfield",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Higher value dispatches first.
    pub fn sort_value(&self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

pub fn parse_priority(s: &str) -> Result<Priority, String> {
    match s.to_lowercase().as_str() {
        "critical" => Ok(Priority::Critical),
        "high" | "h" => Ok(Priority::High),
        "normal" | "n" => Ok(Priority::Normal),
        "low" | "l" => Ok(Priority::Low),
        _ => Err(format!(
            "Invalid priority '{}': expected critical, high, normal, or low",
            s
        )),
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    #[default]
    Auto,
    Human,
    Ai,
    Skip,
}

impl GateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateType::Auto => "auto",
            GateType::Human => "human",
            GateType::Ai => "ai",
            GateType::Skip => "skip",
        }
    }
}

pub fn parse_gate_type(s: &str) -> Result<GateType, String> {
    match s.to_lowercase().as_str() {
        "auto" => Ok(GateType::Auto),
        "human" => Ok(GateType::Human),
        "ai" => Ok(GateType::Ai),
        "skip" => Ok(GateType::Skip),
        _ => Err(format!(
            "Invalid gate type '{}': expected auto, human, ai, or skip",
            s
        )),
    }
}

/// Where the effective gate for a phase came from. Machine-readable label
/// used by the CLI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSource {
    TaskOverride,
    PhaseOverride,
    Workflow,
    Default,
}

impl GateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateSource::TaskOverride => "task_override",
            GateSource::PhaseOverride => "phase_override",
            GateSource::Workflow => "workflow",
            GateSource::Default => "default",
        }
    }
}

/// Terminal outcome reported by the agent collaborator for one invocation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Ok,
    NeedsRetry,
    Failed,
}

/// Result file the agent writes when an invocation terminates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AgentResult {
    pub task_id: String,
    pub phase: String,
    pub outcome: AgentOutcome,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_summary: Option<String>,
}

/// Outcome of driving one task through its phases, returned by the executor
/// to the scheduler, which applies the corresponding status transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Blocked(String),
    Failed(String),
    Interrupted,
}

// --- Execution state ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PhaseState {
    pub phase: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PhaseState {
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryContext {
    pub from_phase: String,
    pub reason: String,
}

/// Per-task execution bookkeeping, embedded in the task record and persisted
/// with it. Reset by weight change; otherwise mutated only by the claim
/// holder's executor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ExecutionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_context: Option<RetryContext>,
    /// Retries consumed via retry_from rewinds (bounded by the task budget).
    #[serde(default)]
    pub retries_used: u32,
}

impl ExecutionState {
    pub fn phase_state(&self, phase: &str) -> Option<&PhaseState> {
        self.phases.get(phase)
    }

    pub fn phase_state_mut(&mut self, phase: &str) -> &mut PhaseState {
        self.phases
            .entry(phase.to_string())
            .or_insert_with(|| PhaseState::new(phase))
    }
}

// --- Records ---

/// Immutable gate decision record, appended after every phase end.
///
/// `source` is the machine-readable label of where the effective gate came
/// from (`task_override`, `phase_override`, `workflow`, `default`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GateDecision {
    pub phase: String,
    pub gate: GateType,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRole {
    User,
    Assistant,
}

impl TranscriptRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptRole::User => "user",
            TranscriptRole::Assistant => "assistant",
        }
    }
}

pub fn parse_transcript_role(s: &str) -> Result<TranscriptRole, String> {
    match s {
        "user" => Ok(TranscriptRole::User),
        "assistant" => Ok(TranscriptRole::Assistant),
        _ => Err(format!(
            "Invalid transcript role '{}': expected user or assistant",
            s
        )),
    }
}

/// Append-only transcript record produced while a phase runs.
///
/// `id` is assigned by the store, monotonic per task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TranscriptEntry {
    pub task_id: String,
    pub phase: String,
    #[serde(default)]
    pub id: i64,
    pub timestamp_ms: i64,
    pub role: TranscriptRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    pub content: serde_json::Value,
}

/// Lease identifying the sole writer of a task. At most one per task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Claim {
    pub task_id: String,
    pub pid: i32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

// --- Workflow ---

/// Read-only template for one phase of a workflow.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseTemplate {
    pub id: String,
    pub name: String,
    /// Gate declared by the workflow author; `None` falls back to `auto`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_from: Option<String>,
    #[serde(default = "default_agent_id")]
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Whether completing this phase records a checkpoint commit.
    #[serde(default = "default_true")]
    pub checkpoint: bool,
}

fn default_agent_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl PhaseTemplate {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            gate: None,
            retry_from: None,
            agent: default_agent_id(),
            max_iterations: None,
            model: None,
            checkpoint: true,
        }
    }

    /// Effective iteration cap: template override, else the weight default.
    pub fn effective_max_iterations(&self, weight: Weight) -> u32 {
        self.max_iterations
            .unwrap_or_else(|| weight.default_max_iterations())
    }
}

/// Named ordered sequence of phase templates a task traverses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Workflow {
    pub id: String,
    pub phases: Vec<PhaseTemplate>,
}

impl Workflow {
    pub fn phase(&self, id: &str) -> Option<&PhaseTemplate> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }
}

// --- Initiative ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct InitiativeTask {
    pub task_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Grouping of tasks. The core only reads it for base-branch resolution and
/// updates the task list on link/unlink.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Initiative {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub vision: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<InitiativeTask>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_base: Option<String>,
}

// --- Task ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub weight: Weight,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
    /// Ordered set of task ids this task waits on. Kept acyclic.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
    #[serde(default)]
    pub pr_draft: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pr_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pr_reviewers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_spec: Option<String>,
    #[serde(default)]
    pub execution: ExecutionState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_workflow_id() -> String {
    "default".to_string()
}

impl Task {
    pub fn new(id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            workflow_id: default_workflow_id(),
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    /// Bump `updated_at`, keeping it strictly monotonic even when the clock
    /// resolution is coarser than two consecutive saves.
    ///
    /// Called by the store on save; in-memory mutators leave `updated_at`
    /// alone so the compare-and-swap against the loaded value still matches.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }

    /// Apply a validated status transition. Rejects pairs outside the
    /// status machine unless `force` is set (operator resolve).
    pub fn transition_status(&mut self, to: TaskStatus, force: bool) -> Result<(), crate::error::OrcError> {
        if !force && !self.status.is_valid_transition(&to) {
            return Err(crate::error::OrcError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Validate a task id: `{PREFIX}-{NNN}` with a non-empty alphanumeric prefix.
pub fn is_valid_task_id(id: &str) -> bool {
    match id.rsplit_once('-') {
        Some((prefix, num)) => {
            !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                && !num.is_empty()
                && num.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
