use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use orc::agent::{
    install_signal_handlers, is_pause_requested, is_shutdown_requested, kill_all_children,
    CliAgentRunner,
};
use orc::config::{self, OrcConfig};
use orc::error::OrcError;
use orc::executor::ExecutorContext;
use orc::gate;
use orc::host::GhCliProvider;
use orc::log::parse_log_level;
use orc::preflight;
use orc::scheduler::{self, RunParams};
use orc::store::Store;
use orc::tasks::{self, META_BLOCKED_ERROR, META_PENDING_GATE};
use orc::types::{parse_priority, parse_weight, Initiative, Task, TaskStatus};
use orc::workflow::WorkflowRegistry;
use orc::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(name = "orc", about = "Local orchestrator for AI coding agents")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/orc.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the orc database and config
    Init,
    /// Add a new task
    Add {
        /// Task title
        title: String,
        /// Weight estimate (trivial, small, medium, large, greenfield)
        #[arg(short, long)]
        weight: Option<String>,
        /// Priority (critical, high, normal, low)
        #[arg(short, long)]
        priority: Option<String>,
        /// Workflow id (defaults to "default")
        #[arg(long)]
        workflow: Option<String>,
        /// Longer description
        #[arg(short, long)]
        description: Option<String>,
        /// Task ids this task is blocked by (repeatable)
        #[arg(long, action = clap::ArgAction::Append)]
        blocked_by: Vec<String>,
    },
    /// List tasks
    List,
    /// Show one task in detail
    Show {
        task_id: String,
    },
    /// Run the orchestrator until tasks settle
    Run {
        /// Target specific task ids (repeatable); failed targets are resumed
        #[arg(long, action = clap::ArgAction::Append)]
        target: Vec<String>,
    },
    /// Approve a pending human gate
    Approve {
        task_id: String,
    },
    /// Reject a pending human gate
    Reject {
        task_id: String,
        /// Rejection reason
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear a sync-conflict block after resolving it manually
    Unblock {
        task_id: String,
    },
    /// Mark a failed task resolved
    Resolve {
        task_id: String,
        /// Resolve from any status, bypassing the transition check
        #[arg(long)]
        force: bool,
    },
    /// Delete a task and its records
    Delete {
        task_id: String,
    },
    /// Edit a task's blockers
    Deps {
        task_id: String,
        /// Add blockers (repeatable)
        #[arg(long, action = clap::ArgAction::Append)]
        add: Vec<String>,
        /// Remove blockers (repeatable)
        #[arg(long, action = clap::ArgAction::Append)]
        rm: Vec<String>,
    },
    /// Change a task's weight (resets execution state)
    Weight {
        task_id: String,
        weight: String,
    },
    /// List or clear execution claims
    Claims {
        /// Force-release the claim on this task id
        #[arg(long)]
        clear: Option<String>,
    },
    /// Manage initiatives
    Initiative {
        #[command(subcommand)]
        command: InitiativeCommands,
    },
}

#[derive(Subcommand)]
enum InitiativeCommands {
    Create {
        id: String,
        title: String,
        #[arg(long)]
        branch_base: Option<String>,
    },
    Link {
        task_id: String,
        initiative_id: String,
    },
    Unlink {
        task_id: String,
    },
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => orc::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }

    let root = cli.root.clone();
    let config = match config::load_config_from(cli.config.as_deref(), &root) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let code = match run_command(cli, root, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run_command(cli: Cli, root: PathBuf, config: OrcConfig) -> Result<i32, OrcError> {
    match cli.command {
        Commands::Init => handle_init(&root, &config).await,
        Commands::Add {
            title,
            weight,
            priority,
            workflow,
            description,
            blocked_by,
        } => {
            let store = open_store(&root, &config).await?;
            handle_add(
                &store, &config, &title, weight, priority, workflow, description, blocked_by,
            )
            .await
        }
        Commands::List => {
            let store = open_store(&root, &config).await?;
            handle_list(&store).await
        }
        Commands::Show { task_id } => {
            let store = open_store(&root, &config).await?;
            handle_show(&store, &config, &task_id).await
        }
        Commands::Run { target } => handle_run(&root, config, target).await,
        Commands::Approve { task_id } => {
            let store = open_store(&root, &config).await?;
            handle_approve(&store, &config, &task_id).await
        }
        Commands::Reject { task_id, reason } => {
            let store = open_store(&root, &config).await?;
            handle_reject(&store, &config, &task_id, reason).await
        }
        Commands::Unblock { task_id } => {
            let store = open_store(&root, &config).await?;
            handle_unblock(&store, &task_id).await
        }
        Commands::Resolve { task_id, force } => {
            let store = open_store(&root, &config).await?;
            handle_resolve(&store, &task_id, force).await
        }
        Commands::Delete { task_id } => {
            let store = open_store(&root, &config).await?;
            store.delete_task(&task_id).await?;
            log_info!("Deleted {}", task_id);
            Ok(0)
        }
        Commands::Deps { task_id, add, rm } => {
            let store = open_store(&root, &config).await?;
            handle_deps(&store, &task_id, add, rm).await
        }
        Commands::Weight { task_id, weight } => {
            let store = open_store(&root, &config).await?;
            handle_weight(&store, &task_id, &weight).await
        }
        Commands::Claims { clear } => {
            let store = open_store(&root, &config).await?;
            handle_claims(&store, clear).await
        }
        Commands::Initiative { command } => {
            let store = open_store(&root, &config).await?;
            handle_initiative(&store, command).await
        }
    }
}

async fn open_store(root: &Path, config: &OrcConfig) -> Result<Store, OrcError> {
    Store::open(&root.join(&config.project.db_path)).await
}

async fn handle_init(root: &Path, config: &OrcConfig) -> Result<i32, OrcError> {
    orc::git::is_git_repo(root)
        .map_err(|_| OrcError::InvalidInput("Not a git repository. Run `git init` first.".into()))?;

    // Opening creates .orc/ and the database
    let _store = open_store(root, config).await?;

    let config_path = root.join("orc.toml");
    if !config_path.exists() {
        let contents = r#"[project]
prefix = "TASK"
# db_path = ".orc/orc.db"

[execution]
max_concurrent = 4
poll_interval_secs = 2
phase_timeout_minutes = 30
retry_budget = 3
agent_grace_period_secs = 10

[worktree]
dir = ".orc/worktrees"
branch_prefix = "orc/"
cleanup_on_complete = true

[completion]
# target_branch = "main"
sync_strategy = "rebase"
pr_draft = false

[agent]
# cli = "claude"          # AI CLI tool: "claude", "opencode"
# model = ""              # Model override (e.g., "opus", "sonnet")

# [gates]
# phase_overrides = { review = "human" }

# Workflows default to: spec -> tdd_write -> implement -> review -> docs
# [workflows.custom]
# phases = [
#     { id = "spec", gate = "auto" },
#     { id = "implement", retry_from = "spec" },
#     { id = "review", gate = "human", checkpoint = false },
# ]
"#;
        fs::write(&config_path, contents)
            .map_err(|e| OrcError::Fatal(format!("write {}: {}", config_path.display(), e)))?;
        log_info!("Created {}", config_path.display());
    }

    // Keep orchestrator state out of version control
    let gitignore_path = root.join(".gitignore");
    let entry = ".orc/";
    let existing = fs::read_to_string(&gitignore_path).unwrap_or_default();
    if !existing.lines().any(|l| l.trim() == entry) {
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(entry);
        contents.push('\n');
        fs::write(&gitignore_path, contents)
            .map_err(|e| OrcError::Fatal(format!("write {}: {}", gitignore_path.display(), e)))?;
        log_info!("Added {} to .gitignore", entry);
    }

    log_info!("Initialized orc in {}", root.display());
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
async fn handle_add(
    store: &Store,
    config: &OrcConfig,
    title: &str,
    weight: Option<String>,
    priority: Option<String>,
    workflow: Option<String>,
    description: Option<String>,
    blocked_by: Vec<String>,
) -> Result<i32, OrcError> {
    let mut task = Task::new("", title);
    if let Some(w) = weight {
        task.weight = parse_weight(&w).map_err(OrcError::InvalidInput)?;
    }
    if let Some(p) = priority {
        task.priority = parse_priority(&p).map_err(OrcError::InvalidInput)?;
    }
    if let Some(wf) = workflow {
        task.workflow_id = wf;
    }
    task.description = description;
    task.status = TaskStatus::Planned;

    if !blocked_by.is_empty() {
        let all = store.load_all_tasks().await?;
        for dep in &blocked_by {
            if !all.iter().any(|t| t.id == *dep) {
                return Err(OrcError::NotFound(format!("task {}", dep)));
            }
        }
        tasks::detect_cycle("", &blocked_by, &all)?;
        task.blocked_by = blocked_by;
    }

    store.create_task(&mut task, &config.project.prefix).await?;
    println!("{}", task.id);
    Ok(0)
}

async fn handle_list(store: &Store) -> Result<i32, OrcError> {
    let all = store.load_all_tasks().await?;
    if all.is_empty() {
        println!("No tasks.");
        return Ok(0);
    }
    for task in &all {
        let blockers = if task.blocked_by.is_empty() {
            String::new()
        } else {
            format!("  blocked_by: {}", task.blocked_by.join(", "))
        };
        println!(
            "{:<10} {:<11} {:<10} {:<8} {}{}",
            task.id,
            task.status,
            task.weight,
            task.priority.as_str(),
            task.title,
            blockers
        );
    }
    Ok(0)
}

async fn handle_show(store: &Store, config: &OrcConfig, task_id: &str) -> Result<i32, OrcError> {
    let task = store.load_task(task_id).await?;
    let registry = WorkflowRegistry::from_config(config);

    println!("{}  {}", task.id, task.title);
    println!("  status:    {}", task.status);
    println!("  weight:    {}", task.weight);
    println!("  priority:  {}", task.priority.as_str());
    println!("  workflow:  {}", task.workflow_id);
    if let Some(ref initiative) = task.initiative_id {
        println!("  initiative: {}", initiative);
    }
    if !task.blocked_by.is_empty() {
        println!("  blocked_by: {}", task.blocked_by.join(", "));
    }
    let all = store.load_all_tasks().await?;
    let blocks = tasks::blocks_index(&all);
    if let Some(blocked) = blocks.get(&task.id) {
        println!("  blocks:    {}", blocked.join(", "));
    }
    for (key, value) in &task.metadata {
        println!("  {}: {}", key, value);
    }

    if let Some(ref current) = task.execution.current_phase {
        println!("  current phase: {}", current);
    }
    if let Some(ref error) = task.execution.error {
        println!("  error: {}", error);
    }

    let workflow = registry.get(&task.workflow_id);
    if !task.execution.phases.is_empty() {
        println!("  phases:");
        for state in task.execution.phases.values() {
            let orphan = match workflow {
                Some(wf) if wf.phase(&state.phase).is_none() => " (orphan)",
                None => " (orphan)",
                _ => "",
            };
            let sha = state
                .commit_sha
                .as_deref()
                .map(|s| format!(" @{}", &s[..s.len().min(8)]))
                .unwrap_or_default();
            println!(
                "    {:<12} {:<10} iterations={}{}{}",
                state.phase,
                state.status.as_str(),
                state.iterations,
                sha,
                orphan
            );
        }
    }

    let decisions = store.list_gate_decisions(&task.id).await?;
    if !decisions.is_empty() {
        println!("  gate decisions:");
        for d in &decisions {
            println!(
                "    {:<12} {:<6} approved={} source={}{}",
                d.phase,
                d.gate.as_str(),
                d.approved,
                d.source,
                d.reason
                    .as_deref()
                    .map(|r| format!(" ({})", r))
                    .unwrap_or_default()
            );
        }
    }

    let transcripts = store.get_transcripts(&task.id).await?;
    if !transcripts.is_empty() {
        let input: u64 = transcripts.iter().map(|t| t.input_tokens).sum();
        let output: u64 = transcripts.iter().map(|t| t.output_tokens).sum();
        println!(
            "  transcript: {} entries, {} input tokens, {} output tokens",
            transcripts.len(),
            input,
            output
        );
    }

    Ok(0)
}

async fn handle_run(root: &Path, config: OrcConfig, targets: Vec<String>) -> Result<i32, OrcError> {
    install_signal_handlers().map_err(OrcError::Fatal)?;

    let store = open_store(root, &config).await?;
    let report = preflight::run_preflight(root, &config, &store).await;
    if !report.ok() {
        log_error!("Preflight failed:\n{}", report.render());
        return Err(OrcError::Fatal("preflight checks failed".into()));
    }
    log_info!("Preflight:\n{}", report.render());

    let registry = Arc::new(WorkflowRegistry::from_config(&config));
    let runner = Arc::new(CliAgentRunner::new(config.agent.cli.clone()));
    let grace = Duration::from_secs(config.execution.agent_grace_period_secs);
    let ctx = Arc::new(ExecutorContext {
        store,
        registry,
        config: Arc::new(config),
        runner,
        host: Arc::new(GhCliProvider),
        repo_root: root.to_path_buf(),
    });

    let cancel = CancellationToken::new();

    // Bridge process signals into structured cancellation
    let signal_cancel = cancel.clone();
    let signal_watch = tokio::spawn(async move {
        loop {
            if is_shutdown_requested() || is_pause_requested() {
                signal_cancel.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let summary = scheduler::run_scheduler(
        Arc::clone(&ctx),
        RunParams {
            targets: targets.clone(),
        },
        cancel.clone(),
    )
    .await?;

    signal_watch.abort();
    kill_all_children(grace);

    log_info!(
        "Run finished ({:?}): {} completed, {} blocked, {} failed, {} interrupted",
        summary.halt_reason,
        summary.tasks_completed.len(),
        summary.tasks_blocked.len(),
        summary.tasks_failed.len(),
        summary.tasks_interrupted.len()
    );

    // Exit code reflects the targets the caller asked about
    if !targets.is_empty() {
        if targets.iter().any(|t| summary.tasks_failed.contains(t)) {
            return Ok(5);
        }
        if targets.iter().any(|t| summary.tasks_blocked.contains(t)) {
            return Ok(4);
        }
    } else {
        if !summary.tasks_failed.is_empty() {
            return Ok(5);
        }
        if !summary.tasks_blocked.is_empty() {
            return Ok(4);
        }
    }
    Ok(0)
}

async fn handle_approve(store: &Store, config: &OrcConfig, task_id: &str) -> Result<i32, OrcError> {
    let mut task = store.load_task(task_id).await?;
    let Some(phase) = task.metadata.get(META_PENDING_GATE).cloned() else {
        return Err(OrcError::InvalidInput(format!(
            "Task {} has no pending human gate",
            task_id
        )));
    };

    let registry = WorkflowRegistry::from_config(config);
    let template = registry
        .get(&task.workflow_id)
        .and_then(|wf| wf.phase(&phase).cloned());
    let resolution = gate::resolve(&phase, Some(&task), template.as_ref(), &config.gates);

    let decision = gate::record(&phase, resolution, true, None);
    store.append_gate_decision(&task.id, &decision).await?;

    task.metadata.remove(META_PENDING_GATE);
    store.save_task(&mut task).await?;
    log_info!("[{}] Gate {} approved", task_id, phase);
    Ok(0)
}

async fn handle_reject(
    store: &Store,
    config: &OrcConfig,
    task_id: &str,
    reason: Option<String>,
) -> Result<i32, OrcError> {
    let task = store.load_task(task_id).await?;
    let Some(phase) = task.metadata.get(META_PENDING_GATE).cloned() else {
        return Err(OrcError::InvalidInput(format!(
            "Task {} has no pending human gate",
            task_id
        )));
    };

    let registry = WorkflowRegistry::from_config(config);
    let template = registry
        .get(&task.workflow_id)
        .and_then(|wf| wf.phase(&phase).cloned());
    let resolution = gate::resolve(&phase, Some(&task), template.as_ref(), &config.gates);

    let decision = gate::record(
        &phase,
        resolution,
        false,
        reason.or_else(|| Some("rejected by operator".to_string())),
    );
    store.append_gate_decision(&task.id, &decision).await?;
    log_info!("[{}] Gate {} rejected", task_id, phase);
    Ok(0)
}

async fn handle_unblock(store: &Store, task_id: &str) -> Result<i32, OrcError> {
    let mut task = store.load_task(task_id).await?;
    if task.status != TaskStatus::Blocked {
        return Err(OrcError::InvalidInput(format!(
            "Task {} is not blocked (status: {})",
            task_id, task.status
        )));
    }
    if task.metadata.remove(META_BLOCKED_ERROR).is_none() {
        log_warn!("Task {} had no recorded block error", task_id);
    }
    store.save_task(&mut task).await?;
    log_info!("[{}] Unblocked", task_id);
    Ok(0)
}

async fn handle_resolve(store: &Store, task_id: &str, force: bool) -> Result<i32, OrcError> {
    let mut task = store.load_task(task_id).await?;
    task.transition_status(TaskStatus::Resolved, force)?;
    store.save_task(&mut task).await?;
    log_info!("[{}] Resolved", task_id);
    Ok(0)
}

async fn handle_deps(
    store: &Store,
    task_id: &str,
    add: Vec<String>,
    rm: Vec<String>,
) -> Result<i32, OrcError> {
    if add.is_empty() && rm.is_empty() {
        let task = store.load_task(task_id).await?;
        if task.blocked_by.is_empty() {
            println!("No blockers.");
        } else {
            for dep in &task.blocked_by {
                println!("{}", dep);
            }
        }
        return Ok(0);
    }

    let all = store.load_all_tasks().await?;
    let mut task = store.load_task(task_id).await?;

    let mut blockers = task.blocked_by.clone();
    blockers.retain(|b| !rm.contains(b));
    for dep in add {
        if !all.iter().any(|t| t.id == dep) {
            return Err(OrcError::NotFound(format!("task {}", dep)));
        }
        if !blockers.contains(&dep) {
            blockers.push(dep);
        }
    }

    tasks::set_blocked_by(&mut task, blockers, &all)?;
    store.save_task(&mut task).await?;
    log_info!("[{}] Blockers updated", task_id);
    Ok(0)
}

async fn handle_weight(store: &Store, task_id: &str, weight: &str) -> Result<i32, OrcError> {
    let weight = parse_weight(weight).map_err(OrcError::InvalidInput)?;
    let mut task = store.load_task(task_id).await?;
    tasks::change_weight(&mut task, weight)?;
    store.save_task(&mut task).await?;
    log_info!("[{}] Weight set to {} — execution state reset", task_id, weight);
    Ok(0)
}

async fn handle_claims(store: &Store, clear: Option<String>) -> Result<i32, OrcError> {
    if let Some(task_id) = clear {
        store.release_claim(&task_id).await?;
        log_info!("[{}] Claim cleared", task_id);
        return Ok(0);
    }

    let claims = store.list_claims().await?;
    if claims.is_empty() {
        println!("No claims.");
        return Ok(0);
    }
    for claim in &claims {
        let alive = if orc::store::pid_alive(claim.pid) {
            "alive"
        } else {
            "dead"
        };
        println!(
            "{:<10} pid={} ({}) host={} acquired={}",
            claim.task_id,
            claim.pid,
            alive,
            claim.hostname,
            claim.acquired_at.to_rfc3339()
        );
    }
    Ok(0)
}

async fn handle_initiative(store: &Store, command: InitiativeCommands) -> Result<i32, OrcError> {
    match command {
        InitiativeCommands::Create {
            id,
            title,
            branch_base,
        } => {
            let initiative = Initiative {
                id: id.clone(),
                title,
                branch_base,
                ..Initiative::default()
            };
            store.upsert_initiative(&initiative).await?;
            println!("{}", id);
        }
        InitiativeCommands::Link {
            task_id,
            initiative_id,
        } => {
            store.link_task_to_initiative(&task_id, &initiative_id).await?;
            log_info!("[{}] Linked to {}", task_id, initiative_id);
        }
        InitiativeCommands::Unlink { task_id } => {
            store.unlink_task_from_initiative(&task_id).await?;
            log_info!("[{}] Unlinked", task_id);
        }
        InitiativeCommands::List => {
            let initiatives = store.list_initiatives().await?;
            if initiatives.is_empty() {
                println!("No initiatives.");
            }
            for initiative in &initiatives {
                println!(
                    "{:<10} {} ({} tasks)",
                    initiative.id,
                    initiative.title,
                    initiative.tasks.len()
                );
            }
        }
    }
    Ok(0)
}
