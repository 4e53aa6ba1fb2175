use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CliTool;
use crate::types::{AgentResult, TranscriptEntry, TranscriptRole};
use crate::{log_debug, log_warn};

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Global pause flag set by SIGUSR1: running phases are marked pending,
/// tasks move to paused, and the process exits cleanly.
fn pause_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

pub fn is_pause_requested() -> bool {
    pause_flag().load(Ordering::Relaxed)
}

/// Install handlers for SIGTERM/SIGINT (cooperative shutdown) and SIGUSR1
/// (pause request).
///
/// Call once at program startup. Subsequent calls are safe (re-registers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(pause_flag()))
        .map_err(|e| format!("Failed to register SIGUSR1 handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered PGIDs, waits for the grace period,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children(grace: Duration) {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + grace;
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

// --- Invocation ---

/// Everything an agent invocation receives. The agent is free to mutate
/// files under `working_dir`; the core assumes nothing about its internals.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: String,
    pub phase: String,
    pub iteration: u32,
    pub model: Option<String>,
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Where the agent writes its terminal result JSON.
    pub result_path: PathBuf,
    pub timeout: Duration,
    /// SIGTERM-to-SIGKILL grace when the invocation is stopped.
    pub grace: Duration,
}

/// Trait for running agents. Enables mocking in executor and scheduler tests.
pub trait AgentRunner: Send + Sync {
    /// Run one phase invocation. Transcript records are sent on `transcripts`
    /// as the agent produces them; the terminal outcome is the return value.
    fn run_agent(
        &self,
        invocation: &AgentInvocation,
        transcripts: mpsc::Sender<TranscriptEntry>,
        cancel: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<AgentResult, String>> + Send;
}

/// Real implementation that spawns a CLI agent as a subprocess.
pub struct CliAgentRunner {
    pub tool: CliTool,
}

impl CliAgentRunner {
    pub fn new(tool: CliTool) -> Self {
        Self { tool }
    }

    /// Verify that the configured CLI tool is available on PATH.
    pub fn verify_cli_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(self.tool.binary_name())
            .args(self.tool.version_args())
            .output()
            .map_err(|e| {
                format!(
                    "{} not found on PATH. {} ({})",
                    self.tool.display_name(),
                    self.tool.install_hint(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "{} found but `{} {}` failed",
                self.tool.display_name(),
                self.tool.binary_name(),
                self.tool.version_args().join(" ")
            ));
        }

        Ok(())
    }
}

impl AgentRunner for CliAgentRunner {
    async fn run_agent(
        &self,
        invocation: &AgentInvocation,
        transcripts: mpsc::Sender<TranscriptEntry>,
        cancel: &CancellationToken,
    ) -> Result<AgentResult, String> {
        let mut cmd = tokio::process::Command::new(self.tool.binary_name());
        cmd.args(
            self.tool
                .build_args(&invocation.prompt, invocation.model.as_deref()),
        );
        cmd.current_dir(&invocation.working_dir);
        run_subprocess_agent(cmd, invocation, transcripts, cancel).await
    }
}

/// Spawn a subprocess agent, stream its stdout as transcript records,
/// enforce timeout and cancellation, read the result file.
///
/// This is the shared implementation used by both `CliAgentRunner` and test
/// runners. The caller configures the `Command` (program, args, env); this
/// function handles process group isolation, streaming, timeout, signal
/// checking, and result parsing.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    invocation: &AgentInvocation,
    transcripts: mpsc::Sender<TranscriptEntry>,
    cancel: &CancellationToken,
) -> Result<AgentResult, String> {
    let result_path = &invocation.result_path;

    if let Some(parent) = result_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }

    // Delete stale result file if it exists (unconditional to avoid TOCTOU)
    match tokio::fs::remove_file(result_path).await {
        Ok(()) => log_warn!(
            "Warning: Stale result file found at {}, deleted",
            result_path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {} // expected
        Err(e) => {
            return Err(format!(
                "Failed to remove stale result file {}: {}",
                result_path.display(),
                e
            ))
        }
    }

    // stdin MUST be null: with setpgid the child is in a background process
    // group, and any attempt to read from the terminal would cause SIGTTIN
    // (silent stop). stdout is piped for transcript streaming.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is async-signal-safe
    // per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    log_debug!("[agent] Spawning subprocess...");
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    log_debug!("[agent] Subprocess spawned (pid={})", child_pid);

    register_child(pgid);

    // Second concurrent producer: drain stdout into transcript records while
    // the main future waits on the child.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture subprocess stdout".to_string())?;
    let stream_task = tokio::spawn(stream_transcripts(
        stdout,
        invocation.task_id.clone(),
        invocation.phase.clone(),
        invocation.model.clone(),
        transcripts,
    ));

    log_debug!(
        "[agent] Waiting (timeout={}s)...",
        invocation.timeout.as_secs()
    );

    let waited = tokio::select! {
        result = tokio::time::timeout(invocation.timeout, child.wait()) => result,
        _ = cancel.cancelled() => {
            log_debug!("[agent] Cancelled — stopping process group");
            kill_process_group(child_pid, invocation.grace).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            stream_task.abort();
            return Err("Cancelled".to_string());
        }
    };

    let exit_status = match waited {
        Err(_) => {
            log_debug!(
                "[agent] TIMEOUT after {}s — killing process group",
                invocation.timeout.as_secs()
            );
            kill_process_group(child_pid, invocation.grace).await;
            let _ = child.wait().await;
            unregister_child(pgid);
            stream_task.abort();
            return Err(format!(
                "Agent timed out after {} seconds",
                invocation.timeout.as_secs()
            ));
        }
        Ok(result) => result.map_err(|e| format!("Error waiting for subprocess: {}", e))?,
    };

    log_debug!("[agent] Subprocess exited (status={:?})", exit_status.code());
    unregister_child(pgid);

    // Let the streaming task finish flushing already-produced entries
    let _ = stream_task.await;

    if is_shutdown_requested() {
        kill_process_group(child_pid, invocation.grace).await;
        let _ = child.wait().await;
        return Err("Shutdown requested".to_string());
    }

    let agent_result = read_result_file(result_path).await;

    match (exit_status.success(), agent_result) {
        (true, Ok(result)) => {
            cleanup_result_file(result_path).await;
            Ok(result)
        }
        (false, Ok(result)) => {
            log_warn!("Warning: Agent exited with non-zero status but produced valid result");
            cleanup_result_file(result_path).await;
            Ok(result)
        }
        (_, Err(e)) => {
            let exit_info = if exit_status.success() {
                "zero exit".to_string()
            } else {
                format!("exit code {:?}", exit_status.code())
            };
            Err(format!("Agent failed ({}): {}", exit_info, e))
        }
    }
}

/// Raw shape of one stdout JSONL line from the agent CLI. Only the fields
/// the transcript schema needs; everything else rides along in `content`.
#[derive(serde::Deserialize)]
struct RawTranscriptLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_tokens: u64,
    #[serde(default)]
    cache_write_tokens: u64,
    #[serde(default)]
    content: serde_json::Value,
}

async fn stream_transcripts(
    stdout: tokio::process::ChildStdout,
    task_id: String,
    phase: String,
    default_model: Option<String>,
    transcripts: mpsc::Sender<TranscriptEntry>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawTranscriptLine = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(_) => {
                log_debug!("[agent] Skipping non-transcript stdout line");
                continue;
            }
        };
        let role = match raw.kind.as_str() {
            "user" => TranscriptRole::User,
            "assistant" => TranscriptRole::Assistant,
            _ => continue, // system/result lines are not transcript records
        };
        let entry = TranscriptEntry {
            task_id: task_id.clone(),
            phase: phase.clone(),
            id: 0, // assigned by the store on append
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            role,
            model: raw.model.or_else(|| default_model.clone()),
            input_tokens: raw.input_tokens,
            output_tokens: raw.output_tokens,
            cache_read_tokens: raw.cache_read_tokens,
            cache_write_tokens: raw.cache_write_tokens,
            content: raw.content,
        };
        if transcripts.send(entry).await.is_err() {
            return; // consumer gone, stop draining
        }
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL
/// after the grace period.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32, grace: Duration) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return; // already gone
        }

        let deadline = std::time::Instant::now() + grace;
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending one
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Read and validate an agent result JSON file.
pub async fn read_result_file(path: &Path) -> Result<AgentResult, String> {
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            format!("Result file not found: {}", path.display())
        } else {
            format!("Failed to read result file {}: {}", path.display(), e)
        }
    })?;

    let result: AgentResult = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse result JSON from {}: {}", path.display(), e))?;

    Ok(result)
}

async fn cleanup_result_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log_warn!(
            "Warning: Failed to clean up result file {}: {}",
            path.display(),
            e
        );
    }
}

/// Mock agent runner for executor and scheduler tests.
///
/// Returns predefined results from a configurable sequence. Each call to
/// `run_agent` returns the next result; an optional transcript entry is
/// streamed first so consumers see the producer side too.
pub struct MockAgentRunner {
    results: tokio::sync::Mutex<Vec<Result<AgentResult, String>>>,
    emit_transcripts: bool,
}

impl MockAgentRunner {
    /// Results are returned in order (first call gets first result, etc.).
    pub fn new(results: Vec<Result<AgentResult, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
            emit_transcripts: false,
        }
    }

    /// Also emit one assistant transcript entry per invocation.
    pub fn with_transcripts(mut self) -> Self {
        self.emit_transcripts = true;
        self
    }
}

impl AgentRunner for MockAgentRunner {
    async fn run_agent(
        &self,
        invocation: &AgentInvocation,
        transcripts: mpsc::Sender<TranscriptEntry>,
        _cancel: &CancellationToken,
    ) -> Result<AgentResult, String> {
        if self.emit_transcripts {
            let entry = TranscriptEntry {
                task_id: invocation.task_id.clone(),
                phase: invocation.phase.clone(),
                id: 0,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
                role: TranscriptRole::Assistant,
                model: invocation.model.clone(),
                input_tokens: 10,
                output_tokens: 20,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
                content: serde_json::json!({"text": "mock output"}),
            };
            let _ = transcripts.send(entry).await;
        }
        let mut results = self.results.lock().await;
        results
            .pop()
            .unwrap_or_else(|| Err("MockAgentRunner: no more results in sequence".to_string()))
    }
}
