use crate::types::TaskStatus;

/// Error enum for orchestrator failures, grouped by how callers react.
///
/// Categories:
/// - Caller mistakes: surfaced, never retried (`InvalidInput`, `NotFound`,
///   `InvalidTransition`)
/// - Contention: another writer holds the task (`AlreadyClaimed`, `Stale`)
/// - Execution: the agent or finalize protocol failed; retry per policy
///   (`AgentFailed`, `SyncConflict`)
/// - Fatal: unrecoverable external failure, task marked failed
/// - Interrupted: cancellation observed; not an error to the operator
#[derive(Debug, thiserror::Error)]
pub enum OrcError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task already claimed by pid {pid} on {hostname}")]
    AlreadyClaimed { pid: i32, hostname: String },

    #[error("Stale save for {0}: store has a newer version, reload and retry")]
    Stale(String),

    #[error("Agent failed: {0}")]
    AgentFailed(String),

    #[error("Sync conflict in [{}]", .files.join(" "))]
    SyncConflict { files: Vec<String> },

    #[error("Task {0} has no workflow phases")]
    NoWorkflow(String),

    #[error("Phase {0} has no checkpoint commit to rewind to")]
    NoCheckpoint(String),

    #[error("Worktree unavailable: {0}")]
    WorktreeUnavailable(String),

    #[error("Git error: {0}")]
    Git(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Interrupted")]
    Interrupted,
}

impl OrcError {
    /// Returns true if the error is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrcError::Stale(_) | OrcError::AgentFailed(_))
    }

    /// Returns true if the error is unrecoverable for the current task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OrcError::Fatal(_) | OrcError::Store(_))
    }

    /// Map an error to the CLI exit code contract.
    ///
    /// 0 success, 1 general failure, 2 invalid arguments, 3 task not found,
    /// 4 gate blocked, 5 execution failed. `Interrupted` exits 0: a clean
    /// shutdown is not a failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrcError::InvalidInput(_) | OrcError::InvalidTransition { .. } => 2,
            OrcError::NotFound(_) => 3,
            OrcError::SyncConflict { .. } => 4,
            OrcError::AgentFailed(_)
            | OrcError::NoWorkflow(_)
            | OrcError::WorktreeUnavailable(_) => 5,
            OrcError::Interrupted => 0,
            _ => 1,
        }
    }
}

/// Transitional bridge: allows `?` to convert `OrcError` to `String` in the
/// CLI handlers, which report errors as plain messages.
impl From<OrcError> for String {
    fn from(err: OrcError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(OrcError::InvalidInput("x".into()).exit_code(), 2);
        assert_eq!(OrcError::NotFound("TASK-001".into()).exit_code(), 3);
        assert_eq!(
            OrcError::SyncConflict {
                files: vec!["a.txt".into()]
            }
            .exit_code(),
            4
        );
        assert_eq!(OrcError::AgentFailed("boom".into()).exit_code(), 5);
        assert_eq!(OrcError::Fatal("disk".into()).exit_code(), 1);
        assert_eq!(OrcError::Interrupted.exit_code(), 0);
    }

    #[test]
    fn sync_conflict_message_lists_files() {
        let err = OrcError::SyncConflict {
            files: vec!["a.txt".into(), "b.txt".into()],
        };
        assert_eq!(err.to_string(), "Sync conflict in [a.txt b.txt]");
    }

    #[test]
    fn retryable_and_fatal_are_disjoint() {
        let stale = OrcError::Stale("TASK-001".into());
        assert!(stale.is_retryable());
        assert!(!stale.is_fatal());

        let fatal = OrcError::Fatal("remote unreachable".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_retryable());
    }
}
