use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::OrcError;
use crate::types::{
    parse_gate_type, parse_transcript_role, Claim, GateDecision, Initiative, InitiativeTask, Task,
    TaskStatus, TranscriptEntry,
};

/// Predicate deciding whether a recorded claim pid is still alive on this
/// host. Injected so tests can simulate dead claimants.
pub type PidProbe = fn(i32) -> bool;

/// Probe a process with signal 0. EPERM means the process exists but belongs
/// to another user, which still counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The transactional store backing every core component.
///
/// One SQLite database per repository at `.orc/orc.db`. Tasks and
/// initiatives are stored as JSON records alongside the columns the store
/// itself needs for compare-and-swap and ordering; transcripts, gate
/// decisions, comments, and attachments are append-only tables; claims are
/// a single-row-per-task lease table whose primary key arbitrates races.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    pid_probe: PidProbe,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id         TEXT PRIMARY KEY,
    status     TEXT NOT NULL,
    record     TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_counter (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    next INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS transcripts (
    task_id            TEXT NOT NULL,
    id                 INTEGER NOT NULL,
    phase              TEXT NOT NULL,
    timestamp_ms       INTEGER NOT NULL,
    role               TEXT NOT NULL,
    model              TEXT,
    input_tokens       INTEGER NOT NULL DEFAULT 0,
    output_tokens      INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
    cache_write_tokens INTEGER NOT NULL DEFAULT 0,
    content            TEXT NOT NULL,
    PRIMARY KEY (task_id, id)
);

CREATE TABLE IF NOT EXISTS gate_decisions (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id   TEXT NOT NULL,
    phase     TEXT NOT NULL,
    gate      TEXT NOT NULL,
    approved  INTEGER NOT NULL,
    reason    TEXT,
    source    TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_gate_decisions_task ON gate_decisions (task_id, seq);

CREATE TABLE IF NOT EXISTS claims (
    task_id     TEXT PRIMARY KEY,
    pid         INTEGER NOT NULL,
    hostname    TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS initiatives (
    id         TEXT PRIMARY KEY,
    record     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS comments (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    author     TEXT NOT NULL,
    body       TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachments (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    TEXT NOT NULL,
    name       TEXT NOT NULL,
    path       TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

impl Store {
    /// Open (creating if missing) the repository database at `path`.
    ///
    /// `Synchronous::Full` so claim, phase-completion, and status
    /// transactions are fsynced before they are acknowledged.
    pub async fn open(path: &Path) -> Result<Self, OrcError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| OrcError::Fatal(format!("create {}: {}", parent.display(), e)))?;
            }
        }

        let url = format!("sqlite:{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| OrcError::Fatal(format!("invalid database path {}: {}", url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            pid_probe: pid_alive,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests. Single connection so the shared cache
    /// behaves like one database.
    pub async fn open_in_memory() -> Result<Self, OrcError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| OrcError::Fatal(format!("memory database: {}", e)))?
            .journal_mode(SqliteJournalMode::Memory)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            pid_probe: pid_alive,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Substitute the PID-aliveness predicate (tests).
    pub fn with_pid_probe(mut self, probe: PidProbe) -> Self {
        self.pid_probe = probe;
        self
    }

    async fn init_schema(&self) -> Result<(), OrcError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        sqlx::query("INSERT OR IGNORE INTO task_counter (id, next) VALUES (1, 0)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Tasks ---

    /// Insert a new task. When `task.id` is empty an id is allocated inside
    /// the same transaction, so ids stay gapless even if the process dies
    /// between allocation and insert.
    pub async fn create_task(&self, task: &mut Task, prefix: &str) -> Result<(), OrcError> {
        let mut tx = self.pool.begin().await?;

        if task.id.is_empty() {
            task.id = allocate_task_id(&mut tx, prefix).await?;
        } else {
            // Keep the counter ahead of explicitly-chosen ids so generated
            // ids never collide with imported ones.
            if let Some(n) = numeric_suffix(&task.id) {
                sqlx::query("UPDATE task_counter SET next = MAX(next, ?) WHERE id = 1")
                    .bind(n as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let now = Utc::now();
        task.created_at = now;
        task.updated_at = now;

        let record = encode_record(task)?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO tasks (id, status, record, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(&record)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(OrcError::InvalidInput(format!(
                "task {} already exists",
                task.id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_task(&self, id: &str) -> Result<Task, OrcError> {
        let row = sqlx::query("SELECT record FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => decode_task(&row),
            None => Err(OrcError::NotFound(format!("task {}", id))),
        }
    }

    /// Atomic full-record write with compare-on-`updated_at`.
    ///
    /// The caller loads, mutates, and saves; the store compares the loaded
    /// `updated_at` against the stored one, bumps it, and writes. A newer
    /// stored value means another writer won and the caller must reload.
    pub async fn save_task(&self, task: &mut Task) -> Result<(), OrcError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT updated_at FROM tasks WHERE id = ?")
            .bind(&task.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OrcError::NotFound(format!("task {}", task.id)))?;

        let stored: String = row.try_get("updated_at")?;
        let stored_at = parse_datetime(&stored)?;
        if stored_at != task.updated_at {
            return Err(OrcError::Stale(task.id.clone()));
        }

        task.touch();
        let record = encode_record(task)?;
        sqlx::query("UPDATE tasks SET status = ?, record = ?, updated_at = ? WHERE id = ?")
            .bind(task.status.as_str())
            .bind(&record)
            .bind(task.updated_at.to_rfc3339())
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Consistent snapshot of every task, ordered by id ascending.
    pub async fn load_all_tasks(&self) -> Result<Vec<Task>, OrcError> {
        let rows = sqlx::query("SELECT record FROM tasks ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_task).collect()
    }

    /// Delete a task and its dependent records. Claims are left to expire
    /// via aliveness so a running executor fails its next save instead of
    /// silently writing into a void.
    pub async fn delete_task(&self, id: &str) -> Result<(), OrcError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(OrcError::NotFound(format!("task {}", id)));
        }
        sqlx::query("DELETE FROM transcripts WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM gate_decisions WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM comments WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM attachments WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Peek at the id the next `create_task` would assign. Display only;
    /// allocation happens inside the create transaction.
    pub async fn next_task_id(&self, prefix: &str) -> Result<String, OrcError> {
        let row = sqlx::query("SELECT next FROM task_counter WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        let next: i64 = row.try_get("next")?;
        Ok(format!("{}-{:03}", prefix, next + 1))
    }

    // --- Transcripts ---

    /// Append a transcript entry, assigning the next monotonic per-task id.
    pub async fn append_transcript(&self, entry: &mut TranscriptEntry) -> Result<(), OrcError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS max_id FROM transcripts WHERE task_id = ?")
            .bind(&entry.task_id)
            .fetch_one(&mut *tx)
            .await?;
        let max_id: i64 = row.try_get("max_id")?;
        entry.id = max_id + 1;

        let content = serde_json::to_string(&entry.content)
            .map_err(|e| OrcError::Fatal(format!("encode transcript content: {}", e)))?;

        sqlx::query(
            "INSERT INTO transcripts (task_id, id, phase, timestamp_ms, role, model, \
             input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, content) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.task_id)
        .bind(entry.id)
        .bind(&entry.phase)
        .bind(entry.timestamp_ms)
        .bind(entry.role.as_str())
        .bind(&entry.model)
        .bind(entry.input_tokens as i64)
        .bind(entry.output_tokens as i64)
        .bind(entry.cache_read_tokens as i64)
        .bind(entry.cache_write_tokens as i64)
        .bind(&content)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_transcripts(&self, task_id: &str) -> Result<Vec<TranscriptEntry>, OrcError> {
        let rows = sqlx::query(
            "SELECT task_id, id, phase, timestamp_ms, role, model, input_tokens, output_tokens, \
             cache_read_tokens, cache_write_tokens, content \
             FROM transcripts WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_transcript).collect()
    }

    // --- Gate decisions ---

    pub async fn append_gate_decision(
        &self,
        task_id: &str,
        decision: &GateDecision,
    ) -> Result<(), OrcError> {
        sqlx::query(
            "INSERT INTO gate_decisions (task_id, phase, gate, approved, reason, source, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(&decision.phase)
        .bind(decision.gate.as_str())
        .bind(decision.approved as i32)
        .bind(&decision.reason)
        .bind(&decision.source)
        .bind(decision.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Gate decisions in append order (timestamp order by construction).
    pub async fn list_gate_decisions(&self, task_id: &str) -> Result<Vec<GateDecision>, OrcError> {
        let rows = sqlx::query(
            "SELECT phase, gate, approved, reason, source, timestamp \
             FROM gate_decisions WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_gate_decision).collect()
    }

    // --- Claims ---

    /// Atomically claim a task for execution.
    ///
    /// Succeeds iff no claim exists, or the recorded claim names a process
    /// on this host that is no longer alive. A claim from another host is
    /// never overridden. On success the claim row is written and the task
    /// status moves to `running` in the same transaction. A primary-key
    /// collision from a concurrent claimant maps to `AlreadyClaimed`.
    pub async fn try_claim_task_execution(
        &self,
        task_id: &str,
        pid: i32,
        host: &str,
    ) -> Result<Claim, OrcError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT pid, hostname FROM claims WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let held_pid: i64 = row.try_get("pid")?;
            let held_host: String = row.try_get("hostname")?;
            let stale = held_host == host && !(self.pid_probe)(held_pid as i32);
            if !stale {
                return Err(OrcError::AlreadyClaimed {
                    pid: held_pid as i32,
                    hostname: held_host,
                });
            }
            sqlx::query("DELETE FROM claims WHERE task_id = ?")
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }

        let claim = Claim {
            task_id: task_id.to_string(),
            pid,
            hostname: host.to_string(),
            acquired_at: Utc::now(),
        };

        let insert = sqlx::query(
            "INSERT INTO claims (task_id, pid, hostname, acquired_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&claim.task_id)
        .bind(claim.pid as i64)
        .bind(&claim.hostname)
        .bind(claim.acquired_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if is_unique_violation(&e) {
                // Lost the race to a concurrent claimant; report the winner.
                drop(tx);
                let row = sqlx::query("SELECT pid, hostname FROM claims WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_optional(&self.pool)
                    .await?;
                if let Some(row) = row {
                    let pid: i64 = row.try_get("pid")?;
                    let hostname: String = row.try_get("hostname")?;
                    return Err(OrcError::AlreadyClaimed {
                        pid: pid as i32,
                        hostname,
                    });
                }
            }
            return Err(e.into());
        }

        // Same transaction: the claim and the running status land together.
        let row = sqlx::query("SELECT record FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OrcError::NotFound(format!("task {}", task_id)))?;
        let mut task = decode_task(&row)?;
        task.transition_status(TaskStatus::Running, false)?;
        task.touch();
        let record = encode_record(&task)?;
        sqlx::query("UPDATE tasks SET status = ?, record = ?, updated_at = ? WHERE id = ?")
            .bind(task.status.as_str())
            .bind(&record)
            .bind(task.updated_at.to_rfc3339())
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(claim)
    }

    /// Release a claim. No-op if absent.
    pub async fn release_claim(&self, task_id: &str) -> Result<(), OrcError> {
        sqlx::query("DELETE FROM claims WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_claims(&self) -> Result<Vec<Claim>, OrcError> {
        let rows = sqlx::query(
            "SELECT task_id, pid, hostname, acquired_at FROM claims ORDER BY task_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Claim {
                    task_id: row.try_get("task_id")?,
                    pid: row.try_get::<i64, _>("pid")? as i32,
                    hostname: row.try_get("hostname")?,
                    acquired_at: parse_datetime(&row.try_get::<String, _>("acquired_at")?)?,
                })
            })
            .collect()
    }

    pub async fn get_claim(&self, task_id: &str) -> Result<Option<Claim>, OrcError> {
        Ok(self
            .list_claims()
            .await?
            .into_iter()
            .find(|c| c.task_id == task_id))
    }

    // --- Initiatives ---

    pub async fn upsert_initiative(&self, initiative: &Initiative) -> Result<(), OrcError> {
        let record = serde_json::to_string(initiative)
            .map_err(|e| OrcError::Fatal(format!("encode initiative {}: {}", initiative.id, e)))?;
        sqlx::query(
            "INSERT INTO initiatives (id, record, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at",
        )
        .bind(&initiative.id)
        .bind(&record)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_initiative(&self, id: &str) -> Result<Initiative, OrcError> {
        let row = sqlx::query("SELECT record FROM initiatives WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrcError::NotFound(format!("initiative {}", id)))?;
        let record: String = row.try_get("record")?;
        serde_json::from_str(&record)
            .map_err(|e| OrcError::Fatal(format!("corrupt initiative record {}: {}", id, e)))
    }

    pub async fn list_initiatives(&self) -> Result<Vec<Initiative>, OrcError> {
        let rows = sqlx::query("SELECT record FROM initiatives ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let record: String = row.try_get("record")?;
                serde_json::from_str(&record)
                    .map_err(|e| OrcError::Fatal(format!("corrupt initiative record: {}", e)))
            })
            .collect()
    }

    /// Link a task to an initiative, updating both sides.
    pub async fn link_task_to_initiative(
        &self,
        task_id: &str,
        initiative_id: &str,
    ) -> Result<(), OrcError> {
        let mut task = self.load_task(task_id).await?;
        let mut initiative = self.load_initiative(initiative_id).await?;

        task.initiative_id = Some(initiative_id.to_string());
        if !initiative.tasks.iter().any(|t| t.task_id == task_id) {
            initiative.tasks.push(InitiativeTask {
                task_id: task_id.to_string(),
                title: task.title.clone(),
                note: None,
            });
        }

        self.save_task(&mut task).await?;
        self.upsert_initiative(&initiative).await?;
        Ok(())
    }

    /// Unlink a task from its initiative, updating both sides.
    pub async fn unlink_task_from_initiative(&self, task_id: &str) -> Result<(), OrcError> {
        let mut task = self.load_task(task_id).await?;
        let Some(initiative_id) = task.initiative_id.take() else {
            return Ok(());
        };

        if let Ok(mut initiative) = self.load_initiative(&initiative_id).await {
            initiative.tasks.retain(|t| t.task_id != task_id);
            self.upsert_initiative(&initiative).await?;
        }

        self.save_task(&mut task).await?;
        Ok(())
    }

    // --- Comments & attachments ---

    pub async fn add_comment(&self, task_id: &str, author: &str, body: &str) -> Result<(), OrcError> {
        sqlx::query(
            "INSERT INTO comments (task_id, author, body, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(author)
        .bind(body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_comments(&self, task_id: &str) -> Result<Vec<(String, String)>, OrcError> {
        let rows = sqlx::query(
            "SELECT author, body FROM comments WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("author")?, row.try_get("body")?)))
            .collect()
    }

    pub async fn add_attachment(&self, task_id: &str, name: &str, path: &str) -> Result<(), OrcError> {
        sqlx::query(
            "INSERT INTO attachments (task_id, name, path, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(name)
        .bind(path)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_attachments(&self, task_id: &str) -> Result<Vec<(String, String)>, OrcError> {
        let rows = sqlx::query(
            "SELECT name, path FROM attachments WHERE task_id = ? ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("name")?, row.try_get("path")?)))
            .collect()
    }
}

// --- Row decoding ---

fn encode_record(task: &Task) -> Result<String, OrcError> {
    serde_json::to_string(task)
        .map_err(|e| OrcError::Fatal(format!("encode task {}: {}", task.id, e)))
}

fn decode_task(row: &SqliteRow) -> Result<Task, OrcError> {
    let record: String = row.try_get("record")?;
    serde_json::from_str(&record)
        .map_err(|e| OrcError::Fatal(format!("corrupt task record: {}", e)))
}

fn decode_transcript(row: &SqliteRow) -> Result<TranscriptEntry, OrcError> {
    let role: String = row.try_get("role")?;
    let content: String = row.try_get("content")?;
    Ok(TranscriptEntry {
        task_id: row.try_get("task_id")?,
        phase: row.try_get("phase")?,
        id: row.try_get("id")?,
        timestamp_ms: row.try_get("timestamp_ms")?,
        role: parse_transcript_role(&role).map_err(OrcError::InvalidInput)?,
        model: row.try_get("model")?,
        input_tokens: row.try_get::<i64, _>("input_tokens")? as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens")? as u64,
        cache_read_tokens: row.try_get::<i64, _>("cache_read_tokens")? as u64,
        cache_write_tokens: row.try_get::<i64, _>("cache_write_tokens")? as u64,
        content: serde_json::from_str(&content)
            .map_err(|e| OrcError::Fatal(format!("corrupt transcript content: {}", e)))?,
    })
}

fn decode_gate_decision(row: &SqliteRow) -> Result<GateDecision, OrcError> {
    let gate: String = row.try_get("gate")?;
    let approved: i32 = row.try_get("approved")?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(GateDecision {
        phase: row.try_get("phase")?,
        gate: parse_gate_type(&gate).map_err(OrcError::InvalidInput)?,
        approved: approved != 0,
        reason: row.try_get("reason")?,
        source: row.try_get("source")?,
        timestamp: parse_datetime(&timestamp)?,
    })
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, OrcError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrcError::Fatal(format!("corrupt timestamp '{}': {}", s, e)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| c == "1555" || c == "2067")
            .unwrap_or(false),
        _ => false,
    }
}

/// Highest numeric suffix ever assigned is tracked in `task_counter` so ids
/// are never reused after deletion. Formula: next = counter + 1.
async fn allocate_task_id(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    prefix: &str,
) -> Result<String, OrcError> {
    let row = sqlx::query("SELECT next FROM task_counter WHERE id = 1")
        .fetch_one(&mut **tx)
        .await?;
    let next: i64 = row.try_get("next")?;
    let assigned = next + 1;
    sqlx::query("UPDATE task_counter SET next = ? WHERE id = 1")
        .bind(assigned)
        .execute(&mut **tx)
        .await?;
    Ok(format!("{}-{:03}", prefix, assigned))
}

fn numeric_suffix(id: &str) -> Option<u32> {
    id.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
}
