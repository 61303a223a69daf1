//! Courier Storage
//!
//! SQLite task queue: durable rows, an atomic claim primitive and
//! busy-retry wrapping for every statement

mod task;

pub use task::{NewTask, QueueCounts, Task, TaskFilter, TaskStatus};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use task::{datetime_to_millis, duration_to_millis, TASK_COLUMNS};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Extra attempts after the first one when SQLite reports busy/locked.
    pub busy_retries: u32,
    /// Linear backoff step: attempt `n` sleeps `n * busy_backoff`.
    pub busy_backoff: Duration,
    /// SQLite-level wait before a locked statement reports busy.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_retries: 5,
            busy_backoff: Duration::from_millis(50),
            busy_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    options: StoreOptions,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(
            "Opened task store {} (journal_mode={})",
            db_path.as_ref().display(),
            mode
        );

        Self::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            options: StoreOptions::default(),
        })
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                payload BLOB NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                retry_delay INTEGER NOT NULL,
                last_attempt INTEGER,
                next_attempt INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'complete', 'failed')),
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_claim
            ON tasks(command, status, next_attempt);
            ",
        )?;
        Ok(())
    }

    /// Runs `op` against the shared connection on the blocking pool, retrying
    /// with linear backoff while SQLite reports the database busy or locked.
    ///
    /// `op` may run more than once, so it must be idempotent up to the point
    /// where SQLite rejected it. A single statement always is.
    pub async fn exec_with_retry<T, F>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let conn = Arc::clone(&self.conn);
            let (returned, result) = tokio::task::spawn_blocking(move || {
                let result = conn.lock().ok().map(|guard| op(&guard));
                (op, result)
            })
            .await
            .with_context(|| format!("task store {} worker failed", label))?;
            op = returned;
            let result = result.ok_or_else(|| anyhow!("task store connection lock poisoned"))?;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt <= self.options.busy_retries => {
                    let backoff = self.options.busy_backoff * attempt;
                    debug!(
                        "Task store {} busy (attempt {}), retrying in {:?}",
                        label, attempt, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    if is_busy(&err) {
                        warn!(
                            "Task store {} still busy after {} attempts",
                            label, attempt
                        );
                    }
                    return Err(anyhow::Error::new(err).context(format!("task store {} failed", label)));
                }
            }
        }
    }

    /// Inserts a `pending` task eligible immediately. Returns its id.
    pub async fn add(&self, task: &NewTask) -> Result<i64> {
        if task.command.trim().is_empty() {
            anyhow::bail!("Task command cannot be empty");
        }
        let now = datetime_to_millis(Utc::now());
        let retry_delay = duration_to_millis(task.retry_delay);
        let task = task.clone();

        self.exec_with_retry("add", move |conn| {
            conn.execute(
                "INSERT INTO tasks (command, payload, max_retries, retry_delay, next_attempt, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?5)",
                (&task.command, &task.payload, task.max_retries, retry_delay, now),
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Atomically claims the earliest eligible `pending` task of `command`:
    /// flips it to `running`, stamps `last_attempt` and returns the updated row.
    ///
    /// Selection and update are one statement, so two claimers can never
    /// both win the same row.
    pub async fn claim_next(&self, command: &str, now: DateTime<Utc>) -> Result<Option<Task>> {
        let now = datetime_to_millis(now);
        let sql = format!(
            "UPDATE tasks
             SET status = 'running', last_attempt = ?2
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE command = ?1 AND status = 'pending' AND next_attempt <= ?2
                 ORDER BY next_attempt ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {}",
            TASK_COLUMNS
        );

        let command = command.to_string();
        self.exec_with_retry("claim_next", move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.query_row((&command, now), Task::from_row).optional()
        })
        .await
    }

    /// Moves a `running` task to `status`. Returns `false` when the task was
    /// not running, so terminal rows are never touched.
    ///
    /// `Running` only refreshes `last_attempt` to mark the real start of
    /// execution; going back to `pending` must use [`Store::reschedule`] or
    /// [`Store::release`].
    pub async fn mark_status(&self, id: i64, status: TaskStatus) -> Result<bool> {
        let changed = match status {
            TaskStatus::Pending => {
                anyhow::bail!("Task {} cannot be marked pending directly", id)
            }
            TaskStatus::Running => {
                let now = datetime_to_millis(Utc::now());
                self.exec_with_retry("mark_status", move |conn| {
                    conn.execute(
                        "UPDATE tasks SET last_attempt = ?2 WHERE id = ?1 AND status = 'running'",
                        (id, now),
                    )
                })
                .await?
            }
            TaskStatus::Complete | TaskStatus::Failed => {
                self.exec_with_retry("mark_status", move |conn| {
                    conn.execute(
                        "UPDATE tasks SET status = ?2 WHERE id = ?1 AND status = 'running'",
                        (id, status),
                    )
                })
                .await?
            }
        };
        Ok(changed > 0)
    }

    /// Retry path: back to `pending`, one more attempt counted, eligible at `next_attempt`.
    pub async fn reschedule(&self, id: i64, next_attempt: DateTime<Utc>) -> Result<bool> {
        let next_attempt = datetime_to_millis(next_attempt);
        let changed = self
            .exec_with_retry("reschedule", move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET status = 'pending', retry_count = retry_count + 1, next_attempt = ?2
                     WHERE id = ?1 AND status = 'running'",
                    (id, next_attempt),
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Terminal failure after the last allowed attempt, which is counted.
    pub async fn exhaust(&self, id: i64) -> Result<bool> {
        let changed = self
            .exec_with_retry("exhaust", move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET status = 'failed', retry_count = retry_count + 1
                     WHERE id = ?1 AND status = 'running'",
                    [id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Undoes a claim whose execution never started. Counters stay untouched.
    pub async fn release(&self, id: i64) -> Result<bool> {
        let changed = self
            .exec_with_retry("release", move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = 'pending' WHERE id = ?1 AND status = 'running'",
                    [id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    /// Pushes rows left `running` by a previous process through the retry
    /// path: exhausted ones become `failed`, the rest `pending` again.
    pub async fn recover_running(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = datetime_to_millis(now);
        let recovered = self
            .exec_with_retry("recover_running", move |conn| {
                conn.execute(
                    "UPDATE tasks
                     SET retry_count = retry_count + 1,
                         status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                         next_attempt = MAX(next_attempt, ?1)
                     WHERE status = 'running'",
                    [now],
                )
            })
            .await?;
        if recovered > 0 {
            info!("Recovered {} interrupted task(s)", recovered);
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        self.exec_with_retry("get", move |conn| {
            conn.query_row(&sql, [id], Task::from_row).optional()
        })
        .await
    }

    /// Most recent tasks first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR command = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY id DESC
             LIMIT ?3",
            TASK_COLUMNS
        );
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let filter = filter.clone();

        self.exec_with_retry("list", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                (filter.command.as_deref(), filter.status, limit),
                Task::from_row,
            )?;

            let mut result = Vec::new();
            for task in rows {
                result.push(task?);
            }
            Ok(result)
        })
        .await
    }

    pub async fn counts(&self) -> Result<Vec<QueueCounts>> {
        let rows = self
            .exec_with_retry("counts", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT command, status, COUNT(*) FROM tasks GROUP BY command, status",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, TaskStatus>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?;

                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok(result)
            })
            .await?;

        let mut by_command: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for (command, status, count) in rows {
            by_command
                .entry(command.clone())
                .or_insert_with(|| QueueCounts {
                    command,
                    ..QueueCounts::default()
                })
                .bump(status, count.max(0) as usize);
        }
        Ok(by_command.into_values().collect())
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
