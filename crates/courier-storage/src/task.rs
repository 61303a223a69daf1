use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const TASK_COLUMNS: &str = "id, command, payload, retry_count, max_retries, \
     retry_delay, last_attempt, next_attempt, status, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Complete,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("Unknown task status '{}'", other)),
        }
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|_| FromSqlError::Other(format!("unknown task status '{}'", text).into()))
    }
}

/// One durably queued unit of deferred command execution.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
    pub command: String,
    /// Serialized snapshot of the triggering update. The store never looks inside.
    pub payload: Vec<u8>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: DateTime<Utc>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let last_attempt: Option<i64> = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            command: row.get(1)?,
            payload: row.get(2)?,
            retry_count: row.get(3)?,
            max_retries: row.get(4)?,
            retry_delay: Duration::from_millis(row.get::<_, i64>(5)?.max(0) as u64),
            last_attempt: last_attempt.map(|ms| millis_to_datetime(6, ms)).transpose()?,
            next_attempt: millis_to_datetime(7, row.get(7)?)?,
            status: row.get(8)?,
            created_at: millis_to_datetime(9, row.get(9)?)?,
        })
    }
}

/// Input for [`crate::Store::add`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub command: String,
    pub payload: Vec<u8>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

/// Per-command status breakdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub command: String,
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub(crate) fn bump(&mut self, status: TaskStatus, count: usize) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Complete => self.complete += count,
            TaskStatus::Failed => self.failed += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.complete + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub command: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            command: None,
            status: None,
            limit: 50,
        }
    }
}

pub(crate) fn datetime_to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn millis_to_datetime(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            rusqlite::types::Type::Integer,
            format!("timestamp {} out of range", ms).into(),
        )
    })
}
