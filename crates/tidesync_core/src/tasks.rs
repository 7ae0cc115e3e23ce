//! Typed task services.
//!
//! `TaskService` assigns ids, stamps timestamps and issues writes through the
//! local store. It never talks to the network; every write lands in the
//! mutation log through the table triggers.

use crate::error::{StoreError, StoreResult};
use crate::id::EntityId;
use crate::schema::{ColumnDef, ColumnType, Schema, TableDef};
use crate::store::{LocalStore, StoreTransaction};
use crate::value::{QueryResult, RowRef, SqlValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Name of the tasks table.
pub const TASKS_TABLE: &str = "tasks";

/// Query for the open-task list, oldest first.
pub const OPEN_TASKS_SQL: &str =
    "SELECT * FROM tasks WHERE is_completed = 0 ORDER BY created_at, id";

const ALL_TASKS_SQL: &str = "SELECT * FROM tasks ORDER BY created_at, id";
const TASK_BY_ID_SQL: &str = "SELECT * FROM tasks WHERE id = ?1";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low.
    Low,
    /// Medium.
    #[default]
    Medium,
    /// High.
    High,
}

impl Priority {
    /// Returns the stored form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(StoreError::invalid_argument(format!(
                "unknown priority {other:?}: expected low, medium or high"
            ))),
        }
    }
}

/// A task as stored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Entity id.
    pub id: EntityId,
    /// Non-empty, trimmed title.
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Priority.
    pub priority: Priority,
    /// Completion flag (stored as 0/1).
    pub is_completed: bool,
    /// Due date, ms since epoch.
    pub due_at: Option<i64>,
    /// When the task was completed, ms since epoch.
    pub completed_at: Option<i64>,
    /// Creation time, ms since epoch.
    pub created_at: i64,
    /// Last modification time, ms since epoch.
    pub updated_at: i64,
}

impl Task {
    fn from_row(row: RowRef<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: text(&row, "id")?.parse()?,
            title: text(&row, "title")?.to_owned(),
            description: row.get_str("description").map(str::to_owned),
            priority: text(&row, "priority")?.parse()?,
            is_completed: integer(&row, "is_completed")? != 0,
            due_at: row.get_i64("due_at"),
            completed_at: row.get_i64("completed_at"),
            created_at: integer(&row, "created_at")?,
            updated_at: integer(&row, "updated_at")?,
        })
    }

    fn from_result(result: &QueryResult) -> StoreResult<Vec<Self>> {
        result.rows().map(Self::from_row).collect()
    }
}

/// Input for [`TaskService::create`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct NewTask {
    /// Title; trimmed, must not be empty.
    pub title: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Priority, medium by default.
    #[serde(default)]
    pub priority: Priority,
    /// Optional due date, ms since epoch.
    #[serde(default)]
    pub due_at: Option<i64>,
}

impl NewTask {
    /// Creates input with just a title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the due date (ms since epoch).
    #[must_use]
    pub fn due_at(mut self, due_at: i64) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

/// Partial update for [`TaskService::update`]. `None` leaves a field as is;
/// `Some(None)` clears a nullable field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<Option<String>>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New due date.
    pub due_at: Option<Option<i64>>,
}

impl TaskPatch {
    /// Returns true if the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.priority.is_none()
            && self.due_at.is_none()
    }
}

/// CRUD over the tasks table.
#[derive(Debug, Clone)]
pub struct TaskService {
    store: LocalStore,
}

impl TaskService {
    /// The tasks table definition.
    pub fn table() -> TableDef {
        TableDef::synced(TASKS_TABLE)
            .column(ColumnDef::required("title", ColumnType::Text))
            .column(ColumnDef::optional("description", ColumnType::Text))
            .column(ColumnDef::required("priority", ColumnType::Text))
            .column(ColumnDef::required("is_completed", ColumnType::Integer))
            .column(ColumnDef::optional("due_at", ColumnType::Integer))
            .column(ColumnDef::optional("completed_at", ColumnType::Integer))
            .column(ColumnDef::required("created_at", ColumnType::Integer))
            .column(ColumnDef::required("updated_at", ColumnType::Integer))
            .index("is_completed")
            .index("priority")
            .index("due_at")
            .index("created_at")
    }

    /// A schema holding just the tasks table.
    pub fn schema() -> Schema {
        Schema::new().with_table(Self::table())
    }

    /// Creates a service over a store whose schema includes the tasks table.
    pub fn new(store: LocalStore) -> StoreResult<Self> {
        if store.schema().table(TASKS_TABLE).is_none() {
            return Err(StoreError::invalid_argument("store schema has no tasks table"));
        }
        Ok(Self { store })
    }

    /// The underlying store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Creates a task.
    pub fn create(&self, input: NewTask) -> StoreResult<Task> {
        let now = now_millis();
        let task = Task {
            id: EntityId::new(),
            title: valid_title(&input.title)?,
            description: input.description,
            priority: input.priority,
            is_completed: false,
            due_at: input.due_at,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.execute(
            "INSERT INTO tasks (id, title, description, priority, is_completed, due_at, \
             completed_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            &[
                task.id.to_string().into(),
                task.title.as_str().into(),
                task.description.clone().into(),
                task.priority.as_str().into(),
                task.is_completed.into(),
                task.due_at.into(),
                task.completed_at.into(),
                task.created_at.into(),
                task.updated_at.into(),
            ],
        )?;
        debug!(id = %task.id, "task created");
        Ok(task)
    }

    /// Returns a task.
    pub fn get(&self, id: EntityId) -> StoreResult<Task> {
        let result = self.store.query(TASK_BY_ID_SQL, &[id.to_string().into()])?;
        first(&result, id)
    }

    /// Returns open tasks, oldest first.
    pub fn list_open(&self) -> StoreResult<Vec<Task>> {
        Task::from_result(&self.store.query(OPEN_TASKS_SQL, &[])?)
    }

    /// Returns all tasks, oldest first.
    pub fn list_all(&self) -> StoreResult<Vec<Task>> {
        Task::from_result(&self.store.query(ALL_TASKS_SQL, &[])?)
    }

    /// Applies a partial update.
    pub fn update(&self, id: EntityId, patch: TaskPatch) -> StoreResult<Task> {
        self.store.transaction(|tx| {
            let mut task = load(tx, id)?;
            if patch.is_empty() {
                return Ok(task);
            }
            if let Some(title) = &patch.title {
                task.title = valid_title(title)?;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(due_at) = patch.due_at {
                task.due_at = due_at;
            }
            task.updated_at = now_millis();

            tx.execute(
                "UPDATE tasks SET title = ?2, description = ?3, priority = ?4, due_at = ?5, \
                 updated_at = ?6 WHERE id = ?1",
                &[
                    id.to_string().into(),
                    task.title.as_str().into(),
                    task.description.clone().into(),
                    task.priority.as_str().into(),
                    task.due_at.into(),
                    task.updated_at.into(),
                ],
            )?;
            Ok(task)
        })
    }

    /// Marks a task completed. Completing a completed task changes nothing.
    pub fn complete(&self, id: EntityId) -> StoreResult<Task> {
        self.store.transaction(|tx| {
            let now = now_millis();
            let changed = tx.execute(
                "UPDATE tasks SET is_completed = 1, completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND is_completed = 0",
                &[id.to_string().into(), now.into()],
            )?;
            if changed > 0 {
                debug!(%id, "task completed");
            }
            load(tx, id)
        })
    }

    /// Marks a completed task open again.
    pub fn reopen(&self, id: EntityId) -> StoreResult<Task> {
        self.store.transaction(|tx| {
            tx.execute(
                "UPDATE tasks SET is_completed = 0, completed_at = NULL, updated_at = ?2 \
                 WHERE id = ?1 AND is_completed = 1",
                &[id.to_string().into(), now_millis().into()],
            )?;
            load(tx, id)
        })
    }

    /// Moves the due date of an open task.
    pub fn postpone(&self, id: EntityId, until: i64) -> StoreResult<Task> {
        self.store.transaction(|tx| {
            let mut task = load(tx, id)?;
            if task.is_completed {
                return Err(StoreError::invalid_argument(format!(
                    "task {id} is completed and cannot be postponed"
                )));
            }
            task.due_at = Some(until);
            task.updated_at = now_millis();
            tx.execute(
                "UPDATE tasks SET due_at = ?2, updated_at = ?3 WHERE id = ?1",
                &[id.to_string().into(), until.into(), task.updated_at.into()],
            )?;
            Ok(task)
        })
    }

    /// Pushes the due date back by `delay`, counting from the current due
    /// date or from now, whichever is later.
    pub fn postpone_by(&self, id: EntityId, delay: Duration) -> StoreResult<Task> {
        let task = self.get(id)?;
        let delay = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let base = task.due_at.unwrap_or(0).max(now_millis());
        self.postpone(id, base.saturating_add(delay))
    }

    /// Deletes a task.
    pub fn delete(&self, id: EntityId) -> StoreResult<()> {
        let n = self
            .store
            .execute("DELETE FROM tasks WHERE id = ?1", &[id.to_string().into()])?;
        if n == 0 {
            return Err(StoreError::not_found(TASKS_TABLE, id.to_string()));
        }
        debug!(%id, "task deleted");
        Ok(())
    }

    /// Deletes every task and returns how many were removed.
    ///
    /// Pending creates and updates for tasks are dropped in the same
    /// transaction, so the remote only ever sees the deletes.
    pub fn clear_all(&self) -> StoreResult<usize> {
        let (dropped, removed) = self.store.transaction(|tx| {
            let dropped = tx.discard_pending_upserts(TASKS_TABLE)?;
            let removed = tx.execute("DELETE FROM tasks", &[])?;
            Ok((dropped, removed))
        })?;
        debug!(removed, dropped, "tasks cleared");
        Ok(removed)
    }

    /// Number of open tasks.
    pub fn open_count(&self) -> StoreResult<usize> {
        let result = self
            .store
            .query("SELECT COUNT(*) FROM tasks WHERE is_completed = 0", &[])?;
        Ok(result
            .scalar()
            .and_then(SqlValue::as_i64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0))
    }
}

/// Decodes the rows of a task query, such as a watched [`OPEN_TASKS_SQL`].
pub fn tasks_from(result: &QueryResult) -> StoreResult<Vec<Task>> {
    Task::from_result(result)
}

fn text<'a>(row: &RowRef<'a>, column: &str) -> StoreResult<&'a str> {
    row.get_str(column).ok_or_else(|| {
        StoreError::corrupt_row(TASKS_TABLE, format!("missing text column {column}"))
    })
}

fn integer(row: &RowRef<'_>, column: &str) -> StoreResult<i64> {
    row.get_i64(column).ok_or_else(|| {
        StoreError::corrupt_row(TASKS_TABLE, format!("missing integer column {column}"))
    })
}

fn valid_title(title: &str) -> StoreResult<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(StoreError::invalid_argument("task title must not be empty"));
    }
    Ok(trimmed.to_owned())
}

fn load(tx: &StoreTransaction<'_>, id: EntityId) -> StoreResult<Task> {
    let result = tx.query(TASK_BY_ID_SQL, &[id.to_string().into()])?;
    first(&result, id)
}

fn first(result: &QueryResult, id: EntityId) -> StoreResult<Task> {
    match result.row(0) {
        Some(row) => Task::from_row(row),
        None => Err(StoreError::not_found(TASKS_TABLE, id.to_string())),
    }
}
