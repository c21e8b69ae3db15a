use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use waldiez_runner_model::{
    Page, Params, Task, TaskCreate, TaskResults, TaskStatus, TaskUpdate,
};

use crate::error::{Result, RunnerError};

use super::{fmt_ts, parse_ts};

const TERMINAL_GUARD: &str =
    "status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')";
const NOT_DELETED: &str = "deleted_at IS NULL";
const COLUMNS: &str = "id, client_id, flow_id, filename, status, \
     input_timeout, input_request_id, results, schedule_type, \
     scheduled_time, cron_expression, expires_at, triggered_at, \
     created_at, updated_at, deleted_at";

/// Persistence for [`Task`] rows.
///
/// Status transitions go through [`TaskRepository::update_status`], whose
/// WHERE clause refuses to move a row out of a terminal state, so racing
/// writers (watcher, runner, cancel API) can all fire without coordination:
/// the first terminal write wins and everything later is a no-op.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: AnyPool,
}

impl TaskRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, task_create: TaskCreate) -> Result<Task> {
        let task = task_create.into_task();
        let results = encode_results(task.results.as_ref())?;
        sqlx::query(
            "INSERT INTO tasks (id, client_id, flow_id, filename, status, \
             input_timeout, input_request_id, results, schedule_type, \
             scheduled_time, cron_expression, expires_at, triggered_at, \
             created_at, updated_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
             $13, $14, $15, $16)",
        )
        .bind(&task.id)
        .bind(&task.client_id)
        .bind(&task.flow_id)
        .bind(&task.filename)
        .bind(task.status.as_str())
        .bind(task.input_timeout as i64)
        .bind(task.input_request_id.as_deref())
        .bind(results)
        .bind(task.schedule_type.map(|s| s.as_str()))
        .bind(task.scheduled_time.map(fmt_ts))
        .bind(task.cron_expression.as_deref())
        .bind(task.expires_at.map(fmt_ts))
        .bind(task.triggered_at.map(fmt_ts))
        .bind(fmt_ts(task.created_at))
        .bind(fmt_ts(task.updated_at))
        .bind(task.deleted_at.map(fmt_ts))
        .execute(&self.pool)
        .await?;
        Ok(task)
    }

    /// Fetch by id, excluding soft-deleted rows.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM tasks WHERE id = $1 AND {NOT_DELETED}"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// Single-row status transition. Returns `false` when nothing changed,
    /// either because the row is unknown/deleted or already terminal.
    ///
    /// `input_request_id` is persisted only with `WaitingForInput`; any
    /// other status clears it. With `skip_results` the `results` column is
    /// left untouched.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        input_request_id: Option<&str>,
        results: Option<&TaskResults>,
        skip_results: bool,
    ) -> Result<bool> {
        let request_id = match status {
            TaskStatus::WaitingForInput => input_request_id,
            _ => None,
        };
        let updated = if skip_results {
            sqlx::query(&format!(
                "UPDATE tasks SET status = $1, updated_at = $2, \
                 input_request_id = $3 \
                 WHERE id = $4 AND {NOT_DELETED} AND {TERMINAL_GUARD}"
            ))
            .bind(status.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(request_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "UPDATE tasks SET status = $1, updated_at = $2, \
                 input_request_id = $3, results = $4 \
                 WHERE id = $5 AND {NOT_DELETED} AND {TERMINAL_GUARD}"
            ))
            .bind(status.as_str())
            .bind(fmt_ts(Utc::now()))
            .bind(request_id)
            .bind(encode_results(results)?)
            .bind(task_id)
            .execute(&self.pool)
            .await?
        };
        Ok(updated.rows_affected() > 0)
    }

    /// Apply a `PATCH` payload. The caller has already verified the task is
    /// active; the terminal guard still applies to status writes.
    pub async fn update(
        &self,
        task_id: &str,
        update: &TaskUpdate,
    ) -> Result<Option<Task>> {
        if let Some(timeout) = update.input_timeout {
            sqlx::query(&format!(
                "UPDATE tasks SET input_timeout = $1, updated_at = $2 \
                 WHERE id = $3 AND {NOT_DELETED}"
            ))
            .bind(timeout as i64)
            .bind(fmt_ts(Utc::now()))
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        }
        if update.status.is_some() || update.results.is_some() {
            let task = match self.get(task_id).await? {
                Some(task) => task,
                None => return Ok(None),
            };
            let status = update.status.unwrap_or(task.status);
            self.update_status(
                task_id,
                status,
                task.input_request_id.as_deref(),
                update.results.as_ref().or(task.results.as_ref()),
                false,
            )
            .await?;
        }
        self.get(task_id).await
    }

    pub async fn mark_triggered(&self, task_id: &str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE tasks SET triggered_at = $1, updated_at = $1 \
             WHERE id = $2 AND {NOT_DELETED}"
        ))
        .bind(fmt_ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_by_client(
        &self,
        client_id: &str,
        params: Params,
        search: Option<&str>,
        order_by: Option<&str>,
        descending: bool,
    ) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.clause("client_id", client_id);
        filter.search(search);
        self.fetch_page(filter, order_clause(order_by, descending), params)
            .await
    }

    /// Admin listing over all clients.
    pub async fn list_all(
        &self,
        params: Params,
        search: Option<&str>,
        order_by: Option<&str>,
        descending: bool,
    ) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.search(search);
        self.fetch_page(filter, order_clause(order_by, descending), params)
            .await
    }

    pub async fn count_active_by_client(
        &self,
        client_id: &str,
    ) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) FROM tasks \
             WHERE client_id = $1 AND {NOT_DELETED} AND {TERMINAL_GUARD}"
        ))
        .bind(client_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    pub async fn list_active_by_client(
        &self,
        client_id: &str,
    ) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.clause("client_id", client_id);
        filter.raw(TERMINAL_GUARD);
        self.fetch_page(
            filter,
            "updated_at DESC".to_string(),
            Params::new(1, 100),
        )
        .await
    }

    pub async fn list_pending(&self, params: Params) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.clause("status", TaskStatus::Pending.as_str());
        self.fetch_page(filter, "created_at ASC".to_string(), params)
            .await
    }

    pub async fn list_active(&self, params: Params) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.raw(TERMINAL_GUARD);
        self.fetch_page(filter, "created_at ASC".to_string(), params)
            .await
    }

    /// Soft-deleted rows older than the cutoff; the only query that reads
    /// tombstones.
    pub async fn list_to_delete(
        &self,
        older_than: DateTime<Utc>,
        params: Params,
    ) -> Result<Page<Task>> {
        let mut filter = Filter::tombstoned();
        filter.clause_lt("deleted_at", &fmt_ts(older_than));
        self.fetch_page(filter, "created_at ASC".to_string(), params)
            .await
    }

    /// Active status but results already present.
    pub async fn list_stuck(&self, params: Params) -> Result<Page<Task>> {
        let mut filter = Filter::new();
        filter.raw(TERMINAL_GUARD);
        filter.raw("results IS NOT NULL");
        self.fetch_page(filter, "created_at ASC".to_string(), params)
            .await
    }

    /// Soft-delete a client's tasks, optionally restricted to the given ids.
    /// Returns the ids actually tombstoned.
    pub async fn soft_delete_client(
        &self,
        client_id: &str,
        inactive_only: bool,
        ids: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let mut sql = format!(
            "UPDATE tasks SET deleted_at = $1 \
             WHERE client_id = $2 AND {NOT_DELETED}"
        );
        let mut position = 3;
        if inactive_only {
            sql.push_str(
                " AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')",
            );
        }
        if let Some(ids) = ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&in_clause("id", &mut position, ids.len()));
        }
        sql.push_str(" RETURNING id");
        let mut query = sqlx::query(&sql)
            .bind(fmt_ts(Utc::now()))
            .bind(client_id);
        for id in ids.unwrap_or_default() {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Into::into))
            .collect()
    }

    /// Admin variant: soft-delete arbitrary ids regardless of owner.
    pub async fn soft_delete_by_ids(
        &self,
        ids: &[String],
        inactive_only: bool,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "UPDATE tasks SET deleted_at = $1 WHERE {NOT_DELETED}"
        );
        let mut position = 2;
        if inactive_only {
            sql.push_str(
                " AND status IN ('COMPLETED', 'FAILED', 'CANCELLED')",
            );
        }
        sql.push_str(&in_clause("id", &mut position, ids.len()));
        sql.push_str(" RETURNING id");
        let mut query = sqlx::query(&sql).bind(fmt_ts(Utc::now()));
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Into::into))
            .collect()
    }

    pub async fn soft_delete(&self, task_id: &str) -> Result<bool> {
        let updated = sqlx::query(&format!(
            "UPDATE tasks SET deleted_at = $1 \
             WHERE id = $2 AND {NOT_DELETED}"
        ))
        .bind(fmt_ts(Utc::now()))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Hard delete; the maintenance sweeper calls this for expired
    /// tombstones.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Dispatcher failure path: drop the row created for a payload that
    /// never made it into place.
    pub async fn delete_by_flow(
        &self,
        client_id: &str,
        flow_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM tasks WHERE client_id = $1 AND flow_id = $2",
        )
        .bind(client_id)
        .bind(flow_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Shutdown hook: no RUNNING rows may survive a dispatcher restart.
    pub async fn mark_all_active_failed(&self) -> Result<u64> {
        let updated = sqlx::query(&format!(
            "UPDATE tasks SET status = 'FAILED', input_request_id = NULL, \
             updated_at = $1 WHERE {NOT_DELETED} AND {TERMINAL_GUARD}"
        ))
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    /// Reaper for input prompts nobody answered.
    pub async fn update_waiting_for_input_to_failed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let updated = sqlx::query(&format!(
            "UPDATE tasks SET status = 'FAILED', input_request_id = NULL, \
             updated_at = $1 \
             WHERE status = 'WAITING_FOR_INPUT' AND updated_at < $2 \
             AND {NOT_DELETED}"
        ))
        .bind(fmt_ts(Utc::now()))
        .bind(fmt_ts(older_than))
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected())
    }

    async fn fetch_page(
        &self,
        filter: Filter,
        order: String,
        params: Params,
    ) -> Result<Page<Task>> {
        let params = params.clamped();
        let where_sql = filter.where_sql();

        let count_sql =
            format!("SELECT COUNT(*) FROM tasks WHERE {where_sql}");
        let mut count_query = sqlx::query(&count_sql);
        for bind in &filter.binds {
            count_query = count_query.bind(bind);
        }
        let total =
            count_query.fetch_one(&self.pool).await?.try_get::<i64, _>(0)?
                as u64;

        let limit_pos = filter.binds.len() + 1;
        let select_sql = format!(
            "SELECT {COLUMNS} FROM tasks WHERE {where_sql} \
             ORDER BY {order} LIMIT ${limit_pos} OFFSET ${}",
            limit_pos + 1
        );
        let mut select_query = sqlx::query(&select_sql);
        for bind in &filter.binds {
            select_query = select_query.bind(bind);
        }
        let rows = select_query
            .bind(params.size as i64)
            .bind(params.offset() as i64)
            .fetch_all(&self.pool)
            .await?;
        let items = rows
            .iter()
            .map(row_to_task)
            .collect::<Result<Vec<Task>>>()?;
        Ok(Page::new(items, total, params))
    }
}

/// WHERE-clause builder; every bound value is TEXT.
struct Filter {
    clauses: Vec<String>,
    binds: Vec<String>,
}

impl Filter {
    fn new() -> Self {
        Self {
            clauses: vec![NOT_DELETED.to_string()],
            binds: Vec::new(),
        }
    }

    /// Start from tombstoned rows instead of live ones.
    fn tombstoned() -> Self {
        Self {
            clauses: vec!["deleted_at IS NOT NULL".to_string()],
            binds: Vec::new(),
        }
    }

    fn clause(&mut self, column: &str, value: &str) {
        self.binds.push(value.to_string());
        self.clauses
            .push(format!("{column} = ${}", self.binds.len()));
    }

    fn clause_lt(&mut self, column: &str, value: &str) {
        self.binds.push(value.to_string());
        self.clauses
            .push(format!("{column} < ${}", self.binds.len()));
    }

    fn raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn search(&mut self, term: Option<&str>) {
        if let Some(term) = term.filter(|t| !t.is_empty()) {
            let pattern = format!("%{term}%");
            let first = self.binds.len() + 1;
            self.binds.push(pattern.clone());
            self.binds.push(pattern.clone());
            self.binds.push(pattern);
            self.clauses.push(format!(
                "(filename LIKE ${first} OR flow_id LIKE ${} OR \
                 status LIKE ${})",
                first + 1,
                first + 2
            ));
        }
    }

    fn where_sql(&self) -> String {
        self.clauses.join(" AND ")
    }
}

fn in_clause(column: &str, position: &mut usize, count: usize) -> String {
    let placeholders: Vec<String> = (0..count)
        .map(|i| format!("${}", *position + i))
        .collect();
    *position += count;
    format!(" AND {column} IN ({})", placeholders.join(", "))
}

/// Sortable columns exposed through the API; anything else falls back to
/// insertion order.
fn order_clause(order_by: Option<&str>, descending: bool) -> String {
    let column = match order_by {
        Some("id") => "id",
        Some("flow_id") => "flow_id",
        Some("filename") => "filename",
        Some("status") => "status",
        Some("updated_at") => "updated_at",
        _ => "created_at",
    };
    let direction = if descending { "DESC" } else { "ASC" };
    format!("{column} {direction}")
}

fn encode_results(results: Option<&TaskResults>) -> Result<Option<String>> {
    results
        .map(serde_json::to_string)
        .transpose()
        .map_err(Into::into)
}

fn row_to_task(row: &AnyRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let status: TaskStatus = status
        .parse()
        .map_err(|e: waldiez_runner_model::task_status::UnknownStatus| {
            RunnerError::internal(e.to_string())
        })?;
    let results: Option<String> = row.try_get("results")?;
    let results = results
        .as_deref()
        .map(serde_json::from_str::<TaskResults>)
        .transpose()?;
    let schedule_type: Option<String> = row.try_get("schedule_type")?;
    Ok(Task {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        flow_id: row.try_get("flow_id")?,
        filename: row.try_get("filename")?,
        status,
        input_timeout: row.try_get::<i64, _>("input_timeout")? as u32,
        input_request_id: row.try_get("input_request_id")?,
        results,
        schedule_type: schedule_type.and_then(|s| s.parse().ok()),
        scheduled_time: opt_ts(row, "scheduled_time")?,
        cron_expression: row.try_get("cron_expression")?,
        expires_at: opt_ts(row, "expires_at")?,
        triggered_at: opt_ts(row, "triggered_at")?,
        created_at: req_ts(row, "created_at")?,
        updated_at: req_ts(row, "updated_at")?,
        deleted_at: opt_ts(row, "deleted_at")?,
    })
}

fn opt_ts(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref().map(parse_ts).transpose()
}

fn req_ts(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_ts(&raw)
}
