//! Task routes.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use waldiez_runner_core::admission::{
    validate_task_input, validate_workflow_file, AdmissionRequest,
    PayloadSource,
};
use waldiez_runner_core::dispatcher;
use waldiez_runner_core::redis::io_stream::TaskIoStream;
use waldiez_runner_core::storage::Storage as _;
use waldiez_runner_model::{
    InputResponse, Page, Params, ScheduleType, Task, TaskCreate,
    TaskResponse, TaskStatus, TaskUpdate,
};

use crate::auth::{AdminClient, MaybeAdminClient, TasksApiClient};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_type: Option<String>,
}

impl ListQuery {
    fn params(&self) -> Params {
        Params::new(self.page.unwrap_or(1), self.size.unwrap_or(50))
    }

    fn descending(&self) -> bool {
        self.order_type.as_deref() == Some("desc")
    }
}

pub async fn get_client_tasks(
    State(state): State<AppState>,
    client: TasksApiClient,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<TaskResponse>>> {
    let page = state
        .ctx
        .tasks()
        .list_by_client(
            &client.client_id,
            query.params(),
            query.search.as_deref(),
            query.order_by.as_deref(),
            query.descending(),
        )
        .await?;
    Ok(Json(page.map(TaskResponse::from)))
}

pub async fn get_all_tasks(
    State(state): State<AppState>,
    _admin: AdminClient,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<TaskResponse>>> {
    let page = state
        .ctx
        .tasks()
        .list_all(
            query.params(),
            query.search.as_deref(),
            query.order_by.as_deref(),
            query.descending(),
        )
        .await?;
    Ok(Json(page.map(TaskResponse::from)))
}

/// Multipart form accepted by `POST /api/v1/tasks`.
#[derive(Debug, Default)]
struct CreateTaskForm {
    file: Option<(String, Vec<u8>)>,
    file_url: Option<String>,
    filename: Option<String>,
    env_vars: Option<String>,
    input_timeout: Option<u32>,
    force: bool,
    schedule_type: Option<String>,
    scheduled_time: Option<String>,
    cron_expression: Option<String>,
    expires_at: Option<String>,
}

impl CreateTaskForm {
    async fn parse(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(|e| {
            ApiError::bad_request(format!("invalid multipart body: {e}"))
        })? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let filename =
                        field.file_name().unwrap_or_default().to_string();
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::bad_request(format!(
                            "failed to read upload: {e}"
                        ))
                    })?;
                    form.file = Some((filename, bytes.to_vec()));
                }
                other => {
                    let value = field.text().await.map_err(|e| {
                        ApiError::bad_request(format!(
                            "failed to read field {other}: {e}"
                        ))
                    })?;
                    form.set_text_field(other, value)?;
                }
            }
        }
        Ok(form)
    }

    fn set_text_field(
        &mut self,
        name: &str,
        value: String,
    ) -> ApiResult<()> {
        let value = Some(value).filter(|v| !v.is_empty());
        match name {
            "file_url" => self.file_url = value,
            "filename" => self.filename = value,
            "env_vars" => self.env_vars = value,
            "input_timeout" => {
                self.input_timeout = value
                    .map(|v| v.parse())
                    .transpose()
                    .map_err(|_| {
                        ApiError::bad_request("invalid input_timeout")
                    })?;
            }
            "force" => {
                self.force = value.as_deref() == Some("true")
                    || value.as_deref() == Some("1");
            }
            "schedule_type" => self.schedule_type = value,
            "scheduled_time" => self.scheduled_time = value,
            "cron_expression" => self.cron_expression = value,
            "expires_at" => self.expires_at = value,
            _ => {}
        }
        Ok(())
    }

    fn schedule_type(&self) -> ApiResult<Option<ScheduleType>> {
        match self.schedule_type.as_deref() {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                ApiError::bad_request(format!(
                    "invalid schedule_type: {raw}"
                ))
            }),
        }
    }

    fn source(self) -> ApiResult<(PayloadSource, CreateTaskMeta)> {
        let provided = [
            self.file.is_some(),
            self.file_url.is_some(),
            self.filename.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if provided == 0 {
            return Err(ApiError::bad_request(
                "Either file, file_url or filename must be provided",
            ));
        }
        if provided > 1 {
            return Err(ApiError::bad_request(
                "Only one of `file`, `file_url` or `filename` can be \
                 provided",
            ));
        }
        let meta = CreateTaskMeta {
            env_vars: self.env_vars,
            input_timeout: self.input_timeout,
            force: self.force,
            schedule_type: self.schedule_type,
            scheduled_time: self.scheduled_time,
            cron_expression: self.cron_expression,
            expires_at: self.expires_at,
        };
        let source = if let Some((filename, bytes)) = self.file {
            PayloadSource::Upload {
                filename,
                reader: Box::new(std::io::Cursor::new(bytes)),
            }
        } else if let Some(url) = self.file_url {
            PayloadSource::Url(url)
        } else {
            PayloadSource::Path(self.filename.expect("checked above"))
        };
        Ok((source, meta))
    }
}

#[derive(Debug)]
struct CreateTaskMeta {
    env_vars: Option<String>,
    input_timeout: Option<u32>,
    force: bool,
    schedule_type: Option<String>,
    scheduled_time: Option<String>,
    cron_expression: Option<String>,
    expires_at: Option<String>,
}

fn parse_datetime(
    raw: Option<&str>,
    field: &str,
) -> ApiResult<Option<DateTime<Utc>>> {
    raw.map(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| {
                ApiError::bad_request(format!("invalid {field}: {value}"))
            })
    })
    .transpose()
}

pub async fn create_task(
    State(state): State<AppState>,
    client: TasksApiClient,
    multipart: Multipart,
) -> ApiResult<Json<TaskResponse>> {
    let form = CreateTaskForm::parse(multipart).await?;
    let schedule_type = form.schedule_type()?;
    let (source, meta) = form.source()?;

    let admitted = validate_task_input(
        &state.ctx.tasks(),
        state.ctx.storage.as_ref(),
        AdmissionRequest {
            client_id: &client.client_id,
            source,
            env_vars: meta.env_vars.as_deref(),
            force: meta.force,
            max_jobs: state.ctx.config.max_jobs,
            schedule_type,
        },
    )
    .await?;

    let task_create = TaskCreate {
        client_id: client.client_id.clone(),
        flow_id: admitted.flow_id.clone(),
        filename: admitted.filename.clone(),
        input_timeout: meta
            .input_timeout
            .unwrap_or(state.ctx.config.input_timeout),
        schedule_type,
        scheduled_time: parse_datetime(
            meta.scheduled_time.as_deref(),
            "scheduled_time",
        )?,
        cron_expression: meta.cron_expression.clone(),
        expires_at: parse_datetime(meta.expires_at.as_deref(), "expires_at")?,
    };
    if let Err(message) = task_create.validate_schedule() {
        let _ = state.ctx.storage.delete_file(&admitted.saved_path).await;
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message,
        ));
    }

    let task = dispatcher::create_and_dispatch(
        &state.ctx,
        task_create,
        &admitted.saved_path,
        admitted.env_vars,
    )
    .await?;
    Ok(Json(TaskResponse::from(task)))
}

pub async fn upload_workflow(
    State(state): State<AppState>,
    client: TasksApiClient,
    mut multipart: Multipart,
) -> ApiResult<StatusCode> {
    let mut saved = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::bad_request(format!("invalid multipart body: {e}"))
    })? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(|e| {
                ApiError::bad_request(format!("failed to read upload: {e}"))
            })?;
            let upload = state
                .ctx
                .storage
                .save_upload(
                    &client.client_id,
                    &filename,
                    Box::new(std::io::Cursor::new(bytes.to_vec())),
                )
                .await?;
            saved = Some((filename, upload));
        }
    }
    let Some((filename, upload)) = saved else {
        return Err(ApiError::bad_request("Invalid file"));
    };

    let absolute = state
        .ctx
        .storage
        .resolve(&upload.path)
        .ok_or_else(|| ApiError::bad_request("Invalid file"))?;
    if let Err(e) = validate_workflow_file(&absolute).await {
        let _ = state.ctx.storage.delete_file(&upload.path).await;
        return Err(e.into());
    }

    let destination = format!("{}/{filename}", client.client_id);
    // Re-uploads replace the previous copy.
    state.ctx.storage.delete_file(&destination).await?;
    if let Err(e) = state
        .ctx
        .storage
        .move_file(&upload.path, &destination)
        .await
    {
        let _ = state.ctx.storage.delete_file(&upload.path).await;
        return Err(e.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a task enforcing ownership; admins bypass the owner check. The
/// 404 is deliberately opaque for rows owned by someone else.
async fn owned_task(
    state: &AppState,
    task_id: &str,
    client_id: &str,
    is_admin: bool,
) -> ApiResult<Task> {
    let task = state.ctx.tasks().get(task_id).await?;
    match task {
        Some(task) if is_admin || task.client_id == client_id => Ok(task),
        _ => Err(ApiError::not_found("Task")),
    }
}

pub async fn get_task(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let task =
        owned_task(&state, &task_id, &client.client_id, client.is_admin)
            .await?;
    Ok(Json(TaskResponse::from(task)))
}

pub async fn update_task(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Path(task_id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> ApiResult<Json<TaskResponse>> {
    let task =
        owned_task(&state, &task_id, &client.client_id, client.is_admin)
            .await?;
    if task.is_inactive() {
        return Err(ApiError::bad_request(format!(
            "Cannot update task with status {}",
            task.status
        )));
    }
    let updated = state
        .ctx
        .tasks()
        .update(&task_id, &update)
        .await?
        .ok_or_else(|| ApiError::not_found("Task"))?;
    Ok(Json(TaskResponse::from(updated)))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskResponse>> {
    let task =
        owned_task(&state, &task_id, &client.client_id, client.is_admin)
            .await?;
    let cancelled = dispatcher::cancel(&state.ctx, &task).await?;
    Ok(Json(TaskResponse::from(cancelled)))
}

pub async fn task_input(
    State(state): State<AppState>,
    client: TasksApiClient,
    Path(task_id): Path<String>,
    Json(message): Json<InputResponse>,
) -> ApiResult<StatusCode> {
    let task =
        owned_task(&state, &task_id, &client.client_id, false).await?;
    if task.status != TaskStatus::WaitingForInput {
        return Err(ApiError::bad_request("Invalid input request"));
    }
    if task.input_request_id.as_deref() != Some(message.request_id.as_str())
    {
        tracing::warn!(
            "input request id mismatch for task {task_id}: {} vs {:?}",
            message.request_id,
            task.input_request_id
        );
        return Err(ApiError::bad_request("Invalid input request"));
    }
    let io =
        TaskIoStream::new(&task_id, state.ctx.redis.connection().await?);
    io.publish_input_response(&message).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn download_task(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    let task =
        owned_task(&state, &task_id, &client.client_id, client.is_admin)
            .await?;
    let task_dir = format!("{}/{}", task.client_id, task.id);
    if !state.ctx.storage.is_dir(&task_dir).await {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "Task archive does not exist",
        ));
    }
    let archive = state
        .ctx
        .storage
        .download_archive(&task.client_id, &task.id)
        .await?;
    // Reopen, then let the named file vanish; the handle keeps the bytes.
    let file = archive
        .reopen()
        .map_err(|e| ApiError::internal(e.to_string()))?;
    drop(archive);
    let stream = ReaderStream::new(tokio::fs::File::from_std(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}.zip\"",
            task.id
        ))
        .map_err(|e| ApiError::internal(e.to_string()))?,
    );
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().extend(headers);
    Ok(response)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: Option<bool>,
    /// Comma-separated task ids for the bulk endpoint.
    #[serde(default)]
    pub ids: Option<String>,
}

pub async fn delete_task(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Path(task_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    let task =
        owned_task(&state, &task_id, &client.client_id, client.is_admin)
            .await?;
    if task.is_active() && query.force != Some(true) {
        return Err(ApiError::bad_request(format!(
            "Cannot delete task with status {}",
            task.status
        )));
    }
    state.ctx.tasks().soft_delete(&task_id).await?;
    dispatcher::delete_task_data(&state.ctx, &task.id, &task.client_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_tasks(
    State(state): State<AppState>,
    client: MaybeAdminClient,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    let ids: Vec<String> = query
        .ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(ApiError::bad_request(
            "Task IDs must be specified for deletion",
        ));
    }
    let inactive_only = query.force != Some(true);
    let repo = state.ctx.tasks();
    if client.is_admin {
        repo.soft_delete_by_ids(&ids, inactive_only).await?;
    } else {
        repo.soft_delete_client(
            &client.client_id,
            inactive_only,
            Some(&ids),
        )
        .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
