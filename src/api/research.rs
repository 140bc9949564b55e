//! Research task endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::error::ApiError;
use super::routes::AppState;
use super::types::{
    ConfigResponse, HealthResponse, ListParams, StatusResponse, SubmitAccepted, SubmitCached,
    SubmitRequest,
};
use crate::notify::TaskEvent;
use crate::store::{ListQuery, TaskPage};
use crate::task::{render_markdown, validate_task_text, JobId, Task, TaskDetail, TaskId, TaskStatus};

const DEFAULT_PER_PAGE: u32 = 20;

/// Unparseable ids cannot exist, so they are reported as not found.
fn parse_task_id(raw: &str) -> Result<TaskId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Task {raw} not found")))
}

/// Create a task and queue it, or answer from the result cache.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let text = validate_task_text(&req.task, state.config.max_task_chars)
        .map_err(ApiError::Validation)?;
    let user_id = req.user_id.filter(|u| !u.trim().is_empty());

    if req.use_cache.unwrap_or(true) {
        if let Some(hit) = state.cache.get(&text).await {
            let mut task = Task::queued(text, user_id);
            task.from_cache = true;
            let metrics = hit.metrics.clone();
            let task = state
                .store
                .insert_completed(task, hit.messages, hit.metrics)
                .await?;
            tracing::info!(
                task_id = %task.id,
                source_task_id = %hit.source_task_id,
                "Research task answered from cache"
            );
            state
                .notifier
                .publish(TaskEvent::completed(task.id, &metrics, true));

            let detail = state.store.get_detail(task.id).await?;
            let body = SubmitCached {
                task_id: task.id,
                status: TaskStatus::Completed,
                from_cache: true,
                task: detail,
            };
            return Ok((StatusCode::OK, Json(body)).into_response());
        }
    }

    let job_id = JobId::new();
    let mut task = Task::queued(text, user_id);
    task.job_id = Some(job_id);
    let task = state.store.create_task(task).await?;
    // The row is already stored as queued. A task cannot fail without being
    // claimed, so an enqueue error leaves it for startup recovery.
    match state.queue.enqueue_job(task.id, job_id) {
        Ok(()) => tracing::info!(task_id = %task.id, job_id = %job_id, "Research task queued"),
        Err(e) => tracing::warn!(
            task_id = %task.id,
            job_id = %job_id,
            error = %e,
            "Could not enqueue research task; leaving it for recovery"
        ),
    }

    let body = SubmitAccepted {
        task_id: task.id,
        job_id,
        status: TaskStatus::Queued,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<TaskPage>, ApiError> {
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(ApiError::Validation)?;

    let page = state
        .store
        .list(ListQuery {
            page: params.page.unwrap_or(1),
            per_page: params.per_page.unwrap_or(DEFAULT_PER_PAGE),
            status,
            user_id: params.user_id,
        })
        .await?;
    Ok(Json(page))
}

pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = parse_task_id(&id)?;
    let task = state.store.get_task(id).await?;
    let message_count = state.store.message_count(id).await?;
    Ok(Json(StatusResponse {
        task_id: task.id,
        status: task.status,
        progress: task.progress,
        error: task.error,
        message_count,
        from_cache: task.from_cache,
    }))
}

/// Full task. Messages are partial while the task is still running.
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, ApiError> {
    let id = parse_task_id(&id)?;
    Ok(Json(state.store.get_detail(id).await?))
}

pub async fn export_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_task_id(&id)?;
    let detail = state.store.get_detail(id).await?;
    let disposition = format!("attachment; filename=\"research-{id}.md\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/markdown; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        render_markdown(&detail),
    )
        .into_response())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store.ping().await;
    let cache = state.cache.ping().await;

    let healthy = store.is_ok() && !matches!(cache, Some(Err(_)));
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        store: match &store {
            Ok(()) => "connected".to_string(),
            Err(e) => e.to_string(),
        },
        cache: match &cache {
            None => "off".to_string(),
            Some(Ok(())) => format!("connected ({})", state.cache.backend_name()),
            Some(Err(e)) => e.to_string(),
        },
        queue_pending: state.queue.pending(),
        subscribers: state.notifier.subscriber_count(),
    };

    if healthy {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        tracing::error!(store = %body.store, cache = %body.cache, "Health check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        config: state.config.public_view(),
        provider: state.provider.clone(),
        cache_enabled: state.cache.is_enabled(),
    })
}
