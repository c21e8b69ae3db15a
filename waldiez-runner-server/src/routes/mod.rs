//! Versioned route organization.

pub mod v1;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/tasks",
            get(v1::tasks::get_client_tasks)
                .post(v1::tasks::create_task)
                .delete(v1::tasks::delete_tasks),
        )
        .route("/api/v1/tasks/upload", post(v1::tasks::upload_workflow))
        .route("/api/v1/admin/tasks", get(v1::tasks::get_all_tasks))
        .route(
            "/api/v1/tasks/{task_id}",
            get(v1::tasks::get_task)
                .patch(v1::tasks::update_task)
                .delete(v1::tasks::delete_task),
        )
        .route("/api/v1/tasks/{task_id}/cancel", post(v1::tasks::cancel_task))
        .route("/api/v1/tasks/{task_id}/input", post(v1::tasks::task_input))
        .route(
            "/api/v1/tasks/{task_id}/download",
            get(v1::tasks::download_task),
        )
        .route("/ws/{task_id}", get(crate::ws::ws_handler))
}
