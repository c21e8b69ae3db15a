//! Route-level tests over an in-process context: SQLite in memory, local
//! storage in a temp dir, the in-memory job queue. Paths that need a live
//! Redis (cancel publish, the bridge pumps) are covered by their crate's
//! own tests.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;
use waldiez_runner_core::broker::{InMemoryJobQueue, JobQueue};
use waldiez_runner_core::db::DatabaseManager;
use waldiez_runner_core::redis::RedisManager;
use waldiez_runner_core::storage::{LocalStorage, Storage as _};
use waldiez_runner_core::{AppContext, RunnerConfig};
use waldiez_runner_model::{Audience, TaskStatus};

use crate::auth::TokenVerifier;
use crate::state::AppState;

struct TestApp {
    router: Router,
    queue: Arc<InMemoryJobQueue>,
    verifier: Arc<TokenVerifier>,
    ctx: Arc<AppContext>,
    _storage_dir: tempfile::TempDir,
}

impl TestApp {
    async fn new() -> Self {
        let storage_dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(storage_dir.path()).unwrap();
        let db =
            DatabaseManager::connect("sqlite::memory:").await.unwrap();
        db.ensure_schema().await.unwrap();
        let queue = Arc::new(InMemoryJobQueue::new());
        let ctx = Arc::new(AppContext::new(
            db,
            Arc::new(storage),
            RedisManager::new("redis://127.0.0.1:6379/0").unwrap(),
            queue.clone(),
            RunnerConfig {
                max_jobs: 3,
                ..RunnerConfig::default()
            },
        ));
        let verifier = Arc::new(TokenVerifier::new("test-secret"));
        let router =
            crate::build_router(AppState::new(ctx.clone(), verifier.clone()));
        Self {
            router,
            queue,
            verifier,
            ctx,
            _storage_dir: storage_dir,
        }
    }

    fn token(&self, client_id: &str, audience: Audience) -> String {
        self.verifier.issue(client_id, &[audience]).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }
}

const BOUNDARY: &str = "X-RUNNER-TEST-BOUNDARY";

fn multipart_body(
    fields: &[(&str, &str)],
    file: Option<(&str, &[u8])>,
) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn create_request(
    token: &str,
    fields: &[(&str, &str)],
    file: Option<(&str, &[u8])>,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/tasks")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(fields, file)))
        .unwrap()
}

fn get_request(token: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn requests_without_a_token_are_unauthorized() {
    let app = TestApp::new().await;
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/tasks")
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["detail"], "Not authenticated");
}

#[tokio::test]
async fn create_task_accepts_an_upload_and_enqueues() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let request = create_request(
        &token,
        &[
            ("env_vars", r#"{"FOO": "bar"}"#),
            ("input_timeout", "30"),
        ],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["client_id"], "client-1");
    assert_eq!(body["filename"], "hello.waldiez");
    assert_eq!(body["input_timeout"], 30);
    assert!(body["created_at"].as_str().unwrap().ends_with('Z'));

    let job = app
        .queue
        .dequeue(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("job enqueued");
    assert_eq!(job.task.id, body["id"].as_str().unwrap());
    assert_eq!(job.env_vars.get("FOO").map(String::as_str), Some("bar"));

    // The payload now lives under <client>/<task>/<filename>.
    let path = format!("client-1/{}/hello.waldiez", job.task.id);
    assert!(app.ctx.storage.is_file(&path).await);
}

#[tokio::test]
async fn create_task_requires_exactly_one_source() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);

    let (status, body) = app.send(create_request(&token, &[], None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .contains("Either file, file_url or filename"));

    let request = create_request(
        &token,
        &[("filename", "existing.waldiez")],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("Only one of"));
}

#[tokio::test]
async fn duplicate_submission_is_rejected_with_the_existing_task() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let (status, first) = app
        .send(create_request(&token, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send(create_request(&token, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let detail = body["detail"].as_str().unwrap();
    assert_eq!(
        detail,
        format!(
            "A task with the same file already exists. \
             Task ID: {}, status: PENDING",
            first["id"].as_str().unwrap()
        )
    );

    // force=true coins a fresh flow id with a nonce suffix.
    let (status, forced) = app
        .send(create_request(
            &token,
            &[("force", "true")],
            Some(("hello.waldiez", b"{}")),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{forced}");
    let base = first["flow_id"].as_str().unwrap();
    let forced_flow = forced["flow_id"].as_str().unwrap();
    assert!(forced_flow.starts_with(base));
    assert_eq!(forced_flow.len(), base.len() + 9);
}

#[tokio::test]
async fn env_var_violations_surface_as_400() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);

    let request = create_request(
        &token,
        &[("env_vars", r#"{"PATH": "/x"}"#)],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["detail"],
        "Cannot override protected system variable: PATH"
    );

    let request = create_request(
        &token,
        &[("env_vars", r#"{"FOO": "a; rm -rf /"}"#)],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("unsafe characters"));

    let too_many: serde_json::Map<String, Value> = (0..31)
        .map(|i| (format!("VAR_{i}"), Value::String("x".to_string())))
        .collect();
    let raw = Value::Object(too_many).to_string();
    let request = create_request(
        &token,
        &[("env_vars", &raw)],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("exceeds"));
}

#[tokio::test]
async fn concurrency_cap_applies_per_client() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    for i in 0..3 {
        let name = format!("flow-{i}.waldiez");
        let content = format!("{{\"i\": {i}}}");
        let (status, _) = app
            .send(create_request(
                &token,
                &[],
                Some((&name, content.as_bytes())),
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = app
        .send(create_request(&token, &[], Some(("more.waldiez", b"{}"))))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("3"));

    // A different client is not affected.
    let other = app.token("client-2", Audience::TasksApi);
    let (status, _) = app
        .send(create_request(&other, &[], Some(("more.waldiez", b"{}"))))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn schedules_are_rejected_as_unimplemented() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let request = create_request(
        &token,
        &[
            ("schedule_type", "cron"),
            ("cron_expression", "*/5 * * * *"),
        ],
        Some(("hello.waldiez", b"{}")),
    );
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn ownership_is_opaque_to_other_clients() {
    let app = TestApp::new().await;
    let owner = app.token("client-1", Audience::TasksApi);
    let (_, created) = app
        .send(create_request(&owner, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    let task_id = created["id"].as_str().unwrap();

    let (status, body) = app
        .send(get_request(&owner, &format!("/api/v1/tasks/{task_id}")))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], *task_id);

    let stranger = app.token("client-2", Audience::TasksApi);
    let (status, _) = app
        .send(get_request(&stranger, &format!("/api/v1/tasks/{task_id}")))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Admins see every task, including through the admin listing.
    let admin = app.token("root", Audience::Admin);
    let (status, _) = app
        .send(get_request(&admin, &format!("/api/v1/tasks/{task_id}")))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, page) =
        app.send(get_request(&admin, "/api/v1/admin/tasks")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);

    // The admin listing is closed to plain tasks-api tokens.
    let (status, _) =
        app.send(get_request(&owner, "/api/v1/admin/tasks")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn terminal_tasks_reject_update_cancel_and_input() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let (_, created) = app
        .send(create_request(&token, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    let task_id = created["id"].as_str().unwrap().to_string();
    app.ctx
        .tasks()
        .update_status(&task_id, TaskStatus::Completed, None, None, true)
        .await
        .unwrap();

    let request = Request::builder()
        .method("PATCH")
        .uri(format!("/api/v1/tasks/{task_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"input_timeout": 60}"#))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["detail"],
        "Cannot update task with status COMPLETED"
    );

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{task_id}/cancel"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body["detail"],
        "Cannot cancel task with status COMPLETED"
    );

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/tasks/{task_id}/input"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"request_id": "r1", "data": "y"}"#))
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid input request");
}

#[tokio::test]
async fn delete_respects_the_force_flag() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let (_, created) = app
        .send(create_request(&token, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    let task_id = created["id"].as_str().unwrap().to_string();

    // Active without force: refused.
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/tasks/{task_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Cannot delete task with status"));

    // With force: gone, row and storage both.
    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/v1/tasks/{task_id}?force=true"))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.ctx.tasks().get(&task_id).await.unwrap().is_none());
    assert!(
        !app.ctx
            .storage
            .is_dir(&format!("client-1/{task_id}"))
            .await
    );
}

#[tokio::test]
async fn bulk_delete_requires_ids() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/v1/tasks")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Task IDs must be specified for deletion");
}

#[tokio::test]
async fn download_of_a_missing_archive_is_404() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);
    let (_, created) = app
        .send(create_request(&token, &[], Some(("hello.waldiez", b"{}"))))
        .await;
    let task_id = created["id"].as_str().unwrap();

    // The task folder exists (payload moved there), so the download works.
    let request =
        get_request(&token, &format!("/api/v1/tasks/{task_id}/download"));
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/zip"
    );

    // An unknown task is a plain 404.
    let request =
        get_request(&token, "/api/v1/tasks/does-not-exist/download");
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn upload_validates_the_workflow_document() {
    let app = TestApp::new().await;
    let token = app.token("client-1", Audience::TasksApi);

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks/upload")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(
            &[],
            Some(("flow.waldiez", b"not json at all")),
        )))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/tasks/upload")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(
            &[],
            Some(("flow.waldiez", b"{\"nodes\": []}")),
        )))
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.ctx.storage.is_file("client-1/flow.waldiez").await);
}
