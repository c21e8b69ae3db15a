//! Admission control: everything that must hold before a task row exists.

pub mod env_vars;

use std::collections::BTreeMap;
use std::path::Path;

use md5::{Digest, Md5};
use rand::Rng;
use tokio::io::AsyncRead;
use url::Url;
use waldiez_runner_model::ScheduleType;

use crate::db::TaskRepository;
use crate::error::{Result, RunnerError};
use crate::storage::{has_allowed_extension, Storage};

pub use env_vars::parse_env_vars;

/// URL schemes a remote payload may come from.
pub const ALLOWED_REMOTE_URL_SCHEMES: [&str; 4] =
    ["https", "ftps", "sftp", "s3"];

/// Where the payload comes from; exactly one of the three.
pub enum PayloadSource {
    Upload {
        filename: String,
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
    Url(String),
    /// A previously-uploaded path, relative to the client's storage prefix.
    Path(String),
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadSource::Upload { filename, .. } => {
                f.debug_struct("Upload").field("filename", filename).finish()
            }
            PayloadSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            PayloadSource::Path(path) => {
                f.debug_tuple("Path").field(path).finish()
            }
        }
    }
}

#[derive(Debug)]
pub struct AdmissionRequest<'a> {
    pub client_id: &'a str,
    pub source: PayloadSource,
    pub env_vars: Option<&'a str>,
    pub force: bool,
    /// Per-client concurrency cap; `0` disables the check.
    pub max_jobs: usize,
    pub schedule_type: Option<ScheduleType>,
}

/// What admission hands to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedTask {
    pub flow_id: String,
    pub filename: String,
    pub saved_path: String,
    pub env_vars: BTreeMap<String, String>,
}

/// Validate a submission end to end: concurrency cap, payload resolution,
/// duplicate-flow detection, env-var sanitization.
pub async fn validate_task_input(
    repo: &TaskRepository,
    storage: &dyn Storage,
    request: AdmissionRequest<'_>,
) -> Result<AdmittedTask> {
    if request.schedule_type.is_some() {
        return Err(RunnerError::internal("Scheduling not supported yet"));
    }

    let active = repo.list_active_by_client(request.client_id).await?;
    if request.max_jobs > 0 && active.items.len() >= request.max_jobs {
        return Err(RunnerError::TooManyActive {
            max_jobs: request.max_jobs,
        });
    }

    let (filename, digest, mut saved_path) = match request.source {
        PayloadSource::Upload { filename, reader } => {
            let saved = storage
                .save_upload(request.client_id, &filename, reader)
                .await?;
            (filename, saved.digest, saved.path)
        }
        PayloadSource::Url(url) => {
            let filename = filename_from_url(&url)?;
            let saved = storage
                .fetch_url(request.client_id, &url, &filename)
                .await?;
            (filename, saved.digest, saved.path)
        }
        PayloadSource::Path(path) => {
            let joined = format!("{}/{path}", request.client_id);
            let resolved = storage
                .resolve(&joined)
                .ok_or_else(|| {
                    RunnerError::invalid_input("Invalid file path")
                })?;
            if !storage.is_file(&resolved).await {
                return Err(RunnerError::invalid_input("Invalid file path"));
            }
            let filename = Path::new(&resolved)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    RunnerError::invalid_input("Invalid file path")
                })?;
            let digest = storage.hash(&resolved).await?;
            (filename, digest, joined)
        }
    };

    let base_flow_id = format!("{digest}-{}", &md5_hex(&filename)[..8]);
    let duplicate = active
        .items
        .iter()
        .find(|task| task.flow_id == base_flow_id);

    let flow_id = match duplicate {
        Some(task) if !request.force => {
            storage.delete_file(&saved_path).await?;
            return Err(RunnerError::DuplicateFlow {
                task_id: task.id.clone(),
                status: task.status,
            });
        }
        Some(_) => {
            // Make this run unique: fresh fingerprint, payload claimed
            // under a randomized name.
            let nonce: [u8; 4] = rand::rng().random();
            saved_path = storage.move_to_random_name(&saved_path).await?;
            format!("{base_flow_id}-{}", hex::encode(nonce))
        }
        None => base_flow_id,
    };

    let env_vars = parse_env_vars(request.env_vars)?;
    Ok(AdmittedTask {
        flow_id,
        filename,
        saved_path,
        env_vars,
    })
}

/// Workflow payloads must at least parse before a task is accepted for
/// later use. `.py` entry points are opaque; `.waldiez`/`.json` are JSON
/// documents.
pub async fn validate_workflow_file(path: &str) -> Result<()> {
    if path.ends_with(".py") {
        return Ok(());
    }
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        RunnerError::WorkflowValidation(format!("unreadable workflow: {e}"))
    })?;
    serde_json::from_str::<serde_json::Value>(&contents)
        .map(|_| ())
        .map_err(|e| {
            RunnerError::WorkflowValidation(format!("invalid workflow: {e}"))
        })
}

/// Derive and validate the filename for a remote payload.
pub fn filename_from_url(raw: &str) -> Result<String> {
    let scheme_ok = ALLOWED_REMOTE_URL_SCHEMES
        .iter()
        .any(|scheme| raw.starts_with(&format!("{scheme}://")));
    if !scheme_ok {
        return Err(RunnerError::invalid_input("Invalid file URL"));
    }
    let url = Url::parse(raw)
        .map_err(|_| RunnerError::invalid_input("Invalid file URL"))?;
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("workflow");
    if has_allowed_extension(segment) {
        Ok(segment.to_string())
    } else if !segment.contains('.') {
        // No extension at all: assume the default workflow format.
        Ok(format!("{segment}.waldiez"))
    } else {
        Err(RunnerError::invalid_input("Invalid file URL"))
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic duplicate-detection fingerprint:
/// `md5(content) + "-" + md5(filename)[..8]`.
pub fn flow_fingerprint(content_digest: &str, filename: &str) -> String {
    format!("{content_digest}-{}", &md5_hex(filename)[..8])
}
