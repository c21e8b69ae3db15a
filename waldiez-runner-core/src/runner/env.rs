//! Scratch-directory staging and virtualenv setup for one job.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};
use waldiez_runner_model::TaskResponse;

use crate::error::{Result, RunnerError};
use crate::storage::Storage;

/// Bundled child app: a small Python program that executes the workflow and
/// speaks the Redis I/O protocol. Staged into every scratch directory.
const SHIM_FILES: [(&str, &str); 3] = [
    ("main.py", include_str!("shim/main.py")),
    ("waldiez_io.py", include_str!("shim/waldiez_io.py")),
    ("requirements.txt", include_str!("shim/requirements.txt")),
];

/// Per-job scratch layout:
/// `<tmp>/wlz-brk-XXXX/<client_id>/<task_id>/{app,venv}`.
#[derive(Debug)]
pub struct Scratch {
    root: TempDir,
    pub app_dir: PathBuf,
    pub venv_dir: PathBuf,
    pub file_path: PathBuf,
}

impl Scratch {
    pub fn create(task: &TaskResponse) -> Result<Self> {
        let root = tempfile::Builder::new().prefix("wlz-brk-").tempdir()?;
        let task_dir = root.path().join(&task.client_id).join(&task.id);
        let app_dir = task_dir.join("app");
        let venv_dir = task_dir.join("venv");
        std::fs::create_dir_all(&app_dir)?;
        std::fs::create_dir_all(&venv_dir)?;
        let file_path = app_dir.join(&task.filename);
        Ok(Self {
            root,
            app_dir,
            venv_dir,
            file_path,
        })
    }

    /// Best-effort removal; a leftover scratch dir is only disk noise.
    pub fn cleanup(self) {
        let path = self.root.path().to_path_buf();
        if let Err(e) = self.root.close() {
            tracing::warn!(
                "failed to remove scratch directory {}: {e}",
                path.display()
            );
        } else {
            debug!("removed scratch directory {}", path.display());
        }
    }
}

/// Stage the app skeleton and the task payload, then build the venv unless
/// dependency setup is skipped. Any error here is fatal for the task.
pub async fn prepare_app_env(
    storage: &dyn Storage,
    task: &TaskResponse,
    scratch: &Scratch,
    skip_deps: bool,
) -> Result<()> {
    for (name, contents) in SHIM_FILES {
        tokio::fs::write(scratch.app_dir.join(name), contents).await?;
    }
    let payload_src =
        format!("{}/{}/{}", task.client_id, task.id, task.filename);
    storage
        .copy_file(&payload_src, &scratch.file_path.to_string_lossy())
        .await?;

    if skip_deps {
        info!("skipping dependency setup for task {}", task.id);
        return Ok(());
    }
    build_venv(&scratch.venv_dir).await?;
    let python = venv_python(&scratch.venv_dir);
    run_pip(&python, &scratch.app_dir, &["install", "--upgrade", "pip"])
        .await?;
    run_pip(
        &python,
        &scratch.app_dir,
        &["install", "-r", "requirements.txt"],
    )
    .await?;
    Ok(())
}

/// Invoke the platform venv builder with access to system site packages.
async fn build_venv(venv_dir: &Path) -> Result<()> {
    let status = Command::new(system_python())
        .arg("-m")
        .arg("venv")
        .arg("--system-site-packages")
        .arg(venv_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(RunnerError::internal(format!(
            "venv creation failed with status {status}"
        )));
    }
    Ok(())
}

async fn run_pip(python: &Path, cwd: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new(python)
        .arg("-m")
        .arg("pip")
        .args(args)
        .current_dir(cwd)
        .env("PYTHONUNBUFFERED", "1")
        .stdout(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(RunnerError::internal(format!(
            "Failed to run pip with args: {args:?}"
        )));
    }
    Ok(())
}

pub fn venv_python(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        return venv_dir.join("Scripts").join("python.exe");
    }
    let python3 = venv_dir.join("bin").join("python3");
    if python3.exists() {
        python3
    } else {
        venv_dir.join("bin").join("python")
    }
}

fn system_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}
