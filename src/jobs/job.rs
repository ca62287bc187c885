//! One pipeline process managed by the daemon.

use crate::error::{PipemeshError, Result};
use chrono::{DateTime, Local};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// How the daemon launches a pipeline: `program args... --json <file>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LoaderCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Job ids name files in the output directory, so they must stay a single
/// plain path component.
pub fn validate_job_id(id: &str) -> Result<()> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) || id.contains("..") {
        return Err(PipemeshError::Job(format!("invalid job id '{}'", id)));
    }
    Ok(())
}

/// A job's description file, its captured output and its process.
///
/// Dropping a job kills the process and removes the captured output.
#[derive(Debug)]
pub struct Job {
    id: String,
    json_file: PathBuf,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    loader: LoaderCommand,
    created: DateTime<Local>,
    child: Option<Child>,
}

impl Job {
    /// Write `json` to `<output_dir>/<id>.json` and record the job, not started.
    pub fn create(loader: LoaderCommand, output_dir: &Path, id: &str, json: &str) -> Result<Self> {
        validate_job_id(id)?;
        let json_file = output_dir.join(format!("{}.json", id));
        std::fs::write(&json_file, json).map_err(|e| {
            PipemeshError::Job(format!("cannot write {:?}: {}", json_file, e))
        })?;
        let job = Self {
            id: id.to_string(),
            stdout_file: output_dir.join(format!("{}.out", id)),
            stderr_file: output_dir.join(format!("{}.err", id)),
            json_file,
            loader,
            created: Local::now(),
            child: None,
        };
        tracing::info!(
            job = %job.id,
            json = ?job.json_file,
            stdout = ?job.stdout_file,
            stderr = ?job.stderr_file,
            loader = ?job.loader.program,
            "new job"
        );
        Ok(job)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn json_file(&self) -> &Path {
        &self.json_file
    }

    pub fn stdout_file(&self) -> &Path {
        &self.stdout_file
    }

    pub fn stderr_file(&self) -> &Path {
        &self.stderr_file
    }

    pub fn created(&self) -> DateTime<Local> {
        self.created
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Launch the loader with output redirected to the job's files.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(PipemeshError::Job(format!("job '{}' is already running", self.id)));
        }
        let stdout = File::create(&self.stdout_file)?;
        let stderr = File::create(&self.stderr_file)?;
        let child = Command::new(&self.loader.program)
            .args(&self.loader.args)
            .arg("--json")
            .arg(&self.json_file)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                PipemeshError::Job(format!(
                    "cannot launch {:?} for job '{}': {}",
                    self.loader.program, self.id, e
                ))
            })?;
        tracing::info!(job = %self.id, pid = child.id(), "job started");
        self.child = Some(child);
        Ok(())
    }

    /// Whether the process is alive. Reaps it if it has exited.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                tracing::debug!(job = %self.id, %status, "job exited");
                false
            }
            Some(Err(e)) => {
                tracing::warn!(job = %self.id, "cannot query job status: {}", e);
                false
            }
            None => false,
        }
    }

    /// Terminate a running process. Returns `false` if it was not running.
    pub fn kill(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(mut child) = self.child.take() else {
            return false;
        };
        if let Err(e) = child.kill() {
            tracing::warn!(job = %self.id, "kill failed: {}", e);
        }
        if let Err(e) = child.wait() {
            tracing::warn!(job = %self.id, "wait after kill failed: {}", e);
        }
        tracing::info!(job = %self.id, "job killed");
        true
    }

    /// Remove captured output. Refused while the process runs.
    pub fn clear(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        self.child = None;
        for path in [&self.stdout_file, &self.stderr_file] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(job = %self.id, "cannot remove {:?}: {}", path, e),
            }
        }
        true
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.kill();
        self.clear();
    }
}
