//! Per-host job daemon.
//!
//! Keeps a table of [`Job`]s keyed by job id and answers [`JobRequest`]s
//! one at a time, however many clients are connected. Failures never travel
//! as errors: every command replies with [`SUCCESS`], [`FAIL`],
//! `"true"`/`"false"` or a comma-joined list.

use crate::error::{PipemeshError, Result};
use crate::jobs::job::{Job, LoaderCommand};
use crate::jobs::protocol::{read_frame, write_frame, JobCommand, JobReply, JobRequest};
use crate::pipeline::ModuleRegistry;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// A connection that stays silent this long is dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

const PENDING_REQUESTS: usize = 64;

pub struct JobDaemon {
    loader: LoaderCommand,
    output_dir: PathBuf,
    registry: Arc<ModuleRegistry>,
    jobs: BTreeMap<String, Job>,
}

impl JobDaemon {
    /// `output_dir` must exist; it is canonicalized here.
    pub fn new(
        loader: LoaderCommand,
        output_dir: impl AsRef<Path>,
        registry: Arc<ModuleRegistry>,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        let output_dir = output_dir.canonicalize().map_err(|e| {
            PipemeshError::Config(format!("invalid output directory {:?}: {}", output_dir, e))
        })?;
        if !output_dir.is_dir() {
            return Err(PipemeshError::Config(format!(
                "output path {:?} is not a directory",
                output_dir
            )));
        }
        Ok(Self {
            loader,
            output_dir,
            registry,
            jobs: BTreeMap::new(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Execute one request against the job table.
    pub fn handle(&mut self, request: &JobRequest) -> JobReply {
        let Some(command) = JobCommand::parse(&request.command) else {
            tracing::warn!("invalid command: '{}'", request.command);
            return JobReply::fail();
        };
        tracing::debug!(%command, job = %request.jobid, "request");
        match self.execute(command, request) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(%command, job = %request.jobid, "request failed: {}", e);
                JobReply::fail()
            }
        }
    }

    fn execute(&mut self, command: JobCommand, request: &JobRequest) -> Result<JobReply> {
        match command {
            JobCommand::Create => {
                if request.jobid.is_empty() || request.json.is_empty() {
                    return Err(PipemeshError::Job("create needs jobid and json".into()));
                }
                if self.jobs.contains_key(&request.jobid) {
                    return Err(PipemeshError::Job(format!(
                        "job '{}' already exists",
                        request.jobid
                    )));
                }
                let job = Job::create(
                    self.loader.clone(),
                    &self.output_dir,
                    &request.jobid,
                    &request.json,
                )?;
                self.jobs.insert(request.jobid.clone(), job);
                Ok(JobReply::success())
            }
            JobCommand::Start => {
                self.job_mut(&request.jobid)?.start()?;
                Ok(JobReply::success())
            }
            JobCommand::Kill => Ok(flag_reply(self.job_mut(&request.jobid)?.kill())),
            JobCommand::IsRunning => {
                let running = self.job_mut(&request.jobid)?.is_running();
                Ok(JobReply::new(running.to_string()))
            }
            JobCommand::Clear => {
                if !self.job_mut(&request.jobid)?.clear() {
                    return Ok(JobReply::fail());
                }
                self.jobs.remove(&request.jobid);
                Ok(JobReply::success())
            }
            JobCommand::List => Ok(JobReply::new(self.job_ids().join(","))),
            JobCommand::Modules => Ok(JobReply::new(self.registry.list_types().join(","))),
        }
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| PipemeshError::Job(format!("unknown job '{}'", id)))
    }

    /// Answer requests on `listener` until `shutdown` resolves.
    ///
    /// Each connection is read on its own task; requests are executed here
    /// one at a time, in arrival order.
    pub async fn serve<F>(&mut self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("job daemon listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        let (pending_tx, mut pending) = mpsc::channel::<Pending>(PENDING_REQUESTS);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("job daemon shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(%peer, "client connected");
                    let pending_tx = pending_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, pending_tx).await {
                            tracing::debug!(%peer, "connection closed: {}", e);
                        }
                    });
                }
                Some((request, reply_tx)) = pending.recv() => {
                    let _ = reply_tx.send(self.handle(&request));
                }
            }
        }
    }
}

/// A request waiting for the daemon, with the slot its reply goes to.
type Pending = (JobRequest, oneshot::Sender<JobReply>);

async fn serve_connection(mut stream: TcpStream, daemon: mpsc::Sender<Pending>) -> Result<()> {
    loop {
        let request: JobRequest =
            match tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut stream)).await {
                Ok(Ok(request)) => request,
                Ok(Err(PipemeshError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Ok(Err(PipemeshError::Serialization(e))) => {
                    tracing::warn!("malformed request: {}", e);
                    write_frame(&mut stream, &JobReply::fail()).await?;
                    continue;
                }
                // Stream position is lost; reply once and hang up
                Ok(Err(PipemeshError::Protocol(e))) => {
                    tracing::warn!("dropping client: {}", e);
                    write_frame(&mut stream, &JobReply::fail()).await?;
                    return Err(PipemeshError::Protocol(e));
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(PipemeshError::Timeout("client idle".into())),
            };
        let (reply_tx, reply_rx) = oneshot::channel();
        if daemon.send((request, reply_tx)).await.is_err() {
            return Ok(());
        }
        let Ok(reply) = reply_rx.await else {
            return Ok(());
        };
        write_frame(&mut stream, &reply).await?;
    }
}

fn flag_reply(ok: bool) -> JobReply {
    if ok {
        JobReply::success()
    } else {
        JobReply::fail()
    }
}

impl std::fmt::Debug for JobDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDaemon")
            .field("output_dir", &self.output_dir)
            .field("jobs", &self.job_ids())
            .finish()
    }
}
