//! Multi-host job rollout on top of a [`JobTransport`].
//!
//! Every operation reports one [`StatusLine`] per host, printed as
//! `host<TAB>port<TAB>jobid<TAB>STATUS`. An unreachable daemon only fails
//! the line for its own host.

use crate::deploy::DeploymentPlan;
use crate::error::{PipemeshError, Result, ResultExt};
use crate::jobs::client::JobTransport;
use crate::jobs::protocol::{JobCommand, JobReply, JobRequest};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    /// Deployed but not confirmed running.
    Stale,
    /// Never deployed.
    Failed,
    Stopped,
    Cleared,
    Unknown,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::Running => "RUNNING",
            JobStatus::Stale => "STALE",
            JobStatus::Failed => "FAILED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Cleared => "CLEARED",
            JobStatus::Unknown => "UNKNOWN",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub host: String,
    pub port: u16,
    pub jobid: String,
    pub status: JobStatus,
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t{}\t{}\t{}", self.host, self.port, self.jobid, self.status)
    }
}

pub struct Orchestrator<T: JobTransport> {
    transport: T,
    port: u16,
}

impl<T: JobTransport> Orchestrator<T> {
    /// `port` is the daemon port assumed on every host.
    pub fn new(transport: T, port: u16) -> Self {
        Self { transport, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn line(&self, host: &str, jobid: &str, status: JobStatus) -> StatusLine {
        StatusLine {
            host: host.to_string(),
            port: self.port,
            jobid: jobid.to_string(),
            status,
        }
    }

    /// Reply from `host`, or `None` after logging a communication failure.
    fn reply(&self, host: &str, request: &JobRequest) -> Option<JobReply> {
        match self.transport.exchange(host, self.port, request) {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::warn!("failed to communicate with {}:{}: {}", host, self.port, e);
                None
            }
        }
    }

    fn succeeds(&self, host: &str, request: &JobRequest) -> bool {
        self.reply(host, request).is_some_and(|r| r.is_success())
    }

    pub fn create(&self, host: &str, jobid: &str, json: &str) -> bool {
        self.succeeds(
            host,
            &JobRequest::new(JobCommand::Create)
                .with_job(jobid)
                .with_json(json),
        )
    }

    pub fn start(&self, host: &str, jobid: &str) -> bool {
        self.succeeds(host, &JobRequest::new(JobCommand::Start).with_job(jobid))
    }

    pub fn kill(&self, host: &str, jobid: &str) -> bool {
        self.succeeds(host, &JobRequest::new(JobCommand::Kill).with_job(jobid))
    }

    pub fn clear(&self, host: &str, jobid: &str) -> bool {
        self.succeeds(host, &JobRequest::new(JobCommand::Clear).with_job(jobid))
    }

    pub fn is_running(&self, host: &str, jobid: &str) -> bool {
        self.reply(host, &JobRequest::new(JobCommand::IsRunning).with_job(jobid))
            .is_some_and(|r| r.is_true())
    }

    /// Job ids known to `host`; empty when unreachable.
    pub fn list(&self, host: &str) -> Vec<String> {
        self.reply(host, &JobRequest::new(JobCommand::List))
            .map(|r| r.items())
            .unwrap_or_default()
    }

    pub fn modules(&self, host: &str) -> Result<Vec<String>> {
        self.transport
            .exchange(host, self.port, &JobRequest::new(JobCommand::Modules))
            .map(|r| r.items())
    }

    /// Module types from `required` that `host` cannot instantiate.
    pub fn check_modules(&self, host: &str, required: &BTreeSet<String>) -> Result<Vec<String>> {
        let available: BTreeSet<String> = self.modules(host)?.into_iter().collect();
        Ok(required.difference(&available).cloned().collect())
    }

    /// Verify, create and start `jobid` on every host of `plan`.
    ///
    /// Creation stops at the first failing host; nothing is started then, and
    /// hosts already holding the job are reported `STALE`.
    pub fn deploy(&self, plan: &DeploymentPlan, jobid: &str) -> Result<Vec<StatusLine>> {
        let hosts = plan.hosts();
        for host in &hosts {
            let missing = self
                .check_modules(host, &plan.modules(host))
                .with_context(|| format!("verifying modules on {}", host))?;
            if !missing.is_empty() {
                return Err(PipemeshError::Config(format!(
                    "module(s) {} not available on {}",
                    missing.join(", "),
                    host
                )));
            }
            tracing::info!(%host, "modules verified");
        }

        let mut deployed = Vec::new();
        for host in &hosts {
            let Some(config) = plan.get_config(host) else {
                continue;
            };
            let json = config.to_json_pretty()?;
            if !self.create(host, jobid, &json) {
                tracing::error!(%host, %jobid, "job creation failed");
                break;
            }
            tracing::info!(%host, %jobid, "job created");
            deployed.push(host.clone());
        }

        if deployed.len() != hosts.len() {
            return Ok(hosts
                .iter()
                .map(|host| {
                    let status = if deployed.contains(host) {
                        JobStatus::Stale
                    } else {
                        JobStatus::Failed
                    };
                    self.line(host, jobid, status)
                })
                .collect());
        }

        Ok(hosts
            .iter()
            .map(|host| {
                let status = if self.start(host, jobid) {
                    JobStatus::Running
                } else {
                    JobStatus::Failed
                };
                self.line(host, jobid, status)
            })
            .collect())
    }

    /// Kill on every host: `STOPPED` or `UNKNOWN`.
    pub fn kill_all<'a>(&self, hosts: impl IntoIterator<Item = &'a String>, jobid: &str) -> Vec<StatusLine> {
        hosts
            .into_iter()
            .map(|host| {
                let status = if self.kill(host, jobid) {
                    JobStatus::Stopped
                } else {
                    JobStatus::Unknown
                };
                self.line(host, jobid, status)
            })
            .collect()
    }

    /// Clear on every host: `CLEARED` or `UNKNOWN`.
    pub fn clear_all<'a>(&self, hosts: impl IntoIterator<Item = &'a String>, jobid: &str) -> Vec<StatusLine> {
        hosts
            .into_iter()
            .map(|host| self.clear_status(host, jobid))
            .collect()
    }

    /// Kill then clear on every host.
    pub fn stop(&self, hosts: &BTreeSet<String>, jobid: &str) -> Vec<StatusLine> {
        let mut lines = self.kill_all(hosts, jobid);
        lines.extend(self.clear_all(hosts, jobid));
        lines
    }

    /// Every job on `host` with `RUNNING` or `STALE`.
    pub fn list_status(&self, host: &str) -> Vec<StatusLine> {
        self.list(host)
            .iter()
            .map(|jobid| self.running_status(host, jobid))
            .collect()
    }

    pub fn running_status(&self, host: &str, jobid: &str) -> StatusLine {
        let status = if self.is_running(host, jobid) {
            JobStatus::Running
        } else {
            JobStatus::Stale
        };
        self.line(host, jobid, status)
    }

    /// After a successful kill the job's liveness is reported, `UNKNOWN` otherwise.
    pub fn kill_status(&self, host: &str, jobid: &str) -> StatusLine {
        if self.kill(host, jobid) {
            self.running_status(host, jobid)
        } else {
            self.line(host, jobid, JobStatus::Unknown)
        }
    }

    pub fn clear_status(&self, host: &str, jobid: &str) -> StatusLine {
        let status = if self.clear(host, jobid) {
            JobStatus::Cleared
        } else {
            JobStatus::Unknown
        };
        self.line(host, jobid, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DistributedPlanner;
    use crate::jobs::client::MockJobTransport;
    use crate::jobs::protocol::{FAIL, SUCCESS};
    use crate::pipeline::PipelineGraph;
    use mockall::predicate::*;

    fn plan() -> DeploymentPlan {
        let graph = PipelineGraph::from_json_str(
            r##"{"modules": {
                "a": {"type": "Passthrough", "#host": "h1"},
                "b": {"type": "Stats", "#host": "h2"}
            }, "links": [{"from": "a", "to": "b"}]}"##,
        )
        .unwrap();
        DistributedPlanner::new(6000).plan(&graph).unwrap()
    }

    fn all_modules() -> String {
        crate::pipeline::ModuleRegistry::with_builtins()
            .list_types()
            .join(",")
    }

    fn respond(mock: &mut MockJobTransport, command: &'static str, host: &'static str, reply: &str) {
        let reply = reply.to_string();
        mock.expect_exchange()
            .withf(move |h, _, r| h == host && r.command == command)
            .returning(move |_, _, _| Ok(JobReply::new(reply.clone())));
    }

    #[test]
    fn test_status_line_format() {
        let line = StatusLine {
            host: "h1".into(),
            port: 5232,
            jobid: "j".into(),
            status: JobStatus::Stale,
        };
        assert_eq!(line.to_string(), "h1\t5232\tj\tSTALE");
    }

    #[test]
    fn test_deploy_starts_everywhere() {
        let mut mock = MockJobTransport::new();
        let modules = all_modules();
        for host in ["h1", "h2"] {
            respond(&mut mock, "modules", host, &modules);
            respond(&mut mock, "create", host, SUCCESS);
            respond(&mut mock, "start", host, SUCCESS);
        }
        let orchestrator = Orchestrator::new(mock, 5232);
        let lines = orchestrator.deploy(&plan(), "job").unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.status == JobStatus::Running));
    }

    #[test]
    fn test_deploy_reports_stale_and_failed() {
        let mut mock = MockJobTransport::new();
        let modules = all_modules();
        for host in ["h1", "h2"] {
            respond(&mut mock, "modules", host, &modules);
        }
        respond(&mut mock, "create", "h1", SUCCESS);
        mock.expect_exchange()
            .withf(|h, _, r| h == "h2" && r.command == "create")
            .returning(|_, _, _| Err(PipemeshError::Remote("timeout".into())));
        mock.expect_exchange()
            .withf(|_, _, r| r.command == "start")
            .never();

        let lines = Orchestrator::new(mock, 5232).deploy(&plan(), "job").unwrap();
        assert_eq!(lines[0].host, "h1");
        assert_eq!(lines[0].status, JobStatus::Stale);
        assert_eq!(lines[1].host, "h2");
        assert_eq!(lines[1].status, JobStatus::Failed);
    }

    #[test]
    fn test_deploy_aborts_on_missing_module() {
        let mut mock = MockJobTransport::new();
        respond(&mut mock, "modules", "h1", "Passthrough");
        mock.expect_exchange()
            .withf(|_, _, r| r.command == "create")
            .never();
        let err = Orchestrator::new(mock, 5232)
            .deploy(&plan(), "job")
            .unwrap_err();
        assert!(err.to_string().contains("ParProcessor"));
    }

    #[test]
    fn test_deploy_names_unreachable_host() {
        let mut mock = MockJobTransport::new();
        mock.expect_exchange()
            .withf(|h, _, r| h == "h1" && r.command == "modules")
            .returning(|_, _, _| Err(PipemeshError::Remote("connection refused".into())));
        let err = Orchestrator::new(mock, 5232)
            .deploy(&plan(), "job")
            .unwrap_err();
        assert!(matches!(err, PipemeshError::WithContext { .. }));
        assert_eq!(
            err.to_string(),
            "verifying modules on h1: Remote error: connection refused"
        );
    }

    #[test]
    fn test_kill_status_reports_liveness() {
        let mut mock = MockJobTransport::new();
        respond(&mut mock, "kill", "h1", SUCCESS);
        respond(&mut mock, "isrunning", "h1", "false");
        respond(&mut mock, "kill", "h2", FAIL);
        let orchestrator = Orchestrator::new(mock, 1);
        assert_eq!(orchestrator.kill_status("h1", "j").status, JobStatus::Stale);
        assert_eq!(orchestrator.kill_status("h2", "j").status, JobStatus::Unknown);
    }

    #[test]
    fn test_list_status() {
        let mut mock = MockJobTransport::new();
        respond(&mut mock, "list", "h", "a,b");
        mock.expect_exchange()
            .with(always(), eq(5232), function(|r: &JobRequest| r.command == "isrunning"))
            .returning(|_, _, r| Ok(JobReply::new((r.jobid == "a").to_string())));
        let lines = Orchestrator::new(mock, 5232).list_status("h");
        assert_eq!(
            lines.iter().map(|l| l.status).collect::<Vec<_>>(),
            vec![JobStatus::Running, JobStatus::Stale]
        );
    }

    #[test]
    fn test_stop_kills_then_clears() {
        let mut mock = MockJobTransport::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, _, r| r.command == "kill")
            .returning(|_, _, _| Ok(JobReply::success()));
        mock.expect_exchange()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|_, _, r| r.command == "clear")
            .returning(|_, _, _| Ok(JobReply::success()));
        let hosts = BTreeSet::from(["h".to_string()]);
        let lines = Orchestrator::new(mock, 5232).stop(&hosts, "j");
        assert_eq!(lines[0].status, JobStatus::Stopped);
        assert_eq!(lines[1].status, JobStatus::Cleared);
    }
}
