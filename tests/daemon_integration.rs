//! Integration tests for the job daemon over TCP
//!
//! The daemon runs on its own thread and runtime; the orchestrator talks to
//! it through the real TCP transport, the way the command line does.

#![cfg(unix)]

mod common;

use pipemesh::jobs::protocol::MAX_FRAME_LEN;
use pipemesh::jobs::{
    JobDaemon, JobReply, JobStatus, LoaderCommand, Orchestrator, TcpTransport, FAIL,
};
use pipemesh::pipeline::ModuleRegistry;
use serial_test::serial;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

const HOST: &str = "127.0.0.1";

struct RunningDaemon {
    port: u16,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RunningDaemon {
    fn start(output_dir: &std::path::Path, script: &str) -> Self {
        let loader = LoaderCommand::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .arg("loader");
        let mut daemon = JobDaemon::new(
            loader,
            output_dir,
            Arc::new(ModuleRegistry::with_builtins()),
        )
        .unwrap();

        let listener = std::net::TcpListener::bind((HOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                daemon
                    .serve(listener, async {
                        let _ = stopped.await;
                    })
                    .await
                    .unwrap();
            });
        });

        Self {
            port,
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    fn connect(&self) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect((HOST, self.port)).unwrap();
        stream.set_read_timeout(Some(common::test_timeout())).unwrap();
        stream
    }

    fn orchestrator(&self) -> Orchestrator<TcpTransport> {
        Orchestrator::new(TcpTransport::new(Duration::from_secs(5)).unwrap(), self.port)
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[test]
#[serial]
fn test_job_lifecycle_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = RunningDaemon::start(dir.path(), "echo started; exec sleep 30");
    let orchestrator = daemon.orchestrator();

    assert!(orchestrator.create(HOST, "job1", r#"{"modules": {}}"#));
    assert!(!orchestrator.create(HOST, "job1", r#"{"modules": {}}"#));
    assert!(dir.path().join("job1.json").exists());

    assert!(orchestrator.start(HOST, "job1"));
    assert!(common::wait_until(|| orchestrator.is_running(HOST, "job1")));
    assert_eq!(orchestrator.list(HOST), vec!["job1"]);
    assert_eq!(
        orchestrator.running_status(HOST, "job1").status,
        JobStatus::Running
    );

    assert!(common::wait_until(|| {
        std::fs::read_to_string(dir.path().join("job1.out"))
            .map(|s| s.contains("started"))
            .unwrap_or(false)
    }));

    // Clearing a running job is refused
    assert!(!orchestrator.clear(HOST, "job1"));
    assert!(orchestrator.kill(HOST, "job1"));
    assert!(!orchestrator.is_running(HOST, "job1"));
    assert!(orchestrator.clear(HOST, "job1"));
    assert!(!dir.path().join("job1.out").exists());
    assert!(orchestrator.list(HOST).is_empty());
}

#[test]
#[serial]
fn test_modules_and_unknown_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = RunningDaemon::start(dir.path(), "exec sleep 30");
    let orchestrator = daemon.orchestrator();

    let modules = orchestrator.modules(HOST).unwrap();
    for expected in ["ParExecutor", "ParProcessor", "NetworkSink", "NetworkSource"] {
        assert!(modules.iter().any(|m| m == expected), "missing {}", expected);
    }

    assert!(!orchestrator.start(HOST, "ghost"));
    assert!(!orchestrator.kill(HOST, "ghost"));
    assert_eq!(
        orchestrator.kill_status(HOST, "ghost").status,
        JobStatus::Unknown
    );
}

#[test]
#[serial]
fn test_unreachable_daemon_reports_unknown() {
    let orchestrator = Orchestrator::new(
        TcpTransport::new(Duration::from_millis(300)).unwrap(),
        common::free_port(),
    );
    assert!(orchestrator.list(HOST).is_empty());
    assert!(orchestrator.modules(HOST).is_err());
    assert_eq!(
        orchestrator.kill_status(HOST, "job").status,
        JobStatus::Unknown
    );
    assert_eq!(
        orchestrator.running_status(HOST, "job").status,
        JobStatus::Stale
    );
}

/// Everything the daemon sends until it closes the connection.
fn read_until_closed(stream: &mut std::net::TcpStream) -> Vec<u8> {
    use std::io::{ErrorKind, Read};
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                return received
            }
            Err(e) => panic!("connection still open after {} bytes: {}", received.len(), e),
        }
    }
}

#[test]
#[serial]
fn test_oversized_frame_closes_connection() {
    use std::io::Write;
    let dir = tempfile::tempdir().unwrap();
    let daemon = RunningDaemon::start(dir.path(), "exec sleep 30");

    let mut stream = daemon.connect();
    let mut bytes = (MAX_FRAME_LEN as u32 + 1).to_be_bytes().to_vec();
    bytes.extend_from_slice(&[b'{'; 24]);
    stream.write_all(&bytes).unwrap();

    // At most one FAIL reply, then the daemon hangs up
    let received = read_until_closed(&mut stream);
    if !received.is_empty() {
        let len = u32::from_be_bytes(received[..4].try_into().unwrap()) as usize;
        assert_eq!(received.len(), 4 + len);
        let reply: JobReply = serde_json::from_slice(&received[4..]).unwrap();
        assert_eq!(reply.reply, FAIL);
    }

    assert!(daemon.orchestrator().list(HOST).is_empty());
}

#[test]
#[serial]
fn test_silent_client_does_not_block_others() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = RunningDaemon::start(dir.path(), "exec sleep 30");
    let _silent = daemon.connect();

    let orchestrator = Orchestrator::new(
        TcpTransport::new(Duration::from_secs(2)).unwrap(),
        daemon.port,
    );
    let started = std::time::Instant::now();
    assert!(orchestrator.create(HOST, "job1", "{}"));
    assert_eq!(orchestrator.list(HOST), vec!["job1"]);
    assert!(started.elapsed() < Duration::from_secs(2));
}
