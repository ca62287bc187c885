//! Job control plane.
//!
//! ```text
//! Orchestrator ──JobTransport──► JobDaemon (one per host)
//!                                   └── Job ──► `pipemesh load --json <id>.json`
//! ```

pub mod client;
pub mod daemon;
pub mod job;
pub mod orchestrator;
pub mod protocol;

pub use client::{JobTransport, TcpTransport};
pub use daemon::JobDaemon;
pub use job::{Job, LoaderCommand};
pub use orchestrator::{JobStatus, Orchestrator, StatusLine};
pub use protocol::{JobCommand, JobReply, JobRequest, FAIL, SUCCESS};
