//! Daemon request/reply messages and their TCP framing.
//!
//! Each message is a JSON document preceded by its length as a `u32`
//! big-endian integer. A connection carries one request and one reply at a
//! time.

use crate::error::{PipemeshError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reply for a command that succeeded.
pub const SUCCESS: &str = "/ success /";

/// Reply for a command that failed or was not understood.
pub const FAIL: &str = "/ fail /";

/// Upper bound on one control message.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Commands understood by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Create,
    Start,
    Kill,
    IsRunning,
    List,
    Modules,
    Clear,
}

impl JobCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCommand::Create => "create",
            JobCommand::Start => "start",
            JobCommand::Kill => "kill",
            JobCommand::IsRunning => "isrunning",
            JobCommand::List => "list",
            JobCommand::Modules => "modules",
            JobCommand::Clear => "clear",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Some(match text {
            "create" => JobCommand::Create,
            "start" => JobCommand::Start,
            "kill" => JobCommand::Kill,
            "isrunning" => JobCommand::IsRunning,
            "list" => JobCommand::List,
            "modules" => JobCommand::Modules,
            "clear" => JobCommand::Clear,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{command, jobid?, json?}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jobid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub json: String,
}

impl JobRequest {
    pub fn new(command: JobCommand) -> Self {
        Self {
            command: command.as_str().to_string(),
            ..Default::default()
        }
    }

    pub fn with_job(mut self, jobid: impl Into<String>) -> Self {
        self.jobid = jobid.into();
        self
    }

    pub fn with_json(mut self, json: impl Into<String>) -> Self {
        self.json = json.into();
        self
    }
}

/// `{reply}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReply {
    pub reply: String,
}

impl JobReply {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(SUCCESS)
    }

    pub fn fail() -> Self {
        Self::new(FAIL)
    }

    pub fn is_success(&self) -> bool {
        self.reply == SUCCESS
    }

    /// `true` for a `"true"` reply, as sent by `isrunning`.
    pub fn is_true(&self) -> bool {
        self.reply == "true"
    }

    /// Split a comma-joined `list` / `modules` reply.
    pub fn items(&self) -> Vec<String> {
        self.reply
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .map_err(|_| PipemeshError::Serialization("control message too large".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PipemeshError::Protocol(format!(
            "control message of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
