//! Wire records exchanged between the queue, pools and front-ends.
//!
//! Every peer speaks framed JSON [`Message`]s. Fields that are absent on the
//! wire default to their zero value on receipt, and zero-valued fields are
//! omitted when encoding, so the format stays compatible across versions.

use serde::{Deserialize, Serialize};

/// Outcome of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Finished normally, output is the captured stdout.
    Success,
    /// Timed out, output is the stdout gathered so far.
    Timeout,
    /// Output exceeded the limit, output is capped at the limit.
    Overflow,
    /// Aborted on request, output is the stdout gathered so far.
    Abort,
    /// Sandbox exited with a non-zero code.
    Crash,
    /// Transient runtime failure (spawn, I/O, queue full); may be retried.
    Error,
    /// Unrecoverable user error (duplicate id, malformed task); must not be
    /// retried automatically.
    Fatal,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Timeout => write!(f, "timeout"),
            Status::Overflow => write!(f, "overflow"),
            Status::Abort => write!(f, "abort"),
            Status::Crash => write!(f, "crash"),
            Status::Error => write!(f, "error"),
            Status::Fatal => write!(f, "fatal"),
        }
    }
}

/// Execution limits enforced on a sandboxed job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum execution wall-clock time in seconds.
    #[serde(default)]
    pub time: u64,

    /// Main memory (in megabytes) allocated to the sandbox.
    #[serde(default)]
    pub memory: u64,

    /// Fraction (in percent) of main memory usable as scratch disk space.
    #[serde(default)]
    pub disk: u64,

    /// Maximum size of the output in bytes.
    #[serde(default)]
    pub output: usize,
}

/// Description of a task to be run in a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Name of the root filesystem image.
    #[serde(default)]
    pub environment: String,

    /// Relative path to the task filesystem image.
    #[serde(default)]
    pub taskfs: String,

    /// Limits enforced in the sandbox.
    #[serde(default)]
    pub limits: Limits,
}

/// Kind tag of a wire message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MsgKind {
    /// Periodic liveness probe, consumed by the connection layer.
    #[default]
    KeepAlive,
    /// A pool advertises its concurrency capacity to the queue.
    RegisterPool,
    /// Submit a job (task + input) for execution.
    Launch,
    /// Final result of a job.
    Done,
    /// Request cancellation of a running job.
    Abort,
    /// Request a snapshot of the queue state.
    Status,
    /// Any kind this version does not know; logged and dropped.
    #[serde(other)]
    Unknown,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// A message on the wire: a kind tag plus the fields the kind uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message: MsgKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub capacity: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl Message {
    pub fn keep_alive() -> Self {
        Message {
            message: MsgKind::KeepAlive,
            ..Default::default()
        }
    }

    pub fn register_pool(capacity: usize) -> Self {
        Message {
            message: MsgKind::RegisterPool,
            capacity,
            ..Default::default()
        }
    }

    pub fn launch(id: impl Into<String>, task: Task, input: impl Into<String>) -> Self {
        Message {
            message: MsgKind::Launch,
            id: id.into(),
            task: Some(task),
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn done(id: impl Into<String>, status: Status, output: impl Into<String>) -> Self {
        Message {
            message: MsgKind::Done,
            id: id.into(),
            status: Some(status),
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn abort(id: impl Into<String>) -> Self {
        Message {
            message: MsgKind::Abort,
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn status_request(id: impl Into<String>) -> Self {
        Message {
            message: MsgKind::Status,
            id: id.into(),
            ..Default::default()
        }
    }
}
