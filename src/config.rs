use std::path::PathBuf;
use std::time::Duration;

use crate::net::Addr;

/// Interval at which keep-alive messages are sent on idle connections.
/// Shall be set before the connection is created and not altered afterwards.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Initial interval between dial attempts. Doubled after each failure, up to
/// [`MAX_RETRY_INTERVAL`].
pub const INITIAL_RETRY_INTERVAL: Duration = Duration::from_millis(32);

/// Maximum interval between dial attempts.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub keep_alive: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
        }
    }
}

impl ConnConfig {
    pub fn with_keep_alive(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }

    /// Duration after which a connection without inbound traffic is
    /// considered dead.
    pub fn read_timeout(&self) -> Duration {
        3 * self.keep_alive
    }
}

/// Queue component settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Address the queue listens on.
    pub listen: Addr,

    /// Maximum number of jobs waiting to be dispatched.
    pub capacity: usize,

    pub conn: ConnConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            listen: Addr::Tcp("127.0.0.1:9000".into()),
            capacity: 500,
            conn: ConnConfig::default(),
        }
    }
}

/// Location of the sandbox binary and its filesystem images.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    /// Path to the sandbox executable.
    pub sandbox: PathBuf,

    /// Directory containing the root filesystem environments.
    pub env_dir: PathBuf,

    /// Directory containing the task filesystems.
    pub tasks_dir: PathBuf,
}

impl Default for SandboxPaths {
    fn default() -> Self {
        Self {
            sandbox: "vm/uml".into(),
            env_dir: "vm".into(),
            tasks_dir: "tasks".into(),
        }
    }
}

/// Pool component settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Address of the queue.
    pub queue: Addr,

    /// Maximum number of sandboxes running at the same time.
    pub capacity: usize,

    pub paths: SandboxPaths,

    pub conn: ConnConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queue: Addr::Tcp("127.0.0.1:9000".into()),
            capacity: 1,
            paths: SandboxPaths::default(),
            conn: ConnConfig::default(),
        }
    }
}
