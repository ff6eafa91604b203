use std::io::Write;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxPaths;
use crate::message::{Status, Task};

/// Shared control block between a running job and its abort handles.
///
/// Cancelling the interrupt token is idempotent and never blocks, so a kill
/// requested before the watcher is ready is not lost.
struct Control {
    interrupt: CancellationToken,
    abort: AtomicBool,
}

/// Handle to request termination of a job from another task.
#[derive(Clone)]
pub struct JobHandle {
    ctl: Arc<Control>,
}

impl JobHandle {
    /// Abort the execution of the job. The job reports `abort` status with
    /// the output gathered so far.
    pub fn abort(&self) {
        self.ctl.abort.store(true, Ordering::SeqCst);
        self.ctl.interrupt.cancel();
    }
}

/// The combination of a task and an input, executed inside a sandbox.
pub struct Job {
    pub task: Task,
    pub input: String,
    pub paths: SandboxPaths,
    ctl: Arc<Control>,
}

impl Job {
    pub fn new(task: Task, input: impl Into<String>, paths: SandboxPaths) -> Job {
        Job {
            task,
            input: input.into(),
            paths,
            ctl: Arc::new(Control {
                interrupt: CancellationToken::new(),
                abort: AtomicBool::new(false),
            }),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            ctl: self.ctl.clone(),
        }
    }

    /// Run the job in a sandbox, wait for it to complete, time out or be
    /// aborted, and return the result. All tasks spawned for the execution
    /// are joined before this returns.
    pub async fn execute(&self) -> (Status, String) {
        match self.run().await {
            Ok(result) => result,
            Err(e) => (Status::Error, e.to_string()),
        }
    }

    async fn run(&self) -> std::io::Result<(Status, String)> {
        // The sandbox cannot read from its standard input, so the input is
        // materialized in a file handed over as a read-only block device.
        let mut inputfile = tempfile::Builder::new()
            .prefix("pythia-input-")
            .tempfile()?;
        inputfile.write_all(self.input.as_bytes())?;
        inputfile.flush()?;

        let mut cmd = self.sandbox_command(inputfile.path());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("sandbox stdout was not piped"))?;
        let pid = child.id().map(|id| id as i32);

        // Watcher: kills the whole sandbox process group on timeout or
        // interrupt. The kill happens even when the job already finished, so
        // no group members are left behind.
        let ctl = self.ctl.clone();
        let time_limit = Duration::from_secs(self.task.limits.time);
        let watch = tokio::spawn(async move {
            let timed_out = tokio::select! {
                _ = tokio::time::sleep(time_limit) => true,
                _ = ctl.interrupt.cancelled() => false,
            };
            if let Some(pid) = pid {
                let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
            }
            timed_out
        });

        // Gatherer: buffers the combined output, kills the sandbox as soon
        // as the output limit is exceeded.
        let ctl = self.ctl.clone();
        let limit = self.task.limits.output;
        let gather = tokio::spawn(async move {
            let mut stdout = stdout;
            // One byte larger than the limit to catch overflows.
            let mut buffer = vec![0u8; limit + 1];
            let mut read = 0;
            let mut overflow = false;
            let mut err = None;
            loop {
                match stdout.read(&mut buffer[read..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        read += n;
                        if read > limit {
                            overflow = true;
                            ctl.interrupt.cancel();
                            break;
                        }
                    }
                    Err(e) => {
                        err = Some(e);
                        ctl.interrupt.cancel();
                        break;
                    }
                }
            }
            let mut len = read.min(limit);
            // Embedded NUL bytes are a sandbox artefact marking end-of-output.
            if let Some(nul) = buffer[..len].iter().position(|&b| b == 0) {
                len = nul;
            }
            let output = String::from_utf8_lossy(&buffer[..len]).replace("\r\n", "\n");
            (output, overflow, err)
        });

        let waited = child.wait().await;
        // Unblock the watcher on normal exit as well; its group kill reaps
        // any stragglers the sandbox left running.
        self.ctl.interrupt.cancel();
        let timed_out = watch.await.unwrap_or_default();
        let (output, overflow, read_err) = gather
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let exit = waited?;
        if let Some(e) = read_err {
            return Err(e);
        }
        let status = if self.ctl.abort.load(Ordering::SeqCst) {
            Status::Abort
        } else if overflow {
            Status::Overflow
        } else if timed_out {
            Status::Timeout
        } else if !exit.success() {
            Status::Crash
        } else {
            Status::Success
        };
        Ok((status, output))
    }

    /// Build the sandbox invocation: root and task filesystems and the input
    /// file as read-only block devices, console on the output pipe, and the
    /// in-sandbox memory and disk limits. The argument grammar belongs to
    /// the sandbox; it is passed through opaquely.
    fn sandbox_command(&self, inputfile: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.paths.sandbox);
        cmd.arg(format!(
            "ubd0r={}.sfs",
            self.paths.env_dir.join(&self.task.environment).display()
        ))
        .arg(format!(
            "ubd1r={}",
            self.paths.tasks_dir.join(&self.task.taskfs).display()
        ))
        .arg(format!("ubd2r={}", inputfile.display()))
        .arg("con0=null,fd:1")
        .arg("init=/init")
        .arg("ro")
        .arg("quiet")
        .arg(format!("mem={}m", self.task.limits.memory))
        .arg(format!("disksize={}%", self.task.limits.disk))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
        // New session so the sandbox tree can be signalled as one group;
        // stderr joins the output pipe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(1, 2) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }
}
