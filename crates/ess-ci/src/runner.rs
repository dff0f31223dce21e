//! Stage process execution.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CiError, Result};

/// Result of a stage execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success, -1 = killed or no code).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,

    /// The stage ran past its timeout and was killed.
    pub timed_out: bool,

    /// The build was aborted while this stage ran.
    pub cancelled: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// A failure that never reached a running process (spawn error, checkout
    /// error).
    pub fn infrastructure_failure(
        stage_name: impl Into<String>,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            exit_code: -1,
            stderr: message.into(),
            duration_ms,
            ..Self::default()
        }
    }

    /// Short reason for a failed stage.
    pub fn failure_reason(&self) -> String {
        if self.cancelled {
            "aborted".to_string()
        } else if self.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with code {}", self.exit_code)
        }
    }
}

/// Time the output readers get once the stage's processes are gone.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// Spawns stage processes.
pub struct CiRunner;

impl CiRunner {
    /// Execute a command and wait for it, its timeout, or cancellation.
    ///
    /// The child leads its own process group. When the command ends, times
    /// out or is cancelled, the whole group is killed, so nothing the stage
    /// forked outlives it. A timeout or cancellation returns `Ok` with
    /// `timed_out` or `cancelled` set; only a process that cannot be spawned
    /// or waited on is an `Err`.
    pub async fn execute_command(
        stage_name: &str,
        argv: &[String],
        cwd: &Path,
        env: &BTreeMap<String, String>,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<StageResult> {
        let start = Instant::now();

        let (exe, args) = argv.split_first().ok_or_else(|| CiError::EmptyCommand {
            stage: stage_name.to_string(),
        })?;

        debug!(stage = %stage_name, program = %exe, cwd = %cwd.display(), "spawning stage process");

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|source| CiError::Spawn {
            stage: stage_name.to_string(),
            program: exe.clone(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = {
            let wait = async {
                if timeout_secs > 0 {
                    tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait())
                        .await
                        .ok()
                } else {
                    Some(child.wait().await)
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                status = wait => Some(status),
            }
        };

        group.kill();
        if !matches!(waited, Some(Some(_))) {
            if let Err(e) = child.kill().await {
                debug!(stage = %stage_name, error = %e, "stage process already gone");
            }
        }
        let stdout = drain(stage_name, stdout).await;
        let stderr = drain(stage_name, stderr).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut result = StageResult {
            stage_name: stage_name.to_string(),
            exit_code: -1,
            stdout,
            stderr,
            duration_ms,
            ..StageResult::default()
        };

        match waited {
            None => {
                result.cancelled = true;
                result.stderr.push_str("stage aborted\n");
            }
            Some(None) => {
                result.timed_out = true;
                result
                    .stderr
                    .push_str(&format!("stage timed out after {timeout_secs} seconds\n"));
            }
            Some(Some(status)) => {
                let status = status.map_err(|source| CiError::Wait {
                    stage: stage_name.to_string(),
                    source,
                })?;
                result.exit_code = status.code().unwrap_or(-1);
                result.success = status.success();
            }
        }

        Ok(result)
    }
}

/// Process group led by a stage process.
///
/// Killed explicitly once the stage is over, or on drop when the stage's
/// future is abandoned part way.
struct ProcessGroup {
    leader: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { leader: child.id() }
    }

    fn kill(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(leader as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid = leader, error = %e, "failed to kill stage process group"),
            }
        }
        #[cfg(not(unix))]
        let _ = leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!(error = %e, "stage output read failed");
            }
            buf
        })
    })
}

async fn drain(stage_name: &str, reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let abort = reader.abort_handle();
    match tokio::time::timeout(OUTPUT_GRACE, reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(stage = %stage_name, error = %e, "stage output reader failed");
            String::new()
        }
        Err(_) => {
            // A process outside the stage's group still holds the pipe.
            abort.abort();
            warn!(stage = %stage_name, "stage output still open after the stage ended");
            String::new()
        }
    }
}
