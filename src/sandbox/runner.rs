use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Upper bound on how much of each stream is kept in memory
const MAX_CAPTURE_BYTES: usize = 1 << 20;
/// How long to keep draining pipes once the process group is gone
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How the evaluation program ended on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramExit {
    Code(i32),
    Signal(i32),
}

impl From<ExitStatus> for ProgramExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Code(code),
            (None, Some(signal)) => Self::Signal(signal),
            // Neither code nor signal only happens for stopped processes
            (None, None) => Self::Code(-1),
        }
    }
}

/// What the runner observed at the process boundary
#[derive(Debug)]
pub enum RunOutcome {
    Exited {
        exit: ProgramExit,
        stdout: String,
        stderr: String,
    },
    /// The wall-clock limit expired and the process group was killed
    TimedOut { limit: Duration, stderr: String },
    /// The service is shutting down and the process group was killed
    Cancelled { stderr: String },
}

/// Runs one evaluation program as a child process under a wall-clock limit
///
/// The child leads its own process group so that on timeout every
/// descendant it spawned can be killed with a single signal. The runner
/// never looks at the output file.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

enum Waited {
    Exited(std::io::Result<()>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Spawns `command` and waits for it, the timeout or cancellation
    ///
    /// An `Err` means the program could not be started or waited on at all.
    pub async fn run(&self, command: &[OsString], token: &CancellationToken) -> Result<RunOutcome> {
        let Some((program, args)) = command.split_first() else {
            bail!("Empty evaluation command");
        };

        log::debug!("Spawning evaluation program: {command:?}");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.to_string_lossy()))?;

        let pid = child
            .id()
            .and_then(|pid| libc::pid_t::try_from(pid).ok())
            .context("spawned evaluation program has no pid")?;
        let stdout = StreamCapture::start(child.stdout.take());
        let stderr = StreamCapture::start(child.stderr.take());

        let exited = tokio::task::spawn_blocking(move || wait_for_exit(pid));
        let waited = tokio::select! {
            res = exited => Waited::Exited(res.unwrap_or_else(|e| Err(std::io::Error::other(e)))),
            _ = tokio::time::sleep(self.timeout) => Waited::TimedOut,
            _ = token.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(Ok(())) => {
                // The leader is still an unreaped zombie here, so its pgid
                // cannot have been handed to an unrelated process yet.
                kill_process_group(pid);
                let status = match child.wait().await {
                    Ok(status) => status,
                    Err(e) => return Err(e).context("failed to reap evaluation program"),
                };
                let stdout = stdout.finish().await;
                let stderr = stderr.finish().await;

                log::debug!("Evaluation program exited with {status}");
                if !stdout.is_empty() {
                    log::debug!("Script STDOUT:\n{stdout}");
                }
                if !stderr.is_empty() {
                    log::debug!("Script STDERR:\n{stderr}");
                }

                Ok(RunOutcome::Exited {
                    exit: status.into(),
                    stdout,
                    stderr,
                })
            }
            Waited::Exited(Err(e)) => {
                terminate(&mut child, pid).await;
                Err(e).context("failed to wait for evaluation program")
            }
            Waited::TimedOut => {
                log::warn!(
                    "Evaluation program {pid} exceeded {:?}, killing its process group",
                    self.timeout
                );
                terminate(&mut child, pid).await;
                drop(stdout);
                Ok(RunOutcome::TimedOut {
                    limit: self.timeout,
                    stderr: stderr.finish().await,
                })
            }
            Waited::Cancelled => {
                log::warn!("Evaluation program {pid} cancelled, killing its process group");
                terminate(&mut child, pid).await;
                drop(stdout);
                Ok(RunOutcome::Cancelled {
                    stderr: stderr.finish().await,
                })
            }
        }
    }
}

/// Blocks until `pid` has exited, leaving it unreaped
///
/// Reaping is left to `Child::wait`; until then the zombie pins the pid and
/// with it the process group id.
fn wait_for_exit(pid: libc::pid_t) -> std::io::Result<()> {
    let Ok(id) = libc::id_t::try_from(pid) else {
        return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
    };
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::waitid(libc::P_PID, id, &mut info, libc::WEXITED | libc::WNOWAIT) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Kills the whole process group and reaps the direct child
async fn terminate(child: &mut Child, pid: libc::pid_t) {
    if !kill_process_group(pid) {
        if let Err(e) = child.start_kill() {
            log::warn!("Failed to kill evaluation program {pid}: {e}");
        }
    }
    if let Err(e) = child.wait().await {
        log::warn!("Failed to reap evaluation program {pid}: {e}");
    }
}

/// Sends `SIGKILL` to the process group `pgid`
///
/// Must only be called while the group leader is unreaped. Descendants
/// that moved to another group or session are out of reach. Returns
/// `false` if no signal could be delivered.
fn kill_process_group(pgid: libc::pid_t) -> bool {
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        return true;
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        log::warn!("Failed to kill process group {pgid}: {err}");
    }
    false
}

/// Drains a child pipe in the background into a shared buffer
///
/// The buffer is shared rather than returned by the task so that whatever
/// arrived before a kill can still be read if the pipe never closes.
struct StreamCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl StreamCapture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);

        let task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut sink = sink.lock();
                        let room = MAX_CAPTURE_BYTES.saturating_sub(sink.len());
                        sink.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Err(e) => {
                        log::warn!("Failed to read evaluation program output: {e}");
                        break;
                    }
                }
            }
        });

        Self { buffer, task }
    }

    /// Waits briefly for the pipe to close, then decodes what was captured
    async fn finish(mut self) -> String {
        if timeout(STREAM_DRAIN_GRACE, &mut self.task).await.is_err() {
            log::warn!("Output pipe still open after the program ended, giving up on it");
            self.task.abort();
        }
        let bytes = self.buffer.lock();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Drop for StreamCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}
