//! Streaming subprocess execution.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use proto::{CommandId, WorkerError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

use crate::registry::ProcessRegistry;

/// Shell used when none is configured.
pub const DEFAULT_SHELL: &str = "sh";

/// Longest chunk of one stdout line relayed as a single `Output`.
///
/// Escaping can grow a line roughly sevenfold on its way into a frame, so this
/// keeps every `Output` well under [`proto::MAX_FRAME_LEN`].
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Spawns shell commands and exposes their stdout line by line
#[derive(Debug, Clone)]
pub struct StreamingExecutor {
    shell: String,
    registry: Arc<ProcessRegistry>,
}

impl StreamingExecutor {
    /// Creates an executor using [`DEFAULT_SHELL`].
    pub fn new(registry: Arc<ProcessRegistry>) -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            registry,
        }
    }

    /// Overrides the shell binary.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Shell binary invoked with `-c`.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Registry that tracks spawned processes.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Spawns `command` in its own process group and registers it under `command_id`.
    ///
    /// The process is registered before this returns, so the first line is
    /// never read from an unregistered process.
    pub fn spawn(&self, command_id: CommandId, command: &str) -> Result<CommandStream, WorkerError> {
        if self.registry.get(&command_id).is_some() {
            return Err(WorkerError::CommandIdInUse(command_id.to_string()));
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Spawn(format!("{}: {e}", self.shell)))?;
        let pid = child
            .id()
            .ok_or_else(|| WorkerError::Spawn("process exited before registration".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(command_id.clone(), stderr));
        }

        let record = match self.registry.register(command_id.clone(), pid) {
            Ok(record) => record,
            Err(e) => {
                kill_group(pid);
                return Err(e);
            }
        };
        debug!(command_id = %command_id, pid, command, "Subprocess spawned");

        Ok(CommandStream {
            guard: ProcessGuard {
                registry: self.registry.clone(),
                command_id,
                pid,
                registration: record.registration,
                released: false,
                reaped: false,
            },
            child,
            stdout: BufReader::new(stdout),
            buf: Vec::new(),
        })
    }
}

/// Stdout of a running command, consumed line by line
///
/// Dropping the stream before [`CommandStream::finish`] kills the whole
/// process group and releases its registry entry.
#[derive(Debug)]
pub struct CommandStream {
    guard: ProcessGuard,
    child: Child,
    stdout: BufReader<ChildStdout>,
    buf: Vec<u8>,
}

impl CommandStream {
    /// Command id this stream was registered under.
    pub fn command_id(&self) -> &CommandId {
        &self.guard.command_id
    }

    /// Process id of the shell, which also leads the process group.
    pub fn pid(&self) -> u32 {
        self.guard.pid
    }

    /// Next stdout line with trailing whitespace removed, or `None` at end of output.
    ///
    /// Lines longer than [`MAX_LINE_LEN`] bytes come back as several
    /// consecutive chunks.
    pub async fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        loop {
            let available = match self.stdout.fill_buf().await {
                Ok(available) => available,
                Err(e) => {
                    warn!(command_id = %self.guard.command_id, error = %e, "Failed to read stdout");
                    return None;
                }
            };
            if available.is_empty() {
                if self.buf.is_empty() {
                    return None;
                }
                break;
            }

            let room = MAX_LINE_LEN - self.buf.len();
            let window = &available[..available.len().min(room)];
            if let Some(end) = window.iter().position(|b| *b == b'\n') {
                self.buf.extend_from_slice(&window[..=end]);
                self.stdout.consume(end + 1);
                break;
            }
            let taken = window.len();
            self.buf.extend_from_slice(window);
            self.stdout.consume(taken);
            if self.buf.len() >= MAX_LINE_LEN {
                debug!(command_id = %self.guard.command_id, "Splitting oversized output line");
                break;
            }
        }
        Some(String::from_utf8_lossy(&self.buf).trim_end().to_string())
    }

    /// Deregisters the process, then waits for it to exit.
    pub async fn finish(mut self) -> Result<ExitStatus, WorkerError> {
        self.guard.release();
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| WorkerError::Io(e.to_string()))?;
        self.guard.reaped = true;
        Ok(status)
    }
}

/// Releases the registry entry exactly once and kills an unreaped group on drop.
#[derive(Debug)]
struct ProcessGuard {
    registry: Arc<ProcessRegistry>,
    command_id: CommandId,
    pid: u32,
    registration: u64,
    released: bool,
    reaped: bool,
}

impl ProcessGuard {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.registry.release(&self.command_id, self.registration) {
            debug!(command_id = %self.command_id, "Process deregistered");
        } else {
            debug!(command_id = %self.command_id, "Process already taken by STOP");
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.release();
        // The leader is not reaped yet, so the group id cannot have been recycled.
        if !self.reaped {
            kill_group(self.pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::Signal;

    if let Err(e) = crate::registry::signal_group(pid, Signal::SIGKILL) {
        debug!(pid, error = %e, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn drain_stderr(command_id: CommandId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(command_id = %command_id, stderr = %line, "Subprocess stderr"),
            Ok(None) => break,
            Err(e) => {
                debug!(command_id = %command_id, error = %e, "Stopped reading stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn executor() -> StreamingExecutor {
        StreamingExecutor::new(Arc::new(ProcessRegistry::new()))
    }

    async fn collect(stream: &mut CommandStream) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn yields_lines_in_order_and_trims_trailing_whitespace() {
        let executor = executor();
        let mut stream = executor
            .spawn(CommandId::from("c1"), "printf 'one  \\ntwo\\r\\n\\nthree'")
            .expect("spawn");
        assert_eq!(collect(&mut stream).await, ["one", "two", "", "three"]);
        let status = stream.finish().await.expect("finish");
        assert!(status.success());
    }

    #[tokio::test]
    async fn oversized_line_is_split_into_bounded_chunks() {
        let executor = executor();
        let total = MAX_LINE_LEN * 2 + 10;
        let mut stream = executor
            .spawn(
                CommandId::from("wide"),
                &format!("head -c {total} /dev/zero | tr '\\0' x; echo; echo tail"),
            )
            .expect("spawn");

        let lines = collect(&mut stream).await;
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|line| line.len() <= MAX_LINE_LEN));
        assert_eq!(lines[..3].iter().map(String::len).sum::<usize>(), total);
        assert_eq!(lines[3], "tail");
        stream.finish().await.expect("finish");
    }

    #[tokio::test]
    async fn registers_before_first_line_and_releases_on_finish() {
        let executor = executor();
        let id = CommandId::from("c2");
        let mut stream = executor.spawn(id.clone(), "echo hi").expect("spawn");
        let record = executor.registry().get(&id).expect("registered");
        assert_eq!(record.pid, stream.pid());

        assert_eq!(stream.next_line().await.as_deref(), Some("hi"));
        stream.finish().await.expect("finish");
        assert!(executor.registry().get(&id).is_none());
    }

    #[tokio::test]
    async fn stderr_does_not_reach_stdout() {
        let executor = executor();
        let mut stream = executor
            .spawn(CommandId::from("c3"), "echo out; echo err 1>&2; exit 3")
            .expect("spawn");
        assert_eq!(collect(&mut stream).await, ["out"]);
        let status = stream.finish().await.expect("finish");
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn duplicate_live_id_is_rejected_without_spawning() {
        let executor = executor();
        let id = CommandId::from("dup");
        let _running = executor.spawn(id.clone(), "sleep 5").expect("spawn");
        let err = executor.spawn(id, "echo second").expect_err("duplicate");
        assert!(matches!(err, WorkerError::CommandIdInUse(_)));
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_failure() {
        let executor = executor().with_shell("/nonexistent/taskgate-shell");
        let err = executor
            .spawn(CommandId::from("c4"), "echo hi")
            .expect_err("spawn should fail");
        assert!(matches!(err, WorkerError::Spawn(_)));
        assert!(executor.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_ends_the_stream_early() {
        let executor = executor();
        let id = CommandId::from("long");
        let mut stream = executor
            .spawn(id.clone(), "echo started; sleep 30; echo never")
            .expect("spawn");
        assert_eq!(stream.next_line().await.as_deref(), Some("started"));

        executor.registry().stop(&id).expect("stop");
        let rest = tokio::time::timeout(Duration::from_secs(5), collect(&mut stream))
            .await
            .expect("stream ends after stop");
        assert!(rest.is_empty());
        stream.finish().await.expect("finish");
        assert!(executor.registry().is_empty());
    }

    #[tokio::test]
    async fn dropping_an_unfinished_stream_releases_the_id() {
        let executor = executor();
        let id = CommandId::from("dropped");
        let stream = executor.spawn(id.clone(), "sleep 30").expect("spawn");
        drop(stream);

        assert!(executor.registry().get(&id).is_none());
        let mut again = executor.spawn(id, "echo reused").expect("id is free again");
        assert_eq!(again.next_line().await.as_deref(), Some("reused"));
        again.finish().await.expect("finish");
    }
}
