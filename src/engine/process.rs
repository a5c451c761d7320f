use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::engine::errors::EngineError;

const QUIT_GRACE: Duration = Duration::from_secs(5);

/// Line-oriented handle on an engine subprocess. The first pipe failure
/// flips the handle into a failed state; everything after that reports the
/// process as dead and the owning worker decides what to do.
pub struct EngineProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    failed: bool,
}

impl EngineProcess {
    pub async fn spawn(
        path: &str,
        args: &[String],
        working_dir: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut command = Command::new(path);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::Spawn(format!("{}: {}", path, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Spawn("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Spawn("no stdout pipe".to_string()))?;

        Ok(EngineProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            failed: false,
        })
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), EngineError> {
        if self.failed {
            return Err(EngineError::Dead);
        }
        debug!(">> {}", line);
        let result = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        }
        .await;

        if result.is_err() {
            self.failed = true;
            return Err(EngineError::Dead);
        }
        Ok(())
    }

    /// Next line of engine output, blocking until one arrives. Pipe close
    /// or read failure marks the process dead.
    pub async fn read_line(&mut self) -> Result<String, EngineError> {
        if self.failed {
            return Err(EngineError::Dead);
        }
        match self.stdout.next_line().await {
            Ok(Some(line)) => {
                debug!("<< {}", line);
                Ok(line)
            }
            Ok(None) | Err(_) => {
                self.failed = true;
                Err(EngineError::Dead)
            }
        }
    }

    /// Like `read_line` but gives up at `deadline`, returning `Ok(None)`.
    /// A deadline expiry is not a failure; the caller usually reacts by
    /// sending the dialect's stop command.
    pub async fn read_line_until(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<String>, EngineError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.read_line()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Ask the engine to exit with its dialect's quit command, then wait
    /// briefly and kill whatever is left.
    pub async fn shutdown(&mut self, quit_command: &str) {
        if !self.failed {
            let _ = self.send_line(quit_command).await;
        }
        match tokio::time::timeout(QUIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Engine exited with {}", status),
            Ok(Err(e)) => warn!("Waiting for engine exit failed: {}", e),
            Err(_) => {
                warn!("Engine ignored quit for {}s, killing it", QUIT_GRACE.as_secs());
                let _ = self.child.kill().await;
            }
        }
        self.failed = true;
    }
}
