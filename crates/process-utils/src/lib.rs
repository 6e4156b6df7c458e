//! Helpers for invoking the external media tools (ffmpeg, ffprobe, yt-dlp,
//! whisper, espeak-ng) that the job pipelines shell out to.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a tool.
///
/// The child is killed when the handle is dropped, so a cancelled future
/// never leaves an orphaned encoder behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd.stdin(std::process::Stdio::null());
    cmd
}

#[cfg(feature = "tokio")]
pub use runner::{ToolError, ToolOutput, run_tool, run_tool_with_lines};

#[cfg(feature = "tokio")]
mod runner {
    use std::ops::ControlFlow;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
    use tokio::process::Command;

    /// Captured result of a finished tool invocation.
    #[derive(Debug, Clone)]
    pub struct ToolOutput {
        pub program: String,
        pub exit_code: Option<i32>,
        pub stdout: String,
        pub stderr: String,
        pub elapsed: Duration,
        /// The line callback asked to stop and the child was killed.
        pub stopped: bool,
    }

    impl ToolOutput {
        pub fn success(&self) -> bool {
            self.exit_code == Some(0)
        }

        /// Last non-empty stderr lines, useful for error messages.
        pub fn stderr_tail(&self, lines: usize) -> String {
            let collected: Vec<&str> = self
                .stderr
                .lines()
                .filter(|l| !l.trim().is_empty())
                .collect();
            let start = collected.len().saturating_sub(lines);
            collected[start..].join("\n")
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ToolError {
        /// The program could not be started (missing binary, permissions).
        #[error("failed to spawn {program}: {source}")]
        Spawn {
            program: String,
            #[source]
            source: std::io::Error,
        },
        /// Waiting on the child failed.
        #[error("failed to wait for {program}: {source}")]
        Wait {
            program: String,
            #[source]
            source: std::io::Error,
        },
        /// The deadline elapsed; the child has been killed.
        #[error("{program} timed out after {}s", after.as_secs())]
        TimedOut { program: String, after: Duration },
    }

    fn program_name(cmd: &Command) -> String {
        cmd.as_std().get_program().to_string_lossy().into_owned()
    }

    /// Run a command to completion, capturing stdout and stderr.
    pub async fn run_tool(
        cmd: &mut Command,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput, ToolError> {
        run_tool_with_lines(cmd, timeout, |_| ControlFlow::Continue(())).await
    }

    /// Run a command to completion, invoking `on_line` for every stdout or
    /// stderr line as it arrives (progress parsing).
    ///
    /// Returning `ControlFlow::Break` from `on_line` kills the child at once;
    /// the output is still returned with `stopped` set.
    pub async fn run_tool_with_lines<F>(
        cmd: &mut Command,
        timeout: Option<Duration>,
        mut on_line: F,
    ) -> Result<ToolOutput, ToolError>
    where
        F: FnMut(&str) -> ControlFlow<()> + Send,
    {
        let program = program_name(cmd);
        let start = Instant::now();

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(bool, String)>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, false, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, true, tx.clone());
        }
        drop(tx);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stopped = false;

        let collect = async {
            while let Some((is_err, line)) = rx.recv().await {
                let flow = on_line(&line);
                let buf = if is_err { &mut stderr } else { &mut stdout };
                buf.push_str(&line);
                buf.push('\n');
                if flow.is_break() {
                    stopped = true;
                    child.kill().await?;
                    break;
                }
            }
            child.wait().await
        };

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(status) => status,
                Err(_) => {
                    // kill_on_drop reaps the child once `child` goes out of scope
                    return Err(ToolError::TimedOut {
                        program,
                        after: limit,
                    });
                }
            },
            None => collect.await,
        }
        .map_err(|source| ToolError::Wait {
            program: program.clone(),
            source,
        })?;

        Ok(ToolOutput {
            program,
            exit_code: status.code(),
            stdout,
            stderr,
            elapsed: start.elapsed(),
            stopped,
        })
    }

    fn spawn_reader<R>(
        reader: R,
        is_err: bool,
        tx: tokio::sync::mpsc::UnboundedSender<(bool, String)>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((is_err, line)).is_err() {
                    break;
                }
            }
        });
    }
}
