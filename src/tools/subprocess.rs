//! Subprocess tool runner - spawns git, docker, gcloud and friends

use crate::core::error::NO_EXIT_CODE;
use crate::tools::{Invocation, OutputCallback, OutputStream, ToolError, ToolOutcome, ToolRunner};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Number of trailing stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Runs invocations as child processes
///
/// Children are killed when the returned future is dropped, so aborting a
/// step task also stops its process.
#[derive(Debug, Clone, Default)]
pub struct SubprocessRunner;

impl SubprocessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for SubprocessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        output: Option<&dyn OutputCallback>,
    ) -> Result<ToolOutcome, ToolError> {
        debug!(
            "Spawning '{}' in {}",
            invocation.command_line(),
            invocation.dir.display()
        );
        let started = Instant::now();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, stderr_tail) = tokio::join!(
            forward_lines(stdout, OutputStream::Stdout, output),
            forward_lines(stderr, OutputStream::Stderr, output),
        );

        let status = child.wait().await.map_err(|e| ToolError::Io {
            program: invocation.program.clone(),
            message: e.to_string(),
        })?;

        let exit_code = status.code().unwrap_or(NO_EXIT_CODE);
        if exit_code != 0 {
            warn!("'{}' exited with code {}", invocation.program, exit_code);
        }

        Ok(ToolOutcome {
            exit_code,
            duration: started.elapsed(),
            stderr_tail,
        })
    }
}

/// Read a child stream line by line, forwarding each line and keeping the tail
async fn forward_lines<R>(
    reader: Option<R>,
    stream: OutputStream,
    output: Option<&dyn OutputCallback>,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };

    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match output {
                    Some(callback) => callback.on_line(stream, &line),
                    None => debug!("[{:?}] {}", stream, line),
                }
                if stream == OutputStream::Stderr {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                // Non UTF-8 output ends forwarding; the exit code still decides
                warn!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}
