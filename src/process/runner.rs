//! Real command runner backed by `tokio::process`.

use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::{
    CommandOutput, CommandRunner, CommandSpec, LineSink, OutputStream, ProcessError,
    RunnerFuture, StdinMode,
};

/// Command runner that shells out to the host operating system.
///
/// Children are spawned with `kill_on_drop`, so a timed out or cancelled
/// call never leaves a stray process behind.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn capture<'a>(
        &'a self,
        spec: &'a CommandSpec,
        cancel: &'a CancellationToken,
    ) -> RunnerFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut child = spawn_piped(spec)?;
            feed_stdin(&mut child, spec).await?;
            let output = supervise(spec, cancel, child.wait_with_output())
                .await?
                .map_err(|err| io_error(spec, &err))?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn stream<'a>(
        &'a self,
        spec: &'a CommandSpec,
        tag: &'a str,
        sink: &'a dyn LineSink,
        cancel: &'a CancellationToken,
    ) -> RunnerFuture<'a, Option<i32>> {
        Box::pin(async move {
            let mut child = spawn_piped(spec)?;
            feed_stdin(&mut child, spec).await?;
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let pump = async {
                let forward_out = async {
                    match stdout {
                        Some(reader) => forward_lines(reader, tag, OutputStream::Stdout, sink).await,
                        None => Ok(()),
                    }
                };
                let forward_err = async {
                    match stderr {
                        Some(reader) => forward_lines(reader, tag, OutputStream::Stderr, sink).await,
                        None => Ok(()),
                    }
                };
                tokio::try_join!(forward_out, forward_err)?;
                child.wait().await
            };

            let status: ExitStatus = supervise(spec, cancel, pump)
                .await?
                .map_err(|err| io_error(spec, &err))?;
            Ok(status.code())
        })
    }

    fn interactive<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a, Option<i32>> {
        Box::pin(async move {
            let mut command = base_command(spec);
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = command
                .status()
                .await
                .map_err(|err| spawn_error(spec, &err))?;
            Ok(status.code())
        })
    }
}

fn base_command(spec: &CommandSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(key, value)| (key, value)))
        .kill_on_drop(true);
    command
}

fn spawn_piped(spec: &CommandSpec) -> Result<Child, ProcessError> {
    let mut command = base_command(spec);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(match spec.stdin {
        StdinMode::Null => Stdio::null(),
        StdinMode::Inherit => Stdio::inherit(),
        StdinMode::Pipe(_) => Stdio::piped(),
    });
    command.spawn().map_err(|err| spawn_error(spec, &err))
}

async fn feed_stdin(child: &mut Child, spec: &CommandSpec) -> Result<(), ProcessError> {
    let StdinMode::Pipe(ref text) = spec.stdin else {
        return Ok(());
    };
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|err| io_error(spec, &err))?;
        // Dropping the handle closes the pipe so the child sees EOF.
        drop(stdin);
    }
    Ok(())
}

/// Races `work` against the command's timeout and the caller's token.
async fn supervise<F, T>(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, ProcessError>
where
    F: Future<Output = T>,
{
    let bounded = async {
        match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| ProcessError::TimedOut {
                    program: spec.program.clone(),
                    timeout: limit,
                }),
            None => Ok(work.await),
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ProcessError::Cancelled {
            program: spec.program.clone(),
        }),
        result = bounded => result,
    }
}

async fn forward_lines<R>(
    reader: R,
    tag: &str,
    stream: OutputStream,
    sink: &dyn LineSink,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buffer);
        sink.line(tag, stream, text.trim_end_matches(['\n', '\r']));
    }
}

fn spawn_error(spec: &CommandSpec, err: &io::Error) -> ProcessError {
    ProcessError::Spawn {
        program: spec.program.clone(),
        message: err.to_string(),
    }
}

fn io_error(spec: &CommandSpec, err: &io::Error) -> ProcessError {
    ProcessError::Io {
        program: spec.program.clone(),
        message: err.to_string(),
    }
}
