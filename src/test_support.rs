//! Test support utilities shared across unit and integration tests.

use std::collections::BTreeSet;
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::process::{
    CommandOutput, CommandRunner, CommandSpec, LineSink, OutputStream, ProcessError, RunnerFuture,
};

/// Canned behaviour for one scripted invocation.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reply {
    /// Output returned by `capture` (its code is also the streamed exit).
    pub output: CommandOutput,
    /// Lines emitted to the sink when the command is streamed.
    pub lines: Vec<String>,
    /// Pause before each streamed line, and before a captured reply.
    pub delay: Duration,
    /// Keep running until cancelled instead of exiting.
    pub follow: bool,
    /// Fail to start with this message instead of running.
    pub spawn_error: Option<String>,
}

impl Reply {
    /// Exit 0 with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                code: Some(0),
                stdout: stdout.into(),
                stderr: String::new(),
            },
            ..Self::default()
        }
    }

    /// Non-zero exit with the given stderr.
    #[must_use]
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            output: CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.into(),
            },
            ..Self::default()
        }
    }

    /// Exit 0 after streaming `lines`, one every `delay`.
    #[must_use]
    pub fn streaming<I, S>(lines: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            delay,
            ..Self::success("")
        }
    }

    /// Sets the pause used before replying.
    #[must_use]
    pub const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails to start, as when the program is not installed.
    #[must_use]
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Keeps the command alive until its token is cancelled.
    #[must_use]
    pub const fn following(mut self) -> Self {
        self.follow = true;
        self
    }
}

/// Something that happened on the scripted host, in order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostEvent {
    /// A command was invoked and answered with `stdout`.
    Command {
        /// Shell-like rendering of the invocation.
        command: String,
        /// Stdout of the reply that was chosen.
        stdout: String,
    },
    /// A line reached a sink created by [`ScriptedHost::sink`].
    Output {
        /// Tag the line was relayed under.
        tag: String,
        /// Line text.
        line: String,
    },
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    sticky: bool,
}

#[derive(Debug, Default)]
struct HostState {
    rules: Vec<Rule>,
    journal: Vec<HostEvent>,
}

/// Scripted stand-in for the host's command line tools.
///
/// Replies are chosen by the first rule whose needle occurs in the rendered
/// command string. One-shot rules are consumed when matched; sticky rules
/// answer forever. Commands with no matching rule succeed silently. Every
/// invocation is journaled.
#[derive(Clone, Debug, Default)]
pub struct ScriptedHost {
    state: Arc<StdMutex<HostState>>,
}

impl ScriptedHost {
    /// Creates a host with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StdMutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers the next command containing `needle` once.
    pub fn once(&self, needle: impl Into<String>, reply: Reply) -> &Self {
        self.lock().rules.push(Rule {
            needle: needle.into(),
            reply,
            sticky: false,
        });
        self
    }

    /// Answers every command containing `needle`.
    pub fn always(&self, needle: impl Into<String>, reply: Reply) -> &Self {
        self.lock().rules.push(Rule {
            needle: needle.into(),
            reply,
            sticky: true,
        });
        self
    }

    /// Returns a snapshot of the journal.
    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().journal.clone()
    }

    /// Returns every invoked command string in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::Command { command, .. } => Some(command),
                HostEvent::Output { .. } => None,
            })
            .collect()
    }

    /// Counts invoked commands containing `needle`.
    #[must_use]
    pub fn count(&self, needle: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }

    /// Returns a sink that journals relayed lines alongside commands.
    #[must_use]
    pub fn sink(&self) -> HostSink {
        HostSink { host: self.clone() }
    }

    fn answer(&self, spec: &CommandSpec) -> Reply {
        let command = spec.command_string();
        let mut state = self.lock();
        let position = state
            .rules
            .iter()
            .position(|rule| command.contains(&rule.needle));
        let reply = match position {
            Some(index) if state.rules.get(index).is_some_and(|rule| rule.sticky) => state
                .rules
                .get(index)
                .map(|rule| rule.reply.clone())
                .unwrap_or_default(),
            Some(index) => state.rules.remove(index).reply,
            None => Reply::success(""),
        };
        state.journal.push(HostEvent::Command {
            command,
            stdout: reply.output.stdout.clone(),
        });
        reply
    }
}

fn refuse_spawn(spec: &CommandSpec, reply: &Reply) -> Result<(), ProcessError> {
    match &reply.spawn_error {
        Some(message) => Err(ProcessError::Spawn {
            program: spec.program.clone(),
            message: message.clone(),
        }),
        None => Ok(()),
    }
}

fn cancelled(spec: &CommandSpec) -> ProcessError {
    ProcessError::Cancelled {
        program: spec.program.clone(),
    }
}

impl CommandRunner for ScriptedHost {
    fn capture<'a>(
        &'a self,
        spec: &'a CommandSpec,
        cancel: &'a CancellationToken,
    ) -> RunnerFuture<'a, CommandOutput> {
        Box::pin(async move {
            let reply = self.answer(spec);
            refuse_spawn(spec, &reply)?;
            let work = async {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                if reply.follow {
                    std::future::pending::<()>().await;
                }
                reply.output.clone()
            };
            let bounded = async {
                match spec.timeout {
                    Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                        ProcessError::TimedOut {
                            program: spec.program.clone(),
                            timeout: limit,
                        }
                    }),
                    None => Ok(work.await),
                }
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(cancelled(spec)),
                result = bounded => result,
            }
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
            let reply = self.answer(spec);
            refuse_spawn(spec, &reply)?;
            for line in &reply.lines {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(cancelled(spec)),
                    () = tokio::time::sleep(reply.delay) => {}
                }
                sink.line(tag, OutputStream::Stdout, line);
            }
            if reply.follow {
                cancel.cancelled().await;
                return Err(cancelled(spec));
            }
            Ok(reply.output.code)
        })
    }

    fn interactive<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a, Option<i32>> {
        Box::pin(async move {
            let reply = self.answer(spec);
            refuse_spawn(spec, &reply)?;
            Ok(reply.output.code)
        })
    }
}

/// Sink that records relayed lines into a [`ScriptedHost`] journal.
#[derive(Clone, Debug)]
pub struct HostSink {
    host: ScriptedHost,
}

impl LineSink for HostSink {
    fn line(&self, tag: &str, _stream: OutputStream, line: &str) {
        self.host.lock().journal.push(HostEvent::Output {
            tag: tag.to_owned(),
            line: line.to_owned(),
        });
    }
}

/// One line captured by [`RecordingSink`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedLine {
    /// Tag passed by the producer.
    pub tag: String,
    /// Pipe the line came from.
    pub stream: OutputStream,
    /// Line text.
    pub line: String,
}

/// Sink that keeps every line in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    entries: Arc<StdMutex<Vec<RecordedLine>>>,
}

impl RecordingSink {
    /// Returns everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<RecordedLine> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the text of lines read from `stream`.
    #[must_use]
    pub fn lines_from(&self, stream: OutputStream) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.stream == stream)
            .map(|entry| entry.line)
            .collect()
    }
}

impl LineSink for RecordingSink {
    fn line(&self, tag: &str, stream: OutputStream, line: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedLine {
                tag: tag.to_owned(),
                stream,
                line: line.to_owned(),
            });
    }
}

/// Produces a payload shaped like `multipass info <name> --format json`.
#[must_use]
pub fn info_json(name: &str, state: &str, ipv4: &[&str]) -> String {
    let addresses = ipv4
        .iter()
        .map(|ip| format!("\"{ip}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "{{\"errors\":[],\"info\":{{\"{name}\":{{\"ipv4\":[{addresses}],\"state\":\"{state}\",\"image_release\":\"22.04 LTS\"}}}}}}"
    )
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
