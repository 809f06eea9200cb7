//! Build engine that runs the invocation as a child process.

use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;
use kiln_daemon_types::CancellationReason;
use tracing::{Span, debug, info, warn};

use super::{BUILD_TARGET, BuildEngine, BuildError, BuildOutcome, BuildRequest};
use crate::cancel::CancellationToken;

const OUTPUT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::build::output");
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs `arguments[0]` with the remaining arguments as a child process.
///
/// The child inherits the working directory and variables established for
/// the build, reads the client's forwarded input on stdin, and has each line
/// of its stdout and stderr re-emitted as a tracing event inside the
/// caller's span, so a redirected client sees it. Cancellation kills the
/// child, and also ends the wait for output still held open by processes the
/// child left behind.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBuildEngine;

impl ProcessBuildEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl BuildEngine for ProcessBuildEngine {
    fn run_build(&self, request: BuildRequest) -> Result<BuildOutcome, BuildError> {
        let BuildRequest {
            command_id,
            invocation,
            input,
            cancellation,
            warnings,
            ..
        } = request;
        let (program, arguments) = invocation
            .arguments
            .split_first()
            .ok_or(BuildError::EmptyInvocation)?;
        if invocation.working_directory.is_none() {
            warnings.warn_once("build invocation has no working directory; using the daemon's");
        }

        info!(
            target: BUILD_TARGET,
            command = %command_id,
            program = %program,
            "starting build process"
        );
        let started = Instant::now();
        let mut child = Command::new(program)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BuildError::Spawn {
                program: program.clone(),
                source,
            })?;
        let relays = match start_relays(&mut child, input) {
            Ok(relays) => relays,
            Err(error) => {
                drop(child.kill());
                drop(child.wait());
                return Err(error);
            }
        };

        let status = loop {
            if let Some(reason) = cancellation.reason() {
                warn!(
                    target: BUILD_TARGET,
                    command = %command_id,
                    ?reason,
                    "build cancelled; terminating process"
                );
                terminate(&mut child)?;
                return Err(BuildError::Cancelled { reason });
            }
            match child.try_wait().map_err(|source| BuildError::Wait { source })? {
                Some(status) => break status,
                None => {
                    cancellation.wait_timeout(POLL_INTERVAL);
                }
            }
        };
        if let Err(reason) = relays.drain(&cancellation) {
            warn!(
                target: BUILD_TARGET,
                command = %command_id,
                ?reason,
                "build cancelled while its output was still open; abandoning relays"
            );
            return Err(BuildError::Cancelled { reason });
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            target: BUILD_TARGET,
            command = %command_id,
            ?status,
            elapsed_ms,
            "build process exited"
        );
        Ok(outcome_for(program, status, elapsed_ms))
    }
}

fn outcome_for(program: &str, status: ExitStatus, elapsed_ms: u64) -> BuildOutcome {
    if status.success() {
        BuildOutcome::Success {
            payload: json!({ "exit_code": status.code(), "elapsed_ms": elapsed_ms }),
        }
    } else {
        BuildOutcome::failure(format!("'{program}' {status}"))
    }
}

fn terminate(child: &mut Child) -> Result<(), BuildError> {
    match child.kill() {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::InvalidInput => {}
        Err(source) => return Err(BuildError::Kill { source }),
    }
    child
        .wait()
        .map(drop)
        .map_err(|source| BuildError::Wait { source })
}

struct Relays {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl Relays {
    /// Waits for both output streams to reach end of file.
    ///
    /// Processes the build left running may hold the pipes open after the
    /// child exits, so waiting stops as soon as the build is cancelled. The
    /// abandoned relays finish on their own once the pipes close.
    fn drain(self, cancellation: &CancellationToken) -> Result<(), CancellationReason> {
        loop {
            let finished = [&self.stdout, &self.stderr]
                .into_iter()
                .flatten()
                .all(JoinHandle::is_finished);
            if finished {
                self.join();
                return Ok(());
            }
            if let Some(reason) = cancellation.wait_timeout(POLL_INTERVAL) {
                return Err(reason);
            }
        }
    }

    fn join(self) {
        for handle in [self.stdout, self.stderr].into_iter().flatten() {
            if handle.join().is_err() {
                warn!(target: BUILD_TARGET, "build output relay panicked");
            }
        }
    }
}

fn start_relays(child: &mut Child, mut input: Box<dyn Read + Send>) -> Result<Relays, BuildError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or(BuildError::MissingStream { stream: "stdin" })?;
    let stdout = child
        .stdout
        .take()
        .ok_or(BuildError::MissingStream { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(BuildError::MissingStream { stream: "stderr" })?;

    // The pump ends when either side closes; nobody waits for it.
    let pump = thread::Builder::new()
        .name("kilnd-build-stdin".to_owned())
        .spawn(move || {
            if let Err(error) = io::copy(&mut input, &mut stdin) {
                debug!(target: BUILD_TARGET, error = %error, "stdin pump stopped");
            }
        });
    if let Err(error) = pump {
        warn!(target: BUILD_TARGET, error = %error, "failed to start stdin pump");
    }

    Ok(Relays {
        stdout: relay_lines("stdout", stdout),
        stderr: relay_lines("stderr", stderr),
    })
}

fn relay_lines(stream: &'static str, source: impl Read + Send + 'static) -> Option<JoinHandle<()>> {
    // Relayed lines belong to the build's log scope.
    let scope = Span::current();
    let spawned = thread::Builder::new()
        .name(format!("kilnd-build-{stream}"))
        .spawn(move || {
            let _entered = scope.enter();
            for line in BufReader::new(source).split(b'\n') {
                let Ok(line) = line else {
                    break;
                };
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches('\r');
                if stream == "stderr" {
                    warn!(target: OUTPUT_TARGET, stream, "{text}");
                } else {
                    info!(target: OUTPUT_TARGET, stream, "{text}");
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(target: BUILD_TARGET, stream, error = %error, "failed to start output relay");
            None
        }
    }
}
