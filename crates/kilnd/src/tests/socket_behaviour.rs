//! Behavioural tests for commands arriving over a real socket.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

use kiln_config::SocketEndpoint;
use kiln_daemon_types::{
    ClientMessage, Command, CommandOutcome, CommandResult, DaemonMessage, DaemonState,
    FailureKind,
};

use crate::build::{BuildOutcome, MockBuildEngine};
use crate::exec::{DaemonConnectionHandler, DefaultCommandExecuter, UNIDENTIFIED_COMMAND};
use crate::transport::{ListenerHandle, SocketListener};

use super::support::{PipelineHarness, StepResult, TEST_TIMEOUT, build_command};

const ECHOED_INPUT: &str = "hello from the client";

struct Client {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
}

impl Client {
    fn send(&mut self, message: &ClientMessage) -> StepResult {
        let mut line = serde_json::to_vec(message).map_err(|error| error.to_string())?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|error| error.to_string())
    }

    /// Reads frames until the result arrives.
    fn read_result(&mut self) -> Result<CommandResult, String> {
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|error| error.to_string())?;
            if read == 0 {
                return Err("connection closed before a result arrived".to_owned());
            }
            let frame: DaemonMessage =
                serde_json::from_str(&line).map_err(|error| error.to_string())?;
            if let DaemonMessage::Result(result) = frame {
                return Ok(result);
            }
        }
    }

    fn at_end_of_stream(&mut self) -> Result<bool, String> {
        let mut rest = Vec::new();
        self.reader
            .read_to_end(&mut rest)
            .map_err(|error| error.to_string())?;
        Ok(rest.is_empty())
    }
}

struct SocketWorld {
    dir: TempDir,
    harness: PipelineHarness,
    endpoint: Option<SocketEndpoint>,
    listener: Option<ListenerHandle>,
    client: Option<Client>,
    result: Option<CommandResult>,
}

impl SocketWorld {
    fn new() -> Self {
        let mut engine = MockBuildEngine::new();
        engine.expect_run_build().returning(|mut request| {
            let mut text = String::new();
            request
                .input
                .read_to_string(&mut text)
                .map_err(|source| crate::build::BuildError::Wait { source })?;
            Ok(BuildOutcome::Success {
                payload: serde_json::Value::String(text),
            })
        });
        Self {
            dir: TempDir::new().expect("create socket directory"),
            harness: PipelineHarness::new(engine),
            endpoint: None,
            listener: None,
            client: None,
            result: None,
        }
    }

    fn start(&mut self, transport: &str) -> StepResult {
        let endpoint = match transport {
            "unix" => {
                let path = self.dir.path().join("kilnd.sock");
                let path = path
                    .to_str()
                    .ok_or_else(|| "socket path is not UTF-8".to_owned())?;
                SocketEndpoint::unix(path)
            }
            "TCP" => SocketEndpoint::tcp("127.0.0.1", 0),
            other => return Err(format!("unknown transport {other}")),
        };
        let listener = SocketListener::bind(&endpoint).map_err(|error| error.to_string())?;
        let endpoint = match listener.local_addr() {
            Some(address) => SocketEndpoint::tcp("127.0.0.1", address.port()),
            None => endpoint,
        };
        let executer = Arc::new(DefaultCommandExecuter::new(self.harness.services.clone()));
        let handler = Arc::new(DaemonConnectionHandler::new(executer));
        self.listener = Some(listener.start(handler).map_err(|error| error.to_string())?);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    fn connect(&mut self) -> Result<&mut Client, String> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| "the daemon is not listening".to_owned())?;
        let (reader, writer): (Box<dyn Read + Send>, Box<dyn Write + Send>) =
            match endpoint.unix_path() {
                Some(path) => {
                    let stream = UnixStream::connect(path).map_err(|error| error.to_string())?;
                    stream
                        .set_read_timeout(Some(TEST_TIMEOUT))
                        .map_err(|error| error.to_string())?;
                    let writer = stream.try_clone().map_err(|error| error.to_string())?;
                    (Box::new(stream), Box::new(writer))
                }
                None => {
                    let SocketEndpoint::Tcp { host, port } = endpoint else {
                        return Err("unsupported endpoint".to_owned());
                    };
                    let stream = TcpStream::connect((host.as_str(), *port))
                        .map_err(|error| error.to_string())?;
                    stream
                        .set_read_timeout(Some(TEST_TIMEOUT))
                        .map_err(|error| error.to_string())?;
                    let writer = stream.try_clone().map_err(|error| error.to_string())?;
                    (Box::new(stream), Box::new(writer))
                }
            };
        Ok(self.client.insert(Client {
            reader: BufReader::new(reader),
            writer,
        }))
    }

    fn client(&mut self) -> Result<&mut Client, String> {
        self.client
            .as_mut()
            .ok_or_else(|| "no client is connected".to_owned())
    }

    fn result(&self) -> Result<&CommandResult, String> {
        self.result
            .as_ref()
            .ok_or_else(|| "no result was received".to_owned())
    }
}

impl Drop for SocketWorld {
    fn drop(&mut self) {
        self.client = None;
        if let Some(handle) = self.listener.take() {
            handle.shutdown();
            let _ = handle.join();
        }
    }
}

#[fixture]
fn world() -> RefCell<SocketWorld> {
    RefCell::new(SocketWorld::new())
}

#[given("a daemon listening on a {transport} socket")]
fn given_listening(world: &RefCell<SocketWorld>, transport: String) -> StepResult {
    world.borrow_mut().start(&transport)
}

#[when("a client sends a build with input")]
fn when_build_with_input(world: &RefCell<SocketWorld>) -> StepResult {
    let mut world = world.borrow_mut();
    let client = world.connect()?;
    client.send(&ClientMessage::Command(build_command("socket-1")))?;
    client.send(&ClientMessage::Input {
        data: ECHOED_INPUT.as_bytes().to_vec(),
    })?;
    client.send(&ClientMessage::CloseInput)?;
    let result = client.read_result()?;
    world.result = Some(result);
    Ok(())
}

#[when("a client sends a stop request")]
fn when_stop_request(world: &RefCell<SocketWorld>) -> StepResult {
    let mut world = world.borrow_mut();
    let client = world.connect()?;
    client.send(&ClientMessage::Command(Command::stop("socket-stop")))?;
    let result = client.read_result()?;
    world.result = Some(result);
    Ok(())
}

#[when("a client sends input before any command")]
fn when_input_first(world: &RefCell<SocketWorld>) -> StepResult {
    let mut world = world.borrow_mut();
    let client = world.connect()?;
    client.send(&ClientMessage::CloseInput)?;
    let result = client.read_result()?;
    world.result = Some(result);
    Ok(())
}

#[then("the client receives its input back in a success result")]
fn then_echoed(world: &RefCell<SocketWorld>) -> StepResult {
    let world = world.borrow();
    match &world.result()?.outcome {
        CommandOutcome::Success {
            payload: serde_json::Value::String(text),
        } if text == ECHOED_INPUT => Ok(()),
        other => Err(format!("unexpected outcome: {other:?}")),
    }
}

#[then("the client is told the daemon stopped")]
fn then_stopped(world: &RefCell<SocketWorld>) -> StepResult {
    match &world.borrow().result()?.outcome {
        CommandOutcome::Stopped => Ok(()),
        other => Err(format!("unexpected outcome: {other:?}")),
    }
}

#[then("the client receives an unidentified daemon failure")]
fn then_unidentified(world: &RefCell<SocketWorld>) -> StepResult {
    let world = world.borrow();
    let result = world.result()?;
    if result.id.as_str() != UNIDENTIFIED_COMMAND {
        return Err(format!("unexpected result id {}", result.id));
    }
    match &result.outcome {
        CommandOutcome::Failure(description) if description.kind == FailureKind::Daemon => Ok(()),
        other => Err(format!("unexpected outcome: {other:?}")),
    }
}

#[then("the daemon closes the connection")]
fn then_connection_closed(world: &RefCell<SocketWorld>) -> StepResult {
    if world.borrow_mut().client()?.at_end_of_stream()? {
        Ok(())
    } else {
        Err("unexpected frames after the result".to_owned())
    }
}

#[then("the daemon settles in the {state} state")]
fn then_daemon_state(world: &RefCell<SocketWorld>, state: String) -> StepResult {
    let world = world.borrow();
    let coordinator = world.harness.coordinator();
    let actual = if state == DaemonState::Stopped.as_str() {
        coordinator.await_terminal_timeout(TEST_TIMEOUT)
    } else {
        wait_for_state(|| coordinator.state(), &state)
    };
    match actual {
        Some(actual) if actual.as_str() == state => Ok(()),
        other => Err(format!("expected {state}, found {other:?}")),
    }
}

fn wait_for_state(read: impl Fn() -> DaemonState, expected: &str) -> Option<DaemonState> {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let state = read();
        if state.as_str() == expected || std::time::Instant::now() >= deadline {
            return Some(state);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[scenario(path = "tests/features/daemon_socket.feature")]
fn daemon_socket(#[from(world)] world: RefCell<SocketWorld>) {
    drop(world);
}
