//! Relays client input frames to the build's standard input.

use std::io::{self, PipeWriter, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use kiln_daemon_types::ClientMessage;
use tracing::{debug, warn};

use crate::connection::{DisconnectAwareConnection, Inbound};
use crate::exec::{ActionError, CommandAction, CommandExecution, EXEC_TARGET, Next};

const RELAY_POLL: Duration = Duration::from_millis(50);

/// Pipes `Input` frames into the build while it runs.
///
/// The build reads the pipe's other end. A `CloseInput` frame or a
/// disconnect closes the pipe so the build sees end of input.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardClientInput;

impl CommandAction for ForwardClientInput {
    fn name(&self) -> &'static str {
        "forward_input"
    }

    fn execute(
        &self,
        execution: &mut CommandExecution,
        next: Next<'_>,
    ) -> Result<(), ActionError> {
        let (reader, writer) =
            io::pipe().map_err(|source| ActionError::InputForwarding { source })?;
        let stop = Arc::new(AtomicBool::new(false));
        let relay = thread::Builder::new()
            .name("kilnd-input-relay".to_owned())
            .spawn({
                let connection = Arc::clone(execution.connection());
                let stop = Arc::clone(&stop);
                move || relay_input(&connection, writer, &stop)
            })
            .map_err(|source| ActionError::InputForwarding { source })?;
        execution.set_build_input(Box::new(reader));

        let result = next.proceed(execution);

        // Dropping an unread pipe end unblocks a relay stuck writing.
        drop(execution.take_build_input());
        stop.store(true, Ordering::SeqCst);
        if relay.join().is_err() {
            warn!(target: EXEC_TARGET, "input relay panicked");
        }
        result
    }
}

fn relay_input(connection: &DisconnectAwareConnection, mut writer: PipeWriter, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match connection.receive_timeout(RELAY_POLL) {
            Inbound::Message(ClientMessage::Input { data }) => {
                if let Err(error) = writer.write_all(&data) {
                    debug!(
                        target: EXEC_TARGET,
                        error = %error,
                        "build stopped reading input"
                    );
                    return;
                }
            }
            Inbound::Message(ClientMessage::CloseInput) | Inbound::Disconnected => return,
            Inbound::Message(ClientMessage::Command(command)) => {
                warn!(
                    target: EXEC_TARGET,
                    command = %command.id,
                    "ignoring a second command on a busy connection"
                );
            }
            Inbound::Timeout => {}
        }
    }
}
