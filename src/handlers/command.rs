//! Command channel handler.
//!
//! Every inbound message is one command. The executor decides what it means
//! and whether it succeeded; the handler turns that into an acknowledgement
//! on the same connection.

use super::{ack_failed, ack_ok, payload_text};
use crate::hub::channel::{ChannelHandler, ChannelTag, ConnectionInfo, HandlerContext};

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Reply `ANS <label> OK`.
    Done,
    /// Reply `ERR <label> FAILED`.
    Failed,
    /// Reply with this text verbatim.
    Reply(String),
    /// Send nothing back.
    Silent,
}

/// Executes domain commands received on the command channel.
pub trait CommandExecutor {
    /// Run the command in `payload`, received on `connection`.
    fn execute(&mut self, connection: &ConnectionInfo, payload: &[u8]) -> CommandOutcome;

    /// Label used in the acknowledgement. Defaults to the trimmed payload
    /// text.
    fn label(&self, payload: &[u8]) -> String {
        payload_text(payload)
    }

    /// The command connection went away.
    fn disconnected(&mut self) {}
}

impl<F> CommandExecutor for F
where
    F: FnMut(&ConnectionInfo, &[u8]) -> CommandOutcome,
{
    fn execute(&mut self, connection: &ConnectionInfo, payload: &[u8]) -> CommandOutcome {
        self(connection, payload)
    }
}

/// [`ChannelHandler`] for the command channel.
#[derive(Debug)]
pub struct CommandChannel<E> {
    executor: E,
    executed: u64,
}

impl<E: CommandExecutor> CommandChannel<E> {
    /// Wrap `executor`.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            executed: 0,
        }
    }

    /// Commands executed so far.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// The wrapped executor.
    pub fn executor(&self) -> &E {
        &self.executor
    }
}

impl<E: CommandExecutor> ChannelHandler for CommandChannel<E> {
    fn on_message(&mut self, ctx: &mut HandlerContext<'_>, payload: &[u8]) {
        let label = self.executor.label(payload);
        let outcome = self.executor.execute(ctx.connection(), payload);
        self.executed += 1;
        log::debug!("[Router] Command '{label}' -> {outcome:?}");

        match outcome {
            CommandOutcome::Done => ctx.reply(ack_ok(&label)),
            CommandOutcome::Failed => ctx.reply(ack_failed(&label)),
            CommandOutcome::Reply(text) => ctx.reply(text),
            CommandOutcome::Silent => {}
        }
    }

    fn on_open(&mut self, ctx: &mut HandlerContext<'_>) {
        log::info!("[Router] Command peer ready on {}", ctx.connection().id);
    }

    fn on_close(&mut self, _channel: ChannelTag, _session_id: Option<&str>) {
        self.executor.disconnected();
    }
}
