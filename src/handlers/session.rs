//! Handler for the status, dialog and application channels.
//!
//! Two requests are understood on every such channel:
//!
//! - `HELLO <id>` records the peer's session id (e.g. an application id) and
//!   answers `ANS HELLO OK`.
//! - `CLOSE` answers `ANS CLOSE OK` and closes the connection once the
//!   answer is written.
//!
//! Anything else goes to the forward handler, if one is set.

use super::{ack_failed, ack_ok, payload_text};
use crate::hub::channel::{ChannelHandler, ChannelTag, HandlerContext};

/// [`ChannelHandler`] for peer processes that identify themselves.
pub struct SessionChannel {
    name: String,
    forward: Option<Box<dyn ChannelHandler>>,
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("name", &self.name)
            .field("forward", &self.forward.is_some())
            .finish()
    }
}

impl SessionChannel {
    /// Handler for the channel called `name`, dropping unrecognised traffic.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            forward: None,
        }
    }

    /// Pass unrecognised messages (and open/close notifications) to `handler`.
    pub fn forward_to(mut self, handler: Box<dyn ChannelHandler>) -> Self {
        self.forward = Some(handler);
        self
    }

    /// Box this handler for registration.
    pub fn boxed(self) -> Box<dyn ChannelHandler> {
        Box::new(self)
    }
}

impl ChannelHandler for SessionChannel {
    fn on_message(&mut self, ctx: &mut HandlerContext<'_>, payload: &[u8]) {
        let text = payload_text(payload);

        if let Some(rest) = text.strip_prefix("HELLO") {
            let id = rest.trim();
            if id.is_empty() || !rest.starts_with(char::is_whitespace) {
                log::warn!("[Router] '{}' sent malformed HELLO: {text:?}", self.name);
                ctx.reply(ack_failed("HELLO"));
                return;
            }
            log::info!("[Router] '{}' peer identified as '{id}'", self.name);
            ctx.set_session_id(id);
            ctx.reply(ack_ok("HELLO"));
            return;
        }

        if text == "CLOSE" {
            log::info!(
                "[Router] '{}' peer {} asked to close",
                self.name,
                ctx.session_id().unwrap_or("<anonymous>")
            );
            ctx.reply(ack_ok("CLOSE"));
            ctx.close();
            return;
        }

        match self.forward.as_mut() {
            Some(handler) => handler.on_message(ctx, payload),
            None => log::debug!("[Router] '{}' ignored {} byte message", self.name, payload.len()),
        }
    }

    fn on_open(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(handler) = self.forward.as_mut() {
            handler.on_open(ctx);
        }
    }

    fn on_close(&mut self, channel: ChannelTag, session_id: Option<&str>) {
        log::info!(
            "[Router] '{}' peer {} disconnected",
            self.name,
            session_id.unwrap_or("<anonymous>")
        );
        if let Some(handler) = self.forward.as_mut() {
            handler.on_close(channel, session_id);
        }
    }
}
