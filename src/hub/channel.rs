//! Logical channels and the per-channel message handlers.
//!
//! A channel is a fixed identity (numeric [`ChannelTag`] plus a name that
//! doubles as the transport subprotocol) with exactly one [`ChannelHandler`].
//! The set is registered once, sealed when the hub is built, and read-only
//! from then on.
//!
//! Handlers never touch hub state directly. They receive a
//! [`HandlerContext`] describing the connection and record the actions they
//! want (replies, sends to other channels, session id, close); the dispatcher
//! applies those once the handler has returned, so a handler can never
//! re-enter the hub.

// Rust guideline compliant 2026-02

use super::connection::ConnectionId;

/// Numeric identity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelTag(pub u16);

impl ChannelTag {
    /// External control tools sending window/layout commands.
    pub const COMMAND: Self = Self(1);
    /// Status bar process.
    pub const STATUS: Self = Self(2);
    /// On-screen dialog process.
    pub const DIALOG: Self = Self(3);
    /// Native applications.
    pub const APPLICATION: Self = Self(4);

    /// Whether connections on this channel must complete the hello exchange
    /// before their traffic is routed.
    #[must_use]
    pub fn requires_handshake(self) -> bool {
        self == Self::COMMAND
    }
}

impl std::fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Numeric identity.
    pub tag: ChannelTag,
    /// Name, also the subprotocol the transport negotiates.
    pub name: String,
}

/// What a handler knows about the connection a message arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection handle.
    pub id: ConnectionId,
    /// Channel the connection is bound to.
    pub channel: ChannelTag,
    /// Identifier learned from the peer (e.g. an application id), if any.
    pub session_id: Option<String>,
}

/// Per-invocation view handed to a [`ChannelHandler`].
#[derive(Debug)]
pub struct HandlerContext<'a> {
    info: &'a ConnectionInfo,
    replies: Vec<Vec<u8>>,
    sends: Vec<(ChannelTag, Vec<u8>)>,
    session_id: Option<String>,
    close: bool,
}

impl<'a> HandlerContext<'a> {
    /// Context for one handler call on `info`'s connection.
    #[must_use]
    pub fn new(info: &'a ConnectionInfo) -> Self {
        Self {
            info,
            replies: Vec::new(),
            sends: Vec::new(),
            session_id: None,
            close: false,
        }
    }

    /// The connection this call concerns.
    #[must_use]
    pub fn connection(&self) -> &ConnectionInfo {
        self.info
    }

    /// Channel of the connection.
    #[must_use]
    pub fn channel(&self) -> ChannelTag {
        self.info.channel
    }

    /// Session id, including one set earlier in this same call.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id
            .as_deref()
            .or(self.info.session_id.as_deref())
    }

    /// Queue a reply on the same channel.
    pub fn reply(&mut self, payload: impl Into<Vec<u8>>) {
        self.replies.push(payload.into());
    }

    /// Queue a message for another channel. Dropped if that channel has no
    /// live connection.
    pub fn send(&mut self, channel: ChannelTag, payload: impl Into<Vec<u8>>) {
        self.sends.push((channel, payload.into()));
    }

    /// Record the peer's session identifier.
    pub fn set_session_id(&mut self, id: impl Into<String>) {
        self.session_id = Some(id.into());
    }

    /// Ask the hub to close this connection once queued replies are written.
    pub fn close(&mut self) {
        self.close = true;
    }

    /// Replies queued so far.
    #[must_use]
    pub fn replies(&self) -> &[Vec<u8>] {
        &self.replies
    }

    /// Whether close was requested.
    #[must_use]
    pub fn close_requested(&self) -> bool {
        self.close
    }

    pub(crate) fn into_actions(self) -> HandlerActions {
        HandlerActions {
            replies: self.replies,
            sends: self.sends,
            session_id: self.session_id,
            close: self.close,
        }
    }
}

/// Actions a handler recorded, applied by the dispatcher after it returns.
#[derive(Debug, Default)]
pub(crate) struct HandlerActions {
    pub(crate) replies: Vec<Vec<u8>>,
    pub(crate) sends: Vec<(ChannelTag, Vec<u8>)>,
    pub(crate) session_id: Option<String>,
    pub(crate) close: bool,
}

/// Turns raw channel bytes into domain actions.
pub trait ChannelHandler {
    /// Handle one inbound message. Called synchronously, in arrival order.
    fn on_message(&mut self, ctx: &mut HandlerContext<'_>, payload: &[u8]);

    /// A connection was bound to the channel (after the handshake, for
    /// channels that need one).
    fn on_open(&mut self, _ctx: &mut HandlerContext<'_>) {}

    /// The channel's connection closed.
    fn on_close(&mut self, _channel: ChannelTag, _session_id: Option<&str>) {}
}

impl<F> ChannelHandler for F
where
    F: FnMut(&mut HandlerContext<'_>, &[u8]),
{
    fn on_message(&mut self, ctx: &mut HandlerContext<'_>, payload: &[u8]) {
        self(ctx, payload);
    }
}

/// Box a closure as a [`ChannelHandler`].
///
/// Going through this function pins the closure's signature to the
/// higher-ranked one the trait needs.
pub fn handler_fn<F>(f: F) -> Box<dyn ChannelHandler>
where
    F: FnMut(&mut HandlerContext<'_>, &[u8]) + 'static,
{
    Box::new(f)
}

/// Invalid channel registration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The tag is already registered.
    DuplicateTag(ChannelTag),
    /// The name is already registered.
    DuplicateName(String),
    /// Channel names are also subprotocol names and cannot be empty.
    EmptyName(ChannelTag),
    /// The router was sealed when the hub started servicing.
    Sealed,
    /// A hub needs at least one channel.
    NoChannels,
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateTag(tag) => write!(f, "Channel tag {tag} registered twice"),
            Self::DuplicateName(name) => write!(f, "Channel name '{name}' registered twice"),
            Self::EmptyName(tag) => write!(f, "Channel {tag} has an empty name"),
            Self::Sealed => write!(f, "Channels cannot be registered after the hub started"),
            Self::NoChannels => write!(f, "No channels registered"),
        }
    }
}

impl std::error::Error for RegisterError {}

struct Route {
    channel: Channel,
    handler: Box<dyn ChannelHandler>,
}

/// Fixed table of channels and their handlers.
#[derive(Default)]
pub struct ChannelRouter {
    routes: Vec<Route>,
    sealed: bool,
}

impl std::fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("channels", &self.protocols())
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}

impl ChannelRouter {
    /// Create an empty, unsealed router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. Only valid before [`ChannelRouter::seal`].
    pub fn register(
        &mut self,
        tag: ChannelTag,
        name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), RegisterError> {
        if self.sealed {
            return Err(RegisterError::Sealed);
        }
        let name = name.into();
        if name.is_empty() {
            return Err(RegisterError::EmptyName(tag));
        }
        if self.channel(tag).is_some() {
            return Err(RegisterError::DuplicateTag(tag));
        }
        if self.tag_for(&name).is_some() {
            return Err(RegisterError::DuplicateName(name));
        }

        log::debug!("[Router] Registered channel '{}' as {}", name, tag);
        self.routes.push(Route {
            channel: Channel { tag, name },
            handler,
        });
        Ok(())
    }

    /// Freeze the channel set.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Tag registered under `name`.
    #[must_use]
    pub fn tag_for(&self, name: &str) -> Option<ChannelTag> {
        self.routes
            .iter()
            .find(|route| route.channel.name == name)
            .map(|route| route.channel.tag)
    }

    /// Channel registered under `tag`.
    #[must_use]
    pub fn channel(&self, tag: ChannelTag) -> Option<&Channel> {
        self.routes
            .iter()
            .map(|route| &route.channel)
            .find(|channel| channel.tag == tag)
    }

    /// Channel names in registration order, as handed to the transport.
    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|route| route.channel.name.clone())
            .collect()
    }

    /// All registered tags in registration order.
    #[must_use]
    pub fn tags(&self) -> Vec<ChannelTag> {
        self.routes.iter().map(|route| route.channel.tag).collect()
    }

    /// Deliver one inbound payload to its channel's handler.
    ///
    /// Returns `false` if no handler is registered for the context's channel.
    /// The builder makes that unreachable for traffic from the transport.
    pub fn route_inbound(&mut self, ctx: &mut HandlerContext<'_>, payload: &[u8]) -> bool {
        let Some(route) = self.route_mut(ctx.channel()) else {
            log::error!("[Router] No handler for channel {}", ctx.channel());
            return false;
        };
        route.handler.on_message(ctx, payload);
        true
    }

    /// Notify a channel's handler that a connection bound to it.
    pub fn notify_open(&mut self, ctx: &mut HandlerContext<'_>) {
        if let Some(route) = self.route_mut(ctx.channel()) {
            route.handler.on_open(ctx);
        }
    }

    /// Notify a channel's handler that its connection went away.
    pub fn notify_close(&mut self, tag: ChannelTag, session_id: Option<&str>) {
        if let Some(route) = self.route_mut(tag) {
            route.handler.on_close(tag, session_id);
        }
    }

    fn route_mut(&mut self, tag: ChannelTag) -> Option<&mut Route> {
        self.routes.iter_mut().find(|route| route.channel.tag == tag)
    }
}
