//! Homescreen IPC hub.
//!
//! Multiplexes the homescreen's control channels (command, status, dialog,
//! application) over one WebSocket listener, keeps one live connection per
//! channel, and delivers traffic to per-channel handlers from a single,
//! non-blocking service step driven by an external event loop.
//!
//! # Architecture
//!
//! - **Hub** - dispatcher owning the channel router, connection table,
//!   message pool, queues and readiness registry
//! - **Transport** - non-blocking session layer reporting events to the hub
//! - **Handlers** - default channel behaviour (commands, session requests)
//!
//! # Modules
//!
//! - [`hub`] - dispatcher and its tables
//! - [`transport`] - transport boundary, WebSocket and loopback transports
//! - [`handlers`] - default channel handlers
//! - [`config`] - configuration loading/saving

// Library modules
pub mod config;
pub mod handlers;
pub mod hub;
pub mod transport;

// Re-export commonly used types
pub use config::{ChannelNames, HubConfig};
pub use hub::channel::{handler_fn, ChannelHandler, ChannelTag, ConnectionInfo, HandlerContext};
pub use hub::connection::{ConnectionId, ConnectionState};
pub use hub::readiness::{EventLoop, Interest, NullEventLoop};
pub use hub::{Hub, HubBuilder, HubStats, SendError, ServiceReport};
pub use transport::{Transport, TransportContext, TransportEvent, Verdict};
