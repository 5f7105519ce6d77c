//! Default channel handlers.
//!
//! - [`CommandChannel`] - domain commands from external control tools,
//!   executed by a pluggable [`CommandExecutor`].
//! - [`SessionChannel`] - status, dialog and application peers: session
//!   identification and close requests, everything else forwarded.
//!
//! Replies follow the `ANS <label> OK` / `ERR <label> FAILED` convention.

pub mod command;
pub mod session;

pub use command::{CommandChannel, CommandExecutor, CommandOutcome};
pub use session::SessionChannel;

use crate::hub::trim_text;

/// Success acknowledgement for `label`.
#[must_use]
pub fn ack_ok(label: &str) -> String {
    format!("ANS {label} OK")
}

/// Failure acknowledgement for `label`.
#[must_use]
pub fn ack_failed(label: &str) -> String {
    format!("ERR {label} FAILED")
}

/// Payload as text, without the trailing NULs and whitespace peers append.
pub(crate) fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(trim_text(payload)).into_owned()
}
