//! Codec session host: runs codec sessions on behalf of remote proxies.
//!
//! A [`SessionHost`] owns every [`CodecSession`] in the hosting process. Each
//! session pairs client-filled input buffers with platform input slots and
//! copies platform outputs into pooled buffers the client can map.

#![forbid(unsafe_code)]

pub mod dispatch;
pub mod host;
pub mod input;
pub mod output;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{EventDispatcher, SessionEvents};
pub use host::{SessionHost, SessionStateCounts};
pub use input::InputProcessor;
pub use output::OutputProcessor;
pub use session::{CodecSession, SessionState, SessionStats};
