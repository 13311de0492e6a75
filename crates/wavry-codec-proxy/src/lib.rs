//! Client side of remote codec sessions.
//!
//! [`CodecProxy`] is what the media pipeline holds. It talks to the process
//! hosting its session through a [`HostConnection`] shared by all proxies via
//! the [`ConnectionManager`], which also recreates sessions when that process
//! dies.

#![forbid(unsafe_code)]

pub mod connection;
pub mod manager;
pub mod monitor;
pub mod proxy;

pub use connection::{Connector, HostConnection, LocalConnection, LocalConnector};
pub use manager::ConnectionManager;
pub use monitor::{DeathCallback, DeathLink, LivenessMonitor};
pub use proxy::{CodecProxy, OutputBuffer, OutputSample, ProxyCallbacks};
