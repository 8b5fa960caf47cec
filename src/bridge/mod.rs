//! Stdio tool-server bridge.
//!
//! - `transport`: child process and line-framed byte channels
//! - `protocol`: wire types and method dialects
//! - `client`: correlated request/response client
//! - `session`: start/stop lifecycle around one client

pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{ClientOptions, ProtocolClient};
pub use protocol::Dialect;
pub use session::{Session, SessionState};
pub use transport::{LaunchSpec, SearchPath, Transport};
