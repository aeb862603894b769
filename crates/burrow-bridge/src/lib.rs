//! Burrow Bridge
//!
//! Serves mounted directories to web-based editors over WebSocket.
//!
//! # Protocol
//!
//! 1. Editor connects (optionally over TLS) and upgrades to WebSocket
//! 2. Editor sends `hello` to check the protocol version
//! 3. Each binary message is one frame (see `burrow_core::codec`)
//! 4. Requests name files as `<scheme>://<mount token>/<path>`
//! 5. Every request gets exactly one response carrying its operation id

pub mod backend;
pub mod client;
pub mod connection;
pub mod mount;
pub mod router;
pub mod server;
pub mod services;
pub mod tls;

pub use backend::{FsBackend, LocalBackend};
pub use client::BridgeClient;
pub use connection::{spawn_peer, ConnectionError, PeerHandle};
pub use mount::{Mount, MountError, MountRegistry};
pub use router::{CallError, Correlator, Dispatcher};
pub use server::{BridgeServer, ServerError};
pub use services::ServiceDirectory;
pub use tls::TlsError;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 8765;
