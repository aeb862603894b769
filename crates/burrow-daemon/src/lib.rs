//! Burrow daemon
//!
//! Dials SSH hosts by alias, following `ProxyJump`/`ProxyCommand` chains:
//!
//! ```text
//!   caller ──start(alias)──▶ dial thread (current-thread runtime)
//!                               │ resolve ─▶ ConfigProvider
//!                               │ connect ─▶ TCP, or jump host + forward
//!                               │ handshake ─▶ Handshaker (russh)
//!   SshControl ◀──established───┘
//!       │ release()
//!       └──────────▶ cancel token ─▶ close hops, outermost first
//! ```
//!
//! Each dial lives on its own thread until its control is released, so
//! concurrent dials never wait on each other.

pub mod control;
pub mod dial;
pub mod error;
pub mod provider;
pub mod proxy;
pub mod session;

pub use control::{DialHandle, SshControl};
pub use dial::{DialOptions, DialState, Orchestrator};
pub use error::DialError;
pub use provider::{AuthMethod, ConfigProvider, HostsProvider, ResolvedHost, StaticProvider};
pub use proxy::{ProxyCommand, StdioForward};
pub use session::{BoxedStream, ByteStream, Handshaker, RusshHandshaker, SshSession};
