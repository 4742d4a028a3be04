//! fleetd device agent.
//!
//! The agent is the unprivileged half of the fleetd pair. It holds the
//! authenticated backend session, enforces the quarantine and policy gates
//! on every inbound command, and relays privileged opcodes to the local
//! kernel service over a Unix socket. It never performs a privileged action
//! itself.
//!
//! Module map:
//!
//! - [`config`]: environment-driven agent configuration
//! - [`transport`]: the backend connection as a framed JSON stream
//! - [`session`]: AUTH handshake, heartbeat/telemetry cadence, inbound
//!   routing
//! - [`dispatch`]: the command gate chain and result shaping
//! - [`relay`]: the kernel-service client with reconnect and response
//!   verification
//! - [`telemetry`]: metric sampling behind a trait seam

pub mod config;
pub mod dispatch;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod transport;
