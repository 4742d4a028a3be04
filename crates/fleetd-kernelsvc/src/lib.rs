//! fleetd-kernelsvc - the privileged half of the fleetd device stack.
//!
//! The kernel service owns everything that requires root: screen locks,
//! power transitions, session logout, and the update tree. It exposes a
//! single local IPC socket speaking one-request-per-connection JSON, and
//! trusts nothing about the caller beyond socket permissions: every opcode
//! is re-validated here, dangerous operations are gated by explicit
//! operator opt-in, and every response is stamped so the agent can prove
//! who executed what.
//!
//! Modules:
//!
//! - [`config`]: environment-driven service configuration
//! - [`server`]: the IPC socket lifecycle and serve loop
//! - [`executor`]: opcode dispatch, the dangerous-ops gate, response
//!   stamping
//! - [`ops`]: the privileged system actions behind the opcodes
//! - [`update`]: staged update lifecycle (stage, commit, rollback,
//!   self-repair)

pub mod config;
pub mod executor;
pub mod ops;
pub mod server;
pub mod update;
