//! Shared protocol core for the fleetd device-management plane.
//!
//! Everything the two fleetd binaries (`fleetd-agent`, `fleetd-kernelsvc`)
//! must agree on byte-for-byte lives here:
//!
//! - [`canonical`]: deterministic JSON encoding; the only serialization used
//!   for signed payloads
//! - [`crypto`]: Ed25519 signing/verification, key loading, and the tagged
//!   signature stamps used on kernel responses
//! - [`envelope`]: the signed backend envelope, its typed bodies, builder,
//!   and verifier
//! - [`sequence`]: the durable monotonic sequence counter backing envelope
//!   replay protection
//! - [`ipc`]: kernel request/response wire types and incremental JSON frame
//!   reading
//! - [`state`]: shared agent session state (session id, policy hash,
//!   quarantine)
//! - [`codes`]: the error-code table both sides report
//! - [`fs_safe`]: filesystem helpers hardened against symlink swaps and
//!   partial writes

pub mod canonical;
pub mod codes;
pub mod crypto;
pub mod envelope;
pub mod fs_safe;
pub mod ipc;
pub mod sequence;
pub mod state;
