//! Protocol error codes shared by command results and kernel responses.
//!
//! The backend keys remediation logic off these values, so they are part of
//! the wire contract: a gate rejection must carry the gate's code, not a
//! generic failure.

/// The operation completed.
pub const OK: i64 = 0;

/// Rejected by the quarantine gate before reaching the kernel service.
pub const QUARANTINED: i64 = 4001;

/// The command's pinned policy hash did not match the device's.
pub const POLICY_MISMATCH: i64 = 4002;

/// The requested method or opcode is not in the supported set.
pub const UNSUPPORTED_METHOD: i64 = 4004;

/// Screen lock could not be performed.
pub const LOCK_FAILED: i64 = 5001;

/// A privileged power or session action (reboot, shutdown, logout) failed.
pub const PRIVILEGED_ACTION_FAILED: i64 = 5002;

/// An update lifecycle operation (stage, commit, rollback, repair) failed.
pub const UPDATE_OP_FAILED: i64 = 5003;

/// The agent could not reach the kernel service at all.
pub const IPC_FAILURE: i64 = 5100;
