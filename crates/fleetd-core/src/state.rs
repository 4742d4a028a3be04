//! Shared agent session state.
//!
//! One [`AgentState`] is created at agent startup and cloned into every
//! task that needs it (session loop, dispatcher, diagnostics). Immutable
//! identity lives outside the lock; everything the backend can change at
//! runtime (session id, pinned policy hash, quarantine) lives behind one
//! mutex with short, await-free critical sections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Methods a quarantined device may still execute. Everything here is
/// read-only or strictly recovery-oriented; nothing touches the OS or the
/// update lifecycle.
pub const QUARANTINE_ALLOWLIST: [&str; 5] = [
    "collect_diagnostics",
    "fetch_revocations",
    "ping",
    "reauth",
    "time_sync",
];

/// Returns `true` if `method` may run while the device is quarantined.
#[must_use]
pub fn quarantine_allows(method: &str) -> bool {
    QUARANTINE_ALLOWLIST.contains(&method)
}

/// Point-in-time copy of the agent state, serializable for diagnostics
/// commands.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// Stable device identifier.
    pub device_id: String,
    /// Current backend session, if authenticated.
    pub session_id: Option<String>,
    /// Policy hash pinned from the last `AUTH_ACK`/`POLICY_UPDATE`.
    pub policy_hash: String,
    /// Whether the device is quarantined.
    pub quarantined: bool,
    /// Operator-facing quarantine reason, if any.
    pub quarantine_reason: Option<String>,
    /// Release id of the last update this agent was told about.
    pub last_release_id: Option<String>,
    /// Seconds since agent start.
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    policy_hash: String,
    quarantine_reason: Option<String>,
    quarantined: bool,
    last_release_id: Option<String>,
    reauth_requested: bool,
}

#[derive(Debug)]
struct StateHandle {
    device_id: String,
    started_at: DateTime<Utc>,
    session: Mutex<SessionState>,
}

/// Cloneable handle to the shared agent state.
#[derive(Debug, Clone)]
pub struct AgentState {
    handle: Arc<StateHandle>,
}

impl AgentState {
    /// Creates state for a device with no session, no pinned policy, and
    /// no quarantine.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            handle: Arc::new(StateHandle {
                device_id: device_id.into(),
                started_at: Utc::now(),
                session: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Stable device identifier.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    /// When this agent process started.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.handle.started_at
    }

    /// Seconds since agent start, clamped at zero against clock steps.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        let uptime = Utc::now() - self.handle.started_at;
        u64::try_from(uptime.num_seconds().max(0)).unwrap_or(0)
    }

    /// Current session id, if authenticated.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Records the session id granted by `AUTH_ACK`.
    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.lock().session_id = Some(session_id.into());
    }

    /// Drops the session, e.g. when the transport closes.
    pub fn clear_session(&self) {
        self.lock().session_id = None;
    }

    /// The pinned policy hash (empty until the backend delivers one).
    #[must_use]
    pub fn policy_hash(&self) -> String {
        self.lock().policy_hash.clone()
    }

    /// Pins a new policy hash.
    pub fn set_policy_hash(&self, policy_hash: impl Into<String>) {
        self.lock().policy_hash = policy_hash.into();
    }

    /// Returns `true` if the device is quarantined.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        self.lock().quarantined
    }

    /// The quarantine reason, if quarantined and one was given.
    #[must_use]
    pub fn quarantine_reason(&self) -> Option<String> {
        let guard = self.lock();
        if guard.quarantined {
            guard.quarantine_reason.clone()
        } else {
            None
        }
    }

    /// Applies a quarantine transition from `POLICY_UPDATE`.
    pub fn set_quarantine(&self, active: bool, reason: Option<String>) {
        let mut guard = self.lock();
        guard.quarantined = active;
        guard.quarantine_reason = if active { reason } else { None };
    }

    /// Asks the session loop to cycle the connection and re-authenticate.
    pub fn request_reauth(&self) {
        self.lock().reauth_requested = true;
    }

    /// Consumes a pending re-authentication request, if one is set.
    #[must_use]
    pub fn take_reauth_request(&self) -> bool {
        std::mem::take(&mut self.lock().reauth_requested)
    }

    /// Release id of the last announced update, if any.
    #[must_use]
    pub fn last_release_id(&self) -> Option<String> {
        self.lock().last_release_id.clone()
    }

    /// Records the release id of an announced update.
    pub fn set_last_release_id(&self, release_id: impl Into<String>) {
        self.lock().last_release_id = Some(release_id.into());
    }

    /// Takes a serializable snapshot for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        let guard = self.lock();
        StateSnapshot {
            device_id: self.handle.device_id.clone(),
            session_id: guard.session_id.clone(),
            policy_hash: guard.policy_hash.clone(),
            quarantined: guard.quarantined,
            quarantine_reason: guard.quarantine_reason.clone(),
            last_release_id: guard.last_release_id.clone(),
            uptime_seconds: self.uptime_secs(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // A panicked writer cannot leave SessionState incoherent; every
        // mutation is a single field store.
        self.handle
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_no_session_or_quarantine() {
        let state = AgentState::new("dev-1");
        assert_eq!(state.device_id(), "dev-1");
        assert_eq!(state.session_id(), None);
        assert_eq!(state.policy_hash(), "");
        assert!(!state.is_quarantined());
    }

    #[test]
    fn session_and_policy_are_visible_across_clones() {
        let state = AgentState::new("dev-1");
        let clone = state.clone();

        state.set_session_id("sess-9");
        state.set_policy_hash("sha256:abc");

        assert_eq!(clone.session_id().as_deref(), Some("sess-9"));
        assert_eq!(clone.policy_hash(), "sha256:abc");

        clone.clear_session();
        assert_eq!(state.session_id(), None);
    }

    #[test]
    fn quarantine_reason_clears_on_lift() {
        let state = AgentState::new("dev-1");
        state.set_quarantine(true, Some("policy violation".to_string()));
        assert!(state.is_quarantined());
        assert_eq!(
            state.quarantine_reason().as_deref(),
            Some("policy violation")
        );

        state.set_quarantine(false, None);
        assert!(!state.is_quarantined());
        assert_eq!(state.quarantine_reason(), None);
    }

    #[test]
    fn allowlist_covers_recovery_methods_only() {
        for method in QUARANTINE_ALLOWLIST {
            assert!(quarantine_allows(method));
        }
        assert!(!quarantine_allows("reboot"));
        assert!(!quarantine_allows("lock_screen"));
        assert!(!quarantine_allows("stage_update"));
    }

    #[test]
    fn reauth_request_is_consumed_once() {
        let state = AgentState::new("dev-1");
        assert!(!state.take_reauth_request());
        state.request_reauth();
        assert!(state.take_reauth_request());
        assert!(!state.take_reauth_request());
    }

    #[test]
    fn snapshot_reflects_current_state() {
        let state = AgentState::new("dev-1");
        state.set_session_id("sess-1");
        state.set_quarantine(true, None);
        state.set_last_release_id("rel-3");

        let snapshot = state.snapshot();
        assert_eq!(snapshot.device_id, "dev-1");
        assert_eq!(snapshot.session_id.as_deref(), Some("sess-1"));
        assert!(snapshot.quarantined);
        assert_eq!(snapshot.quarantine_reason, None);
        assert_eq!(snapshot.last_release_id.as_deref(), Some("rel-3"));
    }
}
