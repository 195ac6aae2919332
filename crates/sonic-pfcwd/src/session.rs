//! Watchdog session record.

use serde::Serialize;
use sonic_types::{PortOid, Priority};
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::counters::PriorityCounters;
use crate::state::{self, SessionEvent, SessionState, Transition};
use crate::types::{SessionKey, WatchdogParams};

/// One recorded edge in a session's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub from: SessionState,
    pub to: SessionState,
    pub event: SessionEvent,
}

/// Watchdog state for one `(port, priority)`.
///
/// Owned by the session tracker. All mutation happens under the tracker's
/// per-session lock.
#[derive(Debug)]
pub struct WatchdogSession {
    key: SessionKey,
    port_oid: PortOid,
    params: WatchdogParams,
    state: SessionState,
    pub(crate) last_snapshot: Option<(PriorityCounters, Instant)>,
    /// Start of the current run of asserted observations while `Normal`.
    pub(crate) storm_start: Option<Instant>,
    /// Start of the current pause-free period while `Restoring`.
    pub(crate) restore_start: Option<Instant>,
    pending_destroy: bool,
    history: VecDeque<TransitionRecord>,
    history_len: usize,
}

impl WatchdogSession {
    pub fn new(
        key: SessionKey,
        port_oid: PortOid,
        params: WatchdogParams,
        history_len: usize,
    ) -> Self {
        Self {
            key,
            port_oid,
            params,
            state: SessionState::Normal,
            last_snapshot: None,
            storm_start: None,
            restore_start: None,
            pending_destroy: false,
            history: VecDeque::with_capacity(history_len),
            history_len,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.key.priority
    }

    pub fn port_oid(&self) -> PortOid {
        self.port_oid
    }

    pub fn params(&self) -> &WatchdogParams {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_pending_destroy(&self) -> bool {
        self.pending_destroy
    }

    pub(crate) fn set_pending_destroy(&mut self, pending: bool) {
        self.pending_destroy = pending;
    }

    /// Applies an event. Inapplicable events leave the session unchanged.
    pub fn apply(&mut self, event: SessionEvent) -> Option<Transition> {
        let t = state::transition(self.state, event)?;
        self.record(&t);
        Some(t)
    }

    /// Drives the session back to `Normal` through `Restoring`.
    pub fn force_normal(&mut self, event: SessionEvent) -> Vec<Transition> {
        let edges = state::force_normal(self.state, event);
        for t in &edges {
            self.record(t);
        }
        edges
    }

    fn record(&mut self, t: &Transition) {
        self.state = t.to;
        match t.to {
            SessionState::Normal => {
                self.storm_start = None;
                self.restore_start = None;
            }
            SessionState::Dropping => self.restore_start = None,
            SessionState::Restoring => self.storm_start = None,
        }
        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(TransitionRecord {
                from: t.from,
                to: t.to,
                event: t.event,
            });
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key.clone(),
            port_oid: self.port_oid,
            params: self.params,
            state: self.state,
            pending_destroy: self.pending_destroy,
            history: self.history.iter().copied().collect(),
        }
    }
}

/// Read-only view of a session for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub port_oid: PortOid,
    pub params: WatchdogParams,
    pub state: SessionState,
    pub pending_destroy: bool,
    pub history: Vec<TransitionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PfcWdAction;
    use sonic_types::PortAlias;

    fn session(history_len: usize) -> WatchdogSession {
        WatchdogSession::new(
            SessionKey::new(PortAlias::new("Ethernet0").unwrap(), Priority::new(3).unwrap()),
            PortOid::from_raw(0x1000000000002).unwrap(),
            WatchdogParams::from_millis(PfcWdAction::Drop, 400, 400).unwrap(),
            history_len,
        )
    }

    #[test]
    fn test_apply_records_history() {
        let mut s = session(8);
        assert!(s.apply(SessionEvent::PauseCleared).is_none());
        assert!(s.apply(SessionEvent::StormDetected).is_some());
        assert_eq!(s.state(), SessionState::Dropping);

        let edges = s.force_normal(SessionEvent::Withdraw);
        assert_eq!(edges.len(), 2);
        assert_eq!(s.state(), SessionState::Normal);

        let path: Vec<_> = s.history().map(|r| r.to).collect();
        assert_eq!(
            path,
            vec![
                SessionState::Dropping,
                SessionState::Restoring,
                SessionState::Normal
            ]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = session(2);
        s.apply(SessionEvent::StormDetected);
        s.apply(SessionEvent::PauseCleared);
        s.apply(SessionEvent::RestorationElapsed);
        let snapshot = s.snapshot();
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[0].to, SessionState::Restoring);
    }

    #[test]
    fn test_timers_reset_on_state_change() {
        let mut s = session(4);
        s.storm_start = Some(Instant::now());
        s.apply(SessionEvent::StormDetected);
        s.apply(SessionEvent::PauseCleared);
        assert!(s.storm_start.is_none());
        s.restore_start = Some(Instant::now());
        s.apply(SessionEvent::PauseReasserted);
        assert!(s.restore_start.is_none());
    }
}
