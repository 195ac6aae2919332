//! Per-session watchdog state machine.
//!
//! The machine is cyclic: `Normal -> Dropping -> Restoring -> Normal`, with
//! `Restoring -> Dropping` when the pause reasserts. There is no edge from
//! `Dropping` straight to `Normal`; every exit from mitigation passes
//! through `Restoring`.
//!
//! [`transition`] is pure. It returns the next state together with the side
//! effects the mitigation layer must carry out, so detection policy and
//! mitigation policy only meet at transition edges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No storm; traffic is forwarded normally.
    #[default]
    Normal,
    /// Storm active; mitigation applied.
    Dropping,
    /// Pause cleared; restoration timer running.
    Restoring,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Dropping => "dropping",
            Self::Restoring => "restoring",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Dropping => write!(f, "Dropping"),
            Self::Restoring => write!(f, "Restoring"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Pause asserted continuously for the detection interval.
    StormDetected,
    /// First idle observation while dropping.
    PauseCleared,
    /// Pause observed again while restoring.
    PauseReasserted,
    /// Restoring for the full restoration interval without reassertion.
    RestorationElapsed,
    /// The session is being destroyed and must return to `Normal`.
    Withdraw,
    /// Installing the mitigation failed after every retry.
    MitigationFailed,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Add the session's port to its mitigation rule.
    InstallMitigation,
    /// Remove the session's port from its mitigation rule.
    RemoveMitigation,
    /// Report a storm on the session.
    AlertStormDetected,
    /// Report that the session returned to normal.
    AlertStormRestored,
}

/// A taken edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub event: SessionEvent,
    pub effects: Vec<Effect>,
}

/// Computes the edge for `event` in `state`.
///
/// Returns `None` when the event does not apply to the current state; the
/// session stays where it is.
pub fn transition(state: SessionState, event: SessionEvent) -> Option<Transition> {
    use Effect::*;
    use SessionEvent::*;
    use SessionState::*;

    let (to, effects) = match (state, event) {
        (Normal, StormDetected) => (Dropping, vec![InstallMitigation, AlertStormDetected]),
        (Dropping, PauseCleared) => (Restoring, vec![RemoveMitigation]),
        (Restoring, PauseReasserted) => (Dropping, vec![InstallMitigation]),
        (Restoring, RestorationElapsed) => (Normal, vec![AlertStormRestored]),
        (Dropping, Withdraw) | (Dropping, MitigationFailed) => (Restoring, vec![RemoveMitigation]),
        (Restoring, Withdraw) | (Restoring, MitigationFailed) => (Normal, vec![]),
        _ => return None,
    };

    Some(Transition {
        from: state,
        to,
        event,
        effects,
    })
}

/// Applies `event` repeatedly until the machine reaches `Normal`.
///
/// Only meaningful for the forcing events (`Withdraw`, `MitigationFailed`).
/// The returned edges always walk `Dropping -> Restoring -> Normal`.
pub fn force_normal(state: SessionState, event: SessionEvent) -> Vec<Transition> {
    let mut edges = Vec::new();
    let mut current = state;
    while current != SessionState::Normal {
        match transition(current, event) {
            Some(t) => {
                current = t.to;
                edges.push(t);
            }
            None => break,
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_storm_cycle() {
        let t = transition(SessionState::Normal, SessionEvent::StormDetected).unwrap();
        assert_eq!(t.to, SessionState::Dropping);
        assert_eq!(
            t.effects,
            vec![Effect::InstallMitigation, Effect::AlertStormDetected]
        );

        let t = transition(SessionState::Dropping, SessionEvent::PauseCleared).unwrap();
        assert_eq!(t.to, SessionState::Restoring);
        assert_eq!(t.effects, vec![Effect::RemoveMitigation]);

        let t = transition(SessionState::Restoring, SessionEvent::RestorationElapsed).unwrap();
        assert_eq!(t.to, SessionState::Normal);
        assert_eq!(t.effects, vec![Effect::AlertStormRestored]);
    }

    #[test]
    fn test_reassert_during_restoring() {
        let t = transition(SessionState::Restoring, SessionEvent::PauseReasserted).unwrap();
        assert_eq!(t.to, SessionState::Dropping);
        assert_eq!(t.effects, vec![Effect::InstallMitigation]);
    }

    #[test]
    fn test_no_direct_dropping_to_normal() {
        let events = [
            SessionEvent::StormDetected,
            SessionEvent::PauseCleared,
            SessionEvent::PauseReasserted,
            SessionEvent::RestorationElapsed,
            SessionEvent::Withdraw,
            SessionEvent::MitigationFailed,
        ];
        for event in events {
            if let Some(t) = transition(SessionState::Dropping, event) {
                assert_ne!(t.to, SessionState::Normal, "event {:?}", event);
            }
        }
    }

    #[test]
    fn test_inapplicable_events() {
        assert!(transition(SessionState::Normal, SessionEvent::PauseCleared).is_none());
        assert!(transition(SessionState::Normal, SessionEvent::Withdraw).is_none());
        assert!(transition(SessionState::Dropping, SessionEvent::StormDetected).is_none());
        assert!(transition(SessionState::Dropping, SessionEvent::RestorationElapsed).is_none());
    }

    #[test]
    fn test_force_normal_walks_restoring() {
        let edges = force_normal(SessionState::Dropping, SessionEvent::Withdraw);
        let path: Vec<_> = edges.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (SessionState::Dropping, SessionState::Restoring),
                (SessionState::Restoring, SessionState::Normal),
            ]
        );
        assert!(force_normal(SessionState::Normal, SessionEvent::Withdraw).is_empty());
        assert_eq!(
            force_normal(SessionState::Restoring, SessionEvent::MitigationFailed).len(),
            1
        );
    }
}
