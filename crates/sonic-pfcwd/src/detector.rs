//! Storm detection from PFC counter deltas.
//!
//! Each poll tick compares a session's pause counters with the previous
//! snapshot. A tick is *asserted* when pause frames kept arriving and the
//! pause duration covered at least the configured share of the wall time
//! since the previous snapshot; anything else is an idle gap.

use std::time::Duration;
use tokio::time::Instant;

use crate::counters::PriorityCounters;
use crate::session::WatchdogSession;
use crate::state::{SessionEvent, SessionState, Transition};

/// Classification of one counter delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseObservation {
    /// Pause asserted for the whole interval.
    Asserted,
    /// No (or only partial) pause during the interval.
    Idle,
    /// Counters went backwards; the snapshot was re-based.
    Rebased,
}

/// Turns counter samples into state machine events.
#[derive(Debug, Clone, Copy)]
pub struct StormDetector {
    pause_assert_percent: u8,
}

impl StormDetector {
    pub fn new(pause_assert_percent: u8) -> Self {
        Self {
            pause_assert_percent: pause_assert_percent.min(100),
        }
    }

    /// Classifies the delta between two snapshots taken `elapsed` apart.
    pub fn observe(
        &self,
        previous: PriorityCounters,
        current: PriorityCounters,
        elapsed: Duration,
    ) -> PauseObservation {
        if current.pause_duration_us < previous.pause_duration_us
            || current.pause_packets < previous.pause_packets
        {
            return PauseObservation::Rebased;
        }

        let packets = current.pause_packets - previous.pause_packets;
        let paused_us = u128::from(current.pause_duration_us - previous.pause_duration_us);
        let elapsed_us = elapsed.as_micros().max(1);

        if packets > 0 && paused_us * 100 >= elapsed_us * u128::from(self.pause_assert_percent) {
            PauseObservation::Asserted
        } else {
            PauseObservation::Idle
        }
    }

    /// Feeds one tick into the session and applies the resulting events.
    ///
    /// `sample` is `None` when the counters could not be read; the session
    /// is left untouched so the next successful read spans both ticks.
    /// Thresholds are inclusive.
    pub fn evaluate(
        &self,
        session: &mut WatchdogSession,
        sample: Option<PriorityCounters>,
        now: Instant,
    ) -> Vec<Transition> {
        let Some(current) = sample else {
            return Vec::new();
        };
        let Some((previous, previous_at)) = session.last_snapshot.replace((current, now)) else {
            return Vec::new();
        };

        let elapsed = now.saturating_duration_since(previous_at);
        let observation = self.observe(previous, current, elapsed);
        let detection = session.params().detection_time.as_duration();
        let restoration = session.params().restoration_time.as_duration();
        let mut edges = Vec::new();

        match (session.state(), observation) {
            (SessionState::Normal, PauseObservation::Rebased) => session.storm_start = None,
            (_, PauseObservation::Rebased) => {}
            (SessionState::Normal, PauseObservation::Asserted) => {
                let start = *session.storm_start.get_or_insert(previous_at);
                if now.saturating_duration_since(start) >= detection {
                    edges.extend(session.apply(SessionEvent::StormDetected));
                }
            }
            (SessionState::Normal, PauseObservation::Idle) => session.storm_start = None,
            (SessionState::Dropping, PauseObservation::Asserted) => {}
            (SessionState::Dropping, PauseObservation::Idle) => {
                edges.extend(session.apply(SessionEvent::PauseCleared));
                session.restore_start = Some(previous_at);
                edges.extend(self.check_restored(session, now, restoration));
            }
            (SessionState::Restoring, PauseObservation::Asserted) => {
                edges.extend(session.apply(SessionEvent::PauseReasserted));
            }
            (SessionState::Restoring, PauseObservation::Idle) => {
                edges.extend(self.check_restored(session, now, restoration));
            }
        }

        edges
    }

    fn check_restored(
        &self,
        session: &mut WatchdogSession,
        now: Instant,
        restoration: Duration,
    ) -> Option<Transition> {
        let start = *session.restore_start.get_or_insert(now);
        if now.saturating_duration_since(start) >= restoration {
            session.apply(SessionEvent::RestorationElapsed)
        } else {
            None
        }
    }
}
