//! Alerts and statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sonic_types::{PortAlias, Priority};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::state::SessionState;
use crate::types::SessionKey;

/// What an alert reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// The session entered Dropping.
    StormDetected,
    /// The session returned to Normal.
    StormRestored,
    /// A mitigation call gave up after every retry.
    MitigationFailed {
        /// True when the failed call was an install.
        installing: bool,
        attempts: u32,
        error: String,
    },
}

/// Operator-facing watchdog notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PfcWdAlert {
    pub port: PortAlias,
    pub priority: Priority,
    /// Session state when the alert was raised.
    pub state: SessionState,
    pub kind: AlertKind,
    pub at: DateTime<Utc>,
}

/// Running totals.
#[derive(Debug, Default)]
pub struct PfcWdStats {
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    storms_detected: AtomicU64,
    storms_restored: AtomicU64,
    poll_failures: AtomicU64,
    mitigation_failures: AtomicU64,
}

/// Point-in-time copy of [`PfcWdStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PfcWdStatsSnapshot {
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub storms_detected: u64,
    pub storms_restored: u64,
    pub poll_failures: u64,
    pub mitigation_failures: u64,
}

impl PfcWdStats {
    pub(crate) fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn storm_detected(&self) {
        self.storms_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn storm_restored(&self) {
        self.storms_restored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn poll_failed(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mitigation_failed(&self) {
        self.mitigation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PfcWdStatsSnapshot {
        PfcWdStatsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            storms_detected: self.storms_detected.load(Ordering::Relaxed),
            storms_restored: self.storms_restored.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            mitigation_failures: self.mitigation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Alert channel plus statistics, shared by every component.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    alerts: broadcast::Sender<PfcWdAlert>,
    stats: Arc<PfcWdStats>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (alerts, _) = broadcast::channel(capacity.max(1));
        Self {
            alerts,
            stats: Arc::new(PfcWdStats::default()),
        }
    }

    pub(crate) fn stats(&self) -> &PfcWdStats {
        &self.stats
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PfcWdAlert> {
        self.alerts.subscribe()
    }

    pub(crate) fn alert(&self, key: &SessionKey, state: SessionState, kind: AlertKind) {
        let alert = PfcWdAlert {
            port: key.port.clone(),
            priority: key.priority,
            state,
            kind,
            at: Utc::now(),
        };
        // No receivers is fine.
        let _ = self.alerts.send(alert);
    }
}
