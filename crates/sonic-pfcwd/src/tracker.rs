//! The `(port, priority)` session table.
//!
//! Sessions exist for every priority on which a port with a watchdog entry
//! honours received pause frames. Reconfiguration never drops a session
//! that still holds a mitigation: it is withdrawn to Normal first, marked
//! pending and reaped once its lane has released the rule.
//!
//! Session table changes are synchronous and serialized per port by the
//! port's entry in the port table. Counter registration follows through
//! the registrar and is never awaited from a poll tick.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use sonic_types::{PortAlias, PortOid, Priority};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::acl::{AclPacketAction, AclRuleManager, RuleKey};
use crate::config::{BackoffPolicy, PortPfcConfig};
use crate::counters::{CounterRegistrar, CounterSample};
use crate::detector::StormDetector;
use crate::error::{PfcWdError, Result};
use crate::events::EventSink;
use crate::mitigation::{apply_transition, LaneContext, MitigationLane};
use crate::session::{SessionSnapshot, WatchdogSession};
use crate::state::{SessionEvent, SessionState};
use crate::types::{SessionKey, WatchdogParams};

#[derive(Debug, Clone)]
struct PortRecord {
    oid: PortOid,
    pfc: PortPfcConfig,
    watchdog: Option<WatchdogParams>,
    /// Removed from the system; dropped once its sessions are gone.
    removed: bool,
}

impl PortRecord {
    fn new(oid: PortOid) -> Self {
        Self {
            oid,
            pfc: PortPfcConfig::default(),
            watchdog: None,
            removed: false,
        }
    }

    fn wanted_priorities(&self) -> BTreeSet<Priority> {
        match self.watchdog {
            Some(_) if !self.removed => self.pfc.rx_priorities(),
            _ => BTreeSet::new(),
        }
    }

    /// The session still matches this record and may be kept.
    fn keeps(&self, key: &SessionKey, session: &WatchdogSession) -> bool {
        self.wanted_priorities().contains(&key.priority)
            && session.port_oid() == self.oid
            && Some(*session.params()) == self.watchdog
    }
}

pub(crate) struct SessionEntry {
    session: Arc<Mutex<WatchdogSession>>,
    lane: Option<MitigationLane>,
}

impl SessionEntry {
    fn ready_to_reap(&self) -> bool {
        let session = self.session.lock();
        session.is_pending_destroy()
            && session.state() == SessionState::Normal
            && self.lane.as_ref().map_or(true, MitigationLane::is_clear)
    }
}

/// Owns every watchdog session and the port configuration they derive from.
pub struct PrioritySessionTracker {
    ports: DashMap<PortAlias, PortRecord>,
    sessions: DashMap<SessionKey, Arc<SessionEntry>>,
    registrar: Arc<CounterRegistrar>,
    rules: Arc<AclRuleManager>,
    events: EventSink,
    retry: BackoffPolicy,
    history_len: usize,
}

impl PrioritySessionTracker {
    pub(crate) fn new(
        registrar: Arc<CounterRegistrar>,
        rules: Arc<AclRuleManager>,
        events: EventSink,
        retry: BackoffPolicy,
        history_len: usize,
    ) -> Self {
        Self {
            ports: DashMap::new(),
            sessions: DashMap::new(),
            registrar,
            rules,
            events,
            retry,
            history_len,
        }
    }

    /// Makes a port known. Returns false if it already was.
    ///
    /// A port that is still draining after removal comes back with the new
    /// OID and empty configuration. Its draining sessions are bound to the
    /// old OID and are replaced once they are gone.
    pub fn add_port(&self, port: PortAlias, oid: PortOid) -> bool {
        match self.ports.entry(port) {
            Entry::Occupied(mut entry) => {
                if !entry.get().removed {
                    return false;
                }
                debug!(port = %entry.key(), oid = %oid, "Re-added draining port");
                *entry.get_mut() = PortRecord::new(oid);
                true
            }
            Entry::Vacant(entry) => {
                debug!(port = %entry.key(), oid = %oid, "Added port");
                entry.insert(PortRecord::new(oid));
                true
            }
        }
    }

    /// Withdraws every session of the port and forgets it once they are gone.
    pub async fn remove_port(&self, port: &PortAlias) -> Result<()> {
        self.configure(port, |r| {
            r.removed = true;
            r.watchdog = None;
        })
        .await
    }

    pub async fn set_pfc_enable(
        &self,
        port: &PortAlias,
        priorities: BTreeSet<Priority>,
    ) -> Result<()> {
        self.configure(port, |r| r.pfc.pfc_enable = priorities).await
    }

    pub async fn set_pfc_asym(&self, port: &PortAlias, asymmetric: bool) -> Result<()> {
        self.configure(port, |r| r.pfc.asymmetric = asymmetric).await
    }

    pub async fn start_watchdog(&self, port: &PortAlias, params: WatchdogParams) -> Result<()> {
        self.configure(port, |r| r.watchdog = Some(params)).await
    }

    pub async fn stop_watchdog(&self, port: &PortAlias) -> Result<()> {
        self.configure(port, |r| r.watchdog = None).await
    }

    /// Applies `update` to a known port, reconciles its sessions and waits
    /// for its counter registration to follow.
    async fn configure(
        &self,
        port: &PortAlias,
        update: impl FnOnce(&mut PortRecord),
    ) -> Result<()> {
        {
            let mut record = match self.ports.get_mut(port) {
                Some(record) if !record.removed => record,
                _ => return Err(PfcWdError::invalid_port(port.as_str())),
            };
            update(record.value_mut());
            self.reconcile_record(port, record.value());
        }
        self.forget_if_drained(port);
        self.registrar.sync_port(port).await
    }

    fn port_sessions(&self, port: &PortAlias) -> Vec<(SessionKey, Arc<SessionEntry>)> {
        self.sessions
            .iter()
            .filter(|e| &e.key().port == port)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn all_entries(&self) -> Vec<(SessionKey, Arc<SessionEntry>)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn has_sessions(&self, port: &PortAlias) -> bool {
        self.sessions.iter().any(|e| &e.key().port == port)
    }

    /// Brings the port's sessions in line with its record and records the
    /// counter registration they need. Returns true if the session table
    /// changed.
    ///
    /// Callers hold the port's entry, which serializes this per port.
    /// Unwanted sessions are withdrawn and reaped when possible, then
    /// missing sessions are created.
    fn reconcile_record(&self, port: &PortAlias, record: &PortRecord) -> bool {
        let mut changed = false;

        for (key, entry) in self.port_sessions(port) {
            let keep = record.keeps(&key, &entry.session.lock());
            if keep {
                self.cancel_destroy(&key, &entry);
            } else {
                self.request_destroy(&key, &entry);
            }
            if entry.ready_to_reap() {
                self.remove_session(&key);
                changed = true;
            }
        }

        if let Some(params) = record.watchdog.filter(|_| !record.removed) {
            for priority in record.wanted_priorities() {
                let key = SessionKey::new(port.clone(), priority);
                if !self.sessions.contains_key(&key) {
                    self.create_session(key, record.oid, params);
                    changed = true;
                }
            }
        }

        let oid = self.has_sessions(port).then_some(record.oid);
        self.registrar.set_desired(port, oid);
        changed
    }

    fn forget_if_drained(&self, port: &PortAlias) {
        let forgotten = self
            .ports
            .remove_if(port, |_, r| r.removed && !self.has_sessions(port));
        if forgotten.is_some() {
            info!(port = %port, "Forgot removed port");
        }
    }

    fn reconcile_all(&self) -> bool {
        let ports: Vec<PortAlias> = self.ports.iter().map(|r| r.key().clone()).collect();
        let mut changed = false;
        for port in ports {
            if let Some(record) = self.ports.get_mut(&port) {
                changed |= self.reconcile_record(&port, record.value());
            }
            self.forget_if_drained(&port);
        }
        changed
    }

    fn create_session(&self, key: SessionKey, oid: PortOid, params: WatchdogParams) {
        let session = Arc::new(Mutex::new(WatchdogSession::new(
            key.clone(),
            oid,
            params,
            self.history_len,
        )));
        let lane = AclPacketAction::for_action(params.action).map(|action| {
            MitigationLane::spawn(LaneContext {
                key: key.clone(),
                rule: RuleKey::new(key.priority, action),
                port_oid: oid,
                rules: self.rules.clone(),
                session: session.clone(),
                retry: self.retry,
                events: self.events.clone(),
            })
        });
        info!(
            port = %key.port,
            priority = %key.priority,
            oid = %oid,
            action = %params.action,
            detection_ms = params.detection_time.value(),
            restoration_ms = params.restoration_time.value(),
            "Created PFC watchdog session"
        );
        self.events.stats().session_created();
        self.sessions.insert(key, Arc::new(SessionEntry { session, lane }));
    }

    /// Marks a session for destruction, withdrawing any active mitigation.
    fn request_destroy(&self, key: &SessionKey, entry: &SessionEntry) {
        let mut session = entry.session.lock();
        if !session.is_pending_destroy() {
            session.set_pending_destroy(true);
            debug!(
                port = %key.port,
                priority = %key.priority,
                state = %session.state(),
                "Session destroy requested"
            );
        }
        if session.state() != SessionState::Normal {
            info!(
                port = %key.port,
                priority = %key.priority,
                state = %session.state(),
                "Withdrawing mitigation before destroying session"
            );
            self.withdraw(key, entry, &mut session);
        }
    }

    fn withdraw(&self, key: &SessionKey, entry: &SessionEntry, session: &mut WatchdogSession) {
        for t in session.force_normal(SessionEvent::Withdraw) {
            apply_transition(key, &t, entry.lane.as_ref(), &self.events);
        }
    }

    fn cancel_destroy(&self, key: &SessionKey, entry: &SessionEntry) {
        let mut session = entry.session.lock();
        if session.is_pending_destroy() {
            session.set_pending_destroy(false);
            session.last_snapshot = None;
            debug!(
                port = %key.port,
                priority = %key.priority,
                "Session re-enabled before removal"
            );
        }
    }

    fn remove_session(&self, key: &SessionKey) {
        if let Some((_, entry)) = self.sessions.remove(key) {
            if let Some(lane) = &entry.lane {
                lane.shutdown();
            }
            self.events.stats().session_destroyed();
            info!(port = %key.port, priority = %key.priority, "Destroyed PFC watchdog session");
        }
    }

    /// Removes sessions whose destruction can complete and queues any
    /// counter registration work left over. Never waits on a backend.
    /// Returns true if the session table changed.
    pub fn reap(&self) -> bool {
        let changed = self.reconcile_all();
        self.registrar.retry_pending();
        changed
    }

    /// Runs one detector tick over every live session.
    ///
    /// `samples` holds the poll result of each registered port; a port is
    /// absent when its poll failed.
    pub(crate) fn evaluate(
        &self,
        detector: &StormDetector,
        samples: &HashMap<PortAlias, CounterSample>,
        now: Instant,
    ) {
        for (key, entry) in self.all_entries() {
            let mut session = entry.session.lock();
            if session.is_pending_destroy() {
                continue;
            }
            let sample = samples.get(&key.port).and_then(|s| s.priority(key.priority));
            for t in detector.evaluate(&mut session, sample, now) {
                apply_transition(&key, &t, entry.lane.as_ref(), &self.events);
            }
        }
    }

    /// Wakes lanes whose membership differs from their intent.
    pub(crate) fn kick_diverged(&self) {
        for entry in self.sessions.iter() {
            if let Some(lane) = entry.value().lane.as_ref().filter(|l| l.diverged()) {
                debug!(
                    port = %entry.key().port,
                    priority = %entry.key().priority,
                    "Retrying diverged mitigation"
                );
                lane.kick();
            }
        }
    }

    /// Waits for every lane to process its intent and for counter
    /// registrations to follow, reaping until the session table stops
    /// changing.
    pub async fn settle(&self) {
        loop {
            for (_, entry) in self.all_entries() {
                if let Some(lane) = &entry.lane {
                    lane.settled().await;
                }
            }
            let changed = self.reconcile_all();
            self.registrar.sync_all().await;
            if !changed {
                break;
            }
        }
    }

    /// Withdraws every active mitigation and cancels every lane. A lane
    /// still holding rule membership releases it before it exits.
    pub fn shutdown(&self) {
        for (key, entry) in self.all_entries() {
            {
                let mut session = entry.session.lock();
                if session.state() != SessionState::Normal {
                    info!(
                        port = %key.port,
                        priority = %key.priority,
                        state = %session.state(),
                        "Withdrawing mitigation on shutdown"
                    );
                    self.withdraw(&key, &entry, &mut session);
                }
            }
            if let Some(lane) = &entry.lane {
                lane.shutdown();
            }
        }
    }

    pub fn session(&self, key: &SessionKey) -> Option<SessionSnapshot> {
        self.sessions.get(key).map(|e| e.session.lock().snapshot())
    }

    pub fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.get(key).map(|e| e.session.lock().state())
    }

    /// Sessions of one port, ordered by priority.
    pub fn sessions_for(&self, port: &PortAlias) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .port_sessions(port)
            .into_iter()
            .map(|(_, e)| e.session.lock().snapshot())
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// Every session, ordered by key.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .all_entries()
            .into_iter()
            .map(|(_, e)| e.session.lock().snapshot())
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
