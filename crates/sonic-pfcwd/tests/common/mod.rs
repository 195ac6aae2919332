//! Mock backends for watchdog integration tests.
//!
//! `MockCounterBackend` plays the flex-counter side: it records what was
//! registered and synthesizes PFC counters for ports that are being paused.
//! `MockAclBackend` keeps an in-memory rule table and an operation log.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sonic_pfcwd::{
    flex_counter_key, AclBackend, AclMatcher, AclPacketAction, AclRuleOid, AclRuleSpec,
    BackendError, CounterBackend, CounterValues, PfcCounterId, PfcCounterKind, RegistrationId,
};
use sonic_types::{PortOid, Priority};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Default, Clone, Copy)]
struct PauseState {
    duration_us: u64,
    packets: u64,
    since: Option<Instant>,
}

impl PauseState {
    fn read(&self, now: Instant) -> (u64, u64) {
        match self.since {
            // One pause frame per millisecond, pausing the whole time.
            Some(since) => {
                let elapsed = now.saturating_duration_since(since);
                (
                    self.duration_us + elapsed.as_micros() as u64,
                    self.packets + elapsed.as_millis() as u64,
                )
            }
            None => (self.duration_us, self.packets),
        }
    }
}

/// Flex-counter stand-in.
#[derive(Default)]
pub struct MockCounterBackend {
    next_id: AtomicU64,
    registrations: Mutex<BTreeMap<u64, (PortOid, Vec<PfcCounterId>)>>,
    pause: Mutex<HashMap<(PortOid, Priority), PauseState>>,
    fail_polls: AtomicBool,
    hold_registrations: AtomicBool,
    released: Notify,
    pub register_calls: AtomicU32,
    pub deregister_calls: AtomicU32,
    pub poll_calls: AtomicU32,
}

impl MockCounterBackend {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Starts a continuous pause storm on `priority`.
    pub fn start_storm(&self, port: PortOid, priority: Priority) {
        let mut pause = self.pause.lock();
        let state = pause.entry((port, priority)).or_default();
        if state.since.is_none() {
            state.since = Some(Instant::now());
        }
    }

    pub fn stop_storm(&self, port: PortOid, priority: Priority) {
        let now = Instant::now();
        let mut pause = self.pause.lock();
        if let Some(state) = pause.get_mut(&(port, priority)) {
            let (duration_us, packets) = state.read(now);
            *state = PauseState {
                duration_us,
                packets,
                since: None,
            };
        }
    }

    pub fn set_fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    /// Makes new registrations wait until [`release_registrations`] is called.
    ///
    /// [`release_registrations`]: Self::release_registrations
    pub fn hold_registrations(&self) {
        self.hold_registrations.store(true, Ordering::SeqCst);
    }

    pub fn release_registrations(&self) {
        self.hold_registrations.store(false, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// FLEX_COUNTER_TABLE view: key to counter list.
    pub fn flex_counter_table(&self) -> BTreeMap<String, Vec<String>> {
        self.registrations
            .lock()
            .values()
            .map(|(port, counters)| {
                (
                    flex_counter_key(*port),
                    counters.iter().map(PfcCounterId::sai_name).collect(),
                )
            })
            .collect()
    }
}

fn unknown_registration(registration: RegistrationId) -> BackendError {
    BackendError::Rejected(format!("unknown registration {}", registration.0))
}

#[async_trait]
impl CounterBackend for MockCounterBackend {
    async fn register(
        &self,
        port: PortOid,
        counters: &[PfcCounterId],
    ) -> Result<RegistrationId, BackendError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        while self.hold_registrations.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registrations.lock().insert(id, (port, counters.to_vec()));
        Ok(RegistrationId(id))
    }

    async fn deregister(&self, registration: RegistrationId) -> Result<(), BackendError> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        self.registrations
            .lock()
            .remove(&registration.0)
            .map(|_| ())
            .ok_or_else(|| unknown_registration(registration))
    }

    async fn poll(&self, registration: RegistrationId) -> Result<CounterValues, BackendError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("COUNTERS_DB".to_string()));
        }
        let (port, counters) = self
            .registrations
            .lock()
            .get(&registration.0)
            .cloned()
            .ok_or_else(|| unknown_registration(registration))?;

        let now = Instant::now();
        let pause = self.pause.lock();
        Ok(counters
            .into_iter()
            .map(|id| {
                let (duration_us, packets) = pause
                    .get(&(port, id.priority))
                    .map(|s| s.read(now))
                    .unwrap_or_default();
                let value = match id.kind {
                    PfcCounterKind::RxPauseDuration => duration_us,
                    PfcCounterKind::RxPackets => packets,
                };
                (id, value)
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclOp {
    Create { table: String, name: String },
    Update { name: String },
    Delete { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    pub table: String,
    pub name: String,
    pub priority: u32,
    pub matchers: Vec<AclMatcher>,
    pub action: AclPacketAction,
}

/// ACL table stand-in.
#[derive(Default)]
pub struct MockAclBackend {
    next_oid: AtomicU64,
    rules: Mutex<HashMap<AclRuleOid, InstalledRule>>,
    ops: Mutex<Vec<AclOp>>,
    fail: AtomicBool,
}

impl MockAclBackend {
    pub fn new() -> Self {
        Self {
            next_oid: AtomicU64::new(0x8000000000001),
            ..Default::default()
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(BackendError::Unreachable("syncd".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn ops(&self) -> Vec<AclOp> {
        self.ops.lock().clone()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.lock().len()
    }

    pub fn rule_named(&self, name: &str) -> Option<InstalledRule> {
        self.rules.lock().values().find(|r| r.name == name).cloned()
    }

    /// `IN_PORTS` of the named rule.
    pub fn in_ports(&self, name: &str) -> Option<Vec<PortOid>> {
        self.rule_named(name)?.matchers.into_iter().find_map(|m| match m {
            AclMatcher::InPorts(ports) => Some(ports),
            AclMatcher::TrafficClass { .. } => None,
        })
    }
}

#[async_trait]
impl AclBackend for MockAclBackend {
    async fn create_rule(
        &self,
        table: &str,
        spec: &AclRuleSpec,
    ) -> Result<AclRuleOid, BackendError> {
        self.check()?;
        let oid = AclRuleOid(self.next_oid.fetch_add(1, Ordering::SeqCst));
        self.rules.lock().insert(
            oid,
            InstalledRule {
                table: table.to_string(),
                name: spec.name.clone(),
                priority: spec.priority,
                matchers: spec.matchers.clone(),
                action: spec.action,
            },
        );
        self.ops.lock().push(AclOp::Create {
            table: table.to_string(),
            name: spec.name.clone(),
        });
        Ok(oid)
    }

    async fn update_rule(
        &self,
        rule: AclRuleOid,
        matchers: &[AclMatcher],
    ) -> Result<(), BackendError> {
        self.check()?;
        let mut rules = self.rules.lock();
        let installed = rules
            .get_mut(&rule)
            .ok_or_else(|| BackendError::Rejected(format!("no rule {}", rule)))?;
        installed.matchers = matchers.to_vec();
        self.ops.lock().push(AclOp::Update {
            name: installed.name.clone(),
        });
        Ok(())
    }

    async fn delete_rule(&self, rule: AclRuleOid) -> Result<(), BackendError> {
        self.check()?;
        let removed = self
            .rules
            .lock()
            .remove(&rule)
            .ok_or_else(|| BackendError::Rejected(format!("no rule {}", rule)))?;
        self.ops.lock().push(AclOp::Delete { name: removed.name });
        Ok(())
    }
}
