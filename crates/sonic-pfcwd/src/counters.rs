//! PFC watchdog counter registration.
//!
//! Every port with at least one watchdog session gets exactly one
//! registration in the `PFC_WD` flex-counter group. The registration always
//! carries the full set of sixteen per-priority pause counters, independent
//! of which priorities are PFC-enabled and of asymmetric PFC mode, so that a
//! priority can be monitored without re-registering when it is toggled.

use async_trait::async_trait;
use dashmap::DashMap;
use sonic_types::{PortAlias, PortOid, Priority, PFC_PRIORITY_COUNT};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BackendError, PfcWdError, Result};

/// Flex-counter group the watchdog registers its port counters in.
pub const PFC_WD_FLEX_COUNTER_GROUP: &str = "PFC_WD";

/// Kind of per-priority PFC counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PfcCounterKind {
    /// Cumulative time the priority was paused by the peer, in microseconds.
    RxPauseDuration,
    /// Cumulative number of PFC pause frames received.
    RxPackets,
}

/// A single SAI port statistic polled by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PfcCounterId {
    pub kind: PfcCounterKind,
    pub priority: Priority,
}

impl PfcCounterId {
    pub fn new(kind: PfcCounterKind, priority: Priority) -> Self {
        Self { kind, priority }
    }

    pub fn pause_duration(priority: Priority) -> Self {
        Self::new(PfcCounterKind::RxPauseDuration, priority)
    }

    pub fn pause_packets(priority: Priority) -> Self {
        Self::new(PfcCounterKind::RxPackets, priority)
    }

    /// Returns the SAI stat name, e.g. `SAI_PORT_STAT_PFC_3_RX_PKTS`.
    pub fn sai_name(&self) -> String {
        match self.kind {
            PfcCounterKind::RxPauseDuration => {
                format!("SAI_PORT_STAT_PFC_{}_RX_PAUSE_DURATION_US", self.priority)
            }
            PfcCounterKind::RxPackets => format!("SAI_PORT_STAT_PFC_{}_RX_PKTS", self.priority),
        }
    }
}

impl fmt::Display for PfcCounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sai_name())
    }
}

/// The counter list submitted for every watchdog port.
///
/// Eight pause durations (priorities 0-7) followed by eight pause packet
/// counters.
pub fn pfcwd_port_counters() -> Vec<PfcCounterId> {
    Priority::all()
        .map(PfcCounterId::pause_duration)
        .chain(Priority::all().map(PfcCounterId::pause_packets))
        .collect()
}

/// Flex-counter table key for a port, e.g. `PFC_WD:oid:0x1000000000002`.
pub fn flex_counter_key(port: PortOid) -> String {
    format!("{}:{}", PFC_WD_FLEX_COUNTER_GROUP, port)
}

/// Backend handle for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

/// Raw values returned by a poll.
pub type CounterValues = HashMap<PfcCounterId, u64>;

/// Counter-collection backend.
///
/// The watchdog is the sole writer of its registrations' counter lists.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    async fn register(
        &self,
        port: PortOid,
        counters: &[PfcCounterId],
    ) -> std::result::Result<RegistrationId, BackendError>;

    async fn deregister(
        &self,
        registration: RegistrationId,
    ) -> std::result::Result<(), BackendError>;

    async fn poll(
        &self,
        registration: RegistrationId,
    ) -> std::result::Result<CounterValues, BackendError>;
}

/// Pause counters of one priority at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriorityCounters {
    pub pause_duration_us: u64,
    pub pause_packets: u64,
}

/// Poll result arranged by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSample {
    priorities: [Option<PriorityCounters>; PFC_PRIORITY_COUNT],
}

impl CounterSample {
    /// Arranges raw values by priority.
    ///
    /// A priority is present only when both of its counters were returned.
    pub fn from_values(values: &CounterValues) -> Self {
        let mut sample = Self::default();
        for priority in Priority::all() {
            let duration = values.get(&PfcCounterId::pause_duration(priority));
            let packets = values.get(&PfcCounterId::pause_packets(priority));
            if let (Some(&pause_duration_us), Some(&pause_packets)) = (duration, packets) {
                sample.priorities[priority.index()] = Some(PriorityCounters {
                    pause_duration_us,
                    pause_packets,
                });
            }
        }
        sample
    }

    pub fn priority(&self, priority: Priority) -> Option<PriorityCounters> {
        self.priorities.get(priority.index()).copied().flatten()
    }
}

/// A port's live registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRegistration {
    pub id: RegistrationId,
    pub port_oid: PortOid,
    pub counters: Vec<PfcCounterId>,
}

impl CounterRegistration {
    /// Flex-counter key of this registration.
    pub fn key(&self) -> String {
        flex_counter_key(self.port_oid)
    }

    /// Counter names in submission order.
    pub fn counter_names(&self) -> Vec<String> {
        self.counters.iter().map(PfcCounterId::sai_name).collect()
    }
}

/// Registration intent of one port.
#[derive(Default)]
struct PortCounters {
    /// OID the port should be registered under, `None` for no registration.
    desired: parking_lot::Mutex<Option<PortOid>>,
    // Serializes backend calls for this port only.
    sync: Arc<Mutex<()>>,
}

/// Registers and polls the watchdog counters of each port.
///
/// Callers record which OID a port should be registered under. Backend
/// calls then bring the live registration in line under a per-port lock
/// and a deadline, so a slow port never holds up another.
pub struct CounterRegistrar {
    backend: Arc<dyn CounterBackend>,
    registrations: DashMap<PortAlias, CounterRegistration>,
    ports: DashMap<PortAlias, Arc<PortCounters>>,
    poll_timeout: Duration,
    call_timeout: Duration,
}

impl CounterRegistrar {
    pub fn new(
        backend: Arc<dyn CounterBackend>,
        poll_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            registrations: DashMap::new(),
            ports: DashMap::new(),
            poll_timeout,
            call_timeout,
        }
    }

    /// Records whether, and under which OID, the port should be registered.
    ///
    /// Nothing is sent to the backend until the port is synced.
    pub fn set_desired(&self, port: &PortAlias, oid: Option<PortOid>) {
        *self.ports.entry(port.clone()).or_default().desired.lock() = oid;
    }

    fn desired(&self, port: &PortAlias) -> Option<PortOid> {
        self.ports.get(port).and_then(|p| *p.desired.lock())
    }

    /// True when the live registration matches the recorded intent.
    pub fn in_sync(&self, port: &PortAlias) -> bool {
        self.desired(port) == self.registrations.get(port).map(|r| r.port_oid)
    }

    /// Brings the port's registration in line with its intent.
    ///
    /// Registering an already registered port is a no-op. A port whose OID
    /// changed is deregistered and registered again.
    pub async fn sync_port(&self, port: &PortAlias) -> Result<()> {
        let Some(state) = self.ports.get(port).map(|p| p.value().clone()) else {
            return Ok(());
        };
        let _guard = state.sync.lock().await;
        self.sync_locked(port, &state).await
    }

    async fn sync_locked(&self, port: &PortAlias, state: &PortCounters) -> Result<()> {
        loop {
            let desired = *state.desired.lock();
            let live = self.registrations.get(port).map(|r| (r.id, r.port_oid));
            match (desired, live) {
                (None, None) => return Ok(()),
                (Some(oid), Some((_, current))) if oid == current => return Ok(()),
                (_, Some((id, current))) => self.deregister(port, id, current).await?,
                (Some(oid), None) => self.register(port, oid).await?,
            }
        }
    }

    /// Syncs every port whose registration differs from its intent, in the
    /// background. Ports with a sync already running are left alone.
    pub fn retry_pending(self: &Arc<Self>) {
        for (port, state) in self.pending() {
            let Ok(guard) = state.sync.clone().try_lock_owned() else {
                debug!(port = %port, "Counter registration still in progress");
                continue;
            };
            let registrar = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = registrar.sync_locked(&port, &state).await {
                    warn!(port = %port, error = %e, "Counter registration retry failed");
                }
            });
        }
    }

    /// Syncs every out-of-sync port and waits for the result.
    pub async fn sync_all(&self) {
        for (port, _) in self.pending() {
            if let Err(e) = self.sync_port(&port).await {
                warn!(port = %port, error = %e, "Counter registration failed, will retry");
            }
        }
    }

    fn pending(&self) -> Vec<(PortAlias, Arc<PortCounters>)> {
        let ports: Vec<(PortAlias, Arc<PortCounters>)> = self
            .ports
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        ports.into_iter().filter(|(port, _)| !self.in_sync(port)).collect()
    }

    async fn call<T>(
        &self,
        operation: &str,
        limit: Duration,
        call: impl Future<Output = std::result::Result<T, BackendError>>,
    ) -> Result<T> {
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| PfcWdError::backend(operation, BackendError::Timeout(limit)))?
            .map_err(|e| PfcWdError::backend(operation, e))
    }

    async fn register(&self, port: &PortAlias, oid: PortOid) -> Result<()> {
        let counters = pfcwd_port_counters();
        let id = self
            .call("register_counters", self.call_timeout, self.backend.register(oid, &counters))
            .await?;
        let registration = CounterRegistration {
            id,
            port_oid: oid,
            counters,
        };
        info!(
            port = %port,
            key = %registration.key(),
            counters = registration.counters.len(),
            "Registered PFC watchdog counters"
        );
        self.registrations.insert(port.clone(), registration);
        Ok(())
    }

    async fn deregister(&self, port: &PortAlias, id: RegistrationId, oid: PortOid) -> Result<()> {
        self.call("deregister_counters", self.call_timeout, self.backend.deregister(id))
            .await?;
        self.registrations.remove(port);
        info!(port = %port, key = %flex_counter_key(oid), "Deregistered PFC watchdog counters");
        Ok(())
    }

    pub fn registration(&self, port: &PortAlias) -> Option<CounterRegistration> {
        self.registrations.get(port).map(|r| r.clone())
    }

    /// Live registrations that match their port's intent.
    ///
    /// A registration waiting to be replaced or removed is not polled.
    pub fn pollable(&self) -> Vec<(PortAlias, CounterRegistration)> {
        let live: Vec<(PortAlias, CounterRegistration)> = self
            .registrations
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        live.into_iter()
            .filter(|(port, r)| self.desired(port) == Some(r.port_oid))
            .collect()
    }

    /// Reads the current counter values of a registration.
    pub async fn poll(&self, registration: &CounterRegistration) -> Result<CounterSample> {
        let values = self
            .call("poll_counters", self.poll_timeout, self.backend.poll(registration.id))
            .await?;
        debug!(key = %registration.key(), values = values.len(), "Polled PFC counters");
        Ok(CounterSample::from_values(&values))
    }
}
