//! PfcWdOrch - the watchdog orchestration agent.

use futures::future::join_all;
use sonic_types::{PortAlias, PortOid, Priority};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::acl::{AclBackend, AclPacketAction, AclRuleManager, AclRuleSnapshot, RuleKey};
use crate::config::{
    fields, parse_pfc_asym, parse_pfc_enable, tables, validate_poll_interval, ConfigEvent,
    Operation, PfcWdOrchConfig,
};
use crate::counters::{CounterBackend, CounterRegistrar};
use crate::detector::StormDetector;
use crate::error::{PfcWdError, Result};
use crate::events::{EventSink, PfcWdAlert, PfcWdStatsSnapshot};
use crate::session::SessionSnapshot;
use crate::state::SessionState;
use crate::tracker::PrioritySessionTracker;
use crate::types::{PfcWdAction, SessionKey, WatchdogParams};

/// Ties the watchdog components to a poll timer and to configuration
/// change notifications.
pub struct PfcWdOrch {
    config: PfcWdOrchConfig,
    registrar: Arc<CounterRegistrar>,
    rules: Arc<AclRuleManager>,
    tracker: PrioritySessionTracker,
    detector: StormDetector,
    events: EventSink,
    poll_interval: watch::Sender<Duration>,
}

impl PfcWdOrch {
    pub fn new(
        config: PfcWdOrchConfig,
        counters: Arc<dyn CounterBackend>,
        acl: Arc<dyn AclBackend>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventSink::new(config.alert_capacity);
        let registrar = Arc::new(CounterRegistrar::new(
            counters,
            config.poll_timeout(),
            config.registration_timeout(),
        ));
        let rules = Arc::new(AclRuleManager::new(
            acl,
            config.acl_table.clone(),
            config.acl_rule_priority,
        ));
        let tracker = PrioritySessionTracker::new(
            registrar.clone(),
            rules.clone(),
            events.clone(),
            config.mitigation_retry,
            config.history_len,
        );
        let (poll_interval, _) = watch::channel(config.poll_interval());

        Ok(Self {
            detector: StormDetector::new(config.pause_assert_percent),
            config,
            registrar,
            rules,
            tracker,
            events,
            poll_interval,
        })
    }

    pub fn config(&self) -> &PfcWdOrchConfig {
        &self.config
    }

    pub fn tracker(&self) -> &PrioritySessionTracker {
        &self.tracker
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<PfcWdAlert> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> PfcWdStatsSnapshot {
        self.events.stats().snapshot()
    }

    // ---- configuration -------------------------------------------------

    pub fn add_port(&self, port: PortAlias, oid: PortOid) -> bool {
        self.tracker.add_port(port, oid)
    }

    #[instrument(skip(self), fields(port = %port))]
    pub async fn remove_port(&self, port: &PortAlias) -> Result<()> {
        self.tracker.remove_port(port).await
    }

    #[instrument(skip(self, priorities), fields(
        port = %port,
        pfc_enable = %Priority::format_list(&priorities),
    ))]
    pub async fn set_pfc_enable(
        &self,
        port: &PortAlias,
        priorities: BTreeSet<Priority>,
    ) -> Result<()> {
        self.tracker.set_pfc_enable(port, priorities).await
    }

    #[instrument(skip(self), fields(port = %port))]
    pub async fn set_pfc_asym(&self, port: &PortAlias, asymmetric: bool) -> Result<()> {
        self.tracker.set_pfc_asym(port, asymmetric).await
    }

    /// Starts (or reconfigures) the watchdog on every PFC priority of a port.
    #[instrument(skip(self, params), fields(
        port = %port,
        action = %params.action,
        detection_ms = params.detection_time.value(),
        restoration_ms = params.restoration_time.value(),
    ))]
    pub async fn start_watchdog(&self, port: &PortAlias, params: WatchdogParams) -> Result<()> {
        self.tracker.start_watchdog(port, params).await
    }

    #[instrument(skip(self), fields(port = %port))]
    pub async fn stop_watchdog(&self, port: &PortAlias) -> Result<()> {
        self.tracker.stop_watchdog(port).await
    }

    /// Changes the poll period of a running [`run`](Self::run) loop.
    pub fn set_poll_interval(&self, ms: u64) -> Result<()> {
        validate_poll_interval(ms)?;
        let period = Duration::from_millis(ms);
        self.poll_interval.send_if_modified(|current| {
            let modified = *current != period;
            *current = period;
            modified
        });
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        *self.poll_interval.borrow()
    }

    /// Applies one CONFIG_DB change.
    pub async fn handle_event(&self, event: &ConfigEvent) -> Result<()> {
        match (event.table.as_str(), event.op) {
            (tables::PFC_WD, op) if event.key == tables::GLOBAL_KEY => match op {
                Operation::Set => match event.get_field(fields::POLL_INTERVAL) {
                    Some(value) => {
                        let ms = value.trim().parse::<u64>().map_err(|_| {
                            PfcWdError::invalid_config(
                                fields::POLL_INTERVAL,
                                format!("{:?} is not a number", value),
                            )
                        })?;
                        self.set_poll_interval(ms)
                    }
                    None => Ok(()),
                },
                Operation::Del => self.set_poll_interval(self.config.poll_interval_ms),
            },
            (tables::PFC_WD, Operation::Set) => {
                let port = parse_port(&event.key)?;
                let params = WatchdogParams::from_fields(event)?;
                self.start_watchdog(&port, params).await
            }
            (tables::PFC_WD, Operation::Del) => self.stop_watchdog(&parse_port(&event.key)?).await,
            (tables::PORT_QOS_MAP, Operation::Set) => match event.get_field(fields::PFC_ENABLE) {
                Some(value) => {
                    let priorities = parse_pfc_enable(value)?;
                    self.set_pfc_enable(&parse_port(&event.key)?, priorities).await
                }
                None => Ok(()),
            },
            (tables::PORT_QOS_MAP, Operation::Del) => {
                self.set_pfc_enable(&parse_port(&event.key)?, BTreeSet::new()).await
            }
            (tables::PORT, Operation::Set) => match event.get_field(fields::PFC_ASYM) {
                Some(value) => {
                    let asymmetric = parse_pfc_asym(value)?;
                    self.set_pfc_asym(&parse_port(&event.key)?, asymmetric).await
                }
                None => Ok(()),
            },
            (tables::PORT, Operation::Del) => {
                self.set_pfc_asym(&parse_port(&event.key)?, false).await
            }
            (table, _) => {
                debug!(table, key = %event.key, "Ignoring unrelated table");
                Ok(())
            }
        }
    }

    // ---- polling -------------------------------------------------------

    /// Runs one poll tick: reads counters, advances every session, retries
    /// stuck mitigations and completes pending destroys.
    ///
    /// Only counter polls are awaited, each under its own deadline.
    /// Registration and ACL work is left to background tasks.
    pub async fn poll_once(&self) {
        let registrations = self.registrar.pollable();
        let polls = registrations.iter().map(|(port, registration)| async move {
            (port.clone(), self.registrar.poll(registration).await)
        });

        let mut samples = HashMap::new();
        for (port, result) in join_all(polls).await {
            match result {
                Ok(sample) => {
                    samples.insert(port, sample);
                }
                Err(e) => {
                    self.events.stats().poll_failed();
                    warn!(port = %port, error = %e, "Counter poll failed, skipping tick");
                }
            }
        }

        self.tracker.evaluate(&self.detector, &samples, Instant::now());
        self.tracker.kick_diverged();
        self.tracker.reap();
    }

    fn ticker(period: Duration) -> Interval {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Polls on the configured period until `cancel` fires, then withdraws
    /// every mitigation and cancels its lane.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut period_rx = self.poll_interval.subscribe();
        let mut period = *period_rx.borrow_and_update();
        let mut interval = Self::ticker(period);
        info!(poll_interval_ms = period.as_millis() as u64, "PFC watchdog started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.poll_once().await,
                changed = period_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    period = *period_rx.borrow_and_update();
                    interval = Self::ticker(period);
                    info!(
                        poll_interval_ms = period.as_millis() as u64,
                        "PFC watchdog poll interval changed"
                    );
                }
            }
        }

        self.shutdown();
        info!("PFC watchdog stopped");
    }

    /// Waits until every mitigation lane processed its latest intent.
    pub async fn settle(&self) {
        self.tracker.settle().await;
    }

    pub fn shutdown(&self) {
        self.tracker.shutdown();
    }

    // ---- observation ---------------------------------------------------

    pub fn session_state(&self, port: &PortAlias, priority: Priority) -> Option<SessionState> {
        self.tracker.session_state(&SessionKey::new(port.clone(), priority))
    }

    pub fn session(&self, port: &PortAlias, priority: Priority) -> Option<SessionSnapshot> {
        self.tracker.session(&SessionKey::new(port.clone(), priority))
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.tracker.snapshots()
    }

    /// Counter names registered for the port, in submission order.
    pub fn registered_counters(&self, port: &PortAlias) -> Option<Vec<String>> {
        self.registrar.registration(port).map(|r| r.counter_names())
    }

    /// Flex-counter key of the port, e.g. `PFC_WD:oid:0x1000000000002`.
    pub fn counter_key(&self, port: &PortAlias) -> Option<String> {
        self.registrar.registration(port).map(|r| r.key())
    }

    /// The installed mitigation rule of a priority and action.
    pub async fn rule(&self, priority: Priority, action: PfcWdAction) -> Option<AclRuleSnapshot> {
        let action = AclPacketAction::for_action(action)?;
        self.rules.rule(RuleKey::new(priority, action)).await
    }

    pub async fn rules(&self) -> Vec<AclRuleSnapshot> {
        self.rules.rules().await
    }
}

fn parse_port(key: &str) -> Result<PortAlias> {
    PortAlias::new(key).map_err(|_| PfcWdError::invalid_port(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclMatcher, AclRuleOid, AclRuleSpec};
    use crate::counters::{CounterValues, PfcCounterId, RegistrationId};
    use crate::error::BackendError;
    use async_trait::async_trait;

    type BackendResult<T> = std::result::Result<T, BackendError>;

    struct Unused;

    #[async_trait]
    impl CounterBackend for Unused {
        async fn register(&self, _: PortOid, _: &[PfcCounterId]) -> BackendResult<RegistrationId> {
            Ok(RegistrationId(1))
        }

        async fn deregister(&self, _: RegistrationId) -> BackendResult<()> {
            Ok(())
        }

        async fn poll(&self, _: RegistrationId) -> BackendResult<CounterValues> {
            Ok(CounterValues::new())
        }
    }

    #[async_trait]
    impl AclBackend for Unused {
        async fn create_rule(&self, _: &str, _: &AclRuleSpec) -> BackendResult<AclRuleOid> {
            Ok(AclRuleOid(1))
        }

        async fn update_rule(&self, _: AclRuleOid, _: &[AclMatcher]) -> BackendResult<()> {
            Ok(())
        }

        async fn delete_rule(&self, _: AclRuleOid) -> BackendResult<()> {
            Ok(())
        }
    }

    fn orch() -> PfcWdOrch {
        PfcWdOrch::new(PfcWdOrchConfig::default(), Arc::new(Unused), Arc::new(Unused)).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = PfcWdOrchConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(PfcWdOrch::new(config, Arc::new(Unused), Arc::new(Unused)).is_err());
    }

    #[tokio::test]
    async fn test_global_poll_interval() {
        let orch = orch();
        let interval = |ms| {
            ConfigEvent::set(tables::PFC_WD, tables::GLOBAL_KEY, [(fields::POLL_INTERVAL, ms)])
        };
        let set = interval("200");
        orch.handle_event(&set).await.unwrap();
        assert_eq!(orch.poll_interval(), Duration::from_millis(200));

        let bad = interval("10");
        assert!(orch.handle_event(&bad).await.is_err());
        assert_eq!(orch.poll_interval(), Duration::from_millis(200));

        orch.handle_event(&ConfigEvent::del(tables::PFC_WD, tables::GLOBAL_KEY))
            .await
            .unwrap();
        assert_eq!(orch.poll_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_unrelated_tables_are_ignored() {
        let orch = orch();
        let event = ConfigEvent::set("BUFFER_PG", "Ethernet0|3-4", [("profile", "lossless")]);
        assert!(orch.handle_event(&event).await.is_ok());
    }

    #[tokio::test]
    async fn test_event_for_unknown_port() {
        let orch = orch();
        let event =
            ConfigEvent::set(tables::PORT_QOS_MAP, "Ethernet4", [(fields::PFC_ENABLE, "3,4")]);
        let err = orch.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, PfcWdError::InvalidPort { .. }));
    }
}
