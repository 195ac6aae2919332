//! Mitigation lanes.
//!
//! Every session with a rule-installing action owns a lane: a task that
//! drives the session's rule membership towards the desired value set by
//! state transitions. Transitions only record intent and return, so the
//! poll loop never waits on ACL programming.
//!
//! Intent carries a generation number. The lane re-reads it between
//! attempts and drops work that a newer transition has superseded.

use parking_lot::Mutex;
use sonic_types::PortOid;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acl::{AclRuleManager, MembershipChange, RuleKey};
use crate::config::BackoffPolicy;
use crate::error::{BackendError, PfcWdError};
use crate::events::{AlertKind, EventSink};
use crate::session::WatchdogSession;
use crate::state::{Effect, SessionEvent, Transition};
use crate::types::SessionKey;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Desired {
    installed: bool,
    generation: u64,
}

/// What a lane has achieved so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LaneStatus {
    /// The port is currently a member of the session's rule.
    pub installed: bool,
    /// A backend call or retry is in progress.
    pub busy: bool,
    /// Latest intent generation the lane has finished with.
    pub handled: u64,
}

/// Handle to a session's mitigation task.
pub(crate) struct MitigationLane {
    desired: Arc<watch::Sender<Desired>>,
    status: watch::Receiver<LaneStatus>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything a lane task needs.
pub(crate) struct LaneContext {
    pub key: SessionKey,
    pub rule: RuleKey,
    pub port_oid: PortOid,
    pub rules: Arc<AclRuleManager>,
    pub session: Arc<Mutex<WatchdogSession>>,
    pub retry: BackoffPolicy,
    pub events: EventSink,
}

impl MitigationLane {
    /// Spawns the lane task on the current runtime.
    pub(crate) fn spawn(ctx: LaneContext) -> Self {
        let (desired_tx, desired_rx) = watch::channel(Desired::default());
        let desired = Arc::new(desired_tx);
        let (status_tx, status) = watch::channel(LaneStatus::default());
        let kick = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = LaneWorker {
            ctx,
            desired: desired.clone(),
            desired_rx,
            status: status_tx,
            kick: kick.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            desired,
            status,
            kick,
            cancel,
            handle,
        }
    }

    /// Records new intent. Never blocks.
    pub(crate) fn request(&self, installed: bool) {
        self.desired.send_modify(|d| {
            d.installed = installed;
            d.generation += 1;
        });
    }

    /// Wakes a parked lane so it retries.
    pub(crate) fn kick(&self) {
        self.kick.notify_one();
    }

    pub(crate) fn status(&self) -> LaneStatus {
        *self.status.borrow()
    }

    pub(crate) fn desired_installed(&self) -> bool {
        self.desired.borrow().installed
    }

    /// Holds no membership and wants none.
    pub(crate) fn is_clear(&self) -> bool {
        let status = self.status();
        !status.busy && !status.installed && !self.desired_installed()
    }

    /// Idle while membership differs from intent.
    pub(crate) fn diverged(&self) -> bool {
        let status = self.status();
        !status.busy && status.installed != self.desired_installed()
    }

    /// Waits until the lane has processed its latest intent.
    pub(crate) async fn settled(&self) {
        let mut status = self.status.clone();
        loop {
            let target = self.desired.borrow().generation;
            {
                let current = status.borrow_and_update();
                if !current.busy && current.handled >= target {
                    return;
                }
            }
            if self.handle.is_finished() {
                return;
            }
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MitigationLane {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Done(MembershipChange),
    Superseded,
    Cancelled,
    Exhausted { attempts: u32, error: BackendError },
}

struct LaneWorker {
    ctx: LaneContext,
    desired: Arc<watch::Sender<Desired>>,
    desired_rx: watch::Receiver<Desired>,
    status: watch::Sender<LaneStatus>,
    kick: Arc<Notify>,
    cancel: CancellationToken,
}

impl LaneWorker {
    async fn run(mut self) {
        loop {
            let target = *self.desired_rx.borrow_and_update();
            let installed = self.status.borrow().installed;

            if target.installed == installed {
                self.status.send_modify(|s| {
                    s.busy = false;
                    s.handled = target.generation;
                });
                if !self.park().await {
                    break;
                }
                continue;
            }

            self.status.send_modify(|s| s.busy = true);
            match self.reconcile(target).await {
                Outcome::Done(change) => {
                    debug!(
                        port = %self.ctx.key.port,
                        priority = %self.ctx.key.priority,
                        rule = %self.ctx.rule,
                        installed = target.installed,
                        change = ?change,
                        "Mitigation applied"
                    );
                    self.status.send_modify(|s| s.installed = target.installed);
                }
                Outcome::Superseded => {}
                Outcome::Cancelled => break,
                Outcome::Exhausted { attempts, error } => {
                    self.on_exhausted(target, attempts, error);
                    if !target.installed {
                        // Removal keeps failing: wait for a poll tick to kick us.
                        self.status.send_modify(|s| {
                            s.busy = false;
                            s.handled = target.generation;
                        });
                        if !self.park().await {
                            break;
                        }
                    }
                }
            }
        }
        self.release().await;
    }

    /// Waits for new intent or a kick. Returns false on cancellation.
    async fn park(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            changed = self.desired_rx.changed() => changed.is_ok(),
            _ = self.kick.notified() => true,
        }
    }

    async fn apply(&self, install: bool) -> Result<MembershipChange, BackendError> {
        let ctx = &self.ctx;
        if install {
            ctx.rules.add_member(ctx.rule, &ctx.key.port, ctx.port_oid).await
        } else {
            ctx.rules.remove_member(ctx.rule, &ctx.key.port).await
        }
    }

    async fn reconcile(&self, target: Desired) -> Outcome {
        let retry = self.ctx.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            // A backend call is never abandoned halfway.
            let error = match self.apply(target.installed).await {
                Ok(change) => return Outcome::Done(change),
                Err(e) => e,
            };
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            warn!(
                port = %self.ctx.key.port,
                priority = %self.ctx.key.priority,
                installing = target.installed,
                attempt,
                error = %error,
                "Mitigation attempt failed"
            );
            if attempt >= retry.max_attempts {
                return Outcome::Exhausted {
                    attempts: attempt,
                    error,
                };
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(retry.delay_for(attempt)) => {}
            }
            if self.desired_rx.borrow().generation != target.generation {
                return Outcome::Superseded;
            }
        }
    }

    fn on_exhausted(&self, target: Desired, attempts: u32, source: BackendError) {
        let ctx = &self.ctx;
        let mut session = ctx.session.lock();
        let state = session.state();
        let err = PfcWdError::RetryExhausted {
            key: ctx.key.clone(),
            state,
            attempts,
            source,
        };
        error!(
            port = %ctx.key.port,
            priority = %ctx.key.priority,
            state = %state,
            installing = target.installed,
            error = %err,
            "Mitigation retries exhausted"
        );
        ctx.events.stats().mitigation_failed();
        ctx.events.alert(
            &ctx.key,
            state,
            AlertKind::MitigationFailed {
                installing: target.installed,
                attempts,
                error: err.to_string(),
            },
        );

        let current = self.desired_rx.borrow().generation;
        if target.installed && current == target.generation {
            // The rule could not be installed: stop claiming a mitigation.
            let transitions = session.force_normal(SessionEvent::MitigationFailed);
            self.desired.send_modify(|d| {
                d.installed = false;
                d.generation += 1;
            });
            for t in &transitions {
                apply_transition(&ctx.key, t, None, &ctx.events);
            }
        }
    }

    /// Best-effort removal when the lane is cancelled while installed.
    async fn release(&self) {
        if !self.status.borrow().installed {
            return;
        }
        let ctx = &self.ctx;
        match ctx.rules.remove_member(ctx.rule, &ctx.key.port).await {
            Ok(_) => {
                self.status.send_modify(|s| s.installed = false);
                info!(
                    port = %ctx.key.port,
                    priority = %ctx.key.priority,
                    "Released mitigation on shutdown"
                );
            }
            Err(e) => warn!(
                port = %ctx.key.port,
                priority = %ctx.key.priority,
                error = %e,
                "Failed to release mitigation on shutdown"
            ),
        }
    }
}

/// Carries out a transition's effects.
///
/// Mitigation effects only update the lane's intent. Sessions without a
/// lane (the `alert` action) get alerts only.
pub(crate) fn apply_transition(
    key: &SessionKey,
    transition: &Transition,
    lane: Option<&MitigationLane>,
    events: &EventSink,
) {
    info!(
        port = %key.port,
        priority = %key.priority,
        from = %transition.from,
        to = %transition.to,
        event = ?transition.event,
        "PFC watchdog state change"
    );
    for effect in &transition.effects {
        match effect {
            Effect::InstallMitigation => {
                if let Some(lane) = lane {
                    lane.request(true);
                }
            }
            Effect::RemoveMitigation => {
                if let Some(lane) = lane {
                    lane.request(false);
                }
            }
            Effect::AlertStormDetected => {
                events.stats().storm_detected();
                warn!(port = %key.port, priority = %key.priority, "PFC storm detected");
                events.alert(key, transition.to, AlertKind::StormDetected);
            }
            Effect::AlertStormRestored => {
                events.stats().storm_restored();
                info!(port = %key.port, priority = %key.priority, "PFC storm restored");
                events.alert(key, transition.to, AlertKind::StormRestored);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclBackend, AclMatcher, AclPacketAction, AclRuleOid, AclRuleSpec};
    use crate::state::SessionState;
    use crate::types::{PfcWdAction, WatchdogParams};
    use async_trait::async_trait;
    use sonic_types::{PortAlias, Priority};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls.
    #[derive(Default)]
    struct FlakyBackend {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn call(&self) -> Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                Err(BackendError::Unreachable("syncd".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl AclBackend for FlakyBackend {
        async fn create_rule(&self, _: &str, _: &AclRuleSpec) -> Result<AclRuleOid, BackendError> {
            self.call().map(|_| AclRuleOid(0x9000))
        }

        async fn update_rule(&self, _: AclRuleOid, _: &[AclMatcher]) -> Result<(), BackendError> {
            self.call()
        }

        async fn delete_rule(&self, _: AclRuleOid) -> Result<(), BackendError> {
            self.call()
        }
    }

    struct Fixture {
        lane: MitigationLane,
        session: Arc<Mutex<WatchdogSession>>,
        backend: Arc<FlakyBackend>,
        events: EventSink,
    }

    fn fixture(failures: u32) -> Fixture {
        let backend = Arc::new(FlakyBackend::default());
        backend.failures.store(failures, Ordering::SeqCst);
        let rules = Arc::new(AclRuleManager::new(backend.clone(), "PFCWD_INGRESS", 999));
        let key = SessionKey::new(PortAlias::new("Ethernet0").unwrap(), Priority::new(3).unwrap());
        let port_oid = PortOid::from_raw(0x1000000000002).unwrap();
        let params = WatchdogParams::from_millis(PfcWdAction::Drop, 400, 400).unwrap();
        let session = Arc::new(Mutex::new(WatchdogSession::new(key.clone(), port_oid, params, 8)));
        let events = EventSink::new(16);
        let lane = MitigationLane::spawn(LaneContext {
            key,
            rule: RuleKey::new(Priority::new(3).unwrap(), AclPacketAction::Drop),
            port_oid,
            rules,
            session: session.clone(),
            retry: BackoffPolicy {
                initial_ms: 10,
                max_ms: 40,
                max_attempts: 3,
            },
            events: events.clone(),
        });
        Fixture {
            lane,
            session,
            backend,
            events,
        }
    }

    fn enter_dropping(f: &Fixture) {
        let mut session = f.session.lock();
        let t = session.apply(SessionEvent::StormDetected).unwrap();
        apply_transition(session.key(), &t, Some(&f.lane), &f.events);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_and_remove() {
        let f = fixture(0);
        enter_dropping(&f);
        f.lane.settled().await;
        assert!(f.lane.status().installed);

        f.lane.request(false);
        f.lane.settled().await;
        assert!(f.lane.is_clear());
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let f = fixture(2);
        enter_dropping(&f);
        f.lane.settled().await;
        assert!(f.lane.status().installed);
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.session.lock().state(), SessionState::Dropping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_exhaustion_forces_normal() {
        let f = fixture(3);
        let mut alerts = f.events.subscribe();
        enter_dropping(&f);
        f.lane.settled().await;

        assert!(f.lane.is_clear());
        let session = f.session.lock();
        assert_eq!(session.state(), SessionState::Normal);
        let path: Vec<_> = session.history().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            path,
            vec![
                (SessionState::Normal, SessionState::Dropping),
                (SessionState::Dropping, SessionState::Restoring),
                (SessionState::Restoring, SessionState::Normal),
            ]
        );
        drop(session);

        assert_eq!(alerts.try_recv().unwrap().kind, AlertKind::StormDetected);
        match alerts.try_recv().unwrap().kind {
            AlertKind::MitigationFailed {
                installing,
                attempts,
                ..
            } => {
                assert!(installing);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected alert {:?}", other),
        }
        assert_eq!(f.events.stats().snapshot().mitigation_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_exhaustion_parks_until_kicked() {
        let f = fixture(0);
        enter_dropping(&f);
        f.lane.settled().await;

        f.backend.failures.store(3, Ordering::SeqCst);
        f.lane.request(false);
        f.lane.settled().await;
        assert!(f.lane.status().installed);
        assert!(f.lane.diverged());

        f.lane.kick();
        while !f.lane.is_clear() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(f.lane.is_clear());
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_intent() {
        let f = fixture(1);
        enter_dropping(&f);
        while f.backend.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        // Withdrawn before the retry fires.
        f.lane.request(false);
        f.lane.settled().await;
        assert!(f.lane.is_clear());
        assert_eq!(f.backend.calls.load(Ordering::SeqCst), 1);
    }
}
