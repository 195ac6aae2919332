//! PfcWdOrch - Priority Flow Control Watchdog orchestration for SONiC.
//!
//! The watchdog detects lossless queues that are stalled by a PFC storm
//! (a peer that keeps pausing a priority) and installs temporary ACL rules
//! that drop the affected traffic class on the ingress ports, removing
//! them again once the pause condition clears.
//!
//! # Architecture
//!
//! ```text
//! CONFIG_DB: PFC_WD / PORT_QOS_MAP / PORT
//!        │
//!        ▼
//!   PfcWdOrch ──> PrioritySessionTracker ──> CounterRegistrar ──> FLEX_COUNTER
//!        │               │ (port, priority) sessions
//!        │ poll timer    ▼
//!        └──────> StormDetector ──> SessionState transitions
//!                                        │
//!                                        ▼
//!                             MitigationLane ──> AclRuleManager ──> SAI ACL
//! ```
//!
//! # Key Components
//!
//! - [`PfcWdOrch`]: timer loop, configuration events, observable state
//! - [`PrioritySessionTracker`]: owns the `(port, priority)` session table
//! - [`CounterRegistrar`]: registers the fixed 16 PFC counters per port
//! - [`StormDetector`]: classifies counter deltas into state machine events
//! - [`SessionState`] / [`transition`]: the per-session state machine
//! - [`AclRuleManager`]: one drop rule per `(priority, action)`

pub mod acl;
mod config;
mod counters;
mod detector;
mod error;
mod events;
mod mitigation;
mod orch;
mod session;
mod state;
mod tracker;
mod types;

pub use acl::{
    AclBackend, AclMatcher, AclPacketAction, AclRuleManager, AclRuleOid, AclRuleSnapshot,
    AclRuleSpec, MembershipChange, RuleKey,
};
pub use config::{fields, tables, BackoffPolicy, ConfigEvent, Operation, PfcWdOrchConfig};
pub use counters::{
    flex_counter_key, pfcwd_port_counters, CounterBackend, CounterRegistrar, CounterRegistration,
    CounterSample, CounterValues, PfcCounterId, PfcCounterKind, PriorityCounters, RegistrationId,
    PFC_WD_FLEX_COUNTER_GROUP,
};
pub use detector::{PauseObservation, StormDetector};
pub use error::{BackendError, PfcWdError, Result};
pub use events::{AlertKind, PfcWdAlert, PfcWdStats, PfcWdStatsSnapshot};
pub use orch::PfcWdOrch;
pub use session::{SessionSnapshot, TransitionRecord, WatchdogSession};
pub use state::{transition, Effect, SessionEvent, SessionState, Transition};
pub use tracker::PrioritySessionTracker;
pub use types::{DetectionTime, PfcWdAction, RestorationTime, SessionKey, WatchdogParams};
