//! Watchdog ACL rules.
//!
//! Mitigation is expressed as one ACL rule per `(priority, action)` whose
//! `IN_PORTS` matcher lists every port currently dropping that priority.
//!
//! # Key Components
//!
//! - [`RuleKey`]: identifies the shared rule of a priority and action
//! - [`AclRuleSpec`]: what is handed to the backend on creation
//! - [`AclRuleManager`]: membership bookkeeping over an [`AclBackend`]

mod manager;
mod rule;

pub use manager::{AclBackend, AclRuleManager, MembershipChange};
pub use rule::{AclMatcher, AclPacketAction, AclRuleOid, AclRuleSnapshot, AclRuleSpec, RuleKey};
