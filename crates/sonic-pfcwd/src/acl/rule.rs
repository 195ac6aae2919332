//! ACL rule types.

use serde::Serialize;
use sonic_types::{PortAlias, PortOid, Priority};
use std::fmt;

use crate::types::PfcWdAction;

/// Packet action applied by a watchdog rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AclPacketAction {
    /// Drop the packet.
    Drop,
    /// Forward the packet, bypassing the stalled queue's pause.
    Forward,
}

impl AclPacketAction {
    /// The rule action for a watchdog action. `alert` installs nothing.
    pub fn for_action(action: PfcWdAction) -> Option<Self> {
        match action {
            PfcWdAction::Drop => Some(Self::Drop),
            PfcWdAction::Forward => Some(Self::Forward),
            PfcWdAction::Alert => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "DROP",
            Self::Forward => "FORWARD",
        }
    }
}

impl fmt::Display for AclPacketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend object id of an installed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AclRuleOid(pub u64);

impl fmt::Display for AclRuleOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:0x{:x}", self.0)
    }
}

/// Identity of a shared watchdog rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RuleKey {
    pub priority: Priority,
    pub action: AclPacketAction,
}

impl RuleKey {
    pub fn new(priority: Priority, action: AclPacketAction) -> Self {
        Self { priority, action }
    }

    /// Rule name inside the watchdog table, e.g. `PFCWD_TC_3_DROP`.
    pub fn rule_name(&self) -> String {
        format!("PFCWD_TC_{}_{}", self.priority, self.action)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule_name())
    }
}

/// A single match condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AclMatcher {
    /// Traffic class with mask.
    TrafficClass { value: u8, mask: u8 },
    /// Ingress port list, ordered by port alias.
    InPorts(Vec<PortOid>),
}

impl AclMatcher {
    pub fn traffic_class(priority: Priority) -> Self {
        Self::TrafficClass {
            value: priority.as_u8(),
            mask: 0xff,
        }
    }
}

impl fmt::Display for AclMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrafficClass { value, mask } => write!(f, "TC={}&mask:0x{:x}", value, mask),
            Self::InPorts(ports) => {
                let ports: Vec<String> = ports.iter().map(ToString::to_string).collect();
                write!(f, "IN_PORTS={}", ports.join(","))
            }
        }
    }
}

/// Rule definition submitted on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclRuleSpec {
    pub name: String,
    pub priority: u32,
    pub matchers: Vec<AclMatcher>,
    pub action: AclPacketAction,
}

impl AclRuleSpec {
    /// The `IN_PORTS` list of this rule, if any.
    pub fn in_ports(&self) -> Option<&[PortOid]> {
        self.matchers.iter().find_map(|m| match m {
            AclMatcher::InPorts(ports) => Some(ports.as_slice()),
            AclMatcher::TrafficClass { .. } => None,
        })
    }
}

/// Observable state of an installed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AclRuleSnapshot {
    pub key: RuleKey,
    pub rule_id: AclRuleOid,
    pub members: Vec<PortAlias>,
    pub matchers: Vec<AclMatcher>,
    pub action: AclPacketAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_name() {
        let key = RuleKey::new(Priority::new(3).unwrap(), AclPacketAction::Drop);
        assert_eq!(key.rule_name(), "PFCWD_TC_3_DROP");
        let key = RuleKey::new(Priority::new(4).unwrap(), AclPacketAction::Forward);
        assert_eq!(key.to_string(), "PFCWD_TC_4_FORWARD");
    }

    #[test]
    fn test_action_mapping() {
        assert_eq!(
            AclPacketAction::for_action(PfcWdAction::Drop),
            Some(AclPacketAction::Drop)
        );
        assert_eq!(
            AclPacketAction::for_action(PfcWdAction::Forward),
            Some(AclPacketAction::Forward)
        );
        assert_eq!(AclPacketAction::for_action(PfcWdAction::Alert), None);
    }

    #[test]
    fn test_matcher_display() {
        let tc = AclMatcher::traffic_class(Priority::new(3).unwrap());
        assert_eq!(tc.to_string(), "TC=3&mask:0xff");

        let ports = AclMatcher::InPorts(vec![
            PortOid::from_raw(0x1000000000002).unwrap(),
            PortOid::from_raw(0x1000000000003).unwrap(),
        ]);
        assert_eq!(
            ports.to_string(),
            "IN_PORTS=oid:0x1000000000002,oid:0x1000000000003"
        );
    }
}
