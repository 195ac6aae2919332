//! Shared rule membership.

use async_trait::async_trait;
use dashmap::DashMap;
use sonic_types::{PortAlias, PortOid};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::rule::{AclMatcher, AclRuleOid, AclRuleSnapshot, AclRuleSpec, RuleKey};
use crate::error::BackendError;

/// ACL programming backend.
#[async_trait]
pub trait AclBackend: Send + Sync {
    async fn create_rule(&self, table: &str, spec: &AclRuleSpec)
        -> Result<AclRuleOid, BackendError>;

    /// Replaces the rule's matchers.
    async fn update_rule(&self, rule: AclRuleOid, matchers: &[AclMatcher])
        -> Result<(), BackendError>;

    async fn delete_rule(&self, rule: AclRuleOid) -> Result<(), BackendError>;
}

/// What a membership call did to the backend rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Membership already matched; no backend call.
    Unchanged,
    /// The first member created the rule.
    Created,
    /// The port list of an existing rule was rewritten.
    Updated,
    /// The last member left and the rule was deleted.
    Deleted,
}

#[derive(Debug, Default)]
struct RuleSlot {
    rule_id: Option<AclRuleOid>,
    members: BTreeMap<PortAlias, PortOid>,
}

/// Maintains one rule per [`RuleKey`] whose `IN_PORTS` is the member set.
///
/// Each key is guarded by its own async lock, so changes to one rule are
/// applied in order while different rules proceed independently. A slot
/// is only updated after the backend accepted the change.
pub struct AclRuleManager {
    backend: Arc<dyn AclBackend>,
    table: String,
    rule_priority: u32,
    slots: DashMap<RuleKey, Arc<Mutex<RuleSlot>>>,
}

impl AclRuleManager {
    pub fn new(backend: Arc<dyn AclBackend>, table: impl Into<String>, rule_priority: u32) -> Self {
        Self {
            backend,
            table: table.into(),
            rule_priority,
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: RuleKey) -> Arc<Mutex<RuleSlot>> {
        // Clone out so no map shard is held across an await.
        self.slots.entry(key).or_default().clone()
    }

    fn matchers(key: RuleKey, members: &BTreeMap<PortAlias, PortOid>) -> Vec<AclMatcher> {
        vec![
            AclMatcher::traffic_class(key.priority),
            AclMatcher::InPorts(members.values().copied().collect()),
        ]
    }

    /// Adds `port` to the rule, creating the rule for its first member.
    pub async fn add_member(
        &self,
        key: RuleKey,
        port: &PortAlias,
        oid: PortOid,
    ) -> Result<MembershipChange, BackendError> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        if slot.members.contains_key(port) {
            return Ok(MembershipChange::Unchanged);
        }

        let mut members = slot.members.clone();
        members.insert(port.clone(), oid);
        let matchers = Self::matchers(key, &members);

        let change = match slot.rule_id {
            None => {
                let spec = AclRuleSpec {
                    name: key.rule_name(),
                    priority: self.rule_priority,
                    matchers,
                    action: key.action,
                };
                let rule_id = self.backend.create_rule(&self.table, &spec).await?;
                info!(
                    table = %self.table,
                    rule = %spec.name,
                    rule_id = %rule_id,
                    port = %port,
                    "Created PFC watchdog ACL rule"
                );
                slot.rule_id = Some(rule_id);
                MembershipChange::Created
            }
            Some(rule_id) => {
                self.backend.update_rule(rule_id, &matchers).await?;
                debug!(rule = %key, port = %port, members = members.len(), "Added rule member");
                MembershipChange::Updated
            }
        };

        slot.members = members;
        Ok(change)
    }

    /// Removes `port` from the rule, deleting the rule with its last member.
    pub async fn remove_member(
        &self,
        key: RuleKey,
        port: &PortAlias,
    ) -> Result<MembershipChange, BackendError> {
        let slot = self.slot(key);
        let mut slot = slot.lock().await;
        if !slot.members.contains_key(port) {
            return Ok(MembershipChange::Unchanged);
        }

        let mut members = slot.members.clone();
        members.remove(port);

        let Some(rule_id) = slot.rule_id else {
            // Members without a rule cannot be produced by add_member.
            warn!(rule = %key, port = %port, "Rule member recorded without a rule");
            slot.members = members;
            return Ok(MembershipChange::Unchanged);
        };

        let change = if members.is_empty() {
            self.backend.delete_rule(rule_id).await?;
            info!(
                table = %self.table,
                rule = %key,
                rule_id = %rule_id,
                "Deleted PFC watchdog ACL rule"
            );
            slot.rule_id = None;
            MembershipChange::Deleted
        } else {
            self.backend
                .update_rule(rule_id, &Self::matchers(key, &members))
                .await?;
            debug!(rule = %key, port = %port, members = members.len(), "Removed rule member");
            MembershipChange::Updated
        };

        slot.members = members;
        Ok(change)
    }

    /// The installed rule for `key`, if any.
    pub async fn rule(&self, key: RuleKey) -> Option<AclRuleSnapshot> {
        let slot = self.slots.get(&key).map(|s| s.clone())?;
        let slot = slot.lock().await;
        let rule_id = slot.rule_id?;
        Some(AclRuleSnapshot {
            key,
            rule_id,
            members: slot.members.keys().cloned().collect(),
            matchers: Self::matchers(key, &slot.members),
            action: key.action,
        })
    }

    /// Every installed rule, ordered by key.
    pub async fn rules(&self) -> Vec<AclRuleSnapshot> {
        let mut keys: Vec<RuleKey> = self.slots.iter().map(|s| *s.key()).collect();
        keys.sort();
        let mut rules = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(rule) = self.rule(key).await {
                rules.push(rule);
            }
        }
        rules
    }
}
