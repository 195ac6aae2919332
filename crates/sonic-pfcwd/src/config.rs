//! Watchdog configuration.
//!
//! Two kinds of configuration reach the watchdog: the static
//! [`PfcWdOrchConfig`] (loaded once, optionally from a TOML file) and
//! CONFIG_DB change notifications modelled as [`ConfigEvent`]s.

use serde::{Deserialize, Serialize};
use sonic_types::Priority;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{PfcWdError, Result};
use crate::types::{PfcWdAction, WatchdogParams};

/// Allowed poll interval range in milliseconds.
pub const POLL_INTERVAL_RANGE_MS: (u64, u64) = (50, 60_000);

/// CONFIG_DB table names.
pub mod tables {
    pub const PFC_WD: &str = "PFC_WD";
    pub const PORT_QOS_MAP: &str = "PORT_QOS_MAP";
    pub const PORT: &str = "PORT";
    /// Key of the global entry of `PFC_WD`.
    pub const GLOBAL_KEY: &str = "GLOBAL";
}

/// CONFIG_DB field names.
pub mod fields {
    pub const ACTION: &str = "action";
    pub const DETECTION_TIME: &str = "detection_time";
    pub const RESTORATION_TIME: &str = "restoration_time";
    pub const POLL_INTERVAL: &str = "POLL_INTERVAL";
    pub const PFC_ENABLE: &str = "pfc_enable";
    pub const PFC_ASYM: &str = "pfc_asym";
}

/// Retry schedule for mitigation backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt.
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,

    /// Upper bound on a single delay.
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,

    /// Attempts before giving up, including the first.
    #[serde(default = "default_backoff_attempts")]
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.initial_ms.saturating_mul(1u64 << shift).min(self.max_ms);
        Duration::from_millis(delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            max_attempts: default_backoff_attempts(),
        }
    }
}

/// Static configuration of the watchdog orchestration agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PfcWdOrchConfig {
    /// Counter poll period.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Deadline for a single counter poll.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Deadline for a single counter registration or deregistration.
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_ms: u64,

    /// ACL table holding the watchdog rules.
    #[serde(default = "default_acl_table")]
    pub acl_table: String,

    /// Priority of every watchdog rule within the table.
    #[serde(default = "default_acl_rule_priority")]
    pub acl_rule_priority: u32,

    /// Share of a poll interval (percent) the pause must cover to count
    /// as asserted.
    #[serde(default = "default_pause_assert_percent")]
    pub pause_assert_percent: u8,

    /// Transitions kept per session.
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Alert broadcast buffer.
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,

    #[serde(default)]
    pub mitigation_retry: BackoffPolicy,
}

fn default_poll_interval() -> u64 {
    100
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_registration_timeout() -> u64 {
    1000
}

fn default_acl_table() -> String {
    "PFCWD_INGRESS".to_string()
}

fn default_acl_rule_priority() -> u32 {
    999
}

fn default_pause_assert_percent() -> u8 {
    90
}

fn default_history_len() -> usize {
    32
}

fn default_alert_capacity() -> usize {
    256
}

fn default_backoff_initial() -> u64 {
    50
}

fn default_backoff_max() -> u64 {
    2000
}

fn default_backoff_attempts() -> u32 {
    5
}

impl Default for PfcWdOrchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            poll_timeout_ms: default_poll_timeout(),
            registration_timeout_ms: default_registration_timeout(),
            acl_table: default_acl_table(),
            acl_rule_priority: default_acl_rule_priority(),
            pause_assert_percent: default_pause_assert_percent(),
            history_len: default_history_len(),
            alert_capacity: default_alert_capacity(),
            mitigation_retry: BackoffPolicy::default(),
        }
    }
}

impl PfcWdOrchConfig {
    /// Loads and validates a TOML configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            PfcWdError::invalid_config("config_file", format!("{}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| PfcWdError::invalid_config("config_file", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_poll_interval(self.poll_interval_ms)?;
        if self.poll_timeout_ms == 0 {
            return Err(PfcWdError::invalid_config("poll_timeout_ms", "must be non-zero"));
        }
        if self.registration_timeout_ms == 0 {
            return Err(PfcWdError::invalid_config(
                "registration_timeout_ms",
                "must be non-zero",
            ));
        }
        if self.acl_table.is_empty() {
            return Err(PfcWdError::invalid_config("acl_table", "must not be empty"));
        }
        if self.pause_assert_percent == 0 || self.pause_assert_percent > 100 {
            return Err(PfcWdError::invalid_config(
                "pause_assert_percent",
                format!("{} is not in 1..=100", self.pause_assert_percent),
            ));
        }
        if self.alert_capacity == 0 {
            return Err(PfcWdError::invalid_config("alert_capacity", "must be non-zero"));
        }
        let retry = &self.mitigation_retry;
        if retry.max_attempts == 0 {
            return Err(PfcWdError::invalid_config(
                "mitigation_retry.max_attempts",
                "must be at least 1",
            ));
        }
        if retry.initial_ms > retry.max_ms {
            return Err(PfcWdError::invalid_config(
                "mitigation_retry",
                format!("initial_ms {} exceeds max_ms {}", retry.initial_ms, retry.max_ms),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

/// Checks a poll interval against the CLI range.
pub fn validate_poll_interval(ms: u64) -> Result<()> {
    let (min, max) = POLL_INTERVAL_RANGE_MS;
    if (min..=max).contains(&ms) {
        Ok(())
    } else {
        Err(PfcWdError::invalid_config(
            fields::POLL_INTERVAL,
            format!("{} ms is not in {}..={}", ms, min, max),
        ))
    }
}

/// PFC configuration of one port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPfcConfig {
    /// `PORT_QOS_MAP|<port>` `pfc_enable`.
    pub pfc_enable: BTreeSet<Priority>,
    /// `PORT|<port>` `pfc_asym`.
    pub asymmetric: bool,
}

impl PortPfcConfig {
    /// Priorities on which received pause frames are honoured.
    ///
    /// Asymmetric ports honour pause on every priority.
    pub fn rx_priorities(&self) -> BTreeSet<Priority> {
        if self.asymmetric {
            Priority::all().collect()
        } else {
            self.pfc_enable.clone()
        }
    }
}

/// Parses a `pfc_asym` value.
pub fn parse_pfc_asym(value: &str) -> Result<bool> {
    match value {
        "on" => Ok(true),
        "off" => Ok(false),
        other => Err(PfcWdError::invalid_config(
            fields::PFC_ASYM,
            format!("{:?} is not on|off", other),
        )),
    }
}

/// Parses a `pfc_enable` list such as `3,4`.
pub fn parse_pfc_enable(value: &str) -> Result<BTreeSet<Priority>> {
    Priority::parse_list(value)
        .map_err(|e| PfcWdError::invalid_config(fields::PFC_ENABLE, e.to_string()))
}

/// Kind of a table change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Del,
}

/// One CONFIG_DB change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEvent {
    pub table: String,
    pub key: String,
    pub op: Operation,
    pub fields: Vec<(String, String)>,
}

impl ConfigEvent {
    pub fn set<'a>(
        table: &str,
        key: &str,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            op: Operation::Set,
            fields: fields
                .into_iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn del(table: &str, key: &str) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            op: Operation::Del,
            fields: Vec::new(),
        }
    }

    /// Value of `field`, if present. The last occurrence wins.
    pub fn get_field(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .rev()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_millis(field: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| {
            PfcWdError::invalid_config(
                field,
                format!("{:?} is not a number of milliseconds", value),
            )
        })
}

impl WatchdogParams {
    /// Builds parameters from a `PFC_WD|<port>` entry.
    ///
    /// `action` defaults to `drop`; a missing `restoration_time` defaults to
    /// twice the detection time like the `pfcwd start` command.
    pub fn from_fields(event: &ConfigEvent) -> Result<Self> {
        let action = match event.get_field(fields::ACTION) {
            Some(v) => v.parse::<PfcWdAction>()?,
            None => PfcWdAction::default(),
        };
        let detection_ms = event
            .get_field(fields::DETECTION_TIME)
            .ok_or_else(|| PfcWdError::invalid_config(fields::DETECTION_TIME, "missing"))
            .and_then(|v| parse_millis(fields::DETECTION_TIME, v))?;
        let restoration_ms = match event.get_field(fields::RESTORATION_TIME) {
            Some(v) => parse_millis(fields::RESTORATION_TIME, v)?,
            None => detection_ms.saturating_mul(2),
        };
        Self::from_millis(action, detection_ms, restoration_ms)
    }
}
