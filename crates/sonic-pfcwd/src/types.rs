//! PFC Watchdog types and structures.

use serde::{Deserialize, Serialize};
use sonic_types::{PortAlias, Priority};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PfcWdError;

/// PFC watchdog action taken while a storm is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PfcWdAction {
    #[default]
    Drop,
    Forward,
    Alert,
}

impl PfcWdAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "forward" => Some(Self::Forward),
            "drop" => Some(Self::Drop),
            "alert" => Some(Self::Alert),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Forward => "forward",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for PfcWdAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PfcWdAction {
    type Err = PfcWdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| {
            PfcWdError::invalid_config("action", format!("unknown watchdog action '{}'", s))
        })
    }
}

/// Detection time (100-5000 ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct DetectionTime(u32);

impl DetectionTime {
    pub const MIN_MS: u32 = 100;
    pub const MAX_MS: u32 = 5000;

    pub fn new(value: u32) -> Result<Self, PfcWdError> {
        if (Self::MIN_MS..=Self::MAX_MS).contains(&value) {
            Ok(Self(value))
        } else {
            Err(PfcWdError::invalid_config(
                "detection_time",
                format!("{} must be {}-{}ms", value, Self::MIN_MS, Self::MAX_MS),
            ))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.0))
    }
}

impl TryFrom<u32> for DetectionTime {
    type Error = PfcWdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DetectionTime> for u32 {
    fn from(t: DetectionTime) -> Self {
        t.0
    }
}

/// Restoration time (100-60000 ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct RestorationTime(u32);

impl RestorationTime {
    pub const MIN_MS: u32 = 100;
    pub const MAX_MS: u32 = 60000;

    pub fn new(value: u32) -> Result<Self, PfcWdError> {
        if (Self::MIN_MS..=Self::MAX_MS).contains(&value) {
            Ok(Self(value))
        } else {
            Err(PfcWdError::invalid_config(
                "restoration_time",
                format!("{} must be {}-{}ms", value, Self::MIN_MS, Self::MAX_MS),
            ))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.0))
    }
}

impl TryFrom<u32> for RestorationTime {
    type Error = PfcWdError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RestorationTime> for u32 {
    fn from(t: RestorationTime) -> Self {
        t.0
    }
}

/// Per-port watchdog entry, as written by `pfcwd start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogParams {
    pub action: PfcWdAction,
    pub detection_time: DetectionTime,
    pub restoration_time: RestorationTime,
}

impl WatchdogParams {
    pub fn new(
        action: PfcWdAction,
        detection_time: DetectionTime,
        restoration_time: RestorationTime,
    ) -> Self {
        Self {
            action,
            detection_time,
            restoration_time,
        }
    }

    /// Builds parameters from raw millisecond values.
    pub fn from_millis(
        action: PfcWdAction,
        detection_ms: u32,
        restoration_ms: u32,
    ) -> Result<Self, PfcWdError> {
        Ok(Self::new(
            action,
            DetectionTime::new(detection_ms)?,
            RestorationTime::new(restoration_ms)?,
        ))
    }
}

/// Identity of a watchdog session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub port: PortAlias,
    pub priority: Priority,
}

impl SessionKey {
    pub fn new(port: PortAlias, priority: Priority) -> Self {
        Self { port, priority }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.port, self.priority)
    }
}
