//! Port identity types shared by orchestration agents.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

/// Front-panel port alias as used for CONFIG_DB keys (e.g. `Ethernet0`).
///
/// Aliases are non-empty and contain no whitespace or the `|` / `:`
/// separators used in database keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortAlias(String);

impl PortAlias {
    /// Creates a validated port alias.
    pub fn new(alias: impl Into<String>) -> Result<Self, ParseError> {
        let alias = alias.into();
        let valid = !alias.is_empty()
            && !alias
                .chars()
                .any(|c| c.is_whitespace() || c == '|' || c == ':' || c == ',');
        if valid {
            Ok(PortAlias(alias))
        } else {
            Err(ParseError::InvalidPortAlias(alias))
        }
    }

    /// Returns the alias as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PortAlias {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortAlias::new(s)
    }
}

impl TryFrom<String> for PortAlias {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PortAlias::new(value)
    }
}

impl From<PortAlias> for String {
    fn from(alias: PortAlias) -> Self {
        alias.0
    }
}

impl Borrow<str> for PortAlias {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PortAlias {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// SAI object id of a port.
///
/// The watchdog only holds this handle; the port object itself is owned by
/// the SAI layer. Serialized the way `sai_serialize_object_id` does
/// (`oid:0x1000000000002`), which is also the form used in
/// `COUNTERS_PORT_NAME_MAP` and flex-counter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortOid(u64);

impl PortOid {
    /// Creates a port OID from its raw value.
    ///
    /// Returns `None` for `SAI_NULL_OBJECT_ID`.
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(PortOid(raw))
        }
    }

    /// Returns the raw object id.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PortOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:0x{:x}", self.0)
    }
}

impl FromStr for PortOid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("oid:0x")
            .or_else(|| s.strip_prefix("0x"))
            .ok_or_else(|| ParseError::InvalidObjectId(s.to_string()))?;
        let raw = u64::from_str_radix(hex, 16)
            .map_err(|_| ParseError::InvalidObjectId(s.to_string()))?;
        PortOid::from_raw(raw).ok_or_else(|| ParseError::InvalidObjectId(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_alias_validation() {
        assert!(PortAlias::new("Ethernet0").is_ok());
        assert!(PortAlias::new("").is_err());
        assert!(PortAlias::new("Ethernet 0").is_err());
        assert!(PortAlias::new("PFC_WD|Ethernet0").is_err());
        assert!(PortAlias::new("Ethernet0,Ethernet8").is_err());
    }

    #[test]
    fn test_port_alias_ordering() {
        let mut ports = vec![
            PortAlias::new("Ethernet8").unwrap(),
            PortAlias::new("Ethernet0").unwrap(),
        ];
        ports.sort();
        assert_eq!(ports[0].as_str(), "Ethernet0");
    }

    #[test]
    fn test_port_oid_format() {
        let oid = PortOid::from_raw(0x100000000000c).unwrap();
        assert_eq!(oid.to_string(), "oid:0x100000000000c");
        assert_eq!("oid:0x100000000000c".parse::<PortOid>().unwrap(), oid);
        assert_eq!("0x100000000000c".parse::<PortOid>().unwrap(), oid);
    }

    #[test]
    fn test_port_oid_null_rejected() {
        assert!(PortOid::from_raw(0).is_none());
        assert!("oid:0x0".parse::<PortOid>().is_err());
        assert!("1000".parse::<PortOid>().is_err());
    }
}
