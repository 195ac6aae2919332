//! PFC priority (traffic class) types.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Number of PFC priorities on a port.
pub const PFC_PRIORITY_COUNT: usize = 8;

/// PFC priority / lossless traffic class (0-7).
///
/// # Examples
///
/// ```
/// use sonic_types::Priority;
///
/// let tc = Priority::new(3).unwrap();
/// assert_eq!(tc.as_u8(), 3);
///
/// assert!(Priority::new(8).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Highest valid priority.
    pub const MAX: u8 = 7;

    /// Creates a new priority.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not in the range 0-7.
    pub fn new(value: u8) -> Result<Self, ParseError> {
        if value <= Self::MAX {
            Ok(Priority(value))
        } else {
            Err(ParseError::InvalidPriority(value.to_string()))
        }
    }

    /// Returns the priority as a u8.
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the priority as an index into per-priority arrays.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// Iterates over all eight priorities in ascending order.
    pub fn all() -> impl Iterator<Item = Priority> + Clone {
        (0..=Self::MAX).map(Priority)
    }

    /// Parses a comma separated priority list as found in `PORT_QOS_MAP|pfc_enable`.
    ///
    /// An empty string yields an empty set. Whitespace around entries is ignored.
    pub fn parse_list(s: &str) -> Result<BTreeSet<Priority>, ParseError> {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(Priority::from_str)
            .collect()
    }

    /// Formats a priority set back into the `pfc_enable` list form.
    pub fn format_list<'a>(priorities: impl IntoIterator<Item = &'a Priority>) -> String {
        priorities
            .into_iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidPriority(s.to_string()))?;
        Priority::new(value).map_err(|_| ParseError::InvalidPriority(s.to_string()))
    }
}

impl TryFrom<u8> for Priority {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}
