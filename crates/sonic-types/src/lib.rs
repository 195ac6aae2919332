//! Common SONiC types for network switch orchestration.
//!
//! This crate provides type-safe representations of the primitives the
//! PFC watchdog shares with the rest of the SONiC control plane:
//!
//! - [`Priority`]: IEEE 802.1Qbb traffic class / PFC priority (0-7)
//! - [`PortAlias`]: front-panel port name (e.g. `Ethernet0`)
//! - [`PortOid`]: SAI object id of a port

mod port;
mod priority;

pub use port::{PortAlias, PortOid};
pub use priority::{Priority, PFC_PRIORITY_COUNT};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid PFC priority: {0} (must be 0-7)")]
    InvalidPriority(String),

    #[error("invalid port alias: {0:?}")]
    InvalidPortAlias(String),

    #[error("invalid SAI object id: {0}")]
    InvalidObjectId(String),
}
