//! peerwarden-types: Shared type definitions for the peerwarden gateway.
//!
//! This crate contains the data models, outcome types and reason codes shared
//! between the gateway core, the daemon, and the HTTP layer in front of them.

#![warn(missing_docs)]

pub mod subnet;
pub mod usage;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a peer was taken off the live interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableCause {
    /// Disabled through the API.
    User,
    /// Cumulative transfer passed the configured data limit.
    Quota,
    /// Outside the peer's schedule window.
    Schedule,
}

impl DisableCause {
    /// Stable string form, used in the store and in audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Quota => "quota",
            Self::Schedule => "schedule",
        }
    }
}

impl fmt::Display for DisableCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored disable cause is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown disable cause: {0}")]
pub struct UnknownCause(pub String);

impl FromStr for DisableCause {
    type Err = UnknownCause;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "quota" => Ok(Self::Quota),
            "schedule" => Ok(Self::Schedule),
            other => Err(UnknownCause(other.to_string())),
        }
    }
}

/// Lifecycle state of a peer as seen by collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Routed on the live interface.
    Active,
    /// Disabled by a user or by its schedule; address stays reserved.
    Disabled,
    /// Disabled because its data limit was exceeded.
    QuotaExceeded,
    /// Past its expiry; about to be removed.
    Expired,
}

/// Whether every side effect of a transition landed synchronously.
///
/// `Deferred` is a partial success: the store change is committed but the
/// live interface could not be updated, so the host-side reconciler was
/// signalled to re-apply the shared config instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// All side effects applied.
    Applied,
    /// Store committed, live interface update deferred to the reconciler.
    Deferred,
    /// Nothing to do; the target was already in the requested state.
    Unchanged,
}

/// Machine-distinguishable reason attached to every rejected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Peer name does not match the safe filename alphabet.
    InvalidName,
    /// Malformed or out-of-policy CIDR.
    InvalidCidr,
    /// Unknown subnet preset name.
    UnknownPreset,
    /// Malformed requested address.
    InvalidAddress,
    /// No free address left in the subnet.
    SubnetExhausted,
    /// Peer count already at the subnet's capacity.
    CapacityExceeded,
    /// Requested address is reserved, outside the subnet, or taken.
    AddressUnavailable,
    /// Another peer already uses this name.
    DuplicateName,
    /// Another peer already uses this public key.
    DuplicateKey,
    /// Subnet change would strand existing peers.
    SubnetConflict,
    /// Malformed schedule window.
    InvalidSchedule,
    /// Transition not valid from the peer's current state.
    InvalidState,
    /// Peer does not exist.
    NotFound,
    /// A required file side effect failed.
    SideEffect,
    /// Unexpected internal failure.
    Internal,
}

impl ReasonCode {
    /// Stable string form for wire encodings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidName => "invalid_name",
            Self::InvalidCidr => "invalid_cidr",
            Self::UnknownPreset => "unknown_preset",
            Self::InvalidAddress => "invalid_address",
            Self::SubnetExhausted => "subnet_exhausted",
            Self::CapacityExceeded => "capacity_exceeded",
            Self::AddressUnavailable => "address_unavailable",
            Self::DuplicateName => "duplicate_name",
            Self::DuplicateKey => "duplicate_key",
            Self::SubnetConflict => "subnet_conflict",
            Self::InvalidSchedule => "invalid_schedule",
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::SideEffect => "side_effect",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer as presented to collaborators. Never carries key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Stable identifier.
    pub id: Uuid,
    /// Unique, filename-safe label.
    pub name: String,
    /// Base64 curve25519 public key.
    pub public_key: String,
    /// Server-view address (`host/32`).
    pub allowed_ips: String,
    /// Current lifecycle state.
    pub status: PeerStatus,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Data limit in GiB, 0 for unlimited.
    pub data_limit_gb: i64,
    /// Received bytes including the current session.
    pub rx_bytes: i64,
    /// Transmitted bytes including the current session.
    pub tx_bytes: i64,
    /// Whether the private key is held by an external tool.
    pub externally_managed: bool,
    /// When the peer was created.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(DisableCause::User ; "user")]
    #[test_case(DisableCause::Quota ; "quota")]
    #[test_case(DisableCause::Schedule ; "schedule")]
    fn cause_parses_its_own_string(cause: DisableCause) {
        assert_eq!(cause.as_str().parse::<DisableCause>().unwrap(), cause);
    }

    #[test]
    fn unknown_cause_rejected() {
        assert!("admin".parse::<DisableCause>().is_err());
    }

    #[test]
    fn reason_code_serializes_snake_case() {
        let json = serde_json::to_string(&ReasonCode::SubnetExhausted).unwrap();
        assert_eq!(json, "\"subnet_exhausted\"");
        assert_eq!(ReasonCode::SubnetExhausted.as_str(), "subnet_exhausted");
    }
}
