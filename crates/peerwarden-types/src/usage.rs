//! Live transfer samples read back from the WireGuard interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full per-peer state from a device dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDump {
    /// Base64 public key.
    pub public_key: String,
    /// Last completed handshake, if any.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Bytes received from the peer since the interface last saw it.
    pub rx_bytes: u64,
    /// Bytes sent to the peer since the interface last saw it.
    pub tx_bytes: u64,
}

/// Transfer counters only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTransfer {
    /// Base64 public key.
    pub public_key: String,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes sent.
    pub tx_bytes: u64,
}

impl From<PeerDump> for PeerTransfer {
    fn from(d: PeerDump) -> Self {
        Self {
            public_key: d.public_key,
            rx_bytes: d.rx_bytes,
            tx_bytes: d.tx_bytes,
        }
    }
}
