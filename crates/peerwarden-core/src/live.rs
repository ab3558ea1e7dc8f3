// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::future::Future;
use std::time::Duration;

use peerwarden_types::usage::{PeerDump, PeerTransfer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("interface call timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid key: {0}")]
    Key(#[from] crate::keys::CipherError),

    #[error("invalid allowed-ips value: {0}")]
    AllowedIps(String),
}

/// Narrow control surface over the kernel WireGuard interface.
///
/// Failures are never fatal to a transition; callers log them and raise the
/// reconciliation trigger instead.
pub trait LiveInterface: Send + Sync + 'static {
    fn apply(
        &self,
        public_key: &str,
        allowed_ips: &str,
    ) -> impl Future<Output = Result<(), LiveError>> + Send;

    fn remove(&self, public_key: &str) -> impl Future<Output = Result<(), LiveError>> + Send;

    fn dump_all_peers(&self) -> impl Future<Output = Result<Vec<PeerDump>, LiveError>> + Send;

    fn dump_transfer(&self) -> impl Future<Output = Result<Vec<PeerTransfer>, LiveError>> + Send;
}

#[cfg(target_os = "linux")]
pub type CurrentInterface = linux::KernelInterface;

#[cfg(not(target_os = "linux"))]
pub type CurrentInterface = StubInterface;

// -- Stub for non-Linux --

#[derive(Debug, Clone, Default)]
pub struct StubInterface;

impl StubInterface {
    pub fn new(_name: &str, _timeout: Duration) -> Self {
        Self
    }
}

impl LiveInterface for StubInterface {
    async fn apply(&self, _public_key: &str, _allowed_ips: &str) -> Result<(), LiveError> {
        Err(LiveError::Unsupported)
    }

    async fn remove(&self, _public_key: &str) -> Result<(), LiveError> {
        Err(LiveError::Unsupported)
    }

    async fn dump_all_peers(&self) -> Result<Vec<PeerDump>, LiveError> {
        Err(LiveError::Unsupported)
    }

    async fn dump_transfer(&self) -> Result<Vec<PeerTransfer>, LiveError> {
        Err(LiveError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::IpAddr;
    use std::time::Duration;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use chrono::DateTime;
    use peerwarden_types::usage::{PeerDump, PeerTransfer};
    use tracing::debug;
    use wireguard_uapi::{DeviceInterface, WgSocket, set};

    use super::{LiveError, LiveInterface};
    use crate::address;
    use crate::keys::decode_key;

    /// Drives the kernel device over generic netlink.
    ///
    /// Netlink calls block, so each runs on the blocking pool under the
    /// configured timeout. Nothing is retried here.
    #[derive(Debug, Clone)]
    pub struct KernelInterface {
        name: String,
        timeout: Duration,
    }

    impl KernelInterface {
        pub fn new(name: &str, timeout: Duration) -> Self {
            Self {
                name: name.to_string(),
                timeout,
            }
        }

        async fn run<T, F>(&self, f: F) -> Result<T, LiveError>
        where
            T: Send + 'static,
            F: FnOnce(String) -> Result<T, LiveError> + Send + 'static,
        {
            let name = self.name.clone();
            match tokio::time::timeout(self.timeout, tokio::task::spawn_blocking(move || f(name)))
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(LiveError::Interface(join.to_string())),
                Err(_) => Err(LiveError::Timeout(self.timeout)),
            }
        }

        fn dump(name: &str) -> Result<Vec<PeerDump>, LiveError> {
            let mut wg = WgSocket::connect().map_err(|e| LiveError::Interface(e.to_string()))?;
            let device = wg
                .get_device(DeviceInterface::from_name(name))
                .map_err(|e| LiveError::Interface(e.to_string()))?;
            Ok(device
                .peers
                .into_iter()
                .map(|p| {
                    let handshake = p.last_handshake_time;
                    let last_handshake = (!handshake.is_zero())
                        .then(|| {
                            DateTime::from_timestamp(
                                handshake.as_secs() as i64,
                                handshake.subsec_nanos(),
                            )
                        })
                        .flatten();
                    PeerDump {
                        public_key: BASE64.encode(p.public_key),
                        last_handshake,
                        rx_bytes: p.rx_bytes,
                        tx_bytes: p.tx_bytes,
                    }
                })
                .collect())
        }
    }

    impl LiveInterface for KernelInterface {
        async fn apply(&self, public_key: &str, allowed_ips: &str) -> Result<(), LiveError> {
            let key = decode_key(public_key)?;
            let (host, prefix) = address::parse_host(allowed_ips)
                .ok_or_else(|| LiveError::AllowedIps(allowed_ips.to_string()))?;
            self.run(move |name| {
                let addr = IpAddr::V4(host);
                let mut aip = set::AllowedIp::from_ipaddr(&addr);
                aip.cidr_mask = Some(prefix);
                let peer = set::Peer::from_public_key(&key)
                    .flags(vec![set::WgPeerF::ReplaceAllowedIps])
                    .allowed_ips(vec![aip]);
                let dev = set::Device::from_ifname(&name).peers(vec![peer]);

                let mut wg =
                    WgSocket::connect().map_err(|e| LiveError::Interface(e.to_string()))?;
                wg.set_device(dev)
                    .map_err(|e| LiveError::Interface(e.to_string()))?;
                debug!(interface = %name, %host, prefix, "applied peer");
                Ok(())
            })
            .await
        }

        async fn remove(&self, public_key: &str) -> Result<(), LiveError> {
            let key = decode_key(public_key)?;
            self.run(move |name| {
                let peer = set::Peer::from_public_key(&key).flags(vec![set::WgPeerF::RemoveMe]);
                let dev = set::Device::from_ifname(&name).peers(vec![peer]);

                let mut wg =
                    WgSocket::connect().map_err(|e| LiveError::Interface(e.to_string()))?;
                wg.set_device(dev)
                    .map_err(|e| LiveError::Interface(e.to_string()))?;
                debug!(interface = %name, "removed peer");
                Ok(())
            })
            .await
        }

        async fn dump_all_peers(&self) -> Result<Vec<PeerDump>, LiveError> {
            self.run(|name| Self::dump(&name)).await
        }

        async fn dump_transfer(&self) -> Result<Vec<PeerTransfer>, LiveError> {
            let peers = self.run(|name| Self::dump(&name)).await?;
            Ok(peers.into_iter().map(PeerTransfer::from).collect())
        }
    }
}
