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

use peerwarden_types::subnet::{self as presets, CUSTOM_PRESET, SubnetChoice, SubnetInfo};
use tracing::{info, warn};

use crate::address::Subnet;
use crate::audit::{Action, AuditRecord};
use crate::db::Peer;
use crate::error::GatewayError;
use crate::gateway::{Gateway, PRESET_SETTING, SUBNET_SETTING};
use crate::live::LiveInterface;

/// Presets are recognised by mask alone.
pub(crate) fn preset_name(subnet: &Subnet) -> &'static str {
    presets::preset_for_prefix(subnet.prefix()).map_or(CUSTOM_PRESET, |p| p.name)
}

fn describe(subnet: &Subnet, preset: String, peer_count: u32) -> SubnetInfo {
    let ranges = subnet.ranges();
    SubnetInfo {
        cidr: subnet.to_string(),
        preset,
        capacity: subnet.capacity(),
        gateway: ranges.gateway.to_string(),
        first_peer: ranges.first_peer.to_string(),
        last_usable: ranges.last_usable.to_string(),
        peer_count,
    }
}

/// Reasons `target` cannot hold the existing peers, if any.
fn check_fits(target: &Subnet, peers: &[Peer]) -> Result<(), GatewayError> {
    if peers.is_empty() {
        return Ok(());
    }
    let capacity = target.capacity() as usize;
    if capacity < peers.len() {
        return Err(GatewayError::SubnetConflict(format!(
            "{target} holds {capacity} addresses but {} peers exist",
            peers.len()
        )));
    }
    for peer in peers {
        match peer.host() {
            Some(host) if target.contains(host) && !target.is_reserved(host) => {}
            _ => {
                return Err(GatewayError::SubnetConflict(format!(
                    "peer {} at {} would fall outside {target}",
                    peer.name, peer.allowed_ips
                )));
            }
        }
    }
    Ok(())
}

impl<L: LiveInterface> Gateway<L> {
    pub async fn subnet_info(&self) -> Result<SubnetInfo, GatewayError> {
        let subnet = self.subnet().await?;
        let preset = match self.store.get_setting(PRESET_SETTING).await? {
            Some(p) => p,
            None => preset_name(&subnet).to_string(),
        };
        let count = self.store.list_peers().await?.len();
        Ok(describe(&subnet, preset, u32::try_from(count).unwrap_or(u32::MAX)))
    }

    /// Switch the active subnet.
    ///
    /// Rejected while peers exist unless every one of them still fits. The
    /// shared config's `Address` line moves to the new gateway first, since
    /// reconciliation treats it as authoritative.
    #[tracing::instrument(skip(self))]
    pub async fn configure_subnet(&self, choice: SubnetChoice) -> Result<SubnetInfo, GatewayError> {
        let (target, preset) = match &choice {
            SubnetChoice::Preset(name) => {
                let preset = presets::preset(name)
                    .ok_or_else(|| GatewayError::UnknownPreset(name.clone()))?;
                let subnet = Subnet::parse(preset.cidr).map_err(GatewayError::InvalidCidr)?;
                (subnet, preset.name)
            }
            SubnetChoice::Custom(cidr) => {
                let subnet = Subnet::parse(cidr).map_err(GatewayError::InvalidCidr)?;
                let preset = preset_name(&subnet);
                (subnet, preset)
            }
        };

        let _lifecycle = self.lifecycle.lock().await;
        let _allocation = self.allocation.lock().await;

        let peers = self.store.list_peers().await?;
        check_fits(&target, &peers)?;

        let current = self.subnet().await?;
        let gateway_address = format!("{}/{}", target.gateway(), target.prefix());
        self.shared.set_interface_address(&gateway_address)?;
        self.store.put_setting(SUBNET_SETTING, &target.to_string()).await?;
        self.store.put_setting(PRESET_SETTING, preset).await?;

        if target.prefix() != current.prefix() {
            for peer in &peers {
                let Some(host) = peer.host() else { continue };
                if let Err(e) = self.mirror.set_address(&peer.name, &target.client_view(host)) {
                    warn!(name = %peer.name, error = %e, "failed to update client config address");
                }
            }
        }
        self.raise_trigger();

        info!(from = %current, to = %target, preset, "subnet changed");
        self.record(AuditRecord::system(
            Action::SubnetChanged,
            format!("{current} -> {target} ({preset})"),
        ))
        .await;
        Ok(describe(
            &target,
            preset.to_string(),
            u32::try_from(peers.len()).unwrap_or(u32::MAX),
        ))
    }

    /// A gzip-compressed tar of every client config in the mirror directory.
    #[tracing::instrument(skip(self))]
    pub async fn export_archive(&self) -> Result<Vec<u8>, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        Ok(self.mirror.export_archive()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("10.100.0.0/24", "small" ; "small")]
    #[test_case("10.100.0.0/16", "xlarge" ; "xlarge")]
    #[test_case("10.200.0.0/24", "small" ; "same mask other base")]
    #[test_case("192.168.4.0/26", "custom" ; "custom")]
    fn preset_detection(cidr: &str, expected: &str) {
        assert_eq!(preset_name(&Subnet::parse(cidr).unwrap()), expected);
    }

    #[test]
    fn describe_ranges() {
        let info = describe(&Subnet::parse("10.100.0.0/22").unwrap(), "medium".into(), 3);
        assert_eq!(info.capacity, 1022);
        assert_eq!(info.gateway, "10.100.0.1");
        assert_eq!(info.first_peer, "10.100.0.2");
        assert_eq!(info.last_usable, "10.100.3.254");
    }
}
