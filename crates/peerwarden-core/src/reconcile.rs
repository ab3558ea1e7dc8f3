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

//! Drift repair between the store, the mirror directory and the shared
//! interface config.
//!
//! A pass only ever adds or corrects; it never deletes a peer. Running it
//! twice with no external change in between performs no writes the second
//! time.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Instant;

use peerwarden_types::DisableCause;
use tracing::{debug, info, warn};

use crate::address::{self, NO_ROUTE, Subnet};
use crate::audit::{Action, AuditRecord};
use crate::db::{NewPeer, Peer, StoreError};
use crate::error::GatewayError;
use crate::gateway::{Gateway, PRESET_SETTING, SUBNET_SETTING};
use crate::keys::{self, EXTERNAL_KEY, StoredKey, recover_private_key};
use crate::lifecycle::validate_name;
use crate::live::LiveInterface;
use crate::mirror::MirrorEntry;
use crate::shared::SharedPeer;
use crate::subnet::preset_name;

/// Counts of every write a pass made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub subnet_updated: bool,
    pub adopted_from_shared: usize,
    pub adopted_from_files: usize,
    pub names_fixed: usize,
    pub keys_recovered: usize,
    pub addresses_normalized: usize,
    pub files_regenerated: usize,
    pub keys_migrated: usize,
}

impl ReconcileReport {
    pub fn mutations(&self) -> usize {
        usize::from(self.subnet_updated)
            + self.adopted_from_shared
            + self.adopted_from_files
            + self.names_fixed
            + self.keys_recovered
            + self.addresses_normalized
            + self.files_regenerated
            + self.keys_migrated
    }
}

/// Name for a peer adopted without a usable `# name` comment.
fn fallback_name(public_key: &str) -> String {
    let tag: String = public_key
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    format!("external-{tag}")
}

/// A uniqueness conflict skips the candidate; anything else fails the pass.
fn skip_conflict(inserted: Result<Peer, StoreError>, name: &str) -> Result<Option<Peer>, StoreError> {
    match inserted {
        Ok(peer) => Ok(Some(peer)),
        Err(e @ (StoreError::DuplicateName | StoreError::DuplicateKey)) => {
            warn!(name, error = %e, "skipping adoption");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn holder_of(peers: &[Peer], host: Ipv4Addr) -> Option<&Peer> {
    peers.iter().find(|p| p.host() == Some(host))
}

impl<L: LiveInterface> Gateway<L> {
    /// Run a full pass now, regardless of the cooldown.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_now(&self) -> Result<ReconcileReport, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.reconcile_locked().await
    }

    /// Run a pass if the cooldown has elapsed since the last one.
    pub async fn reconcile_if_due(&self) -> Option<ReconcileReport> {
        let _lifecycle = self.lifecycle.lock().await;
        self.reconcile_if_due_locked().await
    }

    /// Errors are logged, not returned: a failed pass is retried next time.
    pub(crate) async fn reconcile_if_due_locked(&self) -> Option<ReconcileReport> {
        {
            let last = self.last_reconcile.lock().await;
            if last.is_some_and(|at| at.elapsed() < self.config.reconcile_cooldown()) {
                debug!("reconcile cooldown active, skipping");
                return None;
            }
        }
        match self.reconcile_locked().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, reason = %e.reason(), "reconciliation pass failed");
                None
            }
        }
    }

    pub(crate) async fn reconcile_locked(&self) -> Result<ReconcileReport, GatewayError> {
        let mut report = ReconcileReport::default();

        self.sync_subnet(&mut report).await?;
        let subnet = self.subnet().await?;

        self.adopt_shared_peers(&mut report).await?;
        self.sync_mirror_files(&subnet, &mut report).await?;
        self.regenerate_missing_files(&subnet, &mut report).await?;
        self.migrate_raw_keys(&mut report).await?;

        *self.last_reconcile.lock().await = Some(Instant::now());

        if report.mutations() > 0 {
            info!(?report, "reconciliation pass made changes");
        } else {
            debug!("reconciliation pass found no drift");
        }
        Ok(report)
    }

    // -- Step 1: subnet ------------------------------------------------------

    /// The shared config's `Address` line is authoritative for the subnet.
    async fn sync_subnet(&self, report: &mut ReconcileReport) -> Result<(), GatewayError> {
        let Some((host, prefix)) = self.shared.interface_address()? else {
            return Ok(());
        };
        let subnet = match Subnet::from_parts(host, prefix) {
            Ok(s) => s,
            Err(e) => {
                warn!(%host, prefix, error = %e, "shared config address is not a usable subnet");
                return Ok(());
            }
        };
        let cidr = subnet.to_string();
        let preset = preset_name(&subnet);

        if self.store.get_setting(SUBNET_SETTING).await?.as_deref() != Some(cidr.as_str()) {
            self.store.put_setting(SUBNET_SETTING, &cidr).await?;
            report.subnet_updated = true;
            info!(%cidr, "subnet re-derived from shared config");
        }
        if self.store.get_setting(PRESET_SETTING).await?.as_deref() != Some(preset) {
            self.store.put_setting(PRESET_SETTING, preset).await?;
            report.subnet_updated = true;
        }
        Ok(())
    }

    // -- Step 2: peers only in the shared config -----------------------------

    async fn adopt_shared_peers(&self, report: &mut ReconcileReport) -> Result<(), GatewayError> {
        let shared_peers = self.shared.peers()?;
        if shared_peers.is_empty() {
            return Ok(());
        }
        let mut known = self.store.list_peers().await?;

        for sp in shared_peers {
            if known.iter().any(|p| p.public_key == sp.public_key) {
                continue;
            }
            if let Some(adopted) = self.adopt_shared_peer(&sp, &known).await? {
                report.adopted_from_shared += 1;
                known.push(adopted);
            }
        }
        Ok(())
    }

    async fn adopt_shared_peer(
        &self,
        sp: &SharedPeer,
        known: &[Peer],
    ) -> Result<Option<Peer>, GatewayError> {
        let host = match sp.host() {
            Some(h) if h != NO_ROUTE => h,
            _ => {
                warn!(public_key = %sp.public_key, allowed_ips = ?sp.allowed_ips, "ignoring shared config peer without a routable address");
                return Ok(None);
            }
        };
        if let Some(holder) = holder_of(known, host) {
            warn!(public_key = %sp.public_key, %host, holder = %holder.name, "shared config peer collides with a stored address");
            return Ok(None);
        }
        if keys::decode_key(&sp.public_key).is_err() {
            warn!(public_key = %sp.public_key, "ignoring shared config peer with malformed key");
            return Ok(None);
        }

        let name = sp
            .name
            .as_deref()
            .filter(|n| validate_name(n).is_ok() && !known.iter().any(|p| p.name == *n))
            .map(str::to_string)
            .unwrap_or_else(|| fallback_name(&sp.public_key));
        if known.iter().any(|p| p.name == name) {
            warn!(%name, "cannot adopt shared config peer, name taken");
            return Ok(None);
        }

        let allowed_ips = address::server_view(host);
        let inserted = self
            .store
            .insert_peer(&NewPeer {
                name: &name,
                public_key: &sp.public_key,
                encrypted_private_key: EXTERNAL_KEY,
                allowed_ips: &allowed_ips,
                disabled: false,
                disabled_cause: None,
                expires_at: None,
                data_limit_gb: 0,
            })
            .await;
        let Some(peer) = skip_conflict(inserted, &name)? else {
            return Ok(None);
        };
        info!(%name, address = %allowed_ips, "adopted peer from shared config");
        self.record(AuditRecord::peer(&name, Action::Adopt, "from shared config"))
            .await;
        Ok(Some(peer))
    }

    // -- Step 3: mirror files ------------------------------------------------

    async fn sync_mirror_files(
        &self,
        subnet: &Subnet,
        report: &mut ReconcileReport,
    ) -> Result<(), GatewayError> {
        let entries = self.mirror.scan()?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut known = self.store.list_peers().await?;
        let by_key: HashMap<String, usize> = known
            .iter()
            .enumerate()
            .map(|(i, p)| (p.public_key.clone(), i))
            .collect();

        let mut keyed = Vec::with_capacity(entries.len());
        for entry in &entries {
            let Some(private_key) = entry.private_key.as_deref() else {
                debug!(name = %entry.name, "client config has no private key");
                continue;
            };
            match keys::public_from_private(private_key) {
                Ok(public_key) => keyed.push((entry, private_key, public_key)),
                Err(e) => {
                    warn!(name = %entry.name, error = %e, "client config holds an unusable private key");
                }
            }
        }

        // A copied config shares its key with the original. The file named
        // after the stored peer owns the key; otherwise the first file does.
        let named_after_peer: HashSet<&str> = keyed
            .iter()
            .filter(|(entry, _, public_key)| {
                by_key
                    .get(public_key)
                    .is_some_and(|&i| known[i].name == entry.name)
            })
            .map(|(_, _, public_key)| public_key.as_str())
            .collect();
        let mut matched: HashSet<&str> = HashSet::new();

        for (entry, private_key, public_key) in &keyed {
            let public_key = public_key.as_str();
            let owner = by_key
                .get(public_key)
                .is_none_or(|&i| known[i].name == entry.name)
                || !named_after_peer.contains(public_key);
            if !owner || !matched.insert(public_key) {
                warn!(name = %entry.name, "ignoring client config that duplicates another file's key");
                continue;
            }

            match by_key.get(public_key) {
                Some(&i) => {
                    let peer = known[i].clone();
                    if self
                        .reconcile_file_drift(entry, private_key, &peer, &known, report)
                        .await?
                    {
                        known[i].name = entry.name.clone();
                    }
                }
                None => {
                    if let Some(adopted) = self
                        .adopt_file_peer(entry, private_key, public_key, subnet, &known)
                        .await?
                    {
                        report.adopted_from_files += 1;
                        known.push(adopted);
                    }
                }
            }
        }
        Ok(())
    }

    async fn adopt_file_peer(
        &self,
        entry: &MirrorEntry,
        private_key: &str,
        public_key: &str,
        subnet: &Subnet,
        known: &[Peer],
    ) -> Result<Option<Peer>, GatewayError> {
        let host = match entry.host() {
            Some(h) if h != NO_ROUTE => h,
            _ => {
                warn!(name = %entry.name, "ignoring client config without a routable address");
                return Ok(None);
            }
        };
        if !subnet.contains(host) {
            debug!(name = %entry.name, %host, %subnet, "adopting client config outside the active subnet");
        }
        if validate_name(&entry.name).is_err() {
            warn!(name = %entry.name, "ignoring client config with an unsafe name");
            return Ok(None);
        }
        if known.iter().any(|p| p.name == entry.name) {
            warn!(name = %entry.name, "client config name already used by another key");
            return Ok(None);
        }
        if let Some(holder) = holder_of(known, host) {
            warn!(name = %entry.name, %host, holder = %holder.name, "client config collides with a stored address");
            return Ok(None);
        }

        let encrypted = self.cipher.encrypt(private_key)?;
        let allowed_ips = address::server_view(host);
        let inserted = self
            .store
            .insert_peer(&NewPeer {
                name: &entry.name,
                public_key,
                encrypted_private_key: &encrypted,
                allowed_ips: &allowed_ips,
                disabled: entry.disabled,
                disabled_cause: entry.disabled.then_some(DisableCause::User),
                expires_at: entry.expires_at,
                data_limit_gb: entry.limit_gb.unwrap_or(0).max(0),
            })
            .await;
        let Some(peer) = skip_conflict(inserted, &entry.name)? else {
            return Ok(None);
        };
        info!(name = %entry.name, address = %allowed_ips, "adopted peer from client config");
        self.record(AuditRecord::peer(&entry.name, Action::Adopt, "from client config"))
            .await;
        Ok(Some(peer))
    }

    /// Name and key follow the file. The address is corrected only when the
    /// store holds the client view; a stored `/32` is never changed here.
    async fn reconcile_file_drift(
        &self,
        entry: &MirrorEntry,
        private_key: &str,
        peer: &Peer,
        known: &[Peer],
        report: &mut ReconcileReport,
    ) -> Result<bool, GatewayError> {
        let mut renamed = false;
        if peer.name != entry.name {
            let taken = known.iter().any(|p| p.name == entry.name && p.id != peer.id);
            if validate_name(&entry.name).is_ok() && !taken {
                self.store.rename_peer(peer.id, &entry.name).await?;
                report.names_fixed += 1;
                renamed = true;
                info!(old = %peer.name, new = %entry.name, "peer name taken from client config");
            } else {
                warn!(stored = %peer.name, file = %entry.name, "cannot take name from client config");
            }
        }

        if StoredKey::classify(&peer.encrypted_private_key).is_unheld() {
            let encrypted = self.cipher.encrypt(private_key)?;
            self.store.set_encrypted_key(peer.id, &encrypted).await?;
            report.keys_recovered += 1;
            info!(name = %entry.name, "recovered private key from client config");
        }

        if !address::is_server_view(&peer.allowed_ips) {
            if let Some(host) = entry.host().or_else(|| peer.host()) {
                let server = address::server_view(host);
                self.store.set_allowed_ips(peer.id, &server).await?;
                report.addresses_normalized += 1;
                info!(name = %entry.name, from = %peer.allowed_ips, to = %server, "normalized stored address");
            }
        }
        Ok(renamed)
    }

    // -- Step 4: missing mirror files ----------------------------------------

    async fn regenerate_missing_files(
        &self,
        subnet: &Subnet,
        report: &mut ReconcileReport,
    ) -> Result<(), GatewayError> {
        for peer in self.store.list_peers().await? {
            if self.mirror.exists(&peer.name) {
                continue;
            }
            let private_key =
                match recover_private_key(self.cipher.as_ref(), &peer.encrypted_private_key) {
                    Ok(Some(k)) => k,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(name = %peer.name, error = %e, "cannot decrypt key to regenerate client config");
                        continue;
                    }
                };
            let Some(host) = peer.host() else {
                continue;
            };
            let text = self.render_client_config(&peer.name, &private_key, &subnet.client_view(host));
            if !self.mirror.write_if_absent(&peer.name, &text)? {
                continue;
            }
            let sidecars = self
                .mirror
                .set_disabled(&peer.name, peer.disabled)
                .and_then(|()| self.mirror.set_limit(&peer.name, peer.data_limit_gb))
                .and_then(|()| self.mirror.set_expiry(&peer.name, peer.expires_at));
            if let Err(e) = sidecars {
                warn!(name = %peer.name, error = %e, "failed to restore client config sidecars");
            }
            report.files_regenerated += 1;
            info!(name = %peer.name, "regenerated missing client config");
        }
        Ok(())
    }

    // -- Step 5: raw keys ----------------------------------------------------

    async fn migrate_raw_keys(&self, report: &mut ReconcileReport) -> Result<(), GatewayError> {
        for peer in self.store.list_peers().await? {
            let StoredKey::Raw(raw) = StoredKey::classify(&peer.encrypted_private_key) else {
                continue;
            };
            let encrypted = self.cipher.encrypt(raw)?;
            self.store.set_encrypted_key(peer.id, &encrypted).await?;
            report.keys_migrated += 1;
            info!(name = %peer.name, "encrypted plaintext private key");
            self.record(AuditRecord::peer(&peer.name, Action::KeyMigrated, "encrypted at rest"))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_name_is_valid() {
        let name = fallback_name("a+b/cdefghij=");
        assert_eq!(name, "external-abcdefgh");
        assert!(validate_name(&name).is_ok());
    }

    #[test]
    fn mutation_count() {
        let report = ReconcileReport {
            subnet_updated: true,
            files_regenerated: 2,
            ..Default::default()
        };
        assert_eq!(report.mutations(), 3);
        assert_eq!(ReconcileReport::default().mutations(), 0);
    }
}
