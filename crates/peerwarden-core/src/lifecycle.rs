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

//! Peer state transitions and their ordered side effects.
//!
//! Every public entry point takes the lifecycle lock; the `_locked` variants
//! assume the caller already holds it. Store failures abort a transition.
//! Live interface failures never do: they are logged and the trigger is
//! raised so the host-side reconciler re-applies the shared config.

use chrono::{DateTime, Utc};
use peerwarden_types::{DisableCause, Outcome, PeerSummary};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::address;
use crate::allocator;
use crate::audit::{Action, AuditRecord};
use crate::db::StoreError;
use crate::db::peer::{self, NewPeer, Peer};
use crate::error::GatewayError;
use crate::files::FileError;
use crate::gateway::Gateway;
use crate::keys::{self, recover_private_key};
use crate::live::LiveInterface;
use crate::schedule::Schedule;

pub const MAX_NAME_LEN: usize = 64;

/// Names double as file stems in the mirror directory.
pub fn validate_name(name: &str) -> Result<(), GatewayError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewPeerRequest {
    pub name: String,
    /// Dotted address or bare last octet; `None` picks the lowest free one.
    pub requested_address: Option<String>,
    pub data_limit_gb: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Created {
    pub peer: Peer,
    pub outcome: Outcome,
}

fn not_found(id: Uuid) -> GatewayError {
    GatewayError::NotFound(id.to_string())
}

impl<L: LiveInterface> Gateway<L> {
    // -- Queries -------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> Result<Peer, GatewayError> {
        self.store.get_peer(id).await?.ok_or_else(|| not_found(id))
    }

    pub async fn find(&self, name: &str) -> Result<Peer, GatewayError> {
        self.store
            .get_peer_by_name(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<PeerSummary>, GatewayError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_peers()
            .await?
            .iter()
            .map(|p| p.summary(now))
            .collect())
    }

    /// The client config text for a peer, regenerated from the store when the
    /// mirror file is missing.
    #[tracing::instrument(skip(self))]
    pub async fn client_config(&self, id: Uuid) -> Result<String, GatewayError> {
        let peer = self.get(id).await?;
        if let Some(text) = self.mirror.read(&peer.name)? {
            return Ok(text);
        }
        let private_key = recover_private_key(self.cipher.as_ref(), &peer.encrypted_private_key)?
            .ok_or_else(|| {
                GatewayError::InvalidState(format!(
                    "private key for {} is held externally",
                    peer.name
                ))
            })?;
        let host = peer.host().ok_or_else(|| {
            GatewayError::InvalidState(format!("{} has no usable address", peer.name))
        })?;
        let subnet = self.subnet().await?;
        Ok(self.render_client_config(&peer.name, &private_key, &subnet.client_view(host)))
    }

    // -- Create --------------------------------------------------------------

    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create(&self, req: NewPeerRequest) -> Result<Created, GatewayError> {
        validate_name(&req.name)?;
        if req.data_limit_gb < 0 {
            return Err(GatewayError::InvalidState("data limit must not be negative".into()));
        }

        let _lifecycle = self.lifecycle.lock().await;
        self.reconcile_if_due_locked().await;

        if self.mirror.exists(&req.name) {
            return Err(GatewayError::DuplicateName);
        }

        let subnet = self.subnet().await?;
        let pair = keys::generate();
        let encrypted = self.cipher.encrypt(&pair.private_key)?;

        let created = {
            let _allocation = self.allocation.lock().await;
            let mut tx = self.store.begin().await?;

            let client = allocator::allocate(
                &mut *tx,
                &subnet,
                req.requested_address.as_deref(),
                &self.mirror,
                &self.shared,
            )
            .await?;
            let server = address::server_view(client.ip());

            let created = peer::insert_peer(
                &mut *tx,
                &NewPeer {
                    name: &req.name,
                    public_key: &pair.public_key,
                    encrypted_private_key: &encrypted,
                    allowed_ips: &server,
                    disabled: false,
                    disabled_cause: None,
                    expires_at: req.expires_at,
                    data_limit_gb: req.data_limit_gb,
                },
            )
            .await?;

            // The mirror file and shared config block must land before the
            // commit; the transaction rolls back on drop if they do not.
            let text =
                self.render_client_config(&req.name, &pair.private_key, &client.to_string());
            let written = self
                .mirror
                .write(&req.name, &text)
                .and_then(|()| self.mirror.set_limit(&req.name, req.data_limit_gb))
                .and_then(|()| self.mirror.set_expiry(&req.name, req.expires_at))
                .and_then(|()| self.shared.upsert_peer(&req.name, &pair.public_key, &server));
            if let Err(e) = written {
                error!(error = %e, "client config write failed, rolling back");
                self.undo_create_files(&req.name, &pair.public_key);
                return Err(e.into());
            }

            if let Err(e) = tx.commit().await {
                error!(error = %e, "commit failed, removing written files");
                self.undo_create_files(&req.name, &pair.public_key);
                return Err(StoreError::from(e).into());
            }
            created
        };

        let outcome = self
            .apply_live(&created.public_key, &created.allowed_ips)
            .await;
        self.raise_trigger();

        info!(address = %created.allowed_ips, ?outcome, "created peer");
        self.record(AuditRecord::peer(
            &created.name,
            Action::Create,
            format!("address {}", created.allowed_ips),
        ))
        .await;

        Ok(Created {
            peer: created,
            outcome,
        })
    }

    fn undo_create_files(&self, name: &str, public_key: &str) {
        if let Err(e) = self.mirror.remove(name) {
            warn!(name, error = %e, "failed to remove client config during rollback");
        }
        if let Err(e) = self.shared.remove_peer(public_key) {
            warn!(name, error = %e, "failed to remove shared config block during rollback");
        }
    }

    // -- Rename --------------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn rename(&self, id: Uuid, new_name: &str) -> Result<Outcome, GatewayError> {
        validate_name(new_name)?;
        let _lifecycle = self.lifecycle.lock().await;

        let peer = self.get(id).await?;
        if peer.name == new_name {
            return Ok(Outcome::Unchanged);
        }
        if self.store.get_peer_by_name(new_name).await?.is_some() {
            return Err(GatewayError::DuplicateName);
        }

        match self.mirror.rename(&peer.name, new_name) {
            Ok(()) => {}
            Err(FileError::AlreadyExists(_)) => {
                return Err(GatewayError::DuplicateName);
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.store.rename_peer(id, new_name).await {
            if let Err(undo) = self.mirror.rename(new_name, &peer.name) {
                error!(error = %undo, "failed to move client config back after store error");
            }
            return Err(e.into());
        }

        if let Err(e) = self.shared.rename_peer(&peer.public_key, new_name) {
            warn!(error = %e, "could not fix peer name in shared config");
        }

        info!(old = %peer.name, new = new_name, "renamed peer");
        self.record(AuditRecord::peer(
            new_name,
            Action::Rename,
            format!("from {}", peer.name),
        ))
        .await;
        Ok(Outcome::Applied)
    }

    // -- Disable / enable ----------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, id: Uuid) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let peer = self.get(id).await?;
        let outcome = self.disable_locked(&peer, DisableCause::User).await?;
        if outcome != Outcome::Unchanged {
            self.raise_trigger();
        }
        Ok(outcome)
    }

    /// Disable for exceeding the data limit.
    #[tracing::instrument(skip(self))]
    pub async fn quota_exceed(&self, id: Uuid) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let peer = self.get(id).await?;
        let outcome = self.disable_locked(&peer, DisableCause::Quota).await?;
        if outcome != Outcome::Unchanged {
            self.raise_trigger();
        }
        Ok(outcome)
    }

    pub(crate) async fn disable_locked(
        &self,
        peer: &Peer,
        cause: DisableCause,
    ) -> Result<Outcome, GatewayError> {
        if peer.disabled {
            return Ok(Outcome::Unchanged);
        }

        let outcome = self.remove_live(&peer.public_key).await;
        let Some(updated) = self.store.mark_disabled(peer.id, cause).await? else {
            return Ok(Outcome::Unchanged);
        };

        if let Err(e) = self.mirror.set_disabled(&peer.name, true) {
            warn!(name = %peer.name, error = %e, "failed to write disabled marker");
        }
        if let Err(e) = self.shared.remove_peer(&peer.public_key) {
            warn!(name = %peer.name, error = %e, "failed to remove shared config block");
        }

        info!(
            name = %peer.name,
            %cause,
            total_rx = updated.total_rx_bytes,
            total_tx = updated.total_tx_bytes,
            "disabled peer"
        );
        let action = match cause {
            DisableCause::User => Action::Disable,
            DisableCause::Quota => Action::QuotaExceeded,
            DisableCause::Schedule => Action::Schedule,
        };
        self.record(AuditRecord::peer(&peer.name, action, format!("disabled ({cause})")))
            .await;
        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    pub async fn enable(&self, id: Uuid) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let peer = self.get(id).await?;
        let outcome = self.enable_locked(&peer).await?;
        if outcome != Outcome::Unchanged {
            self.raise_trigger();
        }
        Ok(outcome)
    }

    pub(crate) async fn enable_locked(&self, peer: &Peer) -> Result<Outcome, GatewayError> {
        if !peer.disabled {
            return Ok(Outcome::Unchanged);
        }
        let server = peer.server_view().ok_or_else(|| {
            GatewayError::InvalidState(format!("{} has no usable address", peer.name))
        })?;

        let outcome = self.apply_live(&peer.public_key, &server).await;
        if self.store.mark_enabled(peer.id, &server).await?.is_none() {
            return Ok(Outcome::Unchanged);
        }

        if let Err(e) = self.mirror.set_disabled(&peer.name, false) {
            warn!(name = %peer.name, error = %e, "failed to remove disabled marker");
        }
        if let Err(e) = self.shared.upsert_peer(&peer.name, &peer.public_key, &server) {
            warn!(name = %peer.name, error = %e, "failed to restore shared config block");
        }

        info!(name = %peer.name, address = %server, "enabled peer");
        self.record(AuditRecord::peer(&peer.name, Action::Enable, format!("address {server}")))
            .await;
        Ok(outcome)
    }

    // -- Delete / expire -----------------------------------------------------

    /// Delete a peer. Deleting an absent peer succeeds with `Unchanged`.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(peer) = self.store.get_peer(id).await? else {
            info!("peer already absent");
            return Ok(Outcome::Unchanged);
        };
        self.delete_locked(&peer).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_by_name(&self, name: &str) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(peer) = self.store.get_peer_by_name(name).await? else {
            info!("peer already absent");
            return Ok(Outcome::Unchanged);
        };
        self.delete_locked(&peer).await
    }

    async fn delete_locked(&self, peer: &Peer) -> Result<Outcome, GatewayError> {
        let outcome = self.remove_live(&peer.public_key).await;

        if let Err(e) = self.mirror.remove(&peer.name) {
            warn!(name = %peer.name, error = %e, "failed to remove client config files");
        }
        if let Err(e) = self.shared.remove_peer(&peer.public_key) {
            warn!(name = %peer.name, error = %e, "failed to remove shared config block");
        }
        if !self.store.archive_and_delete(peer).await? {
            return Ok(Outcome::Unchanged);
        }
        self.raise_trigger();

        info!(name = %peer.name, "deleted peer");
        self.record(AuditRecord::peer(
            &peer.name,
            Action::Delete,
            format!("rx {} tx {}", peer.lifetime_rx(), peer.lifetime_tx()),
        ))
        .await;
        Ok(outcome)
    }

    /// Remove an expired peer everywhere. Absent peers are not an error.
    #[tracing::instrument(skip(self))]
    pub async fn expire(&self, id: Uuid) -> Result<Outcome, GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(peer) = self.store.get_peer(id).await? else {
            return Ok(Outcome::Unchanged);
        };
        let outcome = self.expire_locked(&peer).await?;
        self.raise_trigger();
        Ok(outcome)
    }

    /// Does not raise the trigger; batch callers raise it once.
    pub(crate) async fn expire_locked(&self, peer: &Peer) -> Result<Outcome, GatewayError> {
        let outcome = self.remove_live(&peer.public_key).await;
        if !self.store.delete_peer(peer.id).await? {
            return Ok(Outcome::Unchanged);
        }
        let samples = self.store.delete_usage_history(peer.id).await?;

        if let Err(e) = self.shared.remove_peer(&peer.public_key) {
            warn!(name = %peer.name, error = %e, "failed to remove shared config block");
        }
        if let Err(e) = self.mirror.remove(&peer.name) {
            warn!(name = %peer.name, error = %e, "failed to remove client config files");
        }

        info!(name = %peer.name, expires_at = ?peer.expires_at, samples, "expired peer");
        self.record(AuditRecord::peer(&peer.name, Action::Expire, "removed after expiry"))
            .await;
        Ok(outcome)
    }

    // -- Limits and schedules ------------------------------------------------

    /// Set the data limit (GiB, 0 for unlimited) and expiry.
    ///
    /// Raising the limit does not re-enable a peer disabled for quota.
    #[tracing::instrument(skip(self))]
    pub async fn update_limits(
        &self,
        id: Uuid,
        data_limit_gb: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Peer, GatewayError> {
        if data_limit_gb < 0 {
            return Err(GatewayError::InvalidState("data limit must not be negative".into()));
        }
        let _lifecycle = self.lifecycle.lock().await;
        let peer = self
            .store
            .update_limits(id, data_limit_gb, expires_at)
            .await?
            .ok_or_else(|| not_found(id))?;

        if let Err(e) = self
            .mirror
            .set_limit(&peer.name, data_limit_gb)
            .and_then(|()| self.mirror.set_expiry(&peer.name, expires_at))
        {
            warn!(name = %peer.name, error = %e, "failed to write limit sidecars");
        }

        self.record(AuditRecord::peer(
            &peer.name,
            Action::UpdateLimits,
            format!("limit {data_limit_gb} GiB, expires {expires_at:?}"),
        ))
        .await;
        Ok(peer)
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_schedule(
        &self,
        id: Uuid,
        schedule: Option<Schedule>,
    ) -> Result<(), GatewayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let peer = self.get(id).await?;
        let detail = match &schedule {
            Some(s) => {
                self.store.set_schedule(id, s).await?;
                format!("{} {:02}-{:02}", s.days_string(), s.start_hour, s.end_hour)
            }
            None => {
                self.store.clear_schedule(id).await?;
                "cleared".to_string()
            }
        };
        self.record(AuditRecord::peer(&peer.name, Action::Schedule, detail))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("laptop" ; "plain")]
    #[test_case("Work_Phone-2" ; "mixed")]
    #[test_case(&"a".repeat(64) ; "max length")]
    fn valid_names(name: &str) {
        assert!(validate_name(name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case(&"a".repeat(65) ; "too long")]
    #[test_case("../etc" ; "path")]
    #[test_case("my laptop" ; "space")]
    #[test_case("laptop.conf" ; "dot")]
    fn invalid_names(name: &str) {
        assert!(matches!(validate_name(name), Err(GatewayError::InvalidName(_))));
    }
}
