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

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use peerwarden_types::Outcome;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::{DEFAULT_SUBNET, FALLBACK_PREFIX, Subnet};
use crate::audit::{AuditRecord, AuditSink};
use crate::config::GatewayConfig;
use crate::db::PeerStore;
use crate::error::GatewayError;
use crate::keys::{self, KeyCipher};
use crate::live::LiveInterface;
use crate::mirror::{ClientConfig, MirrorDir};
use crate::shared::{InterfaceSeed, SharedConfig};
use crate::trigger::Trigger;

pub const SUBNET_SETTING: &str = "subnet_cidr";
pub const PRESET_SETTING: &str = "subnet_preset";

/// Everything a lifecycle transition touches, constructed once at startup.
///
/// Two in-process locks serialize mutations. `lifecycle` is taken first by
/// every API-driven or scheduled mutation; `allocation` is taken inside it
/// around ledger reads and inserts. Never take them in the other order.
pub struct Gateway<L> {
    pub(crate) config: GatewayConfig,
    pub(crate) store: PeerStore,
    pub(crate) cipher: Arc<dyn KeyCipher>,
    pub(crate) live: L,
    pub(crate) mirror: MirrorDir,
    pub(crate) shared: SharedConfig,
    pub(crate) trigger: Trigger,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) lifecycle: Mutex<()>,
    pub(crate) allocation: Mutex<()>,
    pub(crate) last_reconcile: Mutex<Option<Instant>>,
    server_public_key: OnceLock<String>,
}

impl<L: LiveInterface> Gateway<L> {
    pub fn new(
        config: GatewayConfig,
        store: PeerStore,
        cipher: Arc<dyn KeyCipher>,
        live: L,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let mirror = MirrorDir::new(&config.mirror_dir);
        let shared = SharedConfig::new(&config.shared_config_path);
        let trigger = Trigger::new(&config.trigger_path);
        Self {
            config,
            store,
            cipher,
            live,
            mirror,
            shared,
            trigger,
            audit,
            lifecycle: Mutex::new(()),
            allocation: Mutex::new(()),
            last_reconcile: Mutex::new(None),
            server_public_key: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &PeerStore {
        &self.store
    }

    pub fn mirror(&self) -> &MirrorDir {
        &self.mirror
    }

    pub fn shared(&self) -> &SharedConfig {
        &self.shared
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn live(&self) -> &L {
        &self.live
    }

    // -- Configured values ---------------------------------------------------

    /// The active subnet: stored setting, then the config file, then the
    /// built-in default. An unusable stored setting yields a /24 on the
    /// configured network.
    pub async fn subnet(&self) -> Result<Subnet, GatewayError> {
        let configured = match Subnet::from_configured(&self.config.subnet) {
            Ok(subnet) => subnet,
            Err(e) => {
                warn!(value = %self.config.subnet, error = %e, "configured subnet unusable, using default");
                Subnet::parse(DEFAULT_SUBNET).map_err(GatewayError::InvalidCidr)?
            }
        };
        let Some(stored) = self.store.get_setting(SUBNET_SETTING).await? else {
            return Ok(configured);
        };
        match Subnet::from_configured(&stored) {
            Ok(subnet) => Ok(subnet),
            Err(e) => {
                warn!(value = %stored, error = %e, "ignoring unusable stored subnet");
                Subnet::from_parts(configured.network(), FALLBACK_PREFIX)
                    .map_err(GatewayError::InvalidCidr)
            }
        }
    }

    /// The interface's public key, derived from the shared config once found.
    pub fn server_public_key(&self) -> Option<String> {
        if let Some(key) = self.server_public_key.get() {
            return Some(key.clone());
        }
        let private = match self.shared.server_private_key() {
            Ok(Some(k)) => k,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "could not read server key from shared config");
                return None;
            }
        };
        match keys::public_from_private(&private) {
            Ok(public) => Some(self.server_public_key.get_or_init(|| public).clone()),
            Err(e) => {
                warn!(error = %e, "shared config holds an unusable server key");
                None
            }
        }
    }

    /// Write the `[Interface]` section if the shared config has none yet.
    #[tracing::instrument(skip(self))]
    pub async fn bootstrap_interface(&self) -> Result<bool, GatewayError> {
        let subnet = self.subnet().await?;
        let pair = keys::generate();
        let address = format!("{}/{}", subnet.gateway(), subnet.prefix());
        let created = self.shared.bootstrap(&InterfaceSeed {
            address: &address,
            listen_port: self.config.listen_port,
            private_key: &pair.private_key,
            mtu: self.config.server_mtu,
        })?;
        if created {
            info!(%address, "initialised interface config with a new server key");
        }
        Ok(created)
    }

    // -- Side-effect helpers -------------------------------------------------

    pub(crate) fn render_client_config(
        &self,
        name: &str,
        private_key: &str,
        client_view: &str,
    ) -> String {
        let server_key = self.server_public_key();
        ClientConfig {
            name,
            private_key,
            address: client_view,
            dns: &self.config.dns,
            mtu: self.config.mtu,
            server_public_key: server_key.as_deref(),
            endpoint: self.config.endpoint.as_deref(),
            listen_port: self.config.listen_port,
            persistent_keepalive: self.config.persistent_keepalive,
        }
        .render()
    }

    /// Route a peer; a failure defers to the host-side reconciler.
    pub(crate) async fn apply_live(&self, public_key: &str, allowed_ips: &str) -> Outcome {
        match self.live.apply(public_key, allowed_ips).await {
            Ok(()) => Outcome::Applied,
            Err(e) => {
                warn!(public_key, allowed_ips, error = %e, "live interface update failed, deferring to trigger");
                Outcome::Deferred
            }
        }
    }

    pub(crate) async fn remove_live(&self, public_key: &str) -> Outcome {
        match self.live.remove(public_key).await {
            Ok(()) => Outcome::Applied,
            Err(e) => {
                warn!(public_key, error = %e, "live interface removal failed, deferring to trigger");
                Outcome::Deferred
            }
        }
    }

    pub(crate) fn raise_trigger(&self) {
        if let Err(e) = self.trigger.raise() {
            warn!(error = %e, "failed to raise reconciliation trigger");
        } else {
            debug!("reconciliation trigger raised");
        }
    }

    pub(crate) async fn record(&self, record: AuditRecord<'_>) {
        self.audit.record(record).await;
    }
}
