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

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::address::{self, Subnet};
use crate::files::FileError;
use crate::mirror::MirrorDir;
use crate::shared::SharedConfig;

/// Every address considered occupied at one point in time.
///
/// Built fresh for each allocation or scan and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    occupied: BTreeSet<Ipv4Addr>,
}

impl Ledger {
    /// Union of store addresses, mirror file addresses and the server address.
    pub fn from_parts(
        store: impl IntoIterator<Item = Ipv4Addr>,
        mirror: impl IntoIterator<Item = Ipv4Addr>,
        server: Ipv4Addr,
    ) -> Self {
        let mut occupied: BTreeSet<_> = store.into_iter().chain(mirror).collect();
        occupied.insert(server);
        Self { occupied }
    }

    /// Gather the ledger from all three sources.
    ///
    /// `store_addresses` are raw `allowed_ips` values as read inside the
    /// caller's transaction. An unreadable shared config falls back to the
    /// subnet gateway for the server address.
    pub fn gather(
        subnet: &Subnet,
        store_addresses: &[String],
        mirror: &MirrorDir,
        shared: &SharedConfig,
    ) -> Result<Self, FileError> {
        let store = store_addresses
            .iter()
            .filter_map(|a| address::parse_host(a))
            .map(|(host, _)| host);
        let files = mirror.scan_addresses()?;
        let server = match shared.interface_address() {
            Ok(Some((host, _))) => host,
            Ok(None) => subnet.gateway(),
            Err(e) => {
                warn!(error = %e, "shared config unreadable, assuming gateway as server address");
                subnet.gateway()
            }
        };
        let ledger = Self::from_parts(store, files, server);
        debug!(occupied = ledger.len(), %server, "gathered address ledger");
        Ok(ledger)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.occupied.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.occupied.iter().copied()
    }
}
