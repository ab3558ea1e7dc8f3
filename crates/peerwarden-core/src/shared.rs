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

//! The interface config file consumed by the kernel interface and the
//! host-side reconciler, and also edited by the external admin tool.
//!
//! Every read-modify-write holds the sibling `.lock` file exclusively for its
//! full duration; reads take it shared.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::address;
use crate::files::{self, FileError, FileLock, lock_path_for};
use crate::wgconf::{Block, ConfFile, SectionKind};

/// A `[Peer]` block as found in the shared config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedPeer {
    pub name: Option<String>,
    pub public_key: String,
    pub allowed_ips: Option<String>,
}

impl SharedPeer {
    pub fn host(&self) -> Option<Ipv4Addr> {
        self.allowed_ips
            .as_deref()
            .and_then(address::parse_host)
            .map(|(a, _)| a)
    }
}

/// Values written into a freshly bootstrapped `[Interface]` section.
#[derive(Debug, Clone)]
pub struct InterfaceSeed<'a> {
    pub address: &'a str,
    pub listen_port: u16,
    pub private_key: &'a str,
    pub mtu: u32,
}

#[derive(Debug, Clone)]
pub struct SharedConfig {
    path: PathBuf,
    lock_path: PathBuf,
}

impl SharedConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Option<ConfFile>, FileError> {
        Ok(files::read_optional(&self.path)?.map(|text| ConfFile::parse(&text)))
    }

    /// Snapshot of the file, or `None` if it does not exist.
    pub fn read(&self) -> Result<Option<ConfFile>, FileError> {
        let _lock = FileLock::shared(&self.lock_path)?;
        self.load()
    }

    /// Run `f` against the parsed file under the exclusive lock and write the
    /// result back if `f` reports a change.
    fn modify<T>(
        &self,
        f: impl FnOnce(&mut ConfFile) -> (bool, T),
    ) -> Result<T, FileError> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut conf = self.load()?.unwrap_or_default();
        let (changed, out) = f(&mut conf);
        if changed {
            files::write_private(&self.path, &conf.render())?;
            debug!(path = %self.path.display(), "rewrote shared interface config");
        }
        Ok(out)
    }

    /// The `[Interface] Address` as host and prefix.
    pub fn interface_address(&self) -> Result<Option<(Ipv4Addr, u8)>, FileError> {
        Ok(self.read()?.and_then(|conf| {
            conf.interface()
                .and_then(|i| i.get("Address"))
                .and_then(address::parse_host)
        }))
    }

    pub fn server_private_key(&self) -> Result<Option<String>, FileError> {
        Ok(self.read()?.and_then(|conf| {
            conf.interface()
                .and_then(|i| i.get("PrivateKey"))
                .map(str::to_string)
        }))
    }

    pub fn peers(&self) -> Result<Vec<SharedPeer>, FileError> {
        let Some(conf) = self.read()? else {
            return Ok(Vec::new());
        };
        Ok(conf
            .peers()
            .filter_map(|b| {
                let public_key = b.get("PublicKey")?.to_string();
                Some(SharedPeer {
                    name: b.name().map(str::to_string),
                    public_key,
                    allowed_ips: b.get("AllowedIPs").map(str::to_string),
                })
            })
            .collect())
    }

    /// Write an `[Interface]` section if the file does not exist yet.
    pub fn bootstrap(&self, seed: &InterfaceSeed<'_>) -> Result<bool, FileError> {
        self.modify(|conf| {
            if conf.interface().is_some() {
                return (false, false);
            }
            let mut interface = Block::new(SectionKind::Interface);
            interface.push("Address", seed.address);
            interface.push("ListenPort", &seed.listen_port.to_string());
            interface.push("PrivateKey", seed.private_key);
            interface.push("MTU", &seed.mtu.to_string());
            conf.blocks.insert(0, interface);
            info!(address = seed.address, "bootstrapped shared interface config");
            (true, true)
        })
    }

    /// Add or replace the block for `public_key`. `allowed_ips` must be the
    /// server view.
    pub fn upsert_peer(
        &self,
        name: &str,
        public_key: &str,
        allowed_ips: &str,
    ) -> Result<(), FileError> {
        self.modify(|conf| {
            if let Some(block) = conf.peer_mut(public_key) {
                let unchanged =
                    block.name() == Some(name) && block.get("AllowedIPs") == Some(allowed_ips);
                if unchanged {
                    return (false, ());
                }
                block.set_name(name);
                block.set("AllowedIPs", allowed_ips);
                return (true, ());
            }
            let mut block = Block::new(SectionKind::Peer);
            block.set_name(name);
            block.push("PublicKey", public_key);
            block.push("AllowedIPs", allowed_ips);
            conf.push_peer(block);
            (true, ())
        })?;
        info!(name, allowed_ips, "wrote peer block to shared config");
        Ok(())
    }

    /// Remove the block for `public_key`. Returns whether one was present.
    pub fn remove_peer(&self, public_key: &str) -> Result<bool, FileError> {
        let removed = self.modify(|conf| {
            let removed = conf.remove_peer(public_key);
            (removed, removed)
        })?;
        if removed {
            info!(public_key, "removed peer block from shared config");
        }
        Ok(removed)
    }

    /// Fix the `# name` comment of a peer block.
    pub fn rename_peer(&self, public_key: &str, name: &str) -> Result<bool, FileError> {
        self.modify(|conf| match conf.peer_mut(public_key) {
            Some(block) if block.name() != Some(name) => {
                block.set_name(name);
                (true, true)
            }
            Some(_) => (false, false),
            None => {
                warn!(public_key, "no shared config block to rename");
                (false, false)
            }
        })
    }

    pub fn set_interface_address(&self, value: &str) -> Result<bool, FileError> {
        self.modify(|conf| match conf.interface_mut() {
            Some(interface) if interface.get("Address") != Some(value) => {
                interface.set("Address", value);
                (true, true)
            }
            _ => (false, false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (tempfile::TempDir, SharedConfig) {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedConfig::new(dir.path().join("wg0.conf"));
        shared
            .bootstrap(&InterfaceSeed {
                address: "10.100.0.1/24",
                listen_port: 51820,
                private_key: "c2VydmVy",
                mtu: 1380,
            })
            .unwrap();
        (dir, shared)
    }

    #[test]
    fn bootstrap_only_once() {
        let (_dir, shared) = seeded();
        let again = shared
            .bootstrap(&InterfaceSeed {
                address: "10.200.0.1/24",
                listen_port: 1,
                private_key: "x",
                mtu: 1,
            })
            .unwrap();
        assert!(!again);
        assert_eq!(
            shared.interface_address().unwrap(),
            Some((Ipv4Addr::new(10, 100, 0, 1), 24))
        );
        assert_eq!(shared.server_private_key().unwrap().as_deref(), Some("c2VydmVy"));
    }

    #[test]
    fn upsert_then_remove() {
        let (_dir, shared) = seeded();
        shared.upsert_peer("laptop", "AAA=", "10.100.0.2/32").unwrap();
        shared.upsert_peer("laptop", "AAA=", "10.100.0.2/32").unwrap();
        shared.upsert_peer("phone", "BBB=", "10.100.0.3/32").unwrap();

        let peers = shared.peers().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name.as_deref(), Some("laptop"));
        assert_eq!(peers[0].host(), Some(Ipv4Addr::new(10, 100, 0, 2)));

        assert!(shared.remove_peer("AAA=").unwrap());
        assert!(!shared.remove_peer("AAA=").unwrap());
        let peers = shared.peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].public_key, "BBB=");
    }

    #[test]
    fn rename_fixes_comment() {
        let (_dir, shared) = seeded();
        shared.upsert_peer("laptop", "AAA=", "10.100.0.2/32").unwrap();
        assert!(shared.rename_peer("AAA=", "work").unwrap());
        assert!(!shared.rename_peer("AAA=", "work").unwrap());
        assert!(!shared.rename_peer("ZZZ=", "work").unwrap());
        assert_eq!(shared.peers().unwrap()[0].name.as_deref(), Some("work"));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let shared = SharedConfig::new(dir.path().join("wg0.conf"));
        assert!(shared.peers().unwrap().is_empty());
        assert_eq!(shared.interface_address().unwrap(), None);
        assert!(!shared.remove_peer("AAA=").unwrap());
        assert!(!dir.path().join("wg0.conf").exists());
    }

    #[test]
    fn interface_address_update() {
        let (_dir, shared) = seeded();
        assert!(shared.set_interface_address("10.100.0.1/22").unwrap());
        assert_eq!(
            shared.interface_address().unwrap(),
            Some((Ipv4Addr::new(10, 100, 0, 1), 22))
        );
    }
}
