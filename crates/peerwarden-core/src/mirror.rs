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

//! The per-peer client config directory shared with the external admin tool.
//!
//! Layout: `<name>.conf` holds the client's wg-quick config, and optional
//! sidecars `<name>.disabled`, `<name>.limit` and `<name>.expiry` carry state
//! the tool displays.

use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};

use crate::address;
use crate::files::{self, FileError, FileLock};
use crate::wgconf::{Block, ConfFile, SectionKind};

const CONF_EXT: &str = "conf";
const SIDECARS: &[&str] = &["disabled", "limit", "expiry"];
const LOCK_FILE: &str = ".lock";

// ---------------------------------------------------------------------------
// Client config rendering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    pub name: &'a str,
    pub private_key: &'a str,
    /// Client view: host with the subnet prefix.
    pub address: &'a str,
    pub dns: &'a str,
    pub mtu: u32,
    pub server_public_key: Option<&'a str>,
    pub endpoint: Option<&'a str>,
    pub listen_port: u16,
    pub persistent_keepalive: u16,
}

impl ClientConfig<'_> {
    pub fn render(&self) -> String {
        let mut interface = Block::new(SectionKind::Interface);
        interface.set_name(self.name);
        interface.push("PrivateKey", self.private_key);
        interface.push("Address", self.address);
        if !self.dns.is_empty() {
            interface.push("DNS", self.dns);
        }
        interface.push("MTU", &self.mtu.to_string());

        let mut conf = ConfFile {
            blocks: vec![interface],
        };

        if let Some(server_key) = self.server_public_key {
            let mut peer = Block::new(SectionKind::Peer);
            peer.push("PublicKey", server_key);
            if let Some(endpoint) = self.endpoint {
                peer.push("Endpoint", &format!("{endpoint}:{}", self.listen_port));
            }
            peer.push("AllowedIPs", "0.0.0.0/0");
            if self.persistent_keepalive > 0 {
                peer.push("PersistentKeepalive", &self.persistent_keepalive.to_string());
            }
            conf.push_peer(peer);
        }

        conf.render()
    }
}

// ---------------------------------------------------------------------------
// Directory scan results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntry {
    /// File stem, which is the peer name.
    pub name: String,
    pub private_key: Option<String>,
    /// Raw `Address` value as written in the file.
    pub address: Option<String>,
    pub disabled: bool,
    pub limit_gb: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MirrorEntry {
    pub fn host(&self) -> Option<Ipv4Addr> {
        self.address.as_deref().and_then(address::parse_host).map(|(a, _)| a)
    }
}

// ---------------------------------------------------------------------------
// MirrorDir
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MirrorDir {
    root: PathBuf,
    lock_path: PathBuf,
}

impl MirrorDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let lock_path = root.join(LOCK_FILE);
        Self { root, lock_path }
    }

    /// Every mutation holds this for its duration. Never nest it.
    fn lock(&self) -> Result<FileLock, FileError> {
        FileLock::exclusive(&self.lock_path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn conf_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{CONF_EXT}"))
    }

    fn sidecar_path(&self, name: &str, kind: &str) -> PathBuf {
        self.root.join(format!("{name}.{kind}"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.conf_path(name).exists()
    }

    pub fn read(&self, name: &str) -> Result<Option<String>, FileError> {
        files::read_optional(&self.conf_path(name))
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<(), FileError> {
        let _lock = self.lock()?;
        let path = self.conf_path(name);
        files::write_private(&path, contents)?;
        debug!(path = %path.display(), "wrote client config");
        Ok(())
    }

    /// Write a client config only if none exists yet. Returns whether it wrote.
    pub fn write_if_absent(&self, name: &str, contents: &str) -> Result<bool, FileError> {
        let _lock = self.lock()?;
        match files::create_private(&self.conf_path(name), contents) {
            Ok(()) => Ok(true),
            Err(FileError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the config and every sidecar.
    pub fn remove(&self, name: &str) -> Result<(), FileError> {
        let _lock = self.lock()?;
        let mut removed = files::remove_optional(&self.conf_path(name))?;
        for kind in SIDECARS {
            removed |= files::remove_optional(&self.sidecar_path(name, kind))?;
        }
        if removed {
            info!(name, "removed client config files");
        }
        Ok(())
    }

    /// Move the config and its sidecars to a new name.
    ///
    /// Fails without touching anything if the target config already exists.
    /// A partial failure moves the already-renamed files back.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), FileError> {
        let _lock = self.lock()?;
        let target = self.conf_path(new);
        if target.exists() {
            return Err(FileError::AlreadyExists(target));
        }

        let mut pairs = vec![(self.conf_path(old), target)];
        pairs.extend(
            SIDECARS
                .iter()
                .map(|kind| (self.sidecar_path(old, kind), self.sidecar_path(new, kind))),
        );

        let mut done: Vec<(&PathBuf, &PathBuf)> = Vec::new();
        for (from, to) in &pairs {
            if !from.exists() {
                continue;
            }
            if let Err(e) = fs::rename(from, to) {
                for (f, t) in done.iter().rev() {
                    if let Err(undo) = fs::rename(t, f) {
                        warn!(from = %t.display(), error = %undo, "failed to undo rename");
                    }
                }
                return Err(FileError::io(from, e));
            }
            done.push((from, to));
        }
        info!(old, new, "renamed client config files");
        Ok(())
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) -> Result<(), FileError> {
        let path = self.sidecar_path(name, "disabled");
        let _lock = self.lock()?;
        if disabled {
            files::write_private(&path, "")
        } else {
            files::remove_optional(&path).map(|_| ())
        }
    }

    pub fn set_limit(&self, name: &str, limit_gb: i64) -> Result<(), FileError> {
        let path = self.sidecar_path(name, "limit");
        let _lock = self.lock()?;
        if limit_gb > 0 {
            files::write_private(&path, &format!("{limit_gb}\n"))
        } else {
            files::remove_optional(&path).map(|_| ())
        }
    }

    pub fn set_expiry(&self, name: &str, expires_at: Option<DateTime<Utc>>) -> Result<(), FileError> {
        let path = self.sidecar_path(name, "expiry");
        let _lock = self.lock()?;
        match expires_at {
            Some(at) => files::write_private(&path, &format!("{}\n", at.to_rfc3339())),
            None => files::remove_optional(&path).map(|_| ()),
        }
    }

    /// Rewrite the `Address` line of an existing config in place.
    pub fn set_address(&self, name: &str, client_view: &str) -> Result<bool, FileError> {
        let _lock = self.lock()?;
        let path = self.conf_path(name);
        let Some(text) = files::read_optional(&path)? else {
            return Ok(false);
        };
        let mut conf = ConfFile::parse(&text);
        let Some(interface) = conf.interface_mut() else {
            return Ok(false);
        };
        if interface.get("Address") == Some(client_view) {
            return Ok(false);
        }
        interface.set("Address", client_view);
        files::write_private(&path, &conf.render())?;
        debug!(path = %path.display(), "rewrote client config address");
        Ok(true)
    }

    fn conf_files(&self) -> Result<Vec<(String, PathBuf)>, FileError> {
        let dir = match fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FileError::io(&self.root, e)),
        };
        let mut out = Vec::new();
        for entry in dir {
            let entry = entry.map_err(|e| FileError::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONF_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            out.push((stem.to_string(), path));
        }
        out.sort();
        Ok(out)
    }

    /// Parse every client config in the directory.
    ///
    /// Unreadable files are skipped with a warning rather than failing the
    /// whole scan, since the directory is written by other tools.
    pub fn scan(&self) -> Result<Vec<MirrorEntry>, FileError> {
        let mut entries = Vec::new();
        for (name, path) in self.conf_files()? {
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable client config");
                    continue;
                }
            };
            let conf = ConfFile::parse(&text);
            let interface = conf.interface();
            let private_key = interface.and_then(|i| i.get("PrivateKey")).map(str::to_string);
            let address = interface.and_then(|i| i.get("Address")).map(str::to_string);

            let disabled = self.sidecar_path(&name, "disabled").exists();
            let limit_gb = files::read_optional(&self.sidecar_path(&name, "limit"))?
                .and_then(|s| s.trim().parse().ok());
            let expires_at = files::read_optional(&self.sidecar_path(&name, "expiry"))?
                .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
                .map(|dt| dt.with_timezone(&Utc));

            entries.push(MirrorEntry {
                name,
                private_key,
                address,
                disabled,
                limit_gb,
                expires_at,
            });
        }
        Ok(entries)
    }

    /// Every host address claimed by an `Address =` line in the directory.
    pub fn scan_addresses(&self) -> Result<Vec<Ipv4Addr>, FileError> {
        Ok(self.scan()?.iter().filter_map(MirrorEntry::host).collect())
    }

    /// A gzip-compressed tar of every client config, named by file.
    pub fn export_archive(&self) -> Result<Vec<u8>, FileError> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let confs = self.conf_files()?;
        for (_, path) in &confs {
            let Some(file_name) = path.file_name() else {
                continue;
            };
            builder
                .append_path_with_name(path, file_name)
                .map_err(|e| FileError::io(path, e))?;
        }
        let encoder = builder
            .into_inner()
            .map_err(|e| FileError::io(&self.root, e))?;
        let bytes = encoder.finish().map_err(|e| FileError::io(&self.root, e))?;
        info!(file_count = confs.len(), bytes = bytes.len(), "exported client configs");
        Ok(bytes)
    }
}
