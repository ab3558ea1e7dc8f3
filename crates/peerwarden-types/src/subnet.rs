//! Subnet presets and the subnet description handed to collaborators.

use serde::{Deserialize, Serialize};

/// A named, fixed subnet choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubnetPreset {
    /// Preset name as accepted by the configure operation.
    pub name: &'static str,
    /// The CIDR the preset maps to.
    pub cidr: &'static str,
}

/// Presets offered for subnet configuration, smallest first.
pub const PRESETS: &[SubnetPreset] = &[
    SubnetPreset { name: "small", cidr: "10.100.0.0/24" },
    SubnetPreset { name: "medium", cidr: "10.100.0.0/22" },
    SubnetPreset { name: "large", cidr: "10.100.0.0/20" },
    SubnetPreset { name: "xlarge", cidr: "10.100.0.0/16" },
];

/// Preset name recorded when the active subnet matches no preset.
pub const CUSTOM_PRESET: &str = "custom";

/// Look up a preset by name.
pub fn preset(name: &str) -> Option<&'static SubnetPreset> {
    PRESETS.iter().find(|p| p.name == name)
}

/// Find the preset whose prefix length equals `prefix`.
pub fn preset_for_prefix(prefix: u8) -> Option<&'static SubnetPreset> {
    PRESETS.iter().find(|p| {
        p.cidr
            .rsplit_once('/')
            .and_then(|(_, len)| len.parse::<u8>().ok())
            == Some(prefix)
    })
}

/// Requested subnet change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SubnetChoice {
    /// One of [`PRESETS`] by name.
    Preset(String),
    /// An arbitrary private CIDR.
    Custom(String),
}

/// The active subnet and its derived ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetInfo {
    /// Network CIDR, e.g. `10.100.0.0/24`.
    pub cidr: String,
    /// Preset name, or `custom`.
    pub preset: String,
    /// Host-addressable count (network and broadcast excluded).
    pub capacity: u32,
    /// Gateway and server address.
    pub gateway: String,
    /// First address handed to peers.
    pub first_peer: String,
    /// Last usable address.
    pub last_usable: String,
    /// Peers currently holding an address.
    pub peer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("small", Some("10.100.0.0/24") ; "small preset")]
    #[test_case("xlarge", Some("10.100.0.0/16") ; "xlarge preset")]
    #[test_case("huge", None ; "unknown preset")]
    fn lookup_preset(name: &str, expected: Option<&str>) {
        assert_eq!(preset(name).map(|p| p.cidr), expected);
    }

    #[test_case(22, Some("medium") ; "mask matches medium")]
    #[test_case(25, None ; "mask matches nothing")]
    fn lookup_by_prefix(prefix: u8, expected: Option<&str>) {
        assert_eq!(preset_for_prefix(prefix).map(|p| p.name), expected);
    }
}
