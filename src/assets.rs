//! Remote targets a tunnel can be created for.
//!
//! Assets are declared in the configuration file (`[[assets]]`) and are
//! read-only at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Remote-access protocols guacd can speak.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rdp,
    Vnc,
    Ssh,
    Telnet,
    Kubernetes,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rdp => "rdp",
            Self::Vnc => "vnc",
            Self::Ssh => "ssh",
            Self::Telnet => "telnet",
            Self::Kubernetes => "kubernetes",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Rdp => 3389,
            Self::Vnc => 5900,
            Self::Ssh => 22,
            Self::Telnet => 23,
            Self::Kubernetes => 8080,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote target with its connection credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub hostname: String,
    /// Defaults to the protocol's well-known port.
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Inactive assets cannot get new tunnels.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Extra guacd parameters for this target (e.g. `security = "nla"`).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

fn default_active() -> bool {
    true
}

impl Asset {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Lookup table of configured assets. Cheap to clone.
#[derive(Clone, Default)]
pub struct AssetCatalog {
    assets: Arc<HashMap<String, Asset>>,
}

impl AssetCatalog {
    pub fn new(assets: impl IntoIterator<Item = Asset>) -> Self {
        Self {
            assets: Arc::new(assets.into_iter().map(|a| (a.id.clone(), a)).collect()),
        }
    }

    pub fn get(&self, asset_id: &str) -> Option<&Asset> {
        self.assets.get(asset_id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Assets sorted by id.
    pub fn list(&self) -> Vec<&Asset> {
        let mut assets: Vec<&Asset> = self.assets.values().collect();
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        assets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_defaults_from_toml() {
        let asset: Asset = toml::from_str(
            r#"
            id = "web-1"
            protocol = "ssh"
            hostname = "10.0.0.5"
            "#,
        )
        .unwrap();
        assert_eq!(asset.port(), 22);
        assert!(asset.active);
        assert_eq!(asset.display_name(), "web-1");
        assert!(asset.parameters.is_empty());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let parsed: Result<Asset, _> = toml::from_str(
            r#"
            id = "x"
            protocol = "ftp"
            hostname = "h"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = AssetCatalog::new([Asset {
            id: "db".into(),
            name: "Database".into(),
            protocol: Protocol::Rdp,
            hostname: "10.0.0.9".into(),
            port: Some(3390),
            username: String::new(),
            password: String::new(),
            active: false,
            parameters: HashMap::new(),
        }]);
        let asset = catalog.get("db").unwrap();
        assert_eq!(asset.port(), 3390);
        assert_eq!(asset.display_name(), "Database");
        assert!(catalog.get("missing").is_none());
        assert_eq!(catalog.len(), 1);
        assert!(!catalog.is_empty());
        assert!(AssetCatalog::default().is_empty());
    }

    #[test]
    fn test_catalog_lists_by_id() {
        let asset = |id: &str| -> Asset {
            toml::from_str(&format!("id = \"{id}\"\nprotocol = \"ssh\"\nhostname = \"h\"")).unwrap()
        };
        let catalog = AssetCatalog::new([asset("web"), asset("app"), asset("db")]);
        let ids: Vec<&str> = catalog.list().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["app", "db", "web"]);
    }
}
