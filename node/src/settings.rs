//! Node configuration file.
//!
//! ```toml
//! metrics_port = 19160
//!
//! [network]
//! socket_ports = { router = 19000, publisher = 19080, webserver = 19160 }
//! external_ip = "203.0.113.7"
//!
//! [genesis]
//! masternodes = ["<vk hex>", "<vk hex>"]
//!
//! [[bootnodes]]
//! vk = "<vk hex>"
//! ip = "203.0.113.8:19000"
//! ```
//!
//! Every section is optional. Types are enforced by the parser, so a port
//! written as `"abc"` or `1.5` is rejected before the node touches a socket.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use thiserror::Error;

use tessera_protocol::config::{
    ConfigError, NetworkConfig, DELEGATES_MEMBERS_KEY, MASTERNODES_MEMBERS_KEY,
};
use tessera_protocol::storage::StateChange;

/// Genesis timestamp shared by every node that does not override it. All
/// members must agree on genesis, so it cannot come from the local clock.
pub const DEFAULT_GENESIS_HLC: &str = "2026-01-01T00:00:00.000000000Z_0";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("bootnode {0} has no address")]
    BootnodeWithoutIp(String),
}

/// A peer to dial at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootnode {
    pub vk: String,
    /// `host` or `host:router_port`.
    pub ip: String,
}

/// Initial committee written into block 0 of an empty database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisSettings {
    pub hlc_timestamp: String,
    pub masternodes: Vec<String>,
    pub delegates: Vec<String>,
}

impl Default for GenesisSettings {
    fn default() -> Self {
        Self {
            hlc_timestamp: DEFAULT_GENESIS_HLC.to_string(),
            masternodes: Vec::new(),
            delegates: Vec::new(),
        }
    }
}

impl GenesisSettings {
    /// State carried by the genesis block.
    pub fn state_changes(&self) -> Vec<StateChange> {
        vec![
            StateChange::new(MASTERNODES_MEMBERS_KEY, json!(self.masternodes)),
            StateChange::new(DELEGATES_MEMBERS_KEY, json!(self.delegates)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Metrics endpoint port. Falls back to the webserver port.
    pub metrics_port: Option<u16>,
    pub network: NetworkConfig,
    pub genesis: GenesisSettings,
    pub bootnodes: Vec<Bootnode>,
}

impl NodeSettings {
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let settings: NodeSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.network.validate()?;
        if let Some(node) = self.bootnodes.iter().find(|b| b.ip.trim().is_empty()) {
            return Err(SettingsError::BootnodeWithoutIp(node.vk.clone()));
        }
        Ok(())
    }

    pub fn metrics_port(&self) -> u16 {
        self.metrics_port
            .unwrap_or(self.network.socket_ports.webserver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_protocol::config::SocketPorts;

    #[test]
    fn empty_file_is_all_defaults() {
        let settings = NodeSettings::from_toml("").unwrap();
        assert_eq!(settings, NodeSettings::default());
        assert_eq!(
            settings.metrics_port(),
            SocketPorts::default().webserver
        );
    }

    #[test]
    fn non_integer_port_is_rejected() {
        let text = r#"
            [network]
            socket_ports = { router = "abc", publisher = 19080, webserver = 19160 }
        "#;
        assert!(matches!(
            NodeSettings::from_toml(text),
            Err(SettingsError::Parse(_))
        ));

        assert!(NodeSettings::from_toml("metrics_port = 1.5").is_err());
    }

    #[test]
    fn colliding_ports_are_rejected() {
        let text = r#"
            [network]
            socket_ports = { router = 19000, publisher = 19000, webserver = 19160 }
        "#;
        assert!(matches!(
            NodeSettings::from_toml(text),
            Err(SettingsError::Invalid(ConfigError::PortCollision(19000)))
        ));
    }

    #[test]
    fn bootnodes_and_genesis_parse() {
        let text = r#"
            metrics_port = 9100

            [genesis]
            masternodes = ["aa", "bb"]

            [[bootnodes]]
            vk = "bb"
            ip = "10.0.0.2:19000"
        "#;
        let settings = NodeSettings::from_toml(text).unwrap();
        assert_eq!(settings.metrics_port(), 9100);
        assert_eq!(settings.bootnodes.len(), 1);
        assert_eq!(settings.genesis.hlc_timestamp, DEFAULT_GENESIS_HLC);

        let genesis = settings.genesis.state_changes();
        assert_eq!(genesis[0].key, MASTERNODES_MEMBERS_KEY);
        assert_eq!(genesis[0].value, json!(["aa", "bb"]));
    }

    #[test]
    fn blank_bootnode_address_is_rejected() {
        let text = r#"
            [[bootnodes]]
            vk = "bb"
            ip = " "
        "#;
        assert!(matches!(
            NodeSettings::from_toml(text),
            Err(SettingsError::BootnodeWithoutIp(vk)) if vk == "bb"
        ));
    }

    #[test]
    fn rendered_template_loads_back() {
        let mut settings = NodeSettings::default();
        settings.network.socket_ports = SocketPorts::from_base(20_000);
        settings.bootnodes.push(Bootnode {
            vk: "cc".into(),
            ip: "127.0.0.1:20000".into(),
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, settings.to_toml().unwrap()).unwrap();

        assert_eq!(NodeSettings::load(&path).unwrap(), settings);
    }
}
