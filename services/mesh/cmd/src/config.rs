//! Configuration handling for the mesh binary.
//!
//! Settings come from a YAML file with a `node` section (addresses and
//! identity) and a `mesh` section (protocol tuning), then from `MESH_*`
//! environment variables, then from command-line flags.

use anyhow::{Context, Result};
use mesh_node::MeshConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Binary configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to accept neighbor connections on
    pub listen: Option<SocketAddr>,
    /// Neighbors to dial at startup
    pub connect: Vec<SocketAddr>,
    /// Passphrase the identity key is derived from; random when unset
    pub identity_seed: Option<String>,
    /// Outbound frames buffered per neighbor link
    pub link_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: None,
            connect: Vec::new(),
            identity_seed: None,
            link_buffer: 256,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RootConfig {
    node: Option<NodeConfig>,
    mesh: Option<MeshConfig>,
}

/// Everything the binary needs to start a node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub node: NodeConfig,
    pub mesh: MeshConfig,
}

impl Settings {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut settings = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                settings.apply_root_config(root);
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings
            .mesh
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid mesh configuration: {}", e))?;
        if settings.node.link_buffer == 0 {
            anyhow::bail!("Invalid node configuration: link_buffer must be non-zero");
        }

        info!(
            "Final configuration: listen={:?}, connect={:?}, max_ttl={}, fragment_threshold={}",
            settings.node.listen,
            settings.node.connect,
            settings.mesh.max_ttl,
            settings.mesh.fragment_threshold
        );
        Ok(settings)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if let Some(node) = root.node {
            self.node = node;
        }
        if let Some(mesh) = root.mesh {
            self.mesh = mesh;
        }
    }

    /// Apply `MESH_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup("MESH_LISTEN") {
            self.node.listen = Some(
                listen
                    .parse()
                    .with_context(|| format!("Invalid MESH_LISTEN: {}", listen))?,
            );
            info!("Listen address overridden by environment: {}", listen);
        }

        if let Some(connect) = lookup("MESH_CONNECT") {
            self.node.connect = connect
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .with_context(|| format!("Invalid MESH_CONNECT entry: {}", s))
                })
                .collect::<Result<_>>()?;
            info!("Neighbor list overridden by environment: {:?}", self.node.connect);
        }

        if let Some(seed) = lookup("MESH_IDENTITY_SEED") {
            self.node.identity_seed = Some(seed);
            info!("Identity seed overridden by environment");
        }

        if let Some(max_ttl) = lookup("MESH_MAX_TTL") {
            self.mesh.max_ttl = max_ttl
                .parse()
                .with_context(|| format!("Invalid MESH_MAX_TTL: {}", max_ttl))?;
            info!("Max TTL overridden by environment: {}", self.mesh.max_ttl);
        }

        if let Some(sign) = lookup("MESH_SIGN_BROADCASTS") {
            self.mesh.sign_broadcasts = sign.to_lowercase() == "true";
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let settings = Settings::default();
        assert_eq!(settings.node.listen, None);
        assert!(settings.node.connect.is_empty());
        assert_eq!(settings.node.link_buffer, 256);
        assert_eq!(settings.mesh, MeshConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
node:
  listen: 0.0.0.0:9000
  connect:
    - 10.0.0.2:9000
    - 10.0.0.3:9000
  identity_seed: field-unit-7

mesh:
  max_ttl: 5
  queue_retention: 6h
  sign_broadcasts: false
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let settings = Settings::load_from_file(temp_file.path()).unwrap();

        assert_eq!(settings.node.listen, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(settings.node.connect.len(), 2);
        assert_eq!(settings.node.identity_seed.as_deref(), Some("field-unit-7"));
        assert_eq!(settings.node.link_buffer, 256);
        assert_eq!(settings.mesh.max_ttl, 5);
        assert_eq!(settings.mesh.queue_retention, Duration::from_secs(6 * 60 * 60));
        assert!(!settings.mesh.sign_broadcasts);
        assert_eq!(settings.mesh.fragment_threshold, 512);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from_file("/nonexistent/mesh.yaml").unwrap();
        assert_eq!(settings.mesh.max_ttl, MeshConfig::default().max_ttl);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"mesh:\n  max_ttl: 0\n").unwrap();
        assert!(Settings::load_from_file(temp_file.path()).is_err());

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"node: 42\n").unwrap();
        assert!(Settings::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_LISTEN", "127.0.0.1:7000"),
            ("MESH_CONNECT", "127.0.0.1:7001, 127.0.0.1:7002"),
            ("MESH_MAX_TTL", "3"),
            ("MESH_SIGN_BROADCASTS", "FALSE"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.node.listen, Some("127.0.0.1:7000".parse().unwrap()));
        assert_eq!(settings.node.connect.len(), 2);
        assert_eq!(settings.mesh.max_ttl, 3);
        assert!(!settings.mesh.sign_broadcasts);

        let mut settings = Settings::default();
        let bad = settings.apply_overrides(|key| {
            (key == "MESH_LISTEN").then(|| "not-an-address".to_string())
        });
        assert!(bad.is_err());
    }
}
