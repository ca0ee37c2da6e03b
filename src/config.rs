use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "cachefleet.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub database_path: Option<PathBuf>,
    pub ssh: SshSettings,
    pub directory: DirectorySettings,
    pub paths: PathSettings,
    pub cluster: ClusterSettings,
    pub proxy: ProxySettings,
}

impl ConsoleConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            ProvisionError::Config(format!("Failed to read `{}`: {error}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|error| ProvisionError::Config(error.to_string()))
    }

    /// Configured database file, or `~/.cachefleet/cachefleet.sqlite`. The
    /// parent directory is created when missing.
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        let path = match &self.database_path {
            Some(path) => path.clone(),
            None => {
                let home = std::env::var_os("HOME").ok_or_else(|| {
                    ProvisionError::Config(
                        "HOME is not set; configure database_path explicitly".to_string(),
                    )
                })?;
                PathBuf::from(home).join(".cachefleet").join("cachefleet.sqlite")
            }
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| {
                ProvisionError::Config(format!(
                    "Failed to create data directory `{}`: {error}",
                    parent.display()
                ))
            })?;
        }
        Ok(path)
    }

    /// Values that must never show up in progress records.
    pub fn secrets(&self) -> Vec<String> {
        [
            self.ssh.password.clone(),
            self.ssh.passphrase.clone(),
            self.directory.password.clone(),
        ]
        .into_iter()
        .flatten()
        .filter(|value| !value.trim().is_empty())
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub port: u16,
    pub private_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            private_key_path: None,
            passphrase: None,
            password: None,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub port: u16,
    pub tls: bool,
    pub bind_dn: String,
    pub base_dn: String,
    pub attribute: String,
    /// Used for hosts that carry no directory password of their own.
    pub password: Option<String>,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            port: 1636,
            tls: true,
            bind_dn: "cn=directory manager,o=gluu".to_string(),
            base_dn: "ou=appliances,o=gluu".to_string(),
            attribute: "oxCacheConfiguration".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub container_version: String,
    pub container_root: String,
    pub setup_properties: String,
    pub template_dir: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            container_version: "3.1.1".to_string(),
            container_root: "/opt/gluu-server-{version}".to_string(),
            setup_properties: "install/community-edition-setup/setup.properties.last".to_string(),
            template_dir: None,
        }
    }
}

impl PathSettings {
    pub fn container_root(&self) -> String {
        self.container_root
            .replace("{version}", &self.container_version)
    }

    pub fn setup_properties_path(&self) -> String {
        format!(
            "{}/{}",
            self.container_root().trim_end_matches('/'),
            self.setup_properties.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub master_port: u16,
    pub replica_port: u16,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            master_port: 7000,
            replica_port: 7001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen_port: u16,
    pub tunnel_port: u16,
    pub hash: String,
    pub distribution: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_port: 22122,
            tunnel_port: 8888,
            hash: "fnv1a_64".to_string(),
            distribution: "ketama".to_string(),
        }
    }
}
