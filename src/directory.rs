use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::DirectorySettings;
use crate::error::{ProvisionError, Result};
use crate::models::{CacheMethodReport, ConnectionTarget, Host};
use crate::progress::{LogLevel, RunContext};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedisProviderType {
    Sharded,
    Standalone,
    Cluster,
}

impl RedisProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sharded => "SHARDED",
            Self::Standalone => "STANDALONE",
            Self::Cluster => "CLUSTER",
        }
    }
}

/// The cache configuration JSON stored in a single directory attribute.
///
/// Fields this crate does not manage are carried through untouched so that
/// writing the entry back does not drop them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfigurationEntry {
    pub cache_provider_type: String,
    #[serde(default)]
    pub redis_configuration: RedisConfiguration,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_provider_type: Option<RedisProviderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl CacheConfigurationEntry {
    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|error| {
            ProvisionError::ConfigStore {
                host: String::new(),
                message: format!("Malformed cache configuration: {error}"),
            }
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|error| ProvisionError::ConfigStore {
            host: String::new(),
            message: format!("Failed to serialize cache configuration: {error}"),
        })
    }

    /// Switch the entry to Redis with the given provider. `None` removes the
    /// server list.
    pub fn apply(&mut self, provider: RedisProviderType, servers: Option<String>) {
        self.cache_provider_type = "REDIS".to_string();
        self.redis_configuration.redis_provider_type = Some(provider);
        self.redis_configuration.servers = servers;
    }

    pub fn method_label(&self) -> String {
        match (
            self.cache_provider_type.as_str(),
            self.redis_configuration.redis_provider_type,
        ) {
            ("REDIS", Some(provider)) => format!("REDIS - {}", provider.as_str()),
            (other, _) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEndpoint {
    pub port: u16,
    pub tls: bool,
    pub bind_dn: String,
    pub base_dn: String,
    pub password: String,
}

impl DirectoryEndpoint {
    pub fn for_host(host: &Host, settings: &DirectorySettings) -> Result<Self> {
        let password = host
            .directory_password
            .clone()
            .or_else(|| settings.password.clone())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ProvisionError::config_store(&host.hostname, "No directory password configured")
            })?;

        Ok(Self {
            port: settings.port,
            tls: settings.tls,
            bind_dn: settings.bind_dn.clone(),
            base_dn: settings.base_dn.clone(),
            password,
        })
    }

    pub fn url(&self, address: &str) -> String {
        let scheme = if self.tls { "ldaps" } else { "ldap" };
        format!("{scheme}://{address}:{}", self.port)
    }
}

pub trait DirectoryConfigStore {
    fn read_attribute(&mut self, name: &str) -> Result<String>;

    fn write_attribute(&mut self, name: &str, value: &str) -> Result<bool>;
}

pub trait DirectoryConnector: Send + Sync {
    fn connect(
        &self,
        target: &ConnectionTarget,
        endpoint: &DirectoryEndpoint,
    ) -> Result<Box<dyn DirectoryConfigStore>>;
}

pub fn read_cache_configuration(
    store: &mut dyn DirectoryConfigStore,
    attribute: &str,
) -> Result<CacheConfigurationEntry> {
    let raw = store.read_attribute(attribute)?;
    CacheConfigurationEntry::parse(&raw)
}

/// Read, modify and write back the whole entry. Last writer wins.
pub fn publish_cache_configuration(
    store: &mut dyn DirectoryConfigStore,
    attribute: &str,
    provider: RedisProviderType,
    servers: Option<String>,
) -> Result<CacheConfigurationEntry> {
    let mut entry = read_cache_configuration(store, attribute)?;
    entry.apply(provider, servers);
    let serialized = entry.to_json()?;
    if !store.write_attribute(attribute, &serialized)? {
        return Err(ProvisionError::ConfigStore {
            host: String::new(),
            message: format!("Directory rejected the {attribute} update"),
        });
    }
    Ok(entry)
}

/// Connect to the host's directory and publish the provider in one go.
/// Errors are tagged with the host name.
pub fn update_host_entry(
    connector: &dyn DirectoryConnector,
    settings: &DirectorySettings,
    host: &Host,
    provider: RedisProviderType,
    servers: Option<String>,
) -> Result<CacheConfigurationEntry> {
    let endpoint = DirectoryEndpoint::for_host(host, settings)?;
    let mut store = connector.connect(&host.target(), &endpoint)?;
    publish_cache_configuration(store.as_mut(), &settings.attribute, provider, servers)
        .map_err(|error| tag_host(error, &host.hostname))
}

fn tag_host(error: ProvisionError, hostname: &str) -> ProvisionError {
    match error {
        ProvisionError::ConfigStore { host, message } if host.is_empty() => {
            ProvisionError::config_store(hostname, message)
        }
        other => other,
    }
}

/// Report the cache method currently published on every host. Hosts whose
/// directory cannot be read are logged and left out.
pub fn describe_cache_methods(
    context: &RunContext,
    connector: &dyn DirectoryConnector,
    settings: &DirectorySettings,
    hosts: &[Host],
) -> Vec<CacheMethodReport> {
    let mut methods = Vec::new();
    for host in hosts {
        let entry = DirectoryEndpoint::for_host(host, settings)
            .and_then(|endpoint| connector.connect(&host.target(), &endpoint))
            .and_then(|mut store| read_cache_configuration(store.as_mut(), &settings.attribute));
        match entry {
            Ok(entry) => methods.push(CacheMethodReport {
                host_id: host.id,
                method: entry.method_label(),
            }),
            Err(error) => context.host(
                host.id,
                LogLevel::Error,
                format!("Couldn't read cache configuration of {}. Error: {error}", host.hostname),
            ),
        }
    }
    context.log(
        None,
        LogLevel::Success,
        "Cache methods of servers have been updated.",
    );
    methods
}
