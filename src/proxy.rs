use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ProxySettings;
use crate::error::{ProvisionError, Result};
use crate::models::Host;
use crate::stunnel::client_port;

pub const PROXY_CONF_PATH: &str = "/etc/nutcracker/nutcracker.yml";
pub const PROXY_POOL_NAME: &str = "cache_pool";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyPool {
    pub listen: String,
    pub hash: String,
    pub distribution: String,
    pub auto_eject_hosts: bool,
    pub redis: bool,
    pub server_retry_timeout: u32,
    pub server_failure_limit: u32,
    pub servers: Vec<String>,
}

impl ProxyPool {
    pub fn new(settings: &ProxySettings, cache_hosts: &[Host]) -> Self {
        Self {
            listen: format!("127.0.0.1:{}", settings.listen_port),
            hash: settings.hash.clone(),
            distribution: settings.distribution.clone(),
            auto_eject_hosts: true,
            redis: true,
            server_retry_timeout: 2000,
            server_failure_limit: 1,
            servers: cache_hosts
                .iter()
                .map(|host| format!("127.0.0.1:{}:1", client_port(host.id)))
                .collect(),
        }
    }
}

pub fn render_proxy_config(settings: &ProxySettings, cache_hosts: &[Host]) -> Result<String> {
    let mut pools = BTreeMap::new();
    pools.insert(PROXY_POOL_NAME, ProxyPool::new(settings, cache_hosts));
    serde_yaml::to_string(&pools)
        .map_err(|error| ProvisionError::Remote(format!("Failed to render proxy config: {error}")))
}
