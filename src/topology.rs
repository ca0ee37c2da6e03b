use std::collections::BTreeMap;

use crate::certificate::CertificateProvisioner;
use crate::cluster::{even_assignment, instance_confs, SlotRange};
use crate::config::ConsoleConfig;
use crate::directory::{update_host_entry, DirectoryConnector, RedisProviderType};
use crate::error::{ProvisionError, Result};
use crate::models::{CacheMethod, Host, HostOutcome, Phase};
use crate::os::OsFamily;
use crate::progress::{LogLevel, RunContext};
use crate::proxy::{render_proxy_config, PROXY_CONF_PATH};
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::stunnel::{
    cache_host_config, proxy_host_config, redis_server_stanza, sharded_config, sharded_endpoints,
    StunnelConfig, STUNNEL_CONF_PATH,
};
use crate::task_helpers::{close_session, open_session, resolve_os};
use crate::templates::{push_template, REDIS_CLUSTER_INIT, STUNNEL_CENTOS_INIT, STUNNEL_DEFAULTS};

/// Uniform directory server string in proxied mode: every host reaches the
/// proxy through its own local tunnel.
pub const PROXIED_SERVER_STRING: &str = "localhost:7000";

/// Configuration derived for one run. Recomputed every run, never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyPlan {
    Sharded {
        endpoints: Vec<String>,
        tunnels: BTreeMap<u32, StunnelConfig>,
    },
    Proxied {
        proxy: Option<Host>,
        tunnels: BTreeMap<u32, StunnelConfig>,
        proxy_servers: Vec<u32>,
    },
    Cluster {
        members: Vec<Host>,
        slots: Vec<(u32, SlotRange)>,
    },
}

impl TopologyPlan {
    pub fn method(&self) -> CacheMethod {
        match self {
            Self::Sharded { .. } => CacheMethod::Sharded,
            Self::Proxied { .. } => CacheMethod::Standalone,
            Self::Cluster { .. } => CacheMethod::Cluster,
        }
    }

    pub fn proxy(&self) -> Option<&Host> {
        match self {
            Self::Proxied { proxy, .. } => proxy.as_ref(),
            _ => None,
        }
    }

    /// Planned slot ranges; empty for anything but the cluster method.
    pub fn slots(&self) -> &[(u32, SlotRange)] {
        match self {
            Self::Cluster { slots, .. } => slots,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopologyOutcome {
    pub plan: TopologyPlan,
    /// Hosts that satisfied the readiness invariant at plan time.
    pub ready: Vec<Host>,
    /// Hosts whose files were written, whether or not the directory update
    /// that followed went through.
    pub delivered: Vec<u32>,
    pub outcomes: Vec<HostOutcome>,
}

impl TopologyOutcome {
    /// Ready hosts that hold new configuration and need their services
    /// restarted to pick it up.
    pub fn delivered(&self) -> Vec<&Host> {
        self.ready
            .iter()
            .filter(|host| self.delivered.contains(&host.id))
            .collect()
    }
}

pub struct TopologyConfigurator<'a> {
    context: &'a RunContext,
    executor: &'a dyn RemoteExecutor,
    directory: &'a dyn DirectoryConnector,
    config: &'a ConsoleConfig,
}

impl<'a> TopologyConfigurator<'a> {
    pub fn new(
        context: &'a RunContext,
        executor: &'a dyn RemoteExecutor,
        directory: &'a dyn DirectoryConnector,
        config: &'a ConsoleConfig,
    ) -> Self {
        Self {
            context,
            executor,
            directory,
            config,
        }
    }

    /// Configure the fleet for `method`. Only hosts with both Redis and
    /// stunnel installed take part; the rest are reported as skipped.
    pub fn configure(&self, method: CacheMethod, fleet: &[Host]) -> TopologyOutcome {
        let mut outcomes = Vec::new();
        let mut ready = Vec::new();
        let proxy_id = match method {
            CacheMethod::Standalone => first_primary(fleet).map(|host| host.id),
            _ => None,
        };
        for host in fleet {
            if host.is_ready() {
                ready.push(host.clone());
            } else if Some(host.id) == proxy_id {
                // configured below as a dedicated proxy
            } else if host.is_primary && method == CacheMethod::Standalone {
                self.context.host(
                    host.id,
                    LogLevel::Warning,
                    format!(
                        "Skipping {}: not the selected proxy and Redis or stunnel is missing",
                        host.hostname
                    ),
                );
                outcomes.push(HostOutcome::skipped(
                    host,
                    Phase::Configure,
                    "not the selected proxy and redis or stunnel not installed",
                ));
            } else {
                self.context.host(
                    host.id,
                    LogLevel::Warning,
                    format!(
                        "Skipping {}: Redis and stunnel are not both installed",
                        host.hostname
                    ),
                );
                outcomes.push(HostOutcome::skipped(
                    host,
                    Phase::Configure,
                    "redis or stunnel not installed",
                ));
            }
        }

        let mut delivered = Vec::new();
        let plan = match method {
            CacheMethod::Sharded => self.configure_sharded(&ready, &mut delivered, &mut outcomes),
            CacheMethod::Standalone => {
                self.configure_proxied(fleet, &ready, &mut delivered, &mut outcomes)
            }
            CacheMethod::Cluster => self.configure_cluster(&ready, &mut delivered, &mut outcomes),
        };

        TopologyOutcome {
            plan,
            ready,
            delivered,
            outcomes,
        }
    }

    fn configure_sharded(
        &self,
        ready: &[Host],
        delivered: &mut Vec<u32>,
        outcomes: &mut Vec<HostOutcome>,
    ) -> TopologyPlan {
        let endpoints = sharded_endpoints(ready);
        let servers = endpoints.join(",");
        let mut tunnels = BTreeMap::new();

        for host in ready {
            let tunnel = sharded_config(host, ready);
            let pushed = self.push_tunnels(host, &tunnel, &[]);
            if pushed.is_ok() {
                delivered.push(host.id);
            }
            let result = pushed.and_then(|()| {
                self.publish(host, RedisProviderType::Sharded, Some(servers.clone()))
            });
            outcomes.push(outcome_for(host, result));
            tunnels.insert(host.id, tunnel);
        }

        TopologyPlan::Sharded { endpoints, tunnels }
    }

    fn configure_proxied(
        &self,
        fleet: &[Host],
        ready: &[Host],
        delivered: &mut Vec<u32>,
        outcomes: &mut Vec<HostOutcome>,
    ) -> TopologyPlan {
        let proxy = self.select_proxy(fleet);
        let mut tunnels = BTreeMap::new();
        let mut reached = Vec::new();

        for host in ready
            .iter()
            .filter(|host| Some(host.id) != proxy.as_ref().map(|proxy| proxy.id))
        {
            let tunnel = match &proxy {
                Some(proxy) => cache_host_config(host, proxy, &self.config.proxy),
                None => StunnelConfig {
                    stanzas: vec![redis_server_stanza(host)],
                },
            };
            let pushed = self.push_tunnels(host, &tunnel, &[]);
            if pushed.is_ok() {
                delivered.push(host.id);
                reached.push(host.clone());
            }
            let result = pushed.and_then(|()| {
                self.publish(
                    host,
                    RedisProviderType::Standalone,
                    Some(PROXIED_SERVER_STRING.to_string()),
                )
            });
            outcomes.push(outcome_for(host, result));
            tunnels.insert(host.id, tunnel);
        }

        if let Some(proxy) = &proxy {
            let proxy_is_cache = ready.iter().any(|host| host.id == proxy.id);
            if proxy_is_cache {
                reached.push(proxy.clone());
            }

            let mut tunnel = if proxy_is_cache {
                cache_host_config(proxy, proxy, &self.config.proxy)
            } else {
                StunnelConfig::default()
            };
            tunnel.merge(proxy_host_config(proxy, &reached, &self.config.proxy));

            self.context.host(
                proxy.id,
                LogLevel::Info,
                format!(
                    "Configuring twemproxy on {} with {} server(s)",
                    proxy.hostname,
                    reached.len()
                ),
            );
            let pushed = render_proxy_config(&self.config.proxy, &reached).and_then(|rendered| {
                self.push_tunnels(proxy, &tunnel, &[(PROXY_CONF_PATH, rendered)])
            });
            match &pushed {
                Ok(()) => delivered.push(proxy.id),
                Err(_) => reached.retain(|host| host.id != proxy.id),
            }
            let result = pushed.and_then(|()| {
                if proxy_is_cache {
                    self.publish(
                        proxy,
                        RedisProviderType::Standalone,
                        Some(PROXIED_SERVER_STRING.to_string()),
                    )
                } else {
                    Ok(())
                }
            });
            outcomes.push(outcome_for(proxy, result));
            tunnels.insert(proxy.id, tunnel);
        }

        TopologyPlan::Proxied {
            proxy,
            tunnels,
            proxy_servers: reached.iter().map(|host| host.id).collect(),
        }
    }

    fn select_proxy(&self, fleet: &[Host]) -> Option<Host> {
        let primaries = fleet.iter().filter(|host| host.is_primary).collect::<Vec<_>>();
        match primaries.as_slice() {
            [] => {
                let error = ProvisionError::PreconditionMissing(
                    "no primary server is designated to run the proxy".to_string(),
                );
                self.context.log(
                    None,
                    LogLevel::Error,
                    format!("{error}. Cache servers are configured without a proxy."),
                );
                None
            }
            [only] => Some((*only).clone()),
            [first, ..] => {
                self.context.log(
                    None,
                    LogLevel::Warning,
                    format!(
                        "Several primary servers are designated; using {} as proxy",
                        first.hostname
                    ),
                );
                Some((*first).clone())
            }
        }
    }

    /// Slots are split over the hosts that received their instance files,
    /// so the plan matches what the restart phase assigns.
    fn configure_cluster(
        &self,
        ready: &[Host],
        delivered: &mut Vec<u32>,
        outcomes: &mut Vec<HostOutcome>,
    ) -> TopologyPlan {
        let mut members = Vec::new();
        for host in ready {
            let pushed = self.push_cluster_files(host);
            if pushed.is_ok() {
                delivered.push(host.id);
                members.push(host.clone());
            }
            let result =
                pushed.and_then(|()| self.publish(host, RedisProviderType::Cluster, None));
            outcomes.push(outcome_for(host, result));
        }

        let slots = even_assignment(&members);
        TopologyPlan::Cluster { members, slots }
    }

    fn push_cluster_files(&self, host: &Host) -> Result<()> {
        let mut session = open_session(self.context, self.executor, host)?;
        self.context
            .host(host.id, LogLevel::Debug, "Uploading redis conf files...");
        let result = self.push_cluster_files_with(session.as_mut());
        close_session(self.context, host, session);

        match &result {
            Ok(()) => self
                .context
                .host(host.id, LogLevel::Success, "Configuration upload complete."),
            Err(error) => self.context.host(
                host.id,
                LogLevel::Error,
                format!("Redis cluster configuration upload failed. Error: {error}"),
            ),
        }
        result
    }

    fn push_cluster_files_with(&self, session: &mut dyn RemoteSession) -> Result<()> {
        for (path, content) in instance_confs(&self.config.cluster) {
            session.write_file(&path, &content)?;
        }
        push_template(
            session,
            &REDIS_CLUSTER_INIT,
            self.config.paths.template_dir.as_deref(),
        )
    }

    fn push_tunnels(
        &self,
        host: &Host,
        tunnel: &StunnelConfig,
        extra_files: &[(&str, String)],
    ) -> Result<()> {
        self.context.host(host.id, LogLevel::Info, "Setting up stunnel");
        let mut session = open_session(self.context, self.executor, host)?;
        let result = self.push_tunnels_with(session.as_mut(), host, tunnel, extra_files);
        close_session(self.context, host, session);
        if let Err(error) = &result {
            self.context.host(
                host.id,
                LogLevel::Error,
                format!("Stunnel setup failed. Error: {error}"),
            );
        }
        result
    }

    fn push_tunnels_with(
        &self,
        session: &mut dyn RemoteSession,
        host: &Host,
        tunnel: &StunnelConfig,
        extra_files: &[(&str, String)],
    ) -> Result<()> {
        let os = resolve_os(session, host)?;
        let template_dir = self.config.paths.template_dir.as_deref();

        self.context
            .host(host.id, LogLevel::Debug, "Enable stunnel start on system boot");
        push_template(session, &STUNNEL_DEFAULTS, template_dir)?;
        if os.family == OsFamily::CentOs {
            push_template(session, &STUNNEL_CENTOS_INIT, template_dir)?;
        }

        let provisioner =
            CertificateProvisioner::new(self.context, self.config.paths.setup_properties_path());
        if let Err(error) = provisioner.provision(session, host) {
            self.context.host(
                host.id,
                LogLevel::Error,
                format!("Certificate generation failed. Error: {error}"),
            );
        }

        self.context.host(
            host.id,
            LogLevel::Debug,
            "Setup stunnel listening and forwarding",
        );
        session.write_file(STUNNEL_CONF_PATH, &tunnel.render())?;
        for (path, content) in extra_files {
            session.write_file(path, content)?;
        }
        Ok(())
    }

    fn publish(
        &self,
        host: &Host,
        provider: RedisProviderType,
        servers: Option<String>,
    ) -> Result<()> {
        self.context
            .host(host.id, LogLevel::Debug, "Updating oxCacheConfiguration ...");
        match update_host_entry(self.directory, &self.config.directory, host, provider, servers) {
            Ok(_) => {
                self.context.host(
                    host.id,
                    LogLevel::Success,
                    "Cache configuration update successful in LDAP",
                );
                Ok(())
            }
            Err(error) => {
                self.context.host(
                    host.id,
                    LogLevel::Error,
                    format!("oxCacheConfiguration update failed. Error: {error}"),
                );
                if matches!(error, ProvisionError::ConfigStore { .. }) {
                    self.context.host(
                        host.id,
                        LogLevel::Debug,
                        "Make sure your LDAP server is listening to connections from outside",
                    );
                }
                Err(error)
            }
        }
    }
}

/// The proxied method runs the proxy on the first primary in fleet order.
fn first_primary(fleet: &[Host]) -> Option<&Host> {
    fleet.iter().find(|host| host.is_primary)
}

fn outcome_for(host: &Host, result: Result<()>) -> HostOutcome {
    match result {
        Ok(()) => HostOutcome::success(host, Phase::Configure),
        Err(error) => HostOutcome::failure(host, Phase::Configure, &error),
    }
}
