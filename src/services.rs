use crate::config::PathSettings;
use crate::error::Result;
use crate::models::{CacheMethod, Host, HostOutcome, Phase};
use crate::os::{OsFamily, OsInfo};
use crate::progress::{LogLevel, RunContext};
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::task_helpers::{close_session, open_session, resolve_os, run_and_log};

const CONSOLE_HOP_OPTIONS: &[&str] = &[
    "-o IdentityFile=/etc/gluu/keys/gluu-console",
    "-o Port=60022",
    "-o LogLevel=QUIET",
    "-o StrictHostKeyChecking=no",
    "-o UserKnownHostsFile=/dev/null",
    "-o PubkeyAuthentication=yes",
];

/// How dependent application services are reached on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Containment {
    Direct,
    Chroot { root: String },
    SshHop,
}

impl Containment {
    pub fn for_host(host: &Host, os: OsInfo, paths: &PathSettings) -> Self {
        if !host.containerized {
            Self::Direct
        } else if os.is_centos7() {
            Self::SshHop
        } else {
            Self::Chroot {
                root: paths.container_root(),
            }
        }
    }

    pub fn wrap(&self, command: &str) -> String {
        match self {
            Self::Direct => command.to_string(),
            Self::Chroot { root } => format!("chroot {root} /bin/bash -c \"{command}\""),
            Self::SshHop => format!(
                "ssh {} root@localhost '{command}'",
                CONSOLE_HOP_OPTIONS.join(" ")
            ),
        }
    }
}

/// Restart commands for one cache host, in execution order. Only the
/// dependent application services go through the containment wrapper.
pub fn restart_commands(
    method: CacheMethod,
    os: OsInfo,
    containment: &Containment,
) -> Vec<String> {
    let manager = os.service_manager();
    let mut commands = Vec::new();

    if method.uses_tunnels() {
        commands.push(manager.restart("stunnel4"));
    }
    match (method, os.family) {
        // the cluster init script manages both instances and is always SysV
        (CacheMethod::Cluster, _) => commands.push("service redis-server restart".to_string()),
        (_, OsFamily::CentOs) => commands.push(manager.restart("redis")),
        (_, OsFamily::Ubuntu) => commands.push(manager.restart("redis-server")),
    }

    let mut dependents = Vec::new();
    if os.family == OsFamily::Ubuntu {
        dependents.push("apache2");
    }
    dependents.extend(["oxauth", "identity"]);
    for service in dependents {
        commands.push(containment.wrap(&format!("service {service} restart")));
    }
    commands
}

pub fn proxy_restart_commands(os: OsInfo) -> Vec<String> {
    let manager = os.service_manager();
    vec![manager.restart("stunnel4"), manager.restart("nutcracker")]
}

pub struct ServiceLifecycleManager<'a> {
    context: &'a RunContext,
    executor: &'a dyn RemoteExecutor,
    paths: &'a PathSettings,
}

impl<'a> ServiceLifecycleManager<'a> {
    pub fn new(
        context: &'a RunContext,
        executor: &'a dyn RemoteExecutor,
        paths: &'a PathSettings,
    ) -> Self {
        Self {
            context,
            executor,
            paths,
        }
    }

    pub fn restart_all(&self, method: CacheMethod, hosts: &[Host]) -> Vec<HostOutcome> {
        hosts
            .iter()
            .map(|host| {
                self.context.host(
                    host.id,
                    LogLevel::Info,
                    "(Re)Starting services ... ",
                );
                match self.restart_host(method, host) {
                    Ok(()) => HostOutcome::success(host, Phase::Restart),
                    Err(error) => HostOutcome::failure(host, Phase::Restart, &error),
                }
            })
            .collect()
    }

    pub fn restart_host(&self, method: CacheMethod, host: &Host) -> Result<()> {
        let mut session = open_session(self.context, self.executor, host)?;
        let result = self.restart_with(session.as_mut(), method, host);
        close_session(self.context, host, session);
        result
    }

    fn restart_with(
        &self,
        session: &mut dyn RemoteSession,
        method: CacheMethod,
        host: &Host,
    ) -> Result<()> {
        let os = resolve_os(session, host)?;
        let containment = Containment::for_host(host, os, self.paths);
        for command in restart_commands(method, os, &containment) {
            run_and_log(self.context, session, host.id, &command)?;
        }
        Ok(())
    }

    /// Extra pass for the proxied method: bring up the proxy host's tunnel
    /// and proxy daemon.
    pub fn restart_proxy(&self, proxy: &Host) -> HostOutcome {
        self.context.host(
            proxy.id,
            LogLevel::Info,
            format!("Restarting stunnel and twemproxy on proxy {}", proxy.hostname),
        );
        let result = open_session(self.context, self.executor, proxy).and_then(|mut session| {
            let result = resolve_os(session.as_mut(), proxy).and_then(|os| {
                for command in proxy_restart_commands(os) {
                    run_and_log(self.context, session.as_mut(), proxy.id, &command)?;
                }
                Ok(())
            });
            close_session(self.context, proxy, session);
            result
        });

        match result {
            Ok(()) => HostOutcome::success(proxy, Phase::Restart),
            Err(error) => {
                self.context.host(
                    proxy.id,
                    LogLevel::Error,
                    format!("Proxy restart failed: {error}"),
                );
                HostOutcome::failure(proxy, Phase::Restart, &error)
            }
        }
    }
}
