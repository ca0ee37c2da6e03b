use crate::error::Result;
use crate::models::Host;
use crate::os::{detect_os, OsFamily, OsInfo};
use crate::progress::{LogLevel, RunContext};
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::task_helpers::{close_session, open_session, run_and_log};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Redis,
    Stunnel,
    Proxy,
}

impl Component {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Redis => "Redis",
            Self::Stunnel => "Stunnel",
            Self::Proxy => "Twemproxy",
        }
    }
}

/// Commands that install one component on one OS family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub bootstrap: Vec<&'static str>,
    pub install: &'static str,
    pub package: &'static str,
    /// Package-manager phrase printed when there is nothing left to do.
    pub already_phrase: &'static str,
}

pub fn install_plan(family: OsFamily, component: Component) -> InstallPlan {
    match (family, component) {
        (OsFamily::Ubuntu, Component::Redis) => InstallPlan {
            bootstrap: vec![
                "apt-get update",
                "apt-get upgrade -y",
                "apt-get install software-properties-common -y",
                "add-apt-repository ppa:chris-lea/redis-server -y",
                "apt-get update",
            ],
            install: "apt-get install redis-server -y",
            package: "redis-server",
            already_phrase: "redis-server is already the newest version",
        },
        (OsFamily::CentOs, Component::Redis) => InstallPlan {
            bootstrap: vec!["yum update -y", "yum install epel-release -y", "yum update -y"],
            install: "yum install redis -y",
            package: "redis",
            already_phrase: "already installed",
        },
        (OsFamily::Ubuntu, Component::Stunnel) => InstallPlan {
            bootstrap: vec!["apt-get update"],
            install: "apt-get install stunnel4 -y",
            package: "stunnel4",
            already_phrase: "stunnel4 is already the newest version",
        },
        (OsFamily::CentOs, Component::Stunnel) => InstallPlan {
            bootstrap: vec!["yum update -y"],
            install: "yum install stunnel -y",
            package: "stunnel",
            already_phrase: "already installed",
        },
        (OsFamily::Ubuntu, Component::Proxy) => InstallPlan {
            bootstrap: vec!["apt-get update"],
            install: "apt-get install nutcracker -y",
            package: "nutcracker",
            already_phrase: "nutcracker is already the newest version",
        },
        (OsFamily::CentOs, Component::Proxy) => InstallPlan {
            bootstrap: vec!["yum install epel-release -y"],
            install: "yum install nutcracker -y",
            package: "nutcracker",
            already_phrase: "already installed",
        },
    }
}

/// Decides whether an install attempt left the package in place.
pub trait InstallVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(
        &self,
        session: &mut dyn RemoteSession,
        plan: &InstallPlan,
        family: OsFamily,
    ) -> Result<bool>;
}

/// Install is verified iff re-running the install command prints the package
/// manager's "already installed / newest version" phrase. The exit code of
/// the first attempt is not consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyByIdempotentReinstall;

impl InstallVerifier for VerifyByIdempotentReinstall {
    fn name(&self) -> &'static str {
        "idempotent-reinstall"
    }

    fn verify(
        &self,
        session: &mut dyn RemoteSession,
        plan: &InstallPlan,
        _family: OsFamily,
    ) -> Result<bool> {
        let result = session.run(plan.install)?;
        Ok(result.stdout.contains(plan.already_phrase))
    }
}

/// Asks the package database directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyByPackageQuery;

impl InstallVerifier for VerifyByPackageQuery {
    fn name(&self) -> &'static str {
        "package-query"
    }

    fn verify(
        &self,
        session: &mut dyn RemoteSession,
        plan: &InstallPlan,
        family: OsFamily,
    ) -> Result<bool> {
        match family {
            OsFamily::Ubuntu => {
                let result =
                    session.run(&format!("dpkg-query -W -f='${{Status}}' {}", plan.package))?;
                Ok(result.stdout.contains("install ok installed"))
            }
            OsFamily::CentOs => {
                let result = session.run(&format!("rpm -q {}", plan.package))?;
                Ok(result.exit_status == 0 && !result.stdout.contains("is not installed"))
            }
        }
    }
}

pub struct Installer<'a> {
    context: &'a RunContext,
    executor: &'a dyn RemoteExecutor,
    verifier: &'a dyn InstallVerifier,
}

impl<'a> Installer<'a> {
    pub fn new(
        context: &'a RunContext,
        executor: &'a dyn RemoteExecutor,
        verifier: &'a dyn InstallVerifier,
    ) -> Self {
        Self {
            context,
            executor,
            verifier,
        }
    }

    pub fn install(&self, host: &mut Host, component: Component) -> bool {
        self.install_components(host, &[component])
            .first()
            .map(|(_, installed)| *installed)
            .unwrap_or(false)
    }

    /// Install several components over one session. The detected OS is
    /// stored on the host. Every component reports `false` when the host is
    /// unreachable or its OS is not supported.
    pub fn install_components(
        &self,
        host: &mut Host,
        components: &[Component],
    ) -> Vec<(Component, bool)> {
        let failed = || components.iter().map(|component| (*component, false)).collect();

        let Ok(mut session) = open_session(self.context, self.executor, host) else {
            return failed();
        };

        let os = match detect_os(session.as_mut(), &host.hostname) {
            Ok(os) => os,
            Err(error) => {
                self.context.host(host.id, LogLevel::Error, error.to_string());
                close_session(self.context, host, session);
                return failed();
            }
        };
        host.os_label = Some(os.label());

        let results = components
            .iter()
            .map(|component| {
                self.context.host(
                    host.id,
                    LogLevel::Info,
                    format!("Installing {} in server {}", component.label(), host.hostname),
                );
                let installed = self.install_with(session.as_mut(), host.id, os, *component);
                (*component, installed)
            })
            .collect();

        close_session(self.context, host, session);
        results
    }

    fn install_with(
        &self,
        session: &mut dyn RemoteSession,
        host_id: u32,
        os: OsInfo,
        component: Component,
    ) -> bool {
        let plan = install_plan(os.family, component);

        for command in &plan.bootstrap {
            let _ = run_and_log(self.context, session, host_id, command);
        }
        let _ = run_and_log(self.context, session, host_id, plan.install);

        match self.verifier.verify(session, &plan, os.family) {
            Ok(verified) => {
                if !verified {
                    self.context.host(
                        host_id,
                        LogLevel::Warning,
                        format!(
                            "{} verification ({}) did not confirm package `{}`",
                            component.label(),
                            self.verifier.name(),
                            plan.package
                        ),
                    );
                }
                verified
            }
            Err(error) => {
                self.context.host(
                    host_id,
                    LogLevel::Error,
                    format!("{} verification failed: {error}", component.label()),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        install_plan, Component, Installer, VerifyByIdempotentReinstall, VerifyByPackageQuery,
    };
    use crate::os::OsFamily;
    use crate::progress::{LogLevel, MemorySink, RunContext};
    use crate::test_support::{sample_host, FakeFleet};

    fn context() -> (Arc<MemorySink>, RunContext) {
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        (sink, context)
    }

    #[test]
    fn ubuntu_redis_verified_by_newest_version_phrase() {
        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::Ubuntu);
        fleet.respond_on(
            "cache1",
            "apt-get install redis-server -y",
            "redis-server is already the newest version (5:4.0.9).",
            "",
        );
        let (_, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);
        let mut host = sample_host(1, "cache1");
        host.os_label = None;

        assert!(installer.install(&mut host, Component::Redis));
        assert_eq!(host.os_label.as_deref(), Some("Ubuntu 16"));

        let commands = fleet.commands("cache1");
        let installs = commands
            .iter()
            .filter(|command| command.as_str() == "apt-get install redis-server -y")
            .count();
        assert_eq!(installs, 2);
        assert!(commands.contains(&"add-apt-repository ppa:chris-lea/redis-server -y".to_string()));
        assert_eq!(fleet.closed("cache1"), 1);
    }

    #[test]
    fn verification_ignores_earlier_failures() {
        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::CentOs);
        fleet.respond_on("cache1", "yum update -y", "", "Cannot find a valid baseurl");
        fleet.respond_on(
            "cache1",
            "yum install stunnel -y",
            "Package stunnel-5.41-1.el7.x86_64 already installed and latest version",
            "",
        );
        let (sink, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);
        let mut host = sample_host(1, "cache1");

        assert!(installer.install(&mut host, Component::Stunnel));
        assert!(sink
            .messages("run-1")
            .iter()
            .any(|(_, level, message)| *level == LogLevel::Warning
                && message.contains("valid baseurl")));
    }

    #[test]
    fn missing_phrase_means_not_installed() {
        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::Ubuntu);
        fleet.respond_on(
            "cache1",
            "apt-get install stunnel4 -y",
            "E: Unable to locate package stunnel4",
            "",
        );
        let (_, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);

        assert!(!installer.install(&mut sample_host(1, "cache1"), Component::Stunnel));
    }

    #[test]
    fn unreachable_host_fails_closed() {
        let fleet = FakeFleet::new();
        fleet.unreachable("cache1");
        let (sink, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);

        let results =
            installer.install_components(&mut sample_host(1, "cache1"), &[Component::Redis, Component::Stunnel]);
        assert_eq!(
            results,
            vec![(Component::Redis, false), (Component::Stunnel, false)]
        );
        assert_eq!(sink.messages("run-1")[0].1, LogLevel::Error);
    }

    #[test]
    fn unsupported_os_stops_before_any_install() {
        let fleet = FakeFleet::new();
        fleet.respond_on("cache1", "ls /etc/*release", "/etc/os-release\n", "");
        fleet.respond_on("cache1", "cat /etc/os-release", "NAME=\"Arch Linux\"\n", "");
        let (sink, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);

        assert!(!installer.install(&mut sample_host(1, "cache1"), Component::Redis));
        assert_eq!(fleet.commands("cache1").len(), 2);
        assert!(sink
            .messages("run-1")
            .iter()
            .any(|(_, _, message)| message.contains("Unsupported operating system")));
    }

    #[test]
    fn components_share_one_session() {
        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::Ubuntu);
        fleet.respond(
            "apt-get install redis-server -y",
            "redis-server is already the newest version",
        );
        fleet.respond("apt-get install stunnel4 -y", "stunnel4 is already the newest version");
        let (_, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByIdempotentReinstall);

        let results = installer.install_components(
            &mut sample_host(1, "cache1"),
            &[Component::Redis, Component::Stunnel],
        );
        assert_eq!(
            results,
            vec![(Component::Redis, true), (Component::Stunnel, true)]
        );
        assert_eq!(fleet.opened("cache1"), 1);
        assert_eq!(fleet.commands("cache1").iter().filter(|c| c.starts_with("ls ")).count(), 1);
    }

    #[test]
    fn package_query_verifier_reads_package_database() {
        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::Ubuntu);
        fleet.respond_on("cache1", "dpkg-query -W", "install ok installed", "");
        let (_, context) = context();
        let installer = Installer::new(&context, &fleet, &VerifyByPackageQuery);

        assert!(installer.install(&mut sample_host(1, "cache1"), Component::Proxy));
        assert!(fleet
            .commands("cache1")
            .contains(&"dpkg-query -W -f='${Status}' nutcracker".to_string()));
    }

    #[test]
    fn dispatch_table_covers_every_family() {
        for family in [OsFamily::Ubuntu, OsFamily::CentOs] {
            for component in [Component::Redis, Component::Stunnel, Component::Proxy] {
                let plan = install_plan(family, component);
                assert!(!plan.already_phrase.is_empty());
                assert!(plan.install.contains(plan.package));
            }
        }
    }
}
