use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cluster::{even_assignment, form_cluster, SlotRange};
use crate::config::ConsoleConfig;
use crate::db::HostStore;
use crate::directory::DirectoryConnector;
use crate::error::{ProvisionError, Result};
use crate::installer::{Component, InstallVerifier, Installer};
use crate::models::{
    CacheMethod, Host, HostOutcome, HostStatus, Phase, RunResult, RunSummary,
};
use crate::progress::{LogLevel, RunContext};
use crate::remote::RemoteExecutor;
use crate::services::ServiceLifecycleManager;
use crate::state::RunHandle;
use crate::topology::{TopologyConfigurator, TopologyOutcome};

/// What one run does. `Provision` chains all three phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install { method: Option<CacheMethod> },
    Configure(CacheMethod),
    Restart(CacheMethod),
    Provision(CacheMethod),
}

impl Operation {
    pub fn method(&self) -> Option<CacheMethod> {
        match self {
            Self::Install { method } => *method,
            Self::Configure(method) | Self::Restart(method) | Self::Provision(method) => {
                Some(*method)
            }
        }
    }
}

/// The collaborators a run needs. Every phase is blocking and walks the
/// hosts one after another.
#[derive(Clone)]
pub struct Engine {
    pub executor: Arc<dyn RemoteExecutor>,
    pub directory: Arc<dyn DirectoryConnector>,
    pub store: Arc<dyn HostStore>,
    pub verifier: Arc<dyn InstallVerifier>,
    pub config: Arc<ConsoleConfig>,
}

impl Engine {
    /// Install Redis and stunnel everywhere, plus the proxy on primaries when
    /// the proxied method is targeted. Readiness flags follow the
    /// verification result and are saved after each host.
    pub fn install_phase(
        &self,
        context: &RunContext,
        method: Option<CacheMethod>,
        hosts: &mut [Host],
    ) -> Vec<HostOutcome> {
        let installer = Installer::new(context, self.executor.as_ref(), self.verifier.as_ref());
        context.log(
            None,
            LogLevel::Debug,
            format!("Verifying installs with the {} policy", self.verifier.name()),
        );

        hosts
            .iter_mut()
            .map(|host| {
                let mut components = vec![Component::Redis, Component::Stunnel];
                if method == Some(CacheMethod::Standalone) && host.is_primary {
                    components.push(Component::Proxy);
                }

                let results = installer.install_components(host, &components);
                let mut missing = Vec::new();
                for (component, installed) in &results {
                    match component {
                        Component::Redis => host.redis_ready = *installed,
                        Component::Stunnel => host.stunnel_ready = *installed,
                        Component::Proxy => {}
                    }
                    if *installed {
                        context.host(
                            host.id,
                            LogLevel::Success,
                            format!("{} install successful", component.label()),
                        );
                    } else {
                        context.host(
                            host.id,
                            LogLevel::Fail,
                            format!("{} install failed", component.label()),
                        );
                        missing.push(component.label());
                    }
                }

                if let Err(error) = self.store.save_host(host) {
                    context.host(
                        host.id,
                        LogLevel::Error,
                        format!("Failed to save state of {}: {error}", host.hostname),
                    );
                }

                if missing.is_empty() {
                    HostOutcome::success(host, Phase::Install)
                } else {
                    let error = ProvisionError::Verification(format!(
                        "{} not installed on {}",
                        missing.join(", "),
                        host.hostname
                    ));
                    HostOutcome::failure(host, Phase::Install, &error)
                }
            })
            .collect()
    }

    pub fn configure_phase(
        &self,
        context: &RunContext,
        method: CacheMethod,
        hosts: &[Host],
    ) -> TopologyOutcome {
        TopologyConfigurator::new(
            context,
            self.executor.as_ref(),
            self.directory.as_ref(),
            &self.config,
        )
        .configure(method, hosts)
    }

    /// Restart services on `hosts`. The proxied method also restarts the
    /// proxy; the cluster method forms the cluster from the hosts that came
    /// back up, using `planned_slots` when exactly those hosts restarted.
    pub fn restart_phase(
        &self,
        context: &RunContext,
        method: CacheMethod,
        hosts: &[Host],
        proxy: Option<&Host>,
        planned_slots: &[(u32, SlotRange)],
    ) -> Vec<HostOutcome> {
        let manager =
            ServiceLifecycleManager::new(context, self.executor.as_ref(), &self.config.paths);
        let mut outcomes = manager.restart_all(method, hosts);

        match method {
            CacheMethod::Standalone => {
                if let Some(proxy) = proxy {
                    outcomes.push(manager.restart_proxy(proxy));
                }
            }
            CacheMethod::Cluster => {
                let running = hosts
                    .iter()
                    .filter(|host| succeeded(&outcomes, host.id))
                    .cloned()
                    .collect::<Vec<_>>();
                let assignment = cluster_assignment(context, &running, planned_slots);
                let formation = form_cluster(
                    context,
                    self.executor.as_ref(),
                    &self.config.cluster,
                    &running,
                    &assignment,
                );
                context.log(
                    None,
                    LogLevel::Info,
                    format!(
                        "Cluster formed with {} meet(s) and {} slot assignment(s)",
                        formation.met.len(),
                        formation.assigned.len()
                    ),
                );
            }
            CacheMethod::Sharded => {}
        }
        outcomes
    }

    /// Run `operation` over `hosts`. Outcomes are pushed to `handle` as each
    /// phase finishes.
    pub fn execute(
        &self,
        context: &RunContext,
        operation: Operation,
        mut hosts: Vec<Host>,
        handle: Option<&RunHandle>,
    ) -> Vec<HostOutcome> {
        let mut outcomes = Vec::new();
        let mut record = |phase_outcomes: Vec<HostOutcome>| {
            if let Some(handle) = handle {
                handle.record_blocking(&phase_outcomes);
            }
            outcomes.extend(phase_outcomes);
        };

        match operation {
            Operation::Install { method } => {
                record(self.install_phase(context, method, &mut hosts));
            }
            Operation::Configure(method) => {
                record(self.configure_phase(context, method, &hosts).outcomes);
            }
            Operation::Restart(method) => {
                let ready = hosts
                    .iter()
                    .filter(|host| host.is_ready())
                    .cloned()
                    .collect::<Vec<_>>();
                let proxy = hosts.iter().find(|host| host.is_primary);
                record(self.restart_phase(context, method, &ready, proxy, &[]));
            }
            Operation::Provision(method) => {
                record(self.install_phase(context, Some(method), &mut hosts));
                let topology = self.configure_phase(context, method, &hosts);
                record(topology.outcomes.clone());

                // a failed directory update still leaves new files on the host
                let delivered = topology.delivered().into_iter().cloned().collect::<Vec<_>>();
                if delivered.is_empty() {
                    context.log(
                        None,
                        LogLevel::Warning,
                        "No server received configuration; skipping service restart",
                    );
                } else {
                    record(self.restart_phase(
                        context,
                        method,
                        &delivered,
                        topology.plan.proxy(),
                        topology.plan.slots(),
                    ));
                }
            }
        }
        outcomes
    }
}

/// The planned ranges when they name exactly the running hosts, otherwise an
/// even split over the running hosts.
fn cluster_assignment(
    context: &RunContext,
    running: &[Host],
    planned: &[(u32, SlotRange)],
) -> Vec<(u32, SlotRange)> {
    let matches_plan = planned
        .iter()
        .map(|(host_id, _)| *host_id)
        .eq(running.iter().map(|host| host.id));
    if matches_plan && !planned.is_empty() {
        return planned.to_vec();
    }
    if !planned.is_empty() {
        context.log(
            None,
            LogLevel::Warning,
            format!(
                "Slot ranges recomputed over {} running server(s); the plan covered {}",
                running.len(),
                planned.len()
            ),
        );
    }
    even_assignment(running)
}

fn succeeded(outcomes: &[HostOutcome], host_id: u32) -> bool {
    outcomes
        .iter()
        .any(|outcome| outcome.host_id == host_id && outcome.status == HostStatus::Success)
}

/// Per-host tally: a host failed if any of its outcomes failed, succeeded
/// if at least one outcome succeeded and none failed.
pub fn summarize(
    run_id: &str,
    method: Option<CacheMethod>,
    hosts: &[Host],
    outcomes: &[HostOutcome],
    started_at: DateTime<Utc>,
) -> RunSummary {
    let mut success = 0usize;
    let mut failed = 0usize;
    for host in hosts {
        let mine = outcomes.iter().filter(|outcome| outcome.host_id == host.id);
        let statuses = mine.map(|outcome| &outcome.status).collect::<Vec<_>>();
        if statuses.contains(&&HostStatus::Failed) {
            failed += 1;
        } else if statuses.contains(&&HostStatus::Success) {
            success += 1;
        }
    }

    RunSummary {
        run_id: run_id.to_string(),
        method,
        total: hosts.len(),
        success,
        failed,
        started_at,
        finished_at: Some(Utc::now()),
    }
}

/// Run the blocking pipeline off the async runtime, then finalize the live
/// handle and persist the result.
pub async fn run_pipeline(
    engine: Engine,
    context: RunContext,
    operation: Operation,
    hosts: Vec<Host>,
    handle: RunHandle,
) -> Result<RunResult> {
    context.log(
        None,
        LogLevel::Info,
        format!("Run accepted for {} server(s)", hosts.len()),
    );
    let started_at = handle.data.lock().await.summary.started_at;

    let outcomes = tokio::task::spawn_blocking({
        let engine = engine.clone();
        let context = context.clone();
        let hosts = hosts.clone();
        let handle = handle.clone();
        move || engine.execute(&context, operation, hosts, Some(&handle))
    })
    .await
    .map_err(|error| ProvisionError::Remote(format!("Run execution join failed: {error}")))?;

    let summary = summarize(
        context.run_id(),
        operation.method(),
        &hosts,
        &outcomes,
        started_at,
    );
    {
        let mut data = handle.data.lock().await;
        data.summary = summary.clone();
    }

    let result = RunResult {
        summary,
        items: outcomes,
    };
    if let Err(error) = engine.store.save_run_result(&result) {
        context.log(
            None,
            LogLevel::Error,
            format!("Failed to persist run result: {error}"),
        );
    }
    context.log(
        None,
        LogLevel::Info,
        format!(
            "Run finished: {} succeeded, {} failed of {}",
            result.summary.success, result.summary.failed, result.summary.total
        ),
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use super::{run_pipeline, summarize, Engine, Operation};
    use crate::cluster::{add_slots_command, SlotRange};
    use crate::config::{ClusterSettings, ConsoleConfig};
    use crate::db::Database;
    use crate::installer::VerifyByIdempotentReinstall;
    use crate::models::{CacheMethod, Host, HostOutcome, HostStatus, HostUpsertPayload, Phase};
    use crate::os::{OsFamily, OsInfo};
    use crate::progress::{LogLevel, MemorySink, RunContext};
    use crate::services::proxy_restart_commands;
    use crate::state::RunRegistry;
    use crate::test_support::{sample_host, FakeDirectory, FakeFleet};

    struct Fixture {
        fleet: FakeFleet,
        directory: FakeDirectory,
        database: Arc<Mutex<Database>>,
        hosts: Vec<Host>,
    }

    impl Fixture {
        fn new(names: &[&str]) -> Self {
            let database = Database::open_in_memory().expect("database");
            let mut hosts = Vec::new();
            for name in names {
                let host = database
                    .insert_host(
                        &HostUpsertPayload {
                            hostname: name.to_string(),
                            ip: None,
                            ssh_user: "root".to_string(),
                            is_primary: false,
                            containerized: false,
                            remember_password: false,
                            directory_password: None,
                        },
                        Utc::now(),
                    )
                    .expect("insert");
                hosts.push(host);
            }

            let fleet = FakeFleet::new();
            for name in names {
                fleet.with_os(name, OsFamily::Ubuntu);
            }
            fleet.respond(
                "apt-get install redis-server -y",
                "redis-server is already the newest version (5:4.0.9).",
            );
            fleet.respond(
                "apt-get install stunnel4 -y",
                "stunnel4 is already the newest version.",
            );

            Self {
                fleet,
                directory: FakeDirectory::new(),
                database: Arc::new(Mutex::new(database)),
                hosts,
            }
        }

        fn engine(&self) -> Engine {
            let mut config = ConsoleConfig::default();
            config.directory.password = Some("directory-secret".to_string());
            Engine {
                executor: Arc::new(self.fleet.clone()),
                directory: Arc::new(self.directory.clone()),
                store: self.database.clone(),
                verifier: Arc::new(VerifyByIdempotentReinstall),
                config: Arc::new(config),
            }
        }
    }

    #[test]
    fn install_updates_and_persists_readiness() {
        let fixture = Fixture::new(&["cache1", "cache2"]);
        fixture.fleet.respond_on(
            "cache2",
            "apt-get install stunnel4 -y",
            "E: Unable to locate package stunnel4",
            "",
        );
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let mut hosts = fixture.hosts.clone();

        let outcomes = fixture.engine().install_phase(&context, None, &mut hosts);

        assert_eq!(outcomes[0].status, HostStatus::Success);
        assert_eq!(outcomes[1].status, HostStatus::Failed);
        assert_eq!(outcomes[1].error_code.as_deref(), Some("VERIFICATION_FAILED"));

        let database = fixture.database.lock().expect("lock");
        let cache2 = database.find_host("cache2").expect("find").expect("present");
        assert!(cache2.redis_ready);
        assert!(!cache2.stunnel_ready);
        assert_eq!(cache2.os_label.as_deref(), Some("Ubuntu 16"));
    }

    #[test]
    fn proxy_is_installed_on_primary_for_proxied_method() {
        let fixture = Fixture::new(&["proxy"]);
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let mut hosts = fixture.hosts.clone();
        hosts[0].is_primary = true;

        fixture
            .engine()
            .install_phase(&context, Some(CacheMethod::Standalone), &mut hosts);

        assert!(fixture
            .fleet
            .commands("proxy")
            .iter()
            .any(|command| command == "apt-get install nutcracker -y"));
    }

    #[test]
    fn provision_isolates_an_unreachable_host() {
        let fixture = Fixture::new(&["cache1", "cache2", "cache3"]);
        fixture.fleet.unreachable("cache3");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let engine = fixture.engine();

        let outcomes = engine.execute(
            &context,
            Operation::Provision(CacheMethod::Sharded),
            fixture.hosts.clone(),
            None,
        );

        let restarted = outcomes
            .iter()
            .filter(|outcome| outcome.phase == Phase::Restart)
            .map(|outcome| outcome.hostname.as_str())
            .collect::<Vec<_>>();
        assert_eq!(restarted, vec!["cache1", "cache2"]);

        let skipped = outcomes
            .iter()
            .find(|outcome| outcome.phase == Phase::Configure && outcome.hostname == "cache3")
            .expect("cache3 configure outcome");
        assert_eq!(skipped.status, HostStatus::Skipped);

        let entry = fixture.directory.entry("cache1").expect("published");
        assert!(entry.contains("localhost:7001,localhost:7002"));
        assert!(!entry.contains("localhost:7003"));

        let summary = summarize("run-1", Some(CacheMethod::Sharded), &fixture.hosts, &outcomes, Utc::now());
        assert_eq!((summary.total, summary.success, summary.failed), (3, 2, 1));
    }

    fn restarted(outcomes: &[HostOutcome]) -> Vec<&str> {
        outcomes
            .iter()
            .filter(|outcome| outcome.phase == Phase::Restart)
            .map(|outcome| outcome.hostname.as_str())
            .collect()
    }

    #[test]
    fn provision_restarts_host_whose_directory_update_failed() {
        let fixture = Fixture::new(&["cache1", "cache2", "cache3"]);
        fixture.directory.unreachable("cache1");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());

        let outcomes = fixture.engine().execute(
            &context,
            Operation::Provision(CacheMethod::Sharded),
            fixture.hosts.clone(),
            None,
        );

        assert_eq!(restarted(&outcomes), vec!["cache1", "cache2", "cache3"]);
        assert!(fixture
            .fleet
            .commands("cache1")
            .contains(&"systemctl restart stunnel4".to_string()));
        let configure = outcomes
            .iter()
            .find(|outcome| outcome.phase == Phase::Configure && outcome.hostname == "cache1")
            .expect("cache1 configure outcome");
        assert_eq!(configure.error_code.as_deref(), Some("CONFIG_STORE"));

        let entry = fixture.directory.entry("cache2").expect("published");
        assert!(entry.contains("localhost:7001,localhost:7002,localhost:7003"));
        let summary = summarize("run-1", Some(CacheMethod::Sharded), &fixture.hosts, &outcomes, Utc::now());
        assert_eq!((summary.total, summary.success, summary.failed), (3, 2, 1));
    }

    #[test]
    fn provision_standalone_restarts_proxy_and_fails_unreachable_host() {
        let fixture = Fixture::new(&["proxy", "cache1", "cache2"]);
        fixture.fleet.respond(
            "apt-get install nutcracker -y",
            "nutcracker is already the newest version.",
        );
        fixture.fleet.unreachable("cache2");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let mut hosts = fixture.hosts.clone();
        hosts[0].is_primary = true;

        let outcomes = fixture.engine().execute(
            &context,
            Operation::Provision(CacheMethod::Standalone),
            hosts.clone(),
            None,
        );

        // the proxy restarts once as a cache host and once as the proxy
        assert_eq!(restarted(&outcomes), vec!["proxy", "cache1", "proxy"]);
        let proxy_commands = fixture.fleet.commands("proxy");
        for command in proxy_restart_commands(OsInfo::new(OsFamily::Ubuntu, Some(16))) {
            assert!(proxy_commands.contains(&command), "missing `{command}`");
        }
        assert!(fixture.fleet.file("proxy", crate::proxy::PROXY_CONF_PATH).is_some());
        assert!(fixture.directory.entry("cache2").is_none());

        assert!(!outcomes
            .iter()
            .any(|outcome| outcome.hostname == "cache2" && outcome.status == HostStatus::Success));
        let summary = summarize("run-1", Some(CacheMethod::Standalone), &hosts, &outcomes, Utc::now());
        assert_eq!((summary.total, summary.success, summary.failed), (3, 2, 1));
    }

    #[test]
    fn provision_cluster_meets_peers_by_address() {
        let fixture = Fixture::new(&["cache1", "cache2", "cache3"]);
        fixture.fleet.respond("getent ahostsv4 cache2", "10.0.0.2\n");
        fixture.fleet.respond("getent ahostsv4 cache3", "10.0.0.3\n");
        fixture.fleet.respond("cluster meet", "OK\n");
        fixture.fleet.respond("CLUSTER ADDSLOTS", "OK\n");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());

        let outcomes = fixture.engine().execute(
            &context,
            Operation::Provision(CacheMethod::Cluster),
            fixture.hosts.clone(),
            None,
        );

        assert_eq!(restarted(&outcomes), vec!["cache1", "cache2", "cache3"]);
        let meets = fixture
            .fleet
            .commands("cache1")
            .into_iter()
            .filter(|command| command.contains("cluster meet"))
            .collect::<Vec<_>>();
        assert_eq!(
            meets,
            vec![
                "redis-cli -c -h 127.0.0.1 -p 7000 cluster meet 10.0.0.2 7000",
                "redis-cli -c -h 127.0.0.1 -p 7000 cluster meet 10.0.0.3 7000",
            ]
        );
        assert!(sink.messages("run-1").iter().any(|(_, _, message)| {
            message == "Cluster formed with 2 meet(s) and 3 slot assignment(s)"
        }));
        let summary = summarize("run-1", Some(CacheMethod::Cluster), &fixture.hosts, &outcomes, Utc::now());
        assert_eq!((summary.total, summary.success, summary.failed), (3, 3, 0));
    }

    #[test]
    fn cluster_slots_are_recomputed_when_a_planned_host_is_down() {
        let fixture = Fixture::new(&["cache1", "cache2", "cache3"]);
        fixture.fleet.unreachable("cache2");
        fixture.fleet.respond("cluster meet", "OK\n");
        fixture.fleet.respond("CLUSTER ADDSLOTS", "OK\n");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let hosts = vec![sample_host(1, "cache1"), sample_host(2, "cache2"), sample_host(3, "cache3")];
        let planned = vec![
            (1, SlotRange { start: 0, end: 5461 }),
            (2, SlotRange { start: 5462, end: 10922 }),
            (3, SlotRange { start: 10923, end: 16383 }),
        ];

        fixture
            .engine()
            .restart_phase(&context, CacheMethod::Cluster, &hosts, None, &planned);

        let settings = ClusterSettings::default();
        assert!(fixture
            .fleet
            .commands("cache3")
            .contains(&add_slots_command(&settings, SlotRange { start: 8192, end: 16383 })));
        assert!(sink.messages("run-1").iter().any(|(host_id, level, message)| {
            host_id.is_none()
                && *level == LogLevel::Warning
                && message.contains("Slot ranges recomputed over 2 running server(s)")
        }));
    }

    #[test]
    fn planned_cluster_slots_are_applied_when_every_host_restarts() {
        let fixture = Fixture::new(&["cache1", "cache2"]);
        fixture.fleet.respond("cluster meet", "OK\n");
        fixture.fleet.respond("CLUSTER ADDSLOTS", "OK\n");
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let hosts = vec![sample_host(1, "cache1"), sample_host(2, "cache2")];
        let planned = vec![
            (1, SlotRange { start: 0, end: 8191 }),
            (2, SlotRange { start: 8192, end: 16383 }),
        ];

        fixture
            .engine()
            .restart_phase(&context, CacheMethod::Cluster, &hosts, None, &planned);

        assert!(fixture
            .fleet
            .commands("cache2")
            .contains(&add_slots_command(&ClusterSettings::default(), planned[1].1)));
        assert!(!sink
            .messages("run-1")
            .iter()
            .any(|(_, _, message)| message.contains("recomputed")));
    }

    #[test]
    fn restart_only_uses_ready_hosts() {
        let fixture = Fixture::new(&["cache1", "cache2"]);
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let mut hosts = fixture.hosts.clone();
        hosts[0].redis_ready = true;
        hosts[0].stunnel_ready = true;

        let outcomes = fixture.engine().execute(
            &context,
            Operation::Restart(CacheMethod::Sharded),
            hosts,
            None,
        );

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].hostname, "cache1");
        assert!(fixture.fleet.commands("cache2").is_empty());
    }

    #[test]
    fn summary_counts_each_host_once() {
        let hosts = vec![sample_host(1, "cache1"), sample_host(2, "cache2"), sample_host(3, "cache3")];
        let error = crate::error::ProvisionError::connectivity("cache2", "refused");
        let outcomes = vec![
            HostOutcome::success(&hosts[0], Phase::Install),
            HostOutcome::success(&hosts[0], Phase::Configure),
            HostOutcome::success(&hosts[1], Phase::Install),
            HostOutcome::failure(&hosts[1], Phase::Restart, &error),
            HostOutcome::skipped(&hosts[2], Phase::Configure, "not ready"),
        ];

        let summary = summarize("run-1", None, &hosts, &outcomes, Utc::now());

        assert_eq!(summary.total, 3);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failed, 1);
        assert!(summary.finished_at.is_some());
    }

    #[tokio::test]
    async fn pipeline_persists_result_and_fills_handle() {
        let fixture = Fixture::new(&["cache1"]);
        let sink = Arc::new(MemorySink::new());
        let context = RunContext::new("run-1", sink.clone());
        let registry = RunRegistry::default();
        let handle = registry
            .register(summarize("run-1", None, &fixture.hosts, &[], Utc::now()))
            .await;

        let result = run_pipeline(
            fixture.engine(),
            context,
            Operation::Install { method: None },
            fixture.hosts.clone(),
            handle.clone(),
        )
        .await
        .expect("run");

        assert_eq!(result.summary.success, 1);
        assert_eq!(handle.snapshot().await.items.len(), 1);
        let stored = fixture
            .database
            .lock()
            .expect("lock")
            .get_run_result("run-1")
            .expect("load")
            .expect("persisted");
        assert_eq!(stored.items[0].phase, Phase::Install);
    }
}
