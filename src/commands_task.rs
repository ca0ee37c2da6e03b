use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::auth::{resolve_directory_passwords, resolve_ssh_auth};
use crate::db::lock_database;
use crate::directory::{describe_cache_methods, DirectoryConnector};
use crate::error::{ProvisionError, Result};
use crate::installer::InstallVerifier;
use crate::ldap_tools::LdapToolsConnector;
use crate::models::{CacheMethodReport, Host, RunAccepted, RunResult, RunSummary};
use crate::progress::{ProgressSink, RunContext};
use crate::remote::RemoteExecutor;
use crate::ssh_client::SshExecutor;
use crate::state::AppState;
use crate::task_runner::{DeclarativeTaskRunner, ExecutionMode, TaskDescriptor};
use crate::task_types::StepSnapshot;
use crate::task_worker::{run_pipeline, Engine, Operation};
use crate::utils::{resolve_export_path, status_label};

/// SSH executor pinned to the stored host keys.
pub fn ssh_executor(state: &AppState) -> Arc<dyn RemoteExecutor> {
    let settings = state.config.ssh.clone();
    let auth = resolve_ssh_auth(&settings);
    Arc::new(SshExecutor::new(settings, auth).with_known_hosts(state.database.clone()))
}

pub fn build_engine(
    state: &AppState,
    executor: Arc<dyn RemoteExecutor>,
    verifier: Arc<dyn InstallVerifier>,
) -> Engine {
    Engine {
        directory: Arc::new(LdapToolsConnector::new(executor.clone())),
        executor,
        store: state.database.clone(),
        verifier,
        config: state.config.clone(),
    }
}

fn load_hosts(state: &AppState, hostnames: &[String]) -> Result<Vec<Host>> {
    let mut hosts = lock_database(&state.database)?.list_hosts()?;
    if !hostnames.is_empty() {
        for hostname in hostnames {
            if !hosts.iter().any(|host| &host.hostname == hostname) {
                return Err(ProvisionError::Config(format!("Unknown host `{hostname}`")));
            }
        }
        hosts.retain(|host| hostnames.contains(&host.hostname));
    }
    resolve_directory_passwords(&mut hosts)?;
    Ok(hosts)
}

fn run_secrets(state: &AppState, hosts: &[Host]) -> Vec<String> {
    let mut secrets = state.config.secrets();
    secrets.extend(
        hosts
            .iter()
            .filter_map(|host| host.directory_password.clone())
            .filter(|value| !value.trim().is_empty()),
    );
    secrets
}

pub struct RunStarted {
    pub accepted: RunAccepted,
    pub completion: JoinHandle<Result<RunResult>>,
}

/// Register a run and dispatch it in the background. Returns as soon as the
/// run is registered.
pub async fn run_start(
    state: &AppState,
    engine: Engine,
    sink: Arc<dyn ProgressSink>,
    operation: Operation,
    hostnames: &[String],
) -> Result<RunStarted> {
    let hosts = load_hosts(state, hostnames)?;
    if hosts.is_empty() {
        return Err(ProvisionError::Config("No hosts registered".to_string()));
    }

    let run_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let handle = state
        .runs
        .register(RunSummary {
            run_id: run_id.clone(),
            method: operation.method(),
            total: hosts.len(),
            success: 0,
            failed: 0,
            started_at,
            finished_at: None,
        })
        .await;

    let context = RunContext::new(run_id.clone(), sink).with_secrets(run_secrets(state, &hosts));
    let accepted = RunAccepted {
        run_id,
        total: hosts.len(),
        started_at,
    };
    let completion = tokio::spawn(run_pipeline(engine, context, operation, hosts, handle));

    Ok(RunStarted {
        accepted,
        completion,
    })
}

pub async fn result_get(state: &AppState, run_id: &str) -> Result<RunResult> {
    if let Some(handle) = state.runs.get(run_id).await {
        return Ok(handle.snapshot().await);
    }

    lock_database(&state.database)?
        .get_run_result(run_id)?
        .ok_or_else(|| ProvisionError::Storage(format!("Run result `{run_id}` not found")))
}

pub fn render_result_text(result: &RunResult) -> String {
    let summary = &result.summary;
    let mut output = format!(
        "Run: {}\nMethod: {}\nStarted: {}\nFinished: {}\nTotal: {} Success: {} Failed: {}\n\n",
        summary.run_id,
        summary
            .method
            .map(|method| method.as_str())
            .unwrap_or("-"),
        summary.started_at.to_rfc3339(),
        summary
            .finished_at
            .map(|value| value.to_rfc3339())
            .unwrap_or_else(|| "running".to_string()),
        summary.total,
        summary.success,
        summary.failed,
    );

    for item in &result.items {
        output.push_str(&format!(
            "[{}] {} {}\n",
            status_label(&item.status),
            item.phase.as_str(),
            item.hostname
        ));
        if let Some(message) = &item.error_message {
            match &item.error_code {
                Some(code) => output.push_str(&format!("  error ({code}): {message}\n")),
                None => output.push_str(&format!("  note: {message}\n")),
            }
        }
    }
    output
}

pub async fn result_export_txt(
    state: &AppState,
    run_id: &str,
    output_path: Option<&str>,
) -> Result<PathBuf> {
    let result = result_get(state, run_id).await?;
    let destination = resolve_export_path(run_id, output_path)?;
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|error| {
            ProvisionError::Config(format!(
                "Failed to create export directory `{}`: {error}",
                parent.display()
            ))
        })?;
    }

    std::fs::write(&destination, render_result_text(&result)).map_err(|error| {
        ProvisionError::Config(format!(
            "Failed to write export file `{}`: {error}",
            destination.display()
        ))
    })?;
    Ok(destination)
}

/// Run a task descriptor against one host and return the final step records.
pub async fn tasks_run(
    state: &AppState,
    executor: Arc<dyn RemoteExecutor>,
    sink: Arc<dyn ProgressSink>,
    descriptor_path: &Path,
    hostname: &str,
    mode: ExecutionMode,
) -> Result<Vec<StepSnapshot>> {
    let descriptor = TaskDescriptor::load(descriptor_path)?;
    let host = load_hosts(state, &[hostname.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| ProvisionError::Config(format!("Unknown host `{hostname}`")))?;
    let context = RunContext::new(uuid::Uuid::new_v4().to_string(), sink)
        .with_secrets(run_secrets(state, std::slice::from_ref(&host)));

    tokio::task::spawn_blocking(move || {
        let tasks = DeclarativeTaskRunner::new(&context, executor.as_ref())
            .run(&descriptor, &host, mode)?;
        Ok::<_, ProvisionError>(tasks.iter().map(|task| task.snapshot()).collect::<Vec<_>>())
    })
    .await
    .map_err(|error| ProvisionError::Remote(format!("Task run join error: {error}")))?
}

pub async fn cache_methods(
    state: &AppState,
    connector: Arc<dyn DirectoryConnector>,
    sink: Arc<dyn ProgressSink>,
) -> Result<Vec<CacheMethodReport>> {
    let hosts = load_hosts(state, &[])?;
    let context = RunContext::new(uuid::Uuid::new_v4().to_string(), sink)
        .with_secrets(run_secrets(state, &hosts));
    let settings = state.config.directory.clone();

    tokio::task::spawn_blocking(move || {
        describe_cache_methods(&context, connector.as_ref(), &settings, &hosts)
    })
    .await
    .map_err(|error| ProvisionError::Remote(format!("Cache method query join error: {error}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{build_engine, render_result_text, result_get, run_start};
    use crate::config::ConsoleConfig;
    use crate::db::Database;
    use crate::installer::VerifyByIdempotentReinstall;
    use crate::models::{
        CacheMethod, HostOutcome, HostUpsertPayload, Phase, RunResult, RunSummary,
    };
    use crate::os::OsFamily;
    use crate::progress::MemorySink;
    use crate::state::AppState;
    use crate::task_worker::Operation;
    use crate::test_support::{sample_host, FakeFleet};

    #[test]
    fn export_lists_each_outcome() {
        let host = sample_host(1, "cache1");
        let error = crate::error::ProvisionError::connectivity("cache1", "refused");
        let result = RunResult {
            summary: RunSummary {
                run_id: "run-1".to_string(),
                method: Some(CacheMethod::Sharded),
                total: 1,
                success: 0,
                failed: 1,
                started_at: Utc::now(),
                finished_at: None,
            },
            items: vec![
                HostOutcome::success(&host, Phase::Install),
                HostOutcome::failure(&host, Phase::Configure, &error),
            ],
        };

        let text = render_result_text(&result);

        assert!(text.contains("Method: SHARDED"));
        assert!(text.contains("Finished: running"));
        assert!(text.contains("[SUCCESS] install cache1"));
        assert!(text.contains("[FAILED] configure cache1\n  error (CONNECTIVITY):"));
    }

    #[tokio::test]
    async fn started_runs_are_visible_then_persisted() {
        let state = AppState::new(
            Database::open_in_memory().expect("database"),
            ConsoleConfig::default(),
        );
        state
            .database
            .lock()
            .expect("lock")
            .insert_host(
                &HostUpsertPayload {
                    hostname: "cache1".to_string(),
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

        let fleet = FakeFleet::new();
        fleet.with_os("cache1", OsFamily::Ubuntu);
        let engine = build_engine(
            &state,
            Arc::new(fleet.clone()),
            Arc::new(VerifyByIdempotentReinstall),
        );

        let started = run_start(
            &state,
            engine,
            Arc::new(MemorySink::new()),
            Operation::Install { method: None },
            &[],
        )
        .await
        .expect("start");
        assert_eq!(started.accepted.total, 1);

        let result = started.completion.await.expect("join").expect("run");
        assert_eq!(result.summary.failed, 1);

        let fetched = result_get(&state, &started.accepted.run_id)
            .await
            .expect("result");
        assert_eq!(fetched.items.len(), 1);
        assert!(fetched.summary.finished_at.is_some());
    }

    #[tokio::test]
    async fn unknown_hosts_are_rejected_before_start() {
        let state = AppState::new(
            Database::open_in_memory().expect("database"),
            ConsoleConfig::default(),
        );
        let engine = build_engine(
            &state,
            Arc::new(FakeFleet::new()),
            Arc::new(VerifyByIdempotentReinstall),
        );
        let error = run_start(
            &state,
            engine,
            Arc::new(MemorySink::new()),
            Operation::Configure(CacheMethod::Cluster),
            &["ghost".to_string()],
        )
        .await
        .err()
        .expect("unknown host");
        assert_eq!(error.code(), "CONFIG");
    }
}
