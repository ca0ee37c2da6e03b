//! Command line front end for the cachefleet console.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use cachefleet::commands_server::{
    host_create, host_delete, host_list, host_set_primary, hostkey_check, hosts_import_csv,
};
use cachefleet::commands_task::{
    build_engine, cache_methods, result_export_txt, result_get, run_start, ssh_executor, tasks_run,
};
use cachefleet::config::{ConsoleConfig, DEFAULT_CONFIG_FILE};
use cachefleet::db::Database;
use cachefleet::installer::{InstallVerifier, VerifyByIdempotentReinstall, VerifyByPackageQuery};
use cachefleet::ldap_tools::LdapToolsConnector;
use cachefleet::models::{CacheMethod, HostUpsertPayload};
use cachefleet::progress::{
    ChannelProgressSink, FanoutSink, ProgressEvent, ProgressSink, TracingProgressSink,
};
use cachefleet::state::AppState;
use cachefleet::task_runner::ExecutionMode;
use cachefleet::task_worker::Operation;
use cachefleet::utils::status_label;
use cachefleet::{ProvisionError, Result};

#[derive(Parser, Debug)]
#[command(name = "cachefleet")]
#[command(about = "Install and lay out a Redis cache fleet over SSH")]
struct Cli {
    /// Console configuration (TOML). Defaults to ./cachefleet.toml when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `database_path` from the configuration.
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Print every progress record as a JSON line on stdout.
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the host inventory.
    #[command(subcommand)]
    Host(HostCommand),
    /// Install Redis and stunnel on every selected host.
    Install {
        #[arg(long)]
        method: Option<CacheMethod>,
        #[arg(long, value_enum, default_value_t = VerifyMode::IdempotentReinstall)]
        verify: VerifyMode,
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Write the topology for a cache method and publish it to the directory.
    Configure {
        #[arg(long)]
        method: CacheMethod,
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Restart the services a cache method depends on.
    Restart {
        #[arg(long)]
        method: CacheMethod,
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Install, configure and restart in one run.
    Provision {
        #[arg(long)]
        method: CacheMethod,
        #[arg(long, value_enum, default_value_t = VerifyMode::IdempotentReinstall)]
        verify: VerifyMode,
        #[arg(long = "host")]
        hosts: Vec<String>,
    },
    /// Show the cache method each host's directory currently advertises.
    Methods,
    /// Run a declarative task descriptor against one host.
    Tasks {
        #[arg(long)]
        descriptor: PathBuf,
        #[arg(long)]
        host: String,
        /// Report output while each command is still running.
        #[arg(long)]
        stream: bool,
    },
    /// Print a stored run result as JSON.
    Show {
        #[arg(long)]
        run: String,
    },
    /// Write a stored run result as a text report.
    Export {
        #[arg(long)]
        run: String,
        #[arg(long)]
        output: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum HostCommand {
    Add {
        hostname: String,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long, default_value = "root")]
        user: String,
        #[arg(long)]
        primary: bool,
        #[arg(long)]
        containerized: bool,
        /// Directory bind password for this host.
        #[arg(long, env = "CACHEFLEET_DIRECTORY_PASSWORD", hide_env_values = true)]
        directory_password: Option<String>,
        /// Keep the directory password in the OS keyring.
        #[arg(long)]
        remember_password: bool,
    },
    List,
    Remove {
        hostname: String,
    },
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Compare the host's SSH key with the stored fingerprint.
    Check {
        hostname: String,
        #[arg(long)]
        trust: bool,
    },
    /// Make this host the proxy/primary.
    Primary {
        hostname: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum VerifyMode {
    IdempotentReinstall,
    PackageQuery,
}

impl VerifyMode {
    fn verifier(self) -> Arc<dyn InstallVerifier> {
        match self {
            Self::IdempotentReinstall => Arc::new(VerifyByIdempotentReinstall),
            Self::PackageQuery => Arc::new(VerifyByPackageQuery),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CACHEFLEET_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error [{}]: {error}", error.code());
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ConsoleConfig> {
    match path {
        Some(path) => ConsoleConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            ConsoleConfig::load(Path::new(DEFAULT_CONFIG_FILE))
        }
        None => Ok(ConsoleConfig::default()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|error| ProvisionError::Config(format!("Failed to render JSON: {error}")))?;
    println!("{text}");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    let database_path = config.resolve_database_path()?;
    tracing::debug!(path = %database_path.display(), "opening database");
    let state = AppState::new(Database::open(&database_path)?, config);

    let mut printer = None;
    let sink: Arc<dyn ProgressSink> = if cli.events {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        printer = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        }));
        let sinks: Vec<Arc<dyn ProgressSink>> = vec![
            Arc::new(TracingProgressSink),
            Arc::new(ChannelProgressSink::new(tx)),
        ];
        Arc::new(FanoutSink::new(sinks))
    } else {
        Arc::new(TracingProgressSink)
    };

    let outcome = dispatch(&state, sink, cli.command).await;
    // The printer ends once every sender has been dropped with the sink.
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    outcome
}

async fn dispatch(state: &AppState, sink: Arc<dyn ProgressSink>, command: Command) -> Result<()> {
    match command {
        Command::Host(command) => host_command(state, command).await,
        Command::Install {
            method,
            verify,
            hosts,
        } => pipeline(state, sink, Operation::Install { method }, verify, &hosts).await,
        Command::Configure { method, hosts } => {
            pipeline(
                state,
                sink,
                Operation::Configure(method),
                VerifyMode::IdempotentReinstall,
                &hosts,
            )
            .await
        }
        Command::Restart { method, hosts } => {
            pipeline(
                state,
                sink,
                Operation::Restart(method),
                VerifyMode::IdempotentReinstall,
                &hosts,
            )
            .await
        }
        Command::Provision {
            method,
            verify,
            hosts,
        } => pipeline(state, sink, Operation::Provision(method), verify, &hosts).await,
        Command::Methods => {
            let connector = Arc::new(LdapToolsConnector::new(ssh_executor(state)));
            for report in cache_methods(state, connector, sink).await? {
                println!("{}\t{}", report.host_id, report.method);
            }
            Ok(())
        }
        Command::Tasks {
            descriptor,
            host,
            stream,
        } => {
            let mode = if stream {
                ExecutionMode::Stream
            } else {
                ExecutionMode::Collect
            };
            let steps = tasks_run(state, ssh_executor(state), sink, &descriptor, &host, mode).await?;
            print_json(&steps)
        }
        Command::Show { run } => print_json(&result_get(state, &run).await?),
        Command::Export { run, output } => {
            let path = result_export_txt(state, &run, output.as_deref()).await?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn pipeline(
    state: &AppState,
    sink: Arc<dyn ProgressSink>,
    operation: Operation,
    verify: VerifyMode,
    hosts: &[String],
) -> Result<()> {
    let engine = build_engine(state, ssh_executor(state), verify.verifier());
    let started = run_start(state, engine, sink, operation, hosts).await?;
    tracing::info!(
        run_id = %started.accepted.run_id,
        total = started.accepted.total,
        "run started"
    );

    let result = started
        .completion
        .await
        .map_err(|error| ProvisionError::Remote(format!("Run join error: {error}")))??;

    for item in &result.items {
        println!(
            "{:<8} {:<10} {}{}",
            status_label(&item.status),
            item.phase.as_str(),
            item.hostname,
            item.error_message
                .as_deref()
                .map(|message| format!("  {message}"))
                .unwrap_or_default()
        );
    }
    println!(
        "run {}: {} hosts, {} succeeded, {} failed",
        result.summary.run_id, result.summary.total, result.summary.success, result.summary.failed
    );
    Ok(())
}

async fn host_command(state: &AppState, command: HostCommand) -> Result<()> {
    match command {
        HostCommand::Add {
            hostname,
            ip,
            user,
            primary,
            containerized,
            directory_password,
            remember_password,
        } => {
            let host = host_create(
                state,
                HostUpsertPayload {
                    hostname,
                    ip,
                    ssh_user: user,
                    is_primary: primary,
                    containerized,
                    remember_password,
                    directory_password,
                },
            )
            .await?;
            println!("added {} (id {})", host.hostname, host.id);
            Ok(())
        }
        HostCommand::List => print_json(&host_list(state).await?),
        HostCommand::Remove { hostname } => {
            host_delete(state, &hostname).await?;
            println!("removed {hostname}");
            Ok(())
        }
        HostCommand::Import { csv } => {
            let result = hosts_import_csv(state, &csv).await?;
            for error in &result.errors {
                eprintln!("line {}: {}", error.line, error.message);
            }
            println!("imported {}, failed {}", result.imported, result.failed);
            Ok(())
        }
        HostCommand::Check { hostname, trust } => {
            print_json(&hostkey_check(state, &hostname, trust).await?)
        }
        HostCommand::Primary { hostname } => {
            let host = host_set_primary(state, &hostname).await?;
            println!("{} is now the primary host", host.hostname);
            Ok(())
        }
    }
}
