use crate::error::{ProvisionError, Result};
use crate::models::Host;
use crate::os::{detect_os, OsInfo};
use crate::progress::{LogLevel, RunContext};
use crate::remote::{CommandResult, RemoteExecutor, RemoteSession};

/// Open a session to the host, logging the outcome against it. Connectivity
/// failures are returned so the caller can record them and skip the host.
pub fn open_session(
    context: &RunContext,
    executor: &dyn RemoteExecutor,
    host: &Host,
) -> Result<Box<dyn RemoteSession>> {
    match executor.open(&host.target()) {
        Ok(session) => {
            context.host(
                host.id,
                LogLevel::Debug,
                format!("Connected to server: {}", host.hostname),
            );
            Ok(session)
        }
        Err(error) => {
            context.host(
                host.id,
                LogLevel::Error,
                format!("Could not connect to the server over SSH. Error: {error}"),
            );
            Err(error)
        }
    }
}

pub fn close_session(context: &RunContext, host: &Host, mut session: Box<dyn RemoteSession>) {
    if let Err(error) = session.close() {
        context.host(
            host.id,
            LogLevel::Warning,
            format!("Failed to close session cleanly: {error}"),
        );
    }
}

/// Run a command and log the command, its stdout and its stderr. Execution
/// errors are logged and returned; a non-empty stderr alone is only a warning.
pub fn run_and_log(
    context: &RunContext,
    session: &mut dyn RemoteSession,
    host_id: u32,
    command: &str,
) -> Result<CommandResult> {
    context.host(host_id, LogLevel::Debug, command);
    match session.run(command) {
        Ok(result) => {
            if !result.stdout.trim().is_empty() {
                context.host(host_id, LogLevel::Debug, &result.stdout);
            }
            if !result.stderr.trim().is_empty() {
                context.host(host_id, LogLevel::Warning, &result.stderr);
            }
            Ok(result)
        }
        Err(error) => {
            context.host(
                host_id,
                LogLevel::Error,
                format!("Command `{command}` could not be executed: {error}"),
            );
            Err(error)
        }
    }
}

/// Use the OS stored by the install phase, probing the host only when the
/// record has none.
pub fn resolve_os(session: &mut dyn RemoteSession, host: &Host) -> Result<OsInfo> {
    match host.os() {
        Some(os) => Ok(os),
        None => detect_os(session, &host.hostname).map_err(|error| match error {
            ProvisionError::UnsupportedEnvironment { .. } => error,
            other => ProvisionError::Remote(format!(
                "OS detection on {} failed: {other}",
                host.hostname
            )),
        }),
    }
}
