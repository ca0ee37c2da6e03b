use std::path::Path;

use crate::error::{ProvisionError, Result};
use crate::models::ConnectionTarget;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

pub type OutputChunks<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

/// A command and file-transfer session to one host.
///
/// Sessions are opened per host and per phase; they are never shared between
/// hosts or reused across runs.
pub trait RemoteSession: Send {
    fn run(&mut self, command: &str) -> Result<CommandResult>;

    /// Output chunks in arrival order. The iterator ends when the command
    /// finishes.
    fn run_streaming<'a>(&'a mut self, command: &str) -> Result<OutputChunks<'a>>;

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn write_file(&mut self, remote: &str, content: &str) -> Result<()>;

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn read_file(&mut self, remote: &str) -> Result<String> {
        let staging = tempfile::NamedTempFile::new()?;
        self.download_file(remote, staging.path())?;
        std::fs::read_to_string(staging.path()).map_err(|error| {
            ProvisionError::Remote(format!("Downloaded `{remote}` is not valid text: {error}"))
        })
    }
}

pub trait RemoteExecutor: Send + Sync {
    fn open(&self, target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>>;
}
