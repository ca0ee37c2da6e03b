use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::directory::{DirectoryConfigStore, DirectoryConnector, DirectoryEndpoint};
use crate::error::{ProvisionError, Result};
use crate::models::{ConnectionTarget, Host};
use crate::os::OsFamily;
use crate::remote::{CommandResult, OutputChunks, RemoteExecutor, RemoteSession};

pub const DEFAULT_CACHE_ENTRY: &str = r#"{"cacheProviderType":"IN_MEMORY","memcachedConfiguration":{"servers":"localhost:11211"},"redisConfiguration":{"redisProviderType":"STANDALONE","servers":"localhost:6379","defaultPutExpiration":60}}"#;

pub fn sample_host(id: u32, hostname: &str) -> Host {
    Host {
        id,
        hostname: hostname.to_string(),
        ip: Some(format!("10.0.0.{id}")),
        ssh_user: "root".to_string(),
        os_label: Some("Ubuntu 16".to_string()),
        redis_ready: true,
        stunnel_ready: true,
        is_primary: false,
        containerized: false,
        remember_password: false,
        directory_password: Some("directory-secret".to_string()),
    }
}

#[derive(Clone)]
struct ScriptedResponse {
    host: Option<String>,
    pattern: String,
    stdout: String,
    stderr: String,
    exit_status: i32,
}

#[derive(Default)]
struct FleetState {
    unreachable: HashSet<String>,
    responses: Vec<ScriptedResponse>,
    files: HashMap<(String, String), String>,
    journal: Vec<(String, String)>,
    opened: Vec<String>,
    closed: Vec<String>,
}

/// Scripted stand-in for SSH. Commands succeed with empty output unless a
/// response was registered for a substring of the command; the most recently
/// registered match wins.
#[derive(Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().expect("fleet state lock")
    }

    pub fn unreachable(&self, hostname: &str) {
        self.lock().unreachable.insert(hostname.to_string());
    }

    pub fn respond(&self, pattern: &str, stdout: &str) {
        self.push_response(None, pattern, stdout, "", 0);
    }

    pub fn respond_on(&self, hostname: &str, pattern: &str, stdout: &str, stderr: &str) {
        self.push_response(Some(hostname), pattern, stdout, stderr, 0);
    }

    pub fn respond_exit(&self, hostname: &str, pattern: &str, exit_status: i32) {
        self.push_response(Some(hostname), pattern, "", "", exit_status);
    }

    fn push_response(
        &self,
        hostname: Option<&str>,
        pattern: &str,
        stdout: &str,
        stderr: &str,
        exit_status: i32,
    ) {
        self.lock().responses.push(ScriptedResponse {
            host: hostname.map(str::to_string),
            pattern: pattern.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_status,
        });
    }

    pub fn with_os(&self, hostname: &str, family: OsFamily) {
        match family {
            OsFamily::Ubuntu => {
                self.respond_on(hostname, "ls /etc/*release", "/etc/lsb-release\n/etc/os-release\n", "");
                self.respond_on(
                    hostname,
                    "cat /etc/lsb-release",
                    "DISTRIB_ID=Ubuntu\nDISTRIB_RELEASE=16.04\nDISTRIB_CODENAME=xenial\n",
                    "",
                );
            }
            OsFamily::CentOs => {
                self.respond_on(
                    hostname,
                    "ls /etc/*release",
                    "/etc/centos-release\n/etc/os-release\n/etc/redhat-release\n",
                    "",
                );
                self.respond_on(
                    hostname,
                    "cat /etc/centos-release",
                    "CentOS Linux release 7.4.1708 (Core)\n",
                    "",
                );
            }
        }
    }

    pub fn put_file(&self, hostname: &str, path: &str, content: &str) {
        self.lock()
            .files
            .insert((hostname.to_string(), path.to_string()), content.to_string());
    }

    pub fn file(&self, hostname: &str, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(hostname.to_string(), path.to_string()))
            .cloned()
    }

    pub fn commands(&self, hostname: &str) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|(host, _)| host == hostname)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn opened(&self, hostname: &str) -> usize {
        self.lock()
            .opened
            .iter()
            .filter(|host| host.as_str() == hostname)
            .count()
    }

    pub fn closed(&self, hostname: &str) -> usize {
        self.lock()
            .closed
            .iter()
            .filter(|host| host.as_str() == hostname)
            .count()
    }
}

impl RemoteExecutor for FakeFleet {
    fn open(&self, target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.lock();
        if state.unreachable.contains(&target.hostname) {
            return Err(ProvisionError::connectivity(
                &target.hostname,
                "connection refused",
            ));
        }
        state.opened.push(target.hostname.clone());
        Ok(Box::new(FakeSession {
            hostname: target.hostname.clone(),
            fleet: self.clone(),
        }))
    }
}

struct FakeSession {
    hostname: String,
    fleet: FakeFleet,
}

impl RemoteSession for FakeSession {
    fn run(&mut self, command: &str) -> Result<CommandResult> {
        let mut state = self.fleet.lock();
        state
            .journal
            .push((self.hostname.clone(), command.to_string()));
        let response = state
            .responses
            .iter()
            .rev()
            .find(|response| {
                response
                    .host
                    .as_deref()
                    .map(|host| host == self.hostname)
                    .unwrap_or(true)
                    && command.contains(&response.pattern)
            })
            .cloned();

        Ok(match response {
            Some(response) => CommandResult {
                command: command.to_string(),
                stdout: response.stdout,
                stderr: response.stderr,
                exit_status: response.exit_status,
            },
            None => CommandResult {
                command: command.to_string(),
                ..CommandResult::default()
            },
        })
    }

    fn run_streaming<'a>(&'a mut self, command: &str) -> Result<OutputChunks<'a>> {
        let result = self.run(command)?;
        let chunks = result
            .stdout
            .split_inclusive('\n')
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<_>>();
        Ok(Box::new(chunks.into_iter()))
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        let content = std::fs::read_to_string(local)?;
        self.write_file(remote, &content)
    }

    fn write_file(&mut self, remote: &str, content: &str) -> Result<()> {
        self.fleet.put_file(&self.hostname, remote, content);
        Ok(())
    }

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        let content = self
            .fleet
            .file(&self.hostname, remote)
            .ok_or_else(|| ProvisionError::Remote(format!("No such file `{remote}`")))?;
        std::fs::write(local, content)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.fleet.lock().closed.push(self.hostname.clone());
        Ok(())
    }
}

#[derive(Default)]
struct DirectoryState {
    entries: HashMap<String, String>,
    unreachable: HashSet<String>,
    rejected: HashSet<String>,
    connects: Vec<(String, u16, bool)>,
}

/// In-memory directory. Every host starts with [`DEFAULT_CACHE_ENTRY`].
#[derive(Clone, Default)]
pub struct FakeDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().expect("directory state lock")
    }

    pub fn unreachable(&self, hostname: &str) {
        self.lock().unreachable.insert(hostname.to_string());
    }

    pub fn reject_writes(&self, hostname: &str) {
        self.lock().rejected.insert(hostname.to_string());
    }

    pub fn entry(&self, hostname: &str) -> Option<String> {
        self.lock().entries.get(hostname).cloned()
    }

    pub fn connects(&self) -> Vec<(String, u16, bool)> {
        self.lock().connects.clone()
    }
}

impl DirectoryConnector for FakeDirectory {
    fn connect(
        &self,
        target: &ConnectionTarget,
        endpoint: &DirectoryEndpoint,
    ) -> Result<Box<dyn DirectoryConfigStore>> {
        let mut state = self.lock();
        if state.unreachable.contains(&target.hostname) {
            return Err(ProvisionError::config_store(
                &target.hostname,
                "LDAP socket open failed",
            ));
        }
        state
            .connects
            .push((target.hostname.clone(), endpoint.port, endpoint.tls));
        Ok(Box::new(FakeStore {
            hostname: target.hostname.clone(),
            directory: self.clone(),
        }))
    }
}

struct FakeStore {
    hostname: String,
    directory: FakeDirectory,
}

impl DirectoryConfigStore for FakeStore {
    fn read_attribute(&mut self, _name: &str) -> Result<String> {
        Ok(self
            .directory
            .entry(&self.hostname)
            .unwrap_or_else(|| DEFAULT_CACHE_ENTRY.to_string()))
    }

    fn write_attribute(&mut self, _name: &str, value: &str) -> Result<bool> {
        let mut state = self.directory.lock();
        if state.rejected.contains(&self.hostname) {
            return Ok(false);
        }
        state
            .entries
            .insert(self.hostname.clone(), value.to_string());
        Ok(true)
    }
}
