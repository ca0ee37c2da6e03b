use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::{Channel, Session};

use crate::config::SshSettings;
use crate::db::HostKeyStore;
use crate::error::{ProvisionError, Result};
use crate::models::ConnectionTarget;
use crate::remote::{CommandResult, OutputChunks, RemoteExecutor, RemoteSession};
use crate::utils::{single_quote_escape, truncate_for_log};

pub const REMOTE_COMMAND_TIMEOUT_SECONDS: u64 = 15 * 60;
const CHUNK_SIZE: usize = 4096;
const SSH_OK_MARKER: &str = "__CACHEFLEET_SSH_OK__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

/// Opens SSH sessions with libssh2, falling back to the system `ssh`/`scp`
/// binaries when libssh2 rejects a private key the system client accepts.
pub struct SshExecutor {
    settings: SshSettings,
    auth: SshAuth,
    known_hosts: Option<Arc<dyn HostKeyStore>>,
}

impl SshExecutor {
    pub fn new(settings: SshSettings, auth: SshAuth) -> Self {
        Self {
            settings,
            auth,
            known_hosts: None,
        }
    }

    /// Pin host keys: the first fingerprint seen is stored, later mismatches
    /// refuse the connection.
    pub fn with_known_hosts(mut self, store: Arc<dyn HostKeyStore>) -> Self {
        self.known_hosts = Some(store);
        self
    }
}

impl RemoteExecutor for SshExecutor {
    fn open(&self, target: &ConnectionTarget) -> Result<Box<dyn RemoteSession>> {
        let session = connect_ssh(target, &self.settings, &self.auth, self.known_hosts.as_deref())?;
        Ok(Box::new(session))
    }
}

/// Trust the first fingerprint seen for an address and port; refuse any
/// later one that differs.
pub fn verify_host_key(
    store: &dyn HostKeyStore,
    target: &ConnectionTarget,
    port: u16,
    fingerprint: &str,
) -> Result<()> {
    let address = target.address();
    match store.get_host_key(address, port)? {
        None => {
            tracing::info!(host = %address, %fingerprint, "trusting host key on first use");
            store.upsert_host_key(address, port, fingerprint)
        }
        Some(known) if known == fingerprint => Ok(()),
        Some(known) => Err(ProvisionError::connectivity(
            &target.hostname,
            format!(
                "Host key mismatch (known {known}, offered {fingerprint}); possible reinstalled host or MITM"
            ),
        )),
    }
}

pub struct SshSession {
    backend: SessionBackend,
    pub fingerprint: String,
}

enum SessionBackend {
    LibSsh2(Session),
    SystemSsh(SystemSshContext),
}

struct SystemSshContext {
    host: String,
    port: u16,
    username: String,
    key_path: PathBuf,
    connect_timeout_secs: u64,
}

/// TCP connect and SSH handshake only. Nothing is sent to the server that
/// depends on credentials.
fn handshake(target: &ConnectionTarget, settings: &SshSettings) -> Result<(Session, String)> {
    let fail = |message: String| ProvisionError::connectivity(&target.hostname, message);

    let socket_address = format!("{}:{}", target.address(), settings.port);
    let resolved_socket = socket_address
        .to_socket_addrs()
        .map_err(|error| fail(format!("Failed to resolve `{socket_address}`: {error}")))?
        .next()
        .ok_or_else(|| fail(format!("No resolved socket address for `{socket_address}`")))?;

    let tcp_stream = TcpStream::connect_timeout(
        &resolved_socket,
        Duration::from_secs(settings.connect_timeout_secs),
    )
    .map_err(|error| {
        fail(format!(
            "Failed to establish TCP connection to `{socket_address}`: {error}"
        ))
    })?;
    tcp_stream
        .set_read_timeout(Some(Duration::from_secs(REMOTE_COMMAND_TIMEOUT_SECONDS)))
        .map_err(|error| fail(format!("Failed to configure TCP read timeout: {error}")))?;

    let mut session =
        Session::new().map_err(|error| fail(format!("Failed to initialize SSH session: {error}")))?;
    session.set_tcp_stream(tcp_stream);
    session
        .handshake()
        .map_err(|error| fail(format!("SSH handshake failed for `{socket_address}`: {error}")))?;

    let fingerprint = host_key_fingerprint(&session).map_err(fail)?;
    Ok((session, fingerprint))
}

/// Fingerprint of the key the host offers, without authenticating.
pub fn fetch_host_key(target: &ConnectionTarget, settings: &SshSettings) -> Result<String> {
    let (session, fingerprint) = handshake(target, settings)?;
    let _ = session.disconnect(None, "host key check", None);
    Ok(fingerprint)
}

/// Open an authenticated session. With `known_hosts`, the offered key is
/// checked before any credential leaves this machine.
pub fn connect_ssh(
    target: &ConnectionTarget,
    settings: &SshSettings,
    auth: &SshAuth,
    known_hosts: Option<&dyn HostKeyStore>,
) -> Result<SshSession> {
    let fail = |message: String| ProvisionError::connectivity(&target.hostname, message);

    let (session, fingerprint) = handshake(target, settings)?;
    if let Some(store) = known_hosts {
        verify_host_key(store, target, settings.port, &fingerprint)?;
    }

    match auth {
        SshAuth::Password(password) => {
            session
                .userauth_password(&target.user, password)
                .map_err(|error| fail(format!("SSH password authentication failed: {error}")))?;
        }
        SshAuth::Agent => {
            session
                .userauth_agent(&target.user)
                .map_err(|error| fail(format!("SSH agent authentication failed: {error}")))?;
        }
        SshAuth::Key { path, passphrase } => {
            if !path.exists() {
                return Err(fail(format!(
                    "Private key file does not exist: {}",
                    path.display()
                )));
            }

            let libssh2_result =
                session.userauth_pubkey_file(&target.user, None, path, passphrase.as_deref());

            if libssh2_result.is_err() || !session.authenticated() {
                let libssh2_error = libssh2_result
                    .err()
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| "authentication rejected".to_string());

                return match try_connect_with_system_ssh(target, settings, path) {
                    Ok(context) => Ok(SshSession {
                        backend: SessionBackend::SystemSsh(context),
                        fingerprint,
                    }),
                    Err(system_error) => Err(fail(format!(
                        "SSH private-key authentication failed. libssh2={libssh2_error}; ssh fallback={system_error}"
                    ))),
                };
            }
        }
    }

    if !session.authenticated() {
        return Err(fail("SSH authentication was rejected by the server".to_string()));
    }

    Ok(SshSession {
        backend: SessionBackend::LibSsh2(session),
        fingerprint,
    })
}

fn remote_error(message: String) -> ProvisionError {
    ProvisionError::Remote(message)
}

impl RemoteSession for SshSession {
    fn run(&mut self, command: &str) -> Result<CommandResult> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => run_command_via_libssh2(session, command),
            SessionBackend::SystemSsh(context) => run_command_via_system_ssh(context, command),
        }
    }

    fn run_streaming<'a>(&'a mut self, command: &str) -> Result<OutputChunks<'a>> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => {
                let mut channel = session
                    .channel_session()
                    .map_err(|error| remote_error(format!("Failed to open SSH channel: {error}")))?;
                channel.exec(command).map_err(|error| {
                    remote_error(format!("Failed to execute remote command: {error}"))
                })?;
                Ok(Box::new(ChannelChunks {
                    channel,
                    finished: false,
                }))
            }
            SessionBackend::SystemSsh(context) => {
                let mut child = system_ssh_command(context, command)
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(|error| {
                        remote_error(format!("Failed to launch ssh fallback process: {error}"))
                    })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    remote_error("ssh fallback process has no stdout".to_string())
                })?;
                Ok(Box::new(ChildChunks {
                    child,
                    stdout,
                    finished: false,
                }))
            }
        }
    }

    fn upload_file(&mut self, local: &Path, remote: &str) -> Result<()> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => {
                let mut source = std::fs::File::open(local).map_err(|error| {
                    remote_error(format!("Failed to open `{}`: {error}", local.display()))
                })?;
                let mut target = sftp_create(session, remote)?;
                std::io::copy(&mut source, &mut target)
                    .map_err(|error| remote_error(format!("Failed to upload `{remote}`: {error}")))?;
                Ok(())
            }
            SessionBackend::SystemSsh(context) => {
                let destination = format!("{}@{}:{remote}", context.username, context.host);
                run_scp(context, &local.to_string_lossy(), &destination)
            }
        }
    }

    fn write_file(&mut self, remote: &str, content: &str) -> Result<()> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => {
                let mut target = sftp_create(session, remote)?;
                target
                    .write_all(content.as_bytes())
                    .map_err(|error| remote_error(format!("Failed to write `{remote}`: {error}")))
            }
            SessionBackend::SystemSsh(context) => {
                let command = format!("cat > '{}'", single_quote_escape(remote));
                let mut child = system_ssh_command(context, &command)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|error| {
                        remote_error(format!("Failed to launch ssh fallback process: {error}"))
                    })?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(content.as_bytes()).map_err(|error| {
                        remote_error(format!("Failed to stream `{remote}` into ssh: {error}"))
                    })?;
                }
                let output = child.wait_with_output().map_err(|error| {
                    remote_error(format!("Failed to collect ssh fallback output: {error}"))
                })?;
                if !output.status.success() {
                    return Err(remote_error(format!(
                        "Writing `{remote}` failed: {}",
                        truncate_for_log(&String::from_utf8_lossy(&output.stderr))
                    )));
                }
                Ok(())
            }
        }
    }

    fn download_file(&mut self, remote: &str, local: &Path) -> Result<()> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => {
                let sftp = session
                    .sftp()
                    .map_err(|error| remote_error(format!("Failed to start SFTP: {error}")))?;
                let mut source = sftp
                    .open(Path::new(remote))
                    .map_err(|error| remote_error(format!("Failed to open `{remote}`: {error}")))?;
                let mut target = std::fs::File::create(local)?;
                std::io::copy(&mut source, &mut target).map_err(|error| {
                    remote_error(format!("Failed to download `{remote}`: {error}"))
                })?;
                Ok(())
            }
            SessionBackend::SystemSsh(context) => {
                let source = format!("{}@{}:{remote}", context.username, context.host);
                run_scp(context, &source, &local.to_string_lossy())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        match &self.backend {
            SessionBackend::LibSsh2(session) => session
                .disconnect(None, "session finished", None)
                .map_err(|error| remote_error(format!("Failed to close SSH session: {error}"))),
            SessionBackend::SystemSsh(_) => Ok(()),
        }
    }
}

fn sftp_create(session: &Session, remote: &str) -> Result<ssh2::File> {
    let sftp = session
        .sftp()
        .map_err(|error| remote_error(format!("Failed to start SFTP: {error}")))?;
    sftp.create(Path::new(remote))
        .map_err(|error| remote_error(format!("Failed to create `{remote}`: {error}")))
}

struct ChannelChunks {
    channel: Channel,
    finished: bool,
}

impl Iterator for ChannelChunks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut buffer = [0u8; CHUNK_SIZE];
        match self.channel.read(&mut buffer) {
            Ok(0) => {
                self.finished = true;
                let _ = self.channel.wait_close();
                None
            }
            Ok(read) => Some(Ok(String::from_utf8_lossy(&buffer[..read]).to_string())),
            Err(error) => {
                self.finished = true;
                Some(Err(remote_error(format!("Failed to read SSH stdout: {error}"))))
            }
        }
    }
}

struct ChildChunks {
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Iterator for ChildChunks {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut buffer = [0u8; CHUNK_SIZE];
        match self.stdout.read(&mut buffer) {
            Ok(0) => {
                self.finished = true;
                let _ = self.child.wait();
                None
            }
            Ok(read) => Some(Ok(String::from_utf8_lossy(&buffer[..read]).to_string())),
            Err(error) => {
                self.finished = true;
                let _ = self.child.kill();
                Some(Err(remote_error(format!(
                    "Failed to read ssh fallback stdout: {error}"
                ))))
            }
        }
    }
}

fn run_command_via_libssh2(session: &Session, command: &str) -> Result<CommandResult> {
    let mut channel = session
        .channel_session()
        .map_err(|error| remote_error(format!("Failed to open SSH channel: {error}")))?;
    channel
        .exec(command)
        .map_err(|error| remote_error(format!("Failed to execute remote command: {error}")))?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    channel
        .read_to_string(&mut stdout)
        .map_err(|error| remote_error(format!("Failed to read SSH stdout: {error}")))?;
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|error| remote_error(format!("Failed to read SSH stderr: {error}")))?;

    channel.wait_close().map_err(|error| {
        remote_error(format!("Failed while waiting for SSH command close: {error}"))
    })?;

    let exit_status = channel
        .exit_status()
        .map_err(|error| remote_error(format!("Failed to obtain SSH exit status: {error}")))?;

    Ok(CommandResult {
        command: command.to_string(),
        stdout,
        stderr,
        exit_status,
    })
}

fn system_ssh_command(context: &SystemSshContext, command: &str) -> Command {
    let mut ssh = Command::new("ssh");
    for arg in build_system_ssh_args(context) {
        ssh.arg(arg);
    }
    ssh.arg(format!("{}@{}", context.username, context.host));
    ssh.arg(command);
    ssh
}

fn run_command_via_system_ssh(context: &SystemSshContext, command: &str) -> Result<CommandResult> {
    let output = system_ssh_command(context, command)
        .stdin(Stdio::null())
        .output()
        .map_err(|error| remote_error(format!("Failed to launch ssh fallback process: {error}")))?;

    Ok(CommandResult {
        command: command.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_status: output.status.code().unwrap_or(255),
    })
}

fn run_scp(context: &SystemSshContext, source: &str, destination: &str) -> Result<()> {
    let mut scp = Command::new("scp");
    scp.arg("-P").arg(context.port.to_string());
    for arg in build_system_ssh_args(context).into_iter().skip(2) {
        scp.arg(arg);
    }
    let output = scp
        .arg(source)
        .arg(destination)
        .stdin(Stdio::null())
        .output()
        .map_err(|error| remote_error(format!("Failed to launch scp: {error}")))?;
    if !output.status.success() {
        return Err(remote_error(format!(
            "scp `{source}` -> `{destination}` failed: {}",
            truncate_for_log(&String::from_utf8_lossy(&output.stderr))
        )));
    }
    Ok(())
}

fn host_key_fingerprint(session: &Session) -> std::result::Result<String, String> {
    let (host_key, _host_key_type) = session
        .host_key()
        .ok_or_else(|| "SSH session did not provide host key bytes".to_string())?;
    let digest = Sha256::digest(host_key);
    let encoded = STANDARD_NO_PAD.encode(digest);
    Ok(format!("SHA256:{encoded}"))
}

fn try_connect_with_system_ssh(
    target: &ConnectionTarget,
    settings: &SshSettings,
    key_path: &Path,
) -> std::result::Result<SystemSshContext, String> {
    Command::new("ssh")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|error| format!("ssh is not available in PATH: {error}"))?;

    let context = SystemSshContext {
        host: target.address().to_string(),
        port: settings.port,
        username: target.user.clone(),
        key_path: key_path.to_path_buf(),
        connect_timeout_secs: settings.connect_timeout_secs,
    };

    let verification = run_command_via_system_ssh(&context, &format!("echo {SSH_OK_MARKER}"))
        .map_err(|error| error.to_string())?;

    if verification.exit_status != 0 || !verification.stdout.contains(SSH_OK_MARKER) {
        return Err(format!(
            "ssh auth check failed (exit={}). stdout=`{}` stderr=`{}`",
            verification.exit_status,
            truncate_for_log(&verification.stdout),
            truncate_for_log(&verification.stderr)
        ));
    }

    Ok(context)
}

/// Shared by `ssh` and `scp`; the first two entries are the port flag, which
/// `scp` spells differently.
fn build_system_ssh_args(context: &SystemSshContext) -> Vec<String> {
    vec![
        "-p".to_string(),
        context.port.to_string(),
        "-i".to_string(),
        context.key_path.to_string_lossy().to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", context.connect_timeout_secs),
        "-o".to_string(),
        "PreferredAuthentications=publickey".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::{build_system_ssh_args, verify_host_key, SystemSshContext};
    use crate::db::{Database, HostKeyStore};
    use crate::models::ConnectionTarget;

    #[test]
    fn system_ssh_args_are_non_interactive() {
        let context = SystemSshContext {
            host: "10.0.0.1".to_string(),
            port: 2222,
            username: "root".to_string(),
            key_path: PathBuf::from("/root/.ssh/id_rsa"),
            connect_timeout_secs: 10,
        };
        let args = build_system_ssh_args(&context);
        assert_eq!(&args[..2], &["-p".to_string(), "2222".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"/root/.ssh/id_rsa".to_string()));
    }

    #[test]
    fn first_host_key_is_pinned_and_a_changed_one_refused() {
        let store = Mutex::new(Database::open_in_memory().expect("database"));
        let target = ConnectionTarget::new("cache1", Some("10.0.0.1".to_string()), "root");

        verify_host_key(&store, &target, 22, "SHA256:first").expect("first use");
        assert_eq!(
            store.get_host_key("10.0.0.1", 22).expect("lookup").as_deref(),
            Some("SHA256:first")
        );
        verify_host_key(&store, &target, 22, "SHA256:first").expect("same key");

        let error = verify_host_key(&store, &target, 22, "SHA256:other").expect_err("mismatch");
        assert_eq!(error.code(), "CONNECTIVITY");
        assert!(error.to_string().contains("Host key mismatch"));
        assert_eq!(
            store.get_host_key("10.0.0.1", 22).expect("lookup").as_deref(),
            Some("SHA256:first")
        );
    }
}
