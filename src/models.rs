use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::os::OsInfo;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: u32,
    pub hostname: String,
    pub ip: Option<String>,
    pub ssh_user: String,
    pub os_label: Option<String>,
    pub redis_ready: bool,
    pub stunnel_ready: bool,
    pub is_primary: bool,
    pub containerized: bool,
    #[serde(default)]
    pub remember_password: bool,
    #[serde(default, skip_serializing)]
    pub directory_password: Option<String>,
}

impl Host {
    /// Address used for tunnel endpoints and cluster membership: the IP
    /// override when present, the hostname otherwise.
    pub fn address(&self) -> &str {
        self.ip
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.hostname)
    }

    pub fn is_ready(&self) -> bool {
        self.redis_ready && self.stunnel_ready
    }

    pub fn os(&self) -> Option<OsInfo> {
        self.os_label.as_deref().and_then(OsInfo::from_label)
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            hostname: self.hostname.clone(),
            ip: self.ip.clone(),
            user: self.ssh_user.clone(),
            os: self.os(),
        }
    }
}

/// Transient description of where to connect. Distinct from the persisted
/// [`Host`] so callers can build one for a host they do not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub hostname: String,
    pub ip: Option<String>,
    pub user: String,
    pub os: Option<OsInfo>,
}

impl ConnectionTarget {
    pub fn new(hostname: impl Into<String>, ip: Option<String>, user: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ip,
            user: user.into(),
            os: None,
        }
    }

    pub fn address(&self) -> &str {
        self.ip
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.hostname)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUpsertPayload {
    pub hostname: String,
    pub ip: Option<String>,
    pub ssh_user: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub containerized: bool,
    #[serde(default)]
    pub remember_password: bool,
    #[serde(default)]
    pub directory_password: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheMethod {
    Sharded,
    Standalone,
    Cluster,
}

impl CacheMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sharded => "SHARDED",
            Self::Standalone => "STANDALONE",
            Self::Cluster => "CLUSTER",
        }
    }

    /// Methods that write stunnel configuration and therefore need the tunnel
    /// service restarted.
    pub fn uses_tunnels(&self) -> bool {
        matches!(self, Self::Sharded | Self::Standalone)
    }
}

impl std::str::FromStr for CacheMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SHARDED" => Ok(Self::Sharded),
            "STANDALONE" => Ok(Self::Standalone),
            "CLUSTER" => Ok(Self::Cluster),
            _ => Err(format!("Unsupported cache method: {value}")),
        }
    }
}

impl std::fmt::Display for CacheMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Install,
    Configure,
    Restart,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Configure => "configure",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostOutcome {
    pub host_id: u32,
    pub hostname: String,
    pub phase: Phase,
    pub status: HostStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl HostOutcome {
    pub fn success(host: &Host, phase: Phase) -> Self {
        Self {
            host_id: host.id,
            hostname: host.hostname.clone(),
            phase,
            status: HostStatus::Success,
            error_code: None,
            error_message: None,
        }
    }

    pub fn failure(host: &Host, phase: Phase, error: &crate::error::ProvisionError) -> Self {
        Self {
            host_id: host.id,
            hostname: host.hostname.clone(),
            phase,
            status: HostStatus::Failed,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }

    pub fn skipped(host: &Host, phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            host_id: host.id,
            hostname: host.hostname.clone(),
            phase,
            status: HostStatus::Skipped,
            error_code: None,
            error_message: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub method: Option<CacheMethod>,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub summary: RunSummary,
    pub items: Vec<HostOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: String,
    pub total: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheMethodReport {
    pub host_id: u32,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvImportError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvImportResult {
    pub imported: usize,
    pub failed: usize,
    pub errors: Vec<CsvImportError>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyState {
    Untrusted,
    Trusted,
    Mismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyReport {
    pub hostname: String,
    pub address: String,
    pub state: HostKeyState,
    pub fingerprint: String,
    pub known_fingerprint: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{CacheMethod, Host};

    fn host(ip: Option<&str>) -> Host {
        Host {
            id: 1,
            hostname: "cache1.example.org".to_string(),
            ip: ip.map(str::to_string),
            ssh_user: "root".to_string(),
            os_label: Some("CentOS 7".to_string()),
            redis_ready: true,
            stunnel_ready: false,
            is_primary: false,
            containerized: false,
            remember_password: false,
            directory_password: None,
        }
    }

    #[test]
    fn address_prefers_ip_override() {
        assert_eq!(host(Some("10.0.0.5")).address(), "10.0.0.5");
        assert_eq!(host(None).address(), "cache1.example.org");
        assert_eq!(host(Some("  ")).address(), "cache1.example.org");
    }

    #[test]
    fn readiness_needs_both_components() {
        let mut value = host(None);
        assert!(!value.is_ready());
        value.stunnel_ready = true;
        assert!(value.is_ready());
    }

    #[test]
    fn cache_method_parses_case_insensitively() {
        assert_eq!(CacheMethod::from_str("sharded"), Ok(CacheMethod::Sharded));
        assert_eq!(CacheMethod::from_str(" CLUSTER "), Ok(CacheMethod::Cluster));
        assert!(CacheMethod::from_str("memcached").is_err());
        assert!(CacheMethod::Standalone.uses_tunnels());
        assert!(!CacheMethod::Cluster.uses_tunnels());
    }
}
