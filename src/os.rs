use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::remote::RemoteSession;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Ubuntu,
    CentOs,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ubuntu => "Ubuntu",
            Self::CentOs => "CentOS",
        }
    }

    /// Key used by task descriptors.
    pub fn descriptor_key(&self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::CentOs => "centos",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsInfo {
    pub family: OsFamily,
    pub major_version: Option<u32>,
}

impl OsInfo {
    pub fn new(family: OsFamily, major_version: Option<u32>) -> Self {
        Self {
            family,
            major_version,
        }
    }

    /// Human readable label persisted on the host record, e.g. `CentOS 7`.
    pub fn label(&self) -> String {
        match self.major_version {
            Some(version) => format!("{} {version}", self.family.as_str()),
            None => self.family.as_str().to_string(),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let mut parts = label.split_whitespace();
        let family = match parts.next()? {
            "Ubuntu" => OsFamily::Ubuntu,
            "CentOS" => OsFamily::CentOs,
            _ => return None,
        };
        let major_version = parts.next().and_then(|value| value.parse::<u32>().ok());
        Some(Self::new(family, major_version))
    }

    pub fn is_centos7(&self) -> bool {
        self.family == OsFamily::CentOs && self.major_version == Some(7)
    }

    pub fn service_manager(&self) -> ServiceManager {
        let systemd_since = match self.family {
            OsFamily::Ubuntu => 16,
            OsFamily::CentOs => 7,
        };
        match self.major_version {
            Some(version) if version >= systemd_since => ServiceManager::Systemd,
            _ => ServiceManager::SysV,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    SysV,
    Systemd,
}

impl ServiceManager {
    pub fn restart(&self, service: &str) -> String {
        match self {
            Self::SysV => format!("service {service} restart"),
            Self::Systemd => format!("systemctl restart {service}"),
        }
    }
}

fn version_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"(?m)(?:VERSION_ID="?|DISTRIB_RELEASE=|release\s+)(\d+)"#)
            .expect("invalid release version regex")
    })
}

/// Classify release-info text. Matching is by substring, the same way the
/// release files are written by the distributions.
pub fn parse_release(text: &str) -> Option<OsInfo> {
    let family = if text.contains("Ubuntu") {
        OsFamily::Ubuntu
    } else if text.contains("CentOS") {
        OsFamily::CentOs
    } else {
        return None;
    };

    let major_version = version_regex()
        .captures(text)
        .and_then(|captures| captures.get(1))
        .and_then(|value| value.as_str().parse::<u32>().ok());

    Some(OsInfo::new(family, major_version))
}

pub fn detect_os(session: &mut dyn RemoteSession, hostname: &str) -> Result<OsInfo> {
    let listing = session.run("ls /etc/*release")?;
    let Some(release_file) = listing.stdout.split_whitespace().next() else {
        return Err(ProvisionError::UnsupportedEnvironment {
            host: hostname.to_string(),
            detail: "no release information found under /etc".to_string(),
        });
    };

    let release = session.run(&format!("cat {release_file}"))?;
    parse_release(&release.stdout).ok_or_else(|| ProvisionError::UnsupportedEnvironment {
        host: hostname.to_string(),
        detail: release.stdout.lines().next().unwrap_or_default().to_string(),
    })
}
