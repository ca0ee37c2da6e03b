use crate::error::{ProvisionError, Result};
use crate::models::Host;
use crate::progress::{LogLevel, RunContext};
use crate::remote::RemoteSession;
use crate::task_helpers::run_and_log;

pub const CERT_PATH: &str = "/etc/stunnel/server.crt";
pub const KEY_PATH: &str = "/etc/stunnel/server.key";
pub const PEM_PATH: &str = "/etc/stunnel/cert.pem";

const OPENSSL: &str = "/usr/bin/openssl";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub country: String,
    pub state: String,
    pub city: String,
    pub org: String,
    pub common_name: String,
    pub email: String,
}

fn property_value(line: &str) -> String {
    line.split('=').nth(1).unwrap_or_default().trim().to_string()
}

impl CertificateIdentity {
    /// Harvest the identity from a setup properties file. Keys are matched by
    /// line prefix and later lines override earlier ones.
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut identity = Self::default();
        for line in text.lines() {
            let slot = if line.starts_with("countryCode") {
                &mut identity.country
            } else if line.starts_with("state") {
                &mut identity.state
            } else if line.starts_with("city") {
                &mut identity.city
            } else if line.starts_with("orgName") {
                &mut identity.org
            } else if line.starts_with("hostname") {
                &mut identity.common_name
            } else if line.starts_with("admin_email") {
                &mut identity.email
            } else {
                continue;
            };
            *slot = property_value(line);
        }

        if identity.common_name.is_empty() || identity.org.is_empty() {
            return Err(ProvisionError::PreconditionMissing(
                "setup properties carry no hostname or orgName".to_string(),
            ));
        }
        Ok(identity)
    }

    pub fn subject(&self) -> String {
        format!(
            "/C={}/ST={}/L={}/O={}/CN={}/emailAddress={}",
            self.country, self.state, self.city, self.org, self.common_name, self.email
        )
    }
}

pub fn generate_command(identity: &CertificateIdentity) -> String {
    format!(
        "{OPENSSL} req -subj '{}' -new -newkey rsa:2048 -sha256 -days 365 -nodes -x509 -keyout {KEY_PATH} -out {CERT_PATH}",
        identity.subject().replace('\'', "")
    )
}

pub fn combine_command() -> String {
    format!("cat {CERT_PATH} {KEY_PATH} > {PEM_PATH}")
}

pub fn verify_command() -> String {
    format!("{OPENSSL} verify {PEM_PATH}")
}

pub struct CertificateProvisioner<'a> {
    context: &'a RunContext,
    properties_path: String,
}

impl<'a> CertificateProvisioner<'a> {
    pub fn new(context: &'a RunContext, properties_path: impl Into<String>) -> Self {
        Self {
            context,
            properties_path: properties_path.into(),
        }
    }

    /// Generate and check the tunnel certificate. Returns whether the check
    /// found the expected identity; a failed check is logged and nothing
    /// more, since the tunnel config is still pushed afterwards.
    pub fn provision(&self, session: &mut dyn RemoteSession, host: &Host) -> Result<bool> {
        self.context.host(
            host.id,
            LogLevel::Debug,
            "Generating certificate for stunnel ...",
        );
        let properties = session.read_file(&self.properties_path)?;
        let identity = CertificateIdentity::from_properties(&properties)?;

        run_and_log(self.context, session, host.id, &generate_command(&identity))?;
        run_and_log(self.context, session, host.id, &combine_command())?;
        let result = run_and_log(self.context, session, host.id, &verify_command())?;

        let output = format!("{}{}", result.stdout, result.stderr);
        let verified = output.contains(&identity.common_name) && output.contains(&identity.org);
        if verified {
            self.context.host(
                host.id,
                LogLevel::Success,
                "Certificate generated successfully",
            );
        } else {
            self.context.host(
                host.id,
                LogLevel::Error,
                format!("Certificate generation failed. Add a SSL certificate at {PEM_PATH}"),
            );
        }
        Ok(verified)
    }
}
