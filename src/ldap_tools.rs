use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::directory::{DirectoryConfigStore, DirectoryConnector, DirectoryEndpoint};
use crate::error::{ProvisionError, Result};
use crate::models::ConnectionTarget;
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::utils::{single_quote_escape, truncate_for_log};

/// Entry holding the appliance-wide configuration attributes.
const APPLIANCE_FILTER: &str = "(objectClass=gluuAppliance)";

/// Reaches each host's directory through the OpenLDAP client tools installed
/// on that host, over the same remote session used for provisioning.
pub struct LdapToolsConnector {
    executor: Arc<dyn RemoteExecutor>,
}

impl LdapToolsConnector {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }
}

impl DirectoryConnector for LdapToolsConnector {
    fn connect(
        &self,
        target: &ConnectionTarget,
        endpoint: &DirectoryEndpoint,
    ) -> Result<Box<dyn DirectoryConfigStore>> {
        let fail = |error: ProvisionError| {
            ProvisionError::config_store(&target.hostname, format!("LDAP connection failed: {error}"))
        };
        let mut session = self.executor.open(target).map_err(fail)?;
        let password_file = stage_file(session.as_mut(), "bind", &endpoint.password).map_err(fail)?;

        Ok(Box::new(LdapToolsStore {
            hostname: target.hostname.clone(),
            session,
            endpoint: endpoint.clone(),
            password_file,
            dn: None,
        }))
    }
}

/// Write `content` to a fresh mode-0600 file on the host.
fn stage_file(session: &mut dyn RemoteSession, label: &str, content: &str) -> Result<String> {
    let created = session.run(&format!("umask 077; mktemp /tmp/cachefleet-{label}.XXXXXX"))?;
    let path = created.stdout.trim().to_string();
    if created.exit_status != 0 || path.is_empty() {
        return Err(ProvisionError::Remote(format!(
            "mktemp failed: {}",
            truncate_for_log(&created.stderr)
        )));
    }
    session.write_file(&path, content)?;
    Ok(path)
}

struct LdapToolsStore {
    hostname: String,
    session: Box<dyn RemoteSession>,
    endpoint: DirectoryEndpoint,
    password_file: String,
    dn: Option<String>,
}

impl LdapToolsStore {
    fn error(&self, message: impl Into<String>) -> ProvisionError {
        ProvisionError::config_store(&self.hostname, message)
    }

    fn connection_args(&self) -> String {
        format!(
            "-H {} -D '{}' -y {}",
            self.endpoint.url("localhost"),
            single_quote_escape(&self.endpoint.bind_dn),
            self.password_file
        )
    }

    fn search(&mut self, name: &str) -> Result<(String, String)> {
        let command = format!(
            "LDAPTLS_REQCERT=never ldapsearch -LLL -o ldif-wrap=no {} -b '{}' '{APPLIANCE_FILTER}' dn {name}",
            self.connection_args(),
            single_quote_escape(&self.endpoint.base_dn),
        );
        let result = self.session.run(&command)?;
        if result.exit_status != 0 {
            return Err(self.error(format!(
                "ldapsearch exited with {}: {}",
                result.exit_status,
                truncate_for_log(&result.stderr)
            )));
        }

        let (dn, value) = parse_ldif_entry(&result.stdout, name)?;
        let dn = dn.ok_or_else(|| self.error("No appliance entry found"))?;
        let value = value.ok_or_else(|| self.error(format!("Appliance entry has no {name}")))?;
        Ok((dn, value))
    }
}

impl DirectoryConfigStore for LdapToolsStore {
    fn read_attribute(&mut self, name: &str) -> Result<String> {
        let (dn, value) = self.search(name)?;
        self.dn = Some(dn);
        Ok(value)
    }

    fn write_attribute(&mut self, name: &str, value: &str) -> Result<bool> {
        let dn = match self.dn.clone() {
            Some(dn) => dn,
            None => self.search(name)?.0,
        };
        let ldif = modify_ldif(&dn, name, value);
        let ldif_file = stage_file(self.session.as_mut(), "modify", &ldif)?;

        let command = format!(
            "LDAPTLS_REQCERT=never ldapmodify {} -f {ldif_file}",
            self.connection_args()
        );
        let result = self.session.run(&command);
        let _ = self.session.run(&format!("rm -f {ldif_file}"));
        let result = result?;
        if result.exit_status != 0 {
            tracing::warn!(
                host = %self.hostname,
                status = result.exit_status,
                stderr = %truncate_for_log(&result.stderr),
                "ldapmodify rejected the update"
            );
        }
        Ok(result.exit_status == 0)
    }
}

impl Drop for LdapToolsStore {
    fn drop(&mut self) {
        let _ = self.session.run(&format!("rm -f {}", self.password_file));
        let _ = self.session.close();
    }
}

fn decode_value(raw: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|error| ProvisionError::Remote(format!("Invalid base64 in LDIF: {error}")))?;
    String::from_utf8(bytes)
        .map_err(|error| ProvisionError::Remote(format!("LDIF value is not UTF-8: {error}")))
}

/// Pull the DN and one attribute out of an unwrapped LDIF record. `::`
/// values are base64.
pub fn parse_ldif_entry(ldif: &str, attribute: &str) -> Result<(Option<String>, Option<String>)> {
    let mut dn = None;
    let mut value = None;
    let base64_prefix = format!("{attribute}::");
    let plain_prefix = format!("{attribute}:");

    for line in ldif.lines() {
        if let Some(rest) = line.strip_prefix("dn::") {
            dn = Some(decode_value(rest)?);
        } else if let Some(rest) = line.strip_prefix("dn:") {
            dn = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(&base64_prefix) {
            value = Some(decode_value(rest)?);
        } else if let Some(rest) = line.strip_prefix(&plain_prefix) {
            value = Some(rest.trim().to_string());
        }
    }
    Ok((dn, value))
}

pub fn modify_ldif(dn: &str, attribute: &str, value: &str) -> String {
    format!(
        "dn: {dn}\nchangetype: modify\nreplace: {attribute}\n{attribute}:: {}\n-\n",
        STANDARD.encode(value)
    )
}
