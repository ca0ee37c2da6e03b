use std::sync::OnceLock;

use keyring::Entry;
use regex::Regex;

use crate::error::{ProvisionError, Result};

const KEYRING_SERVICE: &str = "cachefleet";

fn keyring_user(host_id: u32) -> String {
    format!("directory-bind:{host_id}")
}

fn directory_entry(host_id: u32) -> Result<Entry> {
    Entry::new(KEYRING_SERVICE, &keyring_user(host_id))
        .map_err(|error| ProvisionError::Storage(format!("Failed to create keyring entry: {error}")))
}

pub fn set_directory_password(host_id: u32, password: &str) -> Result<()> {
    directory_entry(host_id)?
        .set_password(password)
        .map_err(|error| {
            ProvisionError::Storage(format!("Failed to store password in keyring: {error}"))
        })
}

pub fn get_directory_password(host_id: u32) -> Result<Option<String>> {
    match directory_entry(host_id)?.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(error) => Err(ProvisionError::Storage(format!(
            "Failed to read password from keyring: {error}"
        ))),
    }
}

pub fn delete_directory_password(host_id: u32) -> Result<()> {
    match directory_entry(host_id)?.delete_credential() {
        Ok(_) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(error) => Err(ProvisionError::Storage(format!(
            "Failed to delete password from keyring: {error}"
        ))),
    }
}

pub fn redact_text(input: &str, secrets: &[String]) -> String {
    let mut output = input.to_string();

    for secret in secrets {
        if !secret.trim().is_empty() {
            output = output.replace(secret, "***");
        }
    }

    for regex in redaction_regexes() {
        output = regex.replace_all(&output, "$1***").to_string();
    }

    private_key_block_regex()
        .replace_all(&output, "[REDACTED_PRIVATE_KEY]")
        .to_string()
}

fn redaction_regexes() -> &'static [Regex] {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES
        .get_or_init(|| {
            vec![
                Regex::new(r#"(?i)(password\s*[:=]\s*)[^\s"']+"#).expect("invalid password regex"),
                Regex::new(r#"(?i)(ldapPass\s*[:=]\s*)[^\s"']+"#).expect("invalid ldapPass regex"),
                Regex::new(r#"(?i)(\s-w\s+)'[^']*'"#).expect("invalid bind password regex"),
            ]
        })
        .as_slice()
}

fn private_key_block_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----")
            .expect("invalid private key block regex")
    })
}
