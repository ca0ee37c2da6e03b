use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use csv::StringRecord;

use crate::config::SshSettings;
use crate::db::{lock_database, Database};
use crate::error::{ProvisionError, Result};
use crate::models::{Host, HostUpsertPayload};
use crate::security::{delete_directory_password, get_directory_password, set_directory_password};
use crate::ssh_client::SshAuth;

const CSV_HEADERS: [&str; 6] = [
    "hostname",
    "ip",
    "ssh_user",
    "is_primary",
    "containerized",
    "directory_password",
];

pub fn validate_host_payload(payload: &HostUpsertPayload) -> Result<()> {
    if payload.hostname.trim().is_empty() {
        return Err(ProvisionError::Config("Hostname cannot be empty".to_string()));
    }
    if payload.hostname.trim().contains(char::is_whitespace) {
        return Err(ProvisionError::Config(format!(
            "Hostname `{}` cannot contain whitespace",
            payload.hostname.trim()
        )));
    }
    if payload.ssh_user.trim().is_empty() {
        return Err(ProvisionError::Config("SSH user cannot be empty".to_string()));
    }
    if payload.remember_password
        && payload
            .directory_password
            .as_deref()
            .map(|value| value.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ProvisionError::Config(
            "rememberPassword=true requires a directory password".to_string(),
        ));
    }
    Ok(())
}

/// Keep the keyring in line with the host's `remember_password` flag.
pub fn sync_directory_password(host_id: u32, payload: &HostUpsertPayload) -> Result<()> {
    match payload.directory_password.as_deref() {
        Some(password) if payload.remember_password => set_directory_password(host_id, password),
        _ => {
            if let Err(error) = delete_directory_password(host_id) {
                tracing::warn!(host_id, %error, "could not clear stored directory password");
            }
            Ok(())
        }
    }
}

/// Fill `directory_password` from the keyring for hosts that remember it.
/// Hosts without a stored password fall back to the configured one later.
pub fn resolve_directory_passwords(hosts: &mut [Host]) -> Result<()> {
    for host in hosts.iter_mut().filter(|host| host.remember_password) {
        if host.directory_password.is_none() {
            host.directory_password = get_directory_password(host.id)?;
        }
    }
    Ok(())
}

pub fn resolve_ssh_auth(settings: &SshSettings) -> SshAuth {
    if let Some(password) = settings
        .password
        .clone()
        .filter(|value| !value.trim().is_empty())
    {
        return SshAuth::Password(password);
    }

    let key_path = settings.private_key_path.clone().or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".ssh").join("id_rsa"))
            .filter(|path| path.exists())
    });
    match key_path {
        Some(path) => SshAuth::Key {
            path,
            passphrase: settings
                .passphrase
                .clone()
                .filter(|value| !value.trim().is_empty()),
        },
        None => SshAuth::Agent,
    }
}

pub fn validate_csv_headers(headers: &StringRecord) -> Result<()> {
    if headers.len() != CSV_HEADERS.len() {
        return Err(ProvisionError::Config(format!(
            "CSV headers mismatch, expected `{}`",
            CSV_HEADERS.join(",")
        )));
    }
    for (actual, expected_header) in headers.iter().zip(CSV_HEADERS.iter()) {
        if actual.trim() != *expected_header {
            return Err(ProvisionError::Config(format!(
                "CSV header mismatch: expected `{expected_header}`, got `{actual}`"
            )));
        }
    }
    Ok(())
}

fn parse_flag(value: &str, column: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" => Ok(false),
        "1" | "true" | "yes" => Ok(true),
        other => Err(ProvisionError::Config(format!(
            "Invalid {column} value `{other}`"
        ))),
    }
}

pub fn parse_csv_record(record: &StringRecord) -> Result<HostUpsertPayload> {
    let column = |index: usize| record.get(index).unwrap_or_default();
    let ip = column(1).trim();
    let password = column(5).to_string();

    let payload = HostUpsertPayload {
        hostname: column(0).trim().to_string(),
        ip: (!ip.is_empty()).then(|| ip.to_string()),
        ssh_user: match column(2).trim() {
            "" => "root".to_string(),
            user => user.to_string(),
        },
        is_primary: parse_flag(column(3), "is_primary")?,
        containerized: parse_flag(column(4), "containerized")?,
        remember_password: !password.trim().is_empty(),
        directory_password: (!password.trim().is_empty()).then_some(password),
    };
    validate_host_payload(&payload)?;
    Ok(payload)
}

pub fn import_csv_record(database: &Mutex<Database>, record: &StringRecord) -> Result<Host> {
    let payload = parse_csv_record(record)?;
    let host = lock_database(database)?.insert_host(&payload, Utc::now())?;
    sync_directory_password(host.id, &payload)?;
    Ok(host)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use csv::StringRecord;

    use super::{parse_csv_record, resolve_ssh_auth, validate_csv_headers, validate_host_payload};
    use crate::config::SshSettings;
    use crate::models::HostUpsertPayload;
    use crate::ssh_client::SshAuth;

    #[test]
    fn csv_headers_must_match_in_order() {
        let good = StringRecord::from(vec![
            "hostname",
            "ip",
            "ssh_user",
            "is_primary",
            "containerized",
            "directory_password",
        ]);
        assert!(validate_csv_headers(&good).is_ok());

        let swapped = StringRecord::from(vec![
            "ip",
            "hostname",
            "ssh_user",
            "is_primary",
            "containerized",
            "directory_password",
        ]);
        assert!(validate_csv_headers(&swapped).is_err());
        assert!(validate_csv_headers(&StringRecord::from(vec!["hostname"])).is_err());
    }

    #[test]
    fn csv_rows_default_user_and_remember_passwords() {
        let row = StringRecord::from(vec!["cache1.example.org", "10.0.0.1", "", "yes", "0", "s3cret"]);
        let payload = parse_csv_record(&row).expect("payload");
        assert_eq!(payload.ssh_user, "root");
        assert_eq!(payload.ip.as_deref(), Some("10.0.0.1"));
        assert!(payload.is_primary);
        assert!(!payload.containerized);
        assert!(payload.remember_password);

        let bare = StringRecord::from(vec!["cache2", "", "admin", "", "", ""]);
        let payload = parse_csv_record(&bare).expect("payload");
        assert_eq!(payload.ip, None);
        assert!(!payload.remember_password);
        assert_eq!(payload.directory_password, None);
    }

    #[test]
    fn invalid_csv_flags_are_rejected() {
        let row = StringRecord::from(vec!["cache1", "", "root", "maybe", "0", ""]);
        let error = parse_csv_record(&row).expect_err("invalid flag");
        assert!(error.to_string().contains("is_primary"));
    }

    #[test]
    fn remembering_needs_a_password() {
        let payload = HostUpsertPayload {
            hostname: "cache1".to_string(),
            ip: None,
            ssh_user: "root".to_string(),
            is_primary: false,
            containerized: false,
            remember_password: true,
            directory_password: None,
        };
        assert!(validate_host_payload(&payload).is_err());
    }

    #[test]
    fn password_settings_win_over_keys() {
        let settings = SshSettings {
            password: Some("pw".to_string()),
            private_key_path: Some(PathBuf::from("/keys/id_rsa")),
            ..SshSettings::default()
        };
        assert_eq!(resolve_ssh_auth(&settings), SshAuth::Password("pw".to_string()));

        let settings = SshSettings {
            private_key_path: Some(PathBuf::from("/keys/id_rsa")),
            passphrase: Some(" ".to_string()),
            ..SshSettings::default()
        };
        assert_eq!(
            resolve_ssh_auth(&settings),
            SshAuth::Key {
                path: PathBuf::from("/keys/id_rsa"),
                passphrase: None,
            }
        );
    }
}
