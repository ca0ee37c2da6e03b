use std::path::Path;

use crate::auth::{
    import_csv_record, sync_directory_password, validate_csv_headers, validate_host_payload,
};
use crate::db::lock_database;
use crate::error::{ProvisionError, Result};
use crate::models::{
    CsvImportError, CsvImportResult, Host, HostKeyReport, HostKeyState, HostUpsertPayload,
};
use crate::security::delete_directory_password;
use crate::ssh_client::fetch_host_key;
use crate::state::AppState;

pub async fn host_list(state: &AppState) -> Result<Vec<Host>> {
    lock_database(&state.database)?.list_hosts()
}

pub async fn host_create(state: &AppState, payload: HostUpsertPayload) -> Result<Host> {
    validate_host_payload(&payload)?;

    let host = lock_database(&state.database)?.insert_host(&payload, chrono::Utc::now())?;
    sync_directory_password(host.id, &payload)?;
    Ok(host)
}

pub async fn host_find(state: &AppState, hostname: &str) -> Result<Host> {
    lock_database(&state.database)?
        .find_host(hostname)?
        .ok_or_else(|| ProvisionError::Config(format!("Unknown host `{hostname}`")))
}

pub async fn host_delete(state: &AppState, hostname: &str) -> Result<()> {
    let host = host_find(state, hostname).await?;
    lock_database(&state.database)?.delete_host(host.id)?;
    delete_directory_password(host.id)?;
    Ok(())
}

/// Mark one host as the proxy/primary and clear the flag everywhere else.
pub async fn host_set_primary(state: &AppState, hostname: &str) -> Result<Host> {
    let database = lock_database(&state.database)?;
    let mut selected = None;
    for mut host in database.list_hosts()? {
        let primary = host.hostname == hostname.trim();
        if host.is_primary != primary {
            host.is_primary = primary;
            database.save_host(&host)?;
        }
        if primary {
            selected = Some(host);
        }
    }
    selected.ok_or_else(|| ProvisionError::Config(format!("Unknown host `{hostname}`")))
}

pub async fn hosts_import_csv(state: &AppState, file_path: &Path) -> Result<CsvImportResult> {
    let mut reader = csv::Reader::from_path(file_path).map_err(|error| {
        ProvisionError::Config(format!(
            "Failed to open CSV file `{}`: {error}",
            file_path.display()
        ))
    })?;

    let headers = reader
        .headers()
        .map_err(|error| ProvisionError::Config(format!("Failed to read CSV headers: {error}")))?
        .clone();
    validate_csv_headers(&headers)?;

    let mut imported = 0usize;
    let mut failed = 0usize;
    let mut errors = Vec::new();

    for (index, record_result) in reader.records().enumerate() {
        let line = index + 2;
        let record = match record_result {
            Ok(value) => value,
            Err(error) => {
                failed += 1;
                errors.push(CsvImportError {
                    line,
                    message: format!("Invalid CSV row: {error}"),
                });
                continue;
            }
        };

        match import_csv_record(&state.database, &record) {
            Ok(_) => imported += 1,
            Err(error) => {
                failed += 1;
                errors.push(CsvImportError {
                    line,
                    message: error.to_string(),
                });
            }
        }
    }

    Ok(CsvImportResult {
        imported,
        failed,
        errors,
    })
}

pub fn classify_host_key(known: Option<&str>, offered: &str) -> HostKeyState {
    match known {
        None => HostKeyState::Untrusted,
        Some(known) if known == offered => HostKeyState::Trusted,
        Some(_) => HostKeyState::Mismatch,
    }
}

/// Handshake once, without authenticating, and compare the offered key with
/// the stored one. With `trust`, an untrusted or changed key is stored.
pub async fn hostkey_check(state: &AppState, hostname: &str, trust: bool) -> Result<HostKeyReport> {
    let host = host_find(state, hostname).await?;
    let target = host.target();
    let settings = state.config.ssh.clone();

    let fingerprint = tokio::task::spawn_blocking({
        let target = target.clone();
        let settings = settings.clone();
        move || fetch_host_key(&target, &settings)
    })
    .await
    .map_err(|error| ProvisionError::Remote(format!("Host key check join error: {error}")))??;

    let address = target.address().to_string();
    let database = lock_database(&state.database)?;
    let known_fingerprint = database.get_host_key(&address, settings.port)?;
    let mut state_now = classify_host_key(known_fingerprint.as_deref(), &fingerprint);
    if trust && state_now != HostKeyState::Trusted {
        database.upsert_host_key(&address, settings.port, &fingerprint)?;
        state_now = HostKeyState::Trusted;
    }

    Ok(HostKeyReport {
        hostname: host.hostname,
        address,
        state: state_now,
        fingerprint,
        known_fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{classify_host_key, host_create, host_list, host_set_primary, hosts_import_csv};
    use crate::config::ConsoleConfig;
    use crate::db::Database;
    use crate::models::{HostKeyState, HostUpsertPayload};
    use crate::state::AppState;

    fn state() -> AppState {
        AppState::new(
            Database::open_in_memory().expect("database"),
            ConsoleConfig::default(),
        )
    }

    fn payload(hostname: &str) -> HostUpsertPayload {
        HostUpsertPayload {
            hostname: hostname.to_string(),
            ip: None,
            ssh_user: "root".to_string(),
            is_primary: false,
            containerized: false,
            remember_password: false,
            directory_password: None,
        }
    }

    #[test]
    fn host_key_states() {
        assert_eq!(classify_host_key(None, "SHA256:a"), HostKeyState::Untrusted);
        assert_eq!(classify_host_key(Some("SHA256:a"), "SHA256:a"), HostKeyState::Trusted);
        assert_eq!(classify_host_key(Some("SHA256:a"), "SHA256:b"), HostKeyState::Mismatch);
    }

    #[tokio::test]
    async fn empty_hostnames_are_rejected() {
        let state = state();
        assert!(host_create(&state, payload("  ")).await.is_err());
        assert!(host_list(&state).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn only_one_primary_remains() {
        let state = state();
        let mut first = payload("cache1");
        first.is_primary = true;
        {
            let database = state.database.lock().expect("lock");
            database.insert_host(&first, chrono::Utc::now()).expect("insert");
            database
                .insert_host(&payload("cache2"), chrono::Utc::now())
                .expect("insert");
        }

        let primary = host_set_primary(&state, "cache2").await.expect("primary");
        assert_eq!(primary.hostname, "cache2");

        let hosts = host_list(&state).await.expect("list");
        let primaries = hosts.iter().filter(|host| host.is_primary).count();
        assert_eq!(primaries, 1);
        assert!(host_set_primary(&state, "missing").await.is_err());
    }

    #[tokio::test]
    async fn csv_import_reports_bad_rows_by_line() {
        let state = state();
        let mut file = tempfile::NamedTempFile::new().expect("csv file");
        writeln!(file, "hostname,ip,ssh_user,is_primary,containerized,directory_password")
            .expect("write");
        writeln!(file, "cache1,10.0.0.1,root,no,no,").expect("write");
        writeln!(file, "cache2,10.0.0.2,root,perhaps,no,").expect("write");
        writeln!(file, "cache1,10.0.0.3,root,no,no,").expect("write");

        let result = hosts_import_csv(&state, file.path()).await.expect("import");

        assert_eq!(result.imported, 1);
        assert_eq!(result.failed, 2);
        let lines = result.errors.iter().map(|error| error.line).collect::<Vec<_>>();
        assert_eq!(lines, vec![3, 4]);
    }
}
