use std::path::{PathBuf, MAIN_SEPARATOR};

use chrono::Utc;

use crate::error::{ProvisionError, Result};
use crate::models::HostStatus;

const LOG_TRUNCATE_LIMIT: usize = 400;

pub fn single_quote_escape(value: &str) -> String {
    value.replace('\'', "'\"'\"'")
}

pub fn truncate_for_log(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= LOG_TRUNCATE_LIMIT {
        return trimmed.to_string();
    }
    let mut truncated = trimmed.chars().take(LOG_TRUNCATE_LIMIT).collect::<String>();
    truncated.push_str("...");
    truncated
}

pub fn status_label(status: &HostStatus) -> &'static str {
    match status {
        HostStatus::Success => "SUCCESS",
        HostStatus::Failed => "FAILED",
        HostStatus::Skipped => "SKIPPED",
    }
}

fn fallback_export_file_name(run_id: &str) -> String {
    let short = run_id.chars().take(8).collect::<String>();
    format!("run_{short}_{}.txt", Utc::now().format("%Y%m%d_%H%M"))
}

fn default_export_base_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("HOME") {
        return Ok(PathBuf::from(home).join(".cachefleet").join("exports"));
    }

    std::env::current_dir()
        .map(|path| path.join("exports"))
        .map_err(|error| {
            ProvisionError::Config(format!("Failed to determine export directory: {error}"))
        })
}

/// A directory argument gets a generated file name appended; anything else is
/// used as the file path.
pub fn resolve_export_path(run_id: &str, output_path: Option<&str>) -> Result<PathBuf> {
    let fallback_name = fallback_export_file_name(run_id);

    if let Some(path) = output_path {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            let looks_like_dir = trimmed.ends_with(MAIN_SEPARATOR) || trimmed.ends_with('/');
            if looks_like_dir || candidate.is_dir() {
                return Ok(candidate.join(&fallback_name));
            }
            return Ok(candidate);
        }
    }

    Ok(default_export_base_dir()?.join(fallback_name))
}

#[cfg(test)]
mod tests {
    use super::{resolve_export_path, single_quote_escape, truncate_for_log};

    #[test]
    fn quotes_are_closed_and_reopened() {
        assert_eq!(single_quote_escape("it's"), "it'\"'\"'s");
        assert_eq!(single_quote_escape("/etc/stunnel"), "/etc/stunnel");
    }

    #[test]
    fn long_output_is_truncated() {
        let long = "x".repeat(1000);
        let truncated = truncate_for_log(&long);
        assert_eq!(truncated.len(), 403);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_for_log("  short \n"), "short");
    }

    #[test]
    fn export_path_accepts_dirs_and_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let into_dir = resolve_export_path(
            "0123456789abcdef",
            Some(dir.path().to_str().expect("utf8 path")),
        )
        .expect("path");
        assert_eq!(into_dir.parent(), Some(dir.path()));
        let name = into_dir.file_name().expect("name").to_string_lossy().to_string();
        assert!(name.starts_with("run_01234567_"));

        let file = resolve_export_path("run", Some("/tmp/out.txt")).expect("path");
        assert_eq!(file.to_str(), Some("/tmp/out.txt"));
    }
}
