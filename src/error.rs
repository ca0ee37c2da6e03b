use thiserror::Error;

/// Failure kinds raised while provisioning a fleet.
///
/// None of these abort a run. Phases catch them per host, record them against
/// that host and move on to the next one.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Could not connect to `{host}`: {message}")]
    Connectivity { host: String, message: String },

    #[error("Unsupported operating system on `{host}`: {detail}")]
    UnsupportedEnvironment { host: String, detail: String },

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error("Directory configuration error on `{host}`: {message}")]
    ConfigStore { host: String, message: String },

    #[error("Missing precondition: {0}")]
    PreconditionMissing(String),

    #[error("Remote command failed: {0}")]
    Remote(String),

    #[error("Invalid task descriptor: {0}")]
    Descriptor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn connectivity(host: &str, message: impl Into<String>) -> Self {
        Self::Connectivity {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub fn config_store(host: &str, message: impl Into<String>) -> Self {
        Self::ConfigStore {
            host: host.to_string(),
            message: message.into(),
        }
    }

    /// Short machine-readable code stored with per-host outcomes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "CONNECTIVITY",
            Self::UnsupportedEnvironment { .. } => "UNSUPPORTED_OS",
            Self::Verification(_) => "VERIFICATION_FAILED",
            Self::ConfigStore { .. } => "CONFIG_STORE",
            Self::PreconditionMissing(_) => "PRECONDITION_MISSING",
            Self::Remote(_) => "REMOTE_COMMAND",
            Self::Descriptor(_) => "DESCRIPTOR",
            Self::Config(_) => "CONFIG",
            Self::Storage(_) => "STORAGE",
            Self::Io(_) => "IO",
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::ProvisionError;

    #[test]
    fn codes_follow_the_error_kind() {
        assert_eq!(
            ProvisionError::connectivity("cache1", "refused").code(),
            "CONNECTIVITY"
        );
        assert_eq!(
            ProvisionError::config_store("cache1", "bind failed").code(),
            "CONFIG_STORE"
        );
        assert_eq!(
            ProvisionError::PreconditionMissing("no primary".to_string()).code(),
            "PRECONDITION_MISSING"
        );
    }

    #[test]
    fn connectivity_message_names_the_host() {
        let error = ProvisionError::connectivity("cache1.example.org", "timed out");
        assert_eq!(
            error.to_string(),
            "Could not connect to `cache1.example.org`: timed out"
        );
    }
}
