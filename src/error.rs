//! Stratorun Error Types

use thiserror::Error;

/// Result type alias for stratorun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stratorun error types
#[derive(Error, Debug)]
pub enum Error {
    // Request shape errors
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Could not parse job config: {0}")]
    Unprocessable(String),

    #[error("Job config exceeds {0} bytes")]
    ConfigTooLarge(usize),

    #[error("Config template at {path} is too large")]
    TemplateTooLarge { path: String },

    // Planner errors
    #[error("{0}")]
    ConfigParse(String),

    // Client streaming errors
    #[error("Client read timeout after {0} seconds")]
    ClientTimeout(u64),

    #[error("Client disconnect: {0}")]
    ClientDisconnect(String),

    // Backend errors
    #[error("Cannot find suitable host to execute job on")]
    NoCapacity,

    #[error("Worker host failed: {status} {reason}")]
    Backend {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("Status {status} when putting {path}")]
    PutError { status: u16, path: String },

    #[error("Channel name {0} not found")]
    UnknownChannel(String),

    // Storage collaborator errors
    #[error("Error querying object server for {0}")]
    Storage(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the submission surface
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadRequest(_) | Error::ConfigParse(_) => 400,
            Error::Unprocessable(_) => 422,
            Error::ConfigTooLarge(_) | Error::TemplateTooLarge { .. } => 413,
            Error::ClientTimeout(_) => 408,
            Error::ClientDisconnect(_) => 499,
            Error::NoCapacity => 503,
            Error::Backend { status, .. } => *status,
            _ => 500,
        }
    }

    /// Check if this error aborts the whole job rather than one worker
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ClientTimeout(_) | Error::ClientDisconnect(_) | Error::NoCapacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Error::BadRequest("x".into()).http_status(), 400);
        assert_eq!(Error::ConfigParse("x".into()).http_status(), 400);
        assert_eq!(Error::Unprocessable("x".into()).http_status(), 422);
        assert_eq!(Error::NoCapacity.http_status(), 503);
        let backend = Error::Backend {
            status: 502,
            reason: "Bad Gateway".into(),
            body: String::new(),
        };
        assert_eq!(backend.http_status(), 502);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::NoCapacity.is_fatal());
        assert!(Error::ClientTimeout(30).is_fatal());
        assert!(!Error::UnknownChannel("out".into()).is_fatal());
    }
}
