use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Yaml Error: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("IO Error: {0}")]
    IoError(std::io::Error),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Already Exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency failure: the object changed between read and write
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Writing the diagnostic onto a foreign instance failed.
    /// The instance is not ours, so this is reported but never retried.
    #[error("Foreign Status Update Error: {0}")]
    ForeignStatusUpdate(#[source] Box<Error>),

    #[error("Config Error: {0}")]
    ConfigError(String),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the controller should schedule another attempt for this error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::ConfigError(_) | Error::ForeignStatusUpdate(_))
    }
}

pub mod config;
pub mod crd;
pub mod desired;
pub mod events_helper;
mod helper;
pub mod init_controller;
pub mod store;

/// Log and trace integrations
pub mod telemetry;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(Error::Conflict("x".into()).is_retryable());
        assert!(Error::Timeout("get".into()).is_retryable());
        assert!(Error::NotFound("x".into()).is_retryable());
        assert!(!Error::ConfigError("no namespace".into()).is_retryable());
        let foreign = Error::ForeignStatusUpdate(Box::new(Error::Conflict("x".into())));
        assert!(!foreign.is_retryable());
    }
}
