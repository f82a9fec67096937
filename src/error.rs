//! Error types for vmafbridge

use thiserror::Error;

/// Name every user-visible message is prefixed with
pub const FILTER_NAME: &str = "VMAF";

/// Result type alias for vmafbridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// vmafbridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Bad format, bad parameter range, mismatched clips, model/feature load failure
    #[error("{name}: {0}", name = FILTER_NAME)]
    Configuration(String),

    /// Native picture allocation failure
    #[error("{name}: {0}", name = FILTER_NAME)]
    Allocation(String),

    /// The engine rejected a submitted frame pair, or the stream was aborted
    #[error("{name}: {0}", name = FILTER_NAME)]
    Ingestion(String),

    /// Flush, pooling or report writing failed at teardown
    #[error("{name}: {0}", name = FILTER_NAME)]
    Reporting(String),

    /// The upstream frame service could not deliver a frame
    #[error("{name}: frame source error: {0}", name = FILTER_NAME)]
    Source(String),

    #[error("{name}: IO error: {0}", name = FILTER_NAME)]
    Io(#[from] std::io::Error),
}

/// Error taxonomy, independent of the message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Allocation,
    Ingestion,
    Reporting,
    Source,
    Io,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn ingestion(msg: impl Into<String>) -> Self {
        Error::Ingestion(msg.into())
    }

    pub fn reporting(msg: impl Into<String>) -> Self {
        Error::Reporting(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Allocation(_) => ErrorKind::Allocation,
            Error::Ingestion(_) => ErrorKind::Ingestion,
            Error::Reporting(_) => ErrorKind::Reporting,
            Error::Source(_) => ErrorKind::Source,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Reporting errors happen after scores are engine-internal and never
    /// fail an invocation
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Reporting(_))
    }

    /// Message without the filter-name prefix
    pub fn message(&self) -> String {
        match self {
            Error::Configuration(m)
            | Error::Allocation(m)
            | Error::Ingestion(m)
            | Error::Reporting(m)
            | Error::Source(m) => m.clone(),
            Error::Io(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_prefixed() {
        let err = Error::config("duplicate model specified");
        assert_eq!(err.to_string(), "VMAF: duplicate model specified");
        assert_eq!(err.message(), "duplicate model specified");
    }

    #[test]
    fn test_only_reporting_is_non_fatal() {
        assert!(!Error::reporting("failed to flush context").is_fatal());
        assert!(Error::ingestion("failed to read pictures").is_fatal());
        assert!(Error::Allocation("failed to allocate picture".into()).is_fatal());
        assert_eq!(Error::config("x").kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_every_variant_is_prefixed() {
        assert_eq!(
            Error::Allocation("out of memory".into()).to_string(),
            "VMAF: out of memory"
        );
        assert_eq!(
            Error::Source("frame 3 missing".into()).to_string(),
            "VMAF: frame source error: frame 3 missing"
        );
        let io: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(io.kind(), ErrorKind::Io);
        assert_eq!(io.to_string(), "VMAF: IO error: disk full");
    }
}
