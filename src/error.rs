// Error module - the error taxonomy shared by collectors, the matrix and exporters
//
// Arithmetic problems (negative deltas, zero denominators, missing base
// counters) are never errors: they clear the `recorded` flag of the affected
// cell and bump a skip counter. Everything below is what actually surfaces.

use thiserror::Error;

/// Errors raised by Matrix schema and arithmetic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid element type: {0}")]
    InvalidType(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("unequal vectors: numerator={numerator}, denominator={denominator}")]
    UnequalVectors { numerator: usize, denominator: usize },

    #[error("invalid clone options: {0}")]
    InvalidCloneOptions(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("metric {0} cannot be divided by itself")]
    SameMetric(String),
}

/// Errors returned by collector poll functions
///
/// The scheduler inspects the variant to decide whether the collector moves
/// into standby, stays up or is marked failed.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("error reading api response: {0}")]
    ApiResponse(String),

    #[error("API request rejected: {0}")]
    ApiRequestRejected(String),

    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("no instances: {0}")]
    NoInstance(String),

    #[error("no metrics: {0}")]
    NoMetric(String),

    #[error("wrong template: {0}")]
    WrongTemplate(String),

    #[error("collector panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

impl PollError {
    /// Returns a stable class name for the error, used as the status reason
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Connection(_) => "connection error",
            PollError::AuthFailed(_) => "auth failed",
            PollError::ApiResponse(_) => "error reading api response",
            PollError::ApiRequestRejected(_) => "API request rejected",
            PollError::MissingParam(_) => "missing parameter",
            PollError::InvalidParam(_) => "invalid parameter",
            PollError::NoInstance(_) => "no instances",
            PollError::NoMetric(_) => "no metrics",
            PollError::WrongTemplate(_) => "wrong template",
            PollError::Panic(_) => "panic",
            PollError::Matrix(_) => "matrix error",
        }
    }

    /// Configuration faults stop the collector before it ever starts
    pub fn is_config(&self) -> bool {
        matches!(self, PollError::MissingParam(_) | PollError::InvalidParam(_))
    }
}

/// Errors raised by exporters while rendering or emitting data
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API request rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid exporter parameter: {0}")]
    InvalidParam(String),

    #[error("missing exporter parameter: {0}")]
    MissingParam(String),

    #[error("malformed line protocol: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(PollError::Connection("x".into()).kind(), "connection error");
        assert_eq!(PollError::NoInstance("volume".into()).kind(), "no instances");
        let err: PollError = MatrixError::NotFound("read_ops".into()).into();
        assert_eq!(err.kind(), "matrix error");
        assert_eq!(err.to_string(), "key not found: read_ops");
    }

    #[test]
    fn test_config_errors() {
        assert!(PollError::MissingParam("schedule".into()).is_config());
        assert!(!PollError::NoMetric("volume".into()).is_config());
    }
}
