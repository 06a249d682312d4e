use thiserror::Error;

/// Result status carried in the frame header of a successful message.
pub const STATUS_OK: u16 = 0;
/// Generic internal failure reported when a worker thread dies inside a job.
pub const ERR_PRIMITIVE_SERVER: u16 = 1001;
/// Generic executor failure (unclassified runtime error).
pub const ERR_BATCH_PROCESSOR: u16 = 1002;
/// Scalar subquery join matched more than one small-side row.
pub const ERR_MORE_THAN_ONE_ROW: u16 = 1003;
/// Value cannot be represented in the requested column kind.
pub const ERR_VALUE_OUT_OF_RANGE: u16 = 1004;
/// Null-bit header of a block or row group is inconsistent.
pub const ERR_CORRUPT_NULL_HEADER: u16 = 1005;
/// Malformed creation/reset/build message.
pub const ERR_PROTOCOL: u16 = 1006;
/// Stale cached metadata; the owner must invalidate and resubmit.
pub const ERR_RESTART_REQUIRED: u16 = 1007;

/// Canonical colex error taxonomy used across crates.
///
/// Classification guidance:
/// - [`ColexError::Protocol`]: malformed creation/reset/build messages; fatal to the batch
/// - [`ColexError::Data`]: data-dependent failures reported back as a failed batch
/// - [`ColexError::RestartRequired`]: storage metadata went stale; never swallowed
/// - [`ColexError::Transport`]: socket write failures captured by the dispatcher
/// - [`ColexError::Execution`]: runtime operator failures (kernels, decode, state shape)
/// - [`ColexError::InvalidConfig`]: configuration/environment contract violations
/// - [`ColexError::Unsupported`]: valid request for a shape not implemented here
/// - [`ColexError::Io`]: raw std IO failures
#[derive(Debug, Error)]
pub enum ColexError {
    /// Malformed wire message.
    ///
    /// Examples:
    /// - truncated creation message
    /// - unknown step type or column kind tag
    /// - run message for a batch that was never created
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Data error with a specific status code.
    ///
    /// Examples:
    /// - scalar join cardinality violation
    /// - value out of representable range
    #[error("data error {code}: {message}")]
    Data {
        /// Wire status code reported to the consumer.
        code: u16,
        /// Human readable message.
        message: String,
    },

    /// Inconsistent read caused by stale cached metadata.
    #[error("restart required: {0}")]
    RestartRequired(String),

    /// Output connection write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Runtime execution failures.
    #[error("execution error: {0}")]
    Execution(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ColexError {
    /// Build a data error from a status code and message.
    pub fn data(code: u16, message: impl Into<String>) -> Self {
        Self::Data {
            code,
            message: message.into(),
        }
    }

    /// Wire status code used when this error is reported in a result message.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Protocol(_) => ERR_PROTOCOL,
            Self::Data { code, .. } => *code,
            Self::RestartRequired(_) => ERR_RESTART_REQUIRED,
            Self::Transport(_)
            | Self::Execution(_)
            | Self::InvalidConfig(_)
            | Self::Unsupported(_)
            | Self::Io(_) => ERR_BATCH_PROCESSOR,
        }
    }

    /// `true` for the restart-required condition that must reach the metadata owner.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::RestartRequired(_))
    }
}

/// Standard colex result alias.
pub type Result<T> = std::result::Result<T, ColexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ColexError::Protocol("x".into()).status_code(), ERR_PROTOCOL);
        assert_eq!(
            ColexError::data(ERR_MORE_THAN_ONE_ROW, "two rows").status_code(),
            ERR_MORE_THAN_ONE_ROW
        );
        assert_eq!(
            ColexError::Execution("boom".into()).status_code(),
            ERR_BATCH_PROCESSOR
        );
        assert!(ColexError::RestartRequired("oid 7".into()).is_restart());
        assert!(!ColexError::Transport("closed".into()).is_restart());
    }
}
