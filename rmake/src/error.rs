//! Error types for rmake sessions.

use std::process::ExitStatus;

use rmake_proto::{CodecError, MsgKind};

/// Alias for `Result<T, rmake::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by session, make, and client operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer sent a message kind that is not valid in the current state.
    #[error("invalid message code {0}")]
    InvalidMsg(i16),

    /// The peer sent well-framed but unacceptable parameters.
    #[error("invalid message parameters: {0}")]
    InvalidParam(String),

    /// Wrong credentials, or a request before authentication.
    #[error("authentication failed")]
    AuthFailed,

    /// Framing or transport failure on the connection itself.
    #[error(transparent)]
    Wire(#[from] CodecError),

    /// A recipe command exited unsuccessfully.
    #[error("command \"{command}\" failed: {status}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status of the process.
        status: ExitStatus,
    },

    /// A recipe command outlived the recipe's time limit and was killed.
    #[error("command \"{command}\" timed out after {limit_ms} ms")]
    Timeout {
        /// Rendered command line.
        command: String,
        /// The recipe's limit in milliseconds.
        limit_ms: u128,
    },

    /// A command template rendered to an empty command line.
    #[error("command template {0:?} rendered an empty command line")]
    EmptyCommand(String),

    /// A command template could not be parsed or rendered.
    #[error("template error: {0}")]
    Template(String),

    /// A recipe definition is invalid.
    #[error("invalid recipe {name:?}: {reason}")]
    Recipe {
        /// Recipe name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// `make` was called without a matched request on the connection.
    #[error("no active make request on this connection")]
    NoRequest,

    /// An output glob could not be compiled.
    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// An output glob match could not be read.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    /// The daemon configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The server answered with a control code instead of proceeding.
    #[error("server replied {0:?}")]
    Rejected(MsgKind),

    /// The server reported a failure with a diagnostic.
    #[error("server error: {0}")]
    Remote(String),

    /// Filesystem or process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the peer should be told about this failure with an
    /// `ErrorMessage` frame before the connection is closed.
    ///
    /// Wire failures leave the stream unusable, and protocol failures have
    /// already been answered with a control code.
    pub const fn wants_error_message(&self) -> bool {
        !matches!(
            self,
            Self::Wire(_)
                | Self::InvalidMsg(_)
                | Self::InvalidParam(_)
                | Self::AuthFailed
                | Self::Rejected(_)
                | Self::Remote(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert!(!Error::Wire(CodecError::UnexpectedEnd).wants_error_message());
        assert!(!Error::InvalidMsg(999).wants_error_message());
        assert!(!Error::AuthFailed.wants_error_message());
        assert!(Error::Io(std::io::Error::other("disk full")).wants_error_message());
        assert!(
            Error::Timeout {
                command: "sleep 5".into(),
                limit_ms: 100
            }
            .wants_error_message()
        );
    }
}
