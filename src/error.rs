//! Error types for the mTLS metrics server

use std::io;

use thiserror::Error;

use crate::server::RejectReason;

/// Result type alias for the mTLS metrics server
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code used when the process cannot start because of bad configuration
/// or unusable initial TLS material (`EX_CONFIG` from `sysexits.h`).
pub const EXIT_CONFIG: u8 = 78;

/// Exit code for any other fatal runtime failure.
pub const EXIT_FAILURE: u8 = 1;

/// mTLS metrics server errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error. Fatal at startup: the server never starts serving.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rotated certificate, key, trust bundle or CRL could not be parsed.
    ///
    /// Non-fatal: the previous snapshot stays authoritative.
    #[error("Failed to load {kind} from '{path}': {reason}")]
    RotationParse {
        /// What was being loaded (`certificate`, `trust-bundle`)
        kind: &'static str,
        /// Source file that failed
        path: String,
        /// Parser / IO failure description
        reason: String,
    },

    /// Certificate and private key on disk do not belong together.
    ///
    /// Usually transient while an issuer rewrites the two files one by one.
    #[error("Certificate '{cert}' does not match private key '{key}'")]
    KeyMismatch {
        /// Certificate file path
        cert: String,
        /// Key file path
        key: String,
    },

    /// Per-connection TLS handshake rejection
    #[error("TLS handshake rejected: {0}")]
    Handshake(RejectReason),

    /// Verified client is not allowed to perform the request
    #[error("Access denied for '{identity}' on {verb} {path}")]
    Authorization {
        /// Display name of the client identity
        identity: String,
        /// HTTP method
        verb: String,
        /// Request path
        path: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a [`Error::RotationParse`] for `path`.
    pub fn rotation(kind: &'static str, path: impl Into<String>, reason: impl ToString) -> Self {
        Self::RotationParse {
            kind,
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same load shortly afterwards may succeed.
    ///
    /// Covers a key that does not (yet) match its certificate and files that
    /// are briefly absent while a mounted volume swaps its data directory.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::KeyMismatch { .. } => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Process exit code for an error that terminated the server.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_CONFIG,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_use_ex_config_exit_code() {
        assert_eq!(Error::Config("bad".into()).exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn runtime_errors_use_generic_exit_code() {
        assert_eq!(Error::Internal("boom".into()).exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn key_mismatch_is_transient() {
        let err = Error::KeyMismatch {
            cert: "tls.crt".into(),
            key: "tls.key".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn missing_file_is_transient_but_parse_failure_is_not() {
        let missing = Error::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(missing.is_transient());

        let parse = Error::rotation("certificate", "tls.crt", "no PEM blocks");
        assert!(!parse.is_transient());
    }

    #[test]
    fn rotation_error_message_names_path_and_reason() {
        let err = Error::rotation("trust-bundle", "/etc/ca.crt", "empty bundle");
        assert_eq!(
            err.to_string(),
            "Failed to load trust-bundle from '/etc/ca.crt': empty bundle"
        );
    }
}
