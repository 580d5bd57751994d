//! Error types for svcreg
//!
//! This module defines the error hierarchy for the registry client,
//! categorized by subsystem with recovery hints.
//!
//! # Error Categories
//!
//! - **Record errors**: wire-format parsing and empty-result conditions
//! - **Config errors**: file loading and validation failures
//! - **Configuration invariants**: empty server pool, no usable instances;
//!   unrecoverable by design, the host is expected to abort on them
//! - **Listener errors**: push-listener bind exhaustion at startup
//!
//! # Example
//!
//! ```
//! use svcreg::error::RegistryError;
//!
//! let err = RegistryError::NoServerAvailable;
//! assert!(!err.is_recoverable());
//! assert!(err.is_configuration_invariant());
//! ```

use std::io;

use thiserror::Error;

/// Result alias for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Top-level error type for the registry client
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Wire-format record errors (parse failure, empty instance list)
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No control-plane server is configured or resolvable
    ///
    /// A configuration invariant: no request can be served without at least
    /// one control-plane address.
    #[error("No registry server available")]
    NoServerAvailable,

    /// Weighted expansion produced no usable instances
    ///
    /// A configuration invariant: a record with no valid, positively
    /// weighted instances is a caller error, not a soft-fail condition.
    #[error("No usable instances for service: {service}")]
    NoUsableInstances {
        /// The service whose record had no valid instances
        service: String,
    },

    /// All port probe attempts for the push listener failed
    ///
    /// Fatal at push-listener startup only; the host may degrade to
    /// pull-only operation by disabling the push feature.
    #[error("Push listener failed to bind after {attempts} attempts")]
    ListenerBindExhausted {
        /// Number of bind attempts made
        attempts: u32,
    },

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RegistryError {
    /// Check if this error is recoverable (the operation may succeed on retry)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Record(e) => e.is_recoverable(),
            Self::Config(_)
            | Self::NoServerAvailable
            | Self::NoUsableInstances { .. }
            | Self::ListenerBindExhausted { .. } => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Check if this error represents a violated configuration invariant
    ///
    /// These are deliberate hard-stop conditions: the host should treat them
    /// as unrecoverable rather than retrying.
    #[must_use]
    pub const fn is_configuration_invariant(&self) -> bool {
        matches!(
            self,
            Self::NoServerAvailable | Self::NoUsableInstances { .. }
        )
    }
}

/// Errors from parsing service-record wire payloads
#[derive(Debug, Error)]
pub enum RecordError {
    /// The response body is not well-formed JSON
    ///
    /// The fetch attempt is discarded entirely; any stale record is retained.
    #[error("Failed to parse record: {reason}")]
    Parse {
        /// Description of the parse failure
        reason: String,
    },

    /// The record parsed but carries zero instances
    ///
    /// Distinct from a parse failure: the record's name is still usable for
    /// bookkeeping, but selection against it must fail.
    #[error("Empty instance list for service: {name}")]
    EmptyInstances {
        /// The service name from the parsed record
        name: String,
    },
}

impl RecordError {
    /// Record errors are recoverable: the next refresh pass retries
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// The path that was not found
        path: String,
    },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_invariants() {
        assert!(RegistryError::NoServerAvailable.is_configuration_invariant());
        assert!(RegistryError::NoUsableInstances {
            service: "svc".into()
        }
        .is_configuration_invariant());
        assert!(!RegistryError::ListenerBindExhausted { attempts: 3 }.is_configuration_invariant());
    }

    #[test]
    fn test_record_errors_recoverable() {
        let err = RegistryError::Record(RecordError::Parse {
            reason: "bad json".into(),
        });
        assert!(err.is_recoverable());

        let err = RegistryError::Record(RecordError::EmptyInstances { name: "svc".into() });
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::FileNotFound {
            path: "/etc/svcreg.json".into(),
        };
        assert!(err.to_string().contains("/etc/svcreg.json"));
    }

    #[test]
    fn test_bind_exhaustion_unrecoverable() {
        let err = RegistryError::ListenerBindExhausted { attempts: 3 };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains('3'));
    }
}
