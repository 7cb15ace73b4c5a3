//! Unified error handling for the redirect server
//!
//! One error type covers every failure the server surfaces: startup
//! configuration problems, data-set load failures, malformed SIP traffic and
//! transport faults. Per-record parse problems during loads are deliberately
//! NOT errors; loaders log them and continue with safe defaults.

use std::error::Error as StdError;
use std::fmt;

/// Unified error type for redirect-server operations
#[derive(Debug, Clone, PartialEq)]
pub enum GoMobileError {
    /// Missing or unreadable configuration. Fatal at startup.
    ConfigError {
        key: String,
        reason: String,
    },

    /// A rule or FNM data set could not be loaded at all
    /// (no files, unreadable file, HTTP non-200).
    LoadError {
        source_path: String,
        reason: String,
    },

    /// A SIP message could not be parsed far enough to answer it
    ParseError {
        message: String,
        context: Option<String>,
    },

    /// Network and transport errors (socket bind, send failures)
    TransportError {
        endpoint: String,
        reason: String,
        recoverable: bool,
    },
}

impl fmt::Display for GoMobileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoMobileError::ConfigError { key, reason } => {
                write!(f, "Config error ({}): {}", key, reason)
            }
            GoMobileError::LoadError { source_path, reason } => {
                write!(f, "Load error from {}: {}", source_path, reason)
            }
            GoMobileError::ParseError { message, context } => {
                write!(f, "Parse error: {}", message)?;
                if let Some(ctx) = context {
                    write!(f, " ({})", ctx)?;
                }
                Ok(())
            }
            GoMobileError::TransportError { endpoint, reason, recoverable } => {
                write!(
                    f,
                    "Transport error to {}: {} (recoverable: {})",
                    endpoint, reason, recoverable
                )
            }
        }
    }
}

impl StdError for GoMobileError {}

impl GoMobileError {
    /// Create a configuration error
    pub fn config_error(key: impl Into<String>, reason: impl Into<String>) -> Self {
        GoMobileError::ConfigError {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a data-set load error
    pub fn load_error(source_path: impl Into<String>, reason: impl Into<String>) -> Self {
        GoMobileError::LoadError {
            source_path: source_path.into(),
            reason: reason.into(),
        }
    }

    /// Create a parse error with optional context
    pub fn parse_error(message: impl Into<String>, context: Option<String>) -> Self {
        GoMobileError::ParseError {
            message: message.into(),
            context,
        }
    }

    /// Create a transport error
    pub fn transport_error(
        endpoint: impl Into<String>,
        reason: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        GoMobileError::TransportError {
            endpoint: endpoint.into(),
            reason: reason.into(),
            recoverable,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            GoMobileError::ConfigError { .. } => false,
            GoMobileError::LoadError { .. } => false,
            GoMobileError::ParseError { .. } => true,
            GoMobileError::TransportError { recoverable, .. } => *recoverable,
        }
    }

    /// Get error category for log filtering
    pub fn category(&self) -> &'static str {
        match self {
            GoMobileError::ConfigError { .. } => "config",
            GoMobileError::LoadError { .. } => "load",
            GoMobileError::ParseError { .. } => "parsing",
            GoMobileError::TransportError { .. } => "transport",
        }
    }
}

impl From<std::io::Error> for GoMobileError {
    fn from(err: std::io::Error) -> Self {
        GoMobileError::TransportError {
            endpoint: String::new(),
            reason: err.to_string(),
            recoverable: false,
        }
    }
}

/// Result type for redirect-server operations
pub type GoMobileResult<T> = Result<T, GoMobileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let load_error = GoMobileError::load_error("/data/policy", "no csv files found");
        assert!(load_error.to_string().contains("/data/policy"));
        assert!(!load_error.is_recoverable());

        let parse_error = GoMobileError::parse_error("missing From header", None);
        assert!(parse_error.is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(GoMobileError::config_error("sipserver.port", "missing").category(), "config");
        assert_eq!(GoMobileError::parse_error("x", None).category(), "parsing");
        assert_eq!(
            GoMobileError::transport_error("0.0.0.0:5060", "bind failed", false).category(),
            "transport"
        );
    }
}
