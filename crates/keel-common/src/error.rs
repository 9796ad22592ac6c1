//! Error types for keel
//!
//! Errors are grouped by how the task engine must treat them:
//! transport/runtime failures are retried, validation and safety errors are
//! surfaced immediately, and fan-out failures are aggregated per host.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// A single host's failure inside a fan-out aggregate
#[derive(Debug)]
pub struct HostFailure {
    /// Hostname (or address when the hostname is not known yet)
    pub host: String,
    /// What went wrong on that host
    pub error: Error,
}

/// Main error type for keel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Could not open, or lost, the command channel to a host
    #[error("connection error for {host}: {message}")]
    Connection {
        /// Host the channel was opened against
        host: String,
        /// Description of the transport failure
        message: String,
    },

    /// A remote command exited non-zero
    #[error("command on {host} exited with code {exit_code}: {stderr}")]
    CommandFailed {
        /// Host the command ran on
        host: String,
        /// The rendered command line
        command: String,
        /// Process exit code
        exit_code: i32,
        /// Captured standard error
        stderr: String,
    },

    /// Invalid configuration or a forbidden version transition
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "versions.kubernetes")
        field: Option<String>,
    },

    /// Continuing automatically could make quorum loss worse
    #[error("manual intervention required: {message}")]
    ManualIntervention {
        /// Why the run stopped
        message: String,
    },

    /// Every failing host of a parallel fan-out
    #[error("{} host(s) failed: {}", .0.len(), format_failures(.0))]
    HostFailures(Vec<HostFailure>),

    /// An error annotated with the task operation it happened under
    #[error("{operation}: {source}")]
    Operation {
        /// Human readable operation name of the task
        operation: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Health endpoint or HTTP gateway failure
    #[error("http error [{endpoint}]: {message}")]
    Http {
        /// Endpoint that was queried
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Etcd membership or status failure
    #[error("etcd error: {message}")]
    Etcd {
        /// Description of what failed
        message: String,
    },

    /// Command template failed to render
    #[error("template error: {source}")]
    Template {
        /// The underlying minijinja error
        #[from]
        source: minijinja::Error,
    },

    /// Manifest could not be read or parsed
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// Local I/O error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// The run was cancelled while the operation was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "probe", "reconcile")
        context: String,
    },
}

fn format_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] {}", f.host, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a connection error for a host
    pub fn connection(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a manifest field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a safety-critical error that stops the run
    pub fn manual_intervention(msg: impl Into<String>) -> Self {
        Self::ManualIntervention {
            message: msg.into(),
        }
    }

    /// Create an HTTP error for an endpoint
    pub fn http(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create an etcd error
    pub fn etcd(msg: impl Into<String>) -> Self {
        Self::Etcd {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the operation name of the task it failed under
    pub fn with_operation(self, operation: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and safety errors never change outcome on retry.
    /// Aggregates are retryable when any host failure is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } | Error::CommandFailed { .. } => true,
            Error::Validation { .. } | Error::ManualIntervention { .. } => false,
            Error::HostFailures(failures) => failures.iter().any(|f| f.error.is_retryable()),
            Error::Operation { source, .. } => source.is_retryable(),
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Http { .. } | Error::Etcd { .. } | Error::Io { .. } => true,
            Error::Template { .. } | Error::Config { .. } | Error::Cancelled => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error (or the error it wraps) is a transport failure
    ///
    /// A transport failure means the cached connection to the host can no
    /// longer be trusted.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Operation { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Hosts named by a fan-out aggregate, in failure order
    pub fn failed_hosts(&self) -> Vec<&str> {
        match self {
            Error::HostFailures(failures) => failures.iter().map(|f| f.host.as_str()).collect(),
            Error::Operation { source, .. } => source.failed_hosts(),
            _ => Vec::new(),
        }
    }

    /// Get the operation name if this error was raised under a task
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::Operation { operation, .. } => Some(operation),
            _ => None,
        }
    }
}
