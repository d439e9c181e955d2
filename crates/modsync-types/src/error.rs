//! Error types and handling for modsync
//!
//! Every fault raised by the sync engine is a variant of [`Error`]. Callers never
//! inspect concrete variants to decide whether to retry or whether to cancel sibling
//! workers; they ask for the [`ErrorKind`] instead.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

// Serde is imported conditionally through cfg_attr

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - entire process should be terminated
    Critical,
}

/// Diagnostic context attached to internal consistency faults
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ErrorContext {
    /// Operation that was being performed
    pub operation: String,
    /// Additional context information
    pub details: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            details: BTreeMap::new(),
        }
    }

    /// Add a detail to the context
    pub fn with_detail(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        for (key, value) in &self.details {
            write!(f, ", {key}={value}")?;
        }
        Ok(())
    }
}

/// Main error type for modsync operations
#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Error {
    /// Local I/O operation failed
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// File not found
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found
        path: PathBuf,
    },

    /// Permission denied
    #[error("Permission denied: {path}")]
    PermissionDenied {
        /// Path to the file with permission issues
        path: PathBuf,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Transport or connect failure, including transient negative server replies
    #[error("Connection error: {message}")]
    Connection {
        /// Error message describing the connection issue
        message: String,
    },

    /// Definitive negative server response
    #[error("Protocol error{}: {message}", render_code(.code))]
    Protocol {
        /// Server reply code, when the transport has one
        code: Option<u16>,
        /// Error message describing the rejection
        message: String,
    },

    /// Transient I/O failure on the remote side
    #[error("Transient I/O error: {message}")]
    TransientIo {
        /// Error message describing the transient condition
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// A violated invariant; always a programming error
    #[error("Internal consistency fault: {message}{}", render_context(.context))]
    Internal {
        /// What went wrong
        message: String,
        /// Diagnostic details
        context: Option<ErrorContext>,
    },

    /// Operation cancelled by the user
    #[error("Operation cancelled")]
    Cancelled,

    /// Several independent faults collected from a group of workers
    #[error("{} fault(s) occurred: {}", .errors.len(), summarize(.errors))]
    Aggregate {
        /// The underlying faults in the order they were observed
        errors: Vec<Error>,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Local I/O errors
    Io,
    /// Configuration errors
    Config,
    /// Connection-level faults; retried and never cancel siblings
    Connection,
    /// Permanent protocol rejections
    Protocol,
    /// Timeouts and transient I/O faults
    TransientIo,
    /// Internal consistency faults
    Internal,
    /// User cancellation
    Cancelled,
    /// A collection of faults
    Aggregate,
    /// Other errors
    Other,
}

fn render_code(code: &Option<u16>) -> String {
    code.map(|c| format!(" ({c})")).unwrap_or_default()
}

fn render_context(context: &Option<ErrorContext>) -> String {
    context
        .as_ref()
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default()
}

fn summarize(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } | Self::FileNotFound { .. } | Self::PermissionDenied { .. } => {
                ErrorKind::Io
            }
            Self::Config { .. } => ErrorKind::Config,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::TransientIo { .. } | Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Aggregate { .. } => ErrorKind::Aggregate,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::TransientIo { .. }
            | Self::Timeout { .. }
            | Self::Other { .. } => ErrorSeverity::Medium,
            Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Config { .. }
            | Self::Protocol { .. } => ErrorSeverity::High,
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::Cancelled => ErrorSeverity::Low,
            Self::Aggregate { errors } => errors
                .iter()
                .map(Self::severity)
                .max()
                .unwrap_or(ErrorSeverity::High),
        }
    }

    /// Check if this error is recoverable by retrying the same operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::TransientIo { .. } | Self::Timeout { .. } => true,
            Self::Aggregate { errors } => {
                !errors.is_empty() && errors.iter().all(Self::is_recoverable)
            }
            Self::Io { .. }
            | Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Config { .. }
            | Self::Protocol { .. }
            | Self::Internal { .. }
            | Self::Cancelled
            | Self::Other { .. } => false,
        }
    }

    /// Check if this error should trigger a retry
    pub fn should_retry(&self) -> bool {
        self.is_recoverable() && self.severity() <= ErrorSeverity::Medium
    }

    /// Check whether this is a user cancellation rather than a fault
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Aggregate { errors } => {
                !errors.is_empty() && errors.iter().all(Self::is_cancellation)
            }
            _ => false,
        }
    }

    /// The individual faults carried by this error
    ///
    /// For an aggregate this is its inner list, for anything else the error itself.
    pub fn faults(&self) -> &[Error] {
        match self {
            Self::Aggregate { errors } => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new permanent protocol error
    pub fn protocol<S: Into<String>>(code: Option<u16>, message: S) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Classify a negative server reply by its code
    ///
    /// Codes in the 4xx range are transient negative completions and map to a
    /// connection fault; anything else is a permanent rejection.
    pub fn server_reply<S: Into<String>>(code: u16, message: S) -> Self {
        if (400..500).contains(&code) {
            Self::Connection {
                message: format!("server replied {code}: {}", message.into()),
            }
        } else {
            Self::protocol(Some(code), message)
        }
    }

    /// Create a new transient I/O error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    /// Create a new internal consistency fault
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// Create a new internal consistency fault with diagnostic context
    pub fn internal_with_context<S: Into<String>>(message: S, context: ErrorContext) -> Self {
        Self::Internal {
            message: message.into(),
            context: Some(context),
        }
    }

    /// Collect several faults into one, flattening nested aggregates
    pub fn aggregate<I: IntoIterator<Item = Error>>(errors: I) -> Self {
        let mut flat = Vec::new();
        for error in errors {
            match error {
                Self::Aggregate { errors } => flat.extend(errors),
                other => flat.push(other),
            }
        }
        Self::Aggregate { errors: flat }
    }

    /// Convert an I/O error raised while touching `path`
    pub fn io_at(path: &Path, error: &std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => Self::Io {
                message: format!("'{}': {}", path.display(), error),
            },
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match error.kind() {
            Io::TimedOut
            | Io::Interrupted
            | Io::WouldBlock
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::UnexpectedEof => Self::TransientIo {
                message: error.to_string(),
            },
            _ => Self::Io {
                message: error.to_string(),
            },
        }
    }
}
