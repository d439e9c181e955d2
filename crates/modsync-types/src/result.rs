//! Result type alias for modsync operations

use crate::Error;

/// Result type alias for modsync operations
pub type Result<T> = std::result::Result<T, Error>;
