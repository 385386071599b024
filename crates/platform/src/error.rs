//! Error types for Keel

use std::fmt;

/// Unified error type for all Keel modules
#[derive(Debug)]
pub enum KeelError {
    /// The kernel rejected a request
    Kernel {
        /// errno-style code reported by the kernel
        code: i32,
        /// Human-readable reason
        reason: String,
    },

    /// Protocol or validation error
    Protocol(String),

    /// Operation not allowed in the current state
    State(String),
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Kernel { code, reason } => {
                write!(f, "Kernel error {}: {}", code, reason)
            }
            KeelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            KeelError::State(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for KeelError {}

/// Result type for Keel operations
pub type KeelResult<T> = Result<T, KeelError>;
