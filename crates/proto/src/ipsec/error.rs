//! Error types for IPSec policy and association management
//!
//! Errors fall into four families:
//!
//! - **Validation**: malformed selector, inconsistent mode/subnet combination,
//!   missing algorithm. Always detected before any kernel call.
//! - **Kernel**: the kernel channel rejected a request. Carries the kernel code.
//! - **DuplicateSpi**: the SPI is already in use for its (destination, protocol)
//!   namespace. Detected before installation.
//! - **State**: the session is not in a state that allows the operation.

use super::kernel::KernelError;
use super::rule::IpsecProtocol;
use std::fmt;
use std::net::IpAddr;

/// Result type for session-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Input rejected before reaching the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    /// Create a validation error with a message
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
        }
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Policy Manager errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Rule or selector rejected before any kernel call
    Validation(ValidationError),

    /// Kernel rejected a policy request
    Kernel(KernelError),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::Validation(e) => write!(f, "Invalid policy request: {}", e),
            PolicyError::Kernel(e) => write!(f, "Kernel rejected policy: {}", e),
        }
    }
}

impl std::error::Error for PolicyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PolicyError::Validation(e) => Some(e),
            PolicyError::Kernel(e) => Some(e),
        }
    }
}

impl From<ValidationError> for PolicyError {
    fn from(err: ValidationError) -> Self {
        PolicyError::Validation(err)
    }
}

impl From<KernelError> for PolicyError {
    fn from(err: KernelError) -> Self {
        PolicyError::Kernel(err)
    }
}

/// Association Manager errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaError {
    /// Selector, mode or algorithm combination rejected before any kernel call
    Validation(ValidationError),

    /// Key length does not match the declared algorithm
    BadKeyLength {
        /// Algorithm the key was supplied for
        algorithm: &'static str,
        /// Required length in bytes
        expected: usize,
        /// Supplied length in bytes
        actual: usize,
    },

    /// SPI outside the assignable range (0-255 are reserved)
    InvalidSpi(u32),

    /// SPI already in use for this (destination, protocol)
    DuplicateSpi {
        /// Conflicting SPI
        spi: u32,
        /// Destination address of the namespace
        dst: IpAddr,
        /// Protocol of the namespace
        protocol: IpsecProtocol,
    },

    /// Allocator could not find a free SPI
    SpiExhausted {
        /// Destination address of the namespace
        dst: IpAddr,
        /// Protocol of the namespace
        protocol: IpsecProtocol,
    },

    /// Kernel rejected an association request
    Kernel(KernelError),
}

impl fmt::Display for SaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaError::Validation(e) => write!(f, "Invalid association request: {}", e),
            SaError::BadKeyLength {
                algorithm,
                expected,
                actual,
            } => write!(
                f,
                "Bad key length for {}: expected {} bytes, got {}",
                algorithm, expected, actual
            ),
            SaError::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            SaError::DuplicateSpi { spi, dst, protocol } => write!(
                f,
                "Duplicate SPI 0x{:08x} for {} {}",
                spi, protocol, dst
            ),
            SaError::SpiExhausted { dst, protocol } => {
                write!(f, "No free SPI for {} {}", protocol, dst)
            }
            SaError::Kernel(e) => write!(f, "Kernel rejected association: {}", e),
        }
    }
}

impl std::error::Error for SaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SaError::Validation(e) => Some(e),
            SaError::Kernel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for SaError {
    fn from(err: ValidationError) -> Self {
        SaError::Validation(err)
    }
}

impl From<KernelError> for SaError {
    fn from(err: KernelError) -> Self {
        SaError::Kernel(err)
    }
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally, nothing was applied
    Validation,
    /// Kernel rejected a request
    Kernel,
    /// SPI collision, caller must retry with a new SPI
    DuplicateSpi,
    /// Operation not allowed in the current session state
    State,
}

/// Session-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Policy installation or removal failed
    Policy(PolicyError),

    /// Association installation or removal failed
    Sa(SaError),

    /// Request rejected by the session facade itself
    Validation(ValidationError),

    /// Session state machine error
    InvalidState(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Policy(PolicyError::Validation(_)) => ErrorKind::Validation,
            Error::Policy(PolicyError::Kernel(_)) => ErrorKind::Kernel,
            Error::Sa(SaError::Kernel(_)) => ErrorKind::Kernel,
            Error::Sa(SaError::DuplicateSpi { .. }) => ErrorKind::DuplicateSpi,
            Error::Sa(_) => ErrorKind::Validation,
            Error::Validation(_) => ErrorKind::Validation,
            Error::InvalidState(_) => ErrorKind::State,
        }
    }

    /// Kernel error carried by this error, if any
    pub fn kernel_error(&self) -> Option<&KernelError> {
        match self {
            Error::Policy(PolicyError::Kernel(e)) | Error::Sa(SaError::Kernel(e)) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Policy(e) => write!(f, "{}", e),
            Error::Sa(e) => write!(f, "{}", e),
            Error::Validation(e) => write!(f, "Invalid request: {}", e),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Policy(e) => Some(e),
            Error::Sa(e) => Some(e),
            Error::Validation(e) => Some(e),
            Error::InvalidState(_) => None,
        }
    }
}

impl From<PolicyError> for Error {
    fn from(err: PolicyError) -> Self {
        Error::Policy(err)
    }
}

impl From<SaError> for Error {
    fn from(err: SaError) -> Self {
        Error::Sa(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<Error> for keel_platform::KeelError {
    fn from(err: Error) -> Self {
        match err.kernel_error() {
            Some(kernel) => keel_platform::KeelError::Kernel {
                code: kernel.code,
                reason: kernel.reason.clone(),
            },
            None => match err {
                Error::InvalidState(msg) => keel_platform::KeelError::State(msg),
                other => keel_platform::KeelError::Protocol(other.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_error_display() {
        let err = SaError::BadKeyLength {
            algorithm: "cbc(aes)",
            expected: 16,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Bad key length for cbc(aes): expected 16 bytes, got 4"
        );

        let err = SaError::InvalidSpi(0x10);
        assert_eq!(err.to_string(), "Invalid SPI: 0x00000010");

        let err = SaError::DuplicateSpi {
            spi: 0x31323334,
            dst: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            protocol: IpsecProtocol::Esp,
        };
        assert_eq!(
            err.to_string(),
            "Duplicate SPI 0x31323334 for ESP 192.168.1.2"
        );
    }

    #[test]
    fn test_error_kind() {
        let kernel = KernelError::new(KernelError::EINVAL, "Invalid argument");

        assert_eq!(
            Error::from(PolicyError::Kernel(kernel.clone())).kind(),
            ErrorKind::Kernel
        );
        assert_eq!(
            Error::from(SaError::Kernel(kernel)).kind(),
            ErrorKind::Kernel
        );
        assert_eq!(
            Error::from(SaError::BadKeyLength {
                algorithm: "hmac(md5)",
                expected: 16,
                actual: 8
            })
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            Error::InvalidState("partial".into()).kind(),
            ErrorKind::State
        );
    }

    #[test]
    fn test_platform_conversion() {
        let err = Error::from(PolicyError::Kernel(KernelError::new(
            KernelError::EINVAL,
            "Invalid argument",
        )));
        match keel_platform::KeelError::from(err) {
            keel_platform::KeelError::Kernel { code, reason } => {
                assert_eq!(code, KernelError::EINVAL);
                assert_eq!(reason, "Invalid argument");
            }
            other => panic!("Expected kernel error, got {:?}", other),
        }

        let err = Error::InvalidState("session is partial".into());
        assert!(matches!(
            keel_platform::KeelError::from(err),
            keel_platform::KeelError::State(_)
        ));
    }
}
