//! # Keel Platform
//!
//! Core platform types and traits shared by the Keel crates.
//!
//! This crate provides:
//! - Unified error types (`KeelError`, `KeelResult`)
//! - The `SecurityModule` lifecycle trait
//!
//! # Examples
//!
//! ```
//! use keel_platform::{KeelError, KeelResult};
//!
//! fn example_function() -> KeelResult<String> {
//!     Ok("Hello, Keel!".to_string())
//! }
//!
//! # fn main() -> KeelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Keel!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{KeelError, KeelResult};
pub use traits::{ModuleStatus, SecurityModule};
