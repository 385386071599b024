//! Kernel IPsec state management for the Keel security stack.
//!
//! This crate sits between a key-exchange daemon and the kernel's IPsec
//! tables. It turns protect rules into security policies and negotiated keys
//! into security associations, installs both through a [`KernelChannel`],
//! and removes them again on teardown.
//!
//! # Features
//!
//! - `ipsec` (default) - policy and association management
//! - `serde` - (de)serialization of configuration and rule types
//!
//! # Example
//!
//! ```rust
//! use keel_proto::ipsec::{IpProtocol, IpsecProtocol, MemoryKernel, PolicyManager, ProtectRule, SessionConfig};
//! use std::sync::Arc;
//!
//! let kernel = Arc::new(MemoryKernel::new());
//! let policies = PolicyManager::new(kernel.clone(), &SessionConfig::default());
//!
//! let rule = ProtectRule::transport(IpsecProtocol::Ah, IpProtocol::Tcp, 0, 80).unwrap();
//! policies
//!     .create_policies("192.168.1.1".parse().unwrap(), "192.168.1.2".parse().unwrap(), &[rule])
//!     .unwrap();
//!
//! assert_eq!(kernel.policy_count(), 2);
//! ```
//!
//! [`KernelChannel`]: ipsec::KernelChannel
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
