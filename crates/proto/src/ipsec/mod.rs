//! IPsec security policy and security association management
//!
//! This module keeps the kernel's two IPsec tables in step with what the
//! key-exchange daemon has negotiated:
//!
//! - **SPD** (Security Policy Database) - which traffic must be protected
//! - **SAD** (Security Association Database) - the keys that protect it
//!
//! # Architecture
//!
//! ```text
//! Key-exchange daemon
//!   ├── ProtectRule (what to protect)
//!   └── NegotiatedChild (SPIs + keys)
//!        ↓
//! SessionManager / Session
//!   ├── PolicyManager      → IN / OUT / FWD policies
//!   ├── AssociationManager → inbound + outbound SAs
//!   ├── PolicyLeases       → policies shared between sessions
//!   └── Journal            → rollback of partial installs
//!        ↓
//! KernelChannel (xfrm-style SPD/SAD requests)
//! ```
//!
//! Every entry this crate installs carries an owner tag, so flushes only
//! remove what the local process put there.
//!
//! # Quick Start
//!
//! ```rust
//! use keel_proto::ipsec::{
//!     HostRole, IpProtocol, IpsecProtocol, MemoryKernel, ProtectRule, SessionConfig,
//!     SessionManager, SessionState, SpiAllocator,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> keel_proto::ipsec::Result<()> {
//! let kernel = Arc::new(MemoryKernel::new());
//! let config = SessionConfig::builder()
//!     .with_role(HostRole::Gateway)
//!     .build()?;
//! let manager = SessionManager::with_allocator(kernel.clone(), config, Arc::new(SpiAllocator::new()));
//!
//! let rule = ProtectRule::tunnel(
//!     IpsecProtocol::Esp,
//!     IpProtocol::Any,
//!     "192.168.1.0/24".parse().unwrap(),
//!     "10.0.0.0/8".parse().unwrap(),
//! )?;
//! let mut session = manager.open(
//!     "203.0.113.1".parse().unwrap(),
//!     "198.51.100.7".parse().unwrap(),
//!     vec![rule],
//! )?;
//!
//! session.install_policies()?;
//! assert_eq!(session.state(), SessionState::PoliciesInstalled);
//! assert_eq!(kernel.policy_count(), 3); // IN, OUT and FWD
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4301](https://datatracker.ietf.org/doc/html/rfc4301) - Security Architecture for IP
//! - [RFC 4302](https://datatracker.ietf.org/doc/html/rfc4302) - AH
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - ESP
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 transform IDs

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod algorithm;
pub mod config;
pub mod error;
pub mod journal;
pub mod kernel;
pub mod lease;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod rule;
pub mod sa;
pub mod selector;
pub mod session;
pub mod spi;

// Re-export commonly used types
pub use algorithm::{CipherId, CipherKey, IntegrityId, IntegrityKey};
pub use config::{HostRole, SessionConfig};
pub use error::{Error, ErrorKind, PolicyError, Result, SaError, ValidationError};
pub use kernel::{DeadlineChannel, KernelChannel, KernelError, KernelResult};
pub use memory::{KernelOp, MemoryKernel};
pub use metrics::{IpsecMetrics, MetricsSnapshot};
pub use policy::{Direction, Policy, PolicyManager};
pub use rule::{IpsecProtocol, Mode, ProtectRule};
pub use sa::{AssociationManager, SaLifetime, SecurityAssociation};
pub use selector::{IpProtocol, Selector, TrafficSelector};
pub use session::{NegotiatedChild, Session, SessionManager, SessionState, SpiPair};
pub use spi::SpiAllocator;
