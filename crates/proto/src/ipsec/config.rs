//! Session configuration
//!
//! Provides [`SessionConfig`] and its builder. Everything here applies to all
//! sessions opened by one [`SessionManager`]; per-session intent lives in
//! [`ProtectRule`]s.
//!
//! [`SessionManager`]: super::session::SessionManager
//! [`ProtectRule`]: super::rule::ProtectRule

use super::{error::ValidationError, sa::SaLifetime};
use std::time::Duration;

/// Role of this host in the IPsec topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HostRole {
    /// Protects only its own traffic (IN + OUT policies)
    #[default]
    EndHost,
    /// Also routes tunneled traffic for others (adds FWD policies)
    Gateway,
}

/// Configuration shared by every session of a manager
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Host role, decides whether FWD policies are installed
    pub role: HostRole,

    /// Priority of the least specific policy
    pub base_priority: u32,

    /// Tag stamped on every installed policy and association
    pub owner: u32,

    /// Longest wait for a single kernel request (None = unbounded)
    pub kernel_timeout: Option<Duration>,

    /// Lifetime of installed associations
    pub lifetime: SaLifetime,

    /// Anti-replay window of installed associations
    pub replay_window: u32,

    /// Remove every kernel entry on init, not just owned ones
    pub purge_on_init: bool,
}

impl SessionConfig {
    /// Default base priority
    pub const DEFAULT_BASE_PRIORITY: u32 = 0x3000;

    /// Default owner tag ("keel")
    pub const DEFAULT_OWNER: u32 = 0x6b65_656c;

    /// Default anti-replay window
    pub const DEFAULT_REPLAY_WINDOW: u32 = 32;

    /// Largest anti-replay window the kernel accepts
    pub const MAX_REPLAY_WINDOW: u32 = 4096;

    /// Highest specificity a selector can reach (two /128 prefixes, two ports, protocol)
    const MAX_SPECIFICITY: u32 = 128 + 128 + 3;

    /// Create builder for session configuration
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_priority <= Self::MAX_SPECIFICITY {
            return Err(ValidationError::new(format!(
                "base_priority must exceed {}",
                Self::MAX_SPECIFICITY
            )));
        }
        if self.owner == 0 {
            return Err(ValidationError::new("owner tag cannot be 0"));
        }
        if self.kernel_timeout == Some(Duration::ZERO) {
            return Err(ValidationError::new("kernel_timeout cannot be zero"));
        }
        if self.replay_window > Self::MAX_REPLAY_WINDOW {
            return Err(ValidationError::new(format!(
                "replay_window cannot exceed {}",
                Self::MAX_REPLAY_WINDOW
            )));
        }
        if self.lifetime.soft_time >= self.lifetime.hard_time {
            return Err(ValidationError::new(
                "soft lifetime must be less than hard lifetime",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            role: HostRole::EndHost,
            base_priority: Self::DEFAULT_BASE_PRIORITY,
            owner: Self::DEFAULT_OWNER,
            kernel_timeout: None,
            lifetime: SaLifetime::default(),
            replay_window: Self::DEFAULT_REPLAY_WINDOW,
            purge_on_init: false,
        }
    }
}

/// Builder for SessionConfig
#[derive(Default)]
pub struct SessionConfigBuilder {
    role: Option<HostRole>,
    base_priority: Option<u32>,
    owner: Option<u32>,
    kernel_timeout: Option<Duration>,
    lifetime: Option<SaLifetime>,
    replay_window: Option<u32>,
    purge_on_init: bool,
}

impl SessionConfigBuilder {
    /// Create new session config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host role
    pub fn with_role(mut self, role: HostRole) -> Self {
        self.role = Some(role);
        self
    }

    /// Set base policy priority
    pub fn with_base_priority(mut self, priority: u32) -> Self {
        self.base_priority = Some(priority);
        self
    }

    /// Set owner tag
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Bound every kernel request by `timeout`
    pub fn with_kernel_timeout(mut self, timeout: Duration) -> Self {
        self.kernel_timeout = Some(timeout);
        self
    }

    /// Set SA lifetime
    pub fn with_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Set anti-replay window
    pub fn with_replay_window(mut self, window: u32) -> Self {
        self.replay_window = Some(window);
        self
    }

    /// Purge both kernel tables on init
    pub fn with_purge_on_init(mut self, purge: bool) -> Self {
        self.purge_on_init = purge;
        self
    }

    /// Build SessionConfig with validation
    pub fn build(self) -> Result<SessionConfig, ValidationError> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            role: self.role.unwrap_or(defaults.role),
            base_priority: self.base_priority.unwrap_or(defaults.base_priority),
            owner: self.owner.unwrap_or(defaults.owner),
            kernel_timeout: self.kernel_timeout,
            lifetime: self.lifetime.unwrap_or(defaults.lifetime),
            replay_window: self.replay_window.unwrap_or(defaults.replay_window),
            purge_on_init: self.purge_on_init,
        };

        config.validate()?;
        Ok(config)
    }
}
