//! Rollback journal
//!
//! Every kernel entry a high-level operation newly installs is recorded as
//! an [`Undo`] step. When a later step fails, the journal is unwound in
//! reverse installation order. Unwinding never stops early: a failed undo
//! step is logged and counted, and the remaining steps still run.

use super::{
    kernel::KernelError, logging, policy::Direction, rule::IpsecProtocol, selector::Selector,
};
use std::fmt;
use std::net::IpAddr;

/// Removal that reverts one installed kernel entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    /// Remove a policy
    Policy {
        /// Policy direction
        direction: Direction,
        /// Policy selector
        selector: Selector,
    },

    /// Remove an association
    Sa {
        /// Association SPI
        spi: u32,
        /// Association protocol
        protocol: IpsecProtocol,
        /// Association destination
        dst: IpAddr,
    },
}

impl fmt::Display for Undo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Undo::Policy {
                direction,
                selector,
            } => write!(f, "remove {} policy {}", direction, selector),
            Undo::Sa { spi, protocol, dst } => {
                write!(f, "remove {} SA 0x{:08x} to {}", protocol, spi, dst)
            }
        }
    }
}

/// Undo log for one high-level operation
#[derive(Debug, Default)]
pub struct Journal {
    steps: Vec<Undo>,
}

impl Journal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly installed entry
    pub fn record(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// Recorded steps in installation order
    pub fn steps(&self) -> &[Undo] {
        &self.steps
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append another journal's steps after this one's
    pub fn extend(&mut self, other: Journal) {
        self.steps.extend(other.steps);
    }

    /// Run `undo` for every step, newest first
    ///
    /// Returns the number of steps that failed.
    pub fn unwind<F>(self, mut undo: F) -> usize
    where
        F: FnMut(&Undo) -> Result<(), KernelError>,
    {
        if self.steps.is_empty() {
            return 0;
        }

        logging::log_rollback_started(self.steps.len());

        let mut failures = 0;
        for step in self.steps.iter().rev() {
            if let Err(e) = undo(step) {
                logging::log_rollback_step_failed(step, &e);
                failures += 1;
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa_step(spi: u32) -> Undo {
        Undo::Sa {
            spi,
            protocol: IpsecProtocol::Esp,
            dst: "10.0.0.2".parse().unwrap(),
        }
    }

    #[test]
    fn test_unwind_newest_first() {
        let mut journal = Journal::new();
        journal.record(sa_step(0x100));
        journal.record(sa_step(0x101));
        journal.record(sa_step(0x102));

        let mut seen = Vec::new();
        let failures = journal.unwind(|step| {
            if let Undo::Sa { spi, .. } = step {
                seen.push(*spi);
            }
            Ok(())
        });

        assert_eq!(failures, 0);
        assert_eq!(seen, vec![0x102, 0x101, 0x100]);
    }

    #[test]
    fn test_unwind_continues_past_failures() {
        let mut journal = Journal::new();
        journal.record(sa_step(0x100));
        journal.record(sa_step(0x101));

        let mut attempts = 0;
        let failures = journal.unwind(|_| {
            attempts += 1;
            Err(KernelError::new(KernelError::EINVAL, "Invalid argument"))
        });

        assert_eq!(attempts, 2);
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut first = Journal::new();
        first.record(sa_step(1));
        let mut second = Journal::new();
        second.record(sa_step(2));

        first.extend(second);
        assert_eq!(first.len(), 2);
        assert_eq!(first.steps()[1], sa_step(2));
        assert!(Journal::new().is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            sa_step(0x1234).to_string(),
            "remove ESP SA 0x00001234 to 10.0.0.2"
        );
    }
}
