//! Core traits for Keel modules

use crate::KeelResult;

/// Lifecycle interface shared by Keel modules
///
/// A daemon drives every module through `init` at startup and `shutdown`
/// before exit, so that state left in the kernel by a previous run can be
/// reconciled and state owned by this run is released.
pub trait SecurityModule: Send + Sync {
    /// Unique module identifier
    fn id(&self) -> &'static str;

    /// Module version
    fn version(&self) -> &'static str;

    /// Module description
    fn description(&self) -> &'static str;

    /// Initialize the module
    ///
    /// # Errors
    ///
    /// Returns an error if initialization fails
    fn init(&mut self) -> KeelResult<()> {
        Ok(())
    }

    /// Shutdown the module
    ///
    /// # Errors
    ///
    /// Returns an error if shutdown fails
    fn shutdown(&mut self) -> KeelResult<()> {
        Ok(())
    }
}

/// Module health as reported to the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModuleStatus {
    /// Module has not been initialized
    Stopped,
    /// Module is initialized and serving requests
    Running,
    /// Module holds state that needs an explicit reconciliation
    Degraded,
}
