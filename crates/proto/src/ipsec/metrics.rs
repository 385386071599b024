//! Metrics for SPD/SAD management
//!
//! Counters for kernel-visible changes and failure paths. All counters use
//! atomic operations and clones share the same counters, so one registry can
//! be handed to every manager of a [`SessionManager`].
//!
//! [`SessionManager`]: super::session::SessionManager
//!
//! # Example
//!
//! ```
//! use keel_proto::ipsec::metrics::IpsecMetrics;
//!
//! let metrics = IpsecMetrics::new();
//!
//! metrics.record_policy_installed();
//! metrics.record_sa_installed();
//!
//! let snapshot = metrics.snapshot();
//! println!("Policies installed: {}", snapshot.policies_installed);
//! println!("SAs active: {}", snapshot.sas_active());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// IPsec metrics for monitoring
#[derive(Debug, Clone)]
pub struct IpsecMetrics {
    /// Policies installed
    pub policies_installed: Arc<AtomicU64>,

    /// Policies removed
    pub policies_removed: Arc<AtomicU64>,

    /// Associations installed
    pub sas_installed: Arc<AtomicU64>,

    /// Associations deleted
    pub sas_deleted: Arc<AtomicU64>,

    /// Duplicate SPIs rejected
    pub duplicate_spis: Arc<AtomicU64>,

    /// Kernel rejections
    pub kernel_errors: Arc<AtomicU64>,

    /// Rollbacks started
    pub rollbacks: Arc<AtomicU64>,

    /// Rollback steps that failed
    pub rollback_failures: Arc<AtomicU64>,

    /// Sessions that reached PROTECTED
    pub sessions_protected: Arc<AtomicU64>,

    /// Sessions torn down
    pub sessions_torn_down: Arc<AtomicU64>,
}

impl IpsecMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self {
            policies_installed: Arc::new(AtomicU64::new(0)),
            policies_removed: Arc::new(AtomicU64::new(0)),
            sas_installed: Arc::new(AtomicU64::new(0)),
            sas_deleted: Arc::new(AtomicU64::new(0)),
            duplicate_spis: Arc::new(AtomicU64::new(0)),
            kernel_errors: Arc::new(AtomicU64::new(0)),
            rollbacks: Arc::new(AtomicU64::new(0)),
            rollback_failures: Arc::new(AtomicU64::new(0)),
            sessions_protected: Arc::new(AtomicU64::new(0)),
            sessions_torn_down: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record policy installed
    pub fn record_policy_installed(&self) {
        self.policies_installed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record policy removed
    pub fn record_policy_removed(&self) {
        self.policies_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA installed
    pub fn record_sa_installed(&self) {
        self.sas_installed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record SA deleted
    pub fn record_sa_deleted(&self) {
        self.sas_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record duplicate SPI rejected
    pub fn record_duplicate_spi(&self) {
        self.duplicate_spis.fetch_add(1, Ordering::Relaxed);
    }

    /// Record kernel rejection
    pub fn record_kernel_error(&self) {
        self.kernel_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rollback started
    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record rollback step failed
    pub fn record_rollback_failure(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record session protected
    pub fn record_session_protected(&self) {
        self.sessions_protected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record session torn down
    pub fn record_session_torn_down(&self) {
        self.sessions_torn_down.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Values may be slightly inconsistent across counters due to concurrent updates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            policies_installed: self.policies_installed.load(Ordering::Relaxed),
            policies_removed: self.policies_removed.load(Ordering::Relaxed),
            sas_installed: self.sas_installed.load(Ordering::Relaxed),
            sas_deleted: self.sas_deleted.load(Ordering::Relaxed),
            duplicate_spis: self.duplicate_spis.load(Ordering::Relaxed),
            kernel_errors: self.kernel_errors.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            sessions_protected: self.sessions_protected.load(Ordering::Relaxed),
            sessions_torn_down: self.sessions_torn_down.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics to zero
    pub fn reset(&self) {
        self.policies_installed.store(0, Ordering::Relaxed);
        self.policies_removed.store(0, Ordering::Relaxed);
        self.sas_installed.store(0, Ordering::Relaxed);
        self.sas_deleted.store(0, Ordering::Relaxed);
        self.duplicate_spis.store(0, Ordering::Relaxed);
        self.kernel_errors.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.rollback_failures.store(0, Ordering::Relaxed);
        self.sessions_protected.store(0, Ordering::Relaxed);
        self.sessions_torn_down.store(0, Ordering::Relaxed);
    }
}

impl Default for IpsecMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Policies installed
    pub policies_installed: u64,

    /// Policies removed
    pub policies_removed: u64,

    /// Associations installed
    pub sas_installed: u64,

    /// Associations deleted
    pub sas_deleted: u64,

    /// Duplicate SPIs rejected
    pub duplicate_spis: u64,

    /// Kernel rejections
    pub kernel_errors: u64,

    /// Rollbacks started
    pub rollbacks: u64,

    /// Rollback steps that failed
    pub rollback_failures: u64,

    /// Sessions that reached PROTECTED
    pub sessions_protected: u64,

    /// Sessions torn down
    pub sessions_torn_down: u64,
}

impl MetricsSnapshot {
    /// Policies installed and not yet removed by this process
    pub fn policies_active(&self) -> u64 {
        self.policies_installed.saturating_sub(self.policies_removed)
    }

    /// Associations installed and not yet deleted by this process
    pub fn sas_active(&self) -> u64 {
        self.sas_installed.saturating_sub(self.sas_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let snapshot = IpsecMetrics::new().snapshot();

        assert_eq!(snapshot.policies_installed, 0);
        assert_eq!(snapshot.sas_installed, 0);
        assert_eq!(snapshot.rollbacks, 0);
    }

    #[test]
    fn test_active_counts() {
        let metrics = IpsecMetrics::new();

        metrics.record_policy_installed();
        metrics.record_policy_installed();
        metrics.record_policy_removed();
        metrics.record_sa_installed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.policies_active(), 1);
        assert_eq!(snapshot.sas_active(), 1);

        metrics.record_sa_deleted();
        metrics.record_sa_deleted();
        assert_eq!(metrics.snapshot().sas_active(), 0);
    }

    #[test]
    fn test_failure_counters() {
        let metrics = IpsecMetrics::new();

        metrics.record_kernel_error();
        metrics.record_duplicate_spi();
        metrics.record_rollback();
        metrics.record_rollback_failure();
        metrics.record_rollback_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.kernel_errors, 1);
        assert_eq!(snapshot.duplicate_spis, 1);
        assert_eq!(snapshot.rollbacks, 1);
        assert_eq!(snapshot.rollback_failures, 2);
    }

    #[test]
    fn test_metrics_reset() {
        let metrics = IpsecMetrics::new();

        metrics.record_session_protected();
        metrics.record_session_torn_down();
        metrics.reset();

        assert_eq!(metrics.snapshot(), IpsecMetrics::new().snapshot());
    }

    #[test]
    fn test_metrics_clone() {
        let metrics1 = IpsecMetrics::new();
        metrics1.record_sa_installed();

        let metrics2 = metrics1.clone();
        metrics2.record_sa_installed();

        // Clones share the same counters
        assert_eq!(metrics1.snapshot().sas_installed, 2);
        assert_eq!(metrics2.snapshot().sas_installed, 2);
    }
}
