//! Structured logging for SPD/SAD operations
//!
//! Provides structured, contextual logging using the `tracing` framework.
//! Every kernel-visible change goes through one of these helpers so that
//! field names stay stable across the crate. SPIs are logged as 8 hex digits.
//!
//! # Log Levels
//!
//! - **DEBUG**: Idempotent no-ops, ignored algorithm fields, SPI allocation
//! - **INFO**: Installs, removals, flushes, session state transitions
//! - **WARN**: Rollback steps that fail, duplicate SPIs
//! - **ERROR**: Kernel rejections
//!
//! # Example
//!
//! ```no_run
//! use keel_proto::ipsec::{logging, rule::IpsecProtocol};
//!
//! // Initialize tracing subscriber (in tests or applications)
//! tracing_subscriber::fmt()
//!     .with_env_filter("keel_proto::ipsec=debug")
//!     .init();
//!
//! logging::log_sa_deleted(0x3132_3334, IpsecProtocol::Esp, "192.168.1.2".parse().unwrap());
//! ```

use super::{
    journal::Undo,
    kernel::KernelError,
    policy::{Direction, Policy},
    rule::IpsecProtocol,
    sa::SecurityAssociation,
    selector::Selector,
    session::SessionState,
};
use std::net::IpAddr;
use tracing::{debug, error, info, warn};

fn spi_hex(spi: u32) -> String {
    hex::encode(spi.to_be_bytes())
}

/// Log policy installation
pub fn log_policy_installed(policy: &Policy) {
    info!(
        direction = %policy.direction,
        selector = %policy.selector,
        protocol = %policy.ipsec_protocol,
        mode = %policy.mode,
        priority = policy.priority,
        "Policy installed"
    );
}

/// Log a policy the kernel already held
pub fn log_policy_exists(policy: &Policy) {
    debug!(
        direction = %policy.direction,
        selector = %policy.selector,
        "Policy already installed"
    );
}

/// Log policy removal
pub fn log_policy_removed(direction: Direction, selector: &Selector) {
    info!(direction = %direction, selector = %selector, "Policy removed");
}

/// Log removal of a policy that was already gone
pub fn log_policy_absent(direction: Direction, selector: &Selector) {
    debug!(direction = %direction, selector = %selector, "Policy already absent");
}

/// Log association installation
///
/// Key material is never logged.
pub fn log_sa_installed(sa: &SecurityAssociation) {
    info!(
        spi = %spi_hex(sa.spi),
        protocol = %sa.protocol,
        mode = %sa.mode,
        src = %sa.src,
        dst = %sa.dst,
        cipher = sa.cipher.as_ref().map(|c| c.id().kernel_name()),
        integrity = sa.integrity.as_ref().map(|i| i.id().kernel_name()),
        "SA installed"
    );
}

/// Log association removal
pub fn log_sa_deleted(spi: u32, protocol: IpsecProtocol, dst: IpAddr) {
    info!(spi = %spi_hex(spi), protocol = %protocol, dst = %dst, "SA deleted");
}

/// Log removal of an association that was already gone
pub fn log_sa_absent(spi: u32, protocol: IpsecProtocol, dst: IpAddr) {
    debug!(spi = %spi_hex(spi), protocol = %protocol, dst = %dst, "SA already absent");
}

/// Log a rejected duplicate SPI
pub fn log_duplicate_spi(spi: u32, protocol: IpsecProtocol, dst: IpAddr) {
    warn!(
        spi = %spi_hex(spi),
        protocol = %protocol,
        dst = %dst,
        "Duplicate SPI rejected"
    );
}

/// Log an algorithm field the protocol does not use
///
/// # Arguments
///
/// * `spi` - SPI of the association being built
/// * `protocol` - IPsec protocol of the association
/// * `algorithm` - Kernel name of the ignored algorithm
pub fn log_algorithm_ignored(spi: u32, protocol: IpsecProtocol, algorithm: &str) {
    debug!(
        spi = %spi_hex(spi),
        protocol = %protocol,
        algorithm = algorithm,
        "Algorithm ignored"
    );
}

/// Log reuse of a reserved SPI whose association left the kernel
pub fn log_spi_reclaimed(spi: u32, protocol: IpsecProtocol, dst: IpAddr) {
    info!(
        spi = %spi_hex(spi),
        protocol = %protocol,
        dst = %dst,
        "Stale SPI reservation reclaimed"
    );
}

/// Log a policy kept because another session still holds it
pub fn log_policy_shared(direction: Direction, selector: &Selector, holders: usize) {
    debug!(
        direction = %direction,
        selector = %selector,
        holders = holders,
        "Policy still held by other sessions"
    );
}

/// Log SPI allocation
pub fn log_spi_allocated(spi: u32, protocol: IpsecProtocol, dst: IpAddr) {
    debug!(spi = %spi_hex(spi), protocol = %protocol, dst = %dst, "SPI allocated");
}

/// Log a kernel rejection
///
/// # Arguments
///
/// * `operation` - Kernel request that failed (e.g., "add_sa")
/// * `err` - Kernel error
pub fn log_kernel_rejected(operation: &str, err: &KernelError) {
    error!(
        operation = operation,
        code = err.code,
        reason = %err.reason,
        "Kernel rejected request"
    );
}

/// Log rollback start
pub fn log_rollback_started(steps: usize) {
    info!(steps = steps, "Rolling back installed entries");
}

/// Log a rollback step that failed
pub fn log_rollback_step_failed(step: &Undo, err: &KernelError) {
    warn!(
        step = %step,
        code = err.code,
        reason = %err.reason,
        "Rollback step failed"
    );
}

/// Log owner-scoped flush
///
/// # Arguments
///
/// * `table` - "policies" or "associations"
/// * `removed` - Number of entries removed
/// * `owner` - Owner tag the flush was scoped to
pub fn log_flush(table: &str, removed: usize, owner: u32) {
    info!(
        table = table,
        removed = removed,
        owner = %format!("{:08x}", owner),
        "Owned entries flushed"
    );
}

/// Log whole-table purge
pub fn log_purge(table: &str) {
    info!(table = table, "Kernel table purged");
}

/// Log session state transition
pub fn log_session_transition(local: IpAddr, remote: IpAddr, from: SessionState, to: SessionState) {
    info!(
        local = %local,
        remote = %remote,
        state_from = %from,
        state_to = %to,
        "Session state transition"
    );
}

/// Log module lifecycle event
///
/// # Arguments
///
/// * `module` - Module id
/// * `event` - "init" or "shutdown"
pub fn log_module_event(module: &str, event: &str) {
    info!(module = module, event = event, "Security module lifecycle");
}
