//! Session facade
//!
//! [`SessionManager`] is the entry point for the key-exchange daemon. It owns
//! one [`PolicyManager`] and one [`AssociationManager`] over a shared kernel
//! channel and opens a [`Session`] per endpoint pair.
//!
//! A session walks through:
//!
//! ```text
//! UNPROTECTED --install_policies--> POLICIES_INSTALLED --install_child--> PROTECTED
//!      ^                                                                      |
//!      +------------------------------ teardown ------------------------------+
//! ```
//!
//! Every high-level call journals the kernel entries it newly installs and
//! rolls them back if a later step fails. When rollback itself fails the
//! session becomes PARTIAL, and only [`Session::recover`] (an owner-scoped
//! flush) brings it back to UNPROTECTED.
//!
//! Sessions with overlapping rules share kernel policies. Each session holds
//! a lease on its policies (see [`PolicyLeases`]); rollback and teardown
//! only remove the policies no other session holds. Associations are never
//! shared.
//!
//! A session dropped without teardown leaves its entries and leases in
//! place until the next flush.
//!
//! # Example
//!
//! ```
//! use keel_proto::ipsec::{
//!     algorithm::{CipherId, CipherKey, IntegrityId, IntegrityKey},
//!     config::SessionConfig,
//!     memory::MemoryKernel,
//!     rule::{IpsecProtocol, Mode, ProtectRule},
//!     selector::{IpProtocol, TrafficSelector},
//!     session::{NegotiatedChild, SessionManager, SessionState, SpiPair},
//!     spi::SpiAllocator,
//! };
//! use std::sync::Arc;
//!
//! let kernel = Arc::new(MemoryKernel::new());
//! let manager = SessionManager::with_allocator(
//!     kernel.clone(),
//!     SessionConfig::default(),
//!     Arc::new(SpiAllocator::new()),
//! );
//!
//! let local = "192.168.1.1".parse().unwrap();
//! let remote = "192.168.1.2".parse().unwrap();
//! let rule = ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Tcp, 0, 80).unwrap();
//!
//! let mut session = manager.open(local, remote, vec![rule]).unwrap();
//! let child = NegotiatedChild {
//!     protocol: IpsecProtocol::Esp,
//!     mode: Mode::Transport,
//!     spis: SpiPair { inbound: 0x1001, outbound: 0x2001 },
//!     cipher: Some(CipherKey::new(CipherId::AesGcm128, vec![7; 20])),
//!     integrity: None,
//!     local_selector: TrafficSelector::host(local, IpProtocol::Tcp, 0).unwrap(),
//!     remote_selector: TrafficSelector::host(remote, IpProtocol::Tcp, 80).unwrap(),
//! };
//!
//! session.protect(&[child]).unwrap();
//! assert_eq!(session.state(), SessionState::Protected);
//! assert_eq!((kernel.policy_count(), kernel.sa_count()), (2, 2));
//!
//! session.teardown().unwrap();
//! assert_eq!((kernel.policy_count(), kernel.sa_count()), (0, 0));
//! ```

use super::{
    algorithm::{CipherKey, IntegrityKey},
    config::SessionConfig,
    error::{Error, PolicyError, Result, SaError, ValidationError},
    journal::{Journal, Undo},
    kernel::{DeadlineChannel, KernelChannel},
    lease::{Lease, PolicyLeases},
    logging,
    metrics::IpsecMetrics,
    policy::{Direction, Policy, PolicyManager},
    rule::{IpsecProtocol, Mode, ProtectRule},
    sa::AssociationManager,
    selector::{Selector, TrafficSelector},
    spi::SpiAllocator,
};
use keel_platform::{KeelResult, ModuleStatus, SecurityModule};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Session protection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing installed
    Unprotected,
    /// Policies installed, no associations yet (traffic is dropped)
    PoliciesInstalled,
    /// Policies and at least one association pair installed
    Protected,
    /// Rollback or teardown left entries behind; needs [`Session::recover`]
    Partial,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unprotected => write!(f, "UNPROTECTED"),
            SessionState::PoliciesInstalled => write!(f, "POLICIES_INSTALLED"),
            SessionState::Protected => write!(f, "PROTECTED"),
            SessionState::Partial => write!(f, "PARTIAL"),
        }
    }
}

/// SPIs of one negotiated child, each chosen by its receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPair {
    /// SPI of the association towards the local host
    pub inbound: u32,
    /// SPI of the association towards the peer
    pub outbound: u32,
}

/// Result of one child negotiation, as handed over by the key-exchange daemon
#[derive(Debug, Clone)]
pub struct NegotiatedChild {
    /// AH or ESP
    pub protocol: IpsecProtocol,
    /// Transport or tunnel
    pub mode: Mode,
    /// Association SPIs
    pub spis: SpiPair,
    /// Encryption key (ESP)
    pub cipher: Option<CipherKey>,
    /// Integrity key
    pub integrity: Option<IntegrityKey>,
    /// Local side of the negotiated traffic
    pub local_selector: TrafficSelector,
    /// Remote side of the negotiated traffic
    pub remote_selector: TrafficSelector,
}

type SaKey = (u32, IpsecProtocol, IpAddr);

struct Managers {
    policies: PolicyManager,
    sas: AssociationManager,
    leases: PolicyLeases,
    metrics: IpsecMetrics,
    running: AtomicBool,
    /// Live sessions in PARTIAL
    partial: AtomicUsize,
    /// A PARTIAL session was dropped; cleared by the next flush
    orphaned: AtomicBool,
}

impl Managers {
    /// Give up `lease` and unwind `journal`
    ///
    /// Journaled policies another session holds stay installed. Returns
    /// whether every step succeeded.
    fn rollback(&self, journal: Journal, lease: Option<(Lease, &[Policy])>) -> bool {
        let mut table = self.leases.lock();
        if let Some((lease, policies)) = lease {
            table.release(lease, policies);
        }
        if journal.is_empty() {
            return true;
        }

        self.metrics.record_rollback();
        let failures = journal.unwind(|undo| match undo {
            Undo::Policy {
                direction,
                selector,
            } if table.is_held(*direction, selector) => Ok(()),
            Undo::Policy {
                direction,
                selector,
            } => self.policies.remove(*direction, selector),
            Undo::Sa { spi, protocol, dst } => self.sas.remove(*spi, *protocol, *dst),
        });

        for _ in 0..failures {
            self.metrics.record_rollback_failure();
        }

        failures == 0
    }

    fn flush(&self) -> Result<()> {
        let mut table = self.leases.lock();
        let sas = self.sas.flush_sas();
        let policies = self.policies.flush_policies();
        if policies.is_ok() {
            table.reset();
        }
        sas?;
        policies?;

        self.orphaned.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        let mut table = self.leases.lock();
        let sas = self.sas.purge_sas();
        let policies = self.policies.purge_policies();
        if policies.is_ok() {
            table.reset();
        }
        sas?;
        policies?;

        self.orphaned.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn degraded(&self) -> bool {
        self.partial.load(Ordering::Relaxed) > 0 || self.orphaned.load(Ordering::Relaxed)
    }
}

/// Session Facade
pub struct SessionManager {
    config: SessionConfig,
    managers: Arc<Managers>,
}

impl SessionManager {
    /// Module id reported through [`SecurityModule`]
    pub const MODULE_ID: &'static str = "keel-ipsec";

    /// Create a manager using the process-wide SPI allocator
    ///
    /// When `config.kernel_timeout` is set, every kernel request is bounded
    /// by it.
    pub fn new(kernel: Arc<dyn KernelChannel>, config: SessionConfig) -> Self {
        Self::with_allocator(kernel, config, SpiAllocator::shared())
    }

    /// Create a manager with a dedicated SPI allocator
    pub fn with_allocator(
        kernel: Arc<dyn KernelChannel>,
        config: SessionConfig,
        spis: Arc<SpiAllocator>,
    ) -> Self {
        let kernel: Arc<dyn KernelChannel> = match config.kernel_timeout {
            Some(timeout) => Arc::new(DeadlineChannel::new(kernel, timeout)),
            None => kernel,
        };

        let metrics = IpsecMetrics::new();
        let policies = PolicyManager::new(Arc::clone(&kernel), &config).with_metrics(metrics.clone());
        let sas = AssociationManager::new(kernel, &config)
            .with_allocator(spis)
            .with_metrics(metrics.clone());

        SessionManager {
            config,
            managers: Arc::new(Managers {
                policies,
                sas,
                leases: PolicyLeases::new(),
                metrics,
                running: AtomicBool::new(false),
                partial: AtomicUsize::new(0),
                orphaned: AtomicBool::new(false),
            }),
        }
    }

    /// Configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Metrics shared by both managers and every session
    pub fn metrics(&self) -> &IpsecMetrics {
        &self.managers.metrics
    }

    /// Policy Manager
    pub fn policies(&self) -> &PolicyManager {
        &self.managers.policies
    }

    /// Association Manager
    pub fn associations(&self) -> &AssociationManager {
        &self.managers.sas
    }

    /// Lifecycle status
    ///
    /// `Degraded` while any session is PARTIAL. A PARTIAL session dropped
    /// without recovery keeps the manager degraded until the next
    /// successful flush or purge.
    pub fn status(&self) -> ModuleStatus {
        if !self.managers.running.load(Ordering::Relaxed) {
            ModuleStatus::Stopped
        } else if self.managers.degraded() {
            ModuleStatus::Degraded
        } else {
            ModuleStatus::Running
        }
    }

    /// Open a session for an endpoint pair
    ///
    /// Rules are validated and their policies derived here; nothing is
    /// installed yet.
    pub fn open(&self, local: IpAddr, remote: IpAddr, rules: Vec<ProtectRule>) -> Result<Session> {
        if rules.is_empty() {
            return Err(ValidationError::new("a session needs at least one protect rule").into());
        }

        let policies = self.managers.policies.derive_policies(local, remote, &rules)?;

        Ok(Session {
            local,
            remote,
            rules,
            policies,
            lease: None,
            sas: Vec::new(),
            state: SessionState::Unprotected,
            managers: Arc::clone(&self.managers),
        })
    }

    /// Remove every policy and association carrying our owner tag
    ///
    /// Every session's policy lease is void afterwards.
    pub fn flush(&self) -> Result<()> {
        self.managers.flush()
    }

    /// Remove every policy and association in the kernel tables
    pub fn purge(&self) -> Result<()> {
        self.managers.purge()
    }
}

impl SecurityModule for SessionManager {
    fn id(&self) -> &'static str {
        Self::MODULE_ID
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &'static str {
        "IPsec SPD/SAD manager"
    }

    fn init(&mut self) -> KeelResult<()> {
        if self.config.purge_on_init {
            self.purge()?;
        } else {
            self.flush()?;
        }

        self.managers.running.store(true, Ordering::Relaxed);
        logging::log_module_event(Self::MODULE_ID, "init");
        Ok(())
    }

    fn shutdown(&mut self) -> KeelResult<()> {
        self.flush()?;

        self.managers.running.store(false, Ordering::Relaxed);
        logging::log_module_event(Self::MODULE_ID, "shutdown");
        Ok(())
    }
}

/// Protection state of one endpoint pair
pub struct Session {
    local: IpAddr,
    remote: IpAddr,
    rules: Vec<ProtectRule>,
    policies: Vec<Policy>,
    lease: Option<Lease>,
    sas: Vec<SaKey>,
    state: SessionState,
    managers: Arc<Managers>,
}

impl Session {
    /// Local endpoint
    pub fn local(&self) -> IpAddr {
        self.local
    }

    /// Remote endpoint
    pub fn remote(&self) -> IpAddr {
        self.remote
    }

    /// Protect rules of this session
    pub fn rules(&self) -> &[ProtectRule] {
        &self.rules
    }

    /// Policies this session installs
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// Number of associations installed by this session
    pub fn sa_count(&self) -> usize {
        self.sas.len()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Install the session's policies
    ///
    /// UNPROTECTED -> POLICIES_INSTALLED.
    pub fn install_policies(&mut self) -> Result<()> {
        self.expect_state(&[SessionState::Unprotected], "install policies")?;

        self.lease = Some(self.managers.leases.lock().acquire(&self.policies));
        let mut journal = Journal::new();
        match self.managers.policies.install(&self.policies, &mut journal) {
            Ok(()) => {
                self.set_state(SessionState::PoliciesInstalled);
                Ok(())
            }
            Err(e) => {
                self.fail(journal, SessionState::Unprotected);
                Err(e.into())
            }
        }
    }

    /// Install the association pair of one negotiated child
    ///
    /// POLICIES_INSTALLED or PROTECTED -> PROTECTED. The inbound association
    /// (remote -> local) is installed first.
    pub fn install_child(&mut self, child: &NegotiatedChild) -> Result<()> {
        self.expect_state(
            &[SessionState::PoliciesInstalled, SessionState::Protected],
            "install child",
        )?;
        self.check_child(child)?;

        let mut journal = Journal::new();
        let mut installed = Vec::with_capacity(2);
        match self.install_pair(child, &mut journal, &mut installed) {
            Ok(()) => {
                self.sas.extend(installed);
                self.set_state(SessionState::Protected);
                self.managers.metrics.record_session_protected();
                Ok(())
            }
            Err(e) => {
                let state = self.state;
                self.fail(journal, state);
                Err(e)
            }
        }
    }

    /// Install policies and every child in one step
    ///
    /// UNPROTECTED -> PROTECTED. Any failure rolls back everything this call
    /// installed.
    pub fn protect(&mut self, children: &[NegotiatedChild]) -> Result<()> {
        self.expect_state(&[SessionState::Unprotected], "protect")?;
        if children.is_empty() {
            return Err(ValidationError::new("protect needs at least one negotiated child").into());
        }
        for child in children {
            self.check_child(child)?;
        }

        self.lease = Some(self.managers.leases.lock().acquire(&self.policies));
        let mut journal = Journal::new();
        if let Err(e) = self.managers.policies.install(&self.policies, &mut journal) {
            self.fail(journal, SessionState::Unprotected);
            return Err(e.into());
        }

        let mut installed = Vec::with_capacity(children.len() * 2);
        for child in children {
            if let Err(e) = self.install_pair(child, &mut journal, &mut installed) {
                self.fail(journal, SessionState::Unprotected);
                return Err(e);
            }
        }

        self.sas = installed;
        self.set_state(SessionState::Protected);
        self.managers.metrics.record_session_protected();
        Ok(())
    }

    /// Remove the session's associations, then its policies
    ///
    /// -> UNPROTECTED. Policies another session still holds are kept.
    /// Entries already gone count as removed. If any removal fails the
    /// session becomes PARTIAL.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::Unprotected {
            return Ok(());
        }
        self.expect_state(
            &[SessionState::PoliciesInstalled, SessionState::Protected],
            "tear down",
        )?;

        let mut first_error: Option<Error> = None;

        for (spi, protocol, dst) in &self.sas {
            if let Err(e) = self.managers.sas.delete_sa(*spi, *protocol, *dst) {
                first_error.get_or_insert(e.into());
            }
        }

        {
            let mut table = self.managers.leases.lock();
            let unheld = match self.lease.take() {
                Some(lease) => table.release(lease, &self.policies),
                None => self.policies.iter().collect(),
            };
            for policy in unheld {
                if let Err(e) = self.managers.policies.remove(policy.direction, &policy.selector) {
                    first_error.get_or_insert(PolicyError::Kernel(e).into());
                }
            }
        }

        if let Some(e) = first_error {
            self.set_state(SessionState::Partial);
            return Err(e);
        }

        self.sas.clear();
        self.set_state(SessionState::Unprotected);
        self.managers.metrics.record_session_torn_down();
        Ok(())
    }

    /// Resolve a PARTIAL session with an owner-scoped flush
    ///
    /// PARTIAL -> UNPROTECTED. The flush removes every entry carrying this
    /// process's owner tag, including those of other sessions.
    pub fn recover(&mut self) -> Result<()> {
        self.expect_state(&[SessionState::Partial], "recover")?;

        self.managers.flush()?;
        self.lease = None;
        self.sas.clear();
        self.set_state(SessionState::Unprotected);
        Ok(())
    }

    fn install_pair(
        &self,
        child: &NegotiatedChild,
        journal: &mut Journal,
        installed: &mut Vec<SaKey>,
    ) -> Result<()> {
        let legs = [
            (
                self.remote,
                self.local,
                &child.remote_selector,
                &child.local_selector,
                child.spis.inbound,
            ),
            (
                self.local,
                self.remote,
                &child.local_selector,
                &child.remote_selector,
                child.spis.outbound,
            ),
        ];

        for (src, dst, src_selector, dst_selector, spi) in legs {
            let undo = Undo::Sa {
                spi,
                protocol: child.protocol,
                dst,
            };
            let created = self.managers.sas.create_sa(
                src,
                dst,
                src_selector,
                dst_selector,
                child.protocol,
                spi,
                child.cipher.clone(),
                child.integrity.clone(),
                child.mode,
            );

            match created {
                Ok(()) => {
                    journal.record(undo);
                    installed.push((spi, child.protocol, dst));
                }
                // May still land in the kernel
                Err(SaError::Kernel(e)) if e.is_timeout() => {
                    journal.record(undo);
                    return Err(SaError::Kernel(e).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn check_child(&self, child: &NegotiatedChild) -> Result<()> {
        if child.spis.inbound == child.spis.outbound {
            return Err(ValidationError::new(format!(
                "inbound and outbound SPI are both 0x{:08x}",
                child.spis.inbound
            ))
            .into());
        }

        let outbound = Selector::from_traffic_selectors(&child.local_selector, &child.remote_selector)?;
        let covered = self.policies.iter().any(|p| {
            p.direction == Direction::Out
                && p.ipsec_protocol == child.protocol
                && p.mode == child.mode
                && p.selector.contains(&outbound)
        });

        if !covered {
            return Err(ValidationError::new(format!(
                "{} {} child {} is not covered by any protect rule",
                child.protocol, child.mode, outbound
            ))
            .into());
        }

        Ok(())
    }

    fn expect_state(&self, allowed: &[SessionState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }

        Err(Error::InvalidState(format!(
            "cannot {} while session is {}",
            operation, self.state
        )))
    }

    /// Roll back `journal`, landing in `fallback` or PARTIAL
    ///
    /// Falling back to UNPROTECTED gives up the policy lease.
    fn fail(&mut self, journal: Journal, fallback: SessionState) {
        let lease = match fallback {
            SessionState::Unprotected => self.lease.take(),
            _ => None,
        };
        let clean = self
            .managers
            .rollback(journal, lease.map(|lease| (lease, self.policies.as_slice())));

        if clean {
            self.set_state(fallback);
        } else {
            self.set_state(SessionState::Partial);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }

        if state == SessionState::Partial {
            self.managers.partial.fetch_add(1, Ordering::Relaxed);
        } else if self.state == SessionState::Partial {
            self.managers.partial.fetch_sub(1, Ordering::Relaxed);
        }

        logging::log_session_transition(self.local, self.remote, self.state, state);
        self.state = state;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Partial {
            self.managers.partial.fetch_sub(1, Ordering::Relaxed);
            self.managers.orphaned.store(true, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("policies", &self.policies.len())
            .field("sas", &self.sas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::algorithm::{CipherId, IntegrityId};
    use crate::ipsec::kernel::KernelError;
    use crate::ipsec::memory::{KernelOp, MemoryKernel};
    use crate::ipsec::selector::IpProtocol;
    use keel_platform::KeelError;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<MemoryKernel>, SessionManager) {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = SessionManager::with_allocator(
            kernel.clone(),
            SessionConfig::default(),
            Arc::new(SpiAllocator::new()),
        );
        (kernel, manager)
    }

    fn http_rule() -> ProtectRule {
        ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Tcp, 0, 80).unwrap()
    }

    fn http_child(inbound: u32, outbound: u32) -> NegotiatedChild {
        NegotiatedChild {
            protocol: IpsecProtocol::Esp,
            mode: Mode::Transport,
            spis: SpiPair { inbound, outbound },
            cipher: Some(CipherKey::new(CipherId::AesCbc256, vec![1; 32])),
            integrity: Some(IntegrityKey::new(IntegrityId::HmacSha256_128, vec![2; 32])),
            local_selector: TrafficSelector::host(addr("192.168.1.1"), IpProtocol::Tcp, 0).unwrap(),
            remote_selector: TrafficSelector::host(addr("192.168.1.2"), IpProtocol::Tcp, 80).unwrap(),
        }
    }

    fn open(manager: &SessionManager) -> Session {
        manager
            .open(addr("192.168.1.1"), addr("192.168.1.2"), vec![http_rule()])
            .unwrap()
    }

    #[test]
    fn test_state_machine() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);
        assert_eq!(session.state(), SessionState::Unprotected);

        session.install_policies().unwrap();
        assert_eq!(session.state(), SessionState::PoliciesInstalled);
        assert_eq!(kernel.policy_count(), 2);

        session.install_child(&http_child(0x1001, 0x2001)).unwrap();
        assert_eq!(session.state(), SessionState::Protected);
        assert_eq!(session.sa_count(), 2);

        session.install_child(&http_child(0x1002, 0x2002)).unwrap();
        assert_eq!(kernel.sa_count(), 4);

        session.teardown().unwrap();
        assert_eq!(session.state(), SessionState::Unprotected);
        assert_eq!(kernel.policy_count(), 0);
        assert_eq!(kernel.sa_count(), 0);

        session.teardown().unwrap();
    }

    #[test]
    fn test_inbound_installed_first() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);

        session.protect(&[http_child(0x1001, 0x2001)]).unwrap();

        let sas = kernel.sas();
        assert_eq!(sas[0].spi, 0x1001);
        assert_eq!(sas[0].src, addr("192.168.1.2"));
        assert_eq!(sas[0].dst, addr("192.168.1.1"));
        assert_eq!(sas[0].selector.src_port(), Some(80));
        assert_eq!(sas[1].spi, 0x2001);
        assert_eq!(sas[1].dst, addr("192.168.1.2"));
    }

    #[test]
    fn test_wrong_state_rejected() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);

        let err = session.install_child(&http_child(0x1001, 0x2001)).unwrap_err();
        assert_eq!(err.kind(), crate::ipsec::error::ErrorKind::State);

        session.install_policies().unwrap();
        assert!(session.install_policies().is_err());
        assert!(session.recover().is_err());
        assert_eq!(kernel.sa_count(), 0);
    }

    #[test]
    fn test_child_validation() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);
        session.install_policies().unwrap();
        let calls = kernel.total_calls();

        assert!(session.install_child(&http_child(0x1001, 0x1001)).is_err());

        let mut uncovered = http_child(0x1001, 0x2001);
        uncovered.remote_selector = TrafficSelector::host(addr("192.168.1.2"), IpProtocol::Tcp, 443).unwrap();
        assert!(session.install_child(&uncovered).is_err());

        let mut wrong_mode = http_child(0x1001, 0x2001);
        wrong_mode.mode = Mode::Tunnel;
        assert!(session.install_child(&wrong_mode).is_err());

        assert_eq!(kernel.total_calls(), calls);
        assert_eq!(session.state(), SessionState::PoliciesInstalled);
    }

    #[test]
    fn test_protect_rolls_back_on_kernel_error() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);

        kernel.pass_next(KernelOp::AddSa);
        kernel.fail_next(KernelOp::AddSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));

        let err = session.protect(&[http_child(0x1001, 0x2001)]).unwrap_err();
        assert_eq!(err.kernel_error().map(|e| e.code), Some(KernelError::EINVAL));
        assert_eq!(session.state(), SessionState::Unprotected);
        assert_eq!(kernel.policy_count(), 0);
        assert_eq!(kernel.sa_count(), 0);
        assert_eq!(manager.metrics().snapshot().rollbacks, 1);

        session.protect(&[http_child(0x1001, 0x2001)]).unwrap();
    }

    #[test]
    fn test_failed_rollback_leaves_partial() {
        let (kernel, manager) = setup();
        let mut module = manager;
        module.init().unwrap();
        let mut session = open(&module);

        kernel.pass_next(KernelOp::AddSa);
        kernel.fail_next(KernelOp::AddSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));
        kernel.fail_next(KernelOp::DelSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));

        assert!(session.protect(&[http_child(0x1001, 0x2001)]).is_err());
        assert_eq!(session.state(), SessionState::Partial);
        assert_eq!(kernel.sa_count(), 1);
        assert_eq!(module.status(), ModuleStatus::Degraded);

        assert!(session.protect(&[http_child(0x1003, 0x2003)]).is_err());
        assert!(session.teardown().is_err());

        session.recover().unwrap();
        assert_eq!(session.state(), SessionState::Unprotected);
        assert_eq!(kernel.sa_count(), 0);
        assert_eq!(kernel.policy_count(), 0);
        assert_eq!(module.status(), ModuleStatus::Running);
    }

    #[test]
    fn test_teardown_failure_leaves_partial() {
        let (kernel, manager) = setup();
        let mut session = open(&manager);
        session.protect(&[http_child(0x1001, 0x2001)]).unwrap();

        kernel.fail_next(KernelOp::DelPolicy, KernelError::new(KernelError::EINVAL, "Invalid argument"));
        assert!(session.teardown().is_err());
        assert_eq!(session.state(), SessionState::Partial);
        assert_eq!(kernel.sa_count(), 0);
        assert_eq!(kernel.policy_count(), 1);

        session.recover().unwrap();
        assert_eq!(kernel.policy_count(), 0);
    }

    #[test]
    fn test_shared_policies_outlive_first_teardown() {
        let (kernel, manager) = setup();
        let mut first = open(&manager);
        let mut second = open(&manager);

        first.protect(&[http_child(0x1001, 0x2001)]).unwrap();
        second.protect(&[http_child(0x1002, 0x2002)]).unwrap();
        assert_eq!(kernel.policy_count(), 2);

        first.teardown().unwrap();
        assert_eq!(second.state(), SessionState::Protected);
        assert_eq!(kernel.policy_count(), 2);
        assert_eq!(kernel.sa_count(), 2);

        second.teardown().unwrap();
        assert_eq!(kernel.policy_count(), 0);
        assert_eq!(kernel.sa_count(), 0);
    }

    #[test]
    fn test_rollback_keeps_policies_held_elsewhere() {
        let (kernel, manager) = setup();
        let mut first = open(&manager);
        let mut second = open(&manager);
        first.install_policies().unwrap();

        kernel.fail_next(KernelOp::AddSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));
        assert!(second.protect(&[http_child(0x1001, 0x2001)]).is_err());
        assert_eq!(second.state(), SessionState::Unprotected);
        assert_eq!(kernel.policy_count(), 2);

        first.install_child(&http_child(0x1001, 0x2001)).unwrap();
        first.teardown().unwrap();
        assert_eq!(kernel.policy_count(), 0);
    }

    #[test]
    fn test_degraded_until_every_session_recovers() {
        let (kernel, mut manager) = setup();
        manager.init().unwrap();
        let mut first = open(&manager);
        let mut second = open(&manager);
        first.protect(&[http_child(0x1001, 0x2001)]).unwrap();
        second.protect(&[http_child(0x1002, 0x2002)]).unwrap();

        for session in [&mut first, &mut second] {
            kernel.fail_next(KernelOp::DelSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));
            assert!(session.teardown().is_err());
            assert_eq!(session.state(), SessionState::Partial);
        }
        assert_eq!(manager.status(), ModuleStatus::Degraded);

        first.recover().unwrap();
        assert_eq!(kernel.sa_count(), 0);
        assert_eq!(manager.status(), ModuleStatus::Degraded);

        second.recover().unwrap();
        assert_eq!(manager.status(), ModuleStatus::Running);
    }

    #[test]
    fn test_dropped_partial_session_degrades_until_flush() {
        let (kernel, mut manager) = setup();
        manager.init().unwrap();
        let mut session = open(&manager);
        session.protect(&[http_child(0x1001, 0x2001)]).unwrap();

        kernel.fail_next(KernelOp::DelSa, KernelError::new(KernelError::EINVAL, "Invalid argument"));
        assert!(session.teardown().is_err());
        drop(session);
        assert_eq!(manager.status(), ModuleStatus::Degraded);

        manager.flush().unwrap();
        assert_eq!(manager.status(), ModuleStatus::Running);
        assert_eq!(kernel.sa_count(), 0);
    }

    #[test]
    fn test_open_validates_rules() {
        let (kernel, manager) = setup();

        assert!(manager.open(addr("192.168.1.1"), addr("192.168.1.2"), vec![]).is_err());
        assert!(manager
            .open(addr("192.168.1.1"), addr("2001:db8::2"), vec![http_rule()])
            .is_err());
        assert_eq!(kernel.total_calls(), 0);
    }

    #[test]
    fn test_module_lifecycle() {
        let (kernel, mut manager) = setup();
        assert_eq!(manager.status(), ModuleStatus::Stopped);
        assert_eq!(manager.id(), "keel-ipsec");

        let stale = SessionManager::with_allocator(
            kernel.clone(),
            SessionConfig::builder().with_owner(0x0bad).build().unwrap(),
            Arc::new(SpiAllocator::new()),
        );
        stale
            .open(addr("10.0.0.1"), addr("10.0.0.2"), vec![http_rule()])
            .unwrap()
            .install_policies()
            .unwrap();

        let mut session = open(&manager);
        session.install_policies().unwrap();
        assert_eq!(kernel.policy_count(), 4);

        manager.init().unwrap();
        assert_eq!(manager.status(), ModuleStatus::Running);
        assert_eq!(kernel.policy_count(), 2);

        manager.shutdown().unwrap();
        assert_eq!(manager.status(), ModuleStatus::Stopped);
        assert_eq!(kernel.policy_count(), 2);
    }

    #[test]
    fn test_purge_on_init() {
        let kernel = Arc::new(MemoryKernel::new());
        let other = SessionManager::with_allocator(
            kernel.clone(),
            SessionConfig::builder().with_owner(0x0bad).build().unwrap(),
            Arc::new(SpiAllocator::new()),
        );
        other
            .open(addr("10.0.0.1"), addr("10.0.0.2"), vec![http_rule()])
            .unwrap()
            .install_policies()
            .unwrap();

        let mut manager = SessionManager::with_allocator(
            kernel.clone(),
            SessionConfig::builder().with_purge_on_init(true).build().unwrap(),
            Arc::new(SpiAllocator::new()),
        );
        manager.init().unwrap();
        assert_eq!(kernel.policy_count(), 0);
    }

    #[test]
    fn test_init_error_converts_to_platform_error() {
        let (kernel, mut manager) = setup();
        kernel.fail_next(KernelOp::DumpSas, KernelError::new(KernelError::EINVAL, "Invalid argument"));

        match manager.init().unwrap_err() {
            KeelError::Kernel { code, .. } => assert_eq!(code, KernelError::EINVAL),
            other => panic!("Expected kernel error, got {:?}", other),
        }
        assert_eq!(manager.status(), ModuleStatus::Stopped);
    }
}
