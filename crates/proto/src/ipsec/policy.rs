//! Security Policy Database management
//!
//! [`PolicyManager`] turns [`ProtectRule`]s into directional kernel
//! [`Policy`] entries and installs or removes them through the injected
//! [`KernelChannel`].
//!
//! For every rule:
//!
//! - **OUT** selects local -> remote traffic (local side as source)
//! - **IN** selects remote -> local traffic: the OUT selector swapped,
//!   addresses and ports together
//! - **FWD** mirrors IN and is only installed for tunnel rules when the host
//!   is a gateway
//!
//! Tunnel rules select on their subnets; transport rules select on the
//! endpoint addresses as host prefixes.

use super::{
    config::{HostRole, SessionConfig},
    error::{PolicyError, ValidationError},
    journal::{Journal, Undo},
    kernel::{KernelChannel, KernelError},
    logging,
    metrics::IpsecMetrics,
    rule::{IpsecProtocol, Mode, ProtectRule},
    selector::Selector,
};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Policy direction (xfrm numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Direction {
    /// Inbound traffic addressed to this host
    In = 0,
    /// Outbound traffic originated by this host
    Out = 1,
    /// Traffic routed through this host
    Forward = 2,
}

impl Direction {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Direction::In),
            1 => Some(Direction::Out),
            2 => Some(Direction::Forward),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Forward => write!(f, "fwd"),
        }
    }
}

/// One directional SPD entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Direction the selector is matched in
    pub direction: Direction,

    /// Traffic pattern, oriented for `direction`
    pub selector: Selector,

    /// Template mode
    pub mode: Mode,

    /// Template protocol
    pub ipsec_protocol: IpsecProtocol,

    /// Lower value wins
    pub priority: u32,

    /// Template source (outer source in tunnel mode)
    pub src_endpoint: IpAddr,

    /// Template destination (outer destination in tunnel mode)
    pub dst_endpoint: IpAddr,

    /// Tag of the process that installed the entry
    pub owner: u32,
}

impl Policy {
    /// Kernel key of this entry
    pub fn undo(&self) -> Undo {
        Undo::Policy {
            direction: self.direction,
            selector: self.selector.clone(),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} -> {} prio {}",
            self.direction,
            self.selector,
            self.ipsec_protocol,
            self.mode,
            self.src_endpoint,
            self.dst_endpoint,
            self.priority
        )
    }
}

/// Policy Manager
pub struct PolicyManager {
    kernel: Arc<dyn KernelChannel>,
    role: HostRole,
    base_priority: u32,
    owner: u32,
    metrics: IpsecMetrics,
}

impl PolicyManager {
    /// Create a policy manager over `kernel`
    pub fn new(kernel: Arc<dyn KernelChannel>, config: &SessionConfig) -> Self {
        PolicyManager {
            kernel,
            role: config.role,
            base_priority: config.base_priority,
            owner: config.owner,
            metrics: IpsecMetrics::new(),
        }
    }

    /// Share a metrics registry
    pub fn with_metrics(mut self, metrics: IpsecMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Owner tag stamped on installed policies
    pub fn owner(&self) -> u32 {
        self.owner
    }

    /// Derive the directional policies protecting `rules`
    ///
    /// Every rule is validated against the endpoint pair before any policy is
    /// returned. Rules that derive to an identical (direction, selector) key
    /// collapse into one policy.
    pub fn derive_policies(
        &self,
        local: IpAddr,
        remote: IpAddr,
        rules: &[ProtectRule],
    ) -> Result<Vec<Policy>, PolicyError> {
        let mut policies: Vec<Policy> = Vec::with_capacity(rules.len() * 3);

        for rule in rules {
            rule.check_endpoints(local, remote)?;

            let (local_net, remote_net) = rule.traffic_nets(local, remote);
            if local_net.addr().is_ipv4() != local.is_ipv4() {
                return Err(ValidationError::new(format!(
                    "tunnel subnets {} and {} differ in family from endpoint {}",
                    local_net, remote_net, local
                ))
                .into());
            }

            let outbound = Selector::new(
                local_net,
                remote_net,
                Some(rule.local_port()),
                Some(rule.remote_port()),
                rule.ip_protocol(),
            )?;
            let inbound = outbound.reversed();
            let priority = self.base_priority.saturating_sub(outbound.specificity());

            let mut derived = vec![
                self.policy(Direction::Out, outbound, rule, priority, local, remote),
                self.policy(Direction::In, inbound.clone(), rule, priority, remote, local),
            ];
            if self.role == HostRole::Gateway && rule.mode() == Mode::Tunnel {
                derived.push(self.policy(Direction::Forward, inbound, rule, priority, remote, local));
            }

            for policy in derived {
                let duplicate = policies
                    .iter()
                    .any(|p| p.direction == policy.direction && p.selector == policy.selector);
                if !duplicate {
                    policies.push(policy);
                }
            }
        }

        Ok(policies)
    }

    /// Derive and install the policies protecting `rules`
    ///
    /// A policy the kernel already holds counts as installed. On a kernel
    /// error every policy newly installed by this call is removed again
    /// before the error is returned.
    pub fn create_policies(
        &self,
        local: IpAddr,
        remote: IpAddr,
        rules: &[ProtectRule],
    ) -> Result<(), PolicyError> {
        let policies = self.derive_policies(local, remote, rules)?;

        let mut journal = Journal::new();
        if let Err(e) = self.install(&policies, &mut journal) {
            self.rollback(journal);
            return Err(e);
        }

        Ok(())
    }

    /// Install already-derived policies, journaling each new entry
    ///
    /// A request the kernel did not answer in time is journaled as well,
    /// since the entry may still be installed.
    pub fn install(&self, policies: &[Policy], journal: &mut Journal) -> Result<(), PolicyError> {
        for policy in policies {
            match self.kernel.add_policy(policy) {
                Ok(()) => {
                    logging::log_policy_installed(policy);
                    self.metrics.record_policy_installed();
                    journal.record(policy.undo());
                }
                Err(e) if e.is_already_exists() => {
                    logging::log_policy_exists(policy);
                }
                Err(e) => {
                    logging::log_kernel_rejected("add_policy", &e);
                    self.metrics.record_kernel_error();
                    if e.is_timeout() {
                        journal.record(policy.undo());
                    }
                    return Err(PolicyError::Kernel(e));
                }
            }
        }

        Ok(())
    }

    /// Remove the policies `create_policies` would install for `rules`
    ///
    /// Missing policies are skipped.
    pub fn delete_policies(
        &self,
        local: IpAddr,
        remote: IpAddr,
        rules: &[ProtectRule],
    ) -> Result<(), PolicyError> {
        let policies = self.derive_policies(local, remote, rules)?;
        self.remove_all(&policies)
    }

    /// Remove each policy, continuing past failures
    ///
    /// Returns the first failure.
    pub fn remove_all(&self, policies: &[Policy]) -> Result<(), PolicyError> {
        let mut first_error = None;

        for policy in policies {
            if let Err(e) = self.remove(policy.direction, &policy.selector) {
                first_error.get_or_insert(PolicyError::Kernel(e));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove one policy; a missing policy counts as removed
    pub fn remove(&self, direction: Direction, selector: &Selector) -> Result<(), KernelError> {
        match self.kernel.del_policy(direction, selector) {
            Ok(()) => {
                logging::log_policy_removed(direction, selector);
                self.metrics.record_policy_removed();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                logging::log_policy_absent(direction, selector);
                Ok(())
            }
            Err(e) => {
                logging::log_kernel_rejected("del_policy", &e);
                self.metrics.record_kernel_error();
                Err(e)
            }
        }
    }

    /// Remove every policy carrying this manager's owner tag
    ///
    /// Succeeds on an empty table.
    pub fn flush_policies(&self) -> Result<(), PolicyError> {
        let owned: Vec<Policy> = self
            .kernel
            .dump_policies()
            .map_err(|e| {
                logging::log_kernel_rejected("dump_policies", &e);
                self.metrics.record_kernel_error();
                PolicyError::Kernel(e)
            })?
            .into_iter()
            .filter(|p| p.owner == self.owner)
            .collect();

        self.remove_all(&owned)?;
        logging::log_flush("policies", owned.len(), self.owner);
        Ok(())
    }

    /// Remove every policy in the table, whoever installed it
    pub fn purge_policies(&self) -> Result<(), PolicyError> {
        self.kernel.flush_policies().map_err(|e| {
            logging::log_kernel_rejected("flush_policies", &e);
            self.metrics.record_kernel_error();
            PolicyError::Kernel(e)
        })?;

        logging::log_purge("policies");
        Ok(())
    }

    fn rollback(&self, journal: Journal) {
        self.metrics.record_rollback();

        let failures = journal.unwind(|undo| match undo {
            Undo::Policy {
                direction,
                selector,
            } => self.remove(*direction, selector),
            Undo::Sa { .. } => Ok(()),
        });

        for _ in 0..failures {
            self.metrics.record_rollback_failure();
        }
    }

    fn policy(
        &self,
        direction: Direction,
        selector: Selector,
        rule: &ProtectRule,
        priority: u32,
        src_endpoint: IpAddr,
        dst_endpoint: IpAddr,
    ) -> Policy {
        Policy {
            direction,
            selector,
            mode: rule.mode(),
            ipsec_protocol: rule.ipsec_protocol(),
            priority,
            src_endpoint,
            dst_endpoint,
            owner: self.owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::memory::{KernelOp, MemoryKernel};
    use crate::ipsec::selector::IpProtocol;
    use ipnet::IpNet;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn http_ah() -> ProtectRule {
        ProtectRule::transport(IpsecProtocol::Ah, IpProtocol::Tcp, 0, 80).unwrap()
    }

    fn subnet_esp() -> ProtectRule {
        ProtectRule::tunnel(
            IpsecProtocol::Esp,
            IpProtocol::Any,
            net("192.168.1.0/24"),
            net("10.0.0.0/8"),
        )
        .unwrap()
    }

    fn manager(kernel: Arc<MemoryKernel>, role: HostRole) -> PolicyManager {
        let config = SessionConfig::builder().with_role(role).build().unwrap();
        PolicyManager::new(kernel, &config)
    }

    #[test]
    fn test_direction_numbering() {
        assert_eq!(Direction::In.to_u8(), 0);
        assert_eq!(Direction::Out.to_u8(), 1);
        assert_eq!(Direction::Forward.to_u8(), 2);
        assert_eq!(Direction::from_u8(2), Some(Direction::Forward));
        assert_eq!(Direction::from_u8(3), None);
    }

    #[test]
    fn test_transport_selectors_are_swapped_hosts() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel, HostRole::EndHost);

        let policies = manager
            .derive_policies(addr("192.168.1.1"), addr("192.168.1.2"), &[http_ah()])
            .unwrap();
        assert_eq!(policies.len(), 2);

        let out = &policies[0];
        assert_eq!(out.direction, Direction::Out);
        assert_eq!(out.selector.src(), net("192.168.1.1/32"));
        assert_eq!(out.selector.dst(), net("192.168.1.2/32"));
        assert_eq!(out.selector.src_port(), None);
        assert_eq!(out.selector.dst_port(), Some(80));
        assert_eq!(out.src_endpoint, addr("192.168.1.1"));

        let inbound = &policies[1];
        assert_eq!(inbound.direction, Direction::In);
        assert_eq!(inbound.selector, out.selector.reversed());
        assert_eq!(inbound.selector.src_port(), Some(80));
        assert_eq!(inbound.src_endpoint, addr("192.168.1.2"));
        assert_eq!(inbound.dst_endpoint, addr("192.168.1.1"));
    }

    #[test]
    fn test_forward_only_for_gateway_tunnels() {
        let kernel = Arc::new(MemoryKernel::new());
        let local = addr("192.168.1.1");
        let remote = addr("192.168.1.2");

        let end_host = manager(kernel.clone(), HostRole::EndHost);
        assert_eq!(
            end_host
                .derive_policies(local, remote, &[subnet_esp()])
                .unwrap()
                .len(),
            2
        );

        let gateway = manager(kernel, HostRole::Gateway);
        let policies = gateway
            .derive_policies(local, remote, &[subnet_esp(), http_ah()])
            .unwrap();
        assert_eq!(policies.len(), 5);

        let fwd: Vec<_> = policies
            .iter()
            .filter(|p| p.direction == Direction::Forward)
            .collect();
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd[0].selector.src(), net("10.0.0.0/8"));
        assert_eq!(fwd[0].selector.dst(), net("192.168.1.0/24"));
    }

    #[test]
    fn test_narrower_selector_wins() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel, HostRole::EndHost);
        let local = addr("192.168.1.1");
        let remote = addr("192.168.1.2");

        let narrow = manager.derive_policies(local, remote, &[http_ah()]).unwrap();
        let wide = manager.derive_policies(local, remote, &[subnet_esp()]).unwrap();

        assert!(narrow[0].priority < wide[0].priority);
        assert_eq!(narrow[0].priority, 0x3000 - (32 + 32 + 1 + 1));
    }

    #[test]
    fn test_mixed_family_rejected() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);

        let err = manager
            .create_policies(addr("192.168.1.1"), addr("2001:db8::1"), &[http_ah()])
            .unwrap_err();
        assert!(matches!(err, PolicyError::Validation(_)));
        assert_eq!(kernel.total_calls(), 0);
    }

    #[test]
    fn test_create_is_idempotent() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);
        let local = addr("192.168.1.1");
        let remote = addr("192.168.1.2");

        manager.create_policies(local, remote, &[http_ah()]).unwrap();
        manager.create_policies(local, remote, &[http_ah()]).unwrap();
        assert_eq!(kernel.policy_count(), 2);
    }

    #[test]
    fn test_kernel_error_rolls_back_new_policies() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);

        kernel.pass_next(KernelOp::AddPolicy);
        kernel.fail_next(
            KernelOp::AddPolicy,
            KernelError::new(KernelError::EINVAL, "Invalid argument"),
        );

        let err = manager
            .create_policies(addr("192.168.1.1"), addr("192.168.1.2"), &[http_ah()])
            .unwrap_err();
        assert!(matches!(err, PolicyError::Kernel(ref e) if e.code == KernelError::EINVAL));

        assert_eq!(kernel.calls(KernelOp::AddPolicy), 2);
        assert_eq!(kernel.calls(KernelOp::DelPolicy), 1);
        assert_eq!(kernel.policy_count(), 0);
    }

    #[test]
    fn test_timed_out_add_is_journaled() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);
        let policies = manager
            .derive_policies(addr("192.168.1.1"), addr("192.168.1.2"), &[http_ah()])
            .unwrap();

        kernel.pass_next(KernelOp::AddPolicy);
        kernel.fail_next(
            KernelOp::AddPolicy,
            KernelError::timed_out("add_policy", std::time::Duration::from_millis(10)),
        );

        let mut journal = Journal::new();
        assert!(manager.install(&policies, &mut journal).is_err());
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.steps()[1], policies[1].undo());

        // Rejected outright: not journaled
        let mut journal = Journal::new();
        kernel.fail_next(KernelOp::AddPolicy, KernelError::new(KernelError::EINVAL, "Invalid argument"));
        assert!(manager.install(&policies[1..], &mut journal).is_err());
        assert!(journal.is_empty());
    }

    #[test]
    fn test_rollback_keeps_preexisting_policies() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);
        let local = addr("192.168.1.1");
        let remote = addr("192.168.1.2");

        manager.create_policies(local, remote, &[http_ah()]).unwrap();
        // Two existing, one new, then a rejection
        for _ in 0..3 {
            kernel.pass_next(KernelOp::AddPolicy);
        }
        kernel.fail_next(KernelOp::AddPolicy, KernelError::new(KernelError::EINVAL, "Invalid argument"));

        assert!(manager
            .create_policies(local, remote, &[http_ah(), subnet_esp()])
            .is_err());
        assert_eq!(kernel.calls(KernelOp::DelPolicy), 1);
        assert_eq!(kernel.policy_count(), 2);
        assert!(kernel.policies().iter().all(|p| p.mode == Mode::Transport));
    }

    #[test]
    fn test_flush_only_removes_owned_policies() {
        let kernel = Arc::new(MemoryKernel::new());
        let ours = manager(kernel.clone(), HostRole::EndHost);
        let theirs = PolicyManager::new(
            kernel.clone(),
            &SessionConfig::builder().with_owner(0x5151).build().unwrap(),
        );

        ours.create_policies(addr("192.168.1.1"), addr("192.168.1.2"), &[http_ah()])
            .unwrap();
        theirs
            .create_policies(addr("192.168.1.1"), addr("192.168.1.3"), &[http_ah()])
            .unwrap();
        assert_eq!(kernel.policy_count(), 4);

        ours.flush_policies().unwrap();
        assert_eq!(kernel.policy_count(), 2);
        assert!(kernel.policies().iter().all(|p| p.owner == 0x5151));

        ours.flush_policies().unwrap();
        ours.purge_policies().unwrap();
        assert_eq!(kernel.policy_count(), 0);
    }

    #[test]
    fn test_delete_skips_missing() {
        let kernel = Arc::new(MemoryKernel::new());
        let manager = manager(kernel.clone(), HostRole::EndHost);
        let local = addr("192.168.1.1");
        let remote = addr("192.168.1.2");

        manager.delete_policies(local, remote, &[http_ah()]).unwrap();
        manager.create_policies(local, remote, &[http_ah()]).unwrap();
        manager.delete_policies(local, remote, &[http_ah()]).unwrap();
        assert_eq!(kernel.policy_count(), 0);
    }
}
