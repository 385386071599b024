//! In-process SPD/SAD
//!
//! [`MemoryKernel`] implements [`KernelChannel`] over two in-memory tables
//! with the same acknowledgement rules as the xfrm netlink interface:
//!
//! - a policy is keyed by (direction, selector); adding a second one is `EEXIST`
//! - an association is keyed by (destination, protocol, SPI); same rule
//! - deleting a missing entry is `ENOENT`
//! - flushing an empty table succeeds
//!
//! Outcomes can be scripted per operation with [`MemoryKernel::pass_next`]
//! and [`MemoryKernel::fail_next`], and every request is counted, so callers
//! can assert that a rejected request never reached the kernel.

use super::{
    kernel::{KernelChannel, KernelError, KernelResult},
    policy::{Direction, Policy},
    rule::IpsecProtocol,
    sa::SecurityAssociation,
    selector::Selector,
};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

/// Kernel request kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelOp {
    /// `add_policy`
    AddPolicy,
    /// `del_policy`
    DelPolicy,
    /// `flush_policies`
    FlushPolicies,
    /// `dump_policies`
    DumpPolicies,
    /// `add_sa`
    AddSa,
    /// `del_sa`
    DelSa,
    /// `flush_sas`
    FlushSas,
    /// `dump_sas`
    DumpSas,
}

#[derive(Default)]
struct Tables {
    policies: Vec<Policy>,
    sas: Vec<SecurityAssociation>,
    script: HashMap<KernelOp, VecDeque<Option<KernelError>>>,
    calls: HashMap<KernelOp, usize>,
}

/// In-memory kernel tables
#[derive(Default)]
pub struct MemoryKernel {
    tables: Mutex<Tables>,
}

impl MemoryKernel {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of installed policies
    pub fn policy_count(&self) -> usize {
        self.lock().policies.len()
    }

    /// Number of installed associations
    pub fn sa_count(&self) -> usize {
        self.lock().sas.len()
    }

    /// Installed policies in installation order
    pub fn policies(&self) -> Vec<Policy> {
        self.lock().policies.clone()
    }

    /// Installed associations in installation order
    pub fn sas(&self) -> Vec<SecurityAssociation> {
        self.lock().sas.clone()
    }

    /// Look up one association
    pub fn find_sa(
        &self,
        spi: u32,
        protocol: IpsecProtocol,
        dst: IpAddr,
    ) -> Option<SecurityAssociation> {
        self.lock()
            .sas
            .iter()
            .find(|sa| sa.spi == spi && sa.protocol == protocol && sa.dst == dst)
            .cloned()
    }

    /// Reject the next unscripted request of this kind with `error`
    ///
    /// Scripted outcomes queue up per operation and are consumed in order.
    pub fn fail_next(&self, op: KernelOp, error: KernelError) {
        self.lock().script.entry(op).or_default().push_back(Some(error));
    }

    /// Let the next unscripted request of this kind run normally
    pub fn pass_next(&self, op: KernelOp) {
        self.lock().script.entry(op).or_default().push_back(None);
    }

    /// Requests of this kind received so far, including rejected ones
    pub fn calls(&self, op: KernelOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Requests received so far, all kinds
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, op: KernelOp) -> KernelResult<MutexGuard<'_, Tables>> {
        let mut tables = self.lock();
        *tables.calls.entry(op).or_insert(0) += 1;

        if let Some(Some(error)) = tables.script.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }

        Ok(tables)
    }
}

impl KernelChannel for MemoryKernel {
    fn add_policy(&self, policy: &Policy) -> KernelResult<()> {
        let mut tables = self.begin(KernelOp::AddPolicy)?;

        let taken = tables
            .policies
            .iter()
            .any(|p| p.direction == policy.direction && p.selector == policy.selector);
        if taken {
            return Err(KernelError::already_exists(format!(
                "{} policy {}",
                policy.direction, policy.selector
            )));
        }

        tables.policies.push(policy.clone());
        Ok(())
    }

    fn del_policy(&self, direction: Direction, selector: &Selector) -> KernelResult<()> {
        let mut tables = self.begin(KernelOp::DelPolicy)?;

        match tables
            .policies
            .iter()
            .position(|p| p.direction == direction && p.selector == *selector)
        {
            Some(index) => {
                tables.policies.remove(index);
                Ok(())
            }
            None => Err(KernelError::not_found(format!(
                "{} policy {}",
                direction, selector
            ))),
        }
    }

    fn flush_policies(&self) -> KernelResult<()> {
        self.begin(KernelOp::FlushPolicies)?.policies.clear();
        Ok(())
    }

    fn dump_policies(&self) -> KernelResult<Vec<Policy>> {
        Ok(self.begin(KernelOp::DumpPolicies)?.policies.clone())
    }

    fn add_sa(&self, sa: &SecurityAssociation) -> KernelResult<()> {
        let mut tables = self.begin(KernelOp::AddSa)?;

        let taken = tables
            .sas
            .iter()
            .any(|s| s.spi == sa.spi && s.protocol == sa.protocol && s.dst == sa.dst);
        if taken {
            return Err(KernelError::already_exists(format!(
                "{} SA 0x{:08x} to {}",
                sa.protocol, sa.spi, sa.dst
            )));
        }

        tables.sas.push(sa.clone());
        Ok(())
    }

    fn del_sa(&self, spi: u32, protocol: IpsecProtocol, dst: IpAddr) -> KernelResult<()> {
        let mut tables = self.begin(KernelOp::DelSa)?;

        match tables
            .sas
            .iter()
            .position(|s| s.spi == spi && s.protocol == protocol && s.dst == dst)
        {
            Some(index) => {
                tables.sas.remove(index);
                Ok(())
            }
            None => Err(KernelError::not_found(format!(
                "{} SA 0x{:08x} to {}",
                protocol, spi, dst
            ))),
        }
    }

    fn flush_sas(&self) -> KernelResult<()> {
        self.begin(KernelOp::FlushSas)?.sas.clear();
        Ok(())
    }

    fn dump_sas(&self) -> KernelResult<Vec<SecurityAssociation>> {
        Ok(self.begin(KernelOp::DumpSas)?.sas.clone())
    }
}
