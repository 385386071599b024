//! Shared policy bookkeeping
//!
//! Sessions over the same endpoints and rules derive identical policies, and
//! the kernel keeps a single entry per (direction, selector). [`PolicyLeases`]
//! counts the live sessions relying on each entry, so a session only removes
//! a policy once no other session holds it.
//!
//! An owner-scoped flush removes entries regardless of holders and starts a
//! new epoch. A [`Lease`] taken before the flush no longer counts against the
//! table.

use super::{
    logging,
    policy::{Direction, Policy},
    selector::Selector,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type PolicyKey = (Direction, Selector);

fn key(policy: &Policy) -> PolicyKey {
    (policy.direction, policy.selector.clone())
}

/// Held leases of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    epoch: u64,
}

#[derive(Debug, Default)]
struct Table {
    epoch: u64,
    holders: HashMap<PolicyKey, usize>,
}

/// Holder counts per installed policy
#[derive(Debug, Default)]
pub struct PolicyLeases {
    table: Mutex<Table>,
}

impl PolicyLeases {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table
    ///
    /// Kernel removals that depend on the holder counts run while the guard
    /// is held, so no session can start relying on an entry being removed.
    pub fn lock(&self) -> LeaseTable<'_> {
        LeaseTable {
            table: self.table.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Locked view of [`PolicyLeases`]
pub struct LeaseTable<'a> {
    table: MutexGuard<'a, Table>,
}

impl LeaseTable<'_> {
    /// Count one more holder for each policy
    pub fn acquire(&mut self, policies: &[Policy]) -> Lease {
        for policy in policies {
            *self.table.holders.entry(key(policy)).or_insert(0) += 1;
        }

        Lease {
            epoch: self.table.epoch,
        }
    }

    /// Drop a holder for each policy
    ///
    /// Returns the policies nobody holds any more; those are the caller's to
    /// remove. A lease from before the last reset only reports entries that
    /// nobody has taken since.
    pub fn release<'p>(&mut self, lease: Lease, policies: &'p [Policy]) -> Vec<&'p Policy> {
        let current = lease.epoch == self.table.epoch;
        let mut unheld = Vec::new();

        for policy in policies {
            let key = key(policy);
            let remaining = match self.table.holders.get_mut(&key) {
                None => 0,
                Some(count) if current => {
                    *count = count.saturating_sub(1);
                    *count
                }
                Some(count) => *count,
            };

            if remaining == 0 {
                self.table.holders.remove(&key);
                unheld.push(policy);
            } else {
                logging::log_policy_shared(policy.direction, &policy.selector, remaining);
            }
        }

        unheld
    }

    /// Whether any session holds the policy
    pub fn is_held(&self, direction: Direction, selector: &Selector) -> bool {
        self.table
            .holders
            .contains_key(&(direction, selector.clone()))
    }

    /// Forget every holder and start a new epoch
    pub fn reset(&mut self) {
        self.table.epoch += 1;
        self.table.holders.clear();
    }

    /// Number of policies with at least one holder
    pub fn len(&self) -> usize {
        self.table.holders.len()
    }

    /// Whether no policy is held
    pub fn is_empty(&self) -> bool {
        self.table.holders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::rule::{IpsecProtocol, Mode};
    use crate::ipsec::selector::IpProtocol;
    use ipnet::IpNet;

    fn policy(direction: Direction, port: u16) -> Policy {
        Policy {
            direction,
            selector: Selector::new(
                "192.168.1.1/32".parse::<IpNet>().unwrap(),
                "192.168.1.2/32".parse::<IpNet>().unwrap(),
                None,
                Some(port),
                IpProtocol::Tcp,
            )
            .unwrap(),
            mode: Mode::Transport,
            ipsec_protocol: IpsecProtocol::Esp,
            priority: 0x3000,
            src_endpoint: "192.168.1.1".parse().unwrap(),
            dst_endpoint: "192.168.1.2".parse().unwrap(),
            owner: 7,
        }
    }

    #[test]
    fn test_last_holder_removes() {
        let leases = PolicyLeases::new();
        let shared = vec![policy(Direction::Out, 80), policy(Direction::In, 80)];

        let first = leases.lock().acquire(&shared);
        let second = leases.lock().acquire(&shared);
        assert_eq!(leases.lock().len(), 2);

        assert!(leases.lock().release(first, &shared).is_empty());
        assert!(leases.lock().is_held(Direction::Out, &shared[0].selector));

        let unheld = leases.lock().release(second, &shared);
        assert_eq!(unheld.len(), 2);
        assert!(leases.lock().is_empty());
    }

    #[test]
    fn test_partial_overlap() {
        let leases = PolicyLeases::new();
        let web = vec![policy(Direction::Out, 80)];
        let both = vec![policy(Direction::Out, 80), policy(Direction::Out, 443)];

        let _web = leases.lock().acquire(&web);
        let lease = leases.lock().acquire(&both);

        let unheld = leases.lock().release(lease, &both);
        assert_eq!(unheld, vec![&both[1]]);
        assert!(leases.lock().is_held(Direction::Out, &web[0].selector));
    }

    #[test]
    fn test_lease_from_before_reset() {
        let leases = PolicyLeases::new();
        let shared = vec![policy(Direction::Out, 80)];

        let stale = leases.lock().acquire(&shared);
        leases.lock().reset();
        assert!(!leases.lock().is_held(Direction::Out, &shared[0].selector));

        // Nobody took the entry since: still reported for removal
        let other = vec![policy(Direction::In, 80)];
        assert_eq!(leases.lock().release(stale, &other).len(), 1);

        // A newer holder is not counted down by the stale lease
        let fresh = leases.lock().acquire(&shared);
        assert!(leases.lock().release(stale, &shared).is_empty());
        assert!(leases.lock().is_held(Direction::Out, &shared[0].selector));
        assert_eq!(leases.lock().release(fresh, &shared).len(), 1);
    }
}
