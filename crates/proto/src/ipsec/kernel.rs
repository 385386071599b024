//! Kernel channel
//!
//! The kernel's Security Policy Database and Security Association Database
//! are reached through a [`KernelChannel`]: a blocking request/response
//! primitive that either acknowledges a request or rejects it with an
//! errno-style code. Managers receive the channel as an injected
//! `Arc<dyn KernelChannel>`, so tests substitute [`MemoryKernel`] and
//! production code substitutes a netlink-backed implementation.
//!
//! [`DeadlineChannel`] bounds how long a caller waits for any single request
//! and runs requests serially on one worker thread.
//!
//! [`MemoryKernel`]: super::memory::MemoryKernel

use super::{
    policy::{Direction, Policy},
    rule::IpsecProtocol,
    sa::SecurityAssociation,
    selector::Selector,
};
use std::fmt;
use std::net::IpAddr;
use std::sync::{
    mpsc::{self, RecvTimeoutError, SyncSender, TrySendError},
    Arc, Mutex,
};
use std::thread;
use std::time::Duration;

/// Result type for kernel channel requests
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Rejection reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelError {
    /// errno-style code
    pub code: i32,
    /// Human-readable reason
    pub reason: String,
}

impl KernelError {
    /// No such entry
    pub const ENOENT: i32 = 2;
    /// No such entry (xfrm lookups)
    pub const ESRCH: i32 = 3;
    /// I/O error on the channel
    pub const EIO: i32 = 5;
    /// Resource temporarily unavailable
    pub const EAGAIN: i32 = 11;
    /// Entry already exists
    pub const EEXIST: i32 = 17;
    /// Invalid argument
    pub const EINVAL: i32 = 22;
    /// Caller deadline elapsed
    pub const ETIMEDOUT: i32 = 110;

    /// Create kernel error
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        KernelError {
            code,
            reason: reason.into(),
        }
    }

    /// Entry already exists
    pub fn already_exists(what: impl fmt::Display) -> Self {
        KernelError::new(Self::EEXIST, format!("{} already exists", what))
    }

    /// Entry not found
    pub fn not_found(what: impl fmt::Display) -> Self {
        KernelError::new(Self::ENOENT, format!("{} not found", what))
    }

    /// Caller stopped waiting for the kernel
    pub fn timed_out(operation: &str, after: Duration) -> Self {
        KernelError::new(
            Self::ETIMEDOUT,
            format!("{} timed out after {:?}", operation, after),
        )
    }

    /// Whether the kernel reported an existing entry
    pub fn is_already_exists(&self) -> bool {
        self.code == Self::EEXIST
    }

    /// Whether the kernel reported a missing entry
    pub fn is_not_found(&self) -> bool {
        self.code == Self::ENOENT || self.code == Self::ESRCH
    }

    /// Whether the caller deadline elapsed
    pub fn is_timeout(&self) -> bool {
        self.code == Self::ETIMEDOUT
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.reason, self.code)
    }
}

impl std::error::Error for KernelError {}

/// Request/response access to the kernel's SPD and SAD
///
/// Every call blocks until the kernel acknowledges or rejects it.
/// Implementations must not cache table contents.
pub trait KernelChannel: Send + Sync {
    /// Install a policy
    ///
    /// # Errors
    ///
    /// `EEXIST` when a policy with the same direction and selector exists.
    fn add_policy(&self, policy: &Policy) -> KernelResult<()>;

    /// Remove the policy with this direction and selector
    ///
    /// # Errors
    ///
    /// `ENOENT` when no such policy exists.
    fn del_policy(&self, direction: Direction, selector: &Selector) -> KernelResult<()>;

    /// Remove every policy in the table
    fn flush_policies(&self) -> KernelResult<()>;

    /// List every policy in the table
    fn dump_policies(&self) -> KernelResult<Vec<Policy>>;

    /// Install a security association
    ///
    /// # Errors
    ///
    /// `EEXIST` when the (destination, protocol, SPI) triple is taken.
    fn add_sa(&self, sa: &SecurityAssociation) -> KernelResult<()>;

    /// Remove the association identified by (SPI, protocol, destination)
    ///
    /// # Errors
    ///
    /// `ENOENT` when no such association exists.
    fn del_sa(&self, spi: u32, protocol: IpsecProtocol, dst: IpAddr) -> KernelResult<()>;

    /// Remove every association in the table
    fn flush_sas(&self) -> KernelResult<()>;

    /// List every association in the table
    fn dump_sas(&self) -> KernelResult<Vec<SecurityAssociation>>;
}

type Job = Box<dyn FnOnce(&dyn KernelChannel) + Send>;

/// Kernel channel with a per-request deadline
///
/// Requests run one at a time, in submission order, on a single worker
/// thread owned by the channel. The caller waits at most `timeout` for its
/// reply and gets `ETIMEDOUT` on expiry. The request itself stays queued and
/// may still complete afterwards, so callers treat a timed-out add as
/// possibly installed. A removal submitted after it always runs after it.
///
/// At most [`Self::MAX_QUEUED`] requests wait behind the one running; further
/// requests are refused with `EAGAIN` instead of piling up behind a stalled
/// kernel.
pub struct DeadlineChannel {
    inner: Arc<dyn KernelChannel>,
    timeout: Duration,
    queue: Mutex<Option<SyncSender<Job>>>,
}

impl DeadlineChannel {
    /// Requests allowed to wait for the worker
    pub const MAX_QUEUED: usize = 64;

    /// Wrap a channel with a deadline
    ///
    /// The worker thread starts with the first request.
    pub fn new(inner: Arc<dyn KernelChannel>, timeout: Duration) -> Self {
        DeadlineChannel {
            inner,
            timeout,
            queue: Mutex::new(None),
        }
    }

    /// Configured deadline
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call<T, F>(&self, operation: &'static str, request: F) -> KernelResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn KernelChannel) -> KernelResult<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(
            operation,
            Box::new(move |kernel: &dyn KernelChannel| {
                // Receiver is gone when the caller already timed out
                let _ = tx.send(request(kernel));
            }),
        )?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(KernelError::timed_out(operation, self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(KernelError::new(
                KernelError::EIO,
                format!("{} worker exited without a reply", operation),
            )),
        }
    }

    fn submit(&self, operation: &'static str, job: Job) -> KernelResult<()> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let sender = match queue.take() {
            Some(sender) => sender,
            None => self.spawn_worker()?,
        };

        match sender.try_send(job) {
            Ok(()) => {
                *queue = Some(sender);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                *queue = Some(sender);
                Err(KernelError::new(
                    KernelError::EAGAIN,
                    format!(
                        "{} refused: {} requests already waiting",
                        operation,
                        Self::MAX_QUEUED
                    ),
                ))
            }
            // Worker died mid-request; start a fresh one
            Err(TrySendError::Disconnected(job)) => {
                let sender = self.spawn_worker()?;
                sender.try_send(job).map_err(|_| {
                    KernelError::new(
                        KernelError::EIO,
                        format!("{} worker exited before accepting requests", operation),
                    )
                })?;
                *queue = Some(sender);
                Ok(())
            }
        }
    }

    fn spawn_worker(&self) -> KernelResult<SyncSender<Job>> {
        let (tx, rx) = mpsc::sync_channel::<Job>(Self::MAX_QUEUED);
        let inner = Arc::clone(&self.inner);

        thread::Builder::new()
            .name("keel-kernel".to_string())
            .spawn(move || {
                // Ends once the channel and its sender are dropped
                for job in rx {
                    job(inner.as_ref());
                }
            })
            .map_err(|e| {
                KernelError::new(
                    KernelError::EAGAIN,
                    format!("cannot spawn kernel worker: {}", e),
                )
            })?;

        Ok(tx)
    }
}

impl KernelChannel for DeadlineChannel {
    fn add_policy(&self, policy: &Policy) -> KernelResult<()> {
        let policy = policy.clone();
        self.call("add_policy", move |kernel| kernel.add_policy(&policy))
    }

    fn del_policy(&self, direction: Direction, selector: &Selector) -> KernelResult<()> {
        let selector = selector.clone();
        self.call("del_policy", move |kernel| {
            kernel.del_policy(direction, &selector)
        })
    }

    fn flush_policies(&self) -> KernelResult<()> {
        self.call("flush_policies", |kernel| kernel.flush_policies())
    }

    fn dump_policies(&self) -> KernelResult<Vec<Policy>> {
        self.call("dump_policies", |kernel| kernel.dump_policies())
    }

    fn add_sa(&self, sa: &SecurityAssociation) -> KernelResult<()> {
        let sa = sa.clone();
        self.call("add_sa", move |kernel| kernel.add_sa(&sa))
    }

    fn del_sa(&self, spi: u32, protocol: IpsecProtocol, dst: IpAddr) -> KernelResult<()> {
        self.call("del_sa", move |kernel| kernel.del_sa(spi, protocol, dst))
    }

    fn flush_sas(&self) -> KernelResult<()> {
        self.call("flush_sas", |kernel| kernel.flush_sas())
    }

    fn dump_sas(&self) -> KernelResult<Vec<SecurityAssociation>> {
        self.call("dump_sas", |kernel| kernel.dump_sas())
    }
}
