//! Security Association Database management
//!
//! [`AssociationManager::create_sa`] installs exactly one unidirectional
//! association per call. Callers install a pair, one per direction, with
//! swapped addresses and selectors and independent SPIs.
//!
//! Checks run in a fixed order and all of them happen before anything is
//! installed:
//!
//! 1. SPI range (`0..=255` is reserved)
//! 2. algorithm presence and key lengths
//! 3. selector and mode consistency
//! 4. SPI uniqueness within (destination, protocol)
//!
//! SPI uniqueness is decided by the process-wide [`SpiAllocator`]. When it
//! reports an SPI this process installed earlier, the kernel table is
//! consulted: an association that expired or was flushed elsewhere no longer
//! blocks its SPI.
//!
//! # Example
//!
//! ```
//! use keel_proto::ipsec::{
//!     algorithm::{CipherId, CipherKey, IntegrityId, IntegrityKey},
//!     config::SessionConfig,
//!     memory::MemoryKernel,
//!     rule::{IpsecProtocol, Mode},
//!     sa::AssociationManager,
//!     selector::{IpProtocol, TrafficSelector},
//!     spi::SpiAllocator,
//! };
//! use std::sync::Arc;
//!
//! let kernel = Arc::new(MemoryKernel::new());
//! let config = SessionConfig::default();
//! let manager = AssociationManager::new(kernel.clone(), &config)
//!     .with_allocator(Arc::new(SpiAllocator::new()));
//!
//! let local = "192.168.1.1".parse().unwrap();
//! let remote = "192.168.1.2".parse().unwrap();
//!
//! manager
//!     .create_sa(
//!         local,
//!         remote,
//!         &TrafficSelector::host(local, IpProtocol::Tcp, 0).unwrap(),
//!         &TrafficSelector::host(remote, IpProtocol::Tcp, 0).unwrap(),
//!         IpsecProtocol::Esp,
//!         0x3132_3334,
//!         Some(CipherKey::new(CipherId::AesCbc128, vec![0x31; 16])),
//!         Some(IntegrityKey::new(IntegrityId::HmacMd5_96, vec![0x31; 16])),
//!         Mode::Transport,
//!     )
//!     .unwrap();
//!
//! assert_eq!(kernel.sa_count(), 1);
//! ```

use super::{
    algorithm::{CipherKey, IntegrityKey},
    config::SessionConfig,
    error::{SaError, ValidationError},
    journal::Undo,
    kernel::{KernelChannel, KernelError},
    logging,
    metrics::IpsecMetrics,
    rule::{IpsecProtocol, Mode},
    selector::{Selector, TrafficSelector},
    spi::SpiAllocator,
};
use ipnet::IpNet;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// SA lifetime limits
///
/// The soft limit asks the key-exchange daemon to rekey; the hard limit makes
/// the kernel expire the association. Time limits are always set, byte
/// limits are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaLifetime {
    /// Soft time limit
    pub soft_time: Duration,

    /// Hard time limit
    pub hard_time: Duration,

    /// Soft byte limit
    pub soft_bytes: Option<u64>,

    /// Hard byte limit
    pub hard_bytes: Option<u64>,
}

impl Default for SaLifetime {
    /// 45 minutes soft, 60 minutes hard, no byte limits
    fn default() -> Self {
        SaLifetime {
            soft_time: Duration::from_secs(45 * 60),
            hard_time: Duration::from_secs(60 * 60),
            soft_bytes: None,
            hard_bytes: None,
        }
    }
}

impl SaLifetime {
    /// Create a lifetime with time limits
    pub fn new(soft_time: Duration, hard_time: Duration) -> Result<Self, ValidationError> {
        if soft_time >= hard_time {
            return Err(ValidationError::new(
                "soft lifetime must be less than hard lifetime",
            ));
        }

        Ok(SaLifetime {
            soft_time,
            hard_time,
            soft_bytes: None,
            hard_bytes: None,
        })
    }

    /// Add byte limits
    pub fn with_byte_limits(mut self, soft_bytes: u64, hard_bytes: u64) -> Result<Self, ValidationError> {
        if soft_bytes >= hard_bytes {
            return Err(ValidationError::new(
                "soft byte limit must be less than hard byte limit",
            ));
        }

        self.soft_bytes = Some(soft_bytes);
        self.hard_bytes = Some(hard_bytes);
        Ok(self)
    }
}

/// One unidirectional SAD entry
///
/// Key material is zeroized when the association is dropped and never
/// appears in `Debug` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityAssociation {
    /// Security Parameter Index, unique per (dst, protocol)
    pub spi: u32,

    /// AH or ESP
    pub protocol: IpsecProtocol,

    /// Transport or tunnel
    pub mode: Mode,

    /// Outer source address
    pub src: IpAddr,

    /// Outer destination address
    pub dst: IpAddr,

    /// Encryption transform (ESP only)
    pub cipher: Option<CipherKey>,

    /// Integrity transform (absent for AEAD ESP)
    pub integrity: Option<IntegrityKey>,

    /// Traffic the association carries (inner selector in tunnel mode)
    pub selector: Selector,

    /// Expiry limits
    pub lifetime: SaLifetime,

    /// Anti-replay window in packets
    pub replay_window: u32,

    /// Tag of the process that installed the entry
    pub owner: u32,
}

impl SecurityAssociation {
    /// Kernel key of this entry
    pub fn undo(&self) -> Undo {
        Undo::Sa {
            spi: self.spi,
            protocol: self.protocol,
            dst: self.dst,
        }
    }
}

impl fmt::Display for SecurityAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} 0x{:08x} {} {} -> {} [{}]",
            self.protocol, self.spi, self.mode, self.src, self.dst, self.selector
        )
    }
}

/// Association Manager
pub struct AssociationManager {
    kernel: Arc<dyn KernelChannel>,
    spis: Arc<SpiAllocator>,
    owner: u32,
    lifetime: SaLifetime,
    replay_window: u32,
    metrics: IpsecMetrics,
}

impl AssociationManager {
    /// Create an association manager using the process-wide SPI allocator
    pub fn new(kernel: Arc<dyn KernelChannel>, config: &SessionConfig) -> Self {
        AssociationManager {
            kernel,
            spis: SpiAllocator::shared(),
            owner: config.owner,
            lifetime: config.lifetime,
            replay_window: config.replay_window,
            metrics: IpsecMetrics::new(),
        }
    }

    /// Use a dedicated SPI allocator
    pub fn with_allocator(mut self, spis: Arc<SpiAllocator>) -> Self {
        self.spis = spis;
        self
    }

    /// Share a metrics registry
    pub fn with_metrics(mut self, metrics: IpsecMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// SPI allocator in use
    pub fn allocator(&self) -> &Arc<SpiAllocator> {
        &self.spis
    }

    /// Pick a free SPI for associations towards `dst`
    ///
    /// The SPI stays reserved until an association claims it or it is
    /// released by [`Self::delete_sa`].
    pub fn allocate_spi(&self, dst: IpAddr, protocol: IpsecProtocol) -> Result<u32, SaError> {
        self.spis.allocate(dst, protocol)
    }

    /// Build, validate and install one association from `src` to `dst`
    ///
    /// `src_selector` and `dst_selector` describe the traffic the association
    /// carries. In transport mode they must name exactly the two endpoints;
    /// in tunnel mode they must differ from them.
    ///
    /// AH ignores `cipher`. An AEAD cipher ignores `integrity`.
    ///
    /// A request the kernel did not answer in time fails with an `ETIMEDOUT`
    /// kernel error and keeps its SPI reserved, since the association may
    /// still be installed.
    #[allow(clippy::too_many_arguments)]
    pub fn create_sa(
        &self,
        src: IpAddr,
        dst: IpAddr,
        src_selector: &TrafficSelector,
        dst_selector: &TrafficSelector,
        protocol: IpsecProtocol,
        spi: u32,
        cipher: Option<CipherKey>,
        integrity: Option<IntegrityKey>,
        mode: Mode,
    ) -> Result<(), SaError> {
        if spi < SpiAllocator::MIN_SPI {
            return Err(SaError::InvalidSpi(spi));
        }

        let (cipher, integrity) = Self::check_algorithms(spi, protocol, cipher, integrity)?;
        let selector = Self::check_selectors(src, dst, src_selector, dst_selector, mode)?;

        let sa = SecurityAssociation {
            spi,
            protocol,
            mode,
            src,
            dst,
            cipher,
            integrity,
            selector,
            lifetime: self.lifetime,
            replay_window: self.replay_window,
            owner: self.owner,
        };

        self.reserve(dst, protocol, spi)?;

        match self.kernel.add_sa(&sa) {
            Ok(()) => {
                self.spis.confirm(dst, protocol, spi);
                logging::log_sa_installed(&sa);
                self.metrics.record_sa_installed();
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                // The request may still land; keep the SPI until it is deleted
                self.spis.confirm(dst, protocol, spi);
                logging::log_kernel_rejected("add_sa", &e);
                self.metrics.record_kernel_error();
                Err(SaError::Kernel(e))
            }
            Err(e) => {
                self.spis.release(dst, protocol, spi);
                if e.is_already_exists() {
                    logging::log_duplicate_spi(spi, protocol, dst);
                    self.metrics.record_duplicate_spi();
                    return Err(SaError::DuplicateSpi { spi, dst, protocol });
                }
                logging::log_kernel_rejected("add_sa", &e);
                self.metrics.record_kernel_error();
                Err(SaError::Kernel(e))
            }
        }
    }

    /// Remove one association and release its SPI
    ///
    /// A missing association counts as removed.
    pub fn delete_sa(&self, spi: u32, protocol: IpsecProtocol, dst: IpAddr) -> Result<(), SaError> {
        self.remove(spi, protocol, dst).map_err(SaError::Kernel)
    }

    /// Remove every association carrying this manager's owner tag
    ///
    /// Continues past failures and returns the first one. Succeeds on an
    /// empty table. Installed SPI reservations whose association is no
    /// longer in the kernel are released as well.
    pub fn flush_sas(&self) -> Result<(), SaError> {
        let table = self.dump()?;

        let mut removed = 0;
        let mut first_error = None;
        for sa in table.iter().filter(|sa| sa.owner == self.owner) {
            match self.remove(sa.spi, sa.protocol, sa.dst) {
                Ok(()) => removed += 1,
                Err(e) => {
                    first_error.get_or_insert(SaError::Kernel(e));
                }
            }
        }

        let present: HashSet<(IpAddr, IpsecProtocol, u32)> =
            table.iter().map(|sa| (sa.dst, sa.protocol, sa.spi)).collect();
        self.spis
            .retain_installed(|dst, protocol, spi| present.contains(&(dst, protocol, spi)));

        if let Some(e) = first_error {
            return Err(e);
        }

        logging::log_flush("associations", removed, self.owner);
        Ok(())
    }

    /// Remove every association in the table, whoever installed it
    pub fn purge_sas(&self) -> Result<(), SaError> {
        self.kernel.flush_sas().map_err(|e| {
            logging::log_kernel_rejected("flush_sas", &e);
            self.metrics.record_kernel_error();
            SaError::Kernel(e)
        })?;

        self.spis.release_installed();
        logging::log_purge("associations");
        Ok(())
    }

    pub(crate) fn remove(&self, spi: u32, protocol: IpsecProtocol, dst: IpAddr) -> Result<(), KernelError> {
        match self.kernel.del_sa(spi, protocol, dst) {
            Ok(()) => {
                self.spis.release(dst, protocol, spi);
                logging::log_sa_deleted(spi, protocol, dst);
                self.metrics.record_sa_deleted();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.spis.release(dst, protocol, spi);
                logging::log_sa_absent(spi, protocol, dst);
                Ok(())
            }
            Err(e) => {
                logging::log_kernel_rejected("del_sa", &e);
                self.metrics.record_kernel_error();
                Err(e)
            }
        }
    }

    /// Claim `spi`, asking the kernel when our own reservation may be stale
    fn reserve(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> Result<(), SaError> {
        match self.spis.claim(dst, protocol, spi) {
            Err(SaError::DuplicateSpi { .. }) => {}
            other => return other,
        }

        let held = self
            .dump()?
            .iter()
            .any(|sa| sa.spi == spi && sa.protocol == protocol && sa.dst == dst);
        if !held && self.spis.reclaim(dst, protocol, spi) {
            logging::log_spi_reclaimed(spi, protocol, dst);
            return Ok(());
        }

        logging::log_duplicate_spi(spi, protocol, dst);
        self.metrics.record_duplicate_spi();
        Err(SaError::DuplicateSpi { spi, dst, protocol })
    }

    fn dump(&self) -> Result<Vec<SecurityAssociation>, SaError> {
        self.kernel.dump_sas().map_err(|e| {
            logging::log_kernel_rejected("dump_sas", &e);
            self.metrics.record_kernel_error();
            SaError::Kernel(e)
        })
    }

    fn check_algorithms(
        spi: u32,
        protocol: IpsecProtocol,
        cipher: Option<CipherKey>,
        integrity: Option<IntegrityKey>,
    ) -> Result<(Option<CipherKey>, Option<IntegrityKey>), SaError> {
        match protocol {
            IpsecProtocol::Ah => {
                if let Some(cipher) = &cipher {
                    logging::log_algorithm_ignored(spi, protocol, cipher.id().kernel_name());
                }
                let integrity = integrity
                    .ok_or_else(|| ValidationError::new("AH requires an integrity algorithm"))?;
                integrity.check_len()?;
                Ok((None, Some(integrity)))
            }
            IpsecProtocol::Esp => {
                let cipher = cipher
                    .ok_or_else(|| ValidationError::new("ESP requires a cipher"))?;
                cipher.check_len()?;

                if cipher.id().is_aead() {
                    if let Some(integrity) = &integrity {
                        logging::log_algorithm_ignored(spi, protocol, integrity.id().kernel_name());
                    }
                    return Ok((Some(cipher), None));
                }

                let integrity = integrity.ok_or_else(|| {
                    ValidationError::new(format!(
                        "ESP with {} requires an integrity algorithm",
                        cipher.id()
                    ))
                })?;
                integrity.check_len()?;
                Ok((Some(cipher), Some(integrity)))
            }
        }
    }

    fn check_selectors(
        src: IpAddr,
        dst: IpAddr,
        src_selector: &TrafficSelector,
        dst_selector: &TrafficSelector,
        mode: Mode,
    ) -> Result<Selector, SaError> {
        if src.is_ipv4() != dst.is_ipv4() {
            return Err(ValidationError::new(format!(
                "association endpoints {} and {} differ in family",
                src, dst
            ))
            .into());
        }

        let selector = Selector::from_traffic_selectors(src_selector, dst_selector)?;
        let endpoints = selector.src() == IpNet::from(src) && selector.dst() == IpNet::from(dst);

        match mode {
            Mode::Transport if !endpoints => Err(ValidationError::new(format!(
                "transport selector {} does not match endpoints {} -> {}",
                selector, src, dst
            ))
            .into()),
            Mode::Tunnel if endpoints => Err(ValidationError::new(format!(
                "tunnel inner selector {} repeats the outer endpoints",
                selector
            ))
            .into()),
            _ => Ok(selector),
        }
    }
}
