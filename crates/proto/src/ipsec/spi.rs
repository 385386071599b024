//! Process-wide SPI coordination
//!
//! SPIs are chosen by this process, so two sessions installing associations
//! concurrently could otherwise pick the same value for the same
//! (destination, protocol) namespace. [`SpiAllocator`] keeps every SPI this
//! process has reserved behind a single mutex; the kernel remains the
//! authority on which associations actually exist.
//!
//! A reservation moves through three states:
//!
//! - *allocated*: handed out by [`SpiAllocator::allocate`], not yet used
//! - *pending*: claimed by an association whose install is in flight
//! - *installed*: the kernel acknowledged the association (or may have)
//!
//! Claiming a free or allocated SPI succeeds; claiming a pending or
//! installed one is a duplicate. An installed reservation can outlive its
//! association (lifetime expiry, an external flush), so callers confirm
//! with the kernel and [`SpiAllocator::reclaim`] it when the entry is gone.
//!
//! Values `0..=255` are reserved by RFC 4303 and never handed out.

use super::{error::SaError, logging, rule::IpsecProtocol};
use rand::Rng;
use std::collections::{hash_map::Entry, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

type SpiKey = (IpAddr, IpsecProtocol, u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    Allocated,
    Pending,
    Installed,
}

/// SPI reservation table
#[derive(Debug, Default)]
pub struct SpiAllocator {
    reserved: Mutex<HashMap<SpiKey, Reservation>>,
}

impl SpiAllocator {
    /// Smallest assignable SPI
    pub const MIN_SPI: u32 = 256;

    /// Random draws before giving up on a namespace
    const MAX_ATTEMPTS: usize = 64;

    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator shared by every manager in this process
    pub fn shared() -> Arc<SpiAllocator> {
        static SHARED: OnceLock<Arc<SpiAllocator>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(SpiAllocator::new())))
    }

    /// Claim an SPI for an association about to be installed
    ///
    /// The reservation stays pending until [`Self::confirm`] or
    /// [`Self::release`].
    ///
    /// # Errors
    ///
    /// `InvalidSpi` below [`Self::MIN_SPI`], `DuplicateSpi` if an association
    /// already claimed the SPI for this (destination, protocol).
    pub fn claim(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> Result<(), SaError> {
        if spi < Self::MIN_SPI {
            return Err(SaError::InvalidSpi(spi));
        }

        match self.lock().entry((dst, protocol, spi)) {
            Entry::Occupied(mut entry) => {
                if *entry.get() != Reservation::Allocated {
                    return Err(SaError::DuplicateSpi { spi, dst, protocol });
                }
                entry.insert(Reservation::Pending);
            }
            Entry::Vacant(entry) => {
                entry.insert(Reservation::Pending);
            }
        }

        Ok(())
    }

    /// Mark a pending claim as installed
    pub fn confirm(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) {
        if let Some(reservation) = self.lock().get_mut(&(dst, protocol, spi)) {
            *reservation = Reservation::Installed;
        }
    }

    /// Claim an installed SPI again after its association left the kernel
    ///
    /// Returns `false` unless the reservation is installed; a pending one
    /// belongs to an install still in flight.
    pub fn reclaim(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> bool {
        match self.lock().get_mut(&(dst, protocol, spi)) {
            Some(reservation) if *reservation == Reservation::Installed => {
                *reservation = Reservation::Pending;
                true
            }
            _ => false,
        }
    }

    /// Pick and reserve a random free SPI
    pub fn allocate(&self, dst: IpAddr, protocol: IpsecProtocol) -> Result<u32, SaError> {
        let mut reserved = self.lock();
        let mut rng = rand::thread_rng();

        for _ in 0..Self::MAX_ATTEMPTS {
            let spi = rng.gen_range(Self::MIN_SPI..=u32::MAX);
            if let Entry::Vacant(entry) = reserved.entry((dst, protocol, spi)) {
                entry.insert(Reservation::Allocated);
                logging::log_spi_allocated(spi, protocol, dst);
                return Ok(spi);
            }
        }

        Err(SaError::SpiExhausted { dst, protocol })
    }

    /// Release a reservation; returns whether it was held
    pub fn release(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> bool {
        self.lock().remove(&(dst, protocol, spi)).is_some()
    }

    /// Release every installed reservation
    ///
    /// Unused allocations and in-flight claims are kept.
    pub fn release_installed(&self) {
        self.lock()
            .retain(|_, reservation| *reservation != Reservation::Installed);
    }

    /// Keep only the installed reservations `present` accepts
    pub fn retain_installed<F>(&self, mut present: F)
    where
        F: FnMut(IpAddr, IpsecProtocol, u32) -> bool,
    {
        self.lock().retain(|&(dst, protocol, spi), reservation| {
            *reservation != Reservation::Installed || present(dst, protocol, spi)
        });
    }

    /// Whether the SPI is reserved for this (destination, protocol)
    pub fn is_reserved(&self, dst: IpAddr, protocol: IpsecProtocol, spi: u32) -> bool {
        self.lock().contains_key(&(dst, protocol, spi))
    }

    /// Number of reservations held
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no reservation is held
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SpiKey, Reservation>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }
}
