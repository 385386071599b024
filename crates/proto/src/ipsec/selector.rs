//! Traffic selectors
//!
//! Two selector shapes are used:
//!
//! - [`TrafficSelector`] describes one side of a flow the way IKEv2 negotiates
//!   it (RFC 7296 Section 3.13.1): an address range, a port range and an
//!   upper-layer protocol.
//! - [`Selector`] is the kernel form attached to policies and associations:
//!   a source and destination prefix, an optional single port for each side
//!   and an upper-layer protocol.
//!
//! ```text
//! TrafficSelector (local)  ─┐
//!                           ├─> Selector { src, dst, src_port, dst_port, proto }
//! TrafficSelector (remote) ─┘
//! ```

use super::error::ValidationError;
use ipnet::{IpNet, Ipv4Subnets, Ipv6Subnets};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Upper-layer protocol carried inside the protected packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IpProtocol {
    /// Any protocol (0)
    Any,
    /// ICMP (1)
    Icmp,
    /// TCP (6)
    Tcp,
    /// UDP (17)
    Udp,
    /// ICMPv6 (58)
    Icmpv6,
    /// SCTP (132)
    Sctp,
    /// UDP-Lite (136)
    UdpLite,
    /// Any other protocol number
    Other(u8),
}

impl IpProtocol {
    /// Convert from IP protocol number
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => IpProtocol::Any,
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            132 => IpProtocol::Sctp,
            136 => IpProtocol::UdpLite,
            other => IpProtocol::Other(other),
        }
    }

    /// IP protocol number
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::Any => 0,
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Sctp => 132,
            IpProtocol::UdpLite => 136,
            IpProtocol::Other(n) => n,
        }
    }

    /// Whether selectors for this protocol may name ports
    pub fn is_port_qualified(self) -> bool {
        matches!(
            self,
            IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Sctp | IpProtocol::UdpLite
        )
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::Any => write!(f, "any"),
            IpProtocol::Icmp => write!(f, "icmp"),
            IpProtocol::Tcp => write!(f, "tcp"),
            IpProtocol::Udp => write!(f, "udp"),
            IpProtocol::Icmpv6 => write!(f, "ipv6-icmp"),
            IpProtocol::Sctp => write!(f, "sctp"),
            IpProtocol::UdpLite => write!(f, "udplite"),
            IpProtocol::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// Traffic Selector Type (RFC 7296 Section 3.13.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TsType {
    /// IPv4 address range
    Ipv4AddrRange = 7,
    /// IPv6 address range
    Ipv6AddrRange = 8,
}

impl TsType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            7 => Some(TsType::Ipv4AddrRange),
            8 => Some(TsType::Ipv6AddrRange),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One side of a negotiated flow
///
/// Immutable once built. A port range of `0..=0` or `0..=65535` means any port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficSelector {
    ts_type: TsType,
    ip_protocol: IpProtocol,
    start_port: u16,
    end_port: u16,
    start_address: IpAddr,
    end_address: IpAddr,
}

impl TrafficSelector {
    /// Create a traffic selector
    ///
    /// # Errors
    ///
    /// Returns an error if the addresses are of different families, the
    /// ranges are inverted, or ports are given for a protocol without ports.
    pub fn new(
        ip_protocol: IpProtocol,
        start_port: u16,
        end_port: u16,
        start_address: IpAddr,
        end_address: IpAddr,
    ) -> Result<Self, ValidationError> {
        let ts_type = match (start_address, end_address) {
            (IpAddr::V4(_), IpAddr::V4(_)) => TsType::Ipv4AddrRange,
            (IpAddr::V6(_), IpAddr::V6(_)) => TsType::Ipv6AddrRange,
            _ => {
                return Err(ValidationError::new(format!(
                    "selector range {} - {} mixes address families",
                    start_address, end_address
                )))
            }
        };

        if start_address > end_address {
            return Err(ValidationError::new(format!(
                "selector range {} - {} is inverted",
                start_address, end_address
            )));
        }

        if start_port > end_port {
            return Err(ValidationError::new(format!(
                "selector port range {}-{} is inverted",
                start_port, end_port
            )));
        }

        let selector = TrafficSelector {
            ts_type,
            ip_protocol,
            start_port,
            end_port,
            start_address,
            end_address,
        };

        if !selector.is_any_port() && !ip_protocol.is_port_qualified() {
            return Err(ValidationError::new(format!(
                "ports cannot be qualified for protocol {}",
                ip_protocol
            )));
        }

        Ok(selector)
    }

    /// Selector for a single host and port (0 = any port)
    pub fn host(address: IpAddr, ip_protocol: IpProtocol, port: u16) -> Result<Self, ValidationError> {
        TrafficSelector::new(ip_protocol, port, port, address, address)
    }

    /// Selector covering a whole prefix and port (0 = any port)
    pub fn from_net(net: IpNet, ip_protocol: IpProtocol, port: u16) -> Result<Self, ValidationError> {
        TrafficSelector::new(ip_protocol, port, port, net.network(), net.broadcast())
    }

    /// Selector matching all IPv4 traffic
    pub fn ipv4_any() -> Self {
        TrafficSelector {
            ts_type: TsType::Ipv4AddrRange,
            ip_protocol: IpProtocol::Any,
            start_port: 0,
            end_port: u16::MAX,
            start_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            end_address: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }

    /// Selector type
    pub fn ts_type(&self) -> TsType {
        self.ts_type
    }

    /// Upper-layer protocol
    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }

    /// First port of the range
    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    /// Last port of the range
    pub fn end_port(&self) -> u16 {
        self.end_port
    }

    /// First address of the range
    pub fn start_address(&self) -> IpAddr {
        self.start_address
    }

    /// Last address of the range
    pub fn end_address(&self) -> IpAddr {
        self.end_address
    }

    /// Whether the selector names exactly one address
    pub fn is_exact(&self) -> bool {
        self.start_address == self.end_address
    }

    /// Whether the selector matches any port
    pub fn is_any_port(&self) -> bool {
        self.start_port == 0 && (self.end_port == 0 || self.end_port == u16::MAX)
    }

    /// Single port of this selector, `None` when it matches any port
    ///
    /// # Errors
    ///
    /// Kernel selectors carry one port per side, so a true port range
    /// cannot be expressed.
    pub fn port(&self) -> Result<Option<u16>, ValidationError> {
        if self.is_any_port() {
            Ok(None)
        } else if self.start_port == self.end_port {
            Ok(Some(self.start_port))
        } else {
            Err(ValidationError::new(format!(
                "port range {}-{} is not a single port",
                self.start_port, self.end_port
            )))
        }
    }

    /// Prefix equal to this selector's address range
    ///
    /// # Errors
    ///
    /// Returns an error if the range is not exactly one CIDR block.
    pub fn to_net(&self) -> Result<IpNet, ValidationError> {
        let net = match (self.start_address, self.end_address) {
            (IpAddr::V4(start), IpAddr::V4(end)) => {
                single(Ipv4Subnets::new(start, end, 0).map(IpNet::V4))
            }
            (IpAddr::V6(start), IpAddr::V6(end)) => {
                single(Ipv6Subnets::new(start, end, 0).map(IpNet::V6))
            }
            _ => None,
        };

        net.ok_or_else(|| {
            ValidationError::new(format!(
                "range {} - {} is not a single prefix",
                self.start_address, self.end_address
            ))
        })
    }
}

fn single(mut subnets: impl Iterator<Item = IpNet>) -> Option<IpNet> {
    match (subnets.next(), subnets.next()) {
        (Some(net), None) => Some(net),
        _ => None,
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}[{}-{}]/{}",
            self.start_address, self.end_address, self.start_port, self.end_port, self.ip_protocol
        )
    }
}

/// Kernel selector attached to policies and associations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    src: IpNet,
    dst: IpNet,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    ip_protocol: IpProtocol,
}

impl Selector {
    /// Create a kernel selector
    ///
    /// Prefixes are truncated to their network address. A port of `Some(0)`
    /// is treated as any port.
    pub fn new(
        src: IpNet,
        dst: IpNet,
        src_port: Option<u16>,
        dst_port: Option<u16>,
        ip_protocol: IpProtocol,
    ) -> Result<Self, ValidationError> {
        if src.addr().is_ipv4() != dst.addr().is_ipv4() {
            return Err(ValidationError::new(format!(
                "selector {} -> {} mixes address families",
                src, dst
            )));
        }

        let src_port = src_port.filter(|port| *port != 0);
        let dst_port = dst_port.filter(|port| *port != 0);

        if (src_port.is_some() || dst_port.is_some()) && !ip_protocol.is_port_qualified() {
            return Err(ValidationError::new(format!(
                "ports cannot be qualified for protocol {}",
                ip_protocol
            )));
        }

        Ok(Selector {
            src: src.trunc(),
            dst: dst.trunc(),
            src_port,
            dst_port,
            ip_protocol,
        })
    }

    /// Build a kernel selector from the two sides of a negotiated flow
    ///
    /// When only one side names a protocol, that protocol is used.
    pub fn from_traffic_selectors(
        src: &TrafficSelector,
        dst: &TrafficSelector,
    ) -> Result<Self, ValidationError> {
        let ip_protocol = match (src.ip_protocol(), dst.ip_protocol()) {
            (a, b) if a == b => a,
            (IpProtocol::Any, other) | (other, IpProtocol::Any) => other,
            (a, b) => {
                return Err(ValidationError::new(format!(
                    "selector protocols disagree: {} and {}",
                    a, b
                )))
            }
        };

        Selector::new(src.to_net()?, dst.to_net()?, src.port()?, dst.port()?, ip_protocol)
    }

    /// Source prefix
    pub fn src(&self) -> IpNet {
        self.src
    }

    /// Destination prefix
    pub fn dst(&self) -> IpNet {
        self.dst
    }

    /// Source port (`None` = any)
    pub fn src_port(&self) -> Option<u16> {
        self.src_port
    }

    /// Destination port (`None` = any)
    pub fn dst_port(&self) -> Option<u16> {
        self.dst_port
    }

    /// Upper-layer protocol
    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }

    /// Whether this is an IPv4 selector
    pub fn is_ipv4(&self) -> bool {
        self.src.addr().is_ipv4()
    }

    /// Same selector seen from the other direction
    pub fn reversed(&self) -> Selector {
        Selector {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ip_protocol: self.ip_protocol,
        }
    }

    /// Whether every packet matching `other` also matches `self`
    pub fn contains(&self, other: &Selector) -> bool {
        fn port_covers(outer: Option<u16>, inner: Option<u16>) -> bool {
            outer.is_none() || outer == inner
        }

        self.src.contains(&other.src)
            && self.dst.contains(&other.dst)
            && port_covers(self.src_port, other.src_port)
            && port_covers(self.dst_port, other.dst_port)
            && (self.ip_protocol == IpProtocol::Any || self.ip_protocol == other.ip_protocol)
    }

    /// How narrow the selector is; larger means more specific
    pub fn specificity(&self) -> u32 {
        let mut score = u32::from(self.src.prefix_len()) + u32::from(self.dst.prefix_len());
        score += u32::from(self.src_port.is_some()) + u32::from(self.dst_port.is_some());
        score += u32::from(self.ip_protocol != IpProtocol::Any);
        score
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn port(p: Option<u16>) -> String {
            p.map_or_else(|| "any".to_string(), |p| p.to_string())
        }

        write!(
            f,
            "{}[{}] -> {}[{}] proto {}",
            self.src,
            port(self.src_port),
            self.dst,
            port(self.dst_port),
            self.ip_protocol
        )
    }
}
