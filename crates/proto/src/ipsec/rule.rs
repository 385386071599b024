//! Protect rules
//!
//! A [`ProtectRule`] is one entry of "protect this traffic" intent: which
//! upper-layer traffic between the two IKE peers must be covered, with which
//! IPsec protocol, in which mode. Rules are validated when they are built, so
//! an inconsistent mode/subnet combination never reaches the managers.
//!
//! # Example
//!
//! ```
//! use keel_proto::ipsec::rule::{IpsecProtocol, Mode, ProtectRule};
//! use keel_proto::ipsec::selector::IpProtocol;
//!
//! let rule = ProtectRule::builder()
//!     .with_remote_port(80)
//!     .with_ip_protocol(IpProtocol::Tcp)
//!     .with_ipsec_protocol(IpsecProtocol::Ah)
//!     .with_mode(Mode::Transport)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(rule.remote_port(), 80);
//! assert!(rule.local_subnet().is_none());
//! ```

use super::{error::ValidationError, selector::IpProtocol};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;

/// IPsec protocol applied to protected traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum IpsecProtocol {
    /// Authentication Header (IP protocol 51)
    Ah = 51,
    /// Encapsulating Security Payload (IP protocol 50)
    Esp = 50,
}

impl IpsecProtocol {
    /// Convert from IP protocol number
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            50 => Some(IpsecProtocol::Esp),
            51 => Some(IpsecProtocol::Ah),
            _ => None,
        }
    }

    /// IP protocol number
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IpsecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpsecProtocol::Ah => write!(f, "AH"),
            IpsecProtocol::Esp => write!(f, "ESP"),
        }
    }
}

/// Encapsulation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Mode {
    /// Protect the payload between the two end hosts
    Transport = 0,
    /// Encapsulate whole packets between two gateways
    Tunnel = 1,
}

impl Mode {
    /// Convert from xfrm mode number
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Mode::Transport),
            1 => Some(Mode::Tunnel),
            _ => None,
        }
    }

    /// xfrm mode number
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Transport => write!(f, "transport"),
            Mode::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// One "protect this traffic" entry
///
/// Ports are given from the local host's point of view: `local_port` is the
/// port on this host, `remote_port` the port on the peer. A port of 0 means
/// any port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "ProtectRuleBuilder")
)]
pub struct ProtectRule {
    local_port: u16,
    remote_port: u16,
    ip_protocol: IpProtocol,
    ipsec_protocol: IpsecProtocol,
    mode: Mode,
    local_subnet: Option<IpNet>,
    remote_subnet: Option<IpNet>,
}

impl ProtectRule {
    /// Create builder for a protect rule
    pub fn builder() -> ProtectRuleBuilder {
        ProtectRuleBuilder::new()
    }

    /// Transport-mode rule between the two endpoints
    pub fn transport(
        ipsec_protocol: IpsecProtocol,
        ip_protocol: IpProtocol,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Self, ValidationError> {
        ProtectRule::builder()
            .with_ipsec_protocol(ipsec_protocol)
            .with_ip_protocol(ip_protocol)
            .with_local_port(local_port)
            .with_remote_port(remote_port)
            .with_mode(Mode::Transport)
            .build()
    }

    /// Tunnel-mode rule between two subnets
    pub fn tunnel(
        ipsec_protocol: IpsecProtocol,
        ip_protocol: IpProtocol,
        local_subnet: IpNet,
        remote_subnet: IpNet,
    ) -> Result<Self, ValidationError> {
        ProtectRule::builder()
            .with_ipsec_protocol(ipsec_protocol)
            .with_ip_protocol(ip_protocol)
            .with_local_subnet(local_subnet)
            .with_remote_subnet(remote_subnet)
            .with_mode(Mode::Tunnel)
            .build()
    }

    /// Port on this host (0 = any)
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Port on the peer (0 = any)
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Upper-layer protocol
    pub fn ip_protocol(&self) -> IpProtocol {
        self.ip_protocol
    }

    /// IPsec protocol
    pub fn ipsec_protocol(&self) -> IpsecProtocol {
        self.ipsec_protocol
    }

    /// Encapsulation mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Local protected subnet (tunnel mode)
    pub fn local_subnet(&self) -> Option<IpNet> {
        self.local_subnet
    }

    /// Remote protected subnet (tunnel mode)
    pub fn remote_subnet(&self) -> Option<IpNet> {
        self.remote_subnet
    }

    /// Check the rule against the endpoint pair it will be applied to
    ///
    /// Endpoints must share an address family. A transport rule may only
    /// name subnets that are exactly the endpoint hosts.
    pub fn check_endpoints(&self, local: IpAddr, remote: IpAddr) -> Result<(), ValidationError> {
        if local.is_ipv4() != remote.is_ipv4() {
            return Err(ValidationError::new(format!(
                "endpoint address families differ: {} and {}",
                local, remote
            )));
        }

        if self.mode == Mode::Transport {
            if let Some(subnet) = self.local_subnet {
                if subnet != IpNet::from(local) {
                    return Err(ValidationError::new(format!(
                        "transport rule local subnet {} differs from endpoint {}",
                        subnet, local
                    )));
                }
            }
            if let Some(subnet) = self.remote_subnet {
                if subnet != IpNet::from(remote) {
                    return Err(ValidationError::new(format!(
                        "transport rule remote subnet {} differs from endpoint {}",
                        subnet, remote
                    )));
                }
            }
        }

        Ok(())
    }

    /// Local and remote traffic ranges this rule protects
    ///
    /// Tunnel rules use their subnets; transport rules use the endpoint hosts.
    pub fn traffic_nets(&self, local: IpAddr, remote: IpAddr) -> (IpNet, IpNet) {
        match (self.mode, self.local_subnet, self.remote_subnet) {
            (Mode::Tunnel, Some(local_net), Some(remote_net)) => (local_net, remote_net),
            _ => (IpNet::from(local), IpNet::from(remote)),
        }
    }
}

/// Builder for ProtectRule
#[derive(Debug, Default, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(deny_unknown_fields)
)]
pub struct ProtectRuleBuilder {
    #[cfg_attr(feature = "serde", serde(default))]
    local_port: u16,
    #[cfg_attr(feature = "serde", serde(default))]
    remote_port: u16,
    #[cfg_attr(feature = "serde", serde(default))]
    ip_protocol: Option<IpProtocol>,
    ipsec_protocol: Option<IpsecProtocol>,
    mode: Option<Mode>,
    #[cfg_attr(feature = "serde", serde(default))]
    local_subnet: Option<IpNet>,
    #[cfg_attr(feature = "serde", serde(default))]
    remote_subnet: Option<IpNet>,
}

impl ProtectRuleBuilder {
    /// Create new rule builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set port on this host
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Set port on the peer
    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    /// Set upper-layer protocol (default: any)
    pub fn with_ip_protocol(mut self, protocol: IpProtocol) -> Self {
        self.ip_protocol = Some(protocol);
        self
    }

    /// Set IPsec protocol
    pub fn with_ipsec_protocol(mut self, protocol: IpsecProtocol) -> Self {
        self.ipsec_protocol = Some(protocol);
        self
    }

    /// Set encapsulation mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set local protected subnet
    pub fn with_local_subnet(mut self, subnet: IpNet) -> Self {
        self.local_subnet = Some(subnet);
        self
    }

    /// Set remote protected subnet
    pub fn with_remote_subnet(mut self, subnet: IpNet) -> Self {
        self.remote_subnet = Some(subnet);
        self
    }

    /// Build ProtectRule with validation
    pub fn build(self) -> Result<ProtectRule, ValidationError> {
        let ip_protocol = self.ip_protocol.unwrap_or(IpProtocol::Any);
        let ipsec_protocol = self
            .ipsec_protocol
            .ok_or_else(|| ValidationError::new("ipsec_protocol is required"))?;
        let mode = self
            .mode
            .ok_or_else(|| ValidationError::new("mode is required"))?;

        if (self.local_port != 0 || self.remote_port != 0) && !ip_protocol.is_port_qualified() {
            return Err(ValidationError::new(format!(
                "ports cannot be qualified for protocol {}",
                ip_protocol
            )));
        }

        // Host bits are dropped so 192.168.1.7/24 and 192.168.1.0/24 compare equal
        let local_subnet = self.local_subnet.map(|net| net.trunc());
        let remote_subnet = self.remote_subnet.map(|net| net.trunc());

        match mode {
            Mode::Tunnel => match (local_subnet, remote_subnet) {
                (Some(local), Some(remote)) => {
                    if local.addr().is_ipv4() != remote.addr().is_ipv4() {
                        return Err(ValidationError::new(format!(
                            "tunnel subnets {} and {} have different address families",
                            local, remote
                        )));
                    }
                }
                _ => {
                    return Err(ValidationError::new(
                        "tunnel mode requires local_subnet and remote_subnet",
                    ))
                }
            },
            Mode::Transport => {
                for subnet in local_subnet.iter().chain(remote_subnet.iter()) {
                    if subnet.prefix_len() != subnet.max_prefix_len() {
                        return Err(ValidationError::new(format!(
                            "transport mode cannot protect subnet {}",
                            subnet
                        )));
                    }
                }
            }
        }

        Ok(ProtectRule {
            local_port: self.local_port,
            remote_port: self.remote_port,
            ip_protocol,
            ipsec_protocol,
            mode,
            local_subnet,
            remote_subnet,
        })
    }
}

impl TryFrom<ProtectRuleBuilder> for ProtectRule {
    type Error = ValidationError;

    fn try_from(builder: ProtectRuleBuilder) -> Result<Self, Self::Error> {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_transport_rule_builder() {
        let rule = ProtectRule::builder()
            .with_local_port(0)
            .with_remote_port(80)
            .with_ip_protocol(IpProtocol::Tcp)
            .with_ipsec_protocol(IpsecProtocol::Ah)
            .with_mode(Mode::Transport)
            .build()
            .expect("Failed to build transport rule");

        assert_eq!(rule.local_port(), 0);
        assert_eq!(rule.remote_port(), 80);
        assert_eq!(rule.ip_protocol(), IpProtocol::Tcp);
        assert_eq!(rule.ipsec_protocol(), IpsecProtocol::Ah);
        assert_eq!(rule.mode(), Mode::Transport);
        assert_eq!(rule.local_subnet(), None);
    }

    #[test]
    fn test_tunnel_rule_requires_subnets() {
        let result = ProtectRule::builder()
            .with_ipsec_protocol(IpsecProtocol::Esp)
            .with_mode(Mode::Tunnel)
            .with_local_subnet(net("192.168.1.0/24"))
            .build();
        assert!(result.is_err());

        let rule = ProtectRule::tunnel(
            IpsecProtocol::Esp,
            IpProtocol::Any,
            net("192.168.1.0/24"),
            net("10.0.0.0/8"),
        )
        .expect("Failed to build tunnel rule");
        assert_eq!(rule.local_subnet(), Some(net("192.168.1.0/24")));
        assert_eq!(rule.remote_subnet(), Some(net("10.0.0.0/8")));
    }

    #[test]
    fn test_tunnel_subnets_are_truncated() {
        let rule = ProtectRule::tunnel(
            IpsecProtocol::Esp,
            IpProtocol::Any,
            net("192.168.1.77/24"),
            net("10.1.2.3/8"),
        )
        .unwrap();
        assert_eq!(rule.local_subnet(), Some(net("192.168.1.0/24")));
        assert_eq!(rule.remote_subnet(), Some(net("10.0.0.0/8")));
    }

    #[test]
    fn test_tunnel_subnet_family_mismatch() {
        let result = ProtectRule::tunnel(
            IpsecProtocol::Esp,
            IpProtocol::Any,
            net("192.168.1.0/24"),
            net("2001:db8::/32"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_transport_rejects_real_subnet() {
        let result = ProtectRule::builder()
            .with_ipsec_protocol(IpsecProtocol::Esp)
            .with_mode(Mode::Transport)
            .with_local_subnet(net("192.168.1.0/24"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_ports_require_port_protocol() {
        let result = ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Icmp, 0, 80);
        assert!(result.is_err());

        let result = ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Any, 22, 0);
        assert!(result.is_err());

        assert!(ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Icmp, 0, 0).is_ok());
        assert!(ProtectRule::transport(IpsecProtocol::Esp, IpProtocol::Udp, 500, 500).is_ok());
    }

    #[test]
    fn test_missing_fields() {
        assert!(ProtectRule::builder().with_mode(Mode::Transport).build().is_err());
        assert!(ProtectRule::builder()
            .with_ipsec_protocol(IpsecProtocol::Esp)
            .build()
            .is_err());
    }

    #[test]
    fn test_check_endpoints() {
        let local: IpAddr = "192.168.1.1".parse().unwrap();
        let remote: IpAddr = "192.168.1.2".parse().unwrap();

        let rule = ProtectRule::builder()
            .with_ipsec_protocol(IpsecProtocol::Esp)
            .with_mode(Mode::Transport)
            .with_local_subnet(net("192.168.1.1/32"))
            .build()
            .unwrap();
        assert!(rule.check_endpoints(local, remote).is_ok());
        assert!(rule.check_endpoints(remote, local).is_err());

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(rule.check_endpoints(local, v6).is_err());
    }

    #[test]
    fn test_traffic_nets() {
        let local: IpAddr = "192.168.1.1".parse().unwrap();
        let remote: IpAddr = "192.168.1.2".parse().unwrap();

        let transport = ProtectRule::transport(IpsecProtocol::Ah, IpProtocol::Tcp, 0, 80).unwrap();
        assert_eq!(
            transport.traffic_nets(local, remote),
            (net("192.168.1.1/32"), net("192.168.1.2/32"))
        );

        let tunnel = ProtectRule::tunnel(
            IpsecProtocol::Ah,
            IpProtocol::Tcp,
            net("192.168.1.0/24"),
            net("10.0.0.0/8"),
        )
        .unwrap();
        assert_eq!(
            tunnel.traffic_nets(local, remote),
            (net("192.168.1.0/24"), net("10.0.0.0/8"))
        );
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(IpsecProtocol::Esp.to_u8(), 50);
        assert_eq!(IpsecProtocol::from_u8(51), Some(IpsecProtocol::Ah));
        assert_eq!(IpsecProtocol::from_u8(6), None);
        assert_eq!(Mode::from_u8(1), Some(Mode::Tunnel));
        assert_eq!(Mode::Transport.to_string(), "transport");
    }
}
