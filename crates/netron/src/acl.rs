//! IP allow/deny lists for gates.
//!
//! Entries are single addresses or CIDR subnets, IPv4 or IPv6. Every address
//! is compared as a 128-bit value: IPv4 is mapped into `::ffff:0:0/96`, so an
//! IPv4 entry also matches the same client seen through a dual-stack socket.

use netron_types::config::IpPolicyKind;
use netron_types::{NetronError, NetronResult};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

/// Map an address into the 128-bit comparison space.
pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// A subnet in the 128-bit comparison space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: u128,
    prefix: u8,
}

impl Subnet {
    fn mask(prefix: u8) -> u128 {
        if prefix == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(prefix))
        }
    }

    /// Whether `ip` falls inside this subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip_to_u128(ip) & Self::mask(self.prefix) == self.network
    }

    /// Prefix length in the 128-bit space.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }
}

impl FromStr for Subnet {
    type Err = NetronError;

    fn from_str(s: &str) -> NetronResult<Self> {
        let entry = s.trim();
        let invalid = || NetronError::NotValid(format!("invalid IP or subnet '{entry}'"));

        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits.parse::<u8>().map_err(|_| invalid())?)),
            None => (entry, None),
        };
        let ip: IpAddr = addr.parse().map_err(|_| invalid())?;

        let prefix = match (ip, prefix) {
            (IpAddr::V4(_), Some(bits)) if bits <= 32 => 96 + bits,
            (IpAddr::V6(_), Some(bits)) if bits <= 128 => bits,
            (_, Some(_)) => return Err(invalid()),
            (_, None) => 128,
        };

        Ok(Self {
            network: ip_to_u128(ip) & Self::mask(prefix),
            prefix,
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v6 = Ipv6Addr::from(self.network);
        match v6.to_ipv4_mapped() {
            Some(v4) if self.prefix >= 96 => write!(f, "{}/{}", v4, self.prefix - 96),
            _ => write!(f, "{}/{}", v6, self.prefix),
        }
    }
}

/// A compiled gate admission policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IpPolicy {
    /// Admit everyone.
    #[default]
    None,
    /// Admit only listed addresses.
    Allow(Vec<Subnet>),
    /// Admit everyone except listed addresses.
    Deny(Vec<Subnet>),
}

impl IpPolicy {
    /// Compile a policy from configuration. Any malformed entry is `NotValid`.
    pub fn compile(kind: IpPolicyKind, entries: &[String]) -> NetronResult<Self> {
        let subnets = entries
            .iter()
            .map(|e| e.parse::<Subnet>())
            .collect::<NetronResult<Vec<_>>>()?;
        Ok(match kind {
            IpPolicyKind::None => IpPolicy::None,
            IpPolicyKind::Allow => IpPolicy::Allow(subnets),
            IpPolicyKind::Deny => IpPolicy::Deny(subnets),
        })
    }

    /// The policy kind.
    pub fn kind(&self) -> IpPolicyKind {
        match self {
            IpPolicy::None => IpPolicyKind::None,
            IpPolicy::Allow(_) => IpPolicyKind::Allow,
            IpPolicy::Deny(_) => IpPolicyKind::Deny,
        }
    }

    /// Whether a connection from `ip` is admitted.
    ///
    /// Transports without an IP address pass `None`: they are refused by an
    /// allow list and admitted by a deny list.
    pub fn permits(&self, ip: Option<IpAddr>) -> bool {
        match (self, ip) {
            (IpPolicy::None, _) => true,
            (IpPolicy::Allow(list), Some(ip)) => list.iter().any(|s| s.contains(ip)),
            (IpPolicy::Allow(_), None) => false,
            (IpPolicy::Deny(list), Some(ip)) => !list.iter().any(|s| s.contains(ip)),
            (IpPolicy::Deny(_), None) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK_V4: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv4_maps_into_v6_space() {
        assert_eq!(
            ip_to_u128(ip("127.0.0.1")),
            ip_to_u128(ip("::ffff:127.0.0.1"))
        );
        assert_ne!(ip_to_u128(ip("127.0.0.1")), ip_to_u128(ip("::1")));
    }

    #[test]
    fn test_subnet_parse_and_contains() {
        let net: Subnet = "10.1.0.0/16".parse().unwrap();
        assert_eq!(net.prefix(), 112);
        assert!(net.contains(ip("10.1.200.3")));
        assert!(net.contains(ip("::ffff:10.1.0.9")));
        assert!(!net.contains(ip("10.2.0.1")));
        assert_eq!(net.to_string(), "10.1.0.0/16");

        let host: Subnet = "192.168.1.5".parse().unwrap();
        assert!(host.contains(ip("192.168.1.5")));
        assert!(!host.contains(ip("192.168.1.6")));

        let v6: Subnet = "fe80::/10".parse().unwrap();
        assert!(v6.contains(ip("fe80::1")));
        assert!(!v6.contains(ip("::1")));
    }

    #[test]
    fn test_network_is_normalized() {
        let a: Subnet = "10.1.2.3/8".parse().unwrap();
        let b: Subnet = "10.0.0.0/8".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_entries() {
        for bad in ["", "nope", "10.0.0.1/33", "::1/129", "10.0.0.0/x", "300.1.1.1"] {
            let err = bad.parse::<Subnet>().unwrap_err();
            assert!(matches!(err, NetronError::NotValid(_)), "{bad}");
        }
        let err = IpPolicy::compile(IpPolicyKind::Deny, &["1.2.3.4".into(), "bad".into()]);
        assert!(matches!(err, Err(NetronError::NotValid(_))));
    }

    #[test]
    fn test_policy_permits() {
        let list = vec!["127.0.0.1".to_string()];

        let none = IpPolicy::compile(IpPolicyKind::None, &list).unwrap();
        assert!(none.permits(Some(LOOPBACK_V4)));
        assert!(none.permits(None));

        let allow = IpPolicy::compile(IpPolicyKind::Allow, &list).unwrap();
        assert!(allow.permits(Some(LOOPBACK_V4)));
        assert!(!allow.permits(Some(ip("10.0.0.1"))));
        assert!(!allow.permits(None));

        let deny = IpPolicy::compile(IpPolicyKind::Deny, &list).unwrap();
        assert!(!deny.permits(Some(LOOPBACK_V4)));
        assert!(deny.permits(Some(ip("10.0.0.1"))));
        assert!(deny.permits(None));
        assert_eq!(deny.kind(), IpPolicyKind::Deny);
    }
}
