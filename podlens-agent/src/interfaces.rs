//! Interface classification lookups for admission and direction decisions
//!
//! The table maps interface indexes to their kind, IPv4 addresses to the
//! interface that owns them, and carries the CNI overlay subnet. It is built
//! once from an [`InterfaceSource`] and never mutated afterwards; analyzers
//! share it behind an `Arc`.

use crate::config::InterfaceConfig;
use crate::error::{AgentError, Result};
use ahash::AHashMap;
use ip_network::Ipv4Network;
use log::{debug, info};
use podlens_common::{packet_type, TcpTuple};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Classification of a network interface on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Host side of a workload's veth pair (veth*, cali*)
    Container,
    /// Physical NIC (en*, eth*)
    Physical,
    /// Network fabric device (cni0, flannel.*)
    NetworkDevice,
}

impl InterfaceKind {
    /// Classify an interface by its name. Loopback is never classified.
    pub fn from_name(name: &str) -> Option<Self> {
        if name == "lo" {
            None
        } else if name.starts_with("veth") || name.starts_with("cali") {
            Some(Self::Container)
        } else if name.starts_with("en") || name.starts_with("eth") {
            Some(Self::Physical)
        } else if name.starts_with("cni0") || name.starts_with("flannel") {
            Some(Self::NetworkDevice)
        } else {
            None
        }
    }
}

/// Which way a packet travels relative to the local workload side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Out of the local side (the local endpoint is the source)
    Sent,
    /// Into the local side (the local endpoint is the destination)
    Received,
}

impl Direction {
    /// Wire value of `direction_type`: 1 for sent, 0 for received
    pub fn as_i32(self) -> i32 {
        match self {
            Direction::Sent => 1,
            Direction::Received => 0,
        }
    }
}

/// One enumerated interface
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub ifindex: u32,
    pub addrs: Vec<Ipv4Addr>,
}

/// The overlay network managed by the cluster's network plugin
#[derive(Debug, Clone, Copy)]
pub struct CniSubnet {
    pub ifindex: u32,
    pub network: Ipv4Network,
}

impl CniSubnet {
    pub fn parse(cidr: &str, ifindex: u32) -> Result<Self> {
        let network = Ipv4Network::from_str(cidr).map_err(|e| AgentError::InvalidSubnet {
            subnet: cidr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { ifindex, network })
    }

    pub fn contains(&self, ip: u32) -> bool {
        self.network.contains(Ipv4Addr::from(ip))
    }
}

/// Enumerates the node's interfaces
///
/// Implemented by the interface/route enumeration collaborator; the static
/// [`InterfaceConfig`] implementation serves replays and tests.
pub trait InterfaceSource {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>>;

    fn cni_subnet(&self) -> Result<Option<CniSubnet>>;
}

impl InterfaceSource for InterfaceConfig {
    fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
        Ok(self
            .devices
            .iter()
            .map(|d| InterfaceInfo {
                name: d.name.clone(),
                ifindex: d.ifindex,
                addrs: d.addrs.clone(),
            })
            .collect())
    }

    fn cni_subnet(&self) -> Result<Option<CniSubnet>> {
        match &self.cni_subnet {
            Some(cidr) => {
                let ifindex = self.cni_ifindex.unwrap_or(0);
                CniSubnet::parse(cidr, ifindex).map(Some)
            }
            None => Ok(None),
        }
    }
}

/// Read-only interface classification table
#[derive(Debug, Default)]
pub struct InterfaceTable {
    kinds: AHashMap<u32, InterfaceKind>,
    owners: AHashMap<u32, u32>,
    cni: Option<CniSubnet>,
}

impl InterfaceTable {
    /// Build the table from an enumeration source
    ///
    /// Any enumeration failure is returned before the table exists, so a
    /// caller never sees a partially populated table.
    pub fn build(source: &dyn InterfaceSource) -> Result<Self> {
        let interfaces = source.interfaces()?;
        let cni = source.cni_subnet()?;

        let mut kinds = AHashMap::new();
        let mut owners = AHashMap::new();

        for iface in &interfaces {
            if iface.name == "lo" {
                continue;
            }
            match InterfaceKind::from_name(&iface.name) {
                Some(kind) => {
                    kinds.insert(iface.ifindex, kind);
                }
                None => debug!("Interface {} left unclassified", iface.name),
            }
            for addr in &iface.addrs {
                owners.insert(u32::from(*addr), iface.ifindex);
            }
        }

        info!(
            "Interface table built: {} classified interfaces, {} owned addresses, cni subnet {}",
            kinds.len(),
            owners.len(),
            cni.map(|c| c.network.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            kinds,
            owners,
            cni,
        })
    }

    pub fn kind(&self, ifindex: u32) -> Option<InterfaceKind> {
        self.kinds.get(&ifindex).copied()
    }

    /// Whether packets captured on `ifindex` are workload traffic
    pub fn is_container(&self, ifindex: u32) -> bool {
        self.kind(ifindex) == Some(InterfaceKind::Container)
    }

    /// Interface index owning `ip`, if it is a local address
    pub fn owner_of(&self, ip: u32) -> Option<u32> {
        self.owners.get(&ip).copied()
    }

    pub fn in_cni(&self, ip: u32) -> bool {
        self.cni.map(|c| c.contains(ip)).unwrap_or(false)
    }

    pub fn cni_subnet(&self) -> Option<CniSubnet> {
        self.cni
    }

    /// Resolve the direction of a tuple relative to the local side
    ///
    /// Address ownership decides first, then CNI membership, then the
    /// capture's packet type hint. A veth captures from the host side, so a
    /// `RECEIVE` there was sent by the container. With nothing to go on the
    /// packet counts as received.
    pub fn direction(&self, tuple: &TcpTuple, hint: u8) -> Direction {
        let src_owned = self.owner_of(tuple.saddr).is_some();
        let dst_owned = self.owner_of(tuple.daddr).is_some();
        if src_owned != dst_owned {
            return if src_owned {
                Direction::Sent
            } else {
                Direction::Received
            };
        }

        let src_cni = self.in_cni(tuple.saddr);
        let dst_cni = self.in_cni(tuple.daddr);
        if src_cni != dst_cni {
            return if src_cni {
                Direction::Sent
            } else {
                Direction::Received
            };
        }

        match hint {
            packet_type::RECEIVE => Direction::Sent,
            _ => Direction::Received,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::InterfaceDecl;

    pub(crate) const VETH: u32 = 9;
    pub(crate) const ETH: u32 = 2;

    pub(crate) fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from(Ipv4Addr::new(a, b, c, d))
    }

    /// eth0 owns 192.168.1.10, veth9 fronts pod 10.244.1.5, overlay 10.244.0.0/16
    pub(crate) fn test_table() -> InterfaceTable {
        let config = InterfaceConfig {
            devices: vec![
                InterfaceDecl {
                    name: "lo".to_string(),
                    ifindex: 1,
                    addrs: vec![Ipv4Addr::LOCALHOST],
                },
                InterfaceDecl {
                    name: "eth0".to_string(),
                    ifindex: ETH,
                    addrs: vec![Ipv4Addr::new(192, 168, 1, 10)],
                },
                InterfaceDecl {
                    name: "cni0".to_string(),
                    ifindex: 3,
                    addrs: vec![Ipv4Addr::new(10, 244, 1, 1)],
                },
                InterfaceDecl {
                    name: "veth9a1b".to_string(),
                    ifindex: VETH,
                    addrs: vec![Ipv4Addr::new(10, 244, 1, 5)],
                },
            ],
            cni_subnet: Some("10.244.0.0/16".to_string()),
            cni_ifindex: Some(3),
        };
        InterfaceTable::build(&config).expect("table builds")
    }

    struct FailingSource;

    impl InterfaceSource for FailingSource {
        fn interfaces(&self) -> Result<Vec<InterfaceInfo>> {
            Err(AgentError::InterfaceEnumeration(
                "getifaddrs failed".to_string(),
            ))
        }

        fn cni_subnet(&self) -> Result<Option<CniSubnet>> {
            Ok(None)
        }
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(InterfaceKind::from_name("veth1234"), Some(InterfaceKind::Container));
        assert_eq!(InterfaceKind::from_name("cali0ef"), Some(InterfaceKind::Container));
        assert_eq!(InterfaceKind::from_name("ens192"), Some(InterfaceKind::Physical));
        assert_eq!(InterfaceKind::from_name("eth0"), Some(InterfaceKind::Physical));
        assert_eq!(InterfaceKind::from_name("cni0"), Some(InterfaceKind::NetworkDevice));
        assert_eq!(
            InterfaceKind::from_name("flannel.1"),
            Some(InterfaceKind::NetworkDevice)
        );
        assert_eq!(InterfaceKind::from_name("lo"), None);
        assert_eq!(InterfaceKind::from_name("docker0"), None);
    }

    #[test]
    fn test_table_lookups() {
        let table = test_table();

        assert!(table.is_container(VETH));
        assert!(!table.is_container(ETH));
        assert!(!table.is_container(404));
        assert_eq!(table.owner_of(ip(192, 168, 1, 10)), Some(ETH));
        assert_eq!(table.owner_of(ip(127, 0, 0, 1)), None);
        assert!(table.in_cni(ip(10, 244, 7, 7)));
        assert!(!table.in_cni(ip(10, 96, 0, 1)));

        let cni = table.cni_subnet().expect("overlay declared");
        assert_eq!(cni.ifindex, 3);
        assert_eq!(cni.network.netmask(), 16);
    }

    #[test]
    fn test_build_fails_without_partial_table() {
        let result = InterfaceTable::build(&FailingSource);
        assert!(matches!(result, Err(AgentError::InterfaceEnumeration(_))));
    }

    #[test]
    fn test_invalid_subnet_rejected() {
        let config = InterfaceConfig {
            devices: vec![],
            cni_subnet: Some("10.244.0.0/99".to_string()),
            cni_ifindex: None,
        };
        let result = InterfaceTable::build(&config);
        assert!(matches!(result, Err(AgentError::InvalidSubnet { .. })));
    }

    #[test]
    fn test_direction_by_ownership() {
        let table = test_table();
        let outbound = TcpTuple {
            saddr: ip(10, 244, 1, 5),
            daddr: ip(10, 96, 0, 10),
            sport: 40000,
            dport: 80,
            ifindex: VETH,
        };

        assert_eq!(table.direction(&outbound, packet_type::UNKNOWN), Direction::Sent);
        assert_eq!(
            table.direction(&outbound.reverse(), packet_type::UNKNOWN),
            Direction::Received
        );
    }

    #[test]
    fn test_direction_falls_back_to_cni_then_hint() {
        let table = test_table();
        // neither endpoint owned; only the source is inside the overlay
        let by_cni = TcpTuple {
            saddr: ip(10, 244, 2, 8),
            daddr: ip(172, 16, 0, 4),
            sport: 5000,
            dport: 443,
            ifindex: VETH,
        };
        assert_eq!(table.direction(&by_cni, packet_type::UNKNOWN), Direction::Sent);

        // both endpoints inside the overlay and unowned: only the hint is left
        let ambiguous = TcpTuple {
            saddr: ip(10, 244, 2, 8),
            daddr: ip(10, 244, 3, 9),
            sport: 5000,
            dport: 443,
            ifindex: VETH,
        };
        assert_eq!(table.direction(&ambiguous, packet_type::RECEIVE), Direction::Sent);
        assert_eq!(table.direction(&ambiguous, packet_type::SEND), Direction::Received);
        assert_eq!(
            table.direction(&ambiguous, packet_type::UNKNOWN),
            Direction::Received
        );
    }
}
