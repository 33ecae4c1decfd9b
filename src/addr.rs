//! uTP addressing
//!
//! Translates between host-level addresses (`host:port`, `[host%zone]:port`)
//! and the native socket addresses handed to the engine. IPv6 zones are kept
//! by interface name and mapped to numeric scope ids at the engine boundary.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::sync::OnceLock;

use socket2::SockAddr;
use tracing::trace;

use crate::error::{Result, UtpError};

/// Network name reported by every uTP address
pub const NETWORK: &str = "utp";

/// Text used for a missing address
pub const NIL_ADDR: &str = "<nil>";

// Bigger than any scope id we expect, small enough to never overflow.
const MAX_DECIMAL_ZONE: u32 = 0xFF_FFFF;

/// Address family of a uTP endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Network label accepted by [`resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// `"utp"` or `""`: either family, IPv4 preferred
    Utp,
    /// `"utp4"`: IPv4 only
    Utp4,
    /// `"utp6"`: IPv6 only
    Utp6,
}

impl Network {
    /// Parse a network label
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "" | "utp" => Ok(Network::Utp),
            "utp4" => Ok(Network::Utp4),
            "utp6" => Ok(Network::Utp6),
            other => Err(UtpError::UnknownNetwork(other.to_string())),
        }
    }

    fn admits(self, ip: &IpAddr) -> bool {
        match self {
            Network::Utp => true,
            Network::Utp4 => is_four_byte(ip),
            Network::Utp6 => ip.is_ipv6(),
        }
    }
}

/// Address of a uTP end point
///
/// An unset `ip` is the wildcard address of whichever family the caller
/// needs. The zone only carries meaning for scoped IPv6 addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UtpAddr {
    ip: Option<IpAddr>,
    port: u16,
    zone: String,
}

impl UtpAddr {
    /// Create an address from an IP and port
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: Some(ip),
            port,
            zone: String::new(),
        }
    }

    /// Address with no IP: the wildcard of the requested family
    pub fn unspecified(port: u16) -> Self {
        Self {
            ip: None,
            port,
            zone: String::new(),
        }
    }

    /// Attach an IPv6 zone (interface name or decimal index)
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// Same address on another port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// IP address, if set
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// IPv6 zone, empty when unscoped
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Network name, always `"utp"`
    pub fn network(&self) -> &'static str {
        NETWORK
    }

    /// Family this address belongs to
    ///
    /// Unset addresses and addresses that reduce to four bytes (including
    /// IPv4-mapped IPv6) are IPv4.
    pub fn family(&self) -> Family {
        match self.ip {
            Some(ip) if !is_four_byte(&ip) => Family::V6,
            _ => Family::V4,
        }
    }

    /// True when the address is unset or unspecified
    pub fn is_wildcard(&self) -> bool {
        self.ip.as_ref().map_or(true, is_unspecified)
    }

    /// Native socket address for the engine
    ///
    /// The structure follows the stored IP's width: 4-byte addresses and the
    /// unset address produce `sockaddr_in`, 16-byte addresses `sockaddr_in6`.
    pub fn to_engine_sockaddr(&self) -> Result<SockAddr> {
        let family = match self.ip {
            Some(IpAddr::V6(_)) => Family::V6,
            _ => Family::V4,
        };
        self.to_engine_sockaddr_for(family)
    }

    /// Native socket address for a socket of the given family
    pub fn to_engine_sockaddr_for(&self, family: Family) -> Result<SockAddr> {
        Ok(SockAddr::from(self.to_socket_addr_for(family)?))
    }

    /// Std socket address for a socket of the given family
    pub fn to_socket_addr_for(&self, family: Family) -> Result<SocketAddr> {
        ip_to_socket_addr(family, self.ip, self.port, &self.zone)
    }

    /// Inverse of [`UtpAddr::to_engine_sockaddr`]
    ///
    /// Returns `None` for non-IP socket addresses.
    pub fn from_engine_sockaddr(sockaddr: &SockAddr) -> Option<Self> {
        sockaddr.as_socket().map(Self::from)
    }
}

impl From<SocketAddr> for UtpAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(IpAddr::V4(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => {
                Self::new(IpAddr::V6(*v6.ip()), v6.port()).with_zone(zone_to_string(v6.scope_id()))
            }
        }
    }
}

impl fmt::Display for UtpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut host = self.ip.map(ip_string).unwrap_or_default();
        if !self.zone.is_empty() {
            host.push('%');
            host.push_str(&self.zone);
        }
        if host.contains(':') {
            write!(f, "[{}]:{}", host, self.port)
        } else {
            write!(f, "{}:{}", host, self.port)
        }
    }
}

/// Format an optional address, using `<nil>` when absent
pub fn display_opt(addr: Option<&UtpAddr>) -> String {
    addr.map_or_else(|| NIL_ADDR.to_string(), ToString::to_string)
}

/// Resolve `host:port` or `[ipv6-host%zone]:port` on a uTP network
///
/// Host names go through the system resolver, restricted to the family the
/// network label implies. Literal IPv6 hosts must be bracketed. The port may
/// be a number, a service name such as `http`, or empty for port 0.
pub fn resolve(network: &str, address: &str) -> Result<UtpAddr> {
    let network = Network::parse(network)?;
    let (host, port) = split_host_port(address)?;
    let port = parse_port(port, address)?;

    let (host, zone) = match host.split_once('%') {
        Some((host, zone)) => (host, zone),
        None => (host, ""),
    };

    if host.is_empty() {
        return Ok(UtpAddr::unspecified(port).with_zone(zone));
    }

    let ip = match host.parse::<IpAddr>() {
        Ok(ip) if network.admits(&ip) => ip,
        Ok(_) => {
            return Err(UtpError::Resolution {
                address: address.to_string(),
                reason: "no suitable address for network".into(),
            })
        }
        Err(_) => lookup_host(network, host, address)?,
    };

    trace!("Resolved {} to {} port {}", address, ip, port);
    Ok(UtpAddr::new(ip, port).with_zone(zone))
}

fn lookup_host(network: Network, host: &str, address: &str) -> Result<IpAddr> {
    let candidates: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| UtpError::Resolution {
            address: address.to_string(),
            reason: e.to_string(),
        })?
        .map(|sa| sa.ip())
        .filter(|ip| network.admits(ip))
        .collect();

    let preferred = match network {
        Network::Utp => candidates.iter().find(|ip| ip.is_ipv4()).or(candidates.first()),
        _ => candidates.first(),
    };

    preferred.copied().ok_or_else(|| UtpError::Resolution {
        address: address.to_string(),
        reason: "no suitable address found".into(),
    })
}

fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let fail = |reason: &str| UtpError::Resolution {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| fail("missing ']' in address"))?;
        let port = tail.strip_prefix(':').ok_or_else(|| fail("missing port in address"))?;
        Ok((host, port))
    } else {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| fail("missing port in address"))?;
        if host.contains(':') {
            return Err(fail("too many colons in address"));
        }
        Ok((host, port))
    }
}

fn parse_port(port: &str, address: &str) -> Result<u16> {
    if port.is_empty() {
        return Ok(0);
    }
    if port.bytes().all(|b| b.is_ascii_digit()) {
        return port.parse::<u16>().map_err(|_| UtpError::Resolution {
            address: address.to_string(),
            reason: format!("invalid port {port:?}"),
        });
    }
    service_port(port).ok_or_else(|| UtpError::Resolution {
        address: address.to_string(),
        reason: format!("unknown port {port:?}"),
    })
}

const SERVICES_PATH: &str = "/etc/services";

// Used when the services database is missing or lacks the entry.
const WELL_KNOWN_SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("bootps", 67),
    ("bootpc", 68),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap2", 143),
    ("snmp", 161),
    ("https", 443),
    ("imaps", 993),
    ("pop3s", 995),
];

/// Port for a service name, case-insensitive
///
/// UDP entries of the services database win over entries for other
/// protocols, which win over the built-in table.
pub fn service_port(name: &str) -> Option<u16> {
    let name = name.to_ascii_lowercase();
    let db = services();
    db.udp
        .get(&name)
        .or_else(|| db.other.get(&name))
        .copied()
        .or_else(|| WELL_KNOWN_SERVICES.iter().find(|(n, _)| *n == name).map(|(_, p)| *p))
}

#[derive(Default)]
struct ServiceDb {
    udp: HashMap<String, u16>,
    other: HashMap<String, u16>,
}

fn services() -> &'static ServiceDb {
    static DB: OnceLock<ServiceDb> = OnceLock::new();
    DB.get_or_init(|| match std::fs::read_to_string(SERVICES_PATH) {
        Ok(text) => parse_services(&text),
        Err(e) => {
            trace!("No services database at {}: {}", SERVICES_PATH, e);
            ServiceDb::default()
        }
    })
}

// `name port/proto [aliases...] [# comment]`
fn parse_services(text: &str) -> ServiceDb {
    let mut db = ServiceDb::default();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        let table = if proto.eq_ignore_ascii_case("udp") { &mut db.udp } else { &mut db.other };
        for alias in std::iter::once(name).chain(fields) {
            table.entry(alias.to_ascii_lowercase()).or_insert(port);
        }
    }
    db
}

/// Build the socket address for `family`, substituting wildcards
///
/// IPv4 callers use `0.0.0.0` to mean "any address". An IPv6 socket refuses
/// to bind that, so it is rewritten to `::` for the IPv6 family.
pub fn ip_to_socket_addr(family: Family, ip: Option<IpAddr>, port: u16, zone: &str) -> Result<SocketAddr> {
    match family {
        Family::V4 => {
            let v4 = match ip {
                None => Ipv4Addr::UNSPECIFIED,
                Some(IpAddr::V4(v4)) => v4,
                Some(IpAddr::V6(v6)) => v6
                    .to_ipv4_mapped()
                    .ok_or_else(|| UtpError::InvalidAddress("non-IPv4 address".into()))?,
            };
            Ok(SocketAddr::V4(SocketAddrV4::new(v4, port)))
        }
        Family::V6 => {
            let v6 = match ip {
                None => Ipv6Addr::UNSPECIFIED,
                Some(ip) if is_ipv4_zero(&ip) => Ipv6Addr::UNSPECIFIED,
                Some(IpAddr::V4(v4)) => v4.to_ipv6_mapped(),
                Some(IpAddr::V6(v6)) => v6,
            };
            Ok(SocketAddr::V6(SocketAddrV6::new(v6, port, 0, zone_to_index(zone))))
        }
    }
}

fn is_four_byte(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => true,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
    }
}

fn is_ipv4_zero(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some_and(|v4| v4.is_unspecified()),
    }
}

fn is_unspecified(ip: &IpAddr) -> bool {
    ip.is_unspecified() || is_ipv4_zero(ip)
}

// Four-byte addresses, mapped ones included, print dotted.
fn ip_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}

/// Scope id for a zone: interface index, else the zone read as decimal, else 0
pub fn zone_to_index(zone: &str) -> u32 {
    if zone.is_empty() {
        return 0;
    }
    if let Some(index) = interface_index(zone) {
        return index;
    }
    leading_decimal(zone).unwrap_or(0)
}

/// Zone for a scope id: interface name, else the id in decimal
pub fn zone_to_string(index: u32) -> String {
    if index == 0 {
        return String::new();
    }
    interface_name(index).unwrap_or_else(|| index.to_string())
}

fn leading_decimal(s: &str) -> Option<u32> {
    let digits = s.bytes().take_while(u8::is_ascii_digit);
    let mut n: u32 = 0;
    let mut seen = false;
    for d in digits {
        seen = true;
        n = n * 10 + u32::from(d - b'0');
        if n >= MAX_DECIMAL_ZONE {
            return None;
        }
    }
    seen.then_some(n)
}

#[cfg(unix)]
fn interface_index(name: &str) -> Option<u32> {
    nix::net::if_::if_nametoindex(name).ok().filter(|&index| index != 0)
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn interface_name(index: u32) -> Option<String> {
    interfaces().into_iter().find(|(i, _)| *i == index).map(|(_, name)| name)
}

#[cfg(not(target_os = "linux"))]
fn interface_name(_index: u32) -> Option<String> {
    None
}

/// Interfaces visible to the resolver as `(index, name)` pairs
#[cfg(target_os = "linux")]
pub fn interfaces() -> Vec<(u32, String)> {
    match nix::net::if_::if_nameindex() {
        Ok(list) => list
            .iter()
            .map(|iface| (iface.index(), iface.name().to_string_lossy().into_owned()))
            .collect(),
        Err(e) => {
            trace!("Interface enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Interfaces visible to the resolver as `(index, name)` pairs
#[cfg(not(target_os = "linux"))]
pub fn interfaces() -> Vec<(u32, String)> {
    Vec::new()
}
