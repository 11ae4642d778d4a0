//! Local subnet detection.
//!
//! The scanner only ever sweeps /24 networks, identified here by their three
//! leading octets. Resolution is best effort and never fails outward: any
//! problem degrades to [`FALLBACK_SUBNET`].

use anyhow::{anyhow, bail, Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, warn};

/// Prefix used whenever the local network cannot be determined.
pub const FALLBACK_SUBNET: SubnetPrefix = SubnetPrefix([192, 168, 1]);

/// Upper bound for a single resolution attempt.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Interface name prefixes of bridges, container links and tunnels. Players
/// never sit behind these.
const VIRTUAL_IFACE_PREFIXES: &[&str] = &[
    "docker", "br-", "veth", "virbr", "vmnet", "vboxnet", "cni", "flannel", "tun", "tap", "utun", "wg",
    "tailscale", "zt", "ppp", "ipsec",
];

/// Subnets most consumer routers hand out, tried by the quick scan.
pub const COMMON_SUBNETS: [SubnetPrefix; 2] = [SubnetPrefix([192, 168, 0]), SubnetPrefix([192, 168, 1])];

/// The three leading octets of an IPv4 /24, e.g. `192.168.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubnetPrefix(pub [u8; 3]);

impl SubnetPrefix {
    /// The /24 containing `ip`.
    pub fn of(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        SubnetPrefix([o[0], o[1], o[2]])
    }

    pub fn host(&self, n: u8) -> Ipv4Addr {
        let [a, b, c] = self.0;
        Ipv4Addr::new(a, b, c, n)
    }

    pub fn to_net(&self) -> Ipv4Net {
        Ipv4Net::new(self.host(0), 24).expect("/24 is always valid")
    }

    /// The 254 host addresses `.1 ..= .254`, ascending.
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        expand_ipv4net_hosts(self.to_net())
    }
}

impl fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

impl FromStr for SubnetPrefix {
    type Err = anyhow::Error;

    /// Accepts `192.168.1`, `192.168.1.0/24` or any address inside the /24.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((addr, len)) = s.split_once('/') {
            if len != "24" {
                bail!("only /24 networks can be scanned: {s}");
            }
            let net: Ipv4Net = format!("{addr}/24").parse().context("invalid CIDR")?;
            return Ok(SubnetPrefix::of(net.network()));
        }
        let candidate = if s.split('.').count() == 3 { format!("{s}.0") } else { s.to_string() };
        let ip = crate::validate::parse_ipv4(&candidate)?;
        Ok(SubnetPrefix::of(ip))
    }
}

/// A way of learning this host's LAN address.
pub trait LocalAddrSource {
    fn local_ipv4(&self) -> impl Future<Output = Result<Ipv4Addr>> + Send;
}

/// Reads the OS interface table. Works wherever the process may enumerate
/// interfaces, which is the normal case on desktop and mobile hosts.
///
/// The kernel's route-selected source address wins when it belongs to a
/// physical interface; otherwise the best-ranked physical LAN address is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceTable;

impl LocalAddrSource for InterfaceTable {
    async fn local_ipv4(&self) -> Result<Ipv4Addr> {
        let ifaces = interface_ipv4_addrs()?;
        let routed = RouteProbe::default().local_ipv4().await.ok();
        pick_lan_addr(&ifaces, routed).ok_or_else(|| anyhow!("no physical non-loopback IPv4 interface"))
    }
}

/// Whether `name` looks like a bridge, container link or tunnel.
pub fn is_virtual_iface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    VIRTUAL_IFACE_PREFIXES.iter().any(|p| name.starts_with(p))
}

// Home routers use 192.168/16 far more often than the other private ranges.
fn lan_rank(ip: Ipv4Addr) -> u8 {
    match ip.octets() {
        [192, 168, ..] => 0,
        [10, ..] => 1,
        _ if ip.is_private() => 2,
        _ => 3,
    }
}

/// Choose the address whose /24 should be swept from `(interface name, address)`
/// pairs. `routed` is the source the kernel picks for outbound traffic.
pub fn pick_lan_addr(ifaces: &[(String, Ipv4Addr)], routed: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    let mut usable: Vec<Ipv4Addr> = ifaces
        .iter()
        .filter(|(name, ip)| !ip.is_loopback() && !ip.is_link_local() && !is_virtual_iface(name))
        .map(|(_, ip)| *ip)
        .collect();
    if let Some(r) = routed.filter(|r| usable.contains(r)) {
        return Some(r);
    }
    usable.sort_by_key(|ip| (lan_rank(*ip), u32::from(*ip)));
    usable.into_iter().next()
}

/// For sandboxes that hide the interface table: "connect" a UDP socket towards
/// a routable address and read back the local address the kernel picked. No
/// datagram is ever sent.
#[derive(Debug, Clone, Copy)]
pub struct RouteProbe {
    pub target: SocketAddr,
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self { target: SocketAddr::from(([8, 8, 8, 8], 80)) }
    }
}

impl LocalAddrSource for RouteProbe {
    async fn local_ipv4(&self) -> Result<Ipv4Addr> {
        let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
        sock.connect(self.target).await?;
        match sock.local_addr()? {
            SocketAddr::V4(v4) if v4.ip().is_private() => Ok(*v4.ip()),
            other => bail!("route probe yielded non-private address {other}"),
        }
    }
}

/// Runtime-selected strategy. `Fixed` skips detection entirely.
#[derive(Debug, Clone, Copy)]
pub enum Resolver {
    Interfaces(InterfaceTable),
    Route(RouteProbe),
    Fixed(SubnetPrefix),
}

impl Default for Resolver {
    fn default() -> Self {
        Resolver::Interfaces(InterfaceTable)
    }
}

impl LocalAddrSource for Resolver {
    async fn local_ipv4(&self) -> Result<Ipv4Addr> {
        match self {
            Resolver::Interfaces(s) => s.local_ipv4().await,
            Resolver::Route(s) => s.local_ipv4().await,
            Resolver::Fixed(p) => Ok(p.host(0)),
        }
    }
}

/// Best-guess /24 for the local network. Single attempt, bounded by
/// [`RESOLVE_TIMEOUT`], never fails.
pub async fn resolve_subnet<S: LocalAddrSource>(source: &S) -> SubnetPrefix {
    match time::timeout(RESOLVE_TIMEOUT, source.local_ipv4()).await {
        Ok(Ok(ip)) => {
            let prefix = SubnetPrefix::of(ip);
            debug!(%ip, subnet = %prefix, "resolved local subnet");
            prefix
        }
        Ok(Err(e)) => {
            warn!(error = %e, fallback = %FALLBACK_SUBNET, "subnet detection failed");
            FALLBACK_SUBNET
        }
        Err(_) => {
            warn!(fallback = %FALLBACK_SUBNET, "subnet detection timed out");
            FALLBACK_SUBNET
        }
    }
}

/// Every IPv4 address in the interface table with its interface name.
pub fn interface_ipv4_addrs() -> Result<Vec<(String, Ipv4Addr)>> {
    Ok(get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some((iface.name, v4.ip)),
            _ => None,
        })
        .collect())
}

/// Non-loopback IPv4 addresses of physical interfaces, likely LAN first.
pub fn local_ipv4_addrs() -> Result<Vec<Ipv4Addr>> {
    let mut addrs: Vec<Ipv4Addr> = interface_ipv4_addrs()?
        .into_iter()
        .filter(|(name, ip)| !ip.is_loopback() && !ip.is_link_local() && !is_virtual_iface(name))
        .map(|(_, ip)| ip)
        .collect();
    addrs.sort_by_key(|ip| (lan_rank(*ip), u32::from(*ip)));
    addrs.dedup();
    Ok(addrs)
}

/// Every distinct /24 this host has an address in, sorted.
pub fn detect_local_subnets() -> Result<Vec<SubnetPrefix>> {
    let set: BTreeSet<SubnetPrefix> = local_ipv4_addrs()?.into_iter().map(SubnetPrefix::of).collect();
    Ok(set.into_iter().collect())
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    // Skip network and broadcast.
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}
