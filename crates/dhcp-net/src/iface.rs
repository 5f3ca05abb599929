use std::collections::HashMap;
use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::if_nametoindex;
use nix::sys::socket::SockaddrLike;

/// Snapshot every local interface's IPv4 addresses, keyed by interface
/// name. IPv6 addresses are skipped; this engine only routes DHCPv4.
pub fn local_addresses() -> anyhow::Result<HashMap<String, Vec<Ipv4Addr>>> {
    let mut out: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
    for ifaddr in getifaddrs()? {
        let Some(addr) = ifaddr.address else {
            continue;
        };
        let Some(sin) = addr.as_sockaddr_in() else {
            continue;
        };
        let ip = Ipv4Addr::from(sin.ip());
        out.entry(ifaddr.interface_name).or_default().push(ip);
    }
    Ok(out)
}

/// Map every local interface's kernel ifindex to its name, for resolving
/// `IP_PKTINFO`'s `ipi_ifindex` back to the name `Server::route` keys its
/// local-address table by.
pub fn interface_index_map() -> anyhow::Result<HashMap<i32, String>> {
    let mut out = HashMap::new();
    for ifaddr in getifaddrs()? {
        let idx = if_nametoindex(ifaddr.interface_name.as_str())?;
        out.insert(idx as i32, ifaddr.interface_name);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_loopback() {
        let addrs = local_addresses().expect("enumerating interfaces must not fail in CI");
        let has_loopback = addrs.values().flatten().any(|ip| ip.is_loopback());
        assert!(has_loopback, "expected at least loopback 127.0.0.1 in {addrs:?}");
    }
}
