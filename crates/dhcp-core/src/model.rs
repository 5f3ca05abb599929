use std::net::{Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use dhcproto::v4::Message;
use serde::{Deserialize, Serialize};

/// The literal CIDR string identifying a subnet, e.g. `"10.1.1.0/24"`.
pub type SubnetPrefix = String;

/// One configured option, as delivered by the control plane.
///
/// `kind` mirrors the source schema's `type` tag; only `"string"` is
/// currently a supported kind. Anything else fails at response
/// construction time with `EngineError::BadOption`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionValue {
    pub id: u8,
    pub kind: String,
    pub value: String,
}

/// A binding of one MAC address to one IPv4 within a subnet.
///
/// Host reservations are represented as leases with `is_reservation =
/// true`: they are installed the same way as dynamic leases (so MAC/IP
/// lookup is uniform) but are never picked as an expired candidate
/// during the free-pool scan and their `last_update` is irrelevant to
/// expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub subnet: SubnetPrefix,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub net_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub options: Vec<OptionValue>,
    pub lease_time_secs: u32,
    pub boot_file_name: String,
    pub server_host_name: String,
    pub server_id: Ipv4Addr,
    pub last_update: DateTime<Utc>,
    pub ack_sent: bool,
    pub is_reservation: bool,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.is_reservation {
            return false;
        }
        let age = now.signed_duration_since(self.last_update);
        age.num_seconds() > self.lease_time_secs as i64
    }
}

/// A permanent, statically configured lease pinning a MAC to an IP,
/// possibly outside the subnet's dynamic range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub subnet: SubnetPrefix,
    pub mac: String,
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub options: Vec<OptionValue>,
    #[serde(default)]
    pub lease_time_secs: Option<u32>,
    #[serde(default)]
    pub boot_file_name: Option<String>,
    #[serde(default)]
    pub server_host_name: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
}

/// One network ingress point: a (name, interface, address) triple.
/// `interface`/`address` of `None` mean "any"/"wildcard".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenConfig {
    pub name: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl ListenConfig {
    pub fn describe(&self) -> String {
        format!(
            "{}:{}",
            self.interface.as_deref().unwrap_or("*"),
            self.address.as_deref().unwrap_or("*")
        )
    }
}

/// A named group of leases as delivered by the control-plane's
/// `LeasesBatch` entity, replayed oldest-first on startup.
#[derive(Debug, Clone)]
pub struct LeaseBatch {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub leases: Vec<Lease>,
}

/// A parsed inbound DHCPv4 datagram plus the metadata needed to route
/// and reply to it.
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    pub src: SocketAddr,
    pub interface_name: String,
    pub dst: Ipv4Addr,
}

impl Request {
    pub fn gateway(&self) -> Ipv4Addr {
        self.message.giaddr()
    }

    pub fn client_mac(&self) -> String {
        format_mac(self.message.chaddr())
    }
}

/// The outbound DHCPv4 reply plus the lease it was constructed from.
#[derive(Debug, Clone)]
pub struct Response {
    pub request: Request,
    pub message: Message,
    pub lease: Lease,
}

pub fn format_mac(chaddr: &[u8]) -> String {
    chaddr
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(mac: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let bytes = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(format_mac(&bytes), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn expiry_uses_lease_time() {
        let now = Utc::now();
        let mut lease = Lease {
            subnet: "10.1.1.0/24".into(),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ip: Ipv4Addr::new(10, 1, 1, 5),
            net_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 1, 1, 1),
            dns: vec![],
            options: vec![],
            lease_time_secs: 60,
            boot_file_name: String::new(),
            server_host_name: String::new(),
            server_id: Ipv4Addr::new(10, 1, 1, 1),
            last_update: now - chrono::Duration::seconds(120),
            ack_sent: true,
            is_reservation: false,
        };
        assert!(lease.is_expired(now));
        lease.last_update = now;
        assert!(!lease.is_expired(now));
        lease.is_reservation = true;
        lease.last_update = now - chrono::Duration::seconds(1_000_000);
        assert!(!lease.is_expired(now));
    }
}
