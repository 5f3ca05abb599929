use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use dhcproto::v4::{DhcpOption, Message, MessageType, Opcode, OptionCode, UnknownOption};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::model::{HostConfig, LeaseBatch, Request, Response};
use crate::pool::{Subnet, SubnetConfig};

/// The core dispatcher. Owns every subnet, the local-address snapshot
/// used for interface-based routing and the server-identifier set, and
/// constructs DHCPv4 replies from allocated leases.
///
/// Listen lifecycle (creating/tearing down a `RequestProcessor`) is
/// deliberately *not* modeled here: that is a networking concern owned
/// by `dhcp_net`, which holds a `Server` behind an `Arc` and calls
/// `get_response` per inbound request. See DESIGN.md for the rationale.
pub struct Server {
    subnets: Mutex<HashMap<String, Subnet>>,
    local_addresses: RwLock<HashMap<String, Vec<Ipv4Addr>>>,
    server_ids: RwLock<HashSet<Ipv4Addr>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server {
            subnets: Mutex::new(HashMap::new()),
            local_addresses: RwLock::new(HashMap::new()),
            server_ids: RwLock::new(HashSet::new()),
        }
    }

    /// Replace the local-address snapshot used for interface routing and
    /// the server-identifier set (their union).
    pub fn set_local_addresses(&self, addrs: HashMap<String, Vec<Ipv4Addr>>) {
        let mut ids = HashSet::new();
        for list in addrs.values() {
            ids.extend(list.iter().copied());
        }
        *self.server_ids.write().unwrap() = ids;
        *self.local_addresses.write().unwrap() = addrs;
    }

    /// The local address on `interface` that falls inside `cidr`, if any.
    fn server_address_for(&self, interface: Option<&str>, cidr: &ipnet::Ipv4Net) -> Ipv4Addr {
        let local = self.local_addresses.read().unwrap();
        let candidates: Box<dyn Iterator<Item = &Ipv4Addr>> = match interface {
            Some(iface) => Box::new(local.get(iface).into_iter().flatten()),
            None => Box::new(local.values().flatten()),
        };
        candidates
            .filter(|ip| cidr.contains(*ip))
            .copied()
            .next()
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn add_subnet(&self, cfg: &SubnetConfig) -> Result<()> {
        let cidr: ipnet::Ipv4Net = cfg
            .cidr
            .parse()
            .map_err(|_| EngineError::Config(format!("invalid CIDR: {}", cfg.cidr)))?;
        let server_address = self.server_address_for(None, &cidr);
        let subnet = Subnet::new(cfg, server_address)?;

        let mut subnets = self.subnets.lock().unwrap();
        if subnets.contains_key(&subnet.prefix) {
            return Err(EngineError::DuplicateSubnet(subnet.prefix));
        }
        for existing in subnets.values() {
            if existing.overlaps(&subnet) {
                return Err(EngineError::SubnetOverlap(subnet.prefix));
            }
        }
        subnets.insert(subnet.prefix.clone(), subnet);
        Ok(())
    }

    pub fn delete_subnet(&self, prefix: &str) -> Result<()> {
        self.subnets
            .lock()
            .unwrap()
            .remove(prefix)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(prefix.to_string()))
    }

    pub fn add_host(&self, host: &HostConfig, now: DateTime<Utc>) -> Result<()> {
        let subnets = self.subnets.lock().unwrap();
        let subnet = subnets
            .values()
            .find(|s| s.contains(host.ip))
            .ok_or_else(|| EngineError::NotFound(host.subnet.clone()))?;
        subnet.install_host(host, now);
        Ok(())
    }

    pub fn delete_host(&self, host: &HostConfig) -> Result<()> {
        let subnets = self.subnets.lock().unwrap();
        let subnet = subnets
            .values()
            .find(|s| s.contains(host.ip))
            .ok_or_else(|| EngineError::NotFound(host.subnet.clone()))?;
        subnet.remove_host(&host.mac, host.ip);
        Ok(())
    }

    /// Ingest every lease in a control-plane `LeasesBatch`. Replaying
    /// batches oldest-first at startup means later batches naturally
    /// overwrite earlier ones for the same MAC, since `install` always
    /// evicts any prior binding.
    pub fn apply_lease_batch(&self, batch: &LeaseBatch) {
        let subnets = self.subnets.lock().unwrap();
        for lease in &batch.leases {
            if let Some(subnet) = subnets.get(&lease.subnet) {
                subnet.release(&lease.mac, lease.ip);
                // reinstall via the allocator so both indices stay correct
                let _ = subnet.get_lease_for_request(&lease.mac, Some(lease.ip), lease.last_update);
            }
        }
    }

    /// Remove every lease in a deleted batch whose MAC is not present in
    /// `still_known_macs` (leases covered by a remaining batch survive).
    pub fn remove_lease_batch(&self, batch: &LeaseBatch, still_known_macs: &HashSet<String>) {
        let subnets = self.subnets.lock().unwrap();
        for lease in &batch.leases {
            if still_known_macs.contains(&lease.mac) {
                continue;
            }
            if let Some(subnet) = subnets.get(&lease.subnet) {
                subnet.release(&lease.mac, lease.ip);
            }
        }
    }

    fn route(&self, req: &Request) -> Result<String> {
        let gateway = req.gateway();
        let subnets = self.subnets.lock().unwrap();
        if !gateway.is_unspecified() {
            return subnets
                .values()
                .find(|s| s.contains(gateway))
                .map(|s| s.prefix.clone())
                .ok_or(EngineError::UnknownSubnet);
        }
        let local = self.local_addresses.read().unwrap();
        let on_iface = local.get(&req.interface_name);
        if let Some(addrs) = on_iface {
            for addr in addrs {
                if let Some(s) = subnets.values().find(|s| s.contains(*addr)) {
                    return Ok(s.prefix.clone());
                }
            }
        }
        Err(EngineError::UnknownSubnet)
    }

    /// Process one inbound request end to end: server-id filter, subnet
    /// routing, allocation, and reply construction.
    pub fn get_response(&self, request: Request, now: DateTime<Utc>) -> Result<Response> {
        if let Some(&DhcpOption::ServerIdentifier(sid)) =
            request.message.opts().get(OptionCode::ServerIdentifier)
        {
            if !sid.is_unspecified() && !self.server_ids.read().unwrap().contains(&sid) {
                return Err(EngineError::WrongServerId);
            }
        }

        let msg_type = request
            .message
            .opts()
            .msg_type()
            .ok_or(EngineError::UnsupportedMessageType)?;
        if !matches!(msg_type, MessageType::Discover | MessageType::Request) {
            return Err(EngineError::UnsupportedMessageType);
        }

        let prefix = self.route(&request)?;
        let subnets = self.subnets.lock().unwrap();
        let subnet = subnets.get(&prefix).ok_or(EngineError::UnknownSubnet)?;

        let mac = request.client_mac();
        let requested_ip = match request.message.opts().get(OptionCode::RequestedIpAddress) {
            Some(&DhcpOption::RequestedIpAddress(ip)) => Some(ip),
            _ => None,
        };

        let mut lease = subnet.get_lease_for_request(&mac, requested_ip, now)?;

        let reply_type = match msg_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            _ => unreachable!("checked above"),
        };
        lease.ack_sent = reply_type == MessageType::Ack;

        let message = build_reply(&request.message, &lease, reply_type)?;

        debug!(%mac, ip = %lease.ip, ?reply_type, "dispatched");
        drop(subnets);
        Ok(Response {
            request,
            message,
            lease,
        })
    }
}

fn build_reply(
    req: &Message,
    lease: &crate::model::Lease,
    reply_type: MessageType,
) -> Result<Message> {
    let mut reply = Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        lease.ip,
        lease.server_id,
        req.giaddr(),
        req.chaddr(),
    );
    reply.set_opcode(Opcode::BootReply);
    reply.set_htype(req.htype());
    reply.set_hlen(req.hlen());
    reply.set_secs(0);
    reply.set_flags(req.flags());

    if !lease.server_host_name.is_empty() {
        reply.set_sname(lease.server_host_name.as_bytes());
    }
    if !lease.boot_file_name.is_empty() {
        reply.set_fname_str(&lease.boot_file_name);
    }

    let opts = reply.opts_mut();
    opts.insert(DhcpOption::MessageType(reply_type));
    opts.insert(DhcpOption::SubnetMask(lease.net_mask));
    opts.insert(DhcpOption::Router(vec![lease.gateway]));
    if !lease.dns.is_empty() {
        opts.insert(DhcpOption::DomainNameServer(lease.dns.clone()));
    }
    opts.insert(DhcpOption::AddressLeaseTime(lease.lease_time_secs));
    opts.insert(DhcpOption::ServerIdentifier(lease.server_id));

    for opt in &lease.options {
        if opt.kind != "string" {
            warn!(id = opt.id, kind = %opt.kind, "unknown option type");
            return Err(EngineError::BadOption(opt.kind.clone()));
        }
        opts.insert(DhcpOption::Unknown(UnknownOption::new(
            opt.id,
            opt.value.as_bytes().to_vec(),
        )));
    }

    opts.insert(DhcpOption::End);
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::format_mac;

    fn cfg(cidr: &str, from: &str, to: &str, gw: &str) -> SubnetConfig {
        SubnetConfig {
            cidr: cidr.into(),
            range_from: from.parse().unwrap(),
            range_to: to.parse().unwrap(),
            gateway: gw.parse().unwrap(),
            dns: vec!["1.1.1.1".parse().unwrap(), "2.2.2.2".parse().unwrap()],
            options: vec![],
            lease_time_secs: 3600,
            boot_file_name: String::new(),
            server_host_name: String::new(),
        }
    }

    fn discover(mac: [u8; 6], giaddr: Ipv4Addr, iface: &str) -> Request {
        let mut msg = Message::new_with_id(
            0x1234,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            giaddr,
            &mac,
        );
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        Request {
            message: msg,
            src: "0.0.0.0:68".parse().unwrap(),
            interface_name: iface.to_string(),
            dst: Ipv4Addr::UNSPECIFIED,
        }
    }

    #[test]
    fn dispatch_by_relay() {
        let server = Server::new();
        server.add_subnet(&cfg("192.168.10.0/24", "192.168.10.100", "192.168.10.200", "192.168.10.1")).unwrap();
        server.set_local_addresses(HashMap::from([(
            "br0".to_string(),
            vec!["192.168.10.1".parse().unwrap()],
        )]));

        let mac = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let req = discover(mac, "192.168.10.1".parse().unwrap(), "irrelevant");
        let resp = server.get_response(req, Utc::now()).unwrap();
        assert_eq!(resp.lease.ip, "192.168.10.100".parse::<Ipv4Addr>().unwrap());
        assert_eq!(resp.message.opts().msg_type(), Some(MessageType::Offer));
        assert_eq!(format_mac(&mac), resp.lease.mac);
    }

    #[test]
    fn dispatch_by_interface() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.1", "10.1.1.10", "10.1.1.1")).unwrap();
        server.add_subnet(&cfg("10.3.1.0/24", "10.3.1.1", "10.3.1.10", "10.3.1.1")).unwrap();
        server.set_local_addresses(HashMap::from([
            ("br0".to_string(), vec!["10.1.1.1".parse().unwrap(), "10.2.1.1".parse().unwrap()]),
            ("br1".to_string(), vec!["10.3.1.1".parse().unwrap()]),
        ]));

        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let req = discover(mac, Ipv4Addr::UNSPECIFIED, "br1");
        let resp = server.get_response(req, Utc::now()).unwrap();
        assert_eq!(resp.lease.ip, "10.3.1.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn server_id_filter_rejects_foreign_id() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.1", "10.1.1.10", "10.1.1.1")).unwrap();
        server.set_local_addresses(HashMap::from([(
            "br0".to_string(),
            vec!["10.1.1.1".parse().unwrap()],
        )]));

        let mac = [0, 1, 2, 3, 4, 5];
        let mut req = discover(mac, "10.1.1.1".parse().unwrap(), "br0");
        req.message
            .opts_mut()
            .insert(DhcpOption::ServerIdentifier("9.9.9.9".parse().unwrap()));
        assert!(matches!(
            server.get_response(req, Utc::now()),
            Err(EngineError::WrongServerId)
        ));
    }

    #[test]
    fn host_reservation_outside_dynamic_range() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.100", "10.1.1.110", "10.1.1.1")).unwrap();
        server.set_local_addresses(HashMap::from([(
            "br0".to_string(),
            vec!["10.1.1.1".parse().unwrap()],
        )]));
        let host = HostConfig {
            subnet: "10.1.1.0/24".into(),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ip: "10.1.1.50".parse().unwrap(),
            gateway: None,
            dns: vec![],
            options: vec![],
            lease_time_secs: None,
            boot_file_name: None,
            server_host_name: None,
            host_name: None,
        };
        server.add_host(&host, Utc::now()).unwrap();

        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let req = discover(mac, "10.1.1.1".parse().unwrap(), "br0");
        let resp = server.get_response(req, Utc::now()).unwrap();
        assert_eq!(resp.lease.ip, "10.1.1.50".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn duplicate_subnet_prefix_rejected() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.100", "10.1.1.110", "10.1.1.1")).unwrap();
        assert!(matches!(
            server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.200", "10.1.1.210", "10.1.1.1")),
            Err(EngineError::DuplicateSubnet(_))
        ));
    }

    #[test]
    fn overlapping_ranges_rejected_across_different_prefixes() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.10", "10.1.1.50", "10.1.1.1")).unwrap();
        // Different CIDR prefix, but its dynamic range overlaps the first's.
        assert!(matches!(
            server.add_subnet(&cfg("10.1.1.128/25", "10.1.1.40", "10.1.1.60", "10.1.1.129")),
            Err(EngineError::SubnetOverlap(_))
        ));
    }

    #[test]
    fn cidr_overlap_with_disjoint_ranges_is_allowed() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.10", "10.1.1.50", "10.1.1.1")).unwrap();
        // `10.1.1.128/25`'s network falls inside `10.1.1.0/24`, but the
        // dynamic ranges never intersect, so this must be accepted.
        assert!(server
            .add_subnet(&cfg("10.1.1.128/25", "10.1.1.140", "10.1.1.150", "10.1.1.129"))
            .is_ok());
    }

    fn lease(mac: &str, ip: &str) -> crate::model::Lease {
        crate::model::Lease {
            subnet: "10.1.1.0/24".into(),
            mac: mac.to_string(),
            ip: ip.parse().unwrap(),
            net_mask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 1, 1, 1),
            dns: vec![],
            options: vec![],
            lease_time_secs: 3600,
            boot_file_name: String::new(),
            server_host_name: String::new(),
            server_id: Ipv4Addr::new(10, 1, 1, 1),
            last_update: Utc::now(),
            ack_sent: true,
            is_reservation: false,
        }
    }

    #[test]
    fn remove_lease_batch_evicts_macs_not_covered_elsewhere() {
        let server = Server::new();
        server.add_subnet(&cfg("10.1.1.0/24", "10.1.1.100", "10.1.1.110", "10.1.1.1")).unwrap();
        server.set_local_addresses(HashMap::from([(
            "br0".to_string(),
            vec!["10.1.1.1".parse().unwrap()],
        )]));

        let batch = LeaseBatch {
            name: "b1".into(),
            created_at: Utc::now(),
            leases: vec![
                lease("aa:bb:cc:dd:ee:ff", "10.1.1.100"),
                lease("11:22:33:44:55:66", "10.1.1.101"),
            ],
        };
        server.apply_lease_batch(&batch);

        let still_known = HashSet::from(["11:22:33:44:55:66".to_string()]);
        server.remove_lease_batch(&batch, &still_known);

        // aa:bb:cc:dd:ee:ff was evicted, so a fresh DISCOVER from it gets a
        // freely reclaimed address rather than its old binding.
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
        let req = discover(mac, "10.1.1.1".parse().unwrap(), "br0");
        let resp = server.get_response(req, Utc::now()).unwrap();
        assert_eq!(resp.lease.ip, "10.1.1.100".parse::<Ipv4Addr>().unwrap());

        // 11:22:33:44:55:66 is still covered, so its binding survives.
        let mac2 = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
        let req2 = discover(mac2, "10.1.1.1".parse().unwrap(), "br0");
        let resp2 = server.get_response(req2, Utc::now()).unwrap();
        assert_eq!(resp2.lease.ip, "10.1.1.101".parse::<Ipv4Addr>().unwrap());
    }
}
