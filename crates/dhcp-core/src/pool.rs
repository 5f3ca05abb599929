use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;

use crate::error::{EngineError, Result};
use crate::ipv4::IpAddr32;
use crate::model::{HostConfig, Lease, OptionValue, SubnetPrefix};

/// Control-plane shape of a subnet, as delivered by the configuration
/// plane (see dhcp-core::config).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubnetConfig {
    pub cidr: String,
    pub range_from: Ipv4Addr,
    pub range_to: Ipv4Addr,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    #[serde(default)]
    pub options: Vec<OptionValue>,
    #[serde(default = "default_lease_time")]
    pub lease_time_secs: u32,
    #[serde(default)]
    pub boot_file_name: String,
    #[serde(default)]
    pub server_host_name: String,
}

fn default_lease_time() -> u32 {
    14400
}

/// Slab of leases indexed by both MAC-string and IP, a lease pool's
/// free-list, and the round-robin scan cursor. Guarded by one mutex per
/// subnet (`Subnet::state`), matching the lock granularity spec'd for
/// `Subnet.leaseMutex`.
struct SubnetState {
    current_ip: IpAddr32,
    by_mac: HashMap<String, usize>,
    by_ip: HashMap<Ipv4Addr, usize>,
    slab: Vec<Option<Lease>>,
    free: Vec<usize>,
}

impl SubnetState {
    fn new() -> Self {
        SubnetState {
            current_ip: IpAddr32::UNSPECIFIED,
            by_mac: HashMap::new(),
            by_ip: HashMap::new(),
            slab: Vec::new(),
            free: Vec::new(),
        }
    }

    fn get_by_mac(&self, mac: &str) -> Option<&Lease> {
        self.by_mac.get(mac).and_then(|&i| self.slab[i].as_ref())
    }

    fn get_by_ip(&self, ip: Ipv4Addr) -> Option<&Lease> {
        self.by_ip.get(&ip).and_then(|&i| self.slab[i].as_ref())
    }

    /// Remove whatever lease currently occupies the given MAC and/or IP
    /// keys (they may point at the same slot or different ones).
    fn evict(&mut self, mac: &str, ip: Ipv4Addr) {
        if let Some(idx) = self.by_mac.remove(mac) {
            self.slab[idx] = None;
            self.free.push(idx);
        }
        if let Some(idx) = self.by_ip.remove(&ip) {
            if self.slab[idx].is_some() {
                self.slab[idx] = None;
            }
            self.free.push(idx);
        }
    }

    /// Install `lease` under both its mac and ip keys, evicting whatever
    /// previously held either key.
    fn install(&mut self, lease: Lease) -> Lease {
        self.evict(&lease.mac, lease.ip);
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slab[idx] = Some(lease.clone());
                idx
            }
            None => {
                self.slab.push(Some(lease.clone()));
                self.slab.len() - 1
            }
        };
        self.by_mac.insert(lease.mac.clone(), idx);
        self.by_ip.insert(lease.ip, idx);
        lease
    }
}

/// The per-subnet allocator: owns the lease map and the round-robin
/// cursor, and knows the CIDR, dynamic range, and decoration fields
/// every issued lease inherits.
pub struct Subnet {
    pub prefix: SubnetPrefix,
    pub cidr: Ipv4Net,
    pub range_from: Ipv4Addr,
    pub range_to: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    pub options: Vec<OptionValue>,
    pub lease_time_secs: u32,
    pub boot_file_name: String,
    pub server_host_name: String,
    pub server_address: Ipv4Addr,
    state: Mutex<SubnetState>,
}

impl Subnet {
    /// Build a subnet from its control-plane config. `server_address`
    /// is the local interface address that falls inside `cfg.cidr`,
    /// resolved by the caller (the Server, which owns the local address
    /// snapshot).
    pub fn new(cfg: &SubnetConfig, server_address: Ipv4Addr) -> Result<Subnet> {
        let cidr: Ipv4Net = cfg
            .cidr
            .parse()
            .map_err(|_| EngineError::Config(format!("invalid CIDR: {}", cfg.cidr)))?;
        let from = IpAddr32::from(cfg.range_from);
        let to = IpAddr32::from(cfg.range_to);
        if from > to {
            return Err(EngineError::Config(format!(
                "range_from {} is after range_to {}",
                cfg.range_from, cfg.range_to
            )));
        }
        Ok(Subnet {
            prefix: cidr.to_string(),
            cidr,
            range_from: cfg.range_from,
            range_to: cfg.range_to,
            gateway: cfg.gateway,
            dns: cfg.dns.clone(),
            options: cfg.options.clone(),
            lease_time_secs: if cfg.lease_time_secs == 0 {
                default_lease_time()
            } else {
                cfg.lease_time_secs
            },
            boot_file_name: cfg.boot_file_name.clone(),
            server_host_name: cfg.server_host_name.clone(),
            server_address,
            state: Mutex::new(SubnetState::new()),
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }

    /// Two subnets overlap if they share a CIDR prefix (the original
    /// behavior) or if their dynamic ranges (`range_from..=range_to`)
    /// intersect as address intervals.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        if self.prefix == other.prefix {
            return true;
        }
        let (a_from, a_to) = (IpAddr32::from(self.range_from), IpAddr32::from(self.range_to));
        let (b_from, b_to) = (IpAddr32::from(other.range_from), IpAddr32::from(other.range_to));
        a_from <= b_to && b_from <= a_to
    }

    fn new_lease(&self, mac: &str, ip: Ipv4Addr, now: DateTime<Utc>) -> Lease {
        Lease {
            subnet: self.prefix.clone(),
            mac: mac.to_string(),
            ip,
            net_mask: self.cidr.netmask(),
            gateway: self.gateway,
            dns: self.dns.clone(),
            options: self.options.clone(),
            lease_time_secs: self.lease_time_secs,
            boot_file_name: self.boot_file_name.clone(),
            server_host_name: self.server_host_name.clone(),
            server_id: self.server_address,
            last_update: now,
            ack_sent: false,
            is_reservation: false,
        }
    }

    /// Install a host reservation: a lease that never expires and whose
    /// MAC/IP mapping is fixed regardless of the dynamic range.
    pub fn install_host(&self, host: &HostConfig, now: DateTime<Utc>) {
        let mut lease = self.new_lease(&host.mac, host.ip, now);
        lease.is_reservation = true;
        if let Some(gw) = host.gateway {
            lease.gateway = gw;
        }
        if !host.dns.is_empty() {
            lease.dns = host.dns.clone();
        }
        if !host.options.is_empty() {
            lease.options = host.options.clone();
        }
        if let Some(lt) = host.lease_time_secs {
            lease.lease_time_secs = lt;
        }
        if let Some(ref bf) = host.boot_file_name {
            lease.boot_file_name = bf.clone();
        }
        if let Some(ref shn) = host.server_host_name {
            lease.server_host_name = shn.clone();
        }
        self.state.lock().unwrap().install(lease);
    }

    pub fn remove_host(&self, mac: &str, ip: Ipv4Addr) {
        self.state.lock().unwrap().evict(mac, ip);
    }

    /// The core allocation algorithm (spec.md §4.1, steps 1-4).
    pub fn get_lease_for_request(
        &self,
        mac: &str,
        req_ip: Option<Ipv4Addr>,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let mut state = self.state.lock().unwrap();

        // 1/2: existing binding by MAC.
        if let Some(existing) = state.get_by_mac(mac) {
            if let Some(req_ip) = req_ip {
                if !req_ip.is_unspecified() && req_ip != existing.ip {
                    return Err(EngineError::AddressUnavailable);
                }
            }
            return Ok(existing.clone());
        }

        // 3: requested-IP path.
        if let Some(req_ip) = req_ip {
            if !req_ip.is_unspecified() {
                match state.get_by_ip(req_ip).cloned() {
                    Some(existing) if !existing.is_expired(now) => {
                        return Err(EngineError::AddressUnavailable);
                    }
                    _ => {
                        let lease = self.new_lease(mac, req_ip, now);
                        return Ok(state.install(lease));
                    }
                }
            }
        }

        // 4: free-pool scan, round-robin from the cursor.
        let from = IpAddr32::from(self.range_from);
        let to = IpAddr32::from(self.range_to);
        state.current_ip = if state.current_ip.is_unspecified() {
            from
        } else {
            let next = state.current_ip.next();
            if next > to {
                from
            } else {
                next
            }
        };
        let start = state.current_ip;
        let mut oldest_candidate: Option<(Ipv4Addr, DateTime<Utc>)> = None;

        loop {
            let ip = Ipv4Addr::from(state.current_ip);
            match state.get_by_ip(ip) {
                None => {
                    let lease = self.new_lease(mac, ip, now);
                    return Ok(state.install(lease));
                }
                Some(existing) => {
                    if existing.is_expired(now) {
                        let replace = match oldest_candidate {
                            Some((_, ts)) => existing.last_update < ts,
                            None => true,
                        };
                        if replace {
                            oldest_candidate = Some((ip, existing.last_update));
                        }
                    }
                }
            }
            let next = state.current_ip.next();
            state.current_ip = if next > to { from } else { next };
            if state.current_ip == start {
                break;
            }
        }

        match oldest_candidate {
            Some((ip, _)) => {
                let mac_of_expired = state.get_by_ip(ip).map(|l| l.mac.clone());
                if let Some(old_mac) = mac_of_expired {
                    state.evict(&old_mac, ip);
                }
                let lease = self.new_lease(mac, ip, now);
                Ok(state.install(lease))
            }
            None => Err(EngineError::PoolExhausted),
        }
    }

    pub fn release(&self, mac: &str, ip: Ipv4Addr) {
        self.state.lock().unwrap().evict(mac, ip);
    }

    pub fn find_by_mac(&self, mac: &str) -> Option<Lease> {
        self.state.lock().unwrap().get_by_mac(mac).cloned()
    }
}
