use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use crate::model::{HostConfig, LeaseBatch, ListenConfig, SubnetPrefix};

/// Temporary storage for control-plane objects whose owner hasn't
/// arrived yet — e.g. a host reservation delivered before its subnet,
/// or a leases batch delivered before the server that should own it.
/// Everything here is provisional until promoted into the `Server`.
pub struct ObjectCache {
    known_subnets: Mutex<HashSet<SubnetPrefix>>,
    pending_hosts: Mutex<HashMap<SubnetPrefix, Vec<HostConfig>>>,
    known_listens: Mutex<HashMap<String, ListenConfig>>,
    known_macs: RwLock<HashSet<String>>,
    lease_batches: Mutex<HashMap<String, LeaseBatch>>,
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectCache {
    pub fn new() -> ObjectCache {
        ObjectCache {
            known_subnets: Mutex::new(HashSet::new()),
            pending_hosts: Mutex::new(HashMap::new()),
            known_listens: Mutex::new(HashMap::new()),
            known_macs: RwLock::new(HashSet::new()),
            lease_batches: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_mac(&self, mac: &str) {
        self.known_macs.write().unwrap().insert(mac.to_string());
    }

    pub fn has_mac(&self, mac: &str) -> bool {
        self.known_macs.read().unwrap().contains(mac)
    }

    /// Record that `prefix` is now backed by a live subnet, returning
    /// `false` if it was already known (the original `AddSubnetIfNotKnown`).
    pub fn add_subnet_if_not_known(&self, prefix: &SubnetPrefix) -> bool {
        self.known_subnets.lock().unwrap().insert(prefix.clone())
    }

    /// Defer `host` if its subnet is not yet known; returns `true` when
    /// deferred, `false` when the caller should install it immediately.
    pub fn add_host_if_not_known(&self, host: HostConfig) -> bool {
        let known = self.known_subnets.lock().unwrap();
        if known.contains(&host.subnet) {
            return false;
        }
        self.pending_hosts
            .lock()
            .unwrap()
            .entry(host.subnet.clone())
            .or_default()
            .push(host);
        true
    }

    /// Drain every host that was deferred waiting on `prefix`.
    pub fn pop_pending_hosts(&self, prefix: &SubnetPrefix) -> Vec<HostConfig> {
        self.pending_hosts
            .lock()
            .unwrap()
            .remove(prefix)
            .unwrap_or_default()
    }

    pub fn add_listen_if_not_known(&self, listen: ListenConfig) -> bool {
        let mut known = self.known_listens.lock().unwrap();
        if known.contains_key(&listen.name) {
            return false;
        }
        known.insert(listen.name.clone(), listen);
        true
    }

    pub fn remove_listen(&self, name: &str) -> Option<ListenConfig> {
        self.known_listens.lock().unwrap().remove(name)
    }

    /// Ingest a newly arrived leases batch if its name isn't already
    /// known; returns the batch back so the caller can apply it to the
    /// `Server` (leases batches are applied outside the cache's lock).
    pub fn add_lease_batch_if_not_known(&self, batch: LeaseBatch) -> Option<LeaseBatch> {
        let mut batches = self.lease_batches.lock().unwrap();
        if batches.contains_key(&batch.name) {
            return None;
        }
        for lease in &batch.leases {
            self.known_macs.write().unwrap().insert(lease.mac.clone());
        }
        batches.insert(batch.name.clone(), batch.clone());
        Some(batch)
    }

    /// Remove a deleted batch and return it plus the set of MACs still
    /// covered by a *remaining* batch, so the caller knows which leases
    /// in the deleted batch are safe to evict.
    pub fn pop_lease_batch(&self, name: &str) -> Option<(LeaseBatch, HashSet<String>)> {
        let mut batches = self.lease_batches.lock().unwrap();
        let batch = batches.remove(name)?;
        let still_known: HashSet<String> = batches
            .values()
            .flat_map(|b| b.leases.iter().map(|l| l.mac.clone()))
            .collect();
        Some((batch, still_known))
    }

    /// Every batch currently cached, oldest `created_at` first — the
    /// order leases batches must be replayed in at startup.
    pub fn lease_batches_oldest_first(&self) -> Vec<LeaseBatch> {
        let batches = self.lease_batches.lock().unwrap();
        let mut all: Vec<LeaseBatch> = batches.values().cloned().collect();
        all.sort_by_key(|b| b.created_at);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn host(subnet: &str, mac: &str) -> HostConfig {
        HostConfig {
            subnet: subnet.to_string(),
            mac: mac.to_string(),
            ip: "10.1.1.50".parse().unwrap(),
            gateway: None,
            dns: vec![],
            options: vec![],
            lease_time_secs: None,
            boot_file_name: None,
            server_host_name: None,
            host_name: None,
        }
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
    fn host_deferred_until_subnet_known() {
        let cache = ObjectCache::new();
        assert!(cache.add_host_if_not_known(host("10.1.1.0/24", "aa:bb:cc:dd:ee:ff")));
        assert!(cache.add_subnet_if_not_known(&"10.1.1.0/24".to_string()));
        let drained = cache.pop_pending_hosts(&"10.1.1.0/24".to_string());
        assert_eq!(drained.len(), 1);
        assert!(cache.pop_pending_hosts(&"10.1.1.0/24".to_string()).is_empty());
    }

    #[test]
    fn host_installed_immediately_when_subnet_already_known() {
        let cache = ObjectCache::new();
        cache.add_subnet_if_not_known(&"10.1.1.0/24".to_string());
        assert!(!cache.add_host_if_not_known(host("10.1.1.0/24", "aa:bb:cc:dd:ee:ff")));
    }

    #[test]
    fn listen_add_then_delete_round_trips() {
        let cache = ObjectCache::new();
        let listen = ListenConfig {
            name: "br0".to_string(),
            interface: Some("br0".to_string()),
            address: None,
        };
        assert!(cache.add_listen_if_not_known(listen.clone()));
        // Redelivery of the same add is a no-op.
        assert!(!cache.add_listen_if_not_known(listen.clone()));
        let removed = cache.remove_listen("br0");
        assert_eq!(removed, Some(listen.clone()));
        // Once removed, it's gone — a later re-add is accepted again.
        assert!(cache.remove_listen("br0").is_none());
        assert!(cache.add_listen_if_not_known(listen));
    }

    #[test]
    fn lease_batch_delete_keeps_macs_covered_elsewhere() {
        let cache = ObjectCache::new();
        let b1 = LeaseBatch {
            name: "b1".into(),
            created_at: Utc::now() - chrono::Duration::seconds(10),
            leases: vec![lease("aa:bb:cc:dd:ee:ff", "10.1.1.10")],
        };
        let b2 = LeaseBatch {
            name: "b2".into(),
            created_at: Utc::now(),
            leases: vec![lease("aa:bb:cc:dd:ee:ff", "10.1.1.10")],
        };
        cache.add_lease_batch_if_not_known(b1.clone());
        cache.add_lease_batch_if_not_known(b2);

        let (popped, still_known) = cache.pop_lease_batch("b1").unwrap();
        assert_eq!(popped.name, "b1");
        assert!(still_known.contains("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn lease_batches_replay_oldest_first() {
        let cache = ObjectCache::new();
        let older = LeaseBatch {
            name: "old".into(),
            created_at: Utc::now() - chrono::Duration::seconds(100),
            leases: vec![],
        };
        let newer = LeaseBatch {
            name: "new".into(),
            created_at: Utc::now(),
            leases: vec![],
        };
        cache.add_lease_batch_if_not_known(newer);
        cache.add_lease_batch_if_not_known(older);
        let ordered = cache.lease_batches_oldest_first();
        assert_eq!(ordered[0].name, "old");
        assert_eq!(ordered[1].name, "new");
    }

    #[test]
    fn duplicate_subnet_registration_reported() {
        let cache = ObjectCache::new();
        assert!(cache.add_subnet_if_not_known(&"10.1.1.0/24".to_string()));
        assert!(!cache.add_subnet_if_not_known(&"10.1.1.0/24".to_string()));
    }
}
