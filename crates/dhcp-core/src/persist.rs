use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::Result;
use crate::model::LeaseBatch;

/// Leases batch table: batch name -> `LeaseBatch` JSON.
const BATCHES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("lease_batches");

/// Sink for leases batches as they are produced by the request
/// processing pipeline. `RedbLeaseSink` is the concrete, durable
/// implementation; `#[cfg(test)]` code uses an in-memory stand-in.
pub trait LeaseSink: Send + Sync {
    fn save(&self, batch: &LeaseBatch) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
    /// Every stored batch, oldest `created_at` first — the order they
    /// must be replayed in at startup.
    fn load_all(&self) -> Result<Vec<LeaseBatch>>;
}

/// redb-backed `LeaseSink`, one table keyed by batch name. Mirrors the
/// lease/mac/ip index pattern used for per-lease storage, but batches
/// are the unit of persistence here (spec.md's `LeasesBatch` entity),
/// so a single table keyed by batch name is all that's needed.
#[derive(Clone)]
pub struct RedbLeaseSink {
    db: Arc<Database>,
}

impl RedbLeaseSink {
    pub fn open(path: &Path) -> Result<RedbLeaseSink> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(BATCHES_TABLE)?;
        }
        write_txn.commit()?;
        Ok(RedbLeaseSink { db: Arc::new(db) })
    }
}

impl LeaseSink for RedbLeaseSink {
    fn save(&self, batch: &LeaseBatch) -> Result<()> {
        let json = serde_json::to_string(batch)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BATCHES_TABLE)?;
            table.insert(batch.name.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(BATCHES_TABLE)?;
            table.remove(name)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<LeaseBatch>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BATCHES_TABLE)?;
        let mut batches = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry.map_err(|e| crate::error::EngineError::Database(e.to_string()))?;
            batches.push(serde_json::from_str(v.value())?);
        }
        batches.sort_by_key(|b: &LeaseBatch| b.created_at);
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn lease_batch(name: &str, offset_secs: i64) -> LeaseBatch {
        LeaseBatch {
            name: name.to_string(),
            created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
            leases: vec![crate::model::Lease {
                subnet: "10.1.1.0/24".into(),
                mac: "aa:bb:cc:dd:ee:ff".into(),
                ip: Ipv4Addr::new(10, 1, 1, 10),
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
            }],
        }
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let sink = RedbLeaseSink::open(&dir.path().join("leases.redb")).unwrap();
        sink.save(&lease_batch("b1", 0)).unwrap();
        let loaded = sink.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].leases[0].mac, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn loads_oldest_first() {
        let dir = TempDir::new().unwrap();
        let sink = RedbLeaseSink::open(&dir.path().join("leases.redb")).unwrap();
        sink.save(&lease_batch("newer", 100)).unwrap();
        sink.save(&lease_batch("older", -100)).unwrap();
        let loaded = sink.load_all().unwrap();
        assert_eq!(loaded[0].name, "older");
        assert_eq!(loaded[1].name, "newer");
    }

    #[test]
    fn delete_removes_batch() {
        let dir = TempDir::new().unwrap();
        let sink = RedbLeaseSink::open(&dir.path().join("leases.redb")).unwrap();
        sink.save(&lease_batch("b1", 0)).unwrap();
        sink.delete("b1").unwrap();
        assert!(sink.load_all().unwrap().is_empty());
    }
}
