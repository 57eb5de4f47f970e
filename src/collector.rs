//! Where published slot records go.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::slot::SlotRecord;

pub trait Collector: Send + Sync {
    /// Store or replace the record for `record.name`.
    fn publish(&self, record: SlotRecord);

    /// Withdraw a slot's record (the slot was deleted or the daemon is exiting).
    fn invalidate(&self, name: &str);

    fn get(&self, name: &str) -> Option<SlotRecord>;

    fn records(&self) -> Vec<SlotRecord>;
}

/// In-process collector shared by the daemon, the dashboard and local peers.
#[derive(Clone, Default)]
pub struct MemoryCollector {
    records: Arc<RwLock<BTreeMap<String, SlotRecord>>>,
    updates: Arc<AtomicU64>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records published so far.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Collector for MemoryCollector {
    fn publish(&self, record: SlotRecord) {
        self.updates.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut records) = self.records.write() {
            records.insert(record.name.clone(), record);
        }
    }

    fn invalidate(&self, name: &str) {
        if let Ok(mut records) = self.records.write() {
            records.remove(name);
        }
    }

    fn get(&self, name: &str) -> Option<SlotRecord> {
        self.records.read().ok()?.get(name).cloned()
    }

    fn records(&self) -> Vec<SlotRecord> {
        self.records
            .read()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}
