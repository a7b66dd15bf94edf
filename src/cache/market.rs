//! Sharded symbol -> table map
//!
//! The only place tables are created. Each shard has its own lock so lazy
//! creation for one symbol never blocks lookups for symbols on other shards.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::ring::RingStore;
use super::table::IntervalTable;
use crate::error::CacheError;
use crate::models::{Candle, ChartSnapshot};

type Shard = RwLock<HashMap<String, Arc<IntervalTable>>>;

pub struct MarketCache {
    shards: Vec<Shard>,
    ring_capacity: usize,
}

impl MarketCache {
    pub fn new(shard_count: usize, ring_capacity: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            ring_capacity,
        }
    }

    /// Table for `symbol`, created on first access.
    pub fn get_table(&self, symbol: &str) -> Arc<IntervalTable> {
        let shard = self.shard(symbol);

        // Fast path: check if exists
        {
            let tables = shard.read();
            if let Some(table) = tables.get(symbol) {
                return Arc::clone(table);
            }
        }

        // Slow path: re-check under the write lock
        let mut tables = shard.write();
        tables
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(IntervalTable::new(symbol, self.ring_capacity)))
            .clone()
    }

    /// Read-only lookup for consumers; never creates.
    pub fn table(&self, symbol: &str) -> Option<Arc<IntervalTable>> {
        self.shard(symbol).read().get(symbol).cloned()
    }

    /// Ring for one (symbol, interval) pair, distinguishing which level is
    /// missing.
    pub fn ring(&self, symbol: &str, interval: &str) -> Result<Arc<RingStore<Candle>>, CacheError> {
        let table = self
            .table(symbol)
            .ok_or_else(|| CacheError::not_found("table", symbol))?;
        table
            .get_ring(interval)
            .ok_or_else(|| CacheError::not_found("ring", format!("{}/{}", symbol, interval)))
    }

    /// Drop a symbol's table. Readers holding the `Arc` keep their copy.
    pub fn remove(&self, symbol: &str) -> Option<Arc<IntervalTable>> {
        self.shard(symbol).write().remove(symbol)
    }

    /// Every symbol with a table, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, symbol: &str) -> Option<ChartSnapshot> {
        self.table(symbol).map(|t| t.snapshot())
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    #[inline]
    fn shard(&self, symbol: &str) -> &Shard {
        &self.shards[shard_index(symbol, self.shards.len())]
    }
}

/// FNV-1a over the symbol bytes.
#[inline]
fn shard_index(symbol: &str, shard_count: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in symbol.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % shard_count as u64) as usize
}
