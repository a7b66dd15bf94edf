//! Per-symbol interval table
//!
//! Maps interval labels ("5m", "1h", ...) to the ring holding that interval's
//! history. Rings are created on first write only, so a missing ring means
//! "not warmed yet" rather than an error.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::ring::RingStore;
use crate::models::{Candle, ChartSnapshot};

/// Result of merging one candle into a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Appended as a new bucket
    Inserted,
    /// Refreshed the last stored bucket in place
    Updated,
    /// Opens before the last stored bucket; ignored
    Rejected,
}

pub struct IntervalTable {
    symbol: String,
    capacity: usize,
    rings: RwLock<HashMap<String, Arc<RingStore<Candle>>>>,
    /// Last write to any interval (ms since epoch)
    update_time: AtomicI64,
}

impl IntervalTable {
    pub fn new(symbol: impl Into<String>, capacity: usize) -> Self {
        Self {
            symbol: symbol.into(),
            capacity,
            rings: RwLock::new(HashMap::new()),
            update_time: AtomicI64::new(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Read-only lookup; never creates a ring.
    pub fn get_ring(&self, interval: &str) -> Option<Arc<RingStore<Candle>>> {
        self.rings.read().get(interval).cloned()
    }

    /// Ring for `interval`, created on first use.
    pub fn ensure_ring(&self, interval: &str) -> Arc<RingStore<Candle>> {
        if let Some(ring) = self.rings.read().get(interval) {
            return Arc::clone(ring);
        }

        let mut rings = self.rings.write();
        rings
            .entry(interval.to_string())
            .or_insert_with(|| Arc::new(RingStore::new(self.capacity)))
            .clone()
    }

    /// Fold a live candle into the ring for `interval`.
    ///
    /// Same bucket as the last stored candle refreshes it in place; a later
    /// bucket is appended; an earlier one is rejected.
    pub fn merge_candle(&self, interval: &str, candle: Candle) -> MergeOutcome {
        let ring = self.ensure_ring(interval);
        let outcome = ring.modify(|buf| {
            let Some((last, slot)) = buf.last().ok().map(|(c, s)| (c.clone(), s)) else {
                buf.insert(candle);
                return MergeOutcome::Inserted;
            };

            if last.same_bucket(&candle) {
                let mut refreshed = last;
                refreshed.refresh_from(&candle);
                // The slot came from last() under the same lock, so it is written.
                match buf.update_at(slot, refreshed) {
                    Ok(()) => MergeOutcome::Updated,
                    Err(e) => {
                        debug!(symbol = %self.symbol, interval, error = %e, "refresh skipped");
                        MergeOutcome::Rejected
                    }
                }
            } else if candle.open_time > last.open_time {
                buf.insert(candle);
                MergeOutcome::Inserted
            } else {
                debug!(
                    symbol = %self.symbol,
                    interval,
                    open_time = candle.open_time,
                    last_open_time = last.open_time,
                    "out-of-order candle rejected"
                );
                MergeOutcome::Rejected
            }
        });

        self.touch();
        trace!(symbol = %self.symbol, interval, ?outcome, "candle merged");
        outcome
    }

    /// Apply a fetched history batch (assumed ordered by open time).
    ///
    /// Returns the number of candles the ring holds afterwards.
    pub fn merge_history(&self, interval: &str, candles: Vec<Candle>) -> usize {
        let ring = self.ensure_ring(interval);
        let len = ring.modify(|buf| {
            let newest_stored = buf.last().ok().map(|(c, _)| c.open_time);
            let batch_first = candles.first().map(|c| c.open_time);

            match (newest_stored, batch_first) {
                (Some(stored), Some(first)) if first < stored => {
                    // Live data already landed past the start of this batch:
                    // rebuild from the union, keeping the stored candle for a
                    // shared bucket.
                    let mut merged: Vec<Candle> = buf.ascending();
                    let stored_times: HashSet<i64> = merged.iter().map(|c| c.open_time).collect();
                    merged.extend(
                        candles
                            .into_iter()
                            .filter(|c| !stored_times.contains(&c.open_time)),
                    );
                    merged.sort_by_key(|c| c.open_time);
                    buf.reset(merged);
                    debug!(symbol = %self.symbol, interval, "history folded into live data");
                }
                _ => {
                    for candle in candles {
                        let last = buf.last().ok().map(|(c, s)| (c.clone(), s));
                        match last {
                            Some((mut last, slot)) if last.same_bucket(&candle) => {
                                last.refresh_from(&candle);
                                let _ = buf.update_at(slot, last);
                            }
                            Some((last, _)) if candle.open_time <= last.open_time => {}
                            _ => buf.insert(candle),
                        }
                    }
                }
            }
            buf.len()
        });

        self.touch();
        len
    }

    /// Intervals that have at least one ring, sorted.
    pub fn intervals(&self) -> Vec<String> {
        let mut out: Vec<String> = self.rings.read().keys().cloned().collect();
        out.sort();
        out
    }

    pub fn update_time(&self) -> i64 {
        self.update_time.load(Ordering::Acquire)
    }

    /// Copy every ring oldest-first.
    pub fn snapshot(&self) -> ChartSnapshot {
        // Clone the ring handles first so the map lock is not held while
        // copying candles out.
        let rings: Vec<(String, Arc<RingStore<Candle>>)> = self
            .rings
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let candles = rings
            .into_iter()
            .map(|(interval, ring)| (interval, ring.ascending()))
            .collect();

        ChartSnapshot {
            symbol: self.symbol.clone(),
            update_time: self.update_time(),
            candles,
        }
    }

    fn touch(&self) {
        self.update_time
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }
}

impl std::fmt::Debug for IntervalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalTable")
            .field("symbol", &self.symbol)
            .field("capacity", &self.capacity)
            .field("intervals", &self.intervals())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::candle;

    fn open_times(table: &IntervalTable, interval: &str) -> Vec<i64> {
        table
            .get_ring(interval)
            .map(|r| r.ascending().iter().map(|c| c.open_time).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_ring_absent_until_first_write() {
        let table = IntervalTable::new("BTCUSDT", 10);
        assert!(table.get_ring("1h").is_none());

        let c = candle(0, 3_599_999, "100.5");
        assert_eq!(table.merge_candle("1h", c.clone()), MergeOutcome::Inserted);

        let ring = table.get_ring("1h").unwrap();
        assert_eq!(ring.ascending(), vec![c]);
        assert!(table.update_time() > 0);
    }

    #[test]
    fn test_refresh_then_append_at_capacity() {
        let table = IntervalTable::new("BTCUSDT", 3);
        for t in 1..=4 {
            table.merge_candle("1m", candle(t, t * 10, "1.0"));
        }
        assert_eq!(open_times(&table, "1m"), vec![2, 3, 4]);

        let outcome = table.merge_candle("1m", candle(4, 40, "2.5"));
        assert_eq!(outcome, MergeOutcome::Updated);

        let ring = table.get_ring("1m").unwrap();
        let stored = ring.ascending();
        assert_eq!(open_times(&table, "1m"), vec![2, 3, 4]);
        assert_eq!(stored[2].close, "2.5");
        assert_eq!(stored[2].open, "100.0");
    }

    #[test]
    fn test_repeated_refresh_keeps_count() {
        let table = IntervalTable::new("ETHUSDT", 5);
        table.merge_candle("5m", candle(0, 299_999, "10"));
        table.merge_candle("5m", candle(300_000, 599_999, "11"));

        for close in ["12", "13", "9"] {
            table.merge_candle("5m", candle(300_000, 599_999, close));
        }

        let ring = table.get_ring("5m").unwrap();
        let stored = ring.ascending();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].close, "10");
        assert_eq!(stored[1].close, "9");
    }

    #[test]
    fn test_out_of_order_rejected() {
        let table = IntervalTable::new("ETHUSDT", 5);
        table.merge_candle("5m", candle(600_000, 899_999, "10"));

        let outcome = table.merge_candle("5m", candle(300_000, 599_999, "11"));
        assert_eq!(outcome, MergeOutcome::Rejected);
        assert_eq!(open_times(&table, "5m"), vec![600_000]);
    }

    #[test]
    fn test_history_into_empty_ring() {
        let table = IntervalTable::new("BTCUSDT", 3);
        let batch: Vec<Candle> = (1..=5).map(|t| candle(t, t * 10, "1")).collect();
        assert_eq!(table.merge_history("1h", batch), 3);
        assert_eq!(open_times(&table, "1h"), vec![3, 4, 5]);
    }

    #[test]
    fn test_history_after_live_is_folded_in() {
        let table = IntervalTable::new("BTCUSDT", 10);
        // Streaming landed first
        table.merge_candle("1h", candle(4, 40, "live"));

        let batch: Vec<Candle> = (1..=4).map(|t| candle(t, t * 10, "hist")).collect();
        table.merge_history("1h", batch);

        let stored = table.get_ring("1h").unwrap().ascending();
        assert_eq!(open_times(&table, "1h"), vec![1, 2, 3, 4]);
        assert_eq!(stored[3].close, "live");

        // The live stream keeps working on the rebuilt ring
        assert_eq!(table.merge_candle("1h", candle(5, 50, "x")), MergeOutcome::Inserted);
        assert_eq!(open_times(&table, "1h"), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_full_history_folded_under_live_candles() {
        let table = IntervalTable::new("BTCUSDT", 500);
        for t in 495..=500 {
            table.merge_candle("1h", candle(t, t * 10 + 9, "live"));
        }

        let batch: Vec<Candle> = (1..=500).map(|t| candle(t, t * 10 + 9, "hist")).collect();
        assert_eq!(table.merge_history("1h", batch), 500);

        let stored = table.get_ring("1h").unwrap().ascending();
        let times: Vec<i64> = stored.iter().map(|c| c.open_time).collect();
        assert_eq!(times, (1..=500).collect::<Vec<i64>>());
        assert!(stored[..494].iter().all(|c| c.close == "hist"));
        assert!(stored[494..].iter().all(|c| c.close == "live"));
    }

    #[test]
    fn test_history_extends_existing() {
        let table = IntervalTable::new("BTCUSDT", 10);
        table.merge_history("1h", vec![candle(1, 10, "a"), candle(2, 20, "a")]);
        table.merge_history("1h", vec![candle(2, 20, "b"), candle(3, 30, "b")]);

        let stored = table.get_ring("1h").unwrap().ascending();
        assert_eq!(open_times(&table, "1h"), vec![1, 2, 3]);
        assert_eq!(stored[1].close, "b");
    }

    #[test]
    fn test_snapshot_lists_intervals() {
        let table = IntervalTable::new("BTCUSDT", 4);
        table.merge_candle("4h", candle(0, 1, "1"));
        table.merge_candle("1h", candle(0, 1, "1"));

        assert_eq!(table.intervals(), vec!["1h".to_string(), "4h".to_string()]);
        let snap = table.snapshot();
        assert_eq!(snap.symbol, "BTCUSDT");
        assert_eq!(snap.candles.len(), 2);
        assert_eq!(snap.candles["4h"].len(), 1);
    }
}
