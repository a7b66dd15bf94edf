//! Tradeable symbol registry
//!
//! Holds the working symbol set and each symbol's trading rules. A sync builds
//! a complete new snapshot off to the side and publishes it with one pointer
//! swap, so readers see either the old set or the new set, never a mix.

use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::models::SymbolInfo;

/// Immutable directory contents (swapped wholesale)
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    /// Sorted symbol identifiers
    pub symbols: Vec<String>,
    pub by_symbol: HashMap<String, SymbolInfo>,
    /// Wall-clock time of the sync that produced this snapshot (ms since epoch)
    pub synced_at: i64,
}

/// Rules applied to the provider's symbol list at sync time
#[derive(Debug, Clone)]
pub struct DirectoryFilter {
    pub settlement_asset: String,
    pub deny_list: HashSet<String>,
}

impl DirectoryFilter {
    pub fn new(settlement_asset: impl Into<String>, deny_list: impl IntoIterator<Item = String>) -> Self {
        Self {
            settlement_asset: settlement_asset.into(),
            deny_list: deny_list.into_iter().collect(),
        }
    }

    /// Whether a provider symbol belongs in the working set.
    pub fn accepts(&self, info: &SymbolInfo) -> bool {
        // Dated delivery contracts carry an underscore (BTCUSDT_240628)
        if info.symbol.contains('_') {
            return false;
        }
        if info.quote_asset != self.settlement_asset {
            return false;
        }
        if let Some(status) = info.status.as_deref() {
            if status != "TRADING" {
                return false;
            }
        }
        !self.deny_list.contains(&info.symbol)
    }
}

pub struct SymbolDirectory {
    filter: DirectoryFilter,
    current: ArcSwap<DirectorySnapshot>,
}

impl SymbolDirectory {
    pub fn new(filter: DirectoryFilter) -> Self {
        Self {
            filter,
            current: ArcSwap::from_pointee(DirectorySnapshot::default()),
        }
    }

    /// Replace the working set with the filtered provider list.
    ///
    /// Returns how many symbols were kept.
    pub fn sync(&self, provider_symbols: Vec<SymbolInfo>) -> usize {
        let offered = provider_symbols.len();
        let by_symbol: HashMap<String, SymbolInfo> = provider_symbols
            .into_iter()
            .filter(|info| self.filter.accepts(info))
            .map(|info| (info.symbol.clone(), info))
            .collect();

        let mut symbols: Vec<String> = by_symbol.keys().cloned().collect();
        symbols.sort();
        let kept = symbols.len();

        self.current.store(Arc::new(DirectorySnapshot {
            symbols,
            by_symbol,
            synced_at: chrono::Utc::now().timestamp_millis(),
        }));

        debug!(offered, kept, "symbol directory synced");
        kept
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        self.current.load().by_symbol.get(symbol).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.current.load().symbols.clone()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.current.load().by_symbol.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.current.load().symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 0 until the first successful sync.
    pub fn synced_at(&self) -> i64 {
        self.current.load().synced_at
    }

    /// The whole current snapshot, for callers that need a consistent view
    /// across several lookups.
    pub fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradingFilters;

    fn info(symbol: &str, quote: &str, status: Option<&str>) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            pair: symbol.split('_').next().unwrap_or(symbol).to_string(),
            base_asset: symbol.trim_end_matches(quote).to_string(),
            quote_asset: quote.to_string(),
            margin_asset: quote.to_string(),
            status: status.map(str::to_string),
            filters: TradingFilters::default(),
        }
    }

    fn directory(deny: &[&str]) -> SymbolDirectory {
        SymbolDirectory::new(DirectoryFilter::new(
            "USDT",
            deny.iter().map(|s| s.to_string()),
        ))
    }

    #[test]
    fn test_sync_filters() {
        let dir = directory(&["LUNAUSDT"]);
        let kept = dir.sync(vec![
            info("BTCUSDT", "USDT", Some("TRADING")),
            info("ETHUSDT", "USDT", None),
            info("BTCUSDT_240628", "USDT", Some("TRADING")),
            info("ETHBUSD", "BUSD", Some("TRADING")),
            info("XYZUSDT", "USDT", Some("SETTLING")),
            info("LUNAUSDT", "USDT", Some("TRADING")),
        ]);

        assert_eq!(kept, 2);
        assert_eq!(dir.list(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(dir.contains("BTCUSDT"));
        assert!(!dir.contains("LUNAUSDT"));
        assert!(dir.get("ETHBUSD").is_none());
        assert!(dir.synced_at() > 0);
    }

    #[test]
    fn test_sync_replaces_wholesale() {
        let dir = directory(&[]);
        dir.sync(vec![info("BTCUSDT", "USDT", None), info("ETHUSDT", "USDT", None)]);

        let before = dir.snapshot();
        dir.sync(vec![info("SOLUSDT", "USDT", None)]);

        // A snapshot taken before the swap is untouched by it
        assert_eq!(before.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(dir.list(), vec!["SOLUSDT".to_string()]);
        assert!(!dir.contains("BTCUSDT"));
    }

    #[test]
    fn test_readers_never_see_partial_set() {
        let dir = Arc::new(directory(&[]));
        let set_a: Vec<SymbolInfo> = (0..50).map(|i| info(&format!("A{}USDT", i), "USDT", None)).collect();
        let set_b: Vec<SymbolInfo> = (0..80).map(|i| info(&format!("B{}USDT", i), "USDT", None)).collect();
        dir.sync(set_a.clone());

        let writer = {
            let dir = Arc::clone(&dir);
            std::thread::spawn(move || {
                for i in 0..200 {
                    if i % 2 == 0 {
                        dir.sync(set_b.clone());
                    } else {
                        dir.sync(set_a.clone());
                    }
                }
            })
        };

        for _ in 0..500 {
            let snap = dir.snapshot();
            let all_a = snap.symbols.iter().all(|s| s.starts_with('A'));
            let all_b = snap.symbols.iter().all(|s| s.starts_with('B'));
            assert!(all_a && snap.symbols.len() == 50 || all_b && snap.symbols.len() == 80);
            assert_eq!(snap.symbols.len(), snap.by_symbol.len());
        }
        writer.join().unwrap();
    }
}
