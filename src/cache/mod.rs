//! In-memory candle cache
//!
//! - `ring`: fixed-capacity rolling history per (symbol, interval)
//! - `table`: interval -> ring map for one symbol, with the merge rule
//! - `market`: sharded symbol -> table map, lazily populated
//! - `directory`: the tradeable symbol set and its trading rules

pub mod directory;
pub mod market;
pub mod ring;
pub mod table;

pub use directory::{DirectoryFilter, DirectorySnapshot, SymbolDirectory};
pub use market::MarketCache;
pub use ring::{RingBuffer, RingStore};
pub use table::{IntervalTable, MergeOutcome};
