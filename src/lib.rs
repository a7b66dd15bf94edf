//! Kline Crawler Library
//!
//! Keeps a bounded, queryable candle history per (symbol, interval) for a
//! whole futures venue, fed by a history warm-up and a live kline stream.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod models;

pub use cache::{IntervalTable, MarketCache, MergeOutcome, RingStore, SymbolDirectory};
pub use config::CrawlerConfig;
pub use error::{CacheError, IngestError};
pub use feed::{FeedEvent, FeedProvider, Subscription};
pub use ingest::{IngestionPipeline, PipelineState};
pub use models::{Candle, ChartSnapshot, KlineEvent, SymbolInfo, TradingFilters};
