//! Market data provider contract
//!
//! The pipeline only talks to `FeedProvider`; `binance` is the one concrete
//! implementation shipped with the crate.

pub mod binance;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use crate::models::{Candle, KlineEvent, SymbolInfo};

pub use binance::BinanceFuturesFeed;

/// Item delivered by a live subscription
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Kline(KlineEvent),
    /// Connection-level failure; the provider keeps reconnecting
    Error(String),
}

/// Cancellable stream of push events for one interval.
///
/// Dropping the subscription has the same effect as [`Subscription::close`]:
/// the provider's connection tasks observe the closed signal and exit.
pub struct Subscription {
    events: mpsc::Receiver<FeedEvent>,
    closer: watch::Sender<bool>,
}

impl Subscription {
    /// Pair a subscription with the signal its producer tasks watch.
    pub fn new(events: mpsc::Receiver<FeedEvent>) -> (Self, watch::Receiver<bool>) {
        let (closer, closed) = watch::channel(false);
        (Self { events, closer }, closed)
    }

    /// Next event, or `None` once every producer has gone away.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        let _ = self.closer.send(true);
        // No receivers left means the producers already exited
    }

    pub fn is_closed(&self) -> bool {
        *self.closer.borrow()
    }
}

#[async_trait::async_trait]
pub trait FeedProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Every symbol the venue lists, with asset metadata and trading rules.
    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>>;

    /// Up to `limit` most recent candles, ordered by open time.
    async fn fetch_history(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Open a live stream of candle updates for `symbols` on one interval.
    async fn subscribe(&self, interval: &str, symbols: &[String]) -> Result<Subscription>;
}

/// Wait until `closed` flips to true or its sender goes away.
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_signals_producers() {
        let (_tx, rx) = mpsc::channel(1);
        let (sub, mut closed) = Subscription::new(rx);
        assert!(!sub.is_closed());

        sub.close();
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut closed))
            .await
            .unwrap();
        assert!(sub.is_closed());
    }

    #[tokio::test]
    async fn test_drop_signals_producers() {
        let (_tx, rx) = mpsc::channel(1);
        let (sub, mut closed) = Subscription::new(rx);
        drop(sub);
        tokio::time::timeout(Duration::from_secs(1), wait_closed(&mut closed))
            .await
            .unwrap();
    }
}
