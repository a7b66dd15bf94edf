//! Ingestion pipeline
//!
//! Lifecycle: `Idle -> WarmingUp -> Streaming -> Stopped`.
//!
//! 1. Directory sync (must succeed, otherwise startup fails)
//! 2. Warm-up: one task per interval walks the symbol list fetching history
//! 3. Streaming: one subscription task per interval, staggered
//! 4. Background: retry loop, directory refresh, snapshot publisher
//!
//! `Stop()` flips a watch flag every task selects on; tasks exit at their next
//! suspension point. An in-flight fetch is not cancelled, it finishes or times
//! out first.

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::limiter::RateLimiter;
use super::metrics::{PipelineMetrics, PipelineMetricsSnapshot};
use super::retry::{Cooldown, RetryEntry, RetryQueue};
use crate::cache::{DirectoryFilter, MarketCache, MergeOutcome, SymbolDirectory};
use crate::config::{IngestConfig, MarketConfig};
use crate::error::IngestError;
use crate::feed::{wait_closed, FeedEvent, FeedProvider};
use crate::models::{Candle, ChartSnapshot, KlineEvent};

const SUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_secs(1);
const SUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    WarmingUp,
    Streaming,
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::WarmingUp => "warming_up",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Point-in-time view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub retrying: bool,
    pub retry_queue_depth: usize,
    pub tracked_symbols: usize,
    pub cached_symbols: usize,
    pub directory_synced_at: i64,
    pub metrics: PipelineMetricsSnapshot,
}

pub struct IngestionPipeline {
    config: IngestConfig,
    intervals: Vec<String>,
    feed: Arc<dyn FeedProvider>,
    directory: Arc<SymbolDirectory>,
    market: Arc<MarketCache>,
    limiter: RateLimiter,
    retries: RetryQueue,
    state: RwLock<PipelineState>,
    retrying: AtomicBool,
    shutdown: watch::Sender<bool>,
    /// Bumped whenever a refresh changes the working symbol set
    directory_version: watch::Sender<u64>,
    snapshots: broadcast::Sender<Arc<ChartSnapshot>>,
    metrics: PipelineMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionPipeline {
    pub fn new(market: &MarketConfig, ingest: IngestConfig, feed: Arc<dyn FeedProvider>) -> Arc<Self> {
        let directory = SymbolDirectory::new(DirectoryFilter::new(
            market.settlement_asset.clone(),
            market.deny_list.iter().cloned(),
        ));
        let cache = MarketCache::new(market.shard_count, market.ring_capacity);
        let (shutdown, _) = watch::channel(false);
        let (directory_version, _) = watch::channel(0);
        let (snapshots, _) = broadcast::channel(ingest.publish_buffer.max(1));

        Arc::new(Self {
            limiter: RateLimiter::new(ingest.rate_limit_requests, ingest.rate_limit_window()),
            retries: RetryQueue::new(ingest.retry_queue_capacity),
            intervals: market.intervals.clone(),
            config: ingest,
            feed,
            directory: Arc::new(directory),
            market: Arc::new(cache),
            state: RwLock::new(PipelineState::Idle),
            retrying: AtomicBool::new(false),
            shutdown,
            directory_version,
            snapshots,
            metrics: PipelineMetrics::default(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn market(&self) -> &Arc<MarketCache> {
        &self.market
    }

    pub fn directory(&self) -> &Arc<SymbolDirectory> {
        &self.directory
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn intervals(&self) -> &[String] {
        &self.intervals
    }

    pub fn state(&self) -> PipelineState {
        *self.state.read()
    }

    /// True while the retry loop is working through queued entries
    pub fn is_retrying(&self) -> bool {
        self.retrying.load(Ordering::Acquire)
    }

    pub fn retry_queue_depth(&self) -> usize {
        self.retries.len()
    }

    /// Receive a `ChartSnapshot` per cached symbol every publish period.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<Arc<ChartSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state(),
            retrying: self.is_retrying(),
            retry_queue_depth: self.retries.len(),
            tracked_symbols: self.directory.len(),
            cached_symbols: self.market.len(),
            directory_synced_at: self.directory.synced_at(),
            metrics: self.metrics.snapshot(),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Sync the directory, warm up every interval, then start streaming and
    /// the background loops. Returns once streaming has been launched.
    pub async fn start(self: &Arc<Self>) -> Result<(), IngestError> {
        if !self.transition(PipelineState::Idle, PipelineState::WarmingUp) {
            warn!(state = %self.state(), "start ignored, pipeline not idle");
            return Ok(());
        }

        let kept = match self.sync_directory().await {
            Ok(kept) => kept,
            Err(e) => {
                error!(error = %e, "initial symbol sync failed");
                self.set_state(PipelineState::Stopped);
                let _ = self.shutdown.send_replace(true);
                return Err(e);
            }
        };
        info!(
            feed = self.feed.name(),
            symbols = kept,
            intervals = ?self.intervals,
            "symbol directory ready, warming up"
        );

        let symbols = Arc::new(self.directory.list());
        let walks: Vec<JoinHandle<()>> = self
            .intervals
            .iter()
            .map(|interval| {
                let pipeline = Arc::clone(self);
                let interval = interval.clone();
                let symbols = Arc::clone(&symbols);
                tokio::spawn(async move { pipeline.warm_interval(interval, symbols).await })
            })
            .collect();

        for res in join_all(walks).await {
            if let Err(e) = res {
                error!(error = %e, "warm-up task panicked");
            }
        }

        if !self.transition(PipelineState::WarmingUp, PipelineState::Streaming) {
            info!("stopped during warm-up");
            return Ok(());
        }
        info!(
            cached = self.market.len(),
            queued_retries = self.retries.len(),
            "warm-up finished, streaming"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(self).retry_loop()));

        let stagger = self.config.subscribe_stagger();
        for (i, interval) in self.intervals.iter().enumerate() {
            let delay = stagger * i as u32;
            tasks.push(tokio::spawn(
                Arc::clone(self).stream_interval(interval.clone(), delay),
            ));
        }

        if self.config.directory_refresh_secs > 0 {
            tasks.push(tokio::spawn(Arc::clone(self).refresh_loop()));
        }
        if self.config.publish_interval_secs > 0 {
            tasks.push(tokio::spawn(Arc::clone(self).publish_loop()));
        }

        Ok(())
    }

    /// Request shutdown. Terminal; safe to call from any state.
    pub fn stop(&self) {
        self.set_state(PipelineState::Stopped);
        let _ = self.shutdown.send_replace(true);
        info!("pipeline stop requested");
    }

    /// Wait for every background task to exit.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for res in join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "pipeline task panicked");
            }
        }
        self.retrying.store(false, Ordering::Release);
    }

    fn set_state(&self, to: PipelineState) {
        let mut state = self.state.write();
        if *state != PipelineState::Stopped {
            *state = to;
        }
    }

    /// Move `from -> to` only if currently in `from`.
    fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        let mut state = self.state.write();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `d` unless shutdown comes first. Returns true on shutdown.
    async fn sleep_or_stop(&self, stop: &mut watch::Receiver<bool>, d: Duration) -> bool {
        if d.is_zero() {
            tokio::task::yield_now().await;
            return *stop.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => *stop.borrow(),
            _ = wait_closed(stop) => true,
        }
    }

    // =========================================================================
    // DIRECTORY
    // =========================================================================

    async fn sync_directory(&self) -> Result<usize, IngestError> {
        match self.feed.list_symbols().await {
            Ok(list) => {
                PipelineMetrics::incr(&self.metrics.directory_syncs);
                Ok(self.directory.sync(list))
            }
            Err(e) => {
                PipelineMetrics::incr(&self.metrics.directory_sync_failures);
                Err(IngestError::Sync(e))
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let period = self.config.directory_refresh();

        loop {
            if self.sleep_or_stop(&mut stop, period).await {
                break;
            }

            let before: HashSet<String> = self.directory.list().into_iter().collect();
            match self.sync_directory().await {
                Ok(kept) => {
                    let after: HashSet<String> = self.directory.list().into_iter().collect();
                    if after == before {
                        debug!(symbols = kept, "symbol set unchanged");
                        continue;
                    }

                    let added: Vec<&String> = after.difference(&before).collect();
                    let removed: Vec<&String> = before.difference(&after).collect();
                    info!(
                        symbols = kept,
                        added = added.len(),
                        removed = removed.len(),
                        "symbol set changed"
                    );

                    for symbol in removed {
                        if self.market.remove(symbol).is_some() {
                            debug!(symbol = %symbol, "delisted symbol evicted");
                        }
                    }

                    // New listings have no history yet
                    for symbol in added {
                        for interval in &self.intervals {
                            let entry = RetryEntry {
                                symbol: symbol.clone(),
                                interval: interval.clone(),
                                attempts: 0,
                            };
                            self.enqueue_retry(entry);
                        }
                    }
                    self.directory_version.send_modify(|v| *v += 1);
                }
                Err(e) => {
                    warn!(error = %e, "symbol refresh failed, keeping previous set");
                }
            }
        }
        debug!("refresh loop exited");
    }

    // =========================================================================
    // WARM-UP
    // =========================================================================

    async fn warm_interval(self: Arc<Self>, interval: String, symbols: Arc<Vec<String>>) {
        let mut stop = self.shutdown.subscribe();
        let pacing = self.config.fetch_pacing();
        let mut loaded = 0usize;

        for (i, symbol) in symbols.iter().enumerate() {
            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = wait_closed(&mut stop) => return,
            }

            match self.fetch(symbol, &interval).await {
                Ok(candles) => {
                    self.apply_history(symbol, &interval, candles);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(error = %e, "warm-up fetch failed, queued for retry");
                    self.enqueue_retry(RetryEntry::new(symbol.as_str(), interval.as_str()));
                }
            }

            if i + 1 < symbols.len() && self.sleep_or_stop(&mut stop, pacing).await {
                return;
            }
        }

        info!(interval = %interval, loaded, total = symbols.len(), "warm-up walk finished");
    }

    async fn fetch(&self, symbol: &str, interval: &str) -> Result<Vec<Candle>, IngestError> {
        let limit = self.config.history_limit;
        let timeout = self.config.fetch_timeout();

        let result = match tokio::time::timeout(
            timeout,
            self.feed.fetch_history(symbol, interval, limit),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
        };

        match result {
            Ok(candles) => {
                PipelineMetrics::incr(&self.metrics.fetches_ok);
                Ok(candles)
            }
            Err(source) => {
                PipelineMetrics::incr(&self.metrics.fetches_failed);
                Err(IngestError::Fetch {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    source,
                })
            }
        }
    }

    fn apply_history(&self, symbol: &str, interval: &str, candles: Vec<Candle>) {
        if candles.is_empty() {
            debug!(symbol, interval, "empty history");
            return;
        }
        // The symbol may have been delisted while the fetch was in flight
        if !self.directory.contains(symbol) {
            debug!(symbol, interval, "history for untracked symbol discarded");
            return;
        }
        self.metrics
            .candles_loaded
            .fetch_add(candles.len() as u64, Ordering::Relaxed);
        let held = self.market.get_table(symbol).merge_history(interval, candles);
        trace!(symbol, interval, held, "history applied");
    }

    fn enqueue_retry(&self, entry: RetryEntry) {
        if self.retries.push(entry) {
            PipelineMetrics::incr(&self.metrics.retries_queued);
        } else {
            PipelineMetrics::incr(&self.metrics.retries_dropped);
            warn!(capacity = self.retries.capacity(), "retry queue full, entry dropped");
        }
    }

    // =========================================================================
    // RETRY
    // =========================================================================

    async fn retry_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let mut cooldown = Cooldown::new(
            self.config.retry_cooldown_threshold,
            self.config.retry_cooldown(),
        );

        loop {
            let entry = match self.retries.pop() {
                Some(entry) => entry,
                None => {
                    self.retrying.store(false, Ordering::Release);
                    cooldown.reset();
                    tokio::select! {
                        entry = self.retries.next() => entry,
                        _ = wait_closed(&mut stop) => break,
                    }
                }
            };
            self.retrying.store(true, Ordering::Release);

            if !self.directory.contains(&entry.symbol) {
                debug!(symbol = %entry.symbol, "retry skipped, symbol no longer tracked");
                continue;
            }

            if let Some(pause) = cooldown.tick() {
                PipelineMetrics::incr(&self.metrics.cooldowns);
                info!(pause_secs = pause.as_secs(), "retry cooldown");
                if self.sleep_or_stop(&mut stop, pause).await {
                    break;
                }
            }

            tokio::select! {
                _ = self.limiter.acquire() => {}
                _ = wait_closed(&mut stop) => break,
            }

            match self.fetch(&entry.symbol, &entry.interval).await {
                Ok(candles) => {
                    self.apply_history(&entry.symbol, &entry.interval, candles);
                    PipelineMetrics::incr(&self.metrics.retries_succeeded);
                    debug!(
                        symbol = %entry.symbol,
                        interval = %entry.interval,
                        attempts = entry.attempts,
                        "retry succeeded"
                    );
                }
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.retries_failed);
                    warn!(error = %e, attempts = entry.attempts, "retry failed, requeued");
                    self.enqueue_retry(entry.next_attempt());
                }
            }

            if self.sleep_or_stop(&mut stop, self.config.retry_delay()).await {
                break;
            }
        }

        self.retrying.store(false, Ordering::Release);
        debug!("retry loop exited");
    }

    // =========================================================================
    // STREAMING
    // =========================================================================

    /// Route one push event into the cache. `None` when the symbol is not in
    /// the working set.
    pub fn handle_event(&self, event: KlineEvent) -> Option<MergeOutcome> {
        PipelineMetrics::incr(&self.metrics.events_received);

        if !self.directory.contains(&event.symbol) {
            PipelineMetrics::incr(&self.metrics.events_dropped);
            trace!(symbol = %event.symbol, "event for untracked symbol dropped");
            return None;
        }

        let outcome = self
            .market
            .get_table(&event.symbol)
            .merge_candle(&event.interval, event.candle);
        self.metrics.record_merge(outcome);
        Some(outcome)
    }

    /// One subscription for `interval`. `delay` staggers both the first
    /// subscribe and every reopen after a symbol-set change; the old
    /// subscription keeps feeding the cache until its reopen is due.
    async fn stream_interval(self: Arc<Self>, interval: String, delay: Duration) {
        let mut stop = self.shutdown.subscribe();
        let mut dir_changes = self.directory_version.subscribe();
        if self.sleep_or_stop(&mut stop, delay).await {
            return;
        }

        let mut backoff = SUBSCRIBE_BACKOFF_MIN;
        'subscribe: loop {
            dir_changes.borrow_and_update();
            let symbols = self.directory.list();

            if symbols.is_empty() {
                debug!(interval = %interval, "no symbols to stream, waiting for refresh");
                tokio::select! {
                    res = dir_changes.changed() => {
                        if res.is_err() {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                    _ = wait_closed(&mut stop) => break 'subscribe,
                }
            }

            let mut sub = match self.feed.subscribe(&interval, &symbols).await {
                Ok(sub) => {
                    backoff = SUBSCRIBE_BACKOFF_MIN;
                    sub
                }
                Err(e) => {
                    PipelineMetrics::incr(&self.metrics.subscription_errors);
                    let err = IngestError::Subscription {
                        interval: interval.clone(),
                        reason: format!("{:#}", e),
                    };
                    warn!(error = %err, retry_in_ms = backoff.as_millis() as u64, "subscribe failed");
                    if self.sleep_or_stop(&mut stop, backoff).await {
                        break 'subscribe;
                    }
                    backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
                    continue 'subscribe;
                }
            };
            info!(interval = %interval, symbols = symbols.len(), "subscribed");

            let mut reopen_at: Option<tokio::time::Instant> = None;
            loop {
                let reopen_deadline = reopen_at.unwrap_or_else(tokio::time::Instant::now);
                tokio::select! {
                    event = sub.recv() => match event {
                        Some(FeedEvent::Kline(event)) => {
                            self.handle_event(event);
                        }
                        Some(FeedEvent::Error(reason)) => {
                            PipelineMetrics::incr(&self.metrics.subscription_errors);
                            let err = IngestError::Subscription {
                                interval: interval.clone(),
                                reason,
                            };
                            warn!(error = %err, "feed reported failure");
                        }
                        None => {
                            warn!(interval = %interval, "subscription ended, resubscribing");
                            if self.sleep_or_stop(&mut stop, backoff).await {
                                break 'subscribe;
                            }
                            backoff = (backoff * 2).min(SUBSCRIBE_BACKOFF_MAX);
                            continue 'subscribe;
                        }
                    },
                    res = dir_changes.changed() => {
                        if res.is_err() {
                            sub.close();
                            break 'subscribe;
                        }
                        if reopen_at.is_none() {
                            debug!(
                                interval = %interval,
                                delay_ms = delay.as_millis() as u64,
                                "symbol set changed, resubscribing"
                            );
                            reopen_at = Some(tokio::time::Instant::now() + delay);
                        }
                    }
                    _ = tokio::time::sleep_until(reopen_deadline), if reopen_at.is_some() => {
                        sub.close();
                        continue 'subscribe;
                    }
                    _ = wait_closed(&mut stop) => {
                        sub.close();
                        break 'subscribe;
                    }
                }
            }
        }

        debug!(interval = %interval, "stream task exited");
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    async fn publish_loop(self: Arc<Self>) {
        let mut stop = self.shutdown.subscribe();
        let period = self.config.publish_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_closed(&mut stop) => break,
            }
            if self.is_stopped() {
                break;
            }
            if self.snapshots.receiver_count() == 0 {
                continue;
            }

            let mut published = 0u64;
            for symbol in self.directory.list() {
                if let Some(snapshot) = self.market.snapshot(&symbol) {
                    if self.snapshots.send(Arc::new(snapshot)).is_ok() {
                        published += 1;
                    }
                }
            }
            self.metrics
                .snapshots_published
                .fetch_add(published, Ordering::Relaxed);
            trace!(published, "chart snapshots published");
        }
        debug!("publish loop exited");
    }
}
