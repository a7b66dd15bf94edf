//! Binance USDⓈ-M futures provider
//!
//! REST for the symbol list and kline history, combined WebSocket streams for
//! live klines. One subscription fans out over as many connections as the
//! per-connection stream limit requires; each connection reconnects on its
//! own with exponential backoff until the subscription is closed.

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{wait_closed, FeedEvent, FeedProvider, Subscription};
use crate::config::FeedConfig;
use crate::models::{Candle, KlineEvent, SymbolInfo, TradingFilters};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeSymbol {
    symbol: String,
    #[serde(default)]
    pair: String,
    #[serde(default)]
    status: Option<String>,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    margin_asset: String,
    #[serde(default)]
    filters: Vec<ExchangeFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeFilter {
    filter_type: String,
    tick_size: Option<String>,
    step_size: Option<String>,
    min_qty: Option<String>,
    notional: Option<String>,
}

impl From<ExchangeSymbol> for SymbolInfo {
    fn from(s: ExchangeSymbol) -> Self {
        let mut filters = TradingFilters::default();
        for f in s.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => filters.tick_size = f.tick_size,
                "LOT_SIZE" => {
                    filters.step_size = f.step_size;
                    filters.min_qty = f.min_qty;
                }
                "MIN_NOTIONAL" => filters.min_notional = f.notional,
                _ => {}
            }
        }

        let pair = if s.pair.is_empty() { s.symbol.clone() } else { s.pair };
        let margin_asset = if s.margin_asset.is_empty() {
            s.quote_asset.clone()
        } else {
            s.margin_asset
        };

        SymbolInfo {
            symbol: s.symbol,
            pair,
            base_asset: s.base_asset,
            quote_asset: s.quote_asset,
            margin_asset,
            status: s.status,
            filters,
        }
    }
}

/// Combined stream envelope: `{"stream": "...", "data": {...}}`
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: Option<KlinePayload>,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

// =============================================================================
// PARSING
// =============================================================================

/// Parse one REST kline row:
/// `[openTime, open, high, low, close, volume, closeTime, ...]`
fn parse_kline_row(row: &[serde_json::Value]) -> Option<Candle> {
    let text = |i: usize| -> Option<String> {
        match row.get(i)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    Some(Candle {
        open_time: row.first()?.as_i64()?,
        open: text(1)?,
        high: text(2)?,
        low: text(3)?,
        close: text(4)?,
        volume: text(5)?,
        close_time: row.get(6)?.as_i64()?,
    })
}

/// Parse a combined-stream message. `Ok(None)` for control frames such as
/// subscription acknowledgements.
fn parse_kline_message(text: &str) -> Result<Option<KlineEvent>> {
    let envelope: StreamEnvelope =
        serde_json::from_str(text).context("malformed stream message")?;
    let Some(payload) = envelope.data else {
        return Ok(None);
    };

    let k = payload.kline;
    Ok(Some(KlineEvent {
        symbol: k.symbol,
        interval: k.interval,
        is_final: k.is_final,
        candle: Candle {
            open_time: k.open_time,
            close_time: k.close_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
        },
    }))
}

/// Combined-stream URLs for `symbols` on one interval, at most `per_connection`
/// streams each.
fn stream_urls(base: &str, interval: &str, symbols: &[String], per_connection: usize) -> Vec<String> {
    symbols
        .chunks(per_connection.max(1))
        .map(|chunk| {
            let streams: Vec<String> = chunk
                .iter()
                .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval))
                .collect();
            format!("{}?streams={}", base, streams.join("/"))
        })
        .collect()
}

// =============================================================================
// PROVIDER
// =============================================================================

pub struct BinanceFuturesFeed {
    client: Client,
    config: FeedConfig,
}

impl BinanceFuturesFeed {
    pub fn new(config: FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("building HTTP client")?;

        Ok(Self { client, config })
    }
}

#[async_trait::async_trait]
impl FeedProvider for BinanceFuturesFeed {
    fn name(&self) -> &str {
        "binance-futures"
    }

    async fn list_symbols(&self) -> Result<Vec<SymbolInfo>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.config.rest_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("GET /fapi/v1/exchangeInfo {}: {}", status, text));
        }

        let info: ExchangeInfo = resp
            .json()
            .await
            .context("decoding /fapi/v1/exchangeInfo")?;

        Ok(info.symbols.into_iter().map(SymbolInfo::from).collect())
    }

    async fn fetch_history(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines", self.config.rest_url);
        let limit = limit.to_string();
        let resp = self
            .client
            .get(&url)
            .query(&[("symbol", symbol), ("interval", interval), ("limit", limit.as_str())])
            .send()
            .await
            .with_context(|| format!("GET /fapi/v1/klines {} {} failed", symbol, interval))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "GET /fapi/v1/klines?symbol={}&interval={} {}: {}",
                symbol,
                interval,
                status,
                text
            ));
        }

        let rows: Vec<Vec<serde_json::Value>> = resp
            .json()
            .await
            .context("decoding /fapi/v1/klines")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_kline_row(row) {
                Some(c) => candles.push(c),
                None => return Err(anyhow!("malformed kline row for {} {}", symbol, interval)),
            }
        }
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    async fn subscribe(&self, interval: &str, symbols: &[String]) -> Result<Subscription> {
        if symbols.is_empty() {
            return Err(anyhow!("no symbols to subscribe for {}", interval));
        }

        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let (subscription, closed) = Subscription::new(rx);

        let urls = stream_urls(
            &self.config.ws_url,
            interval,
            symbols,
            self.config.max_streams_per_connection,
        );
        info!(
            interval,
            symbols = symbols.len(),
            connections = urls.len(),
            "opening kline streams"
        );

        for (conn, url) in urls.into_iter().enumerate() {
            let tx = tx.clone();
            let closed = closed.clone();
            let interval = interval.to_string();
            tokio::spawn(async move {
                run_stream(url, interval, conn, tx, closed).await;
            });
        }

        Ok(subscription)
    }
}

// =============================================================================
// CONNECTION LOOP
// =============================================================================

enum StreamEnd {
    /// Subscription closed or its reader dropped
    Closed,
    /// Server ended the session; reconnect immediately
    Disconnected,
}

async fn run_stream(
    url: String,
    interval: String,
    conn: usize,
    tx: mpsc::Sender<FeedEvent>,
    mut closed: watch::Receiver<bool>,
) {
    let mut reconnect_delay = INITIAL_BACKOFF;

    loop {
        match connect_and_stream(&url, &tx, &mut closed).await {
            Ok(StreamEnd::Closed) => break,
            Ok(StreamEnd::Disconnected) => {
                debug!(interval = %interval, conn, "kline stream disconnected, reconnecting");
                reconnect_delay = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!(interval = %interval, conn, error = %e, "kline stream failed");
                let report = FeedEvent::Error(format!("{} stream #{}: {:#}", interval, conn, e));
                if tx.send(report).await.is_err() {
                    break;
                }

                let jitter_ms = rand::thread_rng().gen_range(0..=reconnect_delay.as_millis() as u64 / 4);
                let wait = reconnect_delay + Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = wait_closed(&mut closed) => break,
                }
                reconnect_delay = (reconnect_delay * 2).min(MAX_BACKOFF);
            }
        }
    }

    debug!(interval = %interval, conn, "kline stream stopped");
}

async fn connect_and_stream(
    url: &str,
    tx: &mpsc::Sender<FeedEvent>,
    closed: &mut watch::Receiver<bool>,
) -> Result<StreamEnd> {
    let (ws_stream, _) = tokio::select! {
        res = connect_async(url) => res.context("failed to connect to Binance")?,
        _ = wait_closed(closed) => return Ok(StreamEnd::Closed),
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = wait_closed(closed) => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(StreamEnd::Closed);
            }
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => return Err(anyhow!(e).context("stream read error")),
            None => return Ok(StreamEnd::Disconnected),
        };

        match msg {
            Message::Text(text) => match parse_kline_message(&text) {
                Ok(Some(event)) => {
                    if tx.send(FeedEvent::Kline(event)).await.is_err() {
                        return Ok(StreamEnd::Closed);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(error = %e, "unparseable stream message"),
            },
            Message::Ping(payload) => {
                let _ = write.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => return Ok(StreamEnd::Disconnected),
            _ => {}
        }
    }
}
