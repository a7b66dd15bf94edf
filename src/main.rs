//! Kline Crawler
//!
//! Tracks every settlement-asset perpetual on Binance USDⓈ-M futures and keeps
//! a rolling candle history per interval in memory, served over HTTP.
//!
//! Usage:
//!   crawler --config crawler.toml --listen 0.0.0.0:3030
//!
//! Environment:
//!   CRAWLER_CONFIG - Path to the TOML config
//!   CRAWLER_LISTEN_ADDR - API listen address
//!   CRAWLER_LOG - Log filter (falls back to RUST_LOG)
//!   CRAWLER_* - Any config field override, see config.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kline_crawler::{
    api,
    config::CrawlerConfig,
    feed::BinanceFuturesFeed,
    ingest::IngestionPipeline,
};

#[derive(Parser, Debug)]
#[command(name = "crawler")]
#[command(about = "Kline crawler - rolling candle cache for Binance futures")]
struct Args {
    /// TOML config file (optional; defaults are used when absent)
    #[arg(long, env = "CRAWLER_CONFIG")]
    config: Option<PathBuf>,

    /// API listen address (overrides the config file)
    #[arg(long, env = "CRAWLER_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log filter directive
    #[arg(long, env = "CRAWLER_LOG")]
    log: Option<String>,

    /// Do not start the HTTP API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let mut config = CrawlerConfig::resolve(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.api.listen_addr = listen;
    }
    if args.no_api {
        config.api.enabled = false;
    }

    info!("Starting kline crawler");
    info!("  Intervals: {}", config.market.intervals.join(","));
    info!("  Ring capacity: {}", config.market.ring_capacity);
    info!("  Settlement asset: {}", config.market.settlement_asset);
    info!("  REST: {}", config.feed.rest_url);
    info!("  WS: {}", config.feed.ws_url);

    let feed = BinanceFuturesFeed::new(config.feed.clone())?;
    let pipeline = IngestionPipeline::new(&config.market, config.ingest.clone(), Arc::new(feed));

    if config.api.enabled {
        let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
            .await
            .with_context(|| format!("binding API on {}", config.api.listen_addr))?;
        info!("API listening on {}", config.api.listen_addr);

        let app = api::router(pipeline.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    // Handle shutdown
    let pipeline_clone = pipeline.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        pipeline_clone.stop();
    });

    pipeline.start().await.context("pipeline startup failed")?;
    pipeline.join().await;

    info!("Kline crawler stopped");
    Ok(())
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(f) => tracing_subscriber::EnvFilter::new(f),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "kline_crawler=info,crawler=info,tower_http=info".into()),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
