//! Error types for the cache and ingestion layers.
//!
//! Cache errors are local and cheap; callers usually treat `NotFound` as
//! "not warmed yet". Ingestion errors never leave the pipeline: they become
//! retry entries or log lines.

/// Errors raised by the in-memory cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Table, ring or symbol absent
    NotFound { kind: &'static str, key: String },
    /// Slot index does not address a written slot
    OutOfRange { slot: usize, len: usize },
    /// Ring has no items yet
    Empty,
}

impl CacheError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { kind, key } => write!(f, "{}: not found ({})", kind, key),
            Self::OutOfRange { slot, len } => {
                write!(f, "slot {} out of range (written slots: {})", slot, len)
            }
            Self::Empty => write!(f, "ring is empty"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Errors raised while feeding the cache
#[derive(Debug)]
pub enum IngestError {
    /// Historical fetch failed for one (symbol, interval)
    Fetch {
        symbol: String,
        interval: String,
        source: anyhow::Error,
    },
    /// Push subscription could not be opened or reported a failure
    Subscription { interval: String, reason: String },
    /// Directory refresh failed
    Sync(anyhow::Error),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch {
                symbol,
                interval,
                source,
            } => write!(f, "fetch {} {} failed: {:#}", symbol, interval, source),
            Self::Subscription { interval, reason } => {
                write!(f, "subscription {} failed: {}", interval, reason)
            }
            Self::Sync(e) => write!(f, "directory sync failed: {:#}", e),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch { source, .. } => Some(source.as_ref()),
            Self::Sync(e) => Some(e.as_ref()),
            Self::Subscription { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = CacheError::not_found("chart", "BTCUSDT");
        assert_eq!(e.to_string(), "chart: not found (BTCUSDT)");

        let e = CacheError::OutOfRange { slot: 5, len: 3 };
        assert!(e.to_string().contains("slot 5"));

        let e = IngestError::Fetch {
            symbol: "ETHUSDT".to_string(),
            interval: "1h".to_string(),
            source: anyhow::anyhow!("timeout"),
        };
        assert_eq!(e.to_string(), "fetch ETHUSDT 1h failed: timeout");
    }
}
