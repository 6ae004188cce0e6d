use std::env;
use std::time::Duration;

/// Tuning knobs for the transaction service.
///
/// Every field has a default so the aggregator can start without any
/// environment configured.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Page size for queue scans (batch selection, future promotion walks)
    pub page_limit: usize,
    /// Hard bound on the Future queue; oldest entries are evicted beyond it
    pub max_future_txs: usize,
    /// Ready size at which a batch is flushed immediately
    pub max_batch_size: usize,
    /// Debounce deadline for a flush after the first pending transaction
    pub max_batch_delay: Duration,
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        Self {
            page_limit: env::var("AGGREGATOR_PAGE_LIMIT")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .expect("AGGREGATOR_PAGE_LIMIT must be a valid number"),
            max_future_txs: env::var("AGGREGATOR_MAX_FUTURE_TXS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .expect("AGGREGATOR_MAX_FUTURE_TXS must be a valid number"),
            max_batch_size: env::var("AGGREGATOR_MAX_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .expect("AGGREGATOR_MAX_BATCH_SIZE must be a valid number"),
            max_batch_delay: Duration::from_millis(
                env::var("AGGREGATOR_MAX_BATCH_DELAY_MS")
                    .unwrap_or_else(|_| "5000".to_string())
                    .parse()
                    .expect("AGGREGATOR_MAX_BATCH_DELAY_MS must be a valid number"),
            ),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            page_limit: 50,
            max_future_txs: 1000,
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(5000),
        }
    }
}
