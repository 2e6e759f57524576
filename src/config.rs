use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

/// Pacing for the supplier API. Hard external contract, overridable only for
/// ops (staging endpoints without a quota).
pub static SUPPLIER_REQUEST_DELAY: Lazy<Duration> = Lazy::new(|| {
    std::env::var("SUPPLIER_REQUEST_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(1_500))
});

/// Run-level configuration, supplied by the host and threaded explicitly into
/// every component that needs it.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// EUR -> local currency rate applied to supplier costs.
    pub fx_rate: Decimal,
    /// Gross -> net divisor for storefront prices, e.g. 1.21.
    pub vat_multiplier: Decimal,
    /// Accept a purchase iff cost_local / net_sale < this ratio (strict).
    pub max_cost_ratio: Decimal,
    /// Quantity for automatic zero-stock cart additions.
    pub default_order_qty: u32,
    /// Page size for backing-store reads.
    pub store_page_size: usize,
    /// Page size for the storefront product feed.
    pub feed_page_size: usize,
    /// Stock sync flushes its write buffers every this many feed pages.
    pub flush_every_pages: usize,
    /// Mapper upsert chunk size.
    pub upsert_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fx_rate: Decimal::ONE,
            vat_multiplier: Decimal::ONE,
            max_cost_ratio: dec!(0.88),
            default_order_qty: 2,
            store_page_size: 1_000,
            feed_page_size: 100,
            flush_every_pages: 5,
            upsert_chunk_size: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WooCredentials {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
}

#[derive(Clone, Debug)]
pub struct FonedayCredentials {
    pub base_url: String,
    pub token: String,
}
