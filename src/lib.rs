#![deny(clippy::unwrap_used)]

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

pub mod artcode;
pub mod cart;
pub mod catalog;
pub mod catalog_import;
pub mod config;
pub mod events;
pub mod foneday;
pub mod mapper;
pub mod margin;
pub mod pending;
pub mod restock;
pub mod stock_sync;
pub mod woo;

#[derive(Debug)]
pub struct SqlWrapper<T>(pub T);

/// Minimum-interval gate for outbound supplier calls. The upstream API has an
/// implicit quota, so the interval is a hard pacing contract, not a tuning
/// knob. A background task ticks once per interval; each permit waits for the
/// next tick.
pub struct RateLimiter(Arc<Notify>);

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        tokio::spawn(async move {
            let notify = n;
            loop {
                sleep(interval).await;
                notify.notify_one();
            }
        });
        Self(notify)
    }

    pub async fn acquire(&self) {
        self.0.notified().await;
    }
}

#[async_trait]
impl reqwest_ratelimit::RateLimiter for RateLimiter {
    async fn acquire_permit(&self) {
        self.0.notified().await;
    }
}

/// Error bodies go into log lines truncated. The cut must land on a char
/// boundary; vendor error pages carry diacritics.
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 300;
    let trimmed = body.trim();
    if trimmed.len() <= LIMIT {
        return trimmed.to_string();
    }
    let mut end = 0usize;
    for (idx, _) in trimmed.char_indices() {
        if idx > LIMIT {
            break;
        }
        end = idx;
    }
    if end == 0 {
        return trimmed.to_string();
    }
    format!("{}…", &trimmed[..end])
}

pub(crate) fn decimal_from_text(idx: usize, text: String) -> rusqlite::Result<Decimal> {
    Decimal::from_str_exact(text.trim()).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

pub(crate) fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Tolerant decimal field: suppliers send prices as numbers, numeric strings
/// or empty strings interchangeably.
pub(crate) fn de_opt_decimal<'de, D>(de: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(Decimal),
        Text(String),
        None,
    }

    match Raw::deserialize(de)? {
        Raw::Num(d) => Ok(Some(d)),
        Raw::Text(s) if s.trim().is_empty() => Ok(None),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| serde::de::Error::custom(format!("{err}"))),
        Raw::None => Ok(None),
    }
}
