//! Storefront (WooCommerce) product feed, read-only. Caller-driven
//! pagination; an empty page signals end of data.

use crate::config::WooCredentials;
use crate::truncate_body;
use anyhow::anyhow;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct FeedProduct {
    pub id: u64,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub stock_quantity: Option<i64>,
    #[serde(default, deserialize_with = "crate::de_opt_decimal")]
    pub regular_price: Option<Decimal>,
}

impl FeedProduct {
    /// Absent quantity is normalized to zero.
    pub fn quantity(&self) -> i64 {
        self.stock_quantity.unwrap_or(0)
    }
}

#[async_trait]
pub trait StorefrontFeed: Send + Sync {
    async fn fetch_page(&self, page: usize, per_page: usize)
        -> anyhow::Result<Vec<FeedProduct>>;
}

pub struct WooClient {
    http: reqwest::Client,
    creds: WooCredentials,
}

impl WooClient {
    pub fn new(creds: WooCredentials) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            creds: WooCredentials {
                base_url: creds.base_url.trim_end_matches('/').to_string(),
                ..creds
            },
        })
    }
}

#[async_trait]
impl StorefrontFeed for WooClient {
    async fn fetch_page(
        &self,
        page: usize,
        per_page: usize,
    ) -> anyhow::Result<Vec<FeedProduct>> {
        let url = format!("{}/wp-json/wc/v3/products", self.creds.base_url);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.creds.consumer_key, Some(&self.creds.consumer_secret))
            .query(&[("page", page), ("per_page", per_page)])
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "storefront feed {}: {}",
                status,
                truncate_body(&text)
            ));
        }
        serde_json::from_str(&text)
            .map_err(|err| anyhow!("storefront feed decode error: {err}"))
    }
}
