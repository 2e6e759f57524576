//! Foneday supplier API client: single product lookup, full catalog listing
//! and cart additions. Every call goes through the shared minimum-interval
//! rate limiter as reqwest middleware, so call sites carry no pacing logic.

use crate::config::FonedayCredentials;
use crate::{truncate_body, RateLimiter};
use anyhow::anyhow;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct FonedayProduct {
    pub sku: String,
    #[serde(default)]
    pub artcode: Value,
    #[serde(default)]
    pub ean: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub instock: Option<String>,
    #[serde(default)]
    pub suitable_for: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub product_brand: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub model_brand: Option<String>,
    #[serde(default, deserialize_with = "crate::de_opt_decimal")]
    pub price: Option<Decimal>,
}

impl FonedayProduct {
    /// The feed reports availability as "Y"/"N" strings.
    pub fn in_stock(&self) -> bool {
        self.instock.as_deref() == Some("Y")
    }
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    products: Vec<FonedayProduct>,
}

#[derive(Debug, Serialize)]
struct CartAddRequest<'a> {
    sku: &'a str,
    quantity: u32,
    note: &'a str,
}

#[derive(Debug, Deserialize)]
struct CartAddResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Seam for the supplier API so pipelines can run against a fake in tests.
#[async_trait]
pub trait SupplierApi: Send + Sync {
    /// `Ok(None)` means not found; transport errors bubble up for the caller
    /// to classify as "unavailable".
    async fn get_product(&self, sku: &str) -> anyhow::Result<Option<FonedayProduct>>;
    async fn list_catalog(&self) -> anyhow::Result<Vec<FonedayProduct>>;
    async fn add_to_cart(&self, sku: &str, quantity: u32, note: &str) -> anyhow::Result<()>;
}

pub struct FonedayClient {
    http: reqwest_middleware::ClientWithMiddleware,
    base_url: String,
    token: String,
}

impl FonedayClient {
    pub fn new(creds: FonedayCredentials, request_delay: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let http = reqwest_middleware::ClientBuilder::new(client)
            .with(reqwest_ratelimit::all(RateLimiter::new(request_delay)))
            .build();
        Ok(Self {
            http,
            base_url: creds.base_url.trim_end_matches('/').to_string(),
            token: creds.token,
        })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> anyhow::Result<T> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Err(anyhow!("Foneday API empty response"));
        }
        if !status.is_success() {
            return Err(anyhow!("Foneday API {}: {}", status, truncate_body(&text)));
        }
        serde_json::from_str::<T>(&text).map_err(|err| {
            anyhow!(
                "Foneday API decode error: {err}. Body: {}",
                truncate_body(&text)
            )
        })
    }
}

#[async_trait]
impl SupplierApi for FonedayClient {
    async fn get_product(&self, sku: &str) -> anyhow::Result<Option<FonedayProduct>> {
        let url = format!("{}/products/{}", self.base_url, sku);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("Foneday API {}: {}", status, truncate_body(&text)));
        }
        let parsed: ProductsResponse = serde_json::from_str(&text).map_err(|err| {
            anyhow!(
                "Foneday API decode error: {err}. Body: {}",
                truncate_body(&text)
            )
        })?;
        Ok(parsed.products.into_iter().next())
    }

    async fn list_catalog(&self) -> anyhow::Result<Vec<FonedayProduct>> {
        let url = format!("{}/products", self.base_url);
        let parsed: ProductsResponse = self.get_json(&url).await?;
        Ok(parsed.products)
    }

    async fn add_to_cart(&self, sku: &str, quantity: u32, note: &str) -> anyhow::Result<()> {
        let url = format!("{}/cart", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&CartAddRequest {
                sku,
                quantity,
                note,
            })
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("Foneday cart {}: {}", status, truncate_body(&text)));
        }
        let parsed: CartAddResponse = serde_json::from_str(&text).map_err(|err| {
            anyhow!(
                "Foneday cart decode error: {err}. Body: {}",
                truncate_body(&text)
            )
        })?;
        if !parsed.success {
            return Err(anyhow!(
                "Foneday cart rejected {sku}: {}",
                parsed.message.unwrap_or_default()
            ));
        }
        Ok(())
    }
}
