//! Supplier catalog import: wholesale upsert of the Foneday product list
//! keyed by `foneday_sku`, plus the artcode fan-out into the normalized
//! cross-reference index.

use crate::artcode::{normalize_artcodes, ArtcodeRepository};
use crate::config::SyncConfig;
use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::foneday::{FonedayProduct, SupplierApi};
use crate::{decimal_from_text, now_ts, SqlWrapper};
use async_trait::async_trait;
use itertools::Itertools;
use rusqlite::params;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplierProduct {
    pub foneday_sku: String,
    /// Raw cross-reference field, kept verbatim; the normalized index is the
    /// queryable form.
    pub artcode: Value,
    pub ean: Option<String>,
    pub title: Option<String>,
    pub instock: Option<String>,
    pub suitable_for: Option<String>,
    pub category: Option<String>,
    pub product_brand: Option<String>,
    pub quality: Option<String>,
    pub model_brand: Option<String>,
    pub price_eur: Option<Decimal>,
    pub last_sync_at: i64,
}

impl SupplierProduct {
    pub fn from_feed(p: FonedayProduct, now: i64) -> Self {
        Self {
            foneday_sku: p.sku,
            artcode: p.artcode,
            ean: p.ean,
            title: p.title,
            instock: p.instock,
            suitable_for: p.suitable_for,
            category: p.category,
            product_brand: p.product_brand,
            quality: p.quality,
            model_brand: p.model_brand,
            price_eur: p.price,
            last_sync_at: now,
        }
    }
}

#[async_trait]
pub trait SupplierProductRepository: Send + Sync {
    async fn upsert_batch(&self, rows: Vec<SupplierProduct>) -> anyhow::Result<()>;
    async fn get(&self, foneday_sku: String) -> anyhow::Result<Option<SupplierProduct>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportTally {
    pub imported: usize,
    pub artcode_rows: usize,
    pub errors: usize,
}

/// One full catalog import pass.
pub async fn import_catalog(
    supplier: &dyn SupplierApi,
    products: &dyn SupplierProductRepository,
    artcodes: &dyn ArtcodeRepository,
    events: &dyn EventSink,
    cfg: &SyncConfig,
) -> anyhow::Result<ImportTally> {
    let feed = supplier.list_catalog().await?;
    let now = now_ts();
    let mut tally = ImportTally::default();

    let rows: Vec<SupplierProduct> = feed
        .into_iter()
        .filter(|p| !p.sku.trim().is_empty())
        .map(|p| SupplierProduct::from_feed(p, now))
        .collect();

    for chunk in &rows.iter().cloned().chunks(cfg.upsert_chunk_size.max(1)) {
        let chunk: Vec<SupplierProduct> = chunk.collect();
        let n = chunk.len();
        match products.upsert_batch(chunk).await {
            Ok(()) => tally.imported += n,
            Err(err) => {
                log::warn!("Supplier product chunk of {n} dropped: {err}");
                tally.errors += n;
            }
        }
    }

    for row in &rows {
        let values = normalize_artcodes(&row.artcode);
        let count = values.len();
        match artcodes
            .replace_for_sku(row.foneday_sku.clone(), values)
            .await
        {
            Ok(()) => tally.artcode_rows += count,
            Err(err) => {
                log::warn!("Artcode fan-out for {} dropped: {err}", row.foneday_sku);
                tally.errors += 1;
            }
        }
    }

    record(
        events,
        NewEvent::new(
            "catalog_import",
            EventStatus::Success,
            format!(
                "catalog import: {} products, {} artcode rows, {} errors",
                tally.imported, tally.artcode_rows, tally.errors
            ),
        ),
    )
    .await;
    Ok(tally)
}

pub struct SqliteSupplierProductRepository {
    conn: Connection,
}

impl SqliteSupplierProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS supplier_product (
                    foneday_sku TEXT PRIMARY KEY,
                    artcode TEXT NOT NULL,
                    ean TEXT,
                    title TEXT,
                    instock TEXT,
                    suitable_for TEXT,
                    category TEXT,
                    product_brand TEXT,
                    quality TEXT,
                    model_brand TEXT,
                    price_eur TEXT,
                    last_sync_at INTEGER NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_supplier_product_instock
                 ON supplier_product (instock)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SupplierProductRepository for SqliteSupplierProductRepository {
    async fn upsert_batch(&self, rows: Vec<SupplierProduct>) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &rows {
                    tx.execute(
                        "INSERT INTO supplier_product
                            (foneday_sku, artcode, ean, title, instock, suitable_for,
                             category, product_brand, quality, model_brand, price_eur,
                             last_sync_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                         ON CONFLICT (foneday_sku) DO UPDATE SET
                            artcode = excluded.artcode,
                            ean = excluded.ean,
                            title = excluded.title,
                            instock = excluded.instock,
                            suitable_for = excluded.suitable_for,
                            category = excluded.category,
                            product_brand = excluded.product_brand,
                            quality = excluded.quality,
                            model_brand = excluded.model_brand,
                            price_eur = excluded.price_eur,
                            last_sync_at = excluded.last_sync_at",
                        params![
                            r.foneday_sku,
                            r.artcode.to_string(),
                            r.ean,
                            r.title,
                            r.instock,
                            r.suitable_for,
                            r.category,
                            r.product_brand,
                            r.quality,
                            r.model_brand,
                            r.price_eur.map(|p| p.to_string()),
                            r.last_sync_at
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn get(&self, foneday_sku: String) -> anyhow::Result<Option<SupplierProduct>> {
        let SqlWrapper(row) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT foneday_sku, artcode, ean, title, instock, suitable_for,
                            category, product_brand, quality, model_brand, price_eur,
                            last_sync_at
                     FROM supplier_product WHERE foneday_sku = ?1",
                )?;
                let row = stmt
                    .query_map(params![foneday_sku], |row| {
                        let artcode: String = row.get(1)?;
                        let price: Option<String> = row.get(10)?;
                        Ok(SupplierProduct {
                            foneday_sku: row.get(0)?,
                            artcode: serde_json::from_str(&artcode)
                                .unwrap_or(Value::String(artcode)),
                            ean: row.get(2)?,
                            title: row.get(3)?,
                            instock: row.get(4)?,
                            suitable_for: row.get(5)?,
                            category: row.get(6)?,
                            product_brand: row.get(7)?,
                            quality: row.get(8)?,
                            model_brand: row.get(9)?,
                            price_eur: price.map(|p| decimal_from_text(10, p)).transpose()?,
                            last_sync_at: row.get(11)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .next();
                Ok(SqlWrapper(row))
            })
            .await?;
        Ok(row)
    }
}
