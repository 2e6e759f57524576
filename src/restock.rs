//! Zero-stock restock scanner. Finds internal SKUs that sold out, skips
//! anything already on order, resolves each to supplier SKUs through the
//! mapping table and live-checks supplier availability. Hits land in the
//! inventory snapshot cache the cart committer consumes.

use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::foneday::SupplierApi;
use crate::mapper::MappingRepository;
use crate::pending::PendingOrderRepository;
use crate::stock_sync::StockRepository;
use crate::{decimal_from_text, now_ts, SqlWrapper};
use async_trait::async_trait;
use rusqlite::params;
use rust_decimal::Decimal;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySnapshot {
    pub product_id: Option<Uuid>,
    pub sku: String,
    pub foneday_sku: String,
    pub price_eur: Option<Decimal>,
    pub instock: bool,
    pub title: Option<String>,
    pub quality: Option<String>,
    pub last_checked_at: i64,
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn upsert(&self, snapshot: InventorySnapshot) -> anyhow::Result<()>;
    async fn list_in_stock(&self) -> anyhow::Result<Vec<InventorySnapshot>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanTally {
    /// Zero-stock SKUs actually checked against the supplier.
    pub checked: usize,
    /// `(sku, foneday_sku)` pairs found available.
    pub available: usize,
    /// SKUs skipped because a pending order already covers them.
    pub skipped_pending: usize,
}

/// One scan pass. A supplier lookup failure counts the pair as unavailable
/// and the scan moves on; pacing is enforced inside the supplier client.
pub async fn scan_zero_stock(
    stock: &dyn StockRepository,
    pending: &dyn PendingOrderRepository,
    mappings: &dyn MappingRepository,
    supplier: &dyn SupplierApi,
    snapshots: &dyn SnapshotRepository,
    events: &dyn EventSink,
) -> anyhow::Result<ScanTally> {
    let zero_stock = stock.zero_stock_skus().await?;
    let on_order = pending.pending_quantities().await?;

    let mut tally = ScanTally::default();
    for sku in zero_stock {
        if on_order.get(&sku).copied().unwrap_or(0) > 0 {
            tally.skipped_pending += 1;
            continue;
        }
        tally.checked += 1;
        let sku_mappings = match mappings.list_for_sku(sku.clone()).await {
            Ok(rows) => rows,
            Err(err) => {
                log::warn!("Mapping lookup for {sku} failed: {err}");
                continue;
            }
        };
        for mapping in sku_mappings {
            let product = match supplier.get_product(&mapping.foneday_sku).await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(err) => {
                    // Unreachable supplier record counts as unavailable.
                    log::warn!(
                        "Supplier lookup for {} failed: {err}",
                        mapping.foneday_sku
                    );
                    continue;
                }
            };
            if !product.in_stock() {
                continue;
            }
            let snapshot = InventorySnapshot {
                product_id: mapping.product_id,
                sku: sku.clone(),
                foneday_sku: mapping.foneday_sku.clone(),
                price_eur: product.price,
                instock: true,
                title: product.title.clone(),
                quality: product.quality.clone(),
                last_checked_at: now_ts(),
            };
            match snapshots.upsert(snapshot).await {
                Ok(()) => tally.available += 1,
                Err(err) => {
                    log::warn!(
                        "Snapshot upsert for {}/{} dropped: {err}",
                        sku,
                        mapping.foneday_sku
                    );
                }
            }
        }
    }

    record(
        events,
        NewEvent::new(
            "restock_scan",
            EventStatus::Success,
            format!(
                "restock scan: {} checked, {} available, {} on order",
                tally.checked, tally.available, tally.skipped_pending
            ),
        ),
    )
    .await;
    Ok(tally)
}

pub struct SqliteSnapshotRepository {
    conn: Connection,
}

impl SqliteSnapshotRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS inventory_snapshot (
                    sku TEXT NOT NULL,
                    foneday_sku TEXT NOT NULL,
                    product_id TEXT,
                    price_eur TEXT,
                    instock INTEGER NOT NULL,
                    title TEXT,
                    quality TEXT,
                    last_checked_at INTEGER NOT NULL,
                    PRIMARY KEY (sku, foneday_sku)
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn upsert(&self, s: InventorySnapshot) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO inventory_snapshot
                        (sku, foneday_sku, product_id, price_eur, instock, title,
                         quality, last_checked_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (sku, foneday_sku) DO UPDATE SET
                        product_id = excluded.product_id,
                        price_eur = excluded.price_eur,
                        instock = excluded.instock,
                        title = excluded.title,
                        quality = excluded.quality,
                        last_checked_at = excluded.last_checked_at",
                    params![
                        s.sku,
                        s.foneday_sku,
                        s.product_id.map(|id| id.to_string()),
                        s.price_eur.map(|p| p.to_string()),
                        s.instock as i64,
                        s.title,
                        s.quality,
                        s.last_checked_at
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_in_stock(&self) -> anyhow::Result<Vec<InventorySnapshot>> {
        let SqlWrapper(rows) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, foneday_sku, product_id, price_eur, instock, title,
                            quality, last_checked_at
                     FROM inventory_snapshot WHERE instock = 1
                     ORDER BY sku, foneday_sku",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let product_id: Option<String> = row.get(2)?;
                        let price: Option<String> = row.get(3)?;
                        let instock: i64 = row.get(4)?;
                        Ok(InventorySnapshot {
                            sku: row.get(0)?,
                            foneday_sku: row.get(1)?,
                            product_id: product_id.and_then(|id| Uuid::parse_str(&id).ok()),
                            price_eur: price.map(|p| decimal_from_text(3, p)).transpose()?,
                            instock: instock != 0,
                            title: row.get(5)?,
                            quality: row.get(6)?,
                            last_checked_at: row.get(7)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }
}
