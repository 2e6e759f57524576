//! Storefront stock/price synchronizer. Pulls the paginated product feed,
//! diffs each item against the state persisted on the previous run and writes
//! only what changed, in batches, to bound round trips to the backing store.

use crate::catalog::CatalogLookup;
use crate::config::SyncConfig;
use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::woo::StorefrontFeed;
use crate::{decimal_from_text, now_ts, SqlWrapper};
use async_trait::async_trait;
use rusqlite::params;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio_rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRecord {
    pub sku: String,
    pub stock_quantity: i64,
    pub woo_product_id: u64,
    pub last_sync_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRecord {
    pub sku: String,
    pub regular_price: Decimal,
    pub woo_product_id: u64,
    pub last_sync_at: i64,
}

#[async_trait]
pub trait StockRepository: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<StockRecord>>;
    async fn insert_batch(&self, rows: Vec<StockRecord>) -> anyhow::Result<()>;
    async fn update_quantity(&self, sku: String, quantity: i64, now: i64) -> anyhow::Result<()>;
    async fn zero_stock_skus(&self) -> anyhow::Result<Vec<String>>;
}

#[async_trait]
pub trait PriceRepository: Send + Sync {
    async fn load_all(&self) -> anyhow::Result<Vec<PriceRecord>>;
    async fn insert_batch(&self, rows: Vec<PriceRecord>) -> anyhow::Result<()>;
    async fn update_price(&self, sku: String, price: Decimal, now: i64) -> anyhow::Result<()>;
    async fn price_for(&self, sku: String) -> anyhow::Result<Option<Decimal>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncTally {
    pub new: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub errors: usize,
}

#[derive(Default)]
struct WriteBuffer {
    new_stock: Vec<StockRecord>,
    new_prices: Vec<PriceRecord>,
    stock_updates: Vec<(String, i64)>,
    price_updates: Vec<(String, Decimal)>,
}

impl WriteBuffer {
    fn is_empty(&self) -> bool {
        self.new_stock.is_empty()
            && self.new_prices.is_empty()
            && self.stock_updates.is_empty()
            && self.price_updates.is_empty()
    }
}

/// One full sync pass over the storefront feed. Partial progress persists;
/// a failed batch is dropped and the pass continues.
pub async fn run_stock_sync(
    feed: &dyn StorefrontFeed,
    catalog: &dyn CatalogLookup,
    stock: &dyn StockRepository,
    prices: &dyn PriceRepository,
    events: &dyn EventSink,
    cfg: &SyncConfig,
) -> anyhow::Result<SyncTally> {
    let mut prior_stock: HashMap<String, i64> = stock
        .load_all()
        .await?
        .into_iter()
        .map(|r| (r.sku, r.stock_quantity))
        .collect();
    let mut prior_prices: HashMap<String, Decimal> = prices
        .load_all()
        .await?
        .into_iter()
        .map(|r| (r.sku, r.regular_price))
        .collect();

    let mut tally = SyncTally::default();
    let mut buffer = WriteBuffer::default();
    let mut page = 1usize;
    loop {
        let items = match feed.fetch_page(page, cfg.feed_page_size).await {
            Ok(items) => items,
            Err(err) => {
                log::warn!("Feed page {page} failed: {err}");
                tally.errors += 1;
                break;
            }
        };
        if items.is_empty() {
            break;
        }
        let now = now_ts();
        for item in items {
            if item.sku.is_empty() {
                continue;
            }
            let product_id = match catalog.resolve(item.sku.clone()).await {
                Ok(found) => found.map(|s| s.product_id),
                Err(err) => {
                    log::warn!("Catalog lookup for {} failed: {err}", item.sku);
                    tally.errors += 1;
                    continue;
                }
            };
            if product_id.is_none() {
                log::debug!("Feed SKU {} not in internal catalog", item.sku);
            }
            let quantity = item.quantity();
            match prior_stock.get(&item.sku) {
                None => {
                    tally.new += 1;
                    buffer.new_stock.push(StockRecord {
                        sku: item.sku.clone(),
                        stock_quantity: quantity,
                        woo_product_id: item.id,
                        last_sync_at: now,
                    });
                    if let Some(price) = item.regular_price {
                        buffer.new_prices.push(PriceRecord {
                            sku: item.sku.clone(),
                            regular_price: price,
                            woo_product_id: item.id,
                            last_sync_at: now,
                        });
                        prior_prices.insert(item.sku.clone(), price);
                    }
                    prior_stock.insert(item.sku, quantity);
                }
                Some(&prior_qty) => {
                    let mut changed = false;
                    if prior_qty != quantity {
                        buffer.stock_updates.push((item.sku.clone(), quantity));
                        prior_stock.insert(item.sku.clone(), quantity);
                        changed = true;
                    }
                    if let Some(price) = item.regular_price {
                        match prior_prices.get(&item.sku) {
                            Some(prior) if *prior == price => {}
                            Some(_) => {
                                buffer.price_updates.push((item.sku.clone(), price));
                                prior_prices.insert(item.sku.clone(), price);
                                changed = true;
                            }
                            None => {
                                buffer.new_prices.push(PriceRecord {
                                    sku: item.sku.clone(),
                                    regular_price: price,
                                    woo_product_id: item.id,
                                    last_sync_at: now,
                                });
                                prior_prices.insert(item.sku.clone(), price);
                                changed = true;
                            }
                        }
                    }
                    if changed {
                        tally.updated += 1;
                    } else {
                        tally.unchanged += 1;
                    }
                }
            }
        }
        if page % cfg.flush_every_pages.max(1) == 0 {
            flush(stock, prices, &mut buffer, &mut tally).await;
        }
        page += 1;
    }
    flush(stock, prices, &mut buffer, &mut tally).await;

    record(
        events,
        NewEvent::new(
            "stock_sync",
            EventStatus::Success,
            format!(
                "stock sync: {} new, {} updated, {} unchanged, {} errors",
                tally.new, tally.updated, tally.unchanged, tally.errors
            ),
        ),
    )
    .await;
    Ok(tally)
}

async fn flush(
    stock: &dyn StockRepository,
    prices: &dyn PriceRepository,
    buffer: &mut WriteBuffer,
    tally: &mut SyncTally,
) {
    if buffer.is_empty() {
        return;
    }
    let WriteBuffer {
        new_stock,
        new_prices,
        stock_updates,
        price_updates,
    } = std::mem::take(buffer);

    if !new_stock.is_empty() {
        let n = new_stock.len();
        if let Err(err) = stock.insert_batch(new_stock).await {
            log::warn!("Stock insert batch of {n} dropped: {err}");
            tally.errors += n;
        }
    }
    if !new_prices.is_empty() {
        let n = new_prices.len();
        if let Err(err) = prices.insert_batch(new_prices).await {
            log::warn!("Price insert batch of {n} dropped: {err}");
            tally.errors += n;
        }
    }
    let now = now_ts();
    for (sku, quantity) in stock_updates {
        if let Err(err) = stock.update_quantity(sku.clone(), quantity, now).await {
            log::warn!("Stock update for {sku} dropped: {err}");
            tally.errors += 1;
        }
    }
    for (sku, price) in price_updates {
        if let Err(err) = prices.update_price(sku.clone(), price, now).await {
            log::warn!("Price update for {sku} dropped: {err}");
            tally.errors += 1;
        }
    }
}

pub struct SqliteStockRepository {
    conn: Connection,
}

impl SqliteStockRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS stock_record (
                    sku TEXT PRIMARY KEY,
                    stock_quantity INTEGER NOT NULL,
                    woo_product_id INTEGER NOT NULL,
                    last_sync_at INTEGER NOT NULL
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
impl StockRepository for SqliteStockRepository {
    async fn load_all(&self) -> anyhow::Result<Vec<StockRecord>> {
        let SqlWrapper(rows) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, stock_quantity, woo_product_id, last_sync_at FROM stock_record",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let woo_product_id: i64 = row.get(2)?;
                        Ok(StockRecord {
                            sku: row.get(0)?,
                            stock_quantity: row.get(1)?,
                            woo_product_id: woo_product_id.max(0) as u64,
                            last_sync_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }

    async fn insert_batch(&self, rows: Vec<StockRecord>) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &rows {
                    tx.execute(
                        "INSERT INTO stock_record (sku, stock_quantity, woo_product_id, last_sync_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (sku) DO UPDATE SET
                            stock_quantity = excluded.stock_quantity,
                            woo_product_id = excluded.woo_product_id,
                            last_sync_at = excluded.last_sync_at",
                        params![r.sku, r.stock_quantity, r.woo_product_id as i64, r.last_sync_at],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update_quantity(&self, sku: String, quantity: i64, now: i64) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE stock_record SET stock_quantity = ?2, last_sync_at = ?3 WHERE sku = ?1",
                    params![sku, quantity, now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn zero_stock_skus(&self) -> anyhow::Result<Vec<String>> {
        let SqlWrapper(skus) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku FROM stock_record WHERE stock_quantity <= 0 ORDER BY sku",
                )?;
                let skus = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(skus))
            })
            .await?;
        Ok(skus)
    }
}

pub struct SqlitePriceRepository {
    conn: Connection,
}

impl SqlitePriceRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS price_record (
                    sku TEXT PRIMARY KEY,
                    regular_price TEXT NOT NULL,
                    woo_product_id INTEGER NOT NULL,
                    last_sync_at INTEGER NOT NULL
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
impl PriceRepository for SqlitePriceRepository {
    async fn load_all(&self) -> anyhow::Result<Vec<PriceRecord>> {
        let SqlWrapper(rows) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, regular_price, woo_product_id, last_sync_at FROM price_record",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let price: String = row.get(1)?;
                        let woo_product_id: i64 = row.get(2)?;
                        Ok(PriceRecord {
                            sku: row.get(0)?,
                            regular_price: decimal_from_text(1, price)?,
                            woo_product_id: woo_product_id.max(0) as u64,
                            last_sync_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }

    async fn insert_batch(&self, rows: Vec<PriceRecord>) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &rows {
                    tx.execute(
                        "INSERT INTO price_record (sku, regular_price, woo_product_id, last_sync_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT (sku) DO UPDATE SET
                            regular_price = excluded.regular_price,
                            woo_product_id = excluded.woo_product_id,
                            last_sync_at = excluded.last_sync_at",
                        params![
                            r.sku,
                            r.regular_price.to_string(),
                            r.woo_product_id as i64,
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

    async fn update_price(&self, sku: String, price: Decimal, now: i64) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE price_record SET regular_price = ?2, last_sync_at = ?3 WHERE sku = ?1",
                    params![sku, price.to_string(), now],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn price_for(&self, sku: String) -> anyhow::Result<Option<Decimal>> {
        let SqlWrapper(price) = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT regular_price FROM price_record WHERE sku = ?1")?;
                let price = stmt
                    .query_map(params![sku], |row| {
                        let text: String = row.get(0)?;
                        decimal_from_text(0, text)
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .next();
                Ok(SqlWrapper(price))
            })
            .await?;
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{seed, InternalSku, SqliteCatalogView};
    use crate::events::SqliteEventLog;
    use crate::woo::FeedProduct;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct FakeFeed {
        pages: Vec<Vec<FeedProduct>>,
    }

    #[async_trait]
    impl StorefrontFeed for FakeFeed {
        async fn fetch_page(
            &self,
            page: usize,
            _per_page: usize,
        ) -> anyhow::Result<Vec<FeedProduct>> {
            Ok(self.pages.get(page - 1).cloned().unwrap_or_default())
        }
    }

    fn feed_item(id: u64, sku: &str, qty: Option<i64>, price: Option<Decimal>) -> FeedProduct {
        FeedProduct {
            id,
            sku: sku.to_string(),
            stock_quantity: qty,
            regular_price: price,
        }
    }

    async fn setup() -> (
        Connection,
        SqliteCatalogView,
        SqliteStockRepository,
        SqlitePriceRepository,
        SqliteEventLog,
    ) {
        let conn = Connection::open_in_memory().await.expect("open db");
        let catalog = SqliteCatalogView::init(conn.clone()).await.expect("catalog");
        let stock = SqliteStockRepository::init(conn.clone())
            .await
            .expect("stock");
        let prices = SqlitePriceRepository::init(conn.clone())
            .await
            .expect("prices");
        let events = SqliteEventLog::init(conn.clone()).await.expect("events");
        seed(
            &conn,
            vec![
                InternalSku {
                    sku: "SKU-1".into(),
                    product_id: Uuid::new_v4(),
                    name: "Screen".into(),
                    is_primary: true,
                },
                InternalSku {
                    sku: "SKU-2".into(),
                    product_id: Uuid::new_v4(),
                    name: "Battery".into(),
                    is_primary: true,
                },
            ],
        )
        .await;
        (conn, catalog, stock, prices, events)
    }

    #[tokio::test]
    async fn first_pass_inserts_second_pass_is_unchanged() {
        let (_conn, catalog, stock, prices, events) = setup().await;
        let cfg = SyncConfig::default();
        let feed = FakeFeed {
            pages: vec![vec![
                feed_item(11, "SKU-1", Some(3), Some(dec!(99.90))),
                feed_item(12, "SKU-2", None, Some(dec!(45.00))),
                feed_item(13, "", Some(7), None),
            ]],
        };

        let tally = run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("sync");
        assert_eq!(
            tally,
            SyncTally {
                new: 2,
                updated: 0,
                unchanged: 0,
                errors: 0
            }
        );
        // Null quantity normalized to zero.
        assert_eq!(stock.zero_stock_skus().await.expect("zero"), vec!["SKU-2"]);

        let tally = run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("second sync");
        assert_eq!(
            tally,
            SyncTally {
                new: 0,
                updated: 0,
                unchanged: 2,
                errors: 0
            }
        );
    }

    #[tokio::test]
    async fn zeroed_batching_knobs_still_sync() {
        let (_conn, catalog, stock, prices, events) = setup().await;
        let cfg = SyncConfig {
            flush_every_pages: 0,
            upsert_chunk_size: 0,
            ..SyncConfig::default()
        };
        let feed = FakeFeed {
            pages: vec![vec![feed_item(11, "SKU-1", Some(3), Some(dec!(99.90)))]],
        };
        let tally = run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("sync");
        assert_eq!(tally.new, 1);
    }

    #[tokio::test]
    async fn price_only_change_leaves_stock_row_alone() {
        let (_conn, catalog, stock, prices, events) = setup().await;
        let cfg = SyncConfig::default();
        let feed = FakeFeed {
            pages: vec![vec![feed_item(11, "SKU-1", Some(3), Some(dec!(99.90)))]],
        };
        run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("seed pass");
        let before = stock.load_all().await.expect("stock rows");

        let feed = FakeFeed {
            pages: vec![vec![feed_item(11, "SKU-1", Some(3), Some(dec!(89.90)))]],
        };
        let tally = run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("price change pass");
        assert_eq!(tally.updated, 1);
        assert_eq!(
            prices.price_for("SKU-1".into()).await.expect("price"),
            Some(dec!(89.90))
        );
        // Targeted update: the stock row must be byte-identical.
        assert_eq!(stock.load_all().await.expect("stock rows"), before);
    }

    #[tokio::test]
    async fn stock_change_updates_quantity() {
        let (_conn, catalog, stock, prices, events) = setup().await;
        let cfg = SyncConfig::default();
        let feed = FakeFeed {
            pages: vec![vec![feed_item(11, "SKU-1", Some(3), Some(dec!(99.90)))]],
        };
        run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("seed pass");

        let feed = FakeFeed {
            pages: vec![vec![feed_item(11, "SKU-1", Some(0), Some(dec!(99.90)))]],
        };
        let tally = run_stock_sync(&feed, &catalog, &stock, &prices, &events, &cfg)
            .await
            .expect("stock change pass");
        assert_eq!(tally.updated, 1);
        assert_eq!(stock.zero_stock_skus().await.expect("zero"), vec!["SKU-1"]);
    }
}
