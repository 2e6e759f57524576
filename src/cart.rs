//! Cart committer: turns available restock candidates into supplier cart
//! additions and records every decision, accepted or rejected, as an
//! append-only audit row.
//!
//! The external cart call and the local audit row are not transactionally
//! linked. A failure after the call succeeds leaves an order placed with no
//! local record; recovery is manual reconciliation against the supplier's
//! order history. Repeat commits for the same pair across runs are allowed by
//! design — a previous addition may already have been confirmed away.

use crate::config::SyncConfig;
use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::foneday::SupplierApi;
use crate::mapper::MappingRepository;
use crate::margin;
use crate::restock::SnapshotRepository;
use crate::stock_sync::{PriceRepository, StockRepository};
use crate::{decimal_from_text, now_ts, SqlWrapper};
use anyhow::bail;
use async_trait::async_trait;
use rusqlite::params;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartStatus {
    AddedToCart,
    Confirmed,
    NotProfitable,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddedToCart => "added_to_cart",
            Self::Confirmed => "confirmed",
            Self::NotProfitable => "not_profitable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added_to_cart" => Some(Self::AddedToCart),
            "confirmed" => Some(Self::Confirmed),
            "not_profitable" => Some(Self::NotProfitable),
            _ => None,
        }
    }

    /// The only legal flip is operator confirmation of a placed addition.
    pub fn can_transition(self, next: CartStatus) -> bool {
        matches!((self, next), (Self::AddedToCart, Self::Confirmed))
    }
}

impl std::fmt::Display for CartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartEntry {
    pub id: i64,
    pub product_id: Option<Uuid>,
    pub sku: String,
    pub foneday_sku: String,
    pub quantity: u32,
    pub price_eur: Decimal,
    pub woo_price_ron: Decimal,
    pub profit_margin: Decimal,
    pub is_profitable: bool,
    pub status: CartStatus,
    pub note: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewCartEntry {
    pub product_id: Option<Uuid>,
    pub sku: String,
    pub foneday_sku: String,
    pub quantity: u32,
    pub price_eur: Decimal,
    pub woo_price_ron: Decimal,
    pub profit_margin: Decimal,
    pub is_profitable: bool,
    pub status: CartStatus,
    pub note: Option<String>,
}

#[async_trait]
pub trait CartRepository: Send + Sync {
    /// Append-only: a decision, once written, is a fact. Reversals are new
    /// rows, never updates.
    async fn append(&self, entry: NewCartEntry) -> anyhow::Result<CartEntry>;
    /// The single permitted update: `added_to_cart -> confirmed`.
    async fn transition(&self, id: i64, next: CartStatus) -> anyhow::Result<CartEntry>;
    async fn list_by_status(&self, status: CartStatus) -> anyhow::Result<Vec<CartEntry>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommitTally {
    pub committed: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Automatic zero-stock path: one commit attempt per available snapshot,
/// fixed policy quantity, every decision audited.
pub async fn commit_restocks(
    snapshots: &dyn SnapshotRepository,
    prices: &dyn PriceRepository,
    supplier: &dyn SupplierApi,
    cart: &dyn CartRepository,
    events: &dyn EventSink,
    cfg: &SyncConfig,
) -> anyhow::Result<CommitTally> {
    let mut tally = CommitTally::default();
    for snapshot in snapshots.list_in_stock().await? {
        let Some(cost_eur) = snapshot.price_eur else {
            log::debug!("No supplier price for {}, skipping", snapshot.foneday_sku);
            tally.skipped += 1;
            continue;
        };
        let woo_price = match prices.price_for(snapshot.sku.clone()).await {
            Ok(Some(p)) => p,
            Ok(None) => {
                log::debug!("No storefront price for {}, skipping", snapshot.sku);
                tally.skipped += 1;
                continue;
            }
            Err(err) => {
                log::warn!("Price lookup for {} failed: {err}", snapshot.sku);
                tally.errors += 1;
                continue;
            }
        };
        if cost_eur <= Decimal::ZERO || woo_price <= Decimal::ZERO {
            tally.skipped += 1;
            continue;
        }

        let profit_margin = margin::margin(cost_eur, woo_price, cfg.fx_rate, cfg.vat_multiplier);
        let acceptable = margin::is_acceptable(
            cost_eur,
            woo_price,
            cfg.fx_rate,
            cfg.vat_multiplier,
            cfg.max_cost_ratio,
        );

        if !acceptable {
            let appended = cart
                .append(NewCartEntry {
                    product_id: snapshot.product_id,
                    sku: snapshot.sku.clone(),
                    foneday_sku: snapshot.foneday_sku.clone(),
                    quantity: 0,
                    price_eur: cost_eur,
                    woo_price_ron: woo_price,
                    profit_margin,
                    is_profitable: false,
                    status: CartStatus::NotProfitable,
                    note: Some(format!("margin {profit_margin}% below threshold")),
                })
                .await;
            match appended {
                Ok(_) => tally.rejected += 1,
                Err(err) => {
                    log::warn!("Audit row for rejected {} dropped: {err}", snapshot.sku);
                    tally.errors += 1;
                }
            }
            continue;
        }

        let note = format!("auto restock {}", snapshot.sku);
        match place_and_record(
            supplier,
            cart,
            events,
            NewCartEntry {
                product_id: snapshot.product_id,
                sku: snapshot.sku.clone(),
                foneday_sku: snapshot.foneday_sku.clone(),
                quantity: cfg.default_order_qty,
                price_eur: cost_eur,
                woo_price_ron: woo_price,
                profit_margin,
                is_profitable: true,
                status: CartStatus::AddedToCart,
                note: Some(note),
            },
        )
        .await
        {
            Ok(_) => tally.committed += 1,
            Err(err) => {
                log::warn!("Cart commit for {} failed: {err}", snapshot.sku);
                tally.errors += 1;
            }
        }
    }
    Ok(tally)
}

/// Strategic-restock candidate over positive-stock items. Surfaced to the
/// operator, never committed automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpportunityCandidate {
    pub my_sku: String,
    pub foneday_sku: String,
    pub product_id: Option<Uuid>,
    pub cost_eur: Decimal,
    pub sale_price_ron: Decimal,
    pub margin: Decimal,
    pub stock_quantity: i64,
}

/// Scan every mapping whose internal SKU still has stock and surface the
/// pairs clearing the caller's minimum margin (typically stricter than the
/// automatic acceptance threshold).
pub async fn scan_opportunities(
    mappings: &dyn MappingRepository,
    stock: &dyn StockRepository,
    prices: &dyn PriceRepository,
    supplier: &dyn SupplierApi,
    cfg: &SyncConfig,
    min_margin: Decimal,
) -> anyhow::Result<Vec<OpportunityCandidate>> {
    let stock_by_sku: HashMap<String, i64> = stock
        .load_all()
        .await?
        .into_iter()
        .map(|r| (r.sku, r.stock_quantity))
        .collect();
    let price_by_sku: HashMap<String, Decimal> = prices
        .load_all()
        .await?
        .into_iter()
        .map(|r| (r.sku, r.regular_price))
        .collect();

    let mut candidates = Vec::new();
    let mut offset = 0;
    loop {
        let page = mappings.list(cfg.store_page_size, offset).await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for mapping in page {
            let quantity = stock_by_sku.get(&mapping.my_sku).copied().unwrap_or(0);
            if quantity <= 0 {
                continue;
            }
            let Some(&sale_price) = price_by_sku.get(&mapping.my_sku) else {
                continue;
            };
            if sale_price <= Decimal::ZERO {
                continue;
            }
            let product = match supplier.get_product(&mapping.foneday_sku).await {
                Ok(Some(p)) => p,
                Ok(None) => continue,
                Err(err) => {
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
            let Some(cost_eur) = product.price.filter(|p| *p > Decimal::ZERO) else {
                continue;
            };
            let m = margin::margin(cost_eur, sale_price, cfg.fx_rate, cfg.vat_multiplier);
            if m >= min_margin {
                candidates.push(OpportunityCandidate {
                    my_sku: mapping.my_sku,
                    foneday_sku: mapping.foneday_sku,
                    product_id: mapping.product_id,
                    cost_eur,
                    sale_price_ron: sale_price,
                    margin: m,
                    stock_quantity: quantity,
                });
            }
        }
    }
    Ok(candidates)
}

/// Operator-confirmed opportunity commit: same external call and audit
/// append as the automatic path, with the operator's quantity.
pub async fn commit_opportunity(
    candidate: &OpportunityCandidate,
    quantity: u32,
    supplier: &dyn SupplierApi,
    cart: &dyn CartRepository,
    events: &dyn EventSink,
) -> anyhow::Result<CartEntry> {
    if quantity == 0 {
        bail!("opportunity commit requires a positive quantity");
    }
    place_and_record(
        supplier,
        cart,
        events,
        NewCartEntry {
            product_id: candidate.product_id,
            sku: candidate.my_sku.clone(),
            foneday_sku: candidate.foneday_sku.clone(),
            quantity,
            price_eur: candidate.cost_eur,
            woo_price_ron: candidate.sale_price_ron,
            profit_margin: candidate.margin,
            is_profitable: true,
            status: CartStatus::AddedToCart,
            note: Some(format!("operator restock {}", candidate.my_sku)),
        },
    )
    .await
}

/// External call first, audit row second. An append failure is reported but
/// never rolls the placed addition back.
async fn place_and_record(
    supplier: &dyn SupplierApi,
    cart: &dyn CartRepository,
    events: &dyn EventSink,
    entry: NewCartEntry,
) -> anyhow::Result<CartEntry> {
    supplier
        .add_to_cart(
            &entry.foneday_sku,
            entry.quantity,
            entry.note.as_deref().unwrap_or(""),
        )
        .await?;
    record(
        events,
        NewEvent::new(
            "cart_add",
            EventStatus::Success,
            format!(
                "{} x{} added to supplier cart (margin {}%)",
                entry.foneday_sku, entry.quantity, entry.profit_margin
            ),
        )
        .for_sku(entry.sku.clone()),
    )
    .await;
    cart.append(entry).await
}

pub struct SqliteCartRepository {
    conn: Connection,
}

impl SqliteCartRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS cart_entry (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    product_id TEXT,
                    sku TEXT NOT NULL,
                    foneday_sku TEXT NOT NULL,
                    quantity INTEGER NOT NULL,
                    price_eur TEXT NOT NULL,
                    woo_price_ron TEXT NOT NULL,
                    profit_margin TEXT NOT NULL,
                    is_profitable INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    note TEXT,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_cart_entry_status ON cart_entry (status)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CartEntry> {
    let product_id: Option<String> = row.get(1)?;
    let quantity: i64 = row.get(4)?;
    let price_eur: String = row.get(5)?;
    let woo_price: String = row.get(6)?;
    let profit_margin: String = row.get(7)?;
    let is_profitable: i64 = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(CartEntry {
        id: row.get(0)?,
        product_id: product_id.and_then(|id| Uuid::parse_str(&id).ok()),
        sku: row.get(2)?,
        foneday_sku: row.get(3)?,
        quantity: quantity.max(0) as u32,
        price_eur: decimal_from_text(5, price_eur)?,
        woo_price_ron: decimal_from_text(6, woo_price)?,
        profit_margin: decimal_from_text(7, profit_margin)?,
        is_profitable: is_profitable != 0,
        status: CartStatus::parse(&status).unwrap_or(CartStatus::NotProfitable),
        note: row.get(10)?,
        created_at: row.get(11)?,
    })
}

enum TransitionOutcome {
    Missing,
    Illegal(CartStatus),
    Applied,
}

#[async_trait]
impl CartRepository for SqliteCartRepository {
    async fn append(&self, entry: NewCartEntry) -> anyhow::Result<CartEntry> {
        let now = now_ts();
        let SqlWrapper(out) = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cart_entry
                        (product_id, sku, foneday_sku, quantity, price_eur, woo_price_ron,
                         profit_margin, is_profitable, status, note, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        entry.product_id.map(|id| id.to_string()),
                        entry.sku,
                        entry.foneday_sku,
                        entry.quantity as i64,
                        entry.price_eur.to_string(),
                        entry.woo_price_ron.to_string(),
                        entry.profit_margin.to_string(),
                        entry.is_profitable as i64,
                        entry.status.as_str(),
                        entry.note,
                        now
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(SqlWrapper(CartEntry {
                    id,
                    product_id: entry.product_id,
                    sku: entry.sku,
                    foneday_sku: entry.foneday_sku,
                    quantity: entry.quantity,
                    price_eur: entry.price_eur,
                    woo_price_ron: entry.woo_price_ron,
                    profit_margin: entry.profit_margin,
                    is_profitable: entry.is_profitable,
                    status: entry.status,
                    note: entry.note,
                    created_at: now,
                }))
            })
            .await?;
        Ok(out)
    }

    async fn transition(&self, id: i64, next: CartStatus) -> anyhow::Result<CartEntry> {
        let SqlWrapper(outcome) = self
            .conn
            .call(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM cart_entry WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(SqlWrapper(TransitionOutcome::Missing));
                };
                let current = CartStatus::parse(&current).unwrap_or(CartStatus::NotProfitable);
                if !current.can_transition(next) {
                    return Ok(SqlWrapper(TransitionOutcome::Illegal(current)));
                }
                conn.execute(
                    "UPDATE cart_entry SET status = ?2 WHERE id = ?1",
                    params![id, next.as_str()],
                )?;
                Ok(SqlWrapper(TransitionOutcome::Applied))
            })
            .await?;
        match outcome {
            TransitionOutcome::Missing => bail!("cart entry {id} not found"),
            TransitionOutcome::Illegal(current) => {
                bail!("illegal cart entry transition {current} -> {next}")
            }
            TransitionOutcome::Applied => {
                let SqlWrapper(entry) = self
                    .conn
                    .call(move |conn| {
                        let mut stmt = conn.prepare(
                            "SELECT id, product_id, sku, foneday_sku, quantity, price_eur,
                                    woo_price_ron, profit_margin, is_profitable, status, note,
                                    created_at
                             FROM cart_entry WHERE id = ?1",
                        )?;
                        let entry = stmt
                            .query_map(params![id], row_to_entry)?
                            .collect::<Result<Vec<_>, _>>()?
                            .into_iter()
                            .next();
                        Ok(SqlWrapper(entry))
                    })
                    .await?;
                entry.ok_or_else(|| anyhow::anyhow!("cart entry {id} vanished"))
            }
        }
    }

    async fn list_by_status(&self, status: CartStatus) -> anyhow::Result<Vec<CartEntry>> {
        let SqlWrapper(rows) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, product_id, sku, foneday_sku, quantity, price_eur,
                            woo_price_ron, profit_margin, is_profitable, status, note,
                            created_at
                     FROM cart_entry WHERE status = ?1 ORDER BY created_at, id",
                )?;
                let rows = stmt
                    .query_map(params![status.as_str()], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SqliteEventLog;
    use crate::foneday::FonedayProduct;
    use crate::mapper::{SkuMapping, SqliteMappingRepository, EXACT_MATCH_SCORE};
    use crate::pending::{
        confirm_cart_entry, PendingOrderRepository, PendingStatus, SqlitePendingOrderRepository,
    };
    use crate::restock::{scan_zero_stock, SqliteSnapshotRepository};
    use crate::stock_sync::{
        PriceRecord, SqlitePriceRepository, SqliteStockRepository, StockRecord,
    };
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct FakeSupplier {
        products: Vec<FonedayProduct>,
        cart_calls: Mutex<Vec<(String, u32)>>,
        fail_cart: bool,
    }

    impl FakeSupplier {
        fn new(products: Vec<FonedayProduct>) -> Self {
            Self {
                products,
                cart_calls: Mutex::new(Vec::new()),
                fail_cart: false,
            }
        }

        fn cart_calls(&self) -> Vec<(String, u32)> {
            self.cart_calls.lock().expect("cart calls lock").clone()
        }
    }

    #[async_trait]
    impl SupplierApi for FakeSupplier {
        async fn get_product(&self, sku: &str) -> anyhow::Result<Option<FonedayProduct>> {
            Ok(self.products.iter().find(|p| p.sku == sku).cloned())
        }
        async fn list_catalog(&self) -> anyhow::Result<Vec<FonedayProduct>> {
            Ok(self.products.clone())
        }
        async fn add_to_cart(&self, sku: &str, quantity: u32, _note: &str) -> anyhow::Result<()> {
            if self.fail_cart {
                return Err(anyhow::anyhow!("cart endpoint unavailable"));
            }
            self.cart_calls
                .lock()
                .expect("cart calls lock")
                .push((sku.to_string(), quantity));
            Ok(())
        }
    }

    fn supplier_product(sku: &str, price: &str) -> FonedayProduct {
        serde_json::from_value(serde_json::json!({
            "sku": sku,
            "instock": "Y",
            "price": price,
            "title": "Part",
            "quality": "OEM",
        }))
        .expect("payload")
    }

    struct Fixture {
        stock: SqliteStockRepository,
        prices: SqlitePriceRepository,
        mappings: SqliteMappingRepository,
        snapshots: SqliteSnapshotRepository,
        cart: SqliteCartRepository,
        pending: SqlitePendingOrderRepository,
        events: SqliteEventLog,
    }

    async fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().await.expect("open db");
        Fixture {
            stock: SqliteStockRepository::init(conn.clone()).await.expect("stock"),
            prices: SqlitePriceRepository::init(conn.clone())
                .await
                .expect("prices"),
            mappings: SqliteMappingRepository::init(conn.clone())
                .await
                .expect("mappings"),
            snapshots: SqliteSnapshotRepository::init(conn.clone())
                .await
                .expect("snapshots"),
            cart: SqliteCartRepository::init(conn.clone()).await.expect("cart"),
            pending: SqlitePendingOrderRepository::init(conn.clone())
                .await
                .expect("pending"),
            events: SqliteEventLog::init(conn.clone()).await.expect("events"),
        }
    }

    fn reference_config() -> SyncConfig {
        SyncConfig {
            fx_rate: dec!(5.1),
            vat_multiplier: dec!(1.21),
            ..SyncConfig::default()
        }
    }

    async fn seed_pair(f: &Fixture, sku: &str, foneday_sku: &str, qty: i64, price: Decimal) {
        f.stock
            .insert_batch(vec![StockRecord {
                sku: sku.into(),
                stock_quantity: qty,
                woo_product_id: 1,
                last_sync_at: 0,
            }])
            .await
            .expect("stock row");
        f.prices
            .insert_batch(vec![PriceRecord {
                sku: sku.into(),
                regular_price: price,
                woo_product_id: 1,
                last_sync_at: 0,
            }])
            .await
            .expect("price row");
        f.mappings
            .upsert_batch(vec![SkuMapping {
                my_sku: sku.into(),
                foneday_artcode: sku.into(),
                foneday_sku: foneday_sku.into(),
                product_id: Some(Uuid::new_v4()),
                mapping_score: EXACT_MATCH_SCORE,
                last_verified_at: 0,
            }])
            .await
            .expect("mapping");
    }

    #[tokio::test]
    async fn profitable_zero_stock_item_is_committed() {
        let f = fixture().await;
        let cfg = reference_config();
        // SKU X at zero stock, storefront 100 RON, supplier 10 EUR in stock.
        seed_pair(&f, "X", "Y", 0, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);

        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        let tally = commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        assert_eq!(
            tally,
            CommitTally {
                committed: 1,
                rejected: 0,
                skipped: 0,
                errors: 0
            }
        );
        assert_eq!(supplier.cart_calls(), vec![("Y".to_string(), 2)]);

        let added = f
            .cart
            .list_by_status(CartStatus::AddedToCart)
            .await
            .expect("added");
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].quantity, 2);
        assert_eq!(added[0].profit_margin, dec!(38.29));
        assert!(added[0].is_profitable);
    }

    #[tokio::test]
    async fn unprofitable_item_is_audited_without_external_call() {
        let f = fixture().await;
        let cfg = reference_config();
        // 40 RON sale price: cost ratio ~1.54, rejected.
        seed_pair(&f, "X", "Y", 0, dec!(40)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);

        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        let tally = commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        assert_eq!(
            tally,
            CommitTally {
                committed: 0,
                rejected: 1,
                skipped: 0,
                errors: 0
            }
        );
        assert!(supplier.cart_calls().is_empty());

        let rejected = f
            .cart
            .list_by_status(CartStatus::NotProfitable)
            .await
            .expect("rejected");
        assert_eq!(rejected.len(), 1);
        assert!(!rejected[0].is_profitable);
    }

    #[tokio::test]
    async fn boundary_margin_is_rejected() {
        let f = fixture().await;
        // fx = vat = 1; cost 88 against sale 100 sits exactly on the 0.88
        // ratio and must not be committed.
        let cfg = SyncConfig {
            fx_rate: Decimal::ONE,
            vat_multiplier: Decimal::ONE,
            ..SyncConfig::default()
        };
        seed_pair(&f, "X", "Y", 0, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "88.00")]);

        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        let tally = commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        assert_eq!(tally.rejected, 1);
        assert_eq!(tally.committed, 0);
        assert!(supplier.cart_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_storefront_price_is_skipped() {
        let f = fixture().await;
        let cfg = reference_config();
        f.stock
            .insert_batch(vec![StockRecord {
                sku: "X".into(),
                stock_quantity: 0,
                woo_product_id: 1,
                last_sync_at: 0,
            }])
            .await
            .expect("stock row");
        f.mappings
            .upsert_batch(vec![SkuMapping {
                my_sku: "X".into(),
                foneday_artcode: "X".into(),
                foneday_sku: "Y".into(),
                product_id: None,
                mapping_score: EXACT_MATCH_SCORE,
                last_verified_at: 0,
            }])
            .await
            .expect("mapping");
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);

        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        let tally = commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        assert_eq!(tally.skipped, 1);
        assert!(supplier.cart_calls().is_empty());
    }

    #[tokio::test]
    async fn external_failure_is_counted_and_never_audited_as_placed() {
        let f = fixture().await;
        let cfg = reference_config();
        seed_pair(&f, "X", "Y", 0, dec!(100)).await;
        let mut supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);
        supplier.fail_cart = true;

        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        let tally = commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        assert_eq!(tally.errors, 1);
        assert!(f
            .cart
            .list_by_status(CartStatus::AddedToCart)
            .await
            .expect("added")
            .is_empty());
    }

    #[tokio::test]
    async fn confirmation_creates_one_pending_order_and_retires_the_entry() {
        let f = fixture().await;
        let cfg = reference_config();
        seed_pair(&f, "X", "Y", 0, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);
        scan_zero_stock(
            &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
        )
        .await
        .expect("scan");
        commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
            .await
            .expect("commit");
        let added = f
            .cart
            .list_by_status(CartStatus::AddedToCart)
            .await
            .expect("added");
        let entry_id = added[0].id;

        let order = confirm_cart_entry(&f.cart, &f.pending, &f.events, entry_id, None, None)
            .await
            .expect("confirm");
        assert_eq!(order.status, PendingStatus::Pending);
        assert_eq!(order.quantity, 2);
        assert_eq!(
            f.pending
                .pending_quantities()
                .await
                .expect("index")
                .get("X"),
            Some(&2)
        );

        // Never a candidate again, and never confirmable twice.
        assert!(f
            .cart
            .list_by_status(CartStatus::AddedToCart)
            .await
            .expect("added")
            .is_empty());
        let err = confirm_cart_entry(&f.cart, &f.pending, &f.events, entry_id, None, None)
            .await
            .expect_err("double confirm must fail");
        assert!(err.to_string().contains("illegal"));
    }

    #[tokio::test]
    async fn opportunity_scan_targets_positive_stock_only() {
        let f = fixture().await;
        let cfg = reference_config();
        seed_pair(&f, "IN-STOCK", "FD-A", 5, dec!(100)).await;
        seed_pair(&f, "SOLD-OUT", "FD-B", 0, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![
            supplier_product("FD-A", "10.00"),
            supplier_product("FD-B", "10.00"),
        ]);

        let candidates =
            scan_opportunities(&f.mappings, &f.stock, &f.prices, &supplier, &cfg, dec!(30))
                .await
                .expect("scan");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].my_sku, "IN-STOCK");
        assert_eq!(candidates[0].margin, dec!(38.29));
        assert_eq!(candidates[0].stock_quantity, 5);

        // A higher operator threshold filters it out.
        let none = scan_opportunities(&f.mappings, &f.stock, &f.prices, &supplier, &cfg, dec!(50))
            .await
            .expect("scan");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn operator_quantity_flows_through_opportunity_commit() {
        let f = fixture().await;
        let cfg = reference_config();
        seed_pair(&f, "IN-STOCK", "FD-A", 5, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("FD-A", "10.00")]);
        let candidates =
            scan_opportunities(&f.mappings, &f.stock, &f.prices, &supplier, &cfg, dec!(30))
                .await
                .expect("scan");

        let entry = commit_opportunity(&candidates[0], 7, &supplier, &f.cart, &f.events)
            .await
            .expect("commit");
        assert_eq!(entry.quantity, 7);
        assert_eq!(entry.status, CartStatus::AddedToCart);
        assert_eq!(supplier.cart_calls(), vec![("FD-A".to_string(), 7)]);
    }

    #[tokio::test]
    async fn repeat_runs_may_recommit_the_same_pair() {
        let f = fixture().await;
        let cfg = reference_config();
        seed_pair(&f, "X", "Y", 0, dec!(100)).await;
        let supplier = FakeSupplier::new(vec![supplier_product("Y", "10.00")]);

        for _ in 0..2 {
            scan_zero_stock(
                &f.stock, &f.pending, &f.mappings, &supplier, &f.snapshots, &f.events,
            )
            .await
            .expect("scan");
            commit_restocks(&f.snapshots, &f.prices, &supplier, &f.cart, &f.events, &cfg)
                .await
                .expect("commit");
        }
        // No dedup against prior unconfirmed entries, by design.
        assert_eq!(supplier.cart_calls().len(), 2);
        assert_eq!(
            f.cart
                .list_by_status(CartStatus::AddedToCart)
                .await
                .expect("added")
                .len(),
            2
        );
    }
}
