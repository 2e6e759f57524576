//! Internal SKU -> supplier identifier mapping. Joins primary internal SKUs
//! against the normalized artcode index as an in-memory hash lookup, so the
//! whole pass costs two paginated scans plus chunked upserts instead of one
//! query per SKU.
//!
//! Mappings are never deleted here; a re-run refreshes `last_verified_at` on
//! everything it still matches, so staleness is visible by timestamp.

use crate::artcode::ArtcodeRepository;
use crate::catalog::CatalogLookup;
use crate::config::SyncConfig;
use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::{now_ts, SqlWrapper};
use async_trait::async_trait;
use itertools::Itertools;
use rusqlite::params;
use std::collections::HashMap;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// Exact-equality matches always score 100; the field exists so fuzzier
/// match sources can rank below them later.
pub const EXACT_MATCH_SCORE: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkuMapping {
    pub my_sku: String,
    pub foneday_artcode: String,
    pub foneday_sku: String,
    pub product_id: Option<Uuid>,
    pub mapping_score: i64,
    pub last_verified_at: i64,
}

#[async_trait]
pub trait MappingRepository: Send + Sync {
    async fn upsert_batch(&self, rows: Vec<SkuMapping>) -> anyhow::Result<()>;
    async fn list_for_sku(&self, my_sku: String) -> anyhow::Result<Vec<SkuMapping>>;
    async fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<SkuMapping>>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapTally {
    /// Primary internal SKUs examined.
    pub scanned: usize,
    /// SKUs that matched at least one artcode.
    pub matched: usize,
    /// Mapping rows actually written (best effort).
    pub written: usize,
    pub errors: usize,
}

/// Build the association table. Ambiguous cross-references produce one row
/// per matching supplier SKU; picking a winner is deferred to scan time.
pub async fn build_mappings(
    catalog: &dyn CatalogLookup,
    artcodes: &dyn ArtcodeRepository,
    mappings: &dyn MappingRepository,
    events: &dyn EventSink,
    cfg: &SyncConfig,
) -> anyhow::Result<MapTally> {
    // Artcode value -> supplier SKUs carrying it.
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    let mut offset = 0;
    loop {
        let page = artcodes.list(cfg.store_page_size, offset).await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for row in page {
            index.entry(row.artcode).or_default().push(row.foneday_sku);
        }
    }

    let mut tally = MapTally::default();
    let mut rows: Vec<SkuMapping> = Vec::new();
    let now = now_ts();
    let mut offset = 0;
    loop {
        let page = catalog.list_primary(cfg.store_page_size, offset).await?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for sku in page {
            tally.scanned += 1;
            let Some(matches) = index.get(&sku.sku) else {
                continue;
            };
            tally.matched += 1;
            for foneday_sku in matches {
                rows.push(SkuMapping {
                    my_sku: sku.sku.clone(),
                    foneday_artcode: sku.sku.clone(),
                    foneday_sku: foneday_sku.clone(),
                    product_id: Some(sku.product_id),
                    mapping_score: EXACT_MATCH_SCORE,
                    last_verified_at: now,
                });
            }
        }
    }

    for chunk in &rows.into_iter().chunks(cfg.upsert_chunk_size.max(1)) {
        let chunk: Vec<SkuMapping> = chunk.collect();
        let n = chunk.len();
        match mappings.upsert_batch(chunk).await {
            Ok(()) => tally.written += n,
            Err(err) => {
                log::warn!("Mapping chunk of {n} dropped: {err}");
                tally.errors += n;
            }
        }
    }

    record(
        events,
        NewEvent::new(
            "sku_mapping",
            EventStatus::Success,
            format!(
                "mapping: {} scanned, {} matched, {} written, {} errors",
                tally.scanned, tally.matched, tally.written, tally.errors
            ),
        ),
    )
    .await;
    Ok(tally)
}

pub struct SqliteMappingRepository {
    conn: Connection,
}

impl SqliteMappingRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            // Keyed per (internal SKU, artcode, supplier SKU): one artcode may
            // resolve to several supplier SKUs and all of them must persist.
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sku_mapping (
                    my_sku TEXT NOT NULL,
                    foneday_artcode TEXT NOT NULL,
                    foneday_sku TEXT NOT NULL,
                    product_id TEXT,
                    mapping_score INTEGER NOT NULL,
                    last_verified_at INTEGER NOT NULL,
                    PRIMARY KEY (my_sku, foneday_artcode, foneday_sku)
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sku_mapping_my_sku ON sku_mapping (my_sku)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkuMapping> {
    let product_id: Option<String> = row.get(3)?;
    Ok(SkuMapping {
        my_sku: row.get(0)?,
        foneday_artcode: row.get(1)?,
        foneday_sku: row.get(2)?,
        product_id: product_id.and_then(|id| Uuid::parse_str(&id).ok()),
        mapping_score: row.get(4)?,
        last_verified_at: row.get(5)?,
    })
}

#[async_trait]
impl MappingRepository for SqliteMappingRepository {
    async fn upsert_batch(&self, rows: Vec<SkuMapping>) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &rows {
                    tx.execute(
                        "INSERT INTO sku_mapping
                            (my_sku, foneday_artcode, foneday_sku, product_id,
                             mapping_score, last_verified_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT (my_sku, foneday_artcode, foneday_sku) DO UPDATE SET
                            product_id = excluded.product_id,
                            mapping_score = excluded.mapping_score,
                            last_verified_at = excluded.last_verified_at",
                        params![
                            r.my_sku,
                            r.foneday_artcode,
                            r.foneday_sku,
                            r.product_id.map(|id| id.to_string()),
                            r.mapping_score,
                            r.last_verified_at
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_for_sku(&self, my_sku: String) -> anyhow::Result<Vec<SkuMapping>> {
        let SqlWrapper(rows) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT my_sku, foneday_artcode, foneday_sku, product_id,
                            mapping_score, last_verified_at
                     FROM sku_mapping WHERE my_sku = ?1 ORDER BY foneday_sku",
                )?;
                let rows = stmt
                    .query_map(params![my_sku], row_to_mapping)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }

    async fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<SkuMapping>> {
        let SqlWrapper(rows) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT my_sku, foneday_artcode, foneday_sku, product_id,
                            mapping_score, last_verified_at
                     FROM sku_mapping ORDER BY my_sku, foneday_sku LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], row_to_mapping)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }
}
