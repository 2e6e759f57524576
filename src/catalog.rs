//! Read-only view of the internal product catalog. The catalog itself is
//! owned by the storefront; this system only resolves SKUs and enumerates
//! primary ones.

use crate::SqlWrapper;
use async_trait::async_trait;
use rusqlite::params;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InternalSku {
    pub sku: String,
    pub product_id: Uuid,
    pub name: String,
    pub is_primary: bool,
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn resolve(&self, sku: String) -> anyhow::Result<Option<InternalSku>>;
    /// Primary SKUs only (one per product), paginated.
    async fn list_primary(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<InternalSku>>;
    async fn skus_for_product(&self, product_id: Uuid) -> anyhow::Result<Vec<InternalSku>>;
}

pub struct SqliteCatalogView {
    conn: Connection,
}

impl SqliteCatalogView {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS internal_sku (
                    sku TEXT PRIMARY KEY,
                    product_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    is_primary INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_sku(row: &rusqlite::Row<'_>) -> rusqlite::Result<InternalSku> {
    let sku: String = row.get(0)?;
    let product_id: String = row.get(1)?;
    let name: String = row.get(2)?;
    let is_primary: i64 = row.get(3)?;
    Ok(InternalSku {
        sku,
        product_id: Uuid::parse_str(&product_id).unwrap_or(Uuid::nil()),
        name,
        is_primary: is_primary != 0,
    })
}

#[async_trait]
impl CatalogLookup for SqliteCatalogView {
    async fn resolve(&self, sku: String) -> anyhow::Result<Option<InternalSku>> {
        let SqlWrapper(item) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, product_id, name, is_primary
                     FROM internal_sku WHERE sku = ?1",
                )?;
                let item = stmt
                    .query_map(params![sku], row_to_sku)?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .next();
                Ok(SqlWrapper(item))
            })
            .await?;
        Ok(item)
    }

    async fn list_primary(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<InternalSku>> {
        let SqlWrapper(items) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, product_id, name, is_primary
                     FROM internal_sku WHERE is_primary = 1
                     ORDER BY sku LIMIT ?1 OFFSET ?2",
                )?;
                let items = stmt
                    .query_map(params![limit as i64, offset as i64], row_to_sku)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(items))
            })
            .await?;
        Ok(items)
    }

    async fn skus_for_product(&self, product_id: Uuid) -> anyhow::Result<Vec<InternalSku>> {
        let SqlWrapper(items) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, product_id, name, is_primary
                     FROM internal_sku WHERE product_id = ?1 ORDER BY sku",
                )?;
                let items = stmt
                    .query_map(params![product_id.to_string()], row_to_sku)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(items))
            })
            .await?;
        Ok(items)
    }
}

#[cfg(test)]
pub(crate) async fn seed(conn: &Connection, rows: Vec<InternalSku>) {
    conn.call(move |conn| {
        for r in rows {
            conn.execute(
                "INSERT OR REPLACE INTO internal_sku (sku, product_id, name, is_primary)
                 VALUES (?1, ?2, ?3, ?4)",
                params![r.sku, r.product_id.to_string(), r.name, r.is_primary as i64],
            )?;
        }
        Ok(())
    })
    .await
    .expect("seed internal_sku");
}
