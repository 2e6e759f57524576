//! Orders confirmed by an operator as "in transit". The restock scanner
//! consults the aggregated pending index so an item already on order is never
//! restocked twice.

use crate::cart::{CartRepository, CartStatus};
use crate::events::{record, EventSink, EventStatus, NewEvent};
use crate::{now_ts, SqlWrapper};
use anyhow::bail;
use async_trait::async_trait;
use rusqlite::params;
use std::collections::HashMap;
use tokio_rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Delivered,
    Cancelled,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Legal transitions: `pending` -> either terminal state. Re-entering the
    /// state a row is already in is an idempotent no-op.
    pub fn can_transition(self, next: PendingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Delivered) | (Self::Pending, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrder {
    pub id: i64,
    pub sku: String,
    pub foneday_sku: String,
    pub quantity: u32,
    pub order_date: i64,
    pub expected_delivery_date: Option<i64>,
    pub confirmed_at: i64,
    pub status: PendingStatus,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPendingOrder {
    pub sku: String,
    pub foneday_sku: String,
    pub quantity: u32,
    pub expected_delivery_date: Option<i64>,
    pub note: Option<String>,
}

#[async_trait]
pub trait PendingOrderRepository: Send + Sync {
    async fn add(&self, order: NewPendingOrder) -> anyhow::Result<PendingOrder>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<PendingOrder>>;
    /// Move a row to a terminal state. Errors on an illegal transition;
    /// re-applying the current terminal state only bumps the timestamp.
    async fn transition(&self, id: i64, next: PendingStatus) -> anyhow::Result<PendingOrder>;
    /// Sum of quantities per SKU across rows with `status = pending` — the
    /// sole read contract consumed by the restock scanner.
    async fn pending_quantities(&self) -> anyhow::Result<HashMap<String, i64>>;
}

/// Operator confirmation: flips the cart entry `added_to_cart -> confirmed`
/// (one-way) and creates exactly one pending order from it.
pub async fn confirm_cart_entry(
    cart: &dyn CartRepository,
    pending: &dyn PendingOrderRepository,
    events: &dyn EventSink,
    cart_entry_id: i64,
    expected_delivery_date: Option<i64>,
    note: Option<String>,
) -> anyhow::Result<PendingOrder> {
    let entry = cart.transition(cart_entry_id, CartStatus::Confirmed).await?;
    let order = pending
        .add(NewPendingOrder {
            sku: entry.sku.clone(),
            foneday_sku: entry.foneday_sku.clone(),
            quantity: entry.quantity,
            expected_delivery_date,
            note,
        })
        .await?;
    record(
        events,
        NewEvent::new(
            "order_confirmed",
            EventStatus::Success,
            format!("{} x{} confirmed in transit", entry.foneday_sku, entry.quantity),
        )
        .for_sku(entry.sku),
    )
    .await;
    Ok(order)
}

pub struct SqlitePendingOrderRepository {
    conn: Connection,
}

impl SqlitePendingOrderRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS pending_order (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sku TEXT NOT NULL,
                    foneday_sku TEXT NOT NULL,
                    quantity INTEGER NOT NULL,
                    order_date INTEGER NOT NULL,
                    expected_delivery_date INTEGER,
                    confirmed_at INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    note TEXT
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_pending_order_status
                 ON pending_order (status, sku)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOrder> {
    let quantity: i64 = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(PendingOrder {
        id: row.get(0)?,
        sku: row.get(1)?,
        foneday_sku: row.get(2)?,
        quantity: quantity.max(0) as u32,
        order_date: row.get(4)?,
        expected_delivery_date: row.get(5)?,
        confirmed_at: row.get(6)?,
        status: PendingStatus::parse(&status).unwrap_or(PendingStatus::Pending),
        note: row.get(8)?,
    })
}

#[async_trait]
impl PendingOrderRepository for SqlitePendingOrderRepository {
    async fn add(&self, order: NewPendingOrder) -> anyhow::Result<PendingOrder> {
        let now = now_ts();
        let SqlWrapper(out) = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_order
                        (sku, foneday_sku, quantity, order_date, expected_delivery_date,
                         confirmed_at, status, note)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        order.sku,
                        order.foneday_sku,
                        order.quantity as i64,
                        now,
                        order.expected_delivery_date,
                        now,
                        PendingStatus::Pending.as_str(),
                        order.note
                    ],
                )?;
                let id = conn.last_insert_rowid();
                Ok(SqlWrapper(PendingOrder {
                    id,
                    sku: order.sku,
                    foneday_sku: order.foneday_sku,
                    quantity: order.quantity,
                    order_date: now,
                    expected_delivery_date: order.expected_delivery_date,
                    confirmed_at: now,
                    status: PendingStatus::Pending,
                    note: order.note,
                }))
            })
            .await?;
        Ok(out)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<PendingOrder>> {
        let SqlWrapper(order) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sku, foneday_sku, quantity, order_date,
                            expected_delivery_date, confirmed_at, status, note
                     FROM pending_order WHERE id = ?1",
                )?;
                let order = stmt
                    .query_map(params![id], row_to_order)?
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .next();
                Ok(SqlWrapper(order))
            })
            .await?;
        Ok(order)
    }

    async fn transition(&self, id: i64, next: PendingStatus) -> anyhow::Result<PendingOrder> {
        let now = now_ts();
        let SqlWrapper(outcome) = self
            .conn
            .call(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT status FROM pending_order WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|err| match err {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(current) = current else {
                    return Ok(SqlWrapper(Outcome::Missing));
                };
                let current = PendingStatus::parse(&current).unwrap_or(PendingStatus::Pending);
                if current == next {
                    // Idempotent re-click: timestamp bump only.
                    conn.execute(
                        "UPDATE pending_order SET confirmed_at = ?2 WHERE id = ?1",
                        params![id, now],
                    )?;
                    return Ok(SqlWrapper(Outcome::NoOp));
                }
                if !current.can_transition(next) {
                    return Ok(SqlWrapper(Outcome::Illegal(current)));
                }
                conn.execute(
                    "UPDATE pending_order SET status = ?2, confirmed_at = ?3 WHERE id = ?1",
                    params![id, next.as_str(), now],
                )?;
                Ok(SqlWrapper(Outcome::Applied))
            })
            .await?;
        match outcome {
            Outcome::Missing => bail!("pending order {id} not found"),
            Outcome::Illegal(current) => {
                bail!("illegal pending order transition {current} -> {next}")
            }
            Outcome::NoOp | Outcome::Applied => self
                .get(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("pending order {id} vanished")),
        }
    }

    async fn pending_quantities(&self) -> anyhow::Result<HashMap<String, i64>> {
        let SqlWrapper(rows) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT sku, SUM(quantity) FROM pending_order
                     WHERE status = 'pending' GROUP BY sku",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let sku: String = row.get(0)?;
                        let total: i64 = row.get(1)?;
                        Ok((sku, total))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows.into_iter().collect())
    }
}

enum Outcome {
    Missing,
    Illegal(PendingStatus),
    NoOp,
    Applied,
}
