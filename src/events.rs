//! Append-only event log. Write-only from this crate's perspective: rows are
//! read back only by the display layer, never for control flow, so append
//! failures are swallowed.

use crate::now_ts;
use async_trait::async_trait;
use log_error::LogError;
use rusqlite::params;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Info,
    Success,
    Warning,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub sku: Option<String>,
    pub product_id: Option<Uuid>,
    pub message: String,
    pub status: EventStatus,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        status: EventStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            sku: None,
            product_id: None,
            message: message.into(),
            status,
        }
    }

    pub fn for_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: NewEvent) -> anyhow::Result<()>;
}

/// Fire-and-forget append.
pub async fn record(sink: &dyn EventSink, event: NewEvent) {
    let _ = sink
        .append(event)
        .await
        .log_error("Unable to record event");
}

pub struct SqliteEventLog {
    conn: Connection,
}

impl SqliteEventLog {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS event_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    sku TEXT,
                    product_id TEXT,
                    message TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) async fn count(&self) -> usize {
        use crate::SqlWrapper;
        let SqlWrapper(count) = self
            .conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM event_log", [], |r| r.get(0))?;
                Ok(SqlWrapper(count))
            })
            .await
            .expect("count events");
        count as usize
    }
}

#[async_trait]
impl EventSink for SqliteEventLog {
    async fn append(&self, event: NewEvent) -> anyhow::Result<()> {
        let now = now_ts();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO event_log (event_type, sku, product_id, message, status, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        event.event_type,
                        event.sku,
                        event.product_id.map(|id| id.to_string()),
                        event.message,
                        event.status.as_str(),
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
