//! Supplier cross-reference normalization. The supplier's `artcode` field is
//! denormalized: a bare scalar, a JSON array, or a JSON array serialized into
//! a string. Fan it out into one `(foneday_sku, artcode)` row per value so
//! cross-references become queryable by equality.

use crate::SqlWrapper;
use async_trait::async_trait;
use rusqlite::params;
use serde_json::Value;
use tokio_rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedArtcode {
    pub foneday_sku: String,
    pub artcode: String,
}

/// Flatten a raw `artcode` value into clean strings, in order of precedence:
/// absent/empty -> nothing; array -> its elements; text -> JSON array if it
/// parses as one, otherwise the text itself; anything else -> its string
/// form. Elements are stripped of whitespace and enclosing quotes, empties
/// dropped.
pub fn normalize_artcodes(raw: &Value) -> Vec<String> {
    let values: Vec<String> = match raw {
        Value::Null => return Vec::new(),
        Value::Array(items) => items.iter().map(scalar_text).collect(),
        Value::String(text) => {
            if text.trim().is_empty() {
                return Vec::new();
            }
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Array(items)) => items.iter().map(scalar_text).collect(),
                _ => vec![text.clone()],
            }
        }
        other => vec![scalar_text(other)],
    };
    values
        .iter()
        .map(|v| clean(v))
        .filter(|v| !v.is_empty())
        .collect()
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn clean(s: &str) -> String {
    s.trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

#[async_trait]
pub trait ArtcodeRepository: Send + Sync {
    /// Upsert the current artcode set for a supplier SKU and sweep rows that
    /// fell out of it. Idempotent on re-import.
    async fn replace_for_sku(&self, foneday_sku: String, artcodes: Vec<String>)
        -> anyhow::Result<()>;
    async fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<NormalizedArtcode>>;
    async fn list_for_artcode(&self, artcode: String) -> anyhow::Result<Vec<NormalizedArtcode>>;
}

pub struct SqliteArtcodeRepository {
    conn: Connection,
}

impl SqliteArtcodeRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS normalized_artcode (
                    foneday_sku TEXT NOT NULL,
                    artcode TEXT NOT NULL,
                    PRIMARY KEY (foneday_sku, artcode)
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_normalized_artcode_artcode
                 ON normalized_artcode (artcode)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ArtcodeRepository for SqliteArtcodeRepository {
    async fn replace_for_sku(
        &self,
        foneday_sku: String,
        artcodes: Vec<String>,
    ) -> anyhow::Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for artcode in &artcodes {
                    tx.execute(
                        "INSERT INTO normalized_artcode (foneday_sku, artcode)
                         VALUES (?1, ?2)
                         ON CONFLICT (foneday_sku, artcode) DO NOTHING",
                        params![foneday_sku, artcode],
                    )?;
                }
                // Sweep rows whose value dropped out of the current set.
                let placeholders = std::iter::repeat("?")
                    .take(artcodes.len())
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = if artcodes.is_empty() {
                    "DELETE FROM normalized_artcode WHERE foneday_sku = ?1".to_string()
                } else {
                    format!(
                        "DELETE FROM normalized_artcode
                         WHERE foneday_sku = ?1 AND artcode NOT IN ({placeholders})"
                    )
                };
                let mut values: Vec<&dyn rusqlite::ToSql> = vec![&foneday_sku];
                for artcode in &artcodes {
                    values.push(artcode);
                }
                tx.execute(&sql, values.as_slice())?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<NormalizedArtcode>> {
        let SqlWrapper(rows) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT foneday_sku, artcode FROM normalized_artcode
                     ORDER BY foneday_sku, artcode LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], |row| {
                        Ok(NormalizedArtcode {
                            foneday_sku: row.get(0)?,
                            artcode: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SqlWrapper(rows))
            })
            .await?;
        Ok(rows)
    }

    async fn list_for_artcode(&self, artcode: String) -> anyhow::Result<Vec<NormalizedArtcode>> {
        let SqlWrapper(rows) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT foneday_sku, artcode FROM normalized_artcode
                     WHERE artcode = ?1 ORDER BY foneday_sku",
                )?;
                let rows = stmt
                    .query_map(params![artcode], |row| {
                        Ok(NormalizedArtcode {
                            foneday_sku: row.get(0)?,
                            artcode: row.get(1)?,
                        })
                    })?
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
    use serde_json::json;

    fn set(values: Vec<String>) -> std::collections::BTreeSet<String> {
        values.into_iter().collect()
    }

    #[test]
    fn json_array_text_fans_out() {
        assert_eq!(
            set(normalize_artcodes(&json!(r#"["A1","A2"]"#))),
            set(vec!["A1".into(), "A2".into()])
        );
    }

    #[test]
    fn structured_array_is_used_directly() {
        assert_eq!(
            set(normalize_artcodes(&json!(["A1", "A2", 33]))),
            set(vec!["A1".into(), "A2".into(), "33".into()])
        );
    }

    #[test]
    fn bare_scalar_is_a_single_element() {
        assert_eq!(normalize_artcodes(&json!("A1")), vec!["A1".to_string()]);
        assert_eq!(normalize_artcodes(&json!(42)), vec!["42".to_string()]);
    }

    #[test]
    fn quotes_and_whitespace_are_stripped() {
        assert_eq!(
            normalize_artcodes(&json!(" \"A1\" ")),
            vec!["A1".to_string()]
        );
        assert_eq!(normalize_artcodes(&json!("'A2'")), vec!["A2".to_string()]);
    }

    #[test]
    fn empty_inputs_produce_nothing() {
        assert!(normalize_artcodes(&Value::Null).is_empty());
        assert!(normalize_artcodes(&json!("")).is_empty());
        assert!(normalize_artcodes(&json!("   ")).is_empty());
        assert!(normalize_artcodes(&json!(["", "  ", "\"\""])).is_empty());
    }

    #[test]
    fn unparseable_text_is_kept_whole() {
        assert_eq!(
            normalize_artcodes(&json!("[not json")),
            vec!["[not json".to_string()]
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let raw = json!(r#"[" A1 ","'A2'","A1"]"#);
        assert_eq!(
            set(normalize_artcodes(&raw)),
            set(normalize_artcodes(&raw))
        );
    }

    #[tokio::test]
    async fn replace_sweeps_stale_rows_for_that_sku_only() {
        let conn = Connection::open_in_memory().await.expect("open db");
        let repo = SqliteArtcodeRepository::init(conn).await.expect("init");
        repo.replace_for_sku("F1".into(), vec!["A1".into(), "A2".into()])
            .await
            .expect("first import");
        repo.replace_for_sku("F2".into(), vec!["A1".into()])
            .await
            .expect("other sku");

        // F1's set shrinks; F2 must keep its rows.
        repo.replace_for_sku("F1".into(), vec!["A2".into()])
            .await
            .expect("re-import");
        let rows = repo.list(100, 0).await.expect("list");
        assert_eq!(
            rows,
            vec![
                NormalizedArtcode {
                    foneday_sku: "F1".into(),
                    artcode: "A2".into()
                },
                NormalizedArtcode {
                    foneday_sku: "F2".into(),
                    artcode: "A1".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn lookup_by_artcode_returns_all_suppliers() {
        let conn = Connection::open_in_memory().await.expect("open db");
        let repo = SqliteArtcodeRepository::init(conn).await.expect("init");
        repo.replace_for_sku("F1".into(), vec!["S1".into()])
            .await
            .expect("import F1");
        repo.replace_for_sku("F2".into(), vec!["S1".into()])
            .await
            .expect("import F2");
        let rows = repo.list_for_artcode("S1".into()).await.expect("lookup");
        assert_eq!(rows.len(), 2);
    }
}
