use std::collections::HashSet;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::sync::SyncDoc;

/// Collections sharing the uniform (id, doc, cached_at) shape. Table names
/// passed to the generic helpers must come from this set; they are static
/// strings chosen by the library, never caller input.
pub const COLLECTIONS: &[&str] = &[
    "leagues",
    "teams",
    "players",
    "fixtures",
    "coaches",
    "rivals",
    "h2h_records",
];

/// SQLite's default variable limit is 999; stay comfortably below it.
const IN_CLAUSE_CHUNK: usize = 500;

fn check_collection(table: &str) {
    debug_assert!(
        COLLECTIONS.contains(&table),
        "unknown collection: {table}"
    );
}

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Documents ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
}

/// Per-item results of an unordered bulk write. A row-level failure lands in
/// `errors` and does not stop the remaining rows.
#[derive(Debug, Default)]
pub struct BatchWriteResult {
    pub written: u64,
    pub errors: Vec<(String, String)>,
}

/// One read for a whole batch: which of these identifiers already exist?
pub fn find_existing_ids(
    conn: &Connection,
    table: &str,
    ids: &[String],
) -> Result<HashSet<String>, rusqlite::Error> {
    check_collection(table);
    let mut found = HashSet::with_capacity(ids.len());
    for chunk in ids.chunks(IN_CLAUSE_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("SELECT id FROM {table} WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        for row in rows {
            found.insert(row?);
        }
    }
    Ok(found)
}

/// Insert documents, continuing past row-level failures. A prepare failure is
/// a whole-operation error and surfaces as `Err`.
pub fn insert_docs(
    conn: &Connection,
    table: &str,
    docs: &[SyncDoc],
) -> Result<BatchWriteResult, rusqlite::Error> {
    check_collection(table);
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {table} (id, doc, cached_at) VALUES (?1, ?2, datetime('now'))"
    ))?;
    let mut result = BatchWriteResult::default();
    for doc in docs {
        match stmt.execute(params![doc.id, doc.doc.to_string()]) {
            Ok(_) => result.written += 1,
            Err(e) => result.errors.push((doc.id.clone(), e.to_string())),
        }
    }
    Ok(result)
}

/// Update documents, continuing past row-level failures. An update that
/// matches no row is recorded as a row-level failure.
pub fn update_docs(
    conn: &Connection,
    table: &str,
    docs: &[SyncDoc],
) -> Result<BatchWriteResult, rusqlite::Error> {
    check_collection(table);
    let mut stmt = conn.prepare(&format!(
        "UPDATE {table} SET doc = ?2, cached_at = datetime('now') WHERE id = ?1"
    ))?;
    let mut result = BatchWriteResult::default();
    for doc in docs {
        match stmt.execute(params![doc.id, doc.doc.to_string()]) {
            Ok(0) => result
                .errors
                .push((doc.id.clone(), "no existing row to update".into())),
            Ok(_) => result.written += 1,
            Err(e) => result.errors.push((doc.id.clone(), e.to_string())),
        }
    }
    Ok(result)
}

/// Create-or-update a single document. Existence is re-checked here, so the
/// caller's created/updated counters stay correct even when a batch is
/// retried or a bulk attempt partially applied.
pub fn upsert_doc(
    conn: &Connection,
    table: &str,
    doc: &SyncDoc,
) -> Result<UpsertKind, rusqlite::Error> {
    check_collection(table);
    let exists: bool = conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![doc.id],
        |row| row.get(0),
    )?;
    if exists {
        conn.execute(
            &format!("UPDATE {table} SET doc = ?2, cached_at = datetime('now') WHERE id = ?1"),
            params![doc.id, doc.doc.to_string()],
        )?;
        Ok(UpsertKind::Updated)
    } else {
        conn.execute(
            &format!(
                "INSERT INTO {table} (id, doc, cached_at) VALUES (?1, ?2, datetime('now'))"
            ),
            params![doc.id, doc.doc.to_string()],
        )?;
        Ok(UpsertKind::Created)
    }
}

pub fn get_doc(
    conn: &Connection,
    table: &str,
    id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    check_collection(table);
    conn.query_row(
        &format!("SELECT doc FROM {table} WHERE id = ?1"),
        params![id],
        |row| row.get(0),
    )
    .optional()
}

pub fn all_docs(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, rusqlite::Error> {
    check_collection(table);
    let mut stmt = conn.prepare(&format!("SELECT id, doc FROM {table} ORDER BY id"))?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn count_docs(conn: &Connection, table: &str) -> Result<u64, rusqlite::Error> {
    check_collection(table);
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get::<_, i64>(0).map(|n| n as u64)
    })
}

// ── Sync checkpoints ───────────────────────────────────────────────

pub fn get_checkpoint_doc(
    conn: &Connection,
    sync_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT doc FROM sync_checkpoints WHERE sync_id = ?1",
        params![sync_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_checkpoint_doc(
    conn: &Connection,
    sync_id: &str,
    doc: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_checkpoints (sync_id, doc, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(sync_id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
        params![sync_id, doc],
    )?;
    Ok(())
}

pub fn list_checkpoint_docs(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT sync_id, doc FROM sync_checkpoints ORDER BY sync_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

pub fn delete_checkpoint(conn: &Connection, sync_id: &str) -> Result<bool, rusqlite::Error> {
    let n = conn.execute(
        "DELETE FROM sync_checkpoints WHERE sync_id = ?1",
        params![sync_id],
    )?;
    Ok(n > 0)
}

// ── Sync metadata (TTL gate) ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncMetadataRow {
    pub category: String,
    pub last_sync_at: String,
    pub ttl_days: i64,
}

pub fn get_sync_metadata(
    conn: &Connection,
    category: &str,
) -> Result<Option<SyncMetadataRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT category, last_sync_at, ttl_days FROM sync_metadata WHERE category = ?1",
        params![category],
        |row| {
            Ok(SyncMetadataRow {
                category: row.get(0)?,
                last_sync_at: row.get(1)?,
                ttl_days: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn set_sync_metadata(
    conn: &Connection,
    category: &str,
    last_sync_at: &str,
    ttl_days: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_metadata (category, last_sync_at, ttl_days)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(category) DO UPDATE SET
           last_sync_at = excluded.last_sync_at, ttl_days = excluded.ttl_days",
        params![category, last_sync_at, ttl_days],
    )?;
    Ok(())
}

pub fn list_sync_metadata(conn: &Connection) -> Result<Vec<SyncMetadataRow>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT category, last_sync_at, ttl_days FROM sync_metadata ORDER BY category")?;
    let rows = stmt.query_map([], |row| {
        Ok(SyncMetadataRow {
            category: row.get(0)?,
            last_sync_at: row.get(1)?,
            ttl_days: row.get(2)?,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn doc(id: &str, name: &str) -> SyncDoc {
        SyncDoc {
            id: id.to_string(),
            doc: serde_json::json!({ "id": id, "name": name }),
        }
    }

    #[tokio::test]
    async fn insert_continues_past_duplicate_rows() {
        let db = Database::open_memory().await.unwrap();
        let docs = vec![doc("1", "a"), doc("2", "b"), doc("1", "dupe"), doc("3", "c")];
        let result = db
            .writer()
            .call(move |conn| insert_docs(conn, "teams", &docs))
            .await
            .unwrap();
        assert_eq!(result.written, 3);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, "1");
    }

    #[tokio::test]
    async fn update_reports_missing_rows() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| insert_docs(conn, "teams", &[doc("1", "a")]))
            .await
            .unwrap();
        let result = db
            .writer()
            .call(|conn| update_docs(conn, "teams", &[doc("1", "a2"), doc("9", "ghost")]))
            .await
            .unwrap();
        assert_eq!(result.written, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].0, "9");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_counts_correctly() {
        let db = Database::open_memory().await.unwrap();
        let kind = db
            .writer()
            .call(|conn| upsert_doc(conn, "players", &doc("77", "striker")))
            .await
            .unwrap();
        assert_eq!(kind, UpsertKind::Created);

        let kind = db
            .writer()
            .call(|conn| upsert_doc(conn, "players", &doc("77", "striker")))
            .await
            .unwrap();
        assert_eq!(kind, UpsertKind::Updated);

        let count = db
            .reader()
            .call(|conn| count_docs(conn, "players"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn find_existing_ids_returns_only_present() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| insert_docs(conn, "leagues", &[doc("10", "x"), doc("20", "y")]))
            .await
            .unwrap();
        let ids: Vec<String> = vec!["10".into(), "20".into(), "30".into()];
        let existing = db
            .reader()
            .call(move |conn| find_existing_ids(conn, "leagues", &ids))
            .await
            .unwrap();
        assert!(existing.contains("10"));
        assert!(existing.contains("20"));
        assert!(!existing.contains("30"));
    }

    #[tokio::test]
    async fn config_roundtrip() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| set_config(conn, "api_base_url", "https://example.test"))
            .await
            .unwrap();
        let value = db
            .reader()
            .call(|conn| get_config(conn, "api_base_url"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("https://example.test"));
    }

    #[tokio::test]
    async fn checkpoint_doc_roundtrip_and_delete() {
        let db = Database::open_memory().await.unwrap();
        db.writer()
            .call(|conn| set_checkpoint_doc(conn, "players_sync", "{\"current_page\":4}"))
            .await
            .unwrap();
        let stored = db
            .reader()
            .call(|conn| get_checkpoint_doc(conn, "players_sync"))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("{\"current_page\":4}"));

        let deleted = db
            .writer()
            .call(|conn| delete_checkpoint(conn, "players_sync"))
            .await
            .unwrap();
        assert!(deleted);
    }
}
