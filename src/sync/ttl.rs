use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::storage::{repository, Database};

/// Default TTL for gated categories.
pub const DEFAULT_TTL_DAYS: i64 = 7;

/// Freshness record for one sync category (e.g. "rivals_data", "h2h_data").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncMetadata {
    pub category: String,
    pub last_sync_at: DateTime<Utc>,
    pub ttl_days: i64,
}

fn parse_row(row: repository::SyncMetadataRow) -> Option<SyncMetadata> {
    DateTime::parse_from_rfc3339(&row.last_sync_at)
        .ok()
        .map(|t| SyncMetadata {
            category: row.category,
            last_sync_at: t.with_timezone(&Utc),
            ttl_days: row.ttl_days,
        })
}

/// A category is due iff it has never synced or its TTL has elapsed.
pub fn is_due(meta: Option<&SyncMetadata>, now: DateTime<Utc>) -> bool {
    match meta {
        None => true,
        Some(m) => now - m.last_sync_at >= Duration::days(m.ttl_days),
    }
}

pub async fn should_sync(db: &Database, category: &str) -> Result<bool> {
    let key = category.to_string();
    let row = db
        .reader()
        .call(move |conn| repository::get_sync_metadata(conn, &key))
        .await?;
    // An unparseable timestamp reads as "never synced".
    let meta = row.and_then(parse_row);
    Ok(is_due(meta.as_ref(), Utc::now()))
}

/// Record a successful sync of `category`. Written only after success, so a
/// failed run leaves the category due.
pub async fn record_sync(db: &Database, category: &str, ttl_days: i64) -> Result<()> {
    let key = category.to_string();
    let stamp = Utc::now().to_rfc3339();
    db.writer()
        .call(move |conn| repository::set_sync_metadata(conn, &key, &stamp, ttl_days))
        .await?;
    Ok(())
}

pub async fn list(db: &Database) -> Result<Vec<SyncMetadata>> {
    let rows = db
        .reader()
        .call(|conn| repository::list_sync_metadata(conn))
        .await?;
    Ok(rows.into_iter().filter_map(parse_row).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(days_ago: i64, ttl_days: i64) -> SyncMetadata {
        SyncMetadata {
            category: "h2h_data".into(),
            last_sync_at: Utc::now() - Duration::days(days_ago),
            ttl_days,
        }
    }

    #[test]
    fn never_synced_is_due() {
        assert!(is_due(None, Utc::now()));
    }

    #[test]
    fn due_exactly_at_ttl_boundary() {
        let now = Utc::now();
        let m = SyncMetadata {
            category: "h2h_data".into(),
            last_sync_at: now - Duration::days(7),
            ttl_days: 7,
        };
        assert!(is_due(Some(&m), now));
    }

    #[test]
    fn fresh_sync_is_not_due() {
        assert!(!is_due(Some(&meta(6, 7)), Utc::now()));
    }

    #[test]
    fn stale_sync_is_due() {
        assert!(is_due(Some(&meta(8, 7)), Utc::now()));
    }

    #[tokio::test]
    async fn record_then_should_sync_is_false_until_ttl_elapses() {
        let db = Database::open_memory().await.unwrap();

        assert!(should_sync(&db, "h2h_data").await.unwrap());

        record_sync(&db, "h2h_data", 7).await.unwrap();
        assert!(!should_sync(&db, "h2h_data").await.unwrap());

        // Simulated clock: backdate the stored stamp by 8 days.
        let stale = (Utc::now() - Duration::days(8)).to_rfc3339();
        db.writer()
            .call(move |conn| repository::set_sync_metadata(conn, "h2h_data", &stale, 7))
            .await
            .unwrap();
        assert!(should_sync(&db, "h2h_data").await.unwrap());
    }

    #[tokio::test]
    async fn categories_are_independent() {
        let db = Database::open_memory().await.unwrap();
        record_sync(&db, "rivals_data", 7).await.unwrap();
        assert!(!should_sync(&db, "rivals_data").await.unwrap());
        assert!(should_sync(&db, "h2h_data").await.unwrap());
    }
}
