//! Relay persistence.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use super::model::{RelayCredential, RelayEndpoint, RelayHealth, RelayId};
use crate::{Error, Result};

/// Durable storage behind a [`RelayStore`](super::RelayStore).
#[async_trait]
pub trait RelayRepository: Send + Sync {
    /// Loads every stored relay, oldest first.
    async fn load_all(&self) -> Result<Vec<RelayCredential>>;

    /// Inserts or replaces one relay.
    async fn upsert(&self, relay: &RelayCredential) -> Result<()>;

    /// Deletes one relay; deleting an absent relay is not an error.
    async fn delete(&self, id: RelayId) -> Result<()>;
}

/// `SQLite` implementation of [`RelayRepository`].
pub struct SqliteRelayRepository {
    pool: SqlitePool,
}

impl SqliteRelayRepository {
    /// Opens (creating if needed) the database at `database_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    /// Create an in-memory repository for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { pool };
        repo.initialize().await?;
        Ok(repo)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS relays (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                secret TEXT NOT NULL,
                from_email TEXT NOT NULL,
                from_name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                daily_quota INTEGER,
                sent_today INTEGER NOT NULL DEFAULT 0,
                quota_day TEXT,
                health TEXT NOT NULL,
                last_error TEXT,
                last_validated_at TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RelayRepository for SqliteRelayRepository {
    async fn load_all(&self) -> Result<Vec<RelayCredential>> {
        let rows = sqlx::query(
            r"
            SELECT id, username, secret, from_email, from_name, endpoint,
                   daily_quota, sent_today, quota_day,
                   health, last_error, last_validated_at
            FROM relays
            ORDER BY rowid ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_relay).collect()
    }

    async fn upsert(&self, relay: &RelayCredential) -> Result<()> {
        let (health, last_error) = match &relay.health {
            RelayHealth::Unvalidated => ("unvalidated", None),
            RelayHealth::Valid => ("valid", None),
            RelayHealth::Invalid { reason } => ("invalid", Some(reason.as_str())),
        };

        sqlx::query(
            r"
            INSERT INTO relays (
                id, username, secret, from_email, from_name, endpoint,
                daily_quota, sent_today, quota_day,
                health, last_error, last_validated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                secret = excluded.secret,
                from_email = excluded.from_email,
                from_name = excluded.from_name,
                endpoint = excluded.endpoint,
                daily_quota = excluded.daily_quota,
                sent_today = excluded.sent_today,
                quota_day = excluded.quota_day,
                health = excluded.health,
                last_error = excluded.last_error,
                last_validated_at = excluded.last_validated_at,
                updated_at = CURRENT_TIMESTAMP
            ",
        )
        .bind(relay.id.to_string())
        .bind(&relay.username)
        .bind(&relay.secret)
        .bind(&relay.from_email)
        .bind(&relay.from_name)
        .bind(serde_json::to_string(&relay.endpoint)?)
        .bind(relay.daily_quota.map(i64::from))
        .bind(i64::from(relay.sent_today))
        .bind(relay.quota_day.map(|d| d.to_string()))
        .bind(health)
        .bind(last_error)
        .bind(relay.last_validated_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        debug!(relay = %relay.id, "Persisted relay");
        Ok(())
    }

    async fn delete(&self, id: RelayId) -> Result<()> {
        sqlx::query("DELETE FROM relays WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Convert a database row to a relay.
fn row_to_relay(row: &SqliteRow) -> Result<RelayCredential> {
    let raw_id: String = row.try_get("id")?;
    let corrupt = |reason: String| Error::CorruptRecord {
        id: raw_id.clone(),
        reason,
    };

    let id = raw_id
        .parse::<RelayId>()
        .map_err(|e| corrupt(format!("bad id: {e}")))?;
    let endpoint: RelayEndpoint = serde_json::from_str(row.try_get::<&str, _>("endpoint")?)?;

    let health = match row.try_get::<&str, _>("health")? {
        "valid" => RelayHealth::Valid,
        "invalid" => RelayHealth::Invalid {
            reason: row
                .try_get::<Option<String>, _>("last_error")?
                .unwrap_or_else(|| "unknown failure".to_string()),
        },
        _ => RelayHealth::Unvalidated,
    };

    let quota_day = row
        .try_get::<Option<String>, _>("quota_day")?
        .map(|s| s.parse::<NaiveDate>())
        .transpose()
        .map_err(|e| corrupt(format!("bad quota_day: {e}")))?;

    let last_validated_at = row
        .try_get::<Option<String>, _>("last_validated_at")?
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| corrupt(format!("bad last_validated_at: {e}")))?;

    let daily_quota = row
        .try_get::<Option<i64>, _>("daily_quota")?
        .map(u32::try_from)
        .transpose()
        .map_err(|e| corrupt(format!("bad daily_quota: {e}")))?;
    let sent_today = u32::try_from(row.try_get::<i64, _>("sent_today")?)
        .map_err(|e| corrupt(format!("bad sent_today: {e}")))?;

    let mut relay = RelayCredential::new(
        row.try_get::<String, _>("username")?,
        row.try_get::<String, _>("secret")?,
        endpoint,
    );
    relay.id = id;
    relay.from_email = row.try_get("from_email")?;
    relay.from_name = row.try_get("from_name")?;
    relay.daily_quota = daily_quota;
    relay.sent_today = sent_today;
    relay.quota_day = quota_day;
    relay.health = health;
    relay.last_validated_at = last_validated_at;
    Ok(relay)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::relay::{ApiDetails, ApiProvider, RelayStore, Security, SmtpDetails};
    use std::sync::Arc;

    fn smtp_relay() -> RelayCredential {
        RelayCredential::new(
            "bob@corp.example",
            "hunter2",
            RelayEndpoint::Smtp(SmtpDetails {
                host: "smtp.corp.com".to_string(),
                port: 587,
                security: Security::StartTls,
                host_guessed: true,
            }),
        )
        .with_daily_quota(Some(200))
    }

    #[tokio::test]
    async fn upsert_and_load_round_trip() {
        let repo = SqliteRelayRepository::in_memory().await.unwrap();
        let mut relay = smtp_relay();
        relay.mark_invalid("535 authentication failed");
        relay.quota_day = Some(NaiveDate::from_ymd_opt(2026, 1, 2).unwrap());
        relay.sent_today = 12;
        repo.upsert(&relay).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![relay]);
    }

    #[tokio::test]
    async fn upsert_updates_in_place() {
        let repo = SqliteRelayRepository::in_memory().await.unwrap();
        let mut relay = smtp_relay();
        let api = RelayCredential::new(
            "api",
            "SG.key",
            RelayEndpoint::Api(ApiDetails {
                provider: ApiProvider::SendGrid,
                region: None,
                domain: None,
            }),
        );
        repo.upsert(&relay).await.unwrap();
        repo.upsert(&api).await.unwrap();

        relay.mark_valid(Utc::now());
        repo.upsert(&relay).await.unwrap();

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, relay.id);
        assert!(loaded[0].is_valid());
        assert_eq!(loaded[1].id, api.id);
    }

    #[tokio::test]
    async fn store_writes_through() {
        let repo = Arc::new(SqliteRelayRepository::in_memory().await.unwrap());
        let store = RelayStore::open(repo.clone()).await.unwrap();
        let relay = smtp_relay();
        store.upsert(relay.clone()).await.unwrap();
        store.increment_sent(relay.id, 3).await.unwrap();

        let reopened = RelayStore::open(repo.clone()).await.unwrap();
        assert_eq!(reopened.get(relay.id).await.unwrap().sent_today, 3);

        store.remove(relay.id).await.unwrap();
        assert!(repo.load_all().await.unwrap().is_empty());
    }
}
