//! SQLite session store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{non_empty, SessionRepository, StoreError};
use crate::session::{Session, SessionProfile, SessionStatus};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    session_key        TEXT NOT NULL,
    owner_name         TEXT NOT NULL,
    owner_email        TEXT NOT NULL,
    account_id         TEXT,
    device_id          TEXT,
    status             TEXT NOT NULL,
    pairing_code       TEXT,
    pairing_expires_at TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    last_connected_at  TEXT,
    UNIQUE (tenant_id, session_key),
    UNIQUE (tenant_id, owner_email)
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_sessions_tenant_created ON sessions (tenant_id, created_at DESC)";

const COLUMNS: &str = "id, tenant_id, session_key, owner_name, owner_email, account_id, device_id, \
     status, pairing_code, pairing_expires_at, created_at, updated_at, last_connected_at";

/// Session store on a SQLite database.
#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: SqlitePool,
}

impl SqliteSessionRepository {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://pairgate.db`, and make sure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        info!(url, "session store ready");
        Ok(repo)
    }

    /// A private in-memory database. Kept on a single connection so the
    /// data lives as long as the pool.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        debug!("session schema applied");
        Ok(())
    }

    async fn fetch_many(&self, sql: &str, tenant_id: Option<&str>) -> Result<Vec<Session>, StoreError> {
        let mut query = sqlx::query(sql);
        if let Some(tenant_id) = tenant_id {
            query = query.bind(tenant_id);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_session)
            .collect()
    }

    fn expect_one(result: sqlx::sqlite::SqliteQueryResult, id: Uuid) -> Result<(), StoreError> {
        if result.rows_affected() == 0 {
            Err(StoreError::NotFound(id.to_string()))
        } else {
            Ok(())
        }
    }
}

fn row_to_session(row: &SqliteRow) -> Result<Session, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(Session {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        tenant_id: row.try_get("tenant_id")?,
        session_key: row.try_get("session_key")?,
        owner_name: row.try_get("owner_name")?,
        owner_email: row.try_get("owner_email")?,
        account_id: row.try_get("account_id")?,
        device_id: row.try_get("device_id")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        pairing_code: row.try_get("pairing_code")?,
        pairing_expires_at: row.try_get("pairing_expires_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_connected_at: row.try_get("last_connected_at")?,
    })
}

/// Turn unique-constraint violations into [`StoreError::Conflict`].
fn map_write_error(err: sqlx::Error, session_key: &str, email: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            let message = db.message();
            return if message.contains("owner_email") {
                StoreError::Conflict(format!("a session with email '{}' already exists", email))
            } else {
                StoreError::Conflict(format!(
                    "a session with key '{}' already exists",
                    session_key
                ))
            };
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(session.id.to_string())
            .bind(&session.tenant_id)
            .bind(&session.session_key)
            .bind(&session.owner_name)
            .bind(&session.owner_email)
            .bind(&session.account_id)
            .bind(&session.device_id)
            .bind(session.status.as_str())
            .bind(&session.pairing_code)
            .bind(session.pairing_expires_at)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.last_connected_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, &session.session_key, &session.owner_email))?;

        info!(session_key = %session.session_key, id = %session.id, "session created");
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Session, StoreError> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row_to_session(&row)
    }

    async fn get_by_key_and_tenant(
        &self,
        session_key: &str,
        tenant_id: &str,
    ) -> Result<Session, StoreError> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE session_key = ?1 AND tenant_id = ?2",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(session_key)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_key.to_string()))?;
        row_to_session(&row)
    }

    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<Session>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE tenant_id = ?1 AND owner_email = ?2",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(tenant_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_session)
            .transpose()
    }

    async fn reset_for_reregister(
        &self,
        id: Uuid,
        profile: &SessionProfile,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET owner_name = ?1, owner_email = ?2, status = ?3, \
             account_id = NULL, device_id = NULL, pairing_code = NULL, \
             pairing_expires_at = NULL, last_connected_at = NULL, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(SessionStatus::Pending.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, "", &profile.email))?;
        Self::expect_one(result, id)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        account_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let last_connected = (status == SessionStatus::Connected).then_some(now);
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, \
             account_id = COALESCE(?2, account_id), \
             device_id = COALESCE(?3, device_id), \
             last_connected_at = COALESCE(?4, last_connected_at), \
             updated_at = ?5 WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(non_empty(account_id))
        .bind(non_empty(device_id))
        .bind(last_connected)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        debug!(%id, %status, "session status updated");
        Self::expect_one(result, id)
    }

    async fn update_device_id(&self, id: Uuid, device_id: &str) -> Result<(), StoreError> {
        if device_id.is_empty() {
            return Ok(());
        }
        let result = sqlx::query("UPDATE sessions SET device_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(device_id)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Self::expect_one(result, id)
    }

    async fn update_pairing_code(
        &self,
        id: Uuid,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET pairing_code = ?1, pairing_expires_at = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(code)
        .bind(expires_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Self::expect_one(result, id)
    }

    async fn mark_logged_out(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, account_id = NULL, device_id = NULL, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(SessionStatus::Pending.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        info!(%id, "session logged out, back to pending");
        Self::expect_one(result, id)
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let sql = format!("SELECT {} FROM sessions ORDER BY created_at DESC", COLUMNS);
        self.fetch_many(&sql, None).await
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Session>, StoreError> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE tenant_id = ?1 ORDER BY created_at DESC",
            COLUMNS
        );
        self.fetch_many(&sql, Some(tenant_id)).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        info!(%id, "session deleted");
        Self::expect_one(result, id)
    }
}
