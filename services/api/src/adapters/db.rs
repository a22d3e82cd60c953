//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `BookmarkStore` and `AuthService` ports from the `core` crate. It handles
//! all interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use bookmark_sync_core::domain::{Bookmark, NewBookmark, Snapshot, User, UserCredentials};
use bookmark_sync_core::ports::{AuthService, BookmarkStore, PortError, PortResult};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the store and auth ports.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct BookmarkRecord {
    id: Uuid,
    owner: Uuid,
    url: String,
    title: String,
    created_at: DateTime<Utc>,
}
impl BookmarkRecord {
    fn to_domain(self) -> Bookmark {
        Bookmark {
            id: self.id,
            url: self.url,
            title: self.title,
            owner: self.owner,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    email: Option<String>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            email: self.email,
        }
    }
}

#[derive(FromRow)]
struct CredentialsRecord {
    user_id: Uuid,
    email: String,
    hashed_password: String,
}
impl CredentialsRecord {
    fn to_domain(self) -> UserCredentials {
        UserCredentials {
            user_id: self.user_id,
            email: self.email,
            hashed_password: self.hashed_password,
        }
    }
}

/// Maps constraint violations to `Rejected`, everything else to `Unexpected`.
fn map_write_error(e: sqlx::Error) -> PortError {
    if let sqlx::Error::Database(db_err) = &e {
        // 23505 unique, 23503 foreign key, 23514 check.
        if matches!(db_err.code().as_deref(), Some("23505" | "23503" | "23514")) {
            return PortError::Rejected(db_err.message().to_string());
        }
    }
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// `BookmarkStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl BookmarkStore for PgStore {
    async fn list_bookmarks(&self, owner: Uuid) -> PortResult<Snapshot> {
        // Rows and watermark must come from the same database snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let watermark: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) FROM bookmark_changes WHERE owner = $1",
        )
        .bind(owner)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let records = sqlx::query_as::<_, BookmarkRecord>(
            "SELECT id, owner, url, title, created_at FROM bookmarks WHERE owner = $1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        debug!("Listed {} bookmarks for user {} at seq {}", records.len(), owner, watermark);
        Ok(Snapshot {
            bookmarks: records.into_iter().map(|r| r.to_domain()).collect(),
            watermark: u64::try_from(watermark).unwrap_or(0),
        })
    }

    async fn insert_bookmark(&self, new: NewBookmark) -> PortResult<Bookmark> {
        let record = sqlx::query_as::<_, BookmarkRecord>(
            "INSERT INTO bookmarks (owner, url, title) VALUES ($1, $2, $3) RETURNING id, owner, url, title, created_at",
        )
        .bind(new.owner())
        .bind(new.url())
        .bind(new.title())
        .fetch_one(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(record.to_domain())
    }

    async fn delete_bookmark(&self, owner: Uuid, id: Uuid) -> PortResult<()> {
        let result = sqlx::query("DELETE FROM bookmarks WHERE id = $1 AND owner = $2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        if result.rows_affected() == 0 {
            debug!("Delete of bookmark {} for user {} matched no row", id, owner);
        }
        Ok(())
    }
}

//=========================================================================================
// `AuthService` Trait Implementation
//=========================================================================================

#[async_trait]
impl AuthService for PgStore {
    async fn current_user(&self, auth_session_id: &str) -> PortResult<Option<User>> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT u.user_id, u.email FROM auth_sessions s \
             JOIN users u ON u.user_id = s.user_id \
             WHERE s.id = $1 AND s.expires_at > now()",
        )
        .bind(auth_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn create_user_with_email(&self, email: &str, hashed_password: &str) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "INSERT INTO users (email, hashed_password) VALUES ($1, $2) RETURNING user_id, email",
        )
        .bind(email)
        .bind(hashed_password)
        .fetch_one(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(record.to_domain())
    }

    async fn get_user_by_email(&self, email: &str) -> PortResult<UserCredentials> {
        let record = sqlx::query_as::<_, CredentialsRecord>(
            "SELECT user_id, email, hashed_password FROM users WHERE email = $1 AND hashed_password IS NOT NULL",
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => PortError::NotFound(format!("User {} not found", email)),
            _ => PortError::Unexpected(e.to_string()),
        })?;
        Ok(record.to_domain())
    }

    async fn create_auth_session(
        &self,
        session_id: &str,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> PortResult<()> {
        sqlx::query("INSERT INTO auth_sessions (id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(session_id)
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn delete_auth_session(&self, session_id: &str) -> PortResult<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(())
    }
}
