use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::database::{DatabaseError, Result};

// Database connection pool type
pub type DbPool = Pool<Sqlite>;

/// Quiesces and reopens the application's connections around a file swap
///
/// Both operations must be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Close every connection to the live database
    async fn close_all(&self) -> Result<()>;

    /// Reopen connections to the live database
    async fn open(&self) -> Result<()>;
}

/// Build the pool options used for the live database
pub fn pool_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
}

/// Open a pool on the live database
pub async fn init_db(db_path: &Path, max_connections: u32) -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(pool_options(db_path))
        .await
        .map_err(|e| DatabaseError::Sqlite(format!("Failed to open {}: {}", db_path.display(), e)))?;
    Ok(pool)
}

/// [`ConnectionManager`] owning the application's sqlx pool
pub struct SqlitePoolManager {
    /// Live database file
    db_path: PathBuf,
    /// Pool size used on every open
    max_connections: u32,
    /// Current pool, `None` while closed
    pool: RwLock<Option<DbPool>>,
}

impl SqlitePoolManager {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            max_connections: 5,
            pool: RwLock::new(None),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Current pool, if open
    pub async fn pool(&self) -> Option<DbPool> {
        self.pool.read().await.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.pool.read().await.is_some()
    }
}

#[async_trait]
impl ConnectionManager for SqlitePoolManager {
    async fn close_all(&self) -> Result<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(path = %self.db_path.display(), "Closed database connections");
        } else {
            debug!(path = %self.db_path.display(), "Connections already closed");
        }
        Ok(())
    }

    async fn open(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            debug!(path = %self.db_path.display(), "Connections already open");
            return Ok(());
        }
        *guard = Some(init_db(&self.db_path, self.max_connections).await?);
        info!(path = %self.db_path.display(), "Opened database connections");
        Ok(())
    }
}
