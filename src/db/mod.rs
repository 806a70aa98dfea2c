use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

pub async fn init() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;

    let pool = connect(&database_url).await?;
    migrate(&pool).await?;

    Ok(pool)
}

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid DATABASE_URL: {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        // a WriteTx dropped before commit leaves its transaction open on the connection
        .after_release(|conn, _meta| {
            Box::pin(async move {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Ok(true)
            })
        })
        .connect_with(options)
        .await
        .context("failed to connect to database")
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("failed to run migrations")
}

/// Write transaction opened with `BEGIN IMMEDIATE`.
///
/// Under WAL a deferred transaction that reads before its first write cannot wait for the write
/// lock: SQLite fails the upgrade with `SQLITE_BUSY` no matter the busy timeout. Taking the lock
/// at `BEGIN` makes concurrent writers queue on `busy_timeout` instead.
///
/// Dropping without [`WriteTx::commit`] rolls back when the connection returns to the pool.
#[derive(Debug)]
pub struct WriteTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl WriteTx {
    pub async fn begin(pool: &SqlitePool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(Self { conn, open: true })
    }

    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if self.open {
            tracing::debug!("write transaction dropped before commit");
        }
    }
}

/// Opens a named savepoint inside the current transaction. Rolling back to it leaves the
/// enclosing transaction usable.
pub async fn savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("SAVEPOINT {name}")).execute(&mut *conn).await?;
    Ok(())
}

pub async fn release_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("RELEASE {name}")).execute(&mut *conn).await?;
    Ok(())
}

pub async fn rollback_to_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("ROLLBACK TO {name}")).execute(&mut *conn).await?;
    release_savepoint(conn, name).await
}
