//! Throwaway databases for integration tests
//!
//! Enabled with the `testing` feature.
//!
//! ```ignore
//! let ctx = Context::background().with_config(Config::from_env()?);
//! let (db, ctx) = TestDatabase::setup(&ctx).await?;
//! // ... run tests against ctx ...
//! db.teardown().await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use log::info;
use sqlx::Connection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{Releaser, open};
use crate::context::Context;
use crate::driver::{Args, bind};
use crate::error::{Error, LogErr, Result, WithOp};

const ADMIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a pool on `url` and verify it answers within five seconds
pub async fn open_admin(url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ADMIN_CONNECT_TIMEOUT)
        .connect(url)
        .await
        .map_err(Error::Connect)?;

    let live = tokio::time::timeout(ADMIN_CONNECT_TIMEOUT, async {
        let mut conn = pool.acquire().await.map_err(Error::Connect)?;
        conn.ping().await.map_err(Error::Connect)
    })
    .await;

    match live {
        Ok(Ok(())) => Ok(pool),
        Ok(Err(err)) => {
            pool.close().await;
            Err(err)
        }
        Err(_) => {
            pool.close().await;
            Err(Error::ConnectTimeout(ADMIN_CONNECT_TIMEOUT))
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// Sessions still attached to the database, including ones a just-closed pool
// has not finished tearing down, are terminated rather than waited for.
fn drop_statement(name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name))
}

/// Create `name` on the server behind `url`, dropping any previous copy
pub async fn create_db(url: &str, name: &str) -> Result<()> {
    let pool = open_admin(url).await?;
    let result = async {
        sqlx::query(&drop_statement(name))
            .execute(&pool)
            .await
            .op("drop database")?;
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(name)))
            .execute(&pool)
            .await
            .op("create database")?;
        Ok::<(), Error>(())
    }
    .await;
    pool.close().await;
    result
}

pub async fn drop_db(url: &str, name: &str) -> Result<()> {
    let pool = open_admin(url).await?;
    let result = sqlx::query(&drop_statement(name))
        .execute(&pool)
        .await
        .op("drop database")
        .map(|_| ());
    pool.close().await;
    result
}

/// `url` with its database (path) replaced by `name`
pub fn select_db(url: &str, name: &str) -> Result<String> {
    let mut parsed =
        Url::parse(url).map_err(|e| Error::InvalidConfig(format!("postgresUrl: {}", e)))?;
    parsed.set_path(name);
    Ok(parsed.to_string())
}

/// A uniquely named database that lives for one test suite
pub struct TestDatabase {
    name: String,
    admin_url: String,
    releaser: Releaser,
}

impl TestDatabase {
    /// Create `test_<uuid>` next to the database in the context's configuration
    /// and return a context configured for it with its pool installed.
    pub async fn setup(ctx: &Context) -> Result<(Self, Context)> {
        let config = ctx.config()?;
        let name = format!("test_{}", Uuid::new_v4());
        let scoped = Config {
            postgres_url: select_db(&config.postgres_url, &name)?,
            ..(*config).clone()
        };
        create_db(&config.postgres_url, &name).await?;
        let ctx = ctx.with_config(scoped);

        let (installer, releaser) = match open(&ctx).await {
            Ok(opened) => opened,
            Err(err) => {
                drop_db(&config.postgres_url, &name)
                    .await
                    .log_warn("drop test database after failed open");
                return Err(err);
            }
        };
        let ctx = installer.install(&ctx);
        info!("test database {} ready", name);

        let db = Self {
            name,
            admin_url: config.postgres_url.clone(),
            releaser,
        };
        let db = db.keep_if(reset_now(&ctx).await).await?;
        Ok((db, ctx))
    }

    /// Tear the database down and return the error unless `prepared` succeeded
    async fn keep_if<T>(self, prepared: Result<T>) -> Result<Self> {
        match prepared {
            Ok(_) => Ok(self),
            Err(err) => {
                self.teardown()
                    .await
                    .log_warn("drop test database after failed setup");
                Err(err)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn teardown(self) -> Result<()> {
        self.releaser.release().await;
        drop_db(&self.admin_url, &self.name).await?;
        info!("test database {} dropped", self.name);
        Ok(())
    }
}

/// Make SQL function `pg_now()` return `t`, truncated to microseconds like
/// Postgres timestamps. Returns the truncated time.
pub async fn set_now(ctx: &Context, t: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let t = t.with_nanosecond(t.nanosecond() / 1_000 * 1_000).unwrap_or(t);
    let sql = format!(
        "CREATE OR REPLACE FUNCTION pg_now() RETURNS timestamptz AS \
         $$ SELECT '{}'::timestamptz; $$ LANGUAGE SQL STABLE",
        t.to_rfc3339_opts(SecondsFormat::Micros, true)
    );
    bind(ctx)?.execute(&sql, Args::new()).await?;
    Ok(t)
}

/// Make SQL function `pg_now()` return `now()` again
pub async fn reset_now(ctx: &Context) -> Result<()> {
    bind(ctx)?
        .execute(
            "CREATE OR REPLACE FUNCTION pg_now() RETURNS timestamptz AS \
             $$ SELECT now(); $$ LANGUAGE SQL STABLE",
            Args::new(),
        )
        .await?;
    Ok(())
}
