//! Shared setup for the integration tests
//!
//! Tests run against the server in `DATABASE_URL` and return early when it is
//! not set.

#![allow(dead_code)]

use pgctx::{Args, Bound, Config, Context, Releaser, args};
use sqlx::Row;

pub async fn setup() -> Option<(Context, Releaser)> {
    setup_with(|config| config).await
}

pub async fn setup_with(adjust: impl FnOnce(Config) -> Config) -> Option<(Context, Releaser)> {
    let config = match Config::from_env() {
        Ok(config) => adjust(config),
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping");
            return None;
        }
    };
    let ctx = Context::background().with_config(config);
    let (installer, releaser) = pgctx::open(&ctx).await.expect("open database");
    Some((installer.install(&ctx), releaser))
}

/// Single-row counter table, unique per test so tests can run in parallel
pub struct Counter {
    table: String,
}

impl Counter {
    pub async fn create(ctx: &Context) -> Self {
        let table = format!("test_transaction_{}", rand::random::<u32>());
        let db = pgctx::bind(ctx).unwrap();
        db.execute(
            &format!(
                "CREATE TABLE {} (id bigint NOT NULL PRIMARY KEY, counter bigint NOT NULL)",
                table
            ),
            Args::new(),
        )
        .await
        .unwrap();
        db.execute(
            &format!("INSERT INTO {} (id, counter) VALUES ($1, $2)", table),
            args![0_i64, 0_i64],
        )
        .await
        .unwrap();
        Self { table }
    }

    pub fn table(&self) -> String {
        self.table.clone()
    }

    pub async fn value(&self, ctx: &Context) -> i64 {
        read_counter(&pgctx::bind(ctx).unwrap(), &self.table)
            .await
            .unwrap()
    }

    pub async fn drop(self, ctx: &Context) {
        pgctx::bind(ctx)
            .unwrap()
            .execute(&format!("DROP TABLE {}", self.table), Args::new())
            .await
            .unwrap();
    }
}

pub async fn read_counter(db: &Bound, table: &str) -> pgctx::Result<i64> {
    let row = db
        .query_one(&format!("SELECT counter FROM {} WHERE id = 0", table), Args::new())
        .await?;
    Ok(row.try_get("counter")?)
}

/// `counter = counter + 1` on whatever handle `ctx` currently carries
pub async fn increment(ctx: &Context, table: &str) -> pgctx::Result<()> {
    pgctx::bind(ctx)?
        .execute(
            &format!("UPDATE {} SET counter = counter + 1 WHERE id = 0", table),
            Args::new(),
        )
        .await?;
    Ok(())
}

/// Fails with a server-raised SQLSTATE 40001
pub async fn raise_serialization_failure(ctx: &Context) -> pgctx::Result<()> {
    pgctx::bind(ctx)?
        .execute(
            "DO $$ BEGIN RAISE EXCEPTION 'simulated conflict' USING ERRCODE = 'serialization_failure'; END $$",
            Args::new(),
        )
        .await?;
    Ok(())
}
