//! Driver capability
//!
//! The statement surface is the [`Driver`] trait: `execute`, `query` and
//! `query_one`. It has two implementors with identical call semantics:
//!
//! - [`PoolHandle`] runs each statement on a connection borrowed from the pool
//! - [`TxHandle`] runs it inside one in-flight transaction
//!
//! [`Handle`] is the enum of the two that the [`Context`] stores. Code that asks
//! the context for its current handle gets the transaction when it runs inside
//! [`Tx::run`](crate::Tx::run) and the pool otherwise, without changing a line.
//!
//! Internally both paths go through the same helpers, generic over sqlx's
//! `Executor` trait, so `&PgPool` and `&mut PgConnection` share one code path:
//!
//! ```ignore
//! async fn execute_on<'e, E>(executor: E, sql: &'e str, args: Args, simple: bool) -> Result<PgQueryResult>
//! where
//!     E: Executor<'e, Database = Postgres>,
//! ```
//!
//! [`Bound`] pairs a context with its handle so call sites don't repeat the
//! context argument:
//!
//! ```ignore
//! let db = pgctx::bind(&ctx)?;
//! db.execute("UPDATE counters SET value = value + 1 WHERE id = $1", args![id]).await?;
//! let row = db.query_one("SELECT value FROM counters WHERE id = $1", args![id]).await?;
//! let value: i64 = row.try_get("value")?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool, PgQueryResult, PgRow};
use sqlx::{Arguments, Encode, Executor, Postgres, Transaction, Type};
use tokio::sync::Mutex;

use crate::context::Context;
use crate::error::{Error, Result, WithOp};

/// Positional statement arguments (`$1`, `$2`, ...)
///
/// Encoding failures are recorded and reported when the statement runs, so
/// binding stays chainable. See also the [`args!`](crate::args) macro.
#[derive(Default)]
pub struct Args {
    inner: PgArguments,
    len: usize,
    error: Option<Error>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send + 'static,
    {
        self.len += 1;
        if self.error.is_none() {
            if let Err(source) = Arguments::add(&mut self.inner, value) {
                self.error = Some(Error::Encode {
                    position: self.len,
                    source,
                });
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn into_arguments(self) -> Result<PgArguments> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.inner),
        }
    }
}

/// Build [`Args`] from a list of values: `args![id, "name"]`
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new()$(.bind($value))+
    };
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Run a statement and return its completion (rows affected)
    async fn execute(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgQueryResult>;

    /// Run a query and collect every row
    async fn query(&self, ctx: &Context, sql: &str, args: Args) -> Result<Vec<PgRow>>;

    /// Run a query expected to return a row; no row is `sqlx::Error::RowNotFound`
    async fn query_one(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgRow>;
}

// In simple-protocol mode a statement without arguments is sent as a plain
// query string; statements with arguments still need the extended protocol but
// are never cached on the server.

async fn execute_on<'e, E>(executor: E, sql: &'e str, args: Args, simple: bool) -> Result<PgQueryResult>
where
    E: Executor<'e, Database = Postgres>,
{
    if simple && args.is_empty() {
        return executor.execute(sql).await.op("execute");
    }
    sqlx::query_with(sql, args.into_arguments()?)
        .persistent(!simple)
        .execute(executor)
        .await
        .op("execute")
}

async fn query_on<'e, E>(executor: E, sql: &'e str, args: Args, simple: bool) -> Result<Vec<PgRow>>
where
    E: Executor<'e, Database = Postgres>,
{
    if simple && args.is_empty() {
        return executor.fetch_all(sql).await.op("query");
    }
    sqlx::query_with(sql, args.into_arguments()?)
        .persistent(!simple)
        .fetch_all(executor)
        .await
        .op("query")
}

async fn query_one_on<'e, E>(executor: E, sql: &'e str, args: Args, simple: bool) -> Result<PgRow>
where
    E: Executor<'e, Database = Postgres>,
{
    if simple && args.is_empty() {
        return executor.fetch_one(sql).await.op("query one");
    }
    sqlx::query_with(sql, args.into_arguments()?)
        .persistent(!simple)
        .fetch_one(executor)
        .await
        .op("query one")
}

/// Handle backed by the connection pool
#[derive(Clone, Debug)]
pub struct PoolHandle {
    pool: PgPool,
    simple_protocol: bool,
}

impl PoolHandle {
    pub fn new(pool: PgPool, simple_protocol: bool) -> Self {
        Self {
            pool,
            simple_protocol,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn simple_protocol(&self) -> bool {
        self.simple_protocol
    }
}

#[async_trait]
impl Driver for PoolHandle {
    async fn execute(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgQueryResult> {
        ctx.guard(execute_on(&self.pool, sql, args, self.simple_protocol))
            .await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: Args) -> Result<Vec<PgRow>> {
        ctx.guard(query_on(&self.pool, sql, args, self.simple_protocol))
            .await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgRow> {
        ctx.guard(query_one_on(&self.pool, sql, args, self.simple_protocol))
            .await
    }
}

/// Handle backed by a single in-flight transaction
///
/// Clones share the transaction. Once the owning attempt commits or rolls
/// back, every clone fails with [`Error::TransactionFinished`].
#[derive(Clone)]
pub struct TxHandle {
    slot: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
    simple_protocol: bool,
}

impl TxHandle {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, simple_protocol: bool) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
            simple_protocol,
        }
    }

    #[cfg(test)]
    pub(crate) fn finished() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            simple_protocol: false,
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.slot.lock().await.is_none()
    }

    async fn take(&self) -> Result<Transaction<'static, Postgres>> {
        self.slot.lock().await.take().ok_or(Error::TransactionFinished)
    }

    // If the context gives up first the transaction is dropped, which hands the
    // connection back to the pool with a rollback queued.

    pub(crate) async fn commit(&self, ctx: &Context) -> Result<()> {
        let tx = self.take().await?;
        ctx.guard(async move { tx.commit().await.op("commit") }).await
    }

    pub(crate) async fn rollback(&self, ctx: &Context) -> Result<()> {
        let tx = self.take().await?;
        ctx.guard(async move { tx.rollback().await.op("rollback") })
            .await
    }
}

impl std::fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxHandle")
            .field("simple_protocol", &self.simple_protocol)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Driver for TxHandle {
    async fn execute(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgQueryResult> {
        ctx.guard(async {
            let mut slot = self.slot.lock().await;
            let tx = slot.as_mut().ok_or(Error::TransactionFinished)?;
            execute_on(&mut **tx, sql, args, self.simple_protocol).await
        })
        .await
    }

    async fn query(&self, ctx: &Context, sql: &str, args: Args) -> Result<Vec<PgRow>> {
        ctx.guard(async {
            let mut slot = self.slot.lock().await;
            let tx = slot.as_mut().ok_or(Error::TransactionFinished)?;
            query_on(&mut **tx, sql, args, self.simple_protocol).await
        })
        .await
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgRow> {
        ctx.guard(async {
            let mut slot = self.slot.lock().await;
            let tx = slot.as_mut().ok_or(Error::TransactionFinished)?;
            query_one_on(&mut **tx, sql, args, self.simple_protocol).await
        })
        .await
    }
}

/// The database handle installed in a [`Context`]
#[derive(Clone, Debug)]
pub enum Handle {
    Pool(PoolHandle),
    Tx(TxHandle),
}

impl Handle {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Handle::Tx(_))
    }
}

#[async_trait]
impl Driver for Handle {
    async fn execute(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgQueryResult> {
        match self {
            Handle::Pool(pool) => pool.execute(ctx, sql, args).await,
            Handle::Tx(tx) => tx.execute(ctx, sql, args).await,
        }
    }

    async fn query(&self, ctx: &Context, sql: &str, args: Args) -> Result<Vec<PgRow>> {
        match self {
            Handle::Pool(pool) => pool.query(ctx, sql, args).await,
            Handle::Tx(tx) => tx.query(ctx, sql, args).await,
        }
    }

    async fn query_one(&self, ctx: &Context, sql: &str, args: Args) -> Result<PgRow> {
        match self {
            Handle::Pool(pool) => pool.query_one(ctx, sql, args).await,
            Handle::Tx(tx) => tx.query_one(ctx, sql, args).await,
        }
    }
}

/// A handle together with the context its statements run under
#[derive(Clone, Debug)]
pub struct Bound {
    ctx: Context,
    handle: Handle,
}

impl Bound {
    pub fn new(ctx: Context, handle: Handle) -> Self {
        Self { ctx, handle }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub async fn execute(&self, sql: &str, args: Args) -> Result<PgQueryResult> {
        self.handle.execute(&self.ctx, sql, args).await
    }

    pub async fn query(&self, sql: &str, args: Args) -> Result<Vec<PgRow>> {
        self.handle.query(&self.ctx, sql, args).await
    }

    pub async fn query_one(&self, sql: &str, args: Args) -> Result<PgRow> {
        self.handle.query_one(&self.ctx, sql, args).await
    }
}

/// The current handle of `ctx`
pub fn get(ctx: &Context) -> Result<Handle> {
    ctx.handle()
}

/// The current handle of `ctx`, bound to `ctx`
pub fn bind(ctx: &Context) -> Result<Bound> {
    Ok(Bound::new(ctx.clone(), ctx.handle()?))
}
