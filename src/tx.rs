//! Managed transactions
//!
//! [`Tx`] runs a unit of work inside a database transaction:
//!
//! ```ignore
//! pgctx::Tx::new(&ctx)
//!     .set_isolation_level(IsolationLevel::Serializable)
//!     .run(|ctx| async move {
//!         let db = pgctx::bind(&ctx)?;
//!         let row = db.query_one("SELECT counter FROM counters WHERE id = $1", args![id]).await?;
//!         let counter: i64 = row.try_get("counter")?;
//!         db.execute("UPDATE counters SET counter = $1 WHERE id = $2", args![counter + 1, id]).await?;
//!         Ok::<_, pgctx::Error>(())
//!     })
//!     .await?;
//! ```
//!
//! The work function receives a context whose current handle is the
//! transaction, so anything it calls that asks the context for a handle joins
//! the transaction. A `Tx` built from such a context is reentrant: it runs its
//! work directly under the enclosing transaction, which alone commits or rolls
//! back. Serialization failures (SQLSTATE 40001) roll back and retry the whole
//! unit of work after a jittered pause, up to [`MAX_ATTEMPTS`] times.

use std::future::Future;
use std::time::Duration;

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlx::Executor;

use crate::context::Context;
use crate::driver::{Handle, PoolHandle, TxHandle};
use crate::error::{Error, LogErr, Result, Retryable, WithOp};

/// Attempts per [`Tx::run`], the first one included
pub const MAX_ATTEMPTS: u32 = 10;

/// Lower bound of the pause between attempts
pub const BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Exclusive upper bound of the pause between attempts
pub const BACKOFF_MAX: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever `default_transaction_isolation` says on the server
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> Option<&'static str> {
        match self {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// `SET TRANSACTION` statement for the requested mode, `None` when the server
/// defaults already apply
fn transaction_mode(isolation: IsolationLevel, read_only: bool) -> Option<String> {
    let mut modes = Vec::with_capacity(2);
    if let Some(level) = isolation.as_sql() {
        modes.push(format!("ISOLATION LEVEL {}", level));
    }
    if read_only {
        modes.push("READ ONLY".to_string());
    }
    if modes.is_empty() {
        return None;
    }
    Some(format!("SET TRANSACTION {}", modes.join(", ")))
}

async fn begin(
    ctx: &Context,
    pool: &PoolHandle,
    isolation: IsolationLevel,
    read_only: bool,
) -> Result<TxHandle> {
    ctx.guard(async {
        let mut tx = pool.pool().begin().await.op("begin")?;
        if let Some(mode) = transaction_mode(isolation, read_only) {
            (&mut *tx).execute(mode.as_str()).await.op("set transaction")?;
        }
        Ok(TxHandle::new(tx, pool.simple_protocol()))
    })
    .await
}

/// Jittered pause between attempts, uniform in [`BACKOFF_MIN`, `BACKOFF_MAX`)
pub struct Backoff {
    rng: StdRng,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic sequence, for tests
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let min = BACKOFF_MIN.as_micros() as u64;
        let max = BACKOFF_MAX.as_micros() as u64;
        Duration::from_micros(self.rng.random_range(min..max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of work to run in a transaction
///
/// Captures the context at construction. Defaults: server isolation level,
/// read-write, reentrant.
pub struct Tx {
    ctx: Context,
    isolation_level: IsolationLevel,
    read_only: bool,
    allow_reentrant: bool,
    backoff: Backoff,
}

impl Tx {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            isolation_level: IsolationLevel::Default,
            read_only: false,
            allow_reentrant: true,
            backoff: Backoff::new(),
        }
    }

    pub fn set_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn set_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// With `false`, running inside another transaction fails with
    /// [`Error::NestedTransaction`] instead of joining it.
    pub fn set_allow_reentrant(mut self, allow_reentrant: bool) -> Self {
        self.allow_reentrant = allow_reentrant;
        self
    }

    pub fn set_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn allow_reentrant(&self) -> bool {
        self.allow_reentrant
    }

    /// Run `work` and commit, retrying on serialization failures.
    ///
    /// Returns the value of the attempt that committed, or the first error that
    /// is not a serialization failure, or the last serialization failure once
    /// the attempts are used up. When the context already carries a
    /// transaction, `work` runs once under it and its result is returned as is.
    pub async fn run<T, E, F, Fut>(mut self, mut work: F) -> std::result::Result<T, E>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error> + Retryable,
    {
        let pool = match self.ctx.handle()? {
            Handle::Tx(_) if !self.allow_reentrant => {
                return Err(Error::NestedTransaction.into());
            }
            Handle::Tx(_) => {
                debug!("joining enclosing transaction");
                return work(self.ctx.clone()).await;
            }
            Handle::Pool(pool) => pool,
        };

        for attempt in 1..=MAX_ATTEMPTS {
            let err = match self.attempt(&pool, &mut work).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt < MAX_ATTEMPTS && err.is_serialization_failure() {
                let delay = self.backoff.next_delay();
                info!(
                    "serialization failure on attempt {}/{}, retrying in {:?}",
                    attempt, MAX_ATTEMPTS, delay
                );
                self.ctx
                    .guard(async {
                        tokio::time::sleep(delay).await;
                        Ok::<_, Error>(())
                    })
                    .await?;
                continue;
            }

            return Err(err);
        }

        unreachable!("every attempt either returns or retries, and the last one cannot retry")
    }

    async fn attempt<T, E, F, Fut>(&self, pool: &PoolHandle, work: &mut F) -> std::result::Result<T, E>
    where
        F: FnMut(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let tx = begin(&self.ctx, pool, self.isolation_level, self.read_only).await?;
        debug!(
            "transaction started (isolation {:?}, read only {})",
            self.isolation_level, self.read_only
        );

        match work(self.ctx.with_handle(Handle::Tx(tx.clone()))).await {
            Ok(value) => {
                tx.commit(&self.ctx).await?;
                debug!("transaction committed");
                Ok(value)
            }
            Err(err) => {
                tx.rollback(&self.ctx)
                    .await
                    .log_warn("rollback after failed work");
                debug!("transaction rolled back");
                Err(err)
            }
        }
    }
}
