//! Context-scoped Postgres handles and managed transactions
//!
//! Application code never threads a pool through its call graph. The pool is
//! opened once and installed in a [`Context`]; anything holding the context
//! asks it for the current handle. [`Tx::run`] swaps a transaction in as the
//! current handle for the duration of a unit of work, so the same query code
//! runs standalone or transactionally:
//!
//! ```ignore
//! use pgctx::{Config, Context, IsolationLevel, Tx, args};
//!
//! async fn increment(ctx: &Context, id: i64) -> pgctx::Result<()> {
//!     pgctx::bind(ctx)?
//!         .execute("UPDATE counters SET value = value + 1 WHERE id = $1", args![id])
//!         .await?;
//!     Ok(())
//! }
//!
//! let ctx = Context::background().with_config(Config::from_env()?);
//! let (installer, releaser) = pgctx::open(&ctx).await?;
//! let ctx = installer.install(&ctx);
//!
//! increment(&ctx, 1).await?; // autocommit on the pool
//!
//! Tx::new(&ctx)
//!     .set_isolation_level(IsolationLevel::Serializable)
//!     .run(|ctx| async move {
//!         increment(&ctx, 1).await?; // inside the transaction
//!         increment(&ctx, 2).await
//!     })
//!     .await?;
//!
//! releaser.release().await;
//! ```

pub mod codes;
pub mod config;
pub mod connection;
pub mod context;
pub mod driver;
pub mod error;
#[cfg(feature = "testing")]
pub mod testing;
pub mod tx;

pub use config::Config;
pub use connection::{Installer, Releaser, open};
pub use context::Context;
pub use driver::{Args, Bound, Driver, Handle, PoolHandle, TxHandle, bind, get};
pub use error::{Error, LogErr, Result, Retryable};
pub use tx::{Backoff, IsolationLevel, MAX_ATTEMPTS, Tx};
