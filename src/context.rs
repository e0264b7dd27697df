//! Request-scoped execution context
//!
//! A [`Context`] is an immutable chain of scopes. Every `with_*` call returns a
//! new context whose innermost scope holds one binding and points at the scope
//! it was derived from; the receiver is left untouched. Lookups walk outward
//! and return the nearest binding, so an inner scope can override the database
//! handle or configuration without affecting anyone holding the outer context.
//!
//! Besides the handle and configuration the chain also carries cancellation and
//! deadlines. [`Context::guard`] races a future against both, which is how the
//! driver and the transaction engine make blocking points abort when the
//! caller gives up.
//!
//! ```ignore
//! let ctx = Context::background().with_config(Config::from_env()?);
//! let (installer, releaser) = pgctx::open(&ctx).await?;
//! let ctx = installer.install(&ctx);
//!
//! pgctx::bind(&ctx)?.execute("SELECT 1", Args::new()).await?;
//! releaser.release().await;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::driver::Handle;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Context {
    scope: Arc<Scope>,
}

struct Scope {
    parent: Option<Arc<Scope>>,
    binding: Binding,
}

enum Binding {
    Root,
    Handle(Handle),
    Config(Arc<Config>),
    Cancel(CancellationToken),
    Deadline(Instant),
}

impl Context {
    /// Empty root context: no handle, no configuration, never cancelled
    pub fn background() -> Self {
        Self {
            scope: Arc::new(Scope {
                parent: None,
                binding: Binding::Root,
            }),
        }
    }

    fn extend(&self, binding: Binding) -> Self {
        Self {
            scope: Arc::new(Scope {
                parent: Some(Arc::clone(&self.scope)),
                binding,
            }),
        }
    }

    fn scopes(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self.scope.as_ref()), |&scope| scope.parent.as_deref())
    }

    pub fn with_handle(&self, handle: Handle) -> Self {
        self.extend(Binding::Handle(handle))
    }

    pub fn with_config(&self, config: Config) -> Self {
        self.extend(Binding::Config(Arc::new(config)))
    }

    /// Derive a cancellable context. The returned token is a child of any
    /// token already in scope, so cancelling an outer scope cancels this one.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = match self.cancel_token() {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        (self.extend(Binding::Cancel(token.clone())), token)
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A deadline later than one already in scope has no effect.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.extend(Binding::Deadline(deadline))
    }

    /// The nearest installed database handle
    pub fn handle(&self) -> Result<Handle> {
        self.scopes()
            .find_map(|scope| match &scope.binding {
                Binding::Handle(handle) => Some(handle.clone()),
                _ => None,
            })
            .ok_or(Error::NotInstalled("database handle"))
    }

    /// The nearest installed configuration
    pub fn config(&self) -> Result<Arc<Config>> {
        self.scopes()
            .find_map(|scope| match &scope.binding {
                Binding::Config(config) => Some(Arc::clone(config)),
                _ => None,
            })
            .ok_or(Error::NotInstalled("configuration"))
    }

    fn cancel_token(&self) -> Option<CancellationToken> {
        self.scopes().find_map(|scope| match &scope.binding {
            Binding::Cancel(token) => Some(token.clone()),
            _ => None,
        })
    }

    /// Earliest deadline anywhere in the chain
    pub fn deadline(&self) -> Option<Instant> {
        self.scopes()
            .filter_map(|scope| match scope.binding {
                Binding::Deadline(at) => Some(at),
                _ => None,
            })
            .min()
    }

    /// `Some` once the context is cancelled or past its deadline
    pub fn err(&self) -> Option<Error> {
        if self.cancel_token().is_some_and(|token| token.is_cancelled()) {
            return Some(Error::Cancelled);
        }
        if self.deadline().is_some_and(|at| at <= Instant::now()) {
            return Some(Error::DeadlineExceeded);
        }
        None
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Run `fut` unless the context is cancelled or its deadline passes first,
    /// in which case `fut` is dropped mid-flight.
    pub async fn guard<T, E, F>(&self, fut: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        if let Some(err) = self.err() {
            return Err(err.into());
        }

        let token = self.cancel_token();
        let deadline = self.deadline();

        tokio::select! {
            res = fut => res,
            _ = cancelled(token) => Err(Error::Cancelled.into()),
            _ = expired(deadline) => Err(Error::DeadlineExceeded.into()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("depth", &self.scopes().count())
            .field("handle", &self.handle().ok())
            .field("deadline", &self.deadline())
            .finish()
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
