//! Error type and classification helpers
//!
//! Every failure surfaced by the crate is a [`Error`]. Database failures keep the
//! underlying `sqlx::Error` as their source, so the SQLSTATE of the innermost
//! database error stays inspectable through [`Error::code`] no matter how many
//! layers of context were added on the way up.

use std::error::Error as StdError;
use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

use crate::codes;

#[derive(Error, Debug)]
pub enum Error {
    /// The context carries no value of the named kind. The caller never set up
    /// its context; this is not meant to be handled by normal control flow.
    #[error("no {0} installed in context")]
    NotInstalled(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("connect: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("connect: liveness check did not complete within {0:?}")]
    ConnectTimeout(Duration),

    #[error("unexpectedly nested transaction")]
    NestedTransaction,

    #[error("transaction already committed or rolled back")]
    TransactionFinished,

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("encode argument ${position}: {source}")]
    Encode {
        position: usize,
        #[source]
        source: sqlx::error::BoxDynError,
    },

    #[error("{op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// SQLSTATE of the innermost database error, if any
    pub fn code(&self) -> Option<String> {
        sql_state(self)
    }

    /// True for the "nothing installed in context" programming error
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::NotInstalled(_))
    }

    pub fn is_nested_transaction(&self) -> bool {
        matches!(self, Error::NestedTransaction)
    }
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Error::Database {
            op: "database",
            source,
        }
    }
}

/// Walks the source chain and returns the SQLSTATE of the innermost
/// `sqlx::Error::Database` found.
pub fn sql_state(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut state = None;
    let mut cursor = Some(err);
    while let Some(current) = cursor {
        if let Some(code) = database_code(current) {
            state = Some(code);
        }
        cursor = current.source();
    }
    state
}

fn database_code(err: &(dyn StdError + 'static)) -> Option<String> {
    match err.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(db)) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Classification used by the transaction retry loop.
///
/// Implemented for the crate's own [`Error`], for `sqlx::Error` and for
/// `anyhow::Error`, so work functions can fail with whichever of those they
/// already use.
pub trait Retryable {
    fn sql_state(&self) -> Option<String>;

    fn is_serialization_failure(&self) -> bool {
        self.sql_state().as_deref() == Some(codes::SERIALIZATION_FAILURE)
    }
}

impl Retryable for Error {
    fn sql_state(&self) -> Option<String> {
        sql_state(self)
    }
}

impl Retryable for sqlx::Error {
    fn sql_state(&self) -> Option<String> {
        sql_state(self)
    }
}

impl Retryable for anyhow::Error {
    fn sql_state(&self) -> Option<String> {
        self.chain().filter_map(database_code).last()
    }
}

/// Extension trait for logging errors that are deliberately not propagated
pub trait LogErr<T> {
    /// Log the error with context at warn level and discard it
    fn log_warn(self, context: &str) -> Option<T>;
}

impl<T, E: Display> LogErr<T> for std::result::Result<T, E> {
    fn log_warn(self, context: &str) -> Option<T> {
        self.map_err(|e| log::warn!("{}: {}", context, e)).ok()
    }
}

/// Tags a driver error with the operation that produced it
pub(crate) trait WithOp<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> WithOp<T> for std::result::Result<T, sqlx::Error> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Database { op, source })
    }
}
