//! SQLSTATE codes the crate classifies errors by

/// Concurrent update conflict under serializable isolation; the only retried code
pub const SERIALIZATION_FAILURE: &str = "40001";

/// Deadlock detected by the server (not retried)
pub const DEADLOCK_DETECTED: &str = "40P01";

/// Write attempted inside a `READ ONLY` transaction
pub const READ_ONLY_SQL_TRANSACTION: &str = "25006";

/// Statement the server could not parse
pub const SYNTAX_ERROR: &str = "42601";
