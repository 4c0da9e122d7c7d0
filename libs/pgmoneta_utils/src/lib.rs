//! Shared primitives used by every other crate in the workspace: the LSN
//! type, the error taxonomy, and the token-bucket rate limiter.

pub mod error;
pub mod lsn;
pub mod token_bucket;

pub use error::PgmonetaError;
pub use lsn::Lsn;
pub use token_bucket::TokenBucket;

pub type Result<T> = std::result::Result<T, PgmonetaError>;
