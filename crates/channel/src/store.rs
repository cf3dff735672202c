//! Narrow interfaces to the durable stores the distributor depends on
//!
//! Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
//! `Arc<dyn ChannelStore>` etc.

use std::future::Future;
use std::pin::Pin;

use crate::account::{SubjectKey, TokenRecord, UserRecord};
use crate::channel::{Channel, ChannelStatus};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("state parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Channel configuration store. Owned by the admin layer; the distributor
/// reads it and flips statuses through it.
pub trait ChannelStore: Send + Sync {
    fn list_channels(&self) -> StoreFuture<'_, Vec<Channel>>;

    fn get_channel(&self, id: i64) -> StoreFuture<'_, Option<Channel>>;

    fn update_status(&self, id: i64, status: ChannelStatus) -> StoreFuture<'_, ()>;
}

/// Durable quota balances for users and tokens.
pub trait QuotaStore: Send + Sync {
    /// Current durable balance of a subject.
    fn balance(&self, subject: SubjectKey) -> StoreFuture<'_, i64>;

    /// Apply a signed delta to a subject's balance. Negative values consume
    /// quota, positive values refund it.
    fn apply_delta(&self, subject: SubjectKey, delta: i64) -> StoreFuture<'_, ()>;
}

/// Token authentication lookup used by the relay surface.
pub trait TokenLookup: Send + Sync {
    /// Resolve a token key to the token and its owning user.
    fn token_by_key<'a>(
        &'a self,
        key: &'a str,
    ) -> StoreFuture<'a, Option<(TokenRecord, UserRecord)>>;
}
