//! Channel data model and external store interfaces
//!
//! A channel is one configured upstream vendor account. This crate owns the
//! closed vendor registry, the channel/group/token/user records the
//! distributor reads, the classification of upstream responses, and the
//! narrow store traits the distributor consumes:
//!
//! - `ChannelStore`: list/get channels, persist status flips
//! - `QuotaStore`: durable balances for users and tokens
//! - `TokenLookup`: token key → token and owning user (gateway auth)
//!
//! `FileStore` implements all three over a single JSON state file.

pub mod account;
pub mod channel;
pub mod file_store;
pub mod group;
pub mod outcome;
pub mod store;
pub mod vendor;

pub use account::{SubjectKey, TokenRecord, UserRecord, UserStatus};
pub use channel::{Channel, ChannelStatus, MultiKeyMode};
pub use file_store::FileStore;
pub use group::{Group, GroupRateLimit};
pub use outcome::{FailureClass, Outcome, classify_response, classify_status};
pub use store::{ChannelStore, QuotaStore, StoreError, StoreFuture, TokenLookup};
pub use vendor::{Capability, ChannelType, VendorInfo};
