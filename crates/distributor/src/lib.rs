//! Channel distributor for the AI gateway
//!
//! Decides, per request, which upstream channel and credential serve it,
//! and keeps the bookkeeping that decision depends on: per-group rate
//! limits, quota reservations against user and token balances, and channel
//! health (auto-ban with cooldown and single-request probing).
//!
//! Request lifecycle:
//! 1. The relay authenticates the token and builds a [`ResolveRequest`]
//! 2. [`Distributor::resolve`] returns a [`RoutingContext`] with the chosen
//!    channel, key, upstream model, reservation and retry budget
//! 3. The relay calls the vendor and reports an [`channel::Outcome`] through
//!    [`Distributor::report_result`]
//! 4. On a retriable failure within budget, the relay resolves again with
//!    [`ResolveRequest::retry`], which excludes the failed channel
//! 5. A background task ([`spawn_sync_task`]) reloads channels and writes
//!    committed quota back to the store

pub mod ability;
pub mod auto_ban;
pub mod config;
pub mod context;
pub mod distributor;
pub mod error;
pub mod multi_key;
pub mod quota;
pub mod rate_limit;
pub mod registry;
pub mod sync;

pub use ability::{AbilityIndex, normalize_model_name};
pub use auto_ban::{Availability, AutoBanTracker, HealthState, ManualOverride, Transition};
pub use config::{
    AUTO_GROUP, AutoBanConfig, DegradedPolicy, DistributorConfig, GroupSettings, GroupTable,
    RateLimitConfig,
};
pub use context::{ChannelRoute, ResolveRequest, RoutingContext, TokenScope, UserScope};
pub use distributor::{Distributor, DistributorSettings};
pub use error::{Error, ErrorKind, Result};
pub use multi_key::{KeyResolver, PickedKey};
pub use quota::{QuotaLeg, QuotaLedger, ReservationGuard, ReservationId, SyncReport};
pub use rate_limit::{Admission, AdmissionGuard, RateLimiter};
pub use registry::ChannelRegistry;
pub use sync::{spawn_sync_task, sync_cycle};
