//! Channel resolution and result reporting
//!
//! `resolve` turns an authenticated request into a [`RoutingContext`]:
//!
//! 1. Validate the request, the token's client address list, group access
//!    and (unless the token pins a channel) token model limits
//! 2. Collect candidates: the pinned channel, or the ability index entry for
//!    the group (walking `auto_groups` for `auto`), minus excluded channels
//! 3. Load the request's quota balances (the only await)
//! 4. Admit against the group's rate limit (first attempts only)
//! 5. Walk candidates by priority tier and weight: skip banned channels and
//!    channels without a usable key, then reserve quota
//!
//! Steps 4 and 5 hold guards that undo the rate-limit increment and quota
//! holds unless a context is returned.
//!
//! `report_result` settles the reservation and feeds auto-ban and the
//! success-count limit. It never fails; store errors are logged.

use std::sync::Arc;

use arc_swap::ArcSwap;
use channel::{Channel, ChannelStatus, ChannelStore, Outcome, QuotaStore, SubjectKey};
use rand::RngExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ability::AbilityIndex;
use crate::auto_ban::{Availability, AutoBanTracker, HealthState, ManualOverride, Transition};
use crate::config::{AUTO_GROUP, AutoBanConfig, DistributorConfig, GroupTable, RateLimitConfig};
use crate::context::{ChannelRoute, ResolveRequest, RoutingContext};
use crate::error::{Error, Result};
use crate::multi_key::KeyResolver;
use crate::quota::{QuotaLeg, QuotaLedger};
use crate::rate_limit::{Admission, RateLimiter};
use crate::registry::ChannelRegistry;

/// Everything needed to build a [`Distributor`].
#[derive(Debug, Clone, Default)]
pub struct DistributorSettings {
    pub distributor: DistributorConfig,
    pub auto_ban: AutoBanConfig,
    pub rate_limit: RateLimitConfig,
    pub groups: GroupTable,
}

/// Candidates chosen for one request, before the weighted walk.
struct Selection {
    group: String,
    auto_group: Option<String>,
    candidates: Vec<Arc<Channel>>,
    /// Token-pinned channel; bypasses health filtering
    pinned: bool,
}

pub struct Distributor {
    config: DistributorConfig,
    registry: ChannelRegistry,
    keys: KeyResolver,
    limiter: RateLimiter,
    ledger: QuotaLedger,
    health: AutoBanTracker,
    groups: ArcSwap<GroupTable>,
    /// `[rate_limit]` as configured, before group-level limits are folded in
    rate_limit_base: RateLimitConfig,
}

impl Distributor {
    /// Create a distributor. The ability index starts empty; call
    /// [`reload`](Self::reload) before serving.
    pub fn new(
        settings: DistributorSettings,
        channel_store: Arc<dyn ChannelStore>,
        quota_store: Arc<dyn QuotaStore>,
    ) -> Self {
        let DistributorSettings {
            distributor: config,
            auto_ban,
            rate_limit,
            groups,
        } = settings;
        Self {
            registry: ChannelRegistry::new(channel_store, config.store_timeout()),
            keys: KeyResolver::new(),
            limiter: RateLimiter::new(rate_limit.clone().with_group_overrides(&groups)),
            rate_limit_base: rate_limit,
            ledger: QuotaLedger::new(quota_store, config.store_timeout(), config.cache_ttl()),
            health: AutoBanTracker::new(auto_ban),
            groups: ArcSwap::from_pointee(groups),
            config,
        }
    }

    /// Rebuild the ability index from the channel store. Channels stored as
    /// auto-disabled that this process has not seen yet start out banned.
    pub async fn reload(&self) -> Result<usize> {
        let count = self.registry.reload().await?;
        let index = self.registry.snapshot();

        let seeded = index
            .channels()
            .filter(|c| c.status == ChannelStatus::AutoDisabled)
            .filter(|c| self.health.seed_banned(c.id))
            .count();
        if seeded > 0 {
            info!(seeded, "auto-disabled channels restored as banned");
        }
        self.health.retain(|id| index.channel(id).is_some());
        self.keys.retain(|id| index.channel(id).is_some());
        Ok(count)
    }

    /// Choose a channel and credential for a request and reserve its quota.
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<RoutingContext> {
        if !request.token.allows_ip(request.client_ip) {
            return Err(Error::IpNotAllowed {
                ip: request
                    .client_ip
                    .map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
            });
        }
        let model = request.model.trim();
        if model.is_empty() {
            return Err(Error::InvalidRequest("model name is required".into()));
        }
        if request.estimated_cost < 0 {
            return Err(Error::InvalidRequest(format!(
                "negative cost estimate {}",
                request.estimated_cost
            )));
        }

        let selection = {
            let groups = self.groups.load();
            let requested = request.requested_group();
            if !groups.can_use(&request.user.group, requested) {
                return Err(Error::GroupAccessDenied {
                    group: requested.to_string(),
                });
            }
            if request.token.pinned_channel.is_none() && !request.token.allows_model(model) {
                return Err(Error::TokenModelForbidden {
                    model: model.to_string(),
                });
            }
            select_candidates(&self.registry.snapshot(), &groups, request, model)?
        };

        let legs = [
            QuotaLeg::limited(SubjectKey::User(request.user.id)),
            QuotaLeg {
                subject: SubjectKey::Token(request.token.id),
                unlimited: request.token.unlimited,
            },
        ];
        for leg in &legs {
            if leg.unlimited {
                self.ledger.track(leg.subject);
            } else {
                self.ledger.ensure_loaded(leg.subject).await?;
            }
        }

        // No awaits past this point: admission and reservations are taken
        // and handed over in one synchronous stretch.
        self.walk(request, model, selection, &legs)
    }

    fn walk(
        &self,
        request: &ResolveRequest,
        model: &str,
        selection: Selection,
        legs: &[QuotaLeg],
    ) -> Result<RoutingContext> {
        let admission = (request.attempt == 0).then(|| self.limiter.admit(&selection.group));
        let decision = admission
            .as_ref()
            .map_or(Admission::Allowed, |a| a.decision());
        if decision == Admission::RateLimited {
            return Err(Error::RateLimited {
                group: selection.group,
            });
        }
        let degraded = decision == Admission::Degraded;

        let ordered = order_candidates(
            &selection.candidates,
            self.config.weight_smoothing,
            &mut rand::rng(),
        );

        for channel in &ordered {
            let availability = if selection.pinned {
                Availability::Available
            } else {
                self.health.check(channel.id)
            };
            if availability == Availability::Unavailable {
                debug!(channel_id = channel.id, "channel banned, skipping");
                continue;
            }

            let Some(key) = self.keys.pick_key(channel) else {
                warn!(channel_id = channel.id, "channel has no usable key, skipping");
                if availability == Availability::Probe {
                    self.health.abandon_probe(channel.id);
                }
                continue;
            };

            let reservation = match self.ledger.reserve(legs, request.estimated_cost) {
                Ok(reservation) => reservation,
                Err(e) => {
                    if availability == Availability::Probe {
                        self.health.abandon_probe(channel.id);
                    }
                    return Err(e);
                }
            };

            let retry_budget = if degraded {
                0
            } else {
                let alternatives = u32::try_from(ordered.len() - 1).unwrap_or(u32::MAX);
                self.config.max_retries.min(alternatives)
            };

            let context = RoutingContext {
                channel: ChannelRoute::new(channel, key, model),
                token: request.token.clone(),
                user: request.user.clone(),
                group: selection.group.clone(),
                auto_group: selection.auto_group.clone(),
                model: model.to_string(),
                reservation: reservation.keep(),
                estimated_cost: request.estimated_cost,
                degraded,
                retry_budget,
                attempt: request.attempt,
                probe: availability == Availability::Probe,
                resolved_at: Instant::now(),
            };
            if let Some(admission) = admission {
                admission.keep();
            }
            debug!(
                channel_id = context.channel.id,
                group = %context.group,
                model,
                attempt = request.attempt,
                probe = context.probe,
                "channel resolved"
            );
            return Ok(context);
        }

        Err(Error::UpstreamSaturated {
            group: selection.group,
            model: model.to_string(),
            tried: ordered.len(),
        })
    }

    /// Feed the outcome of an upstream call back into quota, rate limiting
    /// and auto-ban. In-memory bookkeeping completes before any store write.
    pub async fn report_result(&self, context: &RoutingContext, outcome: Outcome) {
        let channel_id = context.channel.id;
        let transition = match outcome {
            Outcome::Success { consumed } => {
                let transition = self.health.record_success(channel_id, context.probe);
                self.limiter.record_success(&context.group);
                self.settle(context, consumed);
                transition
            }
            Outcome::RetriableFailure => {
                let transition = self
                    .health
                    .record_failure(channel_id, context.channel.auto_ban, context.probe);
                if !self.ledger.release(context.reservation) {
                    warn!(reservation = %context.reservation, "reservation already settled");
                }
                transition
            }
            Outcome::NonRetriableFailure { consumed } => {
                if context.probe {
                    self.health.abandon_probe(channel_id);
                }
                self.settle(context, consumed);
                None
            }
        };
        debug!(channel_id, outcome = outcome.label(), "result reported");

        if let Some(transition) = transition {
            metrics::counter!(
                "distributor_channel_transitions_total",
                "transition" => transition.label()
            )
            .increment(1);
            let status = match transition {
                Transition::Banned => ChannelStatus::AutoDisabled,
                Transition::Recovered => ChannelStatus::Enabled,
                Transition::ProbeFailed => return,
            };
            if let Err(e) = self.registry.set_status(channel_id, status).await {
                warn!(channel_id, status = status.label(), error = %e, "failed to persist channel status");
            }
        }
    }

    fn settle(&self, context: &RoutingContext, consumed: i64) {
        match self.ledger.commit(context.reservation, consumed) {
            Some(refund) => debug!(reservation = %context.reservation, consumed, refund, "quota settled"),
            None => warn!(reservation = %context.reservation, "reservation already settled"),
        }
    }

    /// Force a channel healthy or banned and persist the matching status.
    pub async fn override_health(&self, channel_id: i64, state: ManualOverride) -> Result<()> {
        if self.registry.snapshot().channel(channel_id).is_none() {
            return Err(Error::ChannelUnavailable {
                id: channel_id,
                reason: "not found",
            });
        }
        self.health.override_state(channel_id, state);
        let status = match state {
            ManualOverride::Healthy => ChannelStatus::Enabled,
            ManualOverride::Banned => ChannelStatus::ManuallyDisabled,
        };
        self.registry.set_status(channel_id, status).await
    }

    /// Current health of one channel.
    pub fn channel_health(&self, channel_id: i64) -> HealthState {
        self.health.state(channel_id)
    }

    /// Swap the group table. The limiter's per-group map is rebuilt from the
    /// configured `[rate_limit]` section plus the new table's group limits,
    /// so a map set through `replace_groups_from_json` is replaced too.
    pub fn replace_groups(&self, groups: GroupTable) {
        let limits = self.rate_limit_base.clone().with_group_overrides(&groups);
        self.limiter.replace_config(limits);
        self.groups.store(Arc::new(groups));
        info!("group table replaced");
    }

    pub fn groups(&self) -> Arc<GroupTable> {
        self.groups.load_full()
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn tracker(&self) -> &AutoBanTracker {
        &self.health
    }

    /// Health summary for the health endpoint.
    ///
    /// Status mapping over channels not manually disabled: all routable →
    /// healthy, some routable → degraded, none → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let index = self.registry.snapshot();
        let mut channels: Vec<&Arc<Channel>> = index.channels().collect();
        channels.sort_by_key(|c| c.id);

        let mut entries = Vec::with_capacity(channels.len());
        let mut active = 0usize;
        let mut routable = 0usize;
        let mut banned = 0usize;
        let mut disabled = 0usize;

        for channel in channels {
            let state = self.health.state(channel.id);
            if channel.status == ChannelStatus::ManuallyDisabled {
                disabled += 1;
            } else {
                active += 1;
                if state.is_routable() {
                    routable += 1;
                } else {
                    banned += 1;
                }
            }

            let mut entry = serde_json::json!({
                "id": channel.id,
                "name": channel.name,
                "type": channel.channel_type.name(),
                "status": channel.status.label(),
                "health": state.label(),
                "failures": self.health.failures(channel.id),
                "priority": channel.priority,
                "weight": channel.weight,
                "keys": channel.keys.len(),
            });
            if let HealthState::Banned { remaining } = state {
                entry["cooldown_remaining_secs"] = remaining.as_secs().into();
            }
            entries.push(entry);
        }

        let status = if routable == active && active > 0 {
            "healthy"
        } else if routable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "channels_total": index.len(),
            "channels_routable": routable,
            "channels_banned": banned,
            "channels_disabled": disabled,
            "reservations_outstanding": self.ledger.outstanding(),
            "channels": entries,
        })
    }
}

fn select_candidates(
    index: &AbilityIndex,
    groups: &GroupTable,
    request: &ResolveRequest,
    model: &str,
) -> Result<Selection> {
    let requested = request.requested_group();

    if let Some(id) = request.token.pinned_channel {
        let channel = index.channel(id).ok_or(Error::ChannelUnavailable {
            id,
            reason: "not found",
        })?;
        if channel.status != ChannelStatus::Enabled {
            return Err(Error::ChannelUnavailable {
                id,
                reason: "disabled",
            });
        }
        if request.exclude.contains(&id) {
            return Err(Error::UpstreamSaturated {
                group: requested.to_string(),
                model: model.to_string(),
                tried: 1,
            });
        }
        return Ok(Selection {
            group: requested.to_string(),
            auto_group: None,
            candidates: vec![Arc::clone(channel)],
            pinned: true,
        });
    }

    let is_auto = requested == AUTO_GROUP;
    let walk: Vec<&str> = if is_auto {
        groups
            .auto_groups()
            .iter()
            .map(String::as_str)
            .filter(|g| groups.is_usable(g))
            .collect()
    } else {
        vec![requested]
    };

    let mut only_excluded = false;
    for group in walk {
        let all = index.candidates(group, model);
        if all.is_empty() {
            continue;
        }
        let candidates: Vec<Arc<Channel>> = all
            .iter()
            .filter(|c| !request.exclude.contains(&c.id))
            .cloned()
            .collect();
        if candidates.is_empty() {
            only_excluded = true;
            continue;
        }
        return Ok(Selection {
            group: group.to_string(),
            auto_group: is_auto.then(|| group.to_string()),
            candidates,
            pinned: false,
        });
    }

    if only_excluded {
        Err(Error::UpstreamSaturated {
            group: requested.to_string(),
            model: model.to_string(),
            tried: request.exclude.len(),
        })
    } else {
        Err(Error::NoAvailableChannel {
            group: requested.to_string(),
            model: model.to_string(),
        })
    }
}

/// Order candidates for the walk: priority tiers highest first, and within
/// a tier a weighted draw without replacement. `candidates` must already be
/// sorted by priority descending. A tier whose weights are all zero is
/// drawn uniformly.
pub(crate) fn order_candidates(
    candidates: &[Arc<Channel>],
    smoothing: u32,
    rng: &mut impl RngExt,
) -> Vec<Arc<Channel>> {
    let mut ordered = Vec::with_capacity(candidates.len());

    for tier in candidates.chunk_by(|a, b| a.priority == b.priority) {
        let mut pool: Vec<&Arc<Channel>> = tier.iter().collect();
        while !pool.is_empty() {
            let weight = |c: &Arc<Channel>| u64::from(c.weight) + u64::from(smoothing);
            let total: u64 = pool.iter().map(|&c| weight(c)).sum();

            let picked = if total == 0 {
                rng.random_range(0..pool.len())
            } else {
                let mut point = rng.random_range(0..total);
                pool.iter()
                    .position(|&c| {
                        let w = weight(c);
                        if point < w {
                            true
                        } else {
                            point -= w;
                            false
                        }
                    })
                    .unwrap_or(pool.len() - 1)
            };
            ordered.push(Arc::clone(pool.remove(picked)));
        }
    }
    ordered
}
