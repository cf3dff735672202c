//! Channel health state machine
//!
//! Each channel has a consecutive-failure counter and a phase:
//!
//! - Active → Banned (failures reach the threshold and the channel allows auto-ban)
//! - Banned → Probing (cooldown elapsed; exactly one request is let through)
//! - Probing → Active (the probe succeeded)
//! - Probing → Banned (the probe failed; a new cooldown starts)
//! - any → Pinned (operator forced a ban; never recovers on its own)
//! - any → Active (operator forced healthy)
//!
//! Only the probe's own report moves a channel out of Probing. Reports from
//! requests resolved before the ban land while the channel is restricted and
//! are treated like reports during the cooldown.
//!
//! The hot path reads an atomic flag. The phase lock is taken only for
//! restricted channels and for transitions, and every transition is decided
//! under it, so concurrent reports cannot ban a channel twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::AutoBanConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Banned { until: Instant },
    Probing { deadline: Instant },
    Pinned,
}

#[derive(Debug)]
struct ChannelHealth {
    failures: AtomicU32,
    restricted: AtomicBool,
    phase: Mutex<Phase>,
}

impl ChannelHealth {
    fn new() -> Self {
        Self {
            failures: AtomicU32::new(0),
            restricted: AtomicBool::new(false),
            phase: Mutex::new(Phase::Active),
        }
    }
}

/// Whether a channel may take a request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Available as the single recovery probe
    Probe,
    Unavailable,
}

/// A state change worth persisting or logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Banned,
    Recovered,
    ProbeFailed,
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Banned => "banned",
            Transition::Recovered => "recovered",
            Transition::ProbeFailed => "probe_failed",
        }
    }
}

/// Operator override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualOverride {
    Healthy,
    Banned,
}

/// Externally visible health of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Some recent failures, below the ban threshold
    Degraded { failures: u32 },
    Banned { remaining: Duration },
    Probing,
    /// Banned by an operator
    Pinned,
}

impl HealthState {
    pub fn label(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded { .. } => "degraded",
            HealthState::Banned { .. } => "banned",
            HealthState::Probing => "probing",
            HealthState::Pinned => "pinned",
        }
    }

    pub fn is_routable(&self) -> bool {
        matches!(self, HealthState::Healthy | HealthState::Degraded { .. })
    }
}

pub struct AutoBanTracker {
    config: AutoBanConfig,
    channels: RwLock<HashMap<i64, Arc<ChannelHealth>>>,
}

impl AutoBanTracker {
    pub fn new(config: AutoBanConfig) -> Self {
        Self {
            config,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, id: i64) -> Option<Arc<ChannelHealth>> {
        self.channels.read().get(&id).cloned()
    }

    fn health(&self, id: i64) -> Arc<ChannelHealth> {
        if let Some(health) = self.get(id) {
            return health;
        }
        Arc::clone(
            self.channels
                .write()
                .entry(id)
                .or_insert_with(|| Arc::new(ChannelHealth::new())),
        )
    }

    /// Check a channel before routing to it. A banned channel whose cooldown
    /// has elapsed admits exactly one caller as its probe; a probe that never
    /// reported back is handed to a new caller after the probe timeout.
    pub fn check(&self, id: i64) -> Availability {
        let Some(health) = self.get(id) else {
            return Availability::Available;
        };
        if !health.restricted.load(Ordering::Acquire) {
            return Availability::Available;
        }

        let now = Instant::now();
        let mut phase = health.phase.lock();
        match *phase {
            Phase::Active => Availability::Available,
            Phase::Banned { until } if now >= until => {
                *phase = Phase::Probing {
                    deadline: now + self.config.probe_timeout(),
                };
                info!(channel_id = id, "cooldown elapsed, probing channel");
                Availability::Probe
            }
            Phase::Probing { deadline } if now >= deadline => {
                *phase = Phase::Probing {
                    deadline: now + self.config.probe_timeout(),
                };
                warn!(channel_id = id, "previous probe never reported, probing again");
                Availability::Probe
            }
            _ => Availability::Unavailable,
        }
    }

    pub fn is_available(&self, id: i64) -> bool {
        self.check(id) != Availability::Unavailable
    }

    /// Give back a probe slot that was claimed but not used.
    pub fn abandon_probe(&self, id: i64) {
        let Some(health) = self.get(id) else {
            return;
        };
        let mut phase = health.phase.lock();
        if let Phase::Probing { .. } = *phase {
            *phase = Phase::Banned {
                until: Instant::now(),
            };
        }
    }

    /// Count a success. `probe` says whether the reporting request was the
    /// channel's recovery probe.
    pub fn record_success(&self, id: i64, probe: bool) -> Option<Transition> {
        let health = self.get(id)?;
        if !health.restricted.load(Ordering::Acquire) {
            health.failures.store(0, Ordering::Release);
            return None;
        }

        let mut phase = health.phase.lock();
        match *phase {
            Phase::Probing { .. } if probe => {
                *phase = Phase::Active;
                health.failures.store(0, Ordering::Release);
                health.restricted.store(false, Ordering::Release);
                info!(channel_id = id, "probe succeeded, channel recovered");
                Some(Transition::Recovered)
            }
            Phase::Active => {
                health.failures.store(0, Ordering::Release);
                None
            }
            Phase::Probing { .. } | Phase::Banned { .. } | Phase::Pinned => None,
        }
    }

    /// Count a retriable failure. `allow_ban` is the channel's own auto-ban
    /// switch; failures are counted either way.
    pub fn record_failure(&self, id: i64, allow_ban: bool, probe: bool) -> Option<Transition> {
        if !self.config.enabled {
            return None;
        }
        let health = self.health(id);
        let failures = health.failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        let now = Instant::now();
        let mut phase = health.phase.lock();
        match *phase {
            Phase::Probing { .. } if probe => {
                *phase = Phase::Banned {
                    until: now + self.config.cooldown(),
                };
                warn!(channel_id = id, "probe failed, channel banned again");
                Some(Transition::ProbeFailed)
            }
            Phase::Active if allow_ban && failures >= self.config.failure_threshold => {
                *phase = Phase::Banned {
                    until: now + self.config.cooldown(),
                };
                health.restricted.store(true, Ordering::Release);
                warn!(
                    channel_id = id,
                    failures,
                    cooldown_secs = self.config.cooldown_secs,
                    "channel banned after consecutive failures"
                );
                Some(Transition::Banned)
            }
            _ => None,
        }
    }

    /// Force a channel's state, overriding the automatic machine.
    pub fn override_state(&self, id: i64, state: ManualOverride) {
        let health = self.health(id);
        let mut phase = health.phase.lock();
        match state {
            ManualOverride::Healthy => {
                *phase = Phase::Active;
                health.failures.store(0, Ordering::Release);
                health.restricted.store(false, Ordering::Release);
            }
            ManualOverride::Banned => {
                *phase = Phase::Pinned;
                health.restricted.store(true, Ordering::Release);
            }
        }
        info!(channel_id = id, state = ?state, "channel health overridden");
    }

    /// Mark a channel the store reports as auto-disabled. Only applies to
    /// channels this tracker has not seen yet; a fresh cooldown starts.
    pub fn seed_banned(&self, id: i64) -> bool {
        let mut channels = self.channels.write();
        if channels.contains_key(&id) {
            return false;
        }
        let health = ChannelHealth {
            failures: AtomicU32::new(0),
            restricted: AtomicBool::new(true),
            phase: Mutex::new(Phase::Banned {
                until: Instant::now() + self.config.cooldown(),
            }),
        };
        channels.insert(id, Arc::new(health));
        true
    }

    pub fn state(&self, id: i64) -> HealthState {
        let Some(health) = self.get(id) else {
            return HealthState::Healthy;
        };
        let now = Instant::now();
        let phase = *health.phase.lock();
        match phase {
            Phase::Active => match health.failures.load(Ordering::Acquire) {
                0 => HealthState::Healthy,
                failures => HealthState::Degraded { failures },
            },
            Phase::Banned { until } => HealthState::Banned {
                remaining: until.saturating_duration_since(now),
            },
            Phase::Probing { .. } => HealthState::Probing,
            Phase::Pinned => HealthState::Pinned,
        }
    }

    pub fn failures(&self, id: i64) -> u32 {
        self.get(id)
            .map(|h| h.failures.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Forget channels that no longer exist.
    pub fn retain(&self, keep: impl Fn(i64) -> bool) {
        self.channels.write().retain(|id, _| keep(*id));
    }
}
