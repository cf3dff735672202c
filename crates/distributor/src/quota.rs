//! Quota ledger: cached balances with reserve/commit/release
//!
//! Balances are cached per [`SubjectKey`]. A reservation holds an estimate
//! against every non-unlimited subject of a request; the hold is later
//! committed at the actual cost or released in full. Committed amounts stay
//! in memory until [`QuotaLedger::sync`] writes them to the store.
//!
//! Only loading and syncing touch the store. Reserving, committing and
//! releasing are synchronous and never wait on I/O.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use channel::{QuotaStore, StoreFuture, SubjectKey};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque handle to an outstanding reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(Uuid);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One subject a reservation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLeg {
    pub subject: SubjectKey,
    /// Unlimited subjects are never checked or held against
    pub unlimited: bool,
}

impl QuotaLeg {
    pub fn limited(subject: SubjectKey) -> Self {
        Self {
            subject,
            unlimited: false,
        }
    }
}

#[derive(Debug)]
struct Balance {
    /// Last balance read from the store
    durable: i64,
    /// Outstanding reservations
    held: i64,
    /// Committed consumption not yet written to the store
    pending: i64,
    loaded: bool,
    touched: Instant,
}

impl Balance {
    fn placeholder(now: Instant) -> Self {
        Self {
            durable: 0,
            held: 0,
            pending: 0,
            loaded: false,
            touched: now,
        }
    }

    fn available(&self) -> i64 {
        self.durable - self.held - self.pending
    }

    fn is_idle(&self) -> bool {
        self.held == 0 && self.pending == 0
    }
}

#[derive(Debug)]
struct Reservation {
    /// (subject, whether the amount is held against it)
    legs: Vec<(SubjectKey, bool)>,
    amount: i64,
    created: Instant,
}

/// Counts from one [`QuotaLedger::sync`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub persisted: usize,
    pub refreshed: usize,
    pub evicted: usize,
    pub failures: usize,
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    balances: RwLock<HashMap<SubjectKey, Arc<Mutex<Balance>>>>,
    reservations: Mutex<HashMap<ReservationId, Reservation>>,
    store_timeout: Duration,
    idle_ttl: Duration,
    sync_lock: tokio::sync::Mutex<()>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, store_timeout: Duration, idle_ttl: Duration) -> Self {
        Self {
            store,
            balances: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            store_timeout,
            idle_ttl,
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn call<T>(&self, what: &str, fut: StoreFuture<'_, T>) -> Result<T> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| Error::StoreUnavailable(format!("{what} timed out")))?
            .map_err(Error::from)
    }

    fn entry(&self, subject: SubjectKey) -> Option<Arc<Mutex<Balance>>> {
        self.balances.read().get(&subject).cloned()
    }

    fn entry_or_track(&self, subject: SubjectKey) -> Arc<Mutex<Balance>> {
        if let Some(entry) = self.entry(subject) {
            return entry;
        }
        Arc::clone(
            self.balances
                .write()
                .entry(subject)
                .or_insert_with(|| Arc::new(Mutex::new(Balance::placeholder(Instant::now())))),
        )
    }

    /// Make sure a subject's balance is cached, reading it from the store if
    /// needed.
    pub async fn ensure_loaded(&self, subject: SubjectKey) -> Result<()> {
        if let Some(entry) = self.entry(subject) {
            let mut balance = entry.lock();
            if balance.loaded {
                balance.touched = Instant::now();
                return Ok(());
            }
        }

        let durable = self
            .call("reading quota balance", self.store.balance(subject))
            .await?;

        let entry = self.entry_or_track(subject);
        let mut balance = entry.lock();
        if !balance.loaded {
            balance.durable = durable;
            balance.loaded = true;
            debug!(subject = %subject, durable, "quota balance loaded");
        }
        balance.touched = Instant::now();
        Ok(())
    }

    /// Start tracking a subject without reading its balance. Used for
    /// unlimited subjects, whose consumption is still recorded.
    pub fn track(&self, subject: SubjectKey) {
        self.entry_or_track(subject).lock().touched = Instant::now();
    }

    /// Hold `amount` against every limited leg, or against none.
    ///
    /// Fails with `QuotaInsufficient` if any limited leg cannot cover the
    /// amount; holds already placed on earlier legs are undone first.
    pub fn reserve(&self, legs: &[QuotaLeg], amount: i64) -> Result<ReservationGuard<'_>> {
        if amount < 0 {
            return Err(Error::InvalidRequest(format!(
                "negative quota estimate {amount}"
            )));
        }

        let mut held: Vec<Arc<Mutex<Balance>>> = Vec::new();
        let undo = |held: &[Arc<Mutex<Balance>>]| {
            for entry in held {
                entry.lock().held -= amount;
            }
        };

        for leg in legs.iter().filter(|l| !l.unlimited) {
            let loaded = self
                .entry(leg.subject)
                .filter(|entry| entry.lock().loaded);
            let Some(entry) = loaded else {
                undo(&held);
                return Err(Error::StoreUnavailable(format!(
                    "quota balance for {} is not loaded",
                    leg.subject
                )));
            };

            let mut balance = entry.lock();
            let available = balance.available();
            if available <= 0 || available < amount {
                drop(balance);
                undo(&held);
                debug!(subject = %leg.subject, available, amount, "quota insufficient");
                return Err(Error::QuotaInsufficient {
                    subject: leg.subject.to_string(),
                    available,
                    requested: amount,
                });
            }
            balance.held += amount;
            balance.touched = Instant::now();
            drop(balance);
            held.push(entry);
        }

        let id = ReservationId(Uuid::new_v4());
        self.reservations.lock().insert(
            id,
            Reservation {
                legs: legs.iter().map(|l| (l.subject, !l.unlimited)).collect(),
                amount,
                created: Instant::now(),
            },
        );
        Ok(ReservationGuard {
            ledger: self,
            id,
            armed: true,
        })
    }

    /// Settle a reservation at its actual cost. Returns the refund
    /// (estimate minus actual, negative if the request cost more), or `None`
    /// if the reservation is unknown or already settled.
    pub fn commit(&self, id: ReservationId, actual: i64) -> Option<i64> {
        let reservation = self.reservations.lock().remove(&id)?;
        let actual = actual.max(0);
        for (subject, held) in &reservation.legs {
            let entry = self.entry_or_track(*subject);
            let mut balance = entry.lock();
            if *held {
                balance.held -= reservation.amount;
            }
            balance.pending += actual;
            balance.touched = Instant::now();
        }
        debug!(reservation = %id, estimate = reservation.amount, actual, "reservation committed");
        Some(reservation.amount - actual)
    }

    /// Drop a reservation and refund its hold in full.
    pub fn release(&self, id: ReservationId) -> bool {
        let Some(reservation) = self.reservations.lock().remove(&id) else {
            return false;
        };
        for (subject, held) in &reservation.legs {
            if !held {
                continue;
            }
            if let Some(entry) = self.entry(*subject) {
                entry.lock().held -= reservation.amount;
            }
        }
        debug!(reservation = %id, amount = reservation.amount, "reservation released");
        true
    }

    /// Spendable balance: durable minus holds minus unsynced consumption.
    pub fn available(&self, subject: SubjectKey) -> Option<i64> {
        let entry = self.entry(subject)?;
        let balance = entry.lock();
        balance.loaded.then(|| balance.available())
    }

    pub fn outstanding(&self) -> usize {
        self.reservations.lock().len()
    }

    pub fn cached(&self) -> usize {
        self.balances.read().len()
    }

    /// Release reservations older than `max_age`. Covers callers that never
    /// reported a result.
    pub fn reap_expired(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<ReservationId> = self
            .reservations
            .lock()
            .iter()
            .filter(|(_, r)| now.duration_since(r.created) >= max_age)
            .map(|(id, _)| *id)
            .collect();
        let reaped = expired.into_iter().filter(|id| self.release(*id)).count();
        if reaped > 0 {
            warn!(reaped, "released reservations that were never reported");
        }
        reaped
    }

    /// Write committed consumption to the store, refresh durable balances
    /// and evict idle entries.
    pub async fn sync(&self) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        let mut report = SyncReport::default();

        let entries: Vec<(SubjectKey, Arc<Mutex<Balance>>)> = self
            .balances
            .read()
            .iter()
            .map(|(k, v)| (*k, Arc::clone(v)))
            .collect();

        for (subject, entry) in entries {
            let pending = entry.lock().pending;
            if pending != 0 {
                match self
                    .call("persisting quota", self.store.apply_delta(subject, -pending))
                    .await
                {
                    Ok(()) => report.persisted += 1,
                    Err(e) => {
                        warn!(subject = %subject, pending, error = %e, "failed to persist consumption, will retry");
                        report.failures += 1;
                        continue;
                    }
                }
            }

            match self
                .call("reading quota balance", self.store.balance(subject))
                .await
            {
                Ok(durable) => {
                    let mut balance = entry.lock();
                    balance.pending -= pending;
                    balance.durable = durable;
                    balance.loaded = true;
                    report.refreshed += 1;
                }
                Err(e) => {
                    let mut balance = entry.lock();
                    balance.pending -= pending;
                    balance.durable -= pending;
                    warn!(subject = %subject, error = %e, "failed to refresh balance");
                    report.failures += 1;
                }
            }
        }

        let now = Instant::now();
        let mut balances = self.balances.write();
        let before = balances.len();
        balances.retain(|_, entry| {
            let balance = entry.lock();
            !(balance.is_idle() && now.duration_since(balance.touched) >= self.idle_ttl)
        });
        report.evicted = before - balances.len();
        drop(balances);

        if report.persisted > 0 || report.evicted > 0 || report.failures > 0 {
            info!(
                persisted = report.persisted,
                refreshed = report.refreshed,
                evicted = report.evicted,
                failures = report.failures,
                "quota ledger synced"
            );
        }
        report
    }
}

/// An outstanding reservation. Dropping it without
/// [`keep`](Self::keep) releases the hold.
pub struct ReservationGuard<'a> {
    ledger: &'a QuotaLedger,
    id: ReservationId,
    armed: bool,
}

impl ReservationGuard<'_> {
    pub fn id(&self) -> ReservationId {
        self.id
    }

    /// Hand the reservation over to the caller, who must later commit or
    /// release it.
    pub fn keep(mut self) -> ReservationId {
        self.armed = false;
        self.id
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.ledger.release(self.id);
        }
    }
}
