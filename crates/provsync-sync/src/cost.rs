//! Deep-tier spend control: the run-scoped ledger and the guard in front of it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct LedgerState {
    spent: f64,
    held: f64,
    charged_calls: usize,
    overrun: f64,
}

/// Cost units consumed by deep-tier calls in the current run.
#[derive(Debug, Default)]
pub struct SpendLedger {
    state: Mutex<LedgerState>,
}

impl SpendLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spent(&self) -> f64 {
        self.lock().spent
    }

    /// Estimates held by reservations that have not settled yet.
    pub fn in_flight(&self) -> f64 {
        self.lock().held
    }

    pub fn charged_calls(&self) -> usize {
        self.lock().charged_calls
    }

    /// Reported cost above what calls had reserved; never counted toward `spent`.
    pub fn overrun(&self) -> f64 {
        self.lock().overrun
    }

    pub fn reset(&self) {
        *self.lock() = LedgerState::default();
    }

    /// Adds realized spend; negative amounts are ignored.
    pub fn charge(&self, units: f64) {
        let units = units.max(0.0);
        let mut state = self.lock();
        state.spent += units;
        if units > 0.0 {
            state.charged_calls += 1;
        }
    }

    fn hold(&self, estimated: f64, ceiling: f64) -> bool {
        let mut state = self.lock();
        if state.spent + state.held + estimated > ceiling {
            return false;
        }
        state.held += estimated;
        true
    }

    fn release(&self, estimated: f64, charged: f64, overrun: f64) {
        let mut state = self.lock();
        state.held = (state.held - estimated).max(0.0);
        state.spent += charged;
        state.overrun += overrun;
        if charged > 0.0 {
            state.charged_calls += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostGuard {
    ledger: Arc<SpendLedger>,
    ceiling: f64,
    min_billable: f64,
}

impl CostGuard {
    pub fn new(ledger: Arc<SpendLedger>, ceiling: f64, min_billable: f64) -> Self {
        Self {
            ledger,
            ceiling: ceiling.max(0.0),
            min_billable: min_billable.max(0.0),
        }
    }

    pub fn ledger(&self) -> &Arc<SpendLedger> {
        &self.ledger
    }

    /// Whether a call of `estimated` units fits under the ceiling right now. Holds nothing.
    pub fn reserve(&self, estimated: f64) -> bool {
        let state = *self.ledger.lock();
        state.spent + state.held + self.hold_for(estimated) <= self.ceiling
    }

    /// An issued call bills at least the minimum, so the hold never goes below it.
    fn hold_for(&self, estimated: f64) -> f64 {
        estimated.max(self.min_billable)
    }

    /// Holds `estimated` units against the ceiling until the returned reservation settles.
    /// `estimated` must be an upper bound: settling never charges more than the hold.
    pub fn try_reserve(&self, estimated: f64) -> Option<Reservation> {
        let estimated = self.hold_for(estimated);
        if !self.ledger.hold(estimated, self.ceiling) {
            debug!(
                estimated,
                spent = self.ledger.spent(),
                ceiling = self.ceiling,
                "deep-tier reservation denied"
            );
            return None;
        }
        Some(Reservation {
            ledger: self.ledger.clone(),
            estimated,
            min_billable: self.min_billable,
            settled: false,
        })
    }
}

/// An admitted deep-tier call. Dropping it unsettled charges the minimum billable unit.
#[derive(Debug)]
#[must_use = "a reservation must be settled with the realized cost"]
pub struct Reservation {
    ledger: Arc<SpendLedger>,
    estimated: f64,
    min_billable: f64,
    settled: bool,
}

impl Reservation {
    pub fn estimated(&self) -> f64 {
        self.estimated
    }

    /// Replaces the held estimate with the realized cost and returns the amount charged.
    /// An issued call is charged at least the minimum billable unit and at most what was
    /// held; one never sent costs nothing. Cost reported above the hold goes to the
    /// ledger's overrun instead of its spend.
    pub fn settle(mut self, realized: f64, issued: bool) -> f64 {
        let (charged, overrun) = if issued {
            let billed = realized.max(self.min_billable);
            (billed.min(self.estimated), (billed - self.estimated).max(0.0))
        } else {
            (0.0, 0.0)
        };
        if overrun > 0.0 {
            warn!(
                estimated = self.estimated,
                realized,
                overrun,
                "deep-tier call cost more than it reserved"
            );
        }
        self.ledger.release(self.estimated, charged, overrun);
        self.settled = true;
        debug!(estimated = self.estimated, cost_units = charged, issued, "deep-tier call settled");
        charged
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.ledger.release(self.estimated, self.min_billable, 0.0);
        }
    }
}
