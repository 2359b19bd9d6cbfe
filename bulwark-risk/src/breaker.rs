//! Loss-triggered trading halt with a drain protocol.
//!
//! State machine: CLOSED trades normally; a drawdown past the configured
//! fraction of peak value moves to DRAINING, which lets in-flight orders
//! finish while refusing new ones; an empty in-flight set (or the drain
//! deadline) moves to OPEN; an operator reset after the cooldown moves to
//! HALF_OPEN, which admits exactly one probe order; the probe's outcome
//! closes or re-opens the breaker. Every transition is persisted before
//! it is acted upon, and a persisted OPEN or DRAINING state survives
//! restarts as OPEN until an operator intervenes.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::{RiskError, RiskResult};

/// Breaker tuning.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Fraction of peak value whose loss trips the breaker, in (0, 1).
    pub loss_threshold: Decimal,
    /// Minimum time the breaker stays OPEN before a reset is legal.
    pub cooldown: Duration,
    /// Consecutive reconciliation failures that force OPEN.
    pub reconcile_fail_limit: u32,
    /// Where breaker state is persisted. `None` keeps it in memory only.
    pub state_path: Option<PathBuf>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            loss_threshold: Decimal::new(1, 1),
            cooldown: Duration::from_secs(3600),
            reconcile_fail_limit: 3,
            state_path: None,
        }
    }
}

/// The four breaker states.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Draining,
    Open,
    HalfOpen,
}

/// One operator-initiated reset, kept in the persisted record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResetRecord {
    pub at: DateTime<Utc>,
    pub note: String,
}

/// Persisted breaker state; also the operator-facing snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub peak_value: Decimal,
    pub current_value: Decimal,
    pub in_flight_order_ids: BTreeSet<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub consecutive_reconcile_failures: u32,
    pub probe_outstanding: bool,
    #[serde(default)]
    pub resets: Vec<ResetRecord>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            peak_value: Decimal::ZERO,
            current_value: Decimal::ZERO,
            in_flight_order_ids: BTreeSet::new(),
            opened_at: None,
            consecutive_reconcile_failures: 0,
            probe_outstanding: false,
            resets: Vec::new(),
        }
    }
}

/// Why a check was denied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Open,
    Draining,
    ProbeOutstanding,
    LossThreshold,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "breaker is OPEN"),
            Self::Draining => write!(f, "breaker is DRAINING"),
            Self::ProbeOutstanding => write!(f, "probe order outstanding"),
            Self::LossThreshold => write!(f, "loss threshold exceeded"),
        }
    }
}

/// Verdict of a pre-trade check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

/// Result of waiting for the drain to finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    Timeout,
}

/// The breaker itself: a persisted state machine, shared by reference.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerSnapshot>,
    drained: Notify,
}

impl CircuitBreaker {
    /// Load persisted state (if any). A persisted OPEN or DRAINING state
    /// remains OPEN until an operator resets it.
    pub fn load(config: BreakerConfig) -> RiskResult<Self> {
        let mut snapshot = BreakerSnapshot::default();
        if let Some(path) = &config.state_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                snapshot = serde_json::from_str(&raw)?;
                if matches!(snapshot.state, BreakerState::Open | BreakerState::Draining) {
                    warn!(
                        state = ?snapshot.state,
                        "breaker was tripped before shutdown; staying OPEN until manual reset"
                    );
                    snapshot.state = BreakerState::Open;
                }
            }
        }
        let breaker = Self {
            config,
            state: Mutex::new(snapshot),
            drained: Notify::new(),
        };
        breaker.persist(&breaker.state.lock())?;
        Ok(breaker)
    }

    /// Check whether a new order may enter. Updates the peak watermark and
    /// trips the breaker when the drawdown crosses the threshold.
    pub fn check(&self, current_value: Decimal) -> RiskResult<Verdict> {
        let mut state = self.state.lock();
        state.current_value = current_value;
        if current_value > state.peak_value {
            state.peak_value = current_value;
        }

        match state.state {
            BreakerState::Open => return Ok(Verdict::Deny(DenyReason::Open)),
            BreakerState::Draining => {
                if state.in_flight_order_ids.is_empty() {
                    self.transition(&mut state, BreakerState::Open)?;
                }
                return Ok(Verdict::Deny(DenyReason::Draining));
            }
            BreakerState::HalfOpen => {
                if state.probe_outstanding {
                    return Ok(Verdict::Deny(DenyReason::ProbeOutstanding));
                }
                state.probe_outstanding = true;
                self.persist(&state)?;
                info!("breaker HALF_OPEN: admitting probe order");
                return Ok(Verdict::Allow);
            }
            BreakerState::Closed => {}
        }

        let floor = state.peak_value * (Decimal::ONE - self.config.loss_threshold);
        if state.peak_value > Decimal::ZERO && current_value < floor {
            warn!(
                peak = %state.peak_value,
                current = %current_value,
                "loss threshold crossed, tripping breaker"
            );
            self.trip_locked(&mut state)?;
            return Ok(Verdict::Deny(DenyReason::LossThreshold));
        }
        Ok(Verdict::Allow)
    }

    /// Trip the breaker. In-flight orders put it into DRAINING; an empty
    /// in-flight set goes straight to OPEN.
    pub fn trip(&self, reason: &str) -> RiskResult<()> {
        let mut state = self.state.lock();
        if matches!(state.state, BreakerState::Open | BreakerState::Draining) {
            return Ok(());
        }
        warn!(reason, "circuit breaker tripped");
        self.trip_locked(&mut state)
    }

    fn trip_locked(&self, state: &mut BreakerSnapshot) -> RiskResult<()> {
        state.opened_at = Some(Utc::now());
        if state.in_flight_order_ids.is_empty() {
            self.transition(state, BreakerState::Open)
        } else {
            self.transition(state, BreakerState::Draining)
        }
    }

    /// Track an order entering the pipeline.
    pub fn register(&self, order_id: &str) -> RiskResult<()> {
        let mut state = self.state.lock();
        state.in_flight_order_ids.insert(order_id.to_string());
        self.persist(&state)
    }

    /// Mark an order as finished. Completing the last in-flight order
    /// while DRAINING moves the breaker to OPEN.
    pub fn complete(&self, order_id: &str) -> RiskResult<()> {
        let mut state = self.state.lock();
        state.in_flight_order_ids.remove(order_id);
        if state.state == BreakerState::Draining && state.in_flight_order_ids.is_empty() {
            self.transition(&mut state, BreakerState::Open)?;
        } else {
            self.persist(&state)?;
        }
        if state.in_flight_order_ids.is_empty() {
            self.drained.notify_waiters();
        }
        Ok(())
    }

    /// Wait until the in-flight set empties or the deadline elapses. A
    /// deadline expiry while DRAINING forces OPEN.
    pub async fn wait_for_drain(&self, deadline: Duration) -> RiskResult<DrainOutcome> {
        let wait = tokio::time::timeout(deadline, async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight_count() == 0 {
                    break;
                }
                let poll = tokio::time::sleep(Duration::from_millis(25));
                tokio::select! {
                    () = notified => {}
                    () = poll => {}
                }
            }
        })
        .await;
        match wait {
            Ok(()) => Ok(DrainOutcome::Drained),
            Err(_) => {
                let mut state = self.state.lock();
                if state.state == BreakerState::Draining {
                    warn!(
                        remaining = state.in_flight_order_ids.len(),
                        "drain deadline elapsed, forcing OPEN"
                    );
                    self.transition(&mut state, BreakerState::Open)?;
                }
                Ok(DrainOutcome::Timeout)
            }
        }
    }

    /// Operator reset. Legal only in OPEN, after the cooldown; records a
    /// persisted reset record before moving to HALF_OPEN. The caller is
    /// responsible for having run a passing reconciliation first.
    pub fn reset(&self, note: &str) -> RiskResult<()> {
        let mut state = self.state.lock();
        if state.state != BreakerState::Open {
            return Err(RiskError::InvalidTransition(format!(
                "reset is only legal in OPEN (current: {:?})",
                state.state
            )));
        }
        if let Some(opened_at) = state.opened_at {
            let elapsed = Utc::now().signed_duration_since(opened_at);
            let cooldown = chrono::Duration::from_std(self.config.cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            if elapsed < cooldown {
                return Err(RiskError::InvalidTransition(format!(
                    "cooldown not elapsed ({}s remaining)",
                    (cooldown - elapsed).num_seconds()
                )));
            }
        }
        state.resets.push(ResetRecord {
            at: Utc::now(),
            note: note.to_string(),
        });
        state.probe_outstanding = false;
        state.in_flight_order_ids.clear();
        self.transition(&mut state, BreakerState::HalfOpen)?;
        info!(note, "breaker reset to HALF_OPEN");
        Ok(())
    }

    /// The HALF_OPEN probe completed successfully.
    pub fn probe_succeeded(&self) -> RiskResult<()> {
        let mut state = self.state.lock();
        if state.state == BreakerState::HalfOpen {
            state.probe_outstanding = false;
            self.transition(&mut state, BreakerState::Closed)?;
            info!("probe succeeded, breaker CLOSED");
        }
        Ok(())
    }

    /// Any failure during the HALF_OPEN probe re-opens the breaker.
    pub fn probe_failed(&self, reason: &str) -> RiskResult<()> {
        let mut state = self.state.lock();
        if state.state == BreakerState::HalfOpen {
            warn!(reason, "probe failed, breaker re-OPEN");
            state.probe_outstanding = false;
            state.opened_at = Some(Utc::now());
            self.transition(&mut state, BreakerState::Open)?;
        }
        Ok(())
    }

    /// Count a failed reconciliation cycle; hitting the limit forces OPEN.
    pub fn record_reconcile_failure(&self) -> RiskResult<u32> {
        let mut state = self.state.lock();
        state.consecutive_reconcile_failures += 1;
        let failures = state.consecutive_reconcile_failures;
        if failures >= self.config.reconcile_fail_limit
            && state.state != BreakerState::Open
        {
            warn!(failures, "persistent reconciliation failure, forcing OPEN");
            state.opened_at = Some(Utc::now());
            self.transition(&mut state, BreakerState::Open)?;
        } else {
            self.persist(&state)?;
        }
        Ok(failures)
    }

    /// A reconciliation cycle passed; clears the failure streak.
    pub fn record_reconcile_success(&self) -> RiskResult<()> {
        let mut state = self.state.lock();
        if state.consecutive_reconcile_failures != 0 {
            state.consecutive_reconcile_failures = 0;
            self.persist(&state)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state.lock().state
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight_order_ids.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        self.state.lock().clone()
    }

    fn transition(&self, state: &mut BreakerSnapshot, to: BreakerState) -> RiskResult<()> {
        let from = state.state;
        state.state = to;
        self.persist(state)?;
        info!(?from, ?to, "breaker transition");
        Ok(())
    }

    fn persist(&self, state: &BreakerSnapshot) -> RiskResult<()> {
        if let Some(path) = &self.config.state_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_string_pretty(state)?;
            std::fs::write(path, raw)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::load(BreakerConfig::default()).unwrap()
    }

    #[test]
    fn loss_past_threshold_trips_to_draining_with_in_flight() {
        let breaker = breaker();
        assert_eq!(breaker.check(dec("10000")).unwrap(), Verdict::Allow);
        breaker.register("order-1").unwrap();

        let verdict = breaker.check(dec("8900")).unwrap();
        assert_eq!(verdict, Verdict::Deny(DenyReason::LossThreshold));
        assert_eq!(breaker.state(), BreakerState::Draining);

        // New submissions stay denied while draining.
        assert_eq!(
            breaker.check(dec("8900")).unwrap(),
            Verdict::Deny(DenyReason::Draining)
        );

        // Completing the last in-flight order finishes the drain.
        breaker.complete("order-1").unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn loss_with_no_in_flight_goes_straight_to_open() {
        let breaker = breaker();
        breaker.check(dec("10000")).unwrap();
        assert_eq!(
            breaker.check(dec("8000")).unwrap(),
            Verdict::Deny(DenyReason::LossThreshold)
        );
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn peak_ratchets_upward() {
        let breaker = breaker();
        breaker.check(dec("10000")).unwrap();
        breaker.check(dec("12000")).unwrap();
        // A 10% drop from the new peak trips even though it is above the
        // starting value.
        assert_eq!(
            breaker.check(dec("10700")).unwrap(),
            Verdict::Deny(DenyReason::LossThreshold)
        );
    }

    #[test]
    fn reset_requires_open_and_cooldown() {
        let config = BreakerConfig {
            cooldown: Duration::from_secs(0),
            ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::load(config).unwrap();
        assert!(breaker.reset("too early").is_err());

        breaker.trip("test").unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.reset("operator ok").unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.snapshot().resets.len(), 1);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let config = BreakerConfig {
            cooldown: Duration::from_secs(0),
            ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::load(config).unwrap();
        breaker.check(dec("10000")).unwrap();
        breaker.trip("test").unwrap();
        breaker.reset("ok").unwrap();

        assert_eq!(breaker.check(dec("10000")).unwrap(), Verdict::Allow);
        assert_eq!(
            breaker.check(dec("10000")).unwrap(),
            Verdict::Deny(DenyReason::ProbeOutstanding)
        );

        breaker.probe_succeeded().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let config = BreakerConfig {
            cooldown: Duration::from_secs(0),
            ..BreakerConfig::default()
        };
        let breaker = CircuitBreaker::load(config).unwrap();
        breaker.trip("test").unwrap();
        breaker.reset("ok").unwrap();
        breaker.check(dec("10000")).unwrap();
        breaker.probe_failed("venue reject").unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn reconcile_failures_escalate_to_open() {
        let breaker = breaker();
        assert_eq!(breaker.record_reconcile_failure().unwrap(), 1);
        assert_eq!(breaker.record_reconcile_failure().unwrap(), 2);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.record_reconcile_failure().unwrap(), 3);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn persisted_open_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("breaker.json");
        let config = BreakerConfig {
            state_path: Some(path.clone()),
            ..BreakerConfig::default()
        };
        {
            let breaker = CircuitBreaker::load(config.clone()).unwrap();
            breaker.register("order-1").unwrap();
            breaker.trip("drawdown").unwrap();
            assert_eq!(breaker.state(), BreakerState::Draining);
        }
        // A restart during the drain comes back OPEN, never CLOSED.
        let breaker = CircuitBreaker::load(config).unwrap();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn wait_for_drain_times_out_and_forces_open() {
        let breaker = breaker();
        breaker.register("order-1").unwrap();
        breaker.trip("test").unwrap();
        assert_eq!(breaker.state(), BreakerState::Draining);
        let outcome = breaker
            .wait_for_drain(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(outcome, DrainOutcome::Timeout);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn wait_for_drain_returns_when_orders_finish() {
        let breaker = std::sync::Arc::new(breaker());
        breaker.register("order-1").unwrap();
        let waiter = {
            let breaker = std::sync::Arc::clone(&breaker);
            tokio::spawn(async move { breaker.wait_for_drain(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.complete("order-1").unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), DrainOutcome::Drained);
    }
}
