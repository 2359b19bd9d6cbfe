//! Thread-safe per-currency balances with reserve/commit/release
//! semantics.
//!
//! The reserve pattern closes the check-then-spend race: funds move from
//! `available` to `reserved` atomically, and a reservation is consumed
//! exactly once by `commit` (spend what was used, refund the rest) or
//! `release` (full refund). Reservations that survive their order become
//! orphans and are reclaimed during startup recovery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{BalanceSnapshot, Currency, Money, Reservation, RoundingPolicy};
use bulwark_bus::EventBus;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AccountError, AccountResult};

#[derive(Clone, Debug, Default)]
struct Entry {
    total: Decimal,
    available: Decimal,
    reserved: Decimal,
}

impl Entry {
    fn assert_invariant(&self, currency: &str) {
        debug_assert!(
            self.total == self.available + self.reserved
                && self.total >= Decimal::ZERO
                && self.available >= Decimal::ZERO
                && self.reserved >= Decimal::ZERO,
            "balance invariant violated for {currency}: total={} available={} reserved={}",
            self.total,
            self.available,
            self.reserved
        );
    }
}

struct Ledger {
    balances: HashMap<Currency, Entry>,
    reservations: HashMap<Uuid, Reservation>,
}

/// The sole writer of account balances.
pub struct BalanceManager {
    ledger: AsyncMutex<Ledger>,
    bus: Option<Arc<EventBus>>,
    changed: Notify,
}

impl BalanceManager {
    /// Empty manager; fund it through [`BalanceManager::credit`].
    #[must_use]
    pub fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            ledger: AsyncMutex::new(Ledger {
                balances: HashMap::new(),
                reservations: HashMap::new(),
            }),
            bus,
            changed: Notify::new(),
        }
    }

    /// Increase `total` and `available`, e.g. for starting capital or the
    /// receive side of a fill.
    pub async fn credit(&self, amount: &Money, reason: &str) -> AccountResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            let entry = ledger
                .balances
                .entry(amount.currency().to_string())
                .or_default();
            entry.total += amount.amount();
            entry.available += amount.amount();
            entry.assert_invariant(amount.currency());
        }
        debug!(currency = amount.currency(), amount = %amount.amount(), reason, "credited");
        self.announce(amount.currency(), reason).await;
        Ok(())
    }

    /// Decrease `total` and `available` without a reservation. Recovery
    /// uses this to settle fills whose reservation did not survive a
    /// restart; normal flow always goes through reserve/commit.
    pub async fn debit(&self, amount: &Money, reason: &str) -> AccountResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            let entry = ledger
                .balances
                .entry(amount.currency().to_string())
                .or_default();
            if entry.available < amount.amount() {
                return Err(AccountError::InsufficientFunds {
                    currency: amount.currency().to_string(),
                    available: entry.available,
                    requested: amount.amount(),
                });
            }
            entry.total -= amount.amount();
            entry.available -= amount.amount();
            entry.assert_invariant(amount.currency());
        }
        debug!(currency = amount.currency(), amount = %amount.amount(), reason, "debited");
        self.announce(amount.currency(), reason).await;
        Ok(())
    }

    /// Earmark funds for a prospective order. Fails immediately when
    /// `available` cannot cover the amount.
    pub async fn reserve(&self, amount: &Money, owner: &str) -> AccountResult<Reservation> {
        let reservation = {
            let mut ledger = self.ledger.lock().await;
            let entry = ledger
                .balances
                .entry(amount.currency().to_string())
                .or_default();
            if entry.available < amount.amount() {
                return Err(AccountError::InsufficientFunds {
                    currency: amount.currency().to_string(),
                    available: entry.available,
                    requested: amount.amount(),
                });
            }
            entry.available -= amount.amount();
            entry.reserved += amount.amount();
            entry.assert_invariant(amount.currency());
            let reservation = Reservation {
                id: Uuid::new_v4(),
                currency: amount.currency().to_string(),
                amount: amount.clone(),
                owner: owner.to_string(),
                created_at: Utc::now(),
            };
            ledger
                .reservations
                .insert(reservation.id, reservation.clone());
            reservation
        };
        debug!(
            id = %reservation.id,
            currency = %reservation.currency,
            amount = %reservation.amount.amount(),
            owner,
            "reserved"
        );
        self.announce(&reservation.currency, "reserve").await;
        Ok(reservation)
    }

    /// Like [`BalanceManager::reserve`], but waits up to `timeout` for
    /// contending reservations to clear before giving up.
    pub async fn reserve_with_timeout(
        &self,
        amount: &Money,
        owner: &str,
        timeout: Duration,
    ) -> AccountResult<Reservation> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.reserve(amount, owner).await {
                Err(AccountError::InsufficientFunds { .. }) if Instant::now() < deadline => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    let _ = tokio::time::timeout(wait, self.changed.notified()).await;
                }
                other => return other,
            }
        }
    }

    /// Consume a reservation, spending `actual_used` and refunding the
    /// remainder to `available`.
    pub async fn commit(&self, reservation: Reservation, actual_used: &Money) -> AccountResult<()> {
        self.commit_by_id(reservation.id, actual_used).await
    }

    /// Commit a reservation known only by id (recovery path).
    pub async fn commit_by_id(&self, id: Uuid, actual_used: &Money) -> AccountResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            let reservation = ledger
                .reservations
                .remove(&id)
                .ok_or(AccountError::UnknownReservation(id))?;
            if actual_used.currency() != reservation.currency {
                ledger.reservations.insert(id, reservation.clone());
                return Err(AccountError::Money(
                    bulwark_core::MoneyError::CurrencyMismatch {
                        left: reservation.currency.clone(),
                        right: actual_used.currency().to_string(),
                    },
                ));
            }
            if actual_used.amount() > reservation.amount.amount() {
                let reserved = reservation.amount.amount();
                ledger.reservations.insert(id, reservation);
                return Err(AccountError::OverCommit {
                    reserved,
                    used: actual_used.amount(),
                });
            }
            let entry = ledger
                .balances
                .entry(reservation.currency.clone())
                .or_default();
            entry.total -= actual_used.amount();
            entry.reserved -= reservation.amount.amount();
            entry.available += reservation.amount.amount() - actual_used.amount();
            entry.assert_invariant(&reservation.currency);
        }
        self.changed.notify_waiters();
        self.announce(actual_used.currency(), "commit").await;
        Ok(())
    }

    /// Consume a reservation with a full refund.
    pub async fn release(&self, reservation: Reservation) -> AccountResult<()> {
        self.release_by_id(reservation.id).await
    }

    /// Release a reservation known only by id (recovery path).
    pub async fn release_by_id(&self, id: Uuid) -> AccountResult<()> {
        let currency = {
            let mut ledger = self.ledger.lock().await;
            let reservation = ledger
                .reservations
                .remove(&id)
                .ok_or(AccountError::UnknownReservation(id))?;
            let entry = ledger
                .balances
                .entry(reservation.currency.clone())
                .or_default();
            entry.reserved -= reservation.amount.amount();
            entry.available += reservation.amount.amount();
            entry.assert_invariant(&reservation.currency);
            reservation.currency
        };
        self.changed.notify_waiters();
        self.announce(&currency, "release").await;
        Ok(())
    }

    /// Immutable view of one currency.
    pub async fn balance(&self, currency: &str) -> BalanceSnapshot {
        let ledger = self.ledger.lock().await;
        let entry = ledger.balances.get(currency).cloned().unwrap_or_default();
        snapshot_of(currency, &entry)
    }

    /// Immutable view of all balances.
    pub async fn snapshot(&self) -> Vec<BalanceSnapshot> {
        let ledger = self.ledger.lock().await;
        let mut snapshots: Vec<_> = ledger
            .balances
            .iter()
            .map(|(currency, entry)| snapshot_of(currency, entry))
            .collect();
        snapshots.sort_by(|a, b| a.currency.cmp(&b.currency));
        snapshots
    }

    /// Look up one open reservation by id.
    pub async fn reservation(&self, id: Uuid) -> Option<Reservation> {
        let ledger = self.ledger.lock().await;
        ledger.reservations.get(&id).cloned()
    }

    /// Every reservation that has not yet been committed or released.
    pub async fn open_reservations(&self) -> Vec<Reservation> {
        let ledger = self.ledger.lock().await;
        ledger.reservations.values().cloned().collect()
    }

    /// Release every reservation whose id is not in `keep`. Returns the
    /// reclaimed reservations.
    pub async fn release_orphans(&self, keep: &HashSet<Uuid>) -> AccountResult<Vec<Reservation>> {
        let orphans: Vec<Reservation> = {
            let ledger = self.ledger.lock().await;
            ledger
                .reservations
                .values()
                .filter(|reservation| !keep.contains(&reservation.id))
                .cloned()
                .collect()
        };
        for orphan in &orphans {
            warn!(
                id = %orphan.id,
                currency = %orphan.currency,
                amount = %orphan.amount.amount(),
                owner = %orphan.owner,
                "releasing orphaned reservation"
            );
            self.release_by_id(orphan.id).await?;
        }
        Ok(orphans)
    }

    async fn announce(&self, currency: &str, reason: &str) {
        self.changed.notify_waiters();
        if let Some(bus) = &self.bus {
            let snapshot = self.balance(currency).await;
            let payload = json!({
                "currency": currency,
                "total": snapshot.total.amount(),
                "available": snapshot.available.amount(),
                "reserved": snapshot.reserved.amount(),
                "reason": reason,
            });
            if let Err(err) = bus.publish("balance:changed", payload, "balance_manager").await {
                warn!(error = %err, "failed to publish balance change");
            }
        }
    }
}

fn snapshot_of(currency: &str, entry: &Entry) -> BalanceSnapshot {
    // Ledger amounts only ever enter as Money, so the rounding here is an
    // identity; Down restates that no value is invented.
    BalanceSnapshot {
        currency: currency.to_string(),
        total: Money::rounded(entry.total, currency, RoundingPolicy::Down),
        available: Money::rounded(entry.available, currency, RoundingPolicy::Down),
        reserved: Money::rounded(entry.reserved, currency, RoundingPolicy::Down),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdt(raw: &str) -> Money {
        Money::parse(raw, "USDT").unwrap()
    }

    async fn funded_manager(amount: &str) -> BalanceManager {
        let manager = BalanceManager::new(None);
        manager.credit(&usdt(amount), "seed").await.unwrap();
        manager
    }

    #[tokio::test]
    async fn reserve_moves_available_to_reserved() {
        let manager = funded_manager("10000").await;
        let reservation = manager.reserve(&usdt("5005"), "agent-a").await.unwrap();

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.total, usdt("10000"));
        assert_eq!(snapshot.available, usdt("4995"));
        assert_eq!(snapshot.reserved, usdt("5005"));
        assert_eq!(reservation.amount, usdt("5005"));
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_ledger_untouched() {
        let manager = funded_manager("100").await;
        let err = manager.reserve(&usdt("5000"), "agent-a").await.unwrap_err();
        assert!(matches!(err, AccountError::InsufficientFunds { .. }));

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.available, usdt("100"));
        assert_eq!(snapshot.reserved, usdt("0"));
        assert!(manager.open_reservations().await.is_empty());
    }

    #[tokio::test]
    async fn commit_spends_used_and_refunds_surplus() {
        let manager = funded_manager("10000").await;
        let reservation = manager.reserve(&usdt("5005"), "agent-a").await.unwrap();
        manager.commit(reservation, &usdt("5005")).await.unwrap();

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.total, usdt("4995"));
        assert_eq!(snapshot.available, usdt("4995"));
        assert_eq!(snapshot.reserved, usdt("0"));
    }

    #[tokio::test]
    async fn commit_refund_when_less_was_used() {
        let manager = funded_manager("1000").await;
        let reservation = manager.reserve(&usdt("500"), "agent-a").await.unwrap();
        manager.commit(reservation, &usdt("400")).await.unwrap();

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.total, usdt("600"));
        assert_eq!(snapshot.available, usdt("600"));
    }

    #[tokio::test]
    async fn release_is_a_full_refund() {
        let manager = funded_manager("1000").await;
        let reservation = manager.reserve(&usdt("500"), "agent-a").await.unwrap();
        manager.release(reservation).await.unwrap();

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.available, usdt("1000"));
        assert_eq!(snapshot.reserved, usdt("0"));
    }

    #[tokio::test]
    async fn reservation_is_consumed_exactly_once() {
        let manager = funded_manager("1000").await;
        let reservation = manager.reserve(&usdt("500"), "agent-a").await.unwrap();
        let id = reservation.id;
        manager.release(reservation).await.unwrap();
        assert!(matches!(
            manager.release_by_id(id).await,
            Err(AccountError::UnknownReservation(_))
        ));
    }

    #[tokio::test]
    async fn over_commit_is_rejected_and_reservation_survives() {
        let manager = funded_manager("1000").await;
        let reservation = manager.reserve(&usdt("500"), "agent-a").await.unwrap();
        let err = manager
            .commit_by_id(reservation.id, &usdt("600"))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::OverCommit { .. }));
        assert_eq!(manager.open_reservations().await.len(), 1);
    }

    #[tokio::test]
    async fn orphan_release_keeps_referenced_reservations() {
        let manager = funded_manager("1000").await;
        let keep = manager.reserve(&usdt("100"), "agent-a").await.unwrap();
        let orphan = manager.reserve(&usdt("200"), "agent-b").await.unwrap();

        let mut keep_set = HashSet::new();
        keep_set.insert(keep.id);
        let released = manager.release_orphans(&keep_set).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, orphan.id);

        let snapshot = manager.balance("USDT").await;
        assert_eq!(snapshot.reserved, usdt("100"));
        assert_eq!(snapshot.available, usdt("900"));
    }

    #[tokio::test]
    async fn reserve_with_timeout_waits_for_contention_to_clear() {
        let manager = Arc::new(funded_manager("500").await);
        let blocker = manager.reserve(&usdt("500"), "agent-a").await.unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .reserve_with_timeout(&usdt("300"), "agent-b", Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.release(blocker).await.unwrap();

        let reservation = waiter.await.unwrap().unwrap();
        assert_eq!(reservation.amount, usdt("300"));
    }

    #[tokio::test]
    async fn reserve_with_timeout_eventually_gives_up() {
        let manager = funded_manager("100").await;
        let err = manager
            .reserve_with_timeout(&usdt("500"), "agent-a", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AccountError::InsufficientFunds { .. }));
    }
}
