//! The pre-trading safety audit.
//!
//! Nine checks run before trading is allowed to begin (and before a
//! breaker reset is honoured). Every check reports independently; the
//! audit passes only when all of them do.

use bulwark_config::AppConfig;
use bulwark_core::OrderStatus;
use bulwark_gateway::System;
use bulwark_risk::BreakerState;
use rust_decimal::Decimal;
use tracing::info;

/// Result of one audit check.
#[derive(Clone, Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Run the nine-point audit against an assembled system.
pub async fn run_checks(system: &System, config: &AppConfig) -> Vec<CheckResult> {
    let mut results = Vec::with_capacity(9);

    // 1. Circuit breaker state.
    let state = system.breaker.state();
    results.push(match state {
        BreakerState::Closed | BreakerState::HalfOpen => {
            CheckResult::pass("circuit breaker state", format!("{state:?}"))
        }
        BreakerState::Open | BreakerState::Draining => CheckResult::fail(
            "circuit breaker state",
            format!("{state:?}; manual reset required"),
        ),
    });

    // 2. Position reconciliation.
    results.push(match system.reconciler.run_once().await {
        Ok(report) if report.passed() => CheckResult::pass(
            "position reconciliation",
            format!("{} symbol(s) checked", report.checked),
        ),
        Ok(report) => CheckResult::fail(
            "position reconciliation",
            format!("{} mismatch(es)", report.mismatched.len()),
        ),
        Err(err) => CheckResult::fail("position reconciliation", err.to_string()),
    });

    // 3. Exchange connectivity.
    results.push(match system.exchange.fetch_balances().await {
        Ok(balances) => CheckResult::pass(
            "exchange connectivity",
            format!("{} venue balance(s) visible", balances.len()),
        ),
        Err(err) => CheckResult::fail("exchange connectivity", err.to_string()),
    });

    // 4. Balance verification: the ledger invariant for every currency.
    let mut invariant_ok = true;
    let mut detail = String::from("total == available + reserved");
    for snapshot in system.balances.snapshot().await {
        let total = snapshot.total.amount();
        let sum = snapshot.available.amount() + snapshot.reserved.amount();
        if total != sum || total < Decimal::ZERO {
            invariant_ok = false;
            detail = format!(
                "{}: total={} available+reserved={}",
                snapshot.currency, total, sum
            );
            break;
        }
    }
    results.push(if invariant_ok {
        CheckResult::pass("balance verification", detail)
    } else {
        CheckResult::fail("balance verification", detail)
    });

    // 5. Orphan scan: no unresolved orders, no dangling reservations.
    let pending = system
        .store
        .list_by_status(OrderStatus::PendingVerification)
        .map(|records| records.len());
    let orphans = system.balances.open_reservations().await.len();
    results.push(match pending {
        Ok(0) if orphans == 0 => CheckResult::pass("orphan scan", "no unresolved orders"),
        Ok(pending) => CheckResult::fail(
            "orphan scan",
            format!("{pending} pending verification, {orphans} open reservation(s)"),
        ),
        Err(err) => CheckResult::fail("orphan scan", err.to_string()),
    });

    // 6. Risk limits configured.
    results.push(match config.validate() {
        Ok(()) => CheckResult::pass(
            "risk limits",
            format!(
                "loss threshold {}, fail limit {}",
                config.risk.loss_threshold_percent, config.reconcile.fail_limit
            ),
        ),
        Err(err) => CheckResult::fail("risk limits", err.to_string()),
    });

    // 7. Alert channels configured.
    results.push(if config.event_bus.critical_topics.is_empty() {
        CheckResult::fail("alert channels", "no critical topics configured")
    } else {
        CheckResult::pass(
            "alert channels",
            format!("{} critical topic(s)", config.event_bus.critical_topics.len()),
        )
    });

    // 8. Order audit trail accessible.
    results.push(match system.store.count() {
        Ok(count) => CheckResult::pass("order audit store", format!("{count} record(s)")),
        Err(err) => CheckResult::fail("order audit store", err.to_string()),
    });

    // 9. WAL directory writable.
    results.push(check_wal_dir(config));

    results
}

fn check_wal_dir(config: &AppConfig) -> CheckResult {
    let dir = &config.paths.wal_dir;
    if let Err(err) = std::fs::create_dir_all(dir) {
        return CheckResult::fail("wal directory", format!("{}: {err}", dir.display()));
    }
    let probe = dir.join(".write-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::pass("wal directory", dir.display().to_string())
        }
        Err(err) => CheckResult::fail("wal directory", format!("{}: {err}", dir.display())),
    }
}

/// Log and print the audit outcome; true iff everything passed.
pub fn report(results: &[CheckResult]) -> bool {
    let mut all_passed = true;
    for result in results {
        let status = if result.passed { "PASS" } else { "FAIL" };
        println!("[{status}] {:<28} {}", result.name, result.detail);
        if !result.passed {
            all_passed = false;
        }
    }
    info!(passed = all_passed, checks = results.len(), "pre-trading audit complete");
    all_passed
}
