use std::sync::Arc;
use std::time::Duration;

use provsync_sync::{CostGuard, SpendLedger};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deep_calls_stay_under_the_ceiling() {
    let ledger = Arc::new(SpendLedger::new());
    let guard = CostGuard::new(ledger.clone(), 10.0, 0.5);
    let estimate = 3.0;

    let mut tasks = Vec::new();
    for i in 0..64u64 {
        let guard = guard.clone();
        tasks.push(tokio::spawn(async move {
            let Some(reservation) = guard.try_reserve(estimate) else {
                return false;
            };
            tokio::time::sleep(Duration::from_millis(i % 5)).await;
            // realized cost varies but never above the estimate
            let realized = 1.0 + (i % 3) as f64;
            reservation.settle(realized, true);
            true
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if task.await.expect("task") {
            admitted += 1;
        }
    }

    assert!(admitted > 0);
    assert!(ledger.spent() <= 10.0, "spent {}", ledger.spent());
    assert_eq!(ledger.in_flight(), 0.0);
    assert_eq!(ledger.charged_calls(), admitted);
    assert_eq!(guard.reserve(estimate), ledger.spent() + estimate <= 10.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_costing_more_than_estimated_never_push_spend_past_the_ceiling() {
    let ledger = Arc::new(SpendLedger::new());
    let guard = CostGuard::new(ledger.clone(), 10.0, 0.5);
    let estimate = 2.0;
    let realized = 8.0;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let guard = guard.clone();
        tasks.push(tokio::spawn(async move {
            let Some(reservation) = guard.try_reserve(estimate) else {
                return false;
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            reservation.settle(realized, true);
            true
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if task.await.expect("task") {
            admitted += 1;
        }
    }

    // all five holds fit at once; each is charged at most what it held
    assert_eq!(admitted, 5);
    assert!(ledger.spent() <= 10.0, "spent {}", ledger.spent());
    assert_eq!(ledger.spent(), 10.0);
    assert_eq!(ledger.overrun(), 5.0 * (realized - estimate));
    assert_eq!(ledger.in_flight(), 0.0);
    assert!(!guard.reserve(estimate));
}

#[test]
fn dropped_reservation_charges_the_minimum_billable_unit() {
    let ledger = Arc::new(SpendLedger::new());
    let guard = CostGuard::new(ledger.clone(), 10.0, 0.5);
    {
        let _reservation = guard.try_reserve(2.0).expect("admitted");
        assert_eq!(ledger.in_flight(), 2.0);
    }
    assert_eq!(ledger.in_flight(), 0.0);
    assert_eq!(ledger.spent(), 0.5);
}
