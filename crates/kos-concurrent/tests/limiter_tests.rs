use kos_concurrent::ConcurrencyLimiter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_never_more_than_n_in_flight() {
    let limiter = ConcurrencyLimiter::new(3, Duration::from_secs(5));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let limiter = limiter.clone();
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            limiter
                .run_default(async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
        }));
    }

    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(limiter.in_flight(), 0);
    assert!(limiter.stats().peak_in_flight <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_extra_acquire_waits_for_release() {
    let limiter = ConcurrencyLimiter::new(2, Duration::from_secs(5));
    let first = limiter.try_acquire_slot().unwrap();
    let _second = limiter.try_acquire_slot().unwrap();

    let waiter = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire_slot(Duration::from_secs(10)).await.is_some() })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished());

    drop(first);
    assert!(waiter.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_extra_acquire_times_out_when_nothing_released() {
    let limiter = ConcurrencyLimiter::new(1, Duration::from_secs(5));
    let _held = limiter.try_acquire_slot().unwrap();

    let got = limiter.acquire_slot(Duration::from_secs(2)).await;
    assert!(got.is_none());
    assert_eq!(limiter.in_flight(), 1);
}

#[tokio::test]
async fn test_slot_released_when_protected_future_is_cancelled() {
    let limiter = ConcurrencyLimiter::new(1, Duration::from_secs(5));

    let task = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .run_default(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        })
    };

    // Let the task grab the slot, then cancel it mid-flight.
    while limiter.in_flight() == 0 {
        tokio::task::yield_now().await;
    }
    task.abort();
    let _ = task.await;

    assert_eq!(limiter.in_flight(), 0);
    assert!(limiter.try_acquire_slot().is_some());
}

#[tokio::test]
async fn test_slot_released_when_protected_future_panics() {
    let limiter = ConcurrencyLimiter::new(1, Duration::from_secs(5));

    let task = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter
                .run_default(async {
                    panic!("downstream exploded");
                })
                .await
        })
    };

    assert!(task.await.is_err());
    assert_eq!(limiter.in_flight(), 0);
    assert_eq!(limiter.available(), 1);
}
