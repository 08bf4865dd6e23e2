//! Integration tests for the sliding-window rate limiter.

use std::collections::BTreeSet;
use std::time::Duration;

use workgate::error::Error;
use workgate::rate_limit::RateLimiter;

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[test]
fn zero_rate_is_rejected() {
    let limiter = RateLimiter::new();
    let err = limiter
        .set_rule("uploads", 0, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRule { ref key, .. } if key == "uploads"));
    assert!(limiter.rule("uploads").is_none());
}

#[test]
fn zero_interval_is_rejected() {
    let limiter = RateLimiter::new();
    let err = limiter.set_rule("uploads", 1, Duration::ZERO).unwrap_err();
    assert!(matches!(err, Error::InvalidRule { .. }));
    assert!(limiter.rule("uploads").is_none());
}

#[tokio::test(start_paused = true)]
async fn resetting_a_rule_clears_its_hits() {
    let limiter = RateLimiter::new();
    limiter.set_rule("a", 1, Duration::from_secs(60)).unwrap();
    assert!(limiter.try_admit(&keys(&["a"])));
    assert!(!limiter.try_admit(&keys(&["a"])));

    limiter.set_rule("a", 1, Duration::from_secs(60)).unwrap();
    assert_eq!(limiter.hit_count("a"), 0);
    assert!(limiter.try_admit(&keys(&["a"])));
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn never_admits_more_than_rate_within_window() {
    let limiter = RateLimiter::new();
    limiter.set_rule("a", 3, Duration::from_secs(10)).unwrap();

    let admitted = (0..10).filter(|_| limiter.try_admit(&keys(&["a"]))).count();
    assert_eq!(admitted, 3);
    assert_eq!(limiter.hit_count("a"), 3);

    // Still inside the window: nothing more gets through.
    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(!limiter.try_admit(&keys(&["a"])));

    // The first three hits age out together.
    tokio::time::advance(Duration::from_secs(1)).await;
    let admitted = (0..10).filter(|_| limiter.try_admit(&keys(&["a"]))).count();
    assert_eq!(admitted, 3);
}

#[tokio::test(start_paused = true)]
async fn window_slides_per_hit() {
    let limiter = RateLimiter::new();
    limiter.set_rule("a", 2, Duration::from_secs(1)).unwrap();

    assert!(limiter.try_admit(&keys(&["a"])));
    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(limiter.try_admit(&keys(&["a"])));
    assert!(!limiter.try_admit(&keys(&["a"])));
    assert_eq!(
        limiter.next_available(&keys(&["a"])),
        Duration::from_millis(400)
    );

    tokio::time::advance(Duration::from_millis(400)).await;
    assert!(limiter.try_admit(&keys(&["a"])));
    assert!(!limiter.try_admit(&keys(&["a"])));
}

#[tokio::test(start_paused = true)]
async fn admission_is_all_or_nothing() {
    let limiter = RateLimiter::new();
    limiter.set_rule("open", 5, Duration::from_secs(10)).unwrap();
    limiter.set_rule("full", 1, Duration::from_secs(10)).unwrap();
    assert!(limiter.try_admit(&keys(&["full"])));

    assert!(!limiter.try_admit(&keys(&["open", "full"])));
    assert_eq!(limiter.hit_count("open"), 0);
    assert_eq!(limiter.hit_count("full"), 1);
}

#[test]
fn keys_without_rules_are_unconstrained() {
    let limiter = RateLimiter::new();
    for _ in 0..100 {
        assert!(limiter.try_admit(&keys(&["nobody-configured-me"])));
    }
    assert_eq!(limiter.next_available(&keys(&["nobody-configured-me"])), Duration::ZERO);
    assert!(limiter.try_admit(&BTreeSet::new()));
}

#[tokio::test(start_paused = true)]
async fn shared_key_limits_across_key_sets() {
    let limiter = RateLimiter::new();
    limiter.set_rule("shared", 1, Duration::from_secs(5)).unwrap();
    limiter.set_rule("mine", 10, Duration::from_secs(5)).unwrap();

    assert!(limiter.try_admit(&keys(&["shared", "mine"])));
    assert!(!limiter.try_admit(&keys(&["shared"])));
    assert!(limiter.try_admit(&keys(&["mine"])));
    assert_eq!(limiter.hit_count("mine"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_respect_the_rule() {
    let limiter = std::sync::Arc::new(RateLimiter::new());
    limiter.set_rule("a", 5, Duration::from_secs(60)).unwrap();
    limiter.set_rule("b", 50, Duration::from_secs(60)).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let limiter = std::sync::Arc::clone(&limiter);
        tasks.push(tokio::spawn(async move {
            limiter.try_admit(&keys(&["a", "b"]))
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(limiter.hit_count("a"), 5);
    assert_eq!(limiter.hit_count("b"), 5);
}

// ---------------------------------------------------------------------------
// Next available
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn next_available_counts_down_to_zero_at_window_edge() {
    let limiter = RateLimiter::new();
    limiter.set_rule("a", 1, Duration::from_secs(1)).unwrap();
    assert!(limiter.try_admit(&keys(&["a"])));

    let mut last = limiter.next_available(&keys(&["a"]));
    assert_eq!(last, Duration::from_secs(1));

    for _ in 0..3 {
        tokio::time::advance(Duration::from_millis(300)).await;
        let next = limiter.next_available(&keys(&["a"]));
        assert!(next < last, "{next:?} should be less than {last:?}");
        last = next;
    }
    assert_eq!(last, Duration::from_millis(100));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(limiter.next_available(&keys(&["a"])), Duration::ZERO);
    assert!(limiter.try_admit(&keys(&["a"])));
}

#[tokio::test(start_paused = true)]
async fn next_available_is_max_across_keys() {
    let limiter = RateLimiter::new();
    limiter.set_rule("short", 1, Duration::from_secs(1)).unwrap();
    limiter.set_rule("long", 1, Duration::from_secs(10)).unwrap();
    assert!(limiter.try_admit(&keys(&["short", "long"])));

    assert_eq!(
        limiter.next_available(&keys(&["short", "long", "unknown"])),
        Duration::from_secs(10)
    );
}

#[tokio::test(start_paused = true)]
async fn next_available_uses_oldest_blocking_hit() {
    let limiter = RateLimiter::new();
    limiter.set_rule("a", 2, Duration::from_secs(10)).unwrap();

    assert!(limiter.try_admit(&keys(&["a"])));
    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(limiter.try_admit(&keys(&["a"])));

    // The first hit leaves the window 6 seconds from now.
    assert_eq!(limiter.next_available(&keys(&["a"])), Duration::from_secs(6));
}
