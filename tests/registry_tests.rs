use std::time::Duration;

use gradegrid::scheduler::{AssignmentRegistry, RETRY_CAP};

fn registry(keys: &[&str]) -> AssignmentRegistry {
    AssignmentRegistry::new(keys.iter().map(|k| k.to_string()).collect())
}

#[test]
fn test_pop_is_fifo_and_drains() {
    let reg = registry(&["alice", "bob"]);
    assert_eq!(reg.total(), 2);

    assert_eq!(reg.pop_next().as_deref(), Some("alice"));
    assert_eq!(reg.pop_next().as_deref(), Some("bob"));
    assert_eq!(reg.pop_next(), None);
}

#[test]
fn test_result_completes_the_run() {
    let reg = registry(&["alice"]);
    assert!(!reg.done());

    let key = reg.pop_next().unwrap();
    reg.mark_assigned(&key);
    assert_eq!(reg.attempts(&key), 1);
    assert!(!reg.done());

    reg.on_result(&key);
    assert!(reg.done());
}

#[test]
fn test_result_is_idempotent() {
    let reg = registry(&["alice", "bob"]);
    reg.on_result("alice");
    reg.on_result("alice");
    reg.on_result("alice");

    // One key finished three times over still leaves the other pending.
    assert!(!reg.done());
    reg.on_result("bob");
    assert!(reg.done());
}

#[test]
fn test_timeout_requeues_unfinished_key() {
    let reg = registry(&["alice"]);
    let key = reg.pop_next().unwrap();
    reg.mark_assigned(&key);

    // Dispatch deadline expired with no result: failed, back in the queue.
    assert!(reg.on_timeout(&key));
    assert_eq!(reg.pop_next().as_deref(), Some("alice"));
}

#[test]
fn test_timeout_after_result_is_a_noop() {
    let reg = registry(&["alice"]);
    let key = reg.pop_next().unwrap();
    reg.mark_assigned(&key);
    reg.on_result(&key);

    // A late alarm for an already-finished dispatch must not fail it.
    assert!(!reg.on_timeout(&key));
    assert_eq!(reg.pop_next(), None);
    assert!(reg.done());
}

#[test]
fn test_retry_cap_exhausts_key() {
    let reg = registry(&["alice"]);

    let mut failures = 0;
    for _ in 0..RETRY_CAP {
        let key = reg.pop_next().expect("key should be dispatchable");
        reg.mark_assigned(&key);
        if reg.on_timeout(&key) {
            failures += 1;
        }
    }

    // Three dispatches, three failures, no fourth dispatch.
    assert_eq!(failures, 3);
    assert_eq!(reg.attempts("alice"), RETRY_CAP);
    assert_eq!(reg.pop_next(), None);
    assert!(reg.done(), "an exhausted key counts toward completion");
}

#[test]
fn test_attempts_never_exceed_cap() {
    let reg = registry(&["alice"]);
    for _ in 0..10 {
        if let Some(key) = reg.pop_next() {
            reg.mark_assigned(&key);
            reg.on_timeout(&key);
        }
    }
    assert!(reg.attempts("alice") <= RETRY_CAP);
}

#[test]
fn test_late_result_beats_exhaustion() {
    let reg = registry(&["alice"]);
    for _ in 0..RETRY_CAP {
        let key = reg.pop_next().unwrap();
        reg.mark_assigned(&key);
        reg.on_timeout(&key);
    }
    assert!(reg.done());

    // A straggler result after exhaustion still lands; done stays true.
    reg.on_result("alice");
    assert!(reg.done());
    assert_eq!(reg.pop_next(), None);
}

#[test]
fn test_done_is_monotone() {
    let reg = registry(&["alice", "bob"]);
    reg.on_result("alice");
    reg.on_result("bob");
    assert!(reg.done());

    // Nothing that happens afterwards may flip it back.
    reg.on_timeout("alice");
    assert!(reg.done());
}

#[test]
fn test_zero_assignments_is_done_from_the_start() {
    let reg = registry(&[]);
    assert!(reg.done());
    assert_eq!(reg.pop_next(), None);
}

#[tokio::test]
async fn test_wait_for_done_wakes_on_last_result() {
    let reg = std::sync::Arc::new(registry(&["alice"]));

    let waiter = {
        let reg = reg.clone();
        tokio::spawn(async move { reg.wait_for_done().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    reg.on_result("alice");
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake once the run is done")
        .unwrap();
}

#[tokio::test]
async fn test_wait_for_done_returns_immediately_when_empty() {
    let reg = registry(&[]);
    tokio::time::timeout(Duration::from_secs(1), reg.wait_for_done())
        .await
        .expect("empty registry is done at construction");
}
