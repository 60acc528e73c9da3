
use std::time::Duration;

use alloy::primitives::aliases::U192;
use fixtures::*;
use submitter_executors::executor::{AssignmentError, ExecutorAssignment};

const TTL: Duration = Duration::from_secs(30);

fn job_count(assignment: &ExecutorAssignment, executor: alloy::primitives::Address) -> u64 {
    assignment
        .stats()
        .into_iter()
        .find(|slot| slot.address == executor)
        .map(|slot| slot.job_count)
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_is_rejected() {
    let result = ExecutorAssignment::new(Vec::new(), TTL);
    assert!(matches!(result, Err(AssignmentError::NoExecutors)));
}

#[tokio::test(start_paused = true)]
async fn test_track_sticks_to_its_executor() {
    setup_tracing();
    let executors = [account(0xe1), account(0xe2)];
    let assignment = ExecutorAssignment::new(executors, TTL).unwrap();

    let first = assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();
    let second = assignment.get(tx_hash(2), account(1), U192::ZERO).unwrap();

    assert_eq!(first, second);
    assert_eq!(job_count(&assignment, first), 2);
    assert_eq!(assignment.assigned(account(1), U192::ZERO), Some(first));
}

#[tokio::test(start_paused = true)]
async fn test_new_tracks_go_to_least_loaded_executor() {
    let executors = [account(0xe1), account(0xe2)];
    let assignment = ExecutorAssignment::new(executors, TTL).unwrap();

    let a = assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();
    let b = assignment.get(tx_hash(2), account(2), U192::ZERO).unwrap();
    assert_ne!(a, b);

    // Different nonce tracks of one account are independent
    let c = assignment.get(tx_hash(3), account(1), U192::from(1)).unwrap();
    assert!(executors.contains(&c));
    assert_eq!(job_count(&assignment, account(0xe1)) + job_count(&assignment, account(0xe2)), 3);
}

#[tokio::test(start_paused = true)]
async fn test_same_hash_counts_once() {
    let assignment = ExecutorAssignment::new([account(0xe1)], TTL).unwrap();

    assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();
    assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    assert_eq!(job_count(&assignment, account(0xe1)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_assignment_expires_after_ttl() {
    let assignment = ExecutorAssignment::new([account(0xe1), account(0xe2)], TTL).unwrap();
    let executor = assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    tokio::time::sleep(TTL + Duration::from_millis(1)).await;

    assert_eq!(job_count(&assignment, executor), 0);
    assert_eq!(assignment.assigned(account(1), U192::ZERO), None);
}

#[tokio::test(start_paused = true)]
async fn test_seeing_a_hash_again_extends_its_ttl() {
    let assignment = ExecutorAssignment::new([account(0xe1)], TTL).unwrap();
    assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    // Past the original expiry, still inside the refreshed one
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(job_count(&assignment, account(0xe1)), 1);
    assert!(assignment.assigned(account(1), U192::ZERO).is_some());

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(job_count(&assignment, account(0xe1)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_track_kept_while_any_hash_lives() {
    let assignment = ExecutorAssignment::new([account(0xe1), account(0xe2)], TTL).unwrap();
    let executor = assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    tokio::time::sleep(Duration::from_secs(20)).await;
    assignment.get(tx_hash(2), account(1), U192::ZERO).unwrap();

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(job_count(&assignment, executor), 1);
    assert_eq!(assignment.assigned(account(1), U192::ZERO), Some(executor));
}

#[tokio::test(start_paused = true)]
async fn test_registering_executor_later() {
    let assignment = ExecutorAssignment::new([account(0xe1)], TTL).unwrap();
    assignment.get(tx_hash(1), account(1), U192::ZERO).unwrap();

    assert!(assignment.register_executor(account(0xe2)));
    assert!(!assignment.register_executor(account(0xe2)));

    let next = assignment.get(tx_hash(2), account(2), U192::ZERO).unwrap();
    assert_eq!(next, account(0xe2));
}
