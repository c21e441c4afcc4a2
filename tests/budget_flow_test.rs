//! Creditor and debitor integration tests.
//!
//! Tests:
//! - Credit, partial claim, flush and full claim on one budget
//! - Table exhaustion, duplicate acquire, release and reacquire
//! - Child budgets and linger cleanup
//! - File-backed tables attached by a second mapping

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{budget_id, counting_flusher, creditor, debitor, layout, TestFixture};
use creditflow::budget::{BudgetIndex, BudgetsLayout, NO_BUDGET_INDEX};

#[test]
fn test_credit_claim_flush_scenario() {
    let layout = layout(8);
    let (mut creditor, flushes) = creditor(0, &layout, Duration::ZERO);
    let mut debitor = debitor(3, 0, &layout);

    let index = creditor.acquire(42).unwrap();
    assert_eq!(creditor.credit(1, index, 100), 0);

    let (flushed, flusher) = counting_flusher();
    assert_eq!(debitor.acquire(42, 7, flusher), Some(index));
    assert_eq!(debitor.available(index), 100);

    // Short of the maximum but above the minimum: take everything.
    assert_eq!(debitor.claim(2, index, 7, 10, 150), 100);
    assert_eq!(debitor.available(index), 0);
    assert!(debitor.is_watching(42, 7));
    assert_eq!(debitor.watchers(index), 1 << 3);

    assert_eq!(creditor.credit(3, index, 60), 0);
    let dispatched = flushes.lock().unwrap().clone();
    assert_eq!(dispatched, vec![(3, 42, 1 << 3)]);

    debitor.flush(3, 42);
    assert_eq!(flushed.load(Ordering::SeqCst), 1);

    assert_eq!(debitor.claim(4, index, 7, 10, 60), 60);
    assert!(!debitor.is_watching(42, 7));
    assert_eq!(debitor.watchers(index), 0);
    assert_eq!(debitor.available(index), 0);

    debitor.release(index, 7);
    creditor.release(index);
    assert_eq!(debitor.acquired(), 0);
    assert_eq!(creditor.acquired(), 0);
}

#[test]
fn test_claim_below_minimum_rolls_back() {
    let layout = layout(8);
    let (mut creditor, flushes) = creditor(0, &layout, Duration::ZERO);
    let mut debitor = debitor(0, 0, &layout);

    let index = creditor.acquire(9).unwrap();
    creditor.credit(1, index, 5);
    debitor.acquire(9, 1, |_| {}).unwrap();

    assert_eq!(debitor.claim(2, index, 1, 10, 20), 0);
    assert_eq!(debitor.available(index), 5);
    assert_eq!(debitor.watchers(index), 1);

    // No watcher before the bit was set, so the first credit dispatched nothing.
    assert!(flushes.lock().unwrap().is_empty());
    creditor.credit(3, index, 15);
    assert_eq!(flushes.lock().unwrap().len(), 1);

    assert_eq!(debitor.claim(4, index, 1, 10, 20), 20);
    assert_eq!(debitor.watchers(index), 0);

    debitor.release(index, 1);
    creditor.release(index);
}

#[test]
fn test_watcher_bit_shared_by_local_watchers() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);
    let mut local = debitor(1, 0, &layout);
    let mut remote = debitor(4, 0, &layout);

    let index = creditor.acquire(5).unwrap();
    local.acquire(5, 10, |_| {}).unwrap();
    local.acquire(5, 11, |_| {}).unwrap();
    remote.acquire(5, 20, |_| {}).unwrap();

    assert_eq!(local.claim(1, index, 10, 1, 8), 0);
    assert_eq!(local.claim(2, index, 11, 1, 8), 0);
    assert_eq!(remote.claim(3, index, 20, 1, 8), 0);
    assert_eq!(local.watchers(index), (1 << 1) | (1 << 4));

    creditor.credit(4, index, 100);
    assert_eq!(local.claim(5, index, 10, 1, 8), 8);
    assert_eq!(local.watchers(index), (1 << 1) | (1 << 4));

    assert_eq!(local.claim(6, index, 11, 1, 8), 8);
    assert_eq!(local.watchers(index), 1 << 4);

    remote.release(index, 20);
    assert_eq!(local.watchers(index), 0);

    local.release(index, 10);
    local.release(index, 11);
    creditor.release(index);
}

#[test]
fn test_exhaustion_at_capacity() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(2, &layout, Duration::ZERO);

    let indices: Vec<BudgetIndex> = (1..=8)
        .map(|n| creditor.acquire(budget_id(2, n)).unwrap())
        .collect();
    assert_eq!(creditor.acquired(), 8);
    assert!(indices.iter().all(|index| index.owner_index() == 2));

    assert_eq!(creditor.acquire(budget_id(2, 9)), None);

    creditor.release(indices[3]);
    assert!(creditor.acquire(budget_id(2, 9)).is_some());
    assert_eq!(creditor.acquire(budget_id(2, 10)), None);
}

#[test]
fn test_duplicate_acquire_keeps_one_slot() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);

    let first = creditor.acquire(77).unwrap();
    let second = creditor.acquire(77).unwrap();

    assert_eq!(first, second);
    assert_eq!(creditor.acquired(), 1);
    let live = layout.snapshot();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].budget_id, 77);
}

#[test]
fn test_release_then_acquire_resets_slot() {
    let layout = layout(4);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);
    let mut debitor = debitor(2, 0, &layout);

    let index = creditor.acquire(13).unwrap();
    creditor.credit(1, index, 300);
    debitor.acquire(13, 1, |_| {}).unwrap();
    assert_eq!(debitor.claim(2, index, 1, 400, 500), 0);
    assert_ne!(debitor.watchers(index), 0);

    creditor.release(index);
    assert_eq!(debitor.budget_id(index), 0);
    assert!(layout.snapshot().is_empty());

    let index = creditor.acquire(13).unwrap();
    assert_eq!(debitor.available(index), 0);
    assert_eq!(debitor.watchers(index), 0);
    assert_eq!(debitor.budget_id(index), 13);
}

#[test]
fn test_debitor_release_after_creditor_release() {
    let layout = layout(4);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);
    let mut debitor = debitor(2, 0, &layout);
    let (stale, flusher) = counting_flusher();

    let index = creditor.acquire(13).unwrap();
    debitor.acquire(13, 1, flusher).unwrap();
    assert_eq!(debitor.claim(1, index, 1, 10, 100), 0);
    assert!(debitor.is_watching(13, 1));

    creditor.release(index);
    debitor.release(index, 1);
    assert!(!debitor.is_watching(13, 1));
    assert_eq!(debitor.acquired(), 0);

    let index = creditor.acquire(13).unwrap();
    let (fresh, flusher) = counting_flusher();
    debitor.acquire(13, 2, flusher).unwrap();
    assert_eq!(debitor.claim(2, index, 2, 10, 100), 0);
    assert_eq!(debitor.watchers(index), 1 << 2);

    debitor.flush(3, 13);
    assert_eq!(stale.load(Ordering::SeqCst), 0);
    assert_eq!(fresh.load(Ordering::SeqCst), 1);
}

#[test]
fn test_debitor_acquire_unknown_budget() {
    let layout = layout(8);
    let mut debitor = debitor(0, 0, &layout);
    assert_eq!(debitor.acquire(1234, 1, |_| {}), None);
    assert_eq!(debitor.acquired(), 0);
}

#[test]
fn test_budget_index_raw_round_trip() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(5, &layout, Duration::ZERO);

    let index = creditor.acquire(budget_id(5, 1)).unwrap();
    assert_eq!(BudgetIndex::from_raw(index.as_u64()), Some(index));
    assert_eq!(BudgetIndex::from_raw(NO_BUDGET_INDEX), None);
}

#[test]
#[should_panic(expected = "outside its owner partition")]
fn test_index_from_other_partition_panics() {
    let layout = layout(8);
    let (mut owner, _flushes) = creditor(1, &layout, Duration::ZERO);
    let (other, _other_flushes) = creditor(0, &layout, Duration::ZERO);

    let index = owner.acquire(budget_id(1, 1)).unwrap();
    other.credit(1, index, 10);
}

#[test]
#[should_panic(expected = "never acquired")]
fn test_release_of_free_slot_panics() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);

    let index = creditor.acquire(1).unwrap();
    creditor.release(index);
    creditor.release(index);
}

#[test]
#[should_panic(expected = "exceeds maximum")]
fn test_claim_minimum_above_maximum_panics() {
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(0, &layout, Duration::ZERO);
    let mut debitor = debitor(0, 0, &layout);

    let index = creditor.acquire(1).unwrap();
    debitor.claim(1, index, 1, 20, 10);
}

#[test]
fn test_credit_by_unknown_id_is_ignored() {
    let layout = layout(8);
    let (mut creditor, flushes) = creditor(0, &layout, Duration::ZERO);

    creditor.credit_by_id(1, 99, 500);
    assert!(layout.snapshot().is_empty());

    let index = creditor.acquire(99).unwrap();
    creditor.credit_by_id(2, 99, 500);
    assert_eq!(layout.snapshot()[0].remaining, 500);
    assert!(flushes.lock().unwrap().is_empty());
    creditor.release(index);
}

#[test]
fn test_child_budget_lingers_before_removal() {
    let linger = Duration::from_millis(30);
    let layout = layout(8);
    let (mut creditor, _flushes) = creditor(0, &layout, linger);

    let child = creditor.supply_child(42);
    assert_ne!(child, 42);
    assert_eq!(creditor.parent_budget_id(child), Some(42));

    let scheduled = Instant::now();
    creditor.cleanup_child(child);
    assert_eq!(creditor.parent_budget_id(child), Some(42));
    assert!(creditor.next_child_cleanup().is_some());

    // Not due yet.
    assert_eq!(creditor.expire_children(scheduled), 0);
    assert_eq!(creditor.parent_budget_id(child), Some(42));

    std::thread::sleep(linger + Duration::from_millis(10));
    assert_eq!(creditor.expire_children(Instant::now()), 1);
    assert_eq!(creditor.parent_budget_id(child), None);
    assert_eq!(creditor.next_child_cleanup(), None);
}

#[test]
fn test_file_backed_table_shared_across_mappings() {
    let fixture = TestFixture::new();
    let path = fixture.table_path("budgets0");

    let created = Arc::new(BudgetsLayout::create(&path, 16).unwrap());
    let attached = Arc::new(BudgetsLayout::attach(&path).unwrap());
    assert_eq!(attached.capacity(), 16);

    let (mut creditor, _flushes) = creditor(0, &created, Duration::ZERO);
    let mut debitor = debitor(1, 0, &attached);

    let index = creditor.acquire(8).unwrap();
    creditor.credit(1, index, 1000);

    assert_eq!(debitor.acquire(8, 1, |_| {}), Some(index));
    assert_eq!(debitor.claim(2, index, 1, 100, 400), 400);
    assert_eq!(created.snapshot()[0].remaining, 600);

    created.flush().unwrap();
    debitor.release(index, 1);
    creditor.release(index);
    assert!(attached.snapshot().is_empty());
}
