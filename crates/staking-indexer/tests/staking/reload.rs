// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::BTreeSet, sync::atomic::Ordering, time::Duration};

use staking_indexer::{credential::CredentialKind, source::AccountSummary, IndexerError};
use tracing_test::traced_test;

use super::common::{self, hash, key_address, pool, script_address, MockSource};

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_burst_within_window_is_one_reload() {
    let mut ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.batch_watch([hash(1), hash(2), hash(3)], CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(Some(&[hash(1)]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.indexer.reload(Some(&[hash(2)]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.indexer.reload(Some(&[hash(1), hash(3)]));

    let report = common::next_report(&mut ctx.reports).await;
    assert!(!report.full);
    assert_eq!(
        report.addresses.iter().copied().collect::<BTreeSet<_>>(),
        BTreeSet::from([key_address(1), key_address(2), key_address(3)])
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_reload_absorbs_selective_request() {
    let mut ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.batch_watch([hash(1), hash(2), hash(3)], CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(None);
    ctx.indexer.reload(Some(&[hash(2)]));

    let report = common::next_report(&mut ctx.reports).await;
    assert!(report.full);
    assert_eq!(report.addresses.len(), 3);
    assert_eq!(ctx.source.calls().len(), 1);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_selective_requests_wait_for_periodic_reload_when_not_dynamic() {
    let mut config = common::test_config();
    config.reload_dynamically = false;
    config.periodic_reload = Duration::from_secs(6);
    let mut ctx = common::test_indexer(config, MockSource::new());
    ctx.indexer.batch_watch([hash(1), hash(2)], CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(Some(&[hash(1)]));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(ctx.source.calls().is_empty());

    let report = common::next_report(&mut ctx.reports).await;
    assert!(report.full);
    assert_eq!(report.addresses.len(), 2);

    ctx.indexer.toggle_reload_dynamically(true);
    ctx.indexer.reload(Some(&[hash(2)]));
    let report = common::next_report(&mut ctx.reports).await;
    assert_eq!(report.addresses, vec![key_address(2)]);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unwatch_is_finalized_by_reload() {
    let source = MockSource::new();
    source.set_account(key_address(1), Some(pool(7)), 1_000);
    source.set_tip(500);
    let mut ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    assert!(ctx.indexer.unwatch(&hash(1)));
    assert!(!ctx.indexer.unwatch(&hash(9)));
    assert_eq!(ctx.indexer.from_hash(&hash(1)), Some(key_address(1)));
    assert!(ctx.indexer.is_address_watched(&key_address(1)));

    ctx.indexer.reload(Some(&[hash(1)]));
    common::next_report(&mut ctx.reports).await;

    assert!(!ctx.indexer.is_hash_watched(&hash(1)));
    assert_eq!(ctx.indexer.from_address(&key_address(1)), None);
    let state = ctx.db.states.lock().unwrap().get(&hash(1)).cloned().unwrap();
    assert_eq!(state.rewards, 1_000);
    assert_eq!(state.delegated_pool, Some(pool(7)));
    assert_eq!(state.observed_slot, 500);

    // A removed credential is skipped by later selective reloads.
    ctx.indexer.reload(Some(&[hash(1)]));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_one_unit_waits_behind_in_flight_reload() {
    let mut ctx = common::test_indexer(common::test_config(), MockSource::blocking());
    ctx.indexer.batch_watch([hash(1), hash(2), hash(3)], CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(Some(&[hash(1)]));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    // Both firings land while the first reload is blocked; the second is folded into the first
    // waiting unit.
    ctx.indexer.reload(Some(&[hash(2)]));
    tokio::time::sleep(Duration::from_millis(300)).await;
    ctx.indexer.reload(Some(&[hash(3)]));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    ctx.source.release(2);
    let first = common::next_report(&mut ctx.reports).await;
    let second = common::next_report(&mut ctx.reports).await;
    assert_eq!(first.addresses, vec![key_address(1)]);
    assert_eq!(
        second.addresses.iter().copied().collect::<BTreeSet<_>>(),
        BTreeSet::from([key_address(2), key_address(3)])
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.source.calls().len(), 2);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_reload() {
    let source = MockSource::blocking();
    source.set_account(key_address(1), None, 42);
    let ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(None);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    let indexer = ctx.indexer.clone();
    let stop = tokio::spawn(async move { indexer.stop().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stop.is_finished());
    assert!(!ctx.source.closed.load(Ordering::SeqCst));

    ctx.source.release(1);
    stop.await.unwrap().unwrap();

    assert_eq!(ctx.db.states.lock().unwrap()[&hash(1)].rewards, 42);
    assert!(ctx.source.closed.load(Ordering::SeqCst));
    assert!(!ctx.indexer.is_running());
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_failed_reload_stops_indexer() {
    let source = MockSource::new();
    source.fail.store(true, Ordering::SeqCst);
    let ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(None);
    tokio::time::timeout(Duration::from_secs(5), ctx.indexer.stopped())
        .await
        .expect("indexer did not stop");

    assert!(!ctx.indexer.is_running());
    assert!(ctx.db.states.lock().unwrap().is_empty());
    assert!(matches!(ctx.indexer.stop().await, Err(IndexerError::Source(_))));

    // Requests made while stopped are ignored.
    ctx.indexer.reload(None);
    assert!(ctx.indexer.flush().await.unwrap().is_none());
    assert_eq!(ctx.source.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_work_is_discarded_after_stop() {
    let mut config = common::test_config();
    config.reload_dynamically = false;
    let ctx = common::test_indexer(config, MockSource::new());
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(Some(&[hash(1)]));
    ctx.indexer.stop().await.unwrap();
    assert!(ctx.indexer.flush().await.unwrap().is_none());

    ctx.indexer.start().unwrap();
    assert!(ctx.indexer.flush().await.unwrap().is_none());
    assert!(ctx.source.calls().is_empty());
    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_flush_runs_pending_reload_immediately() {
    let source = MockSource::new();
    source.set_account(key_address(2), Some(pool(1)), 9);
    let ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.batch_watch([hash(1), hash(2)], CredentialKind::Key);
    ctx.indexer.start().unwrap();
    assert!(matches!(ctx.indexer.start(), Err(IndexerError::AlreadyRunning)));

    ctx.indexer.reload(Some(&[hash(2)]));
    let report = ctx.indexer.flush().await.unwrap().expect("nothing reloaded");
    assert_eq!(report.addresses, vec![key_address(2)]);
    assert_eq!(ctx.db.states.lock().unwrap()[&hash(2)].rewards, 9);

    // The debounce firing finds nothing left to do.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.source.calls().len(), 1);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_unrequested_address_is_stored_under_its_own_hash() {
    let source = MockSource::new();
    source.at_origin.store(true, Ordering::SeqCst);
    source
        .unrequested
        .lock()
        .unwrap()
        .push((script_address(8), AccountSummary { delegated_pool: Some(pool(2)), rewards: 77 }));
    let ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    ctx.indexer.reload(None);
    let report = ctx.indexer.flush().await.unwrap().expect("nothing reloaded");
    assert_eq!(report.addresses, vec![key_address(1)]);

    let states = ctx.db.states.lock().unwrap().clone();
    assert_eq!(states.len(), 2);
    let stray = &states[&hash(8)];
    assert_eq!(stray.reward_address, script_address(8));
    assert_eq!(stray.rewards, 77);
    // A tip at the chain origin tags the run with slot 0.
    assert_eq!(stray.observed_slot, 0);
    assert_eq!(states[&hash(1)].observed_slot, 0);

    assert!(logs_contain("is not watched"));
    assert!(!ctx.indexer.is_hash_watched(&hash(8)));
    assert!(ctx.indexer.is_running());

    ctx.indexer.stop().await.unwrap();
}
