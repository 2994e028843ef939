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

use std::{collections::BTreeSet, time::Duration};

use staking_indexer::{
    actions::{ActionKind, ActionTag, StakingAction},
    block::{Block, Certificate, Transaction, Withdrawal},
    credential::CredentialKind,
    db::staking::StakingIndexerDb,
    BlockContext, IndexerError,
};

use super::common::{self, block, cert_tx, hash, key_address, key_cred, pool, tx_id, MockSource};

const IN_SYNC: BlockContext = BlockContext { in_sync: true, store_block: true };
const CATCHING_UP: BlockContext = BlockContext { in_sync: false, store_block: true };

#[tokio::test(start_paused = true)]
async fn test_registration_of_watched_credential() {
    let mut ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    let block = block(
        1000,
        vec![cert_tx(0, vec![Certificate::StakeRegistration { credential: key_cred(1) }])],
    );
    let extraction = ctx.indexer.process_block(&block, IN_SYNC).await.unwrap();

    let expected = StakingAction {
        credential: hash(1),
        action: ActionKind::Register,
        slot: 1000,
        tx_id: tx_id(0),
        tx_index: 0,
        action_index: 0,
    };
    assert_eq!(extraction.actions, vec![expected]);
    assert_eq!(*ctx.db.actions.lock().unwrap(), vec![expected]);
    assert!(ctx.db.blocks.lock().unwrap().contains_key(&1000));
    assert_eq!(ctx.indexer.watched_count(), 1);

    let report = common::next_report(&mut ctx.reports).await;
    assert!(!report.full);
    assert_eq!(report.addresses, vec![key_address(1)]);

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_logs_without_reloading() {
    let ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.batch_watch([hash(1), hash(2)], CredentialKind::Key);
    ctx.indexer.start().unwrap();

    let tx = Transaction {
        id: tx_id(7),
        withdrawals: vec![Withdrawal { address: key_address(1), amount: 5_000 }],
        certificates: vec![Certificate::StakeDelegation { delegator: key_cred(2), pool: pool(3) }],
    };
    let extraction = ctx.indexer.process_block(&block(20, vec![tx]), CATCHING_UP).await.unwrap();

    assert_eq!(extraction.affected, BTreeSet::from([hash(1), hash(2)]));
    let logged: Vec<_> = ctx
        .db
        .actions
        .lock()
        .unwrap()
        .iter()
        .map(|a| (a.credential, a.action, a.action_index))
        .collect();
    assert_eq!(
        logged,
        vec![
            (hash(1), ActionKind::Withdraw { amount: 5_000 }, 0),
            (hash(2), ActionKind::Delegate { pool: pool(3) }, 1),
        ]
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(ctx.source.calls().is_empty());

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_block_without_watched_actions_is_not_stored() {
    let ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.watch(hash(1), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    let unwatched = block(
        30,
        vec![cert_tx(
            0,
            vec![
                Certificate::StakeRegistration { credential: key_cred(9) },
                Certificate::Other,
            ],
        )],
    );
    let extraction = ctx.indexer.process_block(&unwatched, IN_SYNC).await.unwrap();
    assert!(extraction.is_empty());

    assert!(ctx.indexer.process_block(&block(31, vec![]), IN_SYNC).await.unwrap().is_empty());

    assert!(ctx.db.blocks.lock().unwrap().is_empty());
    assert!(ctx.db.actions.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(ctx.source.calls().is_empty());

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deregistration_unwatches_after_reload() {
    let source = MockSource::new();
    source.set_account(key_address(4), None, 250);
    let mut ctx = common::test_indexer(common::test_config(), source);
    ctx.indexer.watch(hash(4), CredentialKind::Key);
    ctx.indexer.start().unwrap();

    let block = block(
        40,
        vec![cert_tx(1, vec![Certificate::StakeDeregistration { credential: key_cred(4) }])],
    );
    let extraction = ctx.indexer.process_block(&block, IN_SYNC).await.unwrap();
    assert_eq!(extraction.deregistered, vec![hash(4)]);

    // Still resolvable until the reload it triggered has merged.
    assert!(ctx.indexer.is_hash_watched(&hash(4)));

    let report = common::next_report(&mut ctx.reports).await;
    assert_eq!(report.addresses, vec![key_address(4)]);
    assert!(!ctx.indexer.is_hash_watched(&hash(4)));
    assert_eq!(ctx.db.states.lock().unwrap()[&hash(4)].rewards, 250);
    assert_eq!(
        ctx.db.latest_action_kinds().await.unwrap(),
        vec![(hash(4), ActionTag::Deregister)]
    );

    ctx.indexer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_actions_require_their_block() {
    let ctx = common::test_indexer(common::test_config(), MockSource::new());
    ctx.indexer.watch(hash(1), CredentialKind::Key);

    let block = block(
        50,
        vec![cert_tx(0, vec![Certificate::StakeRegistration { credential: key_cred(1) }])],
    );
    let result = ctx
        .indexer
        .process_block(&block, BlockContext { in_sync: false, store_block: false })
        .await;
    assert!(matches!(result, Err(IndexerError::Db(_))));

    ctx.indexer.process_block(&block, CATCHING_UP).await.unwrap();
    assert_eq!(ctx.db.actions.lock().unwrap().len(), 1);
}

#[test]
fn test_block_from_json() {
    let json = format!(
        r#"{{
            "header": {{ "slot": 1000, "hash": "{block_hash}" }},
            "transactions": [{{
                "id": "{tx}",
                "withdrawals": [{{ "address": "{address}", "amount": 12 }}],
                "certificates": [
                    {{ "type": "stake_delegation",
                       "delegator": {{ "kind": "key", "hash": "{hash}" }},
                       "pool": "{pool}" }},
                    {{ "type": "pool_retirement", "pool": "{pool}", "epoch": 300 }}
                ]
            }}]
        }}"#,
        block_hash = "ab".repeat(32),
        tx = tx_id(2),
        address = key_address(1),
        hash = hash(1),
        pool = pool(5),
    );

    let block: Block = serde_json::from_str(&json).unwrap();
    assert_eq!(block.header.slot, 1000);
    let tx = &block.transactions[0];
    assert_eq!(tx.id, tx_id(2));
    assert_eq!(tx.withdrawals, vec![Withdrawal { address: key_address(1), amount: 12 }]);
    assert_eq!(
        tx.certificates,
        vec![
            Certificate::StakeDelegation { delegator: key_cred(1), pool: pool(5) },
            Certificate::Other,
        ]
    );
}
