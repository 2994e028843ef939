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

//! Per-block extraction of staking actions for watched credentials.

use std::collections::BTreeSet;

use crate::{
    actions::{ActionKind, StakingAction},
    block::{Block, Certificate},
    credential::StakingHash,
    registry::Registry,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Actions in chain order.
    pub actions: Vec<StakingAction>,
    /// Credentials whose snapshot is stale after this block.
    pub affected: BTreeSet<StakingHash>,
    /// Credentials deregistered in this block. The caller must unwatch them.
    pub deregistered: Vec<StakingHash>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Scans `block` for withdrawals and certificates touching credentials watched in `registry`.
///
/// Within a transaction, withdrawals come before certificates and each keeps body order.
/// Anything touching an unwatched credential is skipped.
pub fn extract_actions(registry: &Registry, block: &Block) -> Extraction {
    let mut extraction = Extraction::default();
    let slot = block.header.slot;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        let mut emitted: Vec<(StakingHash, ActionKind)> = Vec::new();

        for withdrawal in &tx.withdrawals {
            if let Some(credential) = registry.hash_of(&withdrawal.address) {
                emitted.push((credential, ActionKind::Withdraw { amount: withdrawal.amount }));
            }
        }

        for certificate in &tx.certificates {
            match certificate {
                Certificate::StakeRegistration { credential } => {
                    if registry.is_watched(&credential.hash) {
                        emitted.push((credential.hash, ActionKind::Register));
                    }
                }
                Certificate::StakeDelegation { delegator, pool } => {
                    if registry.is_watched(&delegator.hash) {
                        emitted.push((delegator.hash, ActionKind::Delegate { pool: *pool }));
                    }
                }
                Certificate::StakeDeregistration { credential } => {
                    if registry.is_watched(&credential.hash) {
                        emitted.push((credential.hash, ActionKind::Deregister));
                        extraction.deregistered.push(credential.hash);
                    }
                }
                Certificate::Other => {}
            }
        }

        for (action_index, (credential, action)) in emitted.into_iter().enumerate() {
            extraction.affected.insert(credential);
            extraction.actions.push(StakingAction {
                credential,
                action,
                slot,
                tx_id: tx.id,
                tx_index: tx_index as u32,
                action_index: action_index as u32,
            });
        }
    }

    extraction
}
