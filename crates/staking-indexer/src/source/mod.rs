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

//! The authoritative ledger state queried during reloads.

pub mod rpc;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    block::BlockHash,
    credential::{PoolId, RewardAddress},
};

pub use rpc::JsonRpcStateSource;

pub type StateSourceObj = Arc<dyn StateSource + Send + Sync>;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("transport error {0:?}")]
    Transport(#[from] reqwest::Error),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid response: {0}")]
    BadResponse(String),
}

/// Most recent block the state source considers canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerTip {
    Origin,
    At { slot: u64, hash: BlockHash },
}

impl LedgerTip {
    /// Slot snapshots are tagged with; the origin counts as slot 0.
    pub fn slot(&self) -> u64 {
        match self {
            LedgerTip::Origin => 0,
            LedgerTip::At { slot, .. } => *slot,
        }
    }
}

/// Delegation and reward state of one reward address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountSummary {
    pub delegated_pool: Option<PoolId>,
    /// Reward balance in lovelace.
    pub rewards: u64,
}

#[async_trait]
pub trait StateSource {
    async fn ledger_tip(&self) -> Result<LedgerTip, SourceError>;

    /// Summaries for `addresses`. Addresses unknown to the ledger may be omitted.
    async fn delegations_and_rewards(
        &self,
        addresses: &[RewardAddress],
    ) -> Result<BTreeMap<RewardAddress, AccountSummary>, SourceError>;

    /// Releases the underlying connection. Called once, after the last reload finished.
    async fn close(&self) {}
}
