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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    block::TxId,
    credential::{PoolId, StakingHash},
};

/// A staking action observed on chain, with its kind-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Withdraw { amount: u64 },
    Register,
    Delegate { pool: PoolId },
    Deregister,
}

/// Payload-free discriminant of [ActionKind], as stored in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionTag {
    Withdraw,
    Register,
    Delegate,
    Deregister,
}

impl ActionKind {
    pub fn tag(&self) -> ActionTag {
        match self {
            ActionKind::Withdraw { .. } => ActionTag::Withdraw,
            ActionKind::Register => ActionTag::Register,
            ActionKind::Delegate { .. } => ActionTag::Delegate,
            ActionKind::Deregister => ActionTag::Deregister,
        }
    }
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Withdraw => "withdraw",
            ActionTag::Register => "register",
            ActionTag::Delegate => "delegate",
            ActionTag::Deregister => "deregister",
        }
    }
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "withdraw" => Ok(ActionTag::Withdraw),
            "register" => Ok(ActionTag::Register),
            "delegate" => Ok(ActionTag::Delegate),
            "deregister" => Ok(ActionTag::Deregister),
            other => Err(format!("unknown staking action kind: {other}")),
        }
    }
}

/// One row of the append-only staking action log.
///
/// Rows are ordered by `(slot, tx_index, action_index)`, which is chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingAction {
    pub credential: StakingHash,
    pub action: ActionKind,
    pub slot: u64,
    pub tx_id: TxId,
    /// Position of the transaction within its block.
    pub tx_index: u32,
    /// Position of the action among those emitted for the same transaction.
    pub action_index: u32,
}
