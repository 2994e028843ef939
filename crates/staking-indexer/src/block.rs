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

//! Blocks as delivered by the chain follower, reduced to what staking indexing reads.

use serde::{Deserialize, Serialize};

use crate::credential::{hex_bytes_newtype, CredentialKind, PoolId, RewardAddress, StakingHash};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId([u8; 32]);

hex_bytes_newtype!(TxId, 32);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

hex_bytes_newtype!(BlockHash, 32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub slot: u64,
    pub hash: BlockHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    /// Withdrawn amounts in lovelace, keyed by reward address, in body order.
    #[serde(default)]
    pub withdrawals: Vec<Withdrawal>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub address: RewardAddress,
    pub amount: u64,
}

/// A staking credential as it appears inside a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StakeCredential {
    pub kind: CredentialKind,
    pub hash: StakingHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Certificate {
    StakeRegistration { credential: StakeCredential },
    StakeDeregistration { credential: StakeCredential },
    StakeDelegation { delegator: StakeCredential, pool: PoolId },
    /// Pool, governance and genesis certificates carry nothing staking indexing reads.
    #[serde(other)]
    Other,
}
