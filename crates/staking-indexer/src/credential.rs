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

//! Staking credentials, reward addresses and the derivation between them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a Blake2b-224 credential or pool hash.
pub const HASH_LEN: usize = 28;

/// Length of a reward address: one header byte followed by the credential hash.
pub const REWARD_ADDRESS_LEN: usize = HASH_LEN + 1;

#[derive(Error, Debug, PartialEq)]
pub enum HexBytesError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

macro_rules! hex_bytes_newtype {
    ($name:ident, $len:expr) => {
        impl $name {
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = $crate::credential::HexBytesError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                let array: [u8; $len] =
                    bytes.try_into().map_err(|_| $crate::credential::HexBytesError::Length {
                        expected: $len,
                        actual: bytes.len(),
                    })?;
                Ok(Self(array))
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::credential::HexBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s.trim_start_matches("0x"))?;
                Self::try_from(bytes.as_slice())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl ::serde::Serialize for $name {
            fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                let s = <String as ::serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(::serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use hex_bytes_newtype;

/// Hash identifying a staking authority, either a key hash or a script hash.
///
/// Key and script hashes share this one space. Once stored, the kind a hash was watched with is
/// not recoverable from the hash alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StakingHash([u8; HASH_LEN]);

hex_bytes_newtype!(StakingHash, HASH_LEN);

/// Stake pool identifier (pool operator key hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId([u8; HASH_LEN]);

hex_bytes_newtype!(PoolId, HASH_LEN);

/// Ledger address used to query delegation and reward state for a credential.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RewardAddress([u8; REWARD_ADDRESS_LEN]);

hex_bytes_newtype!(RewardAddress, REWARD_ADDRESS_LEN);

impl RewardAddress {
    /// Credential hash embedded in the address body.
    pub fn staking_hash(&self) -> StakingHash {
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&self.0[1..]);
        StakingHash(hash)
    }

    /// Credential kind encoded in the header byte.
    pub fn kind(&self) -> CredentialKind {
        if self.0[0] & 0x10 == 0 {
            CredentialKind::Key
        } else {
            CredentialKind::Script
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Key,
    Script,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn id(&self) -> u8 {
        match self {
            Network::Mainnet => 1,
            Network::Testnet => 0,
        }
    }
}

/// Derives the reward address of a credential.
///
/// Header nibble `0b1110` marks a key-hash credential and `0b1111` a script-hash credential; the
/// low nibble carries the network id.
pub fn derive_reward_address(
    network: Network,
    kind: CredentialKind,
    hash: &StakingHash,
) -> RewardAddress {
    let kind_bits: u8 = match kind {
        CredentialKind::Key => 0xe0,
        CredentialKind::Script => 0xf0,
    };

    let mut bytes = [0u8; REWARD_ADDRESS_LEN];
    bytes[0] = kind_bits | network.id();
    bytes[1..].copy_from_slice(hash.as_bytes());
    RewardAddress(bytes)
}
