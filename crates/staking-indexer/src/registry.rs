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

//! The watch set: credentials of interest and their reward addresses.

use std::collections::{BTreeSet, HashMap};

use crate::credential::{derive_reward_address, CredentialKind, Network, RewardAddress, StakingHash};

/// Bidirectional credential <-> reward address map.
///
/// `by_hash` and `by_address` are always exact inverses over the same key set. Unwatching is
/// deferred: a credential stays resolvable until [Registry::finalize_removal] runs for it, which
/// the reload executor does once the credential's final snapshot has been fetched.
#[derive(Debug, Default)]
pub struct Registry {
    network: Network,
    by_hash: HashMap<StakingHash, RewardAddress>,
    by_address: HashMap<RewardAddress, StakingHash>,
    pending_removal: BTreeSet<StakingHash>,
}

impl Registry {
    pub fn new(network: Network) -> Self {
        Self { network, ..Default::default() }
    }

    /// Starts watching `hash`, returning its reward address.
    ///
    /// Re-watching a credential replaces its address (a kind change) and cancels any pending
    /// removal.
    pub fn watch(&mut self, hash: StakingHash, kind: CredentialKind) -> RewardAddress {
        let address = derive_reward_address(self.network, kind, &hash);
        if let Some(previous) = self.by_hash.insert(hash, address) {
            self.by_address.remove(&previous);
        }
        self.by_address.insert(address, hash);
        self.pending_removal.remove(&hash);
        address
    }

    pub fn batch_watch(
        &mut self,
        hashes: impl IntoIterator<Item = StakingHash>,
        kind: CredentialKind,
    ) -> usize {
        hashes.into_iter().map(|hash| self.watch(hash, kind)).count()
    }

    /// Marks `hash` for removal after its next reload. Returns whether it is currently watched.
    pub fn unwatch(&mut self, hash: &StakingHash) -> bool {
        if !self.by_hash.contains_key(hash) {
            return false;
        }
        self.pending_removal.insert(*hash);
        true
    }

    /// Drops `hash` from both maps if it was marked for removal. Returns whether it was removed.
    pub fn finalize_removal(&mut self, hash: &StakingHash) -> bool {
        if !self.pending_removal.remove(hash) {
            return false;
        }
        if let Some(address) = self.by_hash.remove(hash) {
            self.by_address.remove(&address);
        }
        true
    }

    pub fn is_pending_removal(&self, hash: &StakingHash) -> bool {
        self.pending_removal.contains(hash)
    }

    pub fn pending_removals(&self) -> impl Iterator<Item = &StakingHash> {
        self.pending_removal.iter()
    }

    pub fn address_of(&self, hash: &StakingHash) -> Option<RewardAddress> {
        self.by_hash.get(hash).copied()
    }

    pub fn hash_of(&self, address: &RewardAddress) -> Option<StakingHash> {
        self.by_address.get(address).copied()
    }

    pub fn is_watched(&self, hash: &StakingHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn is_watched_address(&self, address: &RewardAddress) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &RewardAddress> {
        self.by_hash.values()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.by_address.clear();
        self.pending_removal.clear();
    }
}
