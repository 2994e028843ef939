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

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{IndexerError, ReloadReport, Shared};
use crate::{
    credential::{RewardAddress, StakingHash},
    db::StakingState,
};

impl Shared {
    /// Runs one reload over the pending work.
    ///
    /// Holds the executor gate for the whole run, so reloads never overlap and callers of the
    /// gate observe either no effect or the complete upsert. All rows of one run are tagged with
    /// the single ledger tip fetched at its start.
    pub(super) async fn execute_reload(&self) -> Result<Option<ReloadReport>, IndexerError> {
        let _gate = self.gate.lock().await;

        let (batch, full) = {
            let mut inner = self.lock();
            if !inner.running {
                let discarded = inner.pending.take();
                if !discarded.is_empty() {
                    tracing::warn!(
                        "Indexer stopped, discarding pending reload (full: {}, selective: {})",
                        discarded.full,
                        discarded.selective.len()
                    );
                }
                return Ok(None);
            }

            let work = inner.pending.take();
            let batch: Vec<RewardAddress> = if work.full {
                inner.registry.addresses().copied().collect()
            } else {
                work.selective
                    .iter()
                    .filter_map(|hash| {
                        let address = inner.registry.address_of(hash);
                        if address.is_none() {
                            tracing::warn!("No reward address for {}, skipping reload", hash);
                        }
                        address
                    })
                    .collect()
            };
            (batch, work.full)
        };

        if batch.is_empty() {
            return Ok(None);
        }

        let started = std::time::Instant::now();
        tracing::debug!("Reloading {} reward addresses (full: {})", batch.len(), full);

        let (tip, summaries) = tokio::try_join!(
            self.source.ledger_tip(),
            self.source.delegations_and_rewards(&batch)
        )?;
        let observed_slot = tip.slot();

        let (states, removed, callback) = {
            let mut inner = self.lock();
            let mut states: BTreeMap<StakingHash, StakingState> = BTreeMap::new();
            let mut removed = 0usize;

            for (address, summary) in summaries {
                let credential = match inner.registry.hash_of(&address) {
                    Some(credential) => credential,
                    None => {
                        tracing::warn!("Reloaded address {} is not watched", address);
                        address.staking_hash()
                    }
                };
                states.insert(
                    credential,
                    StakingState {
                        credential,
                        reward_address: address,
                        delegated_pool: summary.delegated_pool,
                        rewards: summary.rewards,
                        observed_slot,
                        updated_at: None,
                    },
                );
                if inner.registry.finalize_removal(&credential) {
                    removed += 1;
                }
            }

            // Unwatched credentials the source had nothing for still leave after this run.
            for address in &batch {
                let credential = address.staking_hash();
                if inner.registry.finalize_removal(&credential) {
                    tracing::debug!("No state returned for unwatched {}", credential);
                    removed += 1;
                }
            }

            (states.into_values().collect::<Vec<_>>(), removed, inner.on_reload.clone())
        };

        self.db.upsert_staking_states(&states).await?;

        tracing::info!(
            "Reloaded {} staking states at slot {} in {:.2}s ({} unwatched, full: {})",
            states.len(),
            observed_slot,
            started.elapsed().as_secs_f64(),
            removed,
            full
        );

        let report = ReloadReport { addresses: batch, full };
        if let Some(callback) = callback {
            callback(&report);
        }
        Ok(Some(report))
    }
}

/// Reload worker: consumes work units one at a time until cancelled.
///
/// A failed reload is fatal. The worker marks the indexer stopped, cancels its siblings and
/// returns the error for [super::StakingIndexer::stop] to surface.
pub(super) async fn run_worker(
    shared: Arc<Shared>,
    mut work: mpsc::Receiver<()>,
    cancel: CancellationToken,
) -> Result<(), IndexerError> {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            unit = work.recv() => {
                if unit.is_none() {
                    break;
                }
            }
        }

        if let Err(err) = shared.execute_reload().await {
            tracing::error!("Staking reload failed, stopping indexer: {:?}", err);
            shared.lock().running = false;
            cancel.cancel();
            return Err(err);
        }
    }

    tracing::debug!("Reload worker exited");
    Ok(())
}
