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

//! The staking indexer component: watch set, action logging and reload scheduling.

mod executor;
pub mod scheduler;

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    actions::ActionTag,
    block::Block,
    credential::{CredentialKind, Network, RewardAddress, StakingHash},
    db::{DbError, StakingDbObj},
    extractor::{extract_actions, Extraction},
    registry::Registry,
    source::{SourceError, StateSourceObj},
};
use scheduler::PendingWork;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("database error {0:?}")]
    Db(#[from] DbError),

    #[error("state source error {0:?}")]
    Source(#[from] SourceError),

    #[error("staking indexer is already running")]
    AlreadyRunning,

    #[error("staking indexer task failed {0:?}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug)]
pub struct StakingIndexerConfig {
    /// Window within which reload requests are coalesced.
    pub debounce: Duration,
    /// Interval of the full-reload fallback.
    pub periodic_reload: Duration,
    pub network: Network,
    /// Whether selective reload requests schedule a reload on their own.
    pub reload_dynamically: bool,
}

impl Default for StakingIndexerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            periodic_reload: Duration::from_millis(300_000),
            network: Network::Mainnet,
            reload_dynamically: true,
        }
    }
}

/// Outcome of one reload run, passed to the reload callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub addresses: Vec<RewardAddress>,
    pub full: bool,
}

pub type ReloadCallback = Arc<dyn Fn(&ReloadReport) + Send + Sync>;

/// How the chain follower delivered a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockContext {
    /// The follower has caught up with the chain tip.
    pub in_sync: bool,
    /// The block row is not persisted yet and must be stored before any action referencing it.
    pub store_block: bool,
}

struct Inner {
    registry: Registry,
    /// Credentials watched regardless of the action log, with their kind.
    seeds: BTreeMap<StakingHash, CredentialKind>,
    pending: PendingWork,
    dynamic: bool,
    running: bool,
    triggers: Option<mpsc::UnboundedSender<()>>,
    on_reload: Option<ReloadCallback>,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    /// Held by every reload run, and by reboot and clear to wait out an in-flight run.
    gate: tokio::sync::Mutex<()>,
    db: StakingDbObj,
    source: StateSourceObj,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a reload request and reports whether a debounce cycle is due.
    fn request_pending(&self, credentials: Option<&[StakingHash]>) -> bool {
        let mut inner = self.lock();
        let dynamic = inner.dynamic;
        inner.pending.request(credentials, dynamic)
    }
}

struct Tasks {
    cancel: CancellationToken,
    scheduler: JoinHandle<()>,
    worker: JoinHandle<Result<(), IndexerError>>,
}

/// Handle to a staking indexer.
///
/// All watch set and pending work mutations go through this handle and complete before the
/// next one starts. Reload runs execute on a dedicated worker task, one at a time.
pub struct StakingIndexer {
    config: StakingIndexerConfig,
    shared: Arc<Shared>,
    tasks: Mutex<Option<Tasks>>,
}

impl StakingIndexer {
    pub fn new(config: StakingIndexerConfig, db: StakingDbObj, source: StateSourceObj) -> Self {
        let inner = Inner {
            registry: Registry::new(config.network),
            seeds: BTreeMap::new(),
            pending: PendingWork::default(),
            dynamic: config.reload_dynamically,
            running: false,
            triggers: None,
            on_reload: None,
        };
        let shared = Arc::new(Shared {
            inner: Mutex::new(inner),
            gate: tokio::sync::Mutex::new(()),
            db,
            source,
        });
        Self { config, shared, tasks: Mutex::new(None) }
    }

    /// Registers a callback invoked after every completed reload.
    pub fn set_reload_callback(&self, callback: ReloadCallback) {
        self.shared.lock().on_reload = Some(callback);
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Option<Tasks>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the reload scheduler and worker. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), IndexerError> {
        let mut tasks = self.lock_tasks();
        if tasks.is_some() {
            return Err(IndexerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        // One unit may wait behind the in-flight reload.
        let (work_tx, work_rx) = mpsc::channel(1);

        {
            let mut inner = self.shared.lock();
            inner.running = true;
            inner.triggers = Some(trigger_tx);
        }

        let scheduler = tokio::spawn(scheduler::run_scheduler(
            self.shared.clone(),
            trigger_rx,
            work_tx,
            cancel.clone(),
            self.config.debounce,
            self.config.periodic_reload,
        ));
        let worker =
            tokio::spawn(executor::run_worker(self.shared.clone(), work_rx, cancel.clone()));

        *tasks = Some(Tasks { cancel, scheduler, worker });
        tracing::info!(
            "Staking indexer started (debounce: {:?}, periodic reload: {:?})",
            self.config.debounce,
            self.config.periodic_reload
        );
        Ok(())
    }

    /// Stops the timers, waits for an in-flight reload to finish and releases the state source.
    ///
    /// Returns the error of a failed reload if that is what stopped the indexer.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let Some(tasks) = self.lock_tasks().take() else {
            tracing::warn!("Staking indexer is not running");
            return Ok(());
        };

        {
            let mut inner = self.shared.lock();
            inner.running = false;
            inner.triggers = None;
        }

        tasks.cancel.cancel();
        tasks.scheduler.await?;
        let result = tasks.worker.await?;
        self.shared.source.close().await;

        tracing::info!("Staking indexer stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Resolves once the indexer shuts down, by [StakingIndexer::stop] or after a failed reload.
    /// Resolves immediately if it was never started.
    pub async fn stopped(&self) {
        let cancel = self.lock_tasks().as_ref().map(|tasks| tasks.cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancelled().await;
        }
    }

    /// Forgets the watch set and all pending work, after any in-flight reload finished.
    pub async fn clear(&self) {
        let _gate = self.shared.gate.lock().await;
        let mut inner = self.shared.lock();
        inner.registry.clear();
        inner.pending = PendingWork::default();
    }

    /// Rebuilds the watch set from the action log and the seeded credentials.
    ///
    /// Every credential whose latest logged action is not a deregistration is watched again, as a
    /// script credential since the log does not keep the kind. Seeded credentials are then
    /// watched with their seeded kind. Returns the size of the watch set. No reload is requested.
    pub async fn reboot(&self) -> Result<usize, IndexerError> {
        let _gate = self.shared.gate.lock().await;
        {
            let mut inner = self.shared.lock();
            inner.registry.clear();
            inner.pending = PendingWork::default();
        }

        let latest = self.shared.db.latest_action_kinds().await?;
        let total = latest.len();
        let active = latest
            .into_iter()
            .filter(|(_, kind)| *kind != ActionTag::Deregister)
            .map(|(credential, _)| credential);

        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let recovered = inner.registry.batch_watch(active, CredentialKind::Script);
        for (credential, kind) in &inner.seeds {
            inner.registry.watch(*credential, *kind);
        }
        let watched = inner.registry.len();
        tracing::info!(
            "Rebuilt watch set: {} from action log ({} deregistered), {} seeded, {} watched",
            recovered,
            total - recovered,
            inner.seeds.len(),
            watched
        );
        Ok(watched)
    }

    /// Watches `credentials` now and again after every [StakingIndexer::reboot].
    pub fn seed_watch(
        &self,
        credentials: impl IntoIterator<Item = StakingHash>,
        kind: CredentialKind,
    ) -> usize {
        let mut inner = self.shared.lock();
        let mut seeded = 0;
        for credential in credentials {
            inner.seeds.insert(credential, kind);
            inner.registry.watch(credential, kind);
            seeded += 1;
        }
        seeded
    }

    pub fn watch(&self, credential: StakingHash, kind: CredentialKind) -> RewardAddress {
        self.shared.lock().registry.watch(credential, kind)
    }

    pub fn batch_watch(
        &self,
        credentials: impl IntoIterator<Item = StakingHash>,
        kind: CredentialKind,
    ) -> usize {
        self.shared.lock().registry.batch_watch(credentials, kind)
    }

    /// Schedules `credential` for removal after its next reload. Returns whether it was watched.
    pub fn unwatch(&self, credential: &StakingHash) -> bool {
        let known = self.shared.lock().registry.unwatch(credential);
        if !known {
            tracing::warn!("Cannot unwatch {}: not watched", credential);
        }
        known
    }

    pub fn from_hash(&self, credential: &StakingHash) -> Option<RewardAddress> {
        self.shared.lock().registry.address_of(credential)
    }

    pub fn from_address(&self, address: &RewardAddress) -> Option<StakingHash> {
        self.shared.lock().registry.hash_of(address)
    }

    pub fn is_hash_watched(&self, credential: &StakingHash) -> bool {
        self.shared.lock().registry.is_watched(credential)
    }

    pub fn is_address_watched(&self, address: &RewardAddress) -> bool {
        self.shared.lock().registry.is_watched_address(address)
    }

    pub fn watched_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Toggles whether selective reload requests schedule a reload immediately or wait for the
    /// next full reload.
    pub fn toggle_reload_dynamically(&self, enabled: bool) {
        self.shared.lock().dynamic = enabled;
    }

    /// Requests a reload of `credentials`, or of the whole watch set when `None`.
    pub fn reload(&self, credentials: Option<&[StakingHash]>) {
        let triggers = {
            let mut inner = self.shared.lock();
            if !inner.running {
                tracing::warn!("Staking indexer is not running, ignoring reload request");
                return;
            }
            let dynamic = inner.dynamic;
            if !inner.pending.request(credentials, dynamic) {
                return;
            }
            inner.triggers.clone()
        };

        if let Some(triggers) = triggers {
            if triggers.send(()).is_err() {
                tracing::warn!("Reload scheduler has exited, reload request not scheduled");
            }
        }
    }

    /// Runs the pending reload now instead of waiting for the scheduler.
    ///
    /// When the indexer is stopped the pending work is discarded instead.
    pub async fn flush(&self) -> Result<Option<ReloadReport>, IndexerError> {
        self.shared.execute_reload().await
    }

    /// Extracts and logs the staking actions of one block.
    ///
    /// Deregistered credentials are unwatched (deferred until their next reload). Actions are
    /// logged in one batch, after the block itself if `ctx.store_block` is set. Affected
    /// credentials are scheduled for reload only while in sync; during catch-up the periodic
    /// full reload covers them.
    pub async fn process_block(
        &self,
        block: &Block,
        ctx: BlockContext,
    ) -> Result<Extraction, IndexerError> {
        let extraction = {
            let mut inner = self.shared.lock();
            let extraction = extract_actions(&inner.registry, block);
            for credential in &extraction.deregistered {
                inner.registry.unwatch(credential);
            }
            extraction
        };

        if extraction.is_empty() {
            return Ok(extraction);
        }

        if ctx.store_block {
            self.shared.db.store_block(&block.header).await?;
        }
        self.shared.db.append_actions(&extraction.actions).await?;

        tracing::debug!(
            "Logged {} staking actions at slot {} ({} credentials affected)",
            extraction.actions.len(),
            block.header.slot,
            extraction.affected.len()
        );

        if ctx.in_sync {
            let affected: Vec<StakingHash> = extraction.affected.iter().copied().collect();
            self.reload(Some(&affected));
        }

        Ok(extraction)
    }
}
