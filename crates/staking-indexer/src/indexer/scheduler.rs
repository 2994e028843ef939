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

//! Reload scheduling: pending work accumulation, debounce and the periodic fallback.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::Shared;
use crate::credential::StakingHash;

/// Reload requests accumulated since the last flush.
///
/// Once `full` is set it absorbs every further request until taken.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingWork {
    pub full: bool,
    pub selective: BTreeSet<StakingHash>,
}

impl PendingWork {
    /// Merges a request. `None` asks for a full reload.
    ///
    /// Returns whether a debounce cycle should be scheduled: always for a new full reload, and for
    /// a selective one only in dynamic mode.
    pub fn request(&mut self, credentials: Option<&[StakingHash]>, dynamic: bool) -> bool {
        if self.full {
            return false;
        }
        match credentials {
            None => {
                self.full = true;
                true
            }
            Some(credentials) => {
                self.selective.extend(credentials.iter().copied());
                dynamic && !credentials.is_empty()
            }
        }
    }

    pub fn take(&mut self) -> PendingWork {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.selective.is_empty()
    }
}

/// Coalesces triggers into work units for the reload worker.
///
/// A trigger opens a window of `debounce`; triggers arriving inside it are folded into the same
/// firing. Each firing offers one unit to `work`, a channel of capacity one: if a unit is already
/// waiting behind the in-flight reload, the new one is dropped, since the waiting unit drains the
/// latest pending state when it starts. Every `periodic` a full reload is requested.
pub(super) async fn run_scheduler(
    shared: Arc<Shared>,
    mut triggers: mpsc::UnboundedReceiver<()>,
    work: mpsc::Sender<()>,
    cancel: CancellationToken,
    debounce: Duration,
    periodic: Duration,
) {
    let mut periodic_tick = time::interval_at(Instant::now() + periodic, periodic);
    periodic_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = periodic_tick.tick() => {
                tracing::debug!("Periodic full reload");
                // Full reload requested from inside the scheduler; open the window directly.
                if !shared.request_pending(None) {
                    continue;
                }
            }
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
        }

        let window = time::sleep(debounce);
        tokio::pin!(window);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = &mut window => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
            }
        }

        match work.try_send(()) {
            Ok(()) => tracing::trace!("Reload unit enqueued"),
            Err(TrySendError::Full(())) => {
                tracing::trace!("Reload unit already waiting, coalesced")
            }
            Err(TrySendError::Closed(())) => break,
        }
    }

    tracing::debug!("Reload scheduler exited");
}
