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

//! Materialized delegation and reward state for a watched set of staking credentials.
//!
//! Blocks are scanned for staking actions touching watched credentials, the actions are logged,
//! and the affected credentials are reconciled against an authoritative ledger state source in
//! debounced, single-flight reload runs.

pub mod actions;
pub mod block;
pub mod credential;
pub mod db;
pub mod extractor;
pub mod indexer;
pub mod registry;
pub mod source;

pub use indexer::{
    BlockContext, IndexerError, ReloadCallback, ReloadReport, StakingIndexer, StakingIndexerConfig,
};
