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

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use staking_indexer::{
    block::Block,
    credential::{CredentialKind, Network, StakingHash},
    db::{StakingDb, StakingDbObj},
    source::JsonRpcStateSource,
    BlockContext, StakingIndexer, StakingIndexerConfig,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use url::Url;

/// Arguments for the staking indexer.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct StakingIndexerArgs {
    /// URL of the node query gateway (JSON-RPC over HTTP).
    #[clap(short, long, env)]
    rpc_url: Url,

    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// Network the reward addresses belong to.
    #[clap(long, env, value_enum, default_value_t = Network::Mainnet)]
    network: Network,

    /// File of chain events, one JSON object per line. Reads stdin if not set.
    #[clap(long)]
    events: Option<PathBuf>,

    /// Key-hash credentials to watch in addition to those recovered from the log. Kept across
    /// rollbacks.
    #[clap(long, env, value_delimiter = ',')]
    watch_keys: Vec<StakingHash>,

    /// Script-hash credentials to watch in addition to those recovered from the log. Kept across
    /// rollbacks.
    #[clap(long, env, value_delimiter = ',')]
    watch_scripts: Vec<StakingHash>,

    /// Window in milliseconds within which reload requests are coalesced.
    #[clap(long, default_value = "250")]
    debounce_ms: u64,

    /// Interval in milliseconds between full reloads.
    #[clap(long, default_value = "300000")]
    periodic_reload_ms: u64,

    /// Only reload on the periodic timer while catching up.
    #[clap(long, default_value_t = false)]
    no_dynamic_reload: bool,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

/// One line of the chain event feed.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChainEvent {
    RollForward {
        block: Block,
        #[serde(default)]
        in_sync: bool,
    },
    RollBackward {
        slot: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = StakingIndexerArgs::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    let config = StakingIndexerConfig {
        debounce: Duration::from_millis(args.debounce_ms),
        periodic_reload: Duration::from_millis(args.periodic_reload_ms),
        network: args.network,
        reload_dynamically: !args.no_dynamic_reload,
    };

    let db: StakingDbObj = Arc::new(StakingDb::new(&args.db).await?);
    let source = Arc::new(JsonRpcStateSource::new(args.rpc_url.clone(), args.network));
    let indexer = StakingIndexer::new(config, db.clone(), source);

    indexer.start()?;

    // NOTE: Stop the indexer on every exit path so an in-flight reload completes.
    let result = run(&args, &indexer, &db).await;
    let stopped = indexer.stop().await;
    if let Err(e) = &result {
        tracing::error!("FATAL: {:?}", e);
    }
    result?;
    stopped.context("Staking indexer failed")?;
    Ok(())
}

async fn run(args: &StakingIndexerArgs, indexer: &StakingIndexer, db: &StakingDbObj) -> Result<()> {
    indexer.seed_watch(args.watch_keys.iter().copied(), CredentialKind::Key);
    indexer.seed_watch(args.watch_scripts.iter().copied(), CredentialKind::Script);
    let watched = indexer.reboot().await.context("Failed to rebuild watch set")?;
    tracing::info!("Watching {} credentials", watched);
    indexer.reload(None);

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &args.events {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };
    let mut lines = reader.lines();

    loop {
        let line = tokio::select! {
            _ = indexer.stopped() => {
                tracing::warn!("Staking indexer stopped, no longer reading chain events");
                return Ok(());
            }
            line = lines.next_line() => line.context("Failed to read chain event")?,
        };
        let Some(line) = line else {
            tracing::info!("End of chain events, applying pending reloads");
            indexer.flush().await?;
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: ChainEvent = serde_json::from_str(&line).context("Invalid chain event")?;
        match event {
            ChainEvent::RollForward { block, in_sync } => {
                indexer.process_block(&block, BlockContext { in_sync, store_block: true }).await?;
            }
            ChainEvent::RollBackward { slot } => {
                let removed = db.rollback_to_slot(slot).await?;
                tracing::info!("Rolled back to slot {} ({} blocks removed)", slot, removed);
                indexer.reboot().await?;
                indexer.reload(None);
            }
        }
    }
}
