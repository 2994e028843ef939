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

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{any::AnyPoolOptions, any::AnyRow, AnyPool, Row};

use super::DbError;
use crate::{
    actions::{ActionKind, ActionTag, StakingAction},
    block::{BlockHeader, TxId},
    credential::{PoolId, RewardAddress, StakingHash},
};

pub type StakingDbObj = Arc<dyn StakingIndexerDb + Send + Sync>;

/// Materialized delegation and reward state of one credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingState {
    pub credential: StakingHash,
    pub reward_address: RewardAddress,
    pub delegated_pool: Option<PoolId>,
    pub rewards: u64,
    /// Ledger tip slot the state was read at.
    pub observed_slot: u64,
    pub updated_at: Option<String>,
}

#[async_trait]
pub trait StakingIndexerDb {
    /// Record block metadata. Actions reference their block, so this must precede
    /// [StakingIndexerDb::append_actions] for the same slot.
    async fn store_block(&self, header: &BlockHeader) -> Result<(), DbError>;

    /// Append actions to the log in one transaction
    async fn append_actions(&self, actions: &[StakingAction]) -> Result<(), DbError>;

    /// Upsert materialized states, overwriting every field on conflict. `updated_at` only moves
    /// when some other field changed, so re-applying a snapshot leaves the row untouched.
    async fn upsert_staking_states(&self, states: &[StakingState]) -> Result<(), DbError>;

    /// Most recent logged action kind of every credential in the log
    async fn latest_action_kinds(&self) -> Result<Vec<(StakingHash, ActionTag)>, DbError>;

    /// Get the materialized state of a credential
    async fn get_staking_state(
        &self,
        credential: &StakingHash,
    ) -> Result<Option<StakingState>, DbError>;

    /// Get materialized states with pagination, sorted by rewards
    async fn list_staking_states(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StakingState>, DbError>;

    /// Get every logged action of a credential in chain order
    async fn get_actions_by_credential(
        &self,
        credential: &StakingHash,
    ) -> Result<Vec<StakingAction>, DbError>;

    /// Delete every block after `slot` together with its actions. Returns the number of blocks
    /// removed.
    async fn rollback_to_slot(&self, slot: u64) -> Result<u64, DbError>;
}

// Batch insert chunk size to avoid parameter limits
// PostgreSQL: 65535 max params, SQLite: 999-32766 params (configurable)
const BATCH_INSERT_CHUNK_SIZE: usize = 100;

pub struct StakingDb {
    pool: AnyPool,
}

impl StakingDb {
    pub async fn new(database_url: &str) -> Result<Self, DbError> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(10).connect(database_url).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

fn parse_column<T>(row: &AnyRow, column: &str) -> Result<T, DbError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = row.get::<String, _>(column);
    raw.parse().map_err(|e| DbError::BadValue(format!("{column} = {raw}: {e}")))
}

fn state_from_row(row: &AnyRow) -> Result<StakingState, DbError> {
    let delegated_pool = match row.get::<Option<String>, _>("delegated_pool") {
        Some(pool) => Some(
            PoolId::from_str(&pool)
                .map_err(|e| DbError::BadValue(format!("delegated_pool = {pool}: {e}")))?,
        ),
        None => None,
    };
    Ok(StakingState {
        credential: parse_column(row, "credential")?,
        reward_address: parse_column(row, "reward_address")?,
        delegated_pool,
        rewards: row.get::<i64, _>("rewards") as u64,
        observed_slot: row.get::<i64, _>("observed_slot") as u64,
        updated_at: row.get::<Option<String>, _>("updated_at"),
    })
}

fn action_from_row(row: &AnyRow) -> Result<StakingAction, DbError> {
    let action: ActionKind = serde_json::from_str(&row.get::<String, _>("payload"))?;
    let tag: ActionTag = parse_column(row, "kind")?;
    if action.tag() != tag {
        return Err(DbError::BadValue(format!("payload kind does not match column kind {tag}")));
    }
    Ok(StakingAction {
        credential: parse_column(row, "credential")?,
        action,
        slot: row.get::<i64, _>("slot") as u64,
        tx_id: parse_column::<TxId>(row, "tx_id")?,
        tx_index: row.get::<i64, _>("tx_index") as u32,
        action_index: row.get::<i64, _>("action_index") as u32,
    })
}

fn values_clauses(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let params: Vec<String> =
                (1..=columns).map(|col| format!("${}", row * columns + col)).collect();
            format!("({})", params.join(","))
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl StakingIndexerDb for StakingDb {
    async fn store_block(&self, header: &BlockHeader) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO staking_block (slot, hash) VALUES ($1, $2)
             ON CONFLICT (slot) DO UPDATE SET hash = EXCLUDED.hash",
        )
        .bind(header.slot as i64)
        .bind(header.hash.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_actions(&self, actions: &[StakingAction]) -> Result<(), DbError> {
        if actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in actions.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let query = format!(
                "INSERT INTO staking_action
                (slot, tx_index, action_index, credential, tx_id, kind, payload)
                VALUES {}",
                values_clauses(chunk.len(), 7)
            );

            let mut q = sqlx::query(&query);
            for action in chunk {
                q = q
                    .bind(action.slot as i64)
                    .bind(action.tx_index as i64)
                    .bind(action.action_index as i64)
                    .bind(action.credential.to_string())
                    .bind(action.tx_id.to_string())
                    .bind(action.action.tag().to_string())
                    .bind(serde_json::to_string(&action.action)?);
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_staking_states(&self, states: &[StakingState]) -> Result<(), DbError> {
        if states.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in states.chunks(BATCH_INSERT_CHUNK_SIZE) {
            let query = format!(
                "INSERT INTO staking_state
                (credential, reward_address, delegated_pool, rewards, observed_slot, updated_at)
                VALUES {}
                ON CONFLICT (credential) DO UPDATE SET
                    reward_address = EXCLUDED.reward_address,
                    delegated_pool = EXCLUDED.delegated_pool,
                    rewards = EXCLUDED.rewards,
                    observed_slot = EXCLUDED.observed_slot,
                    updated_at = CASE
                        WHEN staking_state.reward_address = EXCLUDED.reward_address
                            AND (staking_state.delegated_pool = EXCLUDED.delegated_pool
                                OR (staking_state.delegated_pool IS NULL
                                    AND EXCLUDED.delegated_pool IS NULL))
                            AND staking_state.rewards = EXCLUDED.rewards
                            AND staking_state.observed_slot = EXCLUDED.observed_slot
                        THEN staking_state.updated_at
                        ELSE EXCLUDED.updated_at
                    END",
                values_clauses(chunk.len(), 6)
            );

            let mut q = sqlx::query(&query);
            for state in chunk {
                q = q
                    .bind(state.credential.to_string())
                    .bind(state.reward_address.to_string())
                    .bind(state.delegated_pool.map(|pool| pool.to_string()))
                    .bind(state.rewards as i64)
                    .bind(state.observed_slot as i64)
                    .bind(state.updated_at.clone().unwrap_or_else(|| Utc::now().to_rfc3339()));
            }
            q.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn latest_action_kinds(&self) -> Result<Vec<(StakingHash, ActionTag)>, DbError> {
        let rows = sqlx::query(
            "SELECT credential, kind FROM (
                SELECT credential, kind, ROW_NUMBER() OVER (
                    PARTITION BY credential
                    ORDER BY slot DESC, tx_index DESC, action_index DESC
                ) AS rn
                FROM staking_action
             ) latest
             WHERE rn = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut latest = Vec::with_capacity(rows.len());
        for row in rows {
            latest.push((parse_column(&row, "credential")?, parse_column(&row, "kind")?));
        }
        Ok(latest)
    }

    async fn get_staking_state(
        &self,
        credential: &StakingHash,
    ) -> Result<Option<StakingState>, DbError> {
        let row = sqlx::query(
            "SELECT credential, reward_address, delegated_pool, rewards, observed_slot, updated_at
             FROM staking_state
             WHERE credential = $1",
        )
        .bind(credential.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn list_staking_states(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<StakingState>, DbError> {
        let rows = sqlx::query(
            "SELECT credential, reward_address, delegated_pool, rewards, observed_slot, updated_at
             FROM staking_state
             ORDER BY rewards DESC, credential ASC
             LIMIT $1 OFFSET $2",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(state_from_row).collect()
    }

    async fn get_actions_by_credential(
        &self,
        credential: &StakingHash,
    ) -> Result<Vec<StakingAction>, DbError> {
        let rows = sqlx::query(
            "SELECT slot, tx_index, action_index, credential, tx_id, kind, payload
             FROM staking_action
             WHERE credential = $1
             ORDER BY slot ASC, tx_index ASC, action_index ASC",
        )
        .bind(credential.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(action_from_row).collect()
    }

    async fn rollback_to_slot(&self, slot: u64) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM staking_action WHERE slot > $1")
            .bind(slot as i64)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM staking_block WHERE slot > $1")
            .bind(slot as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }
}
