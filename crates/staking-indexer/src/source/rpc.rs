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

//! JSON-RPC client for a node query gateway.
//!
//! Two methods are used:
//! - `queryLedgerState/tip` returning `"origin"` or `{"slot": u64, "id": hex}`
//! - `queryLedgerState/rewardAccountSummaries` taking `{"keys": [hex], "scripts": [hex]}` and
//!   returning a list of `{"from", "credential", "stakePool"?: {"id"}, "rewards"?: {"ada":
//!   {"lovelace"}}}` with hex-encoded credentials and pool ids.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use super::{AccountSummary, LedgerTip, SourceError, StateSource};
use crate::{
    block::BlockHash,
    credential::{
        derive_reward_address, CredentialKind, Network, PoolId, RewardAddress, StakingHash,
    },
};

pub struct JsonRpcStateSource {
    client: reqwest::Client,
    url: Url,
    network: Network,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum TipResult {
    Origin(String),
    At { slot: u64, id: BlockHash },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewardAccountSummary {
    from: CredentialOrigin,
    credential: StakingHash,
    stake_pool: Option<StakePoolRef>,
    rewards: Option<Lovelace>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
enum CredentialOrigin {
    VerificationKey,
    Script,
}

#[derive(Deserialize)]
struct StakePoolRef {
    id: PoolId,
}

#[derive(Deserialize)]
struct Lovelace {
    ada: AdaAmount,
}

#[derive(Deserialize)]
struct AdaAmount {
    lovelace: u64,
}

impl JsonRpcStateSource {
    pub fn new(url: Url, network: Network) -> Self {
        Self { client: reqwest::Client::new(), url, network, next_id: AtomicU64::new(1) }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, SourceError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        tracing::trace!("JSON-RPC call {}", method);

        let response: RpcResponse = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        decode_response(response)
    }
}

fn decode_response<T: DeserializeOwned>(response: RpcResponse) -> Result<T, SourceError> {
    if let Some(error) = response.error {
        return Err(SourceError::Rpc { code: error.code, message: error.message });
    }
    let result = response
        .result
        .ok_or_else(|| SourceError::BadResponse("response has neither result nor error".into()))?;
    serde_json::from_value(result).map_err(|e| SourceError::BadResponse(e.to_string()))
}

fn tip_from_result(result: TipResult) -> Result<LedgerTip, SourceError> {
    match result {
        TipResult::Origin(s) if s == "origin" => Ok(LedgerTip::Origin),
        TipResult::Origin(s) => Err(SourceError::BadResponse(format!("unexpected tip: {s}"))),
        TipResult::At { slot, id } => Ok(LedgerTip::At { slot, hash: id }),
    }
}

fn summary_params(addresses: &[RewardAddress]) -> Value {
    let (keys, scripts): (Vec<&RewardAddress>, Vec<&RewardAddress>) =
        addresses.iter().partition(|address| address.kind() == CredentialKind::Key);
    json!({
        "keys": keys.iter().map(|a| a.staking_hash().to_string()).collect::<Vec<_>>(),
        "scripts": scripts.iter().map(|a| a.staking_hash().to_string()).collect::<Vec<_>>(),
    })
}

fn summaries_by_address(
    network: Network,
    summaries: Vec<RewardAccountSummary>,
) -> BTreeMap<RewardAddress, AccountSummary> {
    summaries
        .into_iter()
        .map(|summary| {
            let kind = match summary.from {
                CredentialOrigin::VerificationKey => CredentialKind::Key,
                CredentialOrigin::Script => CredentialKind::Script,
            };
            let address = derive_reward_address(network, kind, &summary.credential);
            let account = AccountSummary {
                delegated_pool: summary.stake_pool.map(|pool| pool.id),
                rewards: summary.rewards.map(|r| r.ada.lovelace).unwrap_or(0),
            };
            (address, account)
        })
        .collect()
}

#[async_trait]
impl StateSource for JsonRpcStateSource {
    async fn ledger_tip(&self) -> Result<LedgerTip, SourceError> {
        let result: TipResult = self.call("queryLedgerState/tip", json!({})).await?;
        tip_from_result(result)
    }

    async fn delegations_and_rewards(
        &self,
        addresses: &[RewardAddress],
    ) -> Result<BTreeMap<RewardAddress, AccountSummary>, SourceError> {
        if addresses.is_empty() {
            return Ok(BTreeMap::new());
        }
        let summaries: Vec<RewardAccountSummary> = self
            .call("queryLedgerState/rewardAccountSummaries", summary_params(addresses))
            .await?;
        Ok(summaries_by_address(self.network, summaries))
    }
}
