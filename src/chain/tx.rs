//! Transaction factory: builds, signs, broadcasts and awaits inclusion
//! of vote messages, retrying across blocks until a height deadline.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::chain::height::http_base;
use crate::chain::msgs::{
    to_any, Any, AuthInfo, Coin, Fee, ModeInfo, ModeInfoSingle, PubKey, SignDoc, SignerInfo,
    TxBody, TxRaw, SECP256K1_PUBKEY_TYPE_URL, SIGN_MODE_DIRECT,
};
use crate::chain::{ChainError, ChainHeightTracker, GrpcClient, TxSigner};

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ChainClient {
    pub chain_id: String,
    pub feeder_address: String,
    pub validator_address: String,
    grpc: GrpcClient,
    rpc_http: String,
    http: reqwest::Client,
    signer: Arc<dyn TxSigner>,
    height: Arc<ChainHeightTracker>,
    gas_adjustment: f64,
    fee: Coin,
    shutdown: watch::Receiver<bool>,
}

impl ChainClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: String,
        feeder_address: String,
        validator_address: String,
        tmrpc_endpoint: &str,
        grpc_endpoint: &str,
        rpc_timeout: Duration,
        gas_adjustment: f64,
        fees: &str,
        signer: Arc<dyn TxSigner>,
        height: Arc<ChainHeightTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        Ok(Self {
            chain_id,
            feeder_address,
            validator_address,
            grpc: GrpcClient::new(grpc_endpoint),
            rpc_http: http_base(tmrpc_endpoint),
            http,
            signer,
            height,
            gas_adjustment,
            fee: parse_coin(fees)?,
            shutdown,
        })
    }

    pub fn chain_height(&self) -> Result<i64, ChainError> {
        self.height.get_chain_height()
    }

    pub async fn oracle_params(&self) -> Result<crate::chain::OracleParams, ChainError> {
        self.grpc.oracle_params().await
    }

    /// Broadcast `msgs`, retrying transient failures once per new block,
    /// until inclusion succeeds or `timeout_heights` blocks have elapsed
    /// past `next_height`.
    pub async fn broadcast_tx(
        &self,
        next_height: i64,
        timeout_heights: i64,
        msgs: Vec<Any>,
    ) -> Result<(), ChainError> {
        let max_height = next_height + timeout_heights;
        let mut last_check_height = next_height - 1;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return Err(ChainError::Cancelled);
            }

            let latest = self.height.get_chain_height()?;
            if latest <= last_check_height {
                tokio::select! {
                    _ = shutdown.changed() => return Err(ChainError::Cancelled),
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                continue;
            }
            last_check_height = latest;

            if last_check_height >= max_height {
                return Err(ChainError::BroadcastTimeout);
            }

            match self.attempt_broadcast(&msgs, max_height).await {
                Ok((hash, height)) => {
                    info!(tx_hash = %hash, tx_height = height, "successfully broadcasted tx");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    debug!(
                        error = %err,
                        max_height,
                        last_check_height,
                        "failed to broadcast tx; retrying"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => return Err(ChainError::Cancelled),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One full build-sign-broadcast-confirm attempt.
    async fn attempt_broadcast(
        &self,
        msgs: &[Any],
        max_height: i64,
    ) -> Result<(String, i64), ChainError> {
        let (account_number, sequence) = self.grpc.account(&self.feeder_address).await?;

        let body = TxBody {
            messages: msgs.to_vec(),
            memo: String::new(),
            timeout_height: 0,
        };
        let body_bytes = body.encode_to_vec();

        let public_key = to_any(
            SECP256K1_PUBKEY_TYPE_URL,
            &PubKey {
                key: self.signer.public_key(),
            },
        );
        let signer_info = SignerInfo {
            public_key: Some(public_key),
            mode_info: Some(ModeInfo {
                single: Some(ModeInfoSingle {
                    mode: SIGN_MODE_DIRECT,
                }),
            }),
            sequence,
        };

        // Simulate with a zero fee to learn gas, then apply the
        // configured adjustment.
        let sim_auth = AuthInfo {
            signer_infos: vec![signer_info.clone()],
            fee: Some(Fee {
                amount: vec![],
                gas_limit: 0,
            }),
        };
        let sim_tx = TxRaw {
            body_bytes: body_bytes.clone(),
            auth_info_bytes: sim_auth.encode_to_vec(),
            signatures: vec![vec![]],
        };
        let gas_used = self.grpc.simulate_gas(sim_tx.encode_to_vec()).await?;
        let gas_limit = adjusted_gas(gas_used, self.gas_adjustment);

        let auth_info = AuthInfo {
            signer_infos: vec![signer_info],
            fee: Some(Fee {
                amount: vec![self.fee.clone()],
                gas_limit,
            }),
        };
        let auth_info_bytes = auth_info.encode_to_vec();

        let sign_doc = SignDoc {
            body_bytes: body_bytes.clone(),
            auth_info_bytes: auth_info_bytes.clone(),
            chain_id: self.chain_id.clone(),
            account_number,
        };
        let signature = self.signer.sign(&sign_doc.encode_to_vec())?;

        let tx = TxRaw {
            body_bytes,
            auth_info_bytes,
            signatures: vec![signature],
        };

        let hash = self.broadcast_sync(tx.encode_to_vec()).await?;
        let height = self.wait_for_tx(&hash, max_height).await?;
        Ok((hash, height))
    }

    async fn broadcast_sync(&self, tx_bytes: Vec<u8>) -> Result<String, ChainError> {
        let resp = self
            .rpc_call(
                "broadcast_tx_sync",
                json!({ "tx": BASE64.encode(tx_bytes) }),
            )
            .await?;

        let code = resp["code"].as_u64().unwrap_or(0) as u32;
        if code != 0 {
            return Err(ChainError::Broadcast {
                code,
                log: resp["log"].as_str().unwrap_or_default().to_string(),
            });
        }
        resp["hash"]
            .as_str()
            .map(str::to_string)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ChainError::Rpc("broadcast returned no tx hash".to_string()))
    }

    /// Poll for the tx until it is committed, waiting a block between
    /// not-found responses and giving up at `max_height`.
    async fn wait_for_tx(&self, hash: &str, max_height: i64) -> Result<i64, ChainError> {
        let hash_bytes =
            hex::decode(hash).map_err(|e| ChainError::Rpc(format!("bad tx hash: {e}")))?;
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                return Err(ChainError::Cancelled);
            }

            match self
                .rpc_call(
                    "tx",
                    json!({ "hash": BASE64.encode(&hash_bytes), "prove": false }),
                )
                .await
            {
                Ok(result) => {
                    let code = result["tx_result"]["code"].as_u64().unwrap_or(0) as u32;
                    if code != 0 {
                        return Err(ChainError::Broadcast {
                            code,
                            log: result["tx_result"]["log"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    let height = result["height"]
                        .as_str()
                        .and_then(|h| h.parse().ok())
                        .unwrap_or_default();
                    return Ok(height);
                }
                Err(err) if err.is_retryable() => {
                    if self.height.get_chain_height()? >= max_height {
                        return Err(ChainError::BroadcastTimeout);
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return Err(ChainError::Cancelled),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp: Value = self
            .http
            .post(&self.rpc_http)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .json()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        if let Some(err) = resp.get("error") {
            let message = err["data"]
                .as_str()
                .or_else(|| err["message"].as_str())
                .unwrap_or("unknown rpc error");
            return Err(ChainError::Rpc(message.to_string()));
        }
        Ok(resp["result"].clone())
    }
}

fn adjusted_gas(gas_used: u64, adjustment: f64) -> u64 {
    (gas_used as f64 * adjustment).ceil() as u64
}

/// Parse a fee string like `50uxprt` into a coin.
fn parse_coin(fees: &str) -> Result<Coin, ChainError> {
    let split = fees
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&at| at > 0 && at < fees.len())
        .ok_or_else(|| ChainError::Rpc(format!("invalid fee: {fees}")))?;

    Ok(Coin {
        amount: fees[..split].to_string(),
        denom: fees[split..].to_string(),
    })
}
