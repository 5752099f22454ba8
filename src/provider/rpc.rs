//! JSON-RPC provider with ordered endpoint fallback
//!
//! Every call is time-boxed. A failed or timed-out endpoint is skipped in
//! favour of the next one in configuration order; only when all endpoints
//! fail does the call surface `Unavailable`. The endpoint that last answered
//! is tried first on the next call.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{derived_reference_price, ChainDataProvider};
use crate::errors::{EngineError, EngineResult};
use crate::models::{PriceSource, ReferencePrice};

/// `latestRoundData()` selector
const LATEST_ROUND_DATA: &str = "0xfeaf968c";
/// Chainlink USD pairs report 8 decimals
const ORACLE_DECIMALS: i32 = 8;
const WEI_PER_GWEI: f64 = 1e9;
const WEI_PER_ETH: f64 = 1e18;

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<Value>,
}

/// Per-endpoint health counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub url: String,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_success_ts: Option<i64>,
}

pub struct RpcProvider {
    client: Client,
    endpoints: Vec<String>,
    oracle_address: String,
    call_timeout: Duration,
    preferred: AtomicUsize,
    health: RwLock<Vec<EndpointHealth>>,
}

impl RpcProvider {
    pub fn new(endpoints: Vec<String>, oracle_address: String, call_timeout: Duration) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(anyhow!("at least one RPC endpoint is required"));
        }

        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .context("failed to build HTTP client")?;

        let health = endpoints
            .iter()
            .map(|url| EndpointHealth {
                url: url.clone(),
                ..Default::default()
            })
            .collect();

        Ok(Self {
            client,
            endpoints,
            oracle_address,
            call_timeout,
            preferred: AtomicUsize::new(0),
            health: RwLock::new(health),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn endpoint_health(&self) -> Vec<EndpointHealth> {
        self.health.read().clone()
    }

    /// Endpoint indices in try-order: preferred first, then the rest in
    /// configuration order.
    fn try_order(&self) -> Vec<usize> {
        let n = self.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed).min(n - 1);
        let mut order = Vec::with_capacity(n);
        order.push(start);
        order.extend((0..n).filter(|i| *i != start));
        order
    }

    fn record_success(&self, idx: usize, latency: Duration) {
        self.preferred.store(idx, Ordering::Relaxed);
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(idx) {
            h.successes += 1;
            h.consecutive_failures = 0;
            h.last_latency_ms = Some(latency.as_millis() as u64);
            h.last_success_ts = Some(Utc::now().timestamp());
        }
    }

    fn record_failure(&self, idx: usize, reason: &str) {
        let mut health = self.health.write();
        if let Some(h) = health.get_mut(idx) {
            h.failures += 1;
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
            h.last_error = Some(reason.to_string());
        }
    }

    async fn rpc_call(&self, url: &str, method: &str, params: &Value) -> Result<Value> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response: JsonRpcResponse = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("RPC request failed")?
            .error_for_status()
            .context("RPC endpoint returned error status")?
            .json()
            .await
            .context("failed to parse RPC response")?;

        if let Some(err) = response.error {
            return Err(anyhow!("RPC error: {}", err));
        }

        response
            .result
            .ok_or_else(|| anyhow!("no result in RPC response"))
    }

    /// Run `method` against each endpoint in order until one returns a value
    /// that `parse` accepts.
    async fn call_with_fallback<T, F>(&self, method: &str, params: Value, parse: F) -> EngineResult<T>
    where
        F: Fn(Value) -> Result<T>,
    {
        let mut last_error = String::from("no endpoints attempted");

        for idx in self.try_order() {
            let url = &self.endpoints[idx];
            let started = Instant::now();

            let outcome = time_boxed(self.call_timeout, self.rpc_call(url, method, &params))
                .await
                .and_then(&parse);

            match outcome {
                Ok(value) => {
                    let latency = started.elapsed();
                    self.record_success(idx, latency);
                    debug!(
                        endpoint = %url,
                        method,
                        latency_ms = latency.as_millis() as u64,
                        "RPC call ok"
                    );
                    return Ok(value);
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!(endpoint = %url, method, error = %reason, "⚠️ RPC endpoint failed, trying next");
                    self.record_failure(idx, &reason);
                    last_error = reason;
                }
            }
        }

        Err(EngineError::unavailable(format!(
            "{} failed on all {} endpoints: {}",
            method,
            self.endpoints.len(),
            last_error
        )))
    }

    async fn oracle_price(&self) -> EngineResult<f64> {
        let params = serde_json::json!([
            { "to": self.oracle_address, "data": LATEST_ROUND_DATA },
            "latest"
        ]);
        self.call_with_fallback("eth_call", params, |v| {
            let raw = v
                .as_str()
                .ok_or_else(|| anyhow!("eth_call result is not a string"))?;
            decode_latest_round_answer(raw)
        })
        .await
    }
}

async fn time_boxed<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("timed out after {}ms", limit.as_millis())),
    }
}

/// Parse a `0x`-prefixed hex quantity
pub fn parse_hex_quantity(raw: &Value) -> Result<u128> {
    let s = raw
        .as_str()
        .ok_or_else(|| anyhow!("quantity is not a string: {}", raw))?;
    let digits = s.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity: {}", s))
}

/// Decode the `answer` word of `latestRoundData()` into a USD price.
///
/// Layout: roundId, answer, startedAt, updatedAt, answeredInRound, each a
/// 32-byte word.
pub fn decode_latest_round_answer(raw: &str) -> Result<f64> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .context("failed to decode hex response")?;

    if bytes.len() < 160 {
        return Err(anyhow!("response too short: {} bytes", bytes.len()));
    }

    let mut word = [0u8; 16];
    word.copy_from_slice(&bytes[48..64]);
    let answer = i128::from_be_bytes(word);
    if answer <= 0 {
        return Err(anyhow!("non-positive oracle answer: {}", answer));
    }

    Ok(answer as f64 / 10f64.powi(ORACLE_DECIMALS))
}

#[async_trait]
impl ChainDataProvider for RpcProvider {
    async fn gas_price_gwei(&self) -> EngineResult<f64> {
        self.call_with_fallback("eth_gasPrice", serde_json::json!([]), |v| {
            Ok(parse_hex_quantity(&v)? as f64 / WEI_PER_GWEI)
        })
        .await
    }

    async fn reference_price(&self) -> EngineResult<ReferencePrice> {
        match self.oracle_price().await {
            Ok(price_usd) => Ok(ReferencePrice {
                price_usd,
                source: PriceSource::Oracle,
            }),
            Err(e) => {
                warn!(error = %e, "Oracle unavailable, using gas-derived reference price");
                let gas = self.gas_price_gwei().await?;
                Ok(derived_reference_price(gas))
            }
        }
    }

    async fn block_height(&self) -> EngineResult<u64> {
        self.call_with_fallback("eth_blockNumber", serde_json::json!([]), |v| {
            let n = parse_hex_quantity(&v)?;
            u64::try_from(n).map_err(|_| anyhow!("block number out of range: {}", n))
        })
        .await
    }

    async fn balance_eth(&self, address: &str) -> EngineResult<f64> {
        let params = serde_json::json!([address, "latest"]);
        self.call_with_fallback("eth_getBalance", params, |v| {
            Ok(parse_hex_quantity(&v)? as f64 / WEI_PER_ETH)
        })
        .await
    }
}
