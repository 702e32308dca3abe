//! Esplora-compatible HTTP explorer client.
//!
//! Speaks the public esplora REST surface: `/mempool/txids`, `/tx/{txid}`,
//! `/address/{addr}/txs/chain/{cursor}`, `/tx/{txid}/outspend/{vout}`.
//! All amounts on the wire are satoshi.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, Txid};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::ExplorerConfig;
use crate::error::{CoreError, ExplorerError};
use crate::types::{AddressPage, Transaction, TxInput, TxOutput};

use super::Explorer;

/// Ceiling for a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Esplora HTTP client with request pacing, an in-flight cap, and capped
/// exponential backoff for transient failures.
///
/// The client is stateless beyond the rate limiter; connection reuse is
/// left to reqwest's pool.
pub struct EsploraClient {
    client: reqwest::Client,
    base_url: String,
    limiter: Option<DirectRateLimiter>,
    in_flight: Semaphore,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl EsploraClient {
    pub fn new(config: &ExplorerConfig) -> Result<Self, CoreError> {
        if config.max_in_flight == 0 {
            return Err(CoreError::InvalidConfig(
                "explorer.max_in_flight must be at least 1".to_owned(),
            ));
        }
        if config.retry_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "explorer.retry_attempts must be at least 1".to_owned(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .tcp_nodelay(true)
            .build()
            .expect("reqwest client builder uses valid static config");

        let limiter = match config.min_request_interval_ms {
            0 => None,
            interval => Quota::with_period(Duration::from_millis(interval))
                .map(RateLimiter::direct),
        };

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            limiter,
            in_flight: Semaphore::new(config.max_in_flight),
            retry_attempts: config.retry_attempts,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    /// One paced, in-flight-bounded GET with status mapping.
    async fn fetch_once<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ExplorerError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("semaphore is never closed");
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let url = format!("{}{path}", self.base_url);
        debug!(%url, "explorer request");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ExplorerError::Transport)?;

        let status = response.status();
        match status.as_u16() {
            404 => return Err(ExplorerError::NotFound),
            429 => return Err(ExplorerError::RateLimited),
            code if status.is_server_error() => return Err(ExplorerError::Unavailable(code)),
            _ => {}
        }

        let body = response.text().await.map_err(ExplorerError::Transport)?;
        if !status.is_success() {
            // Remaining non-success statuses are request-shaped problems;
            // retrying the same call cannot help.
            return Err(ExplorerError::Malformed(format!(
                "HTTP {status}: {body}"
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| ExplorerError::Malformed(format!("decode {path}: {e}")))
    }

    /// Retry transient failures with capped exponential backoff and jitter;
    /// permanent failures surface immediately.
    async fn fetch_with_retry<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, ExplorerError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(path).await {
                Err(err) if err.is_transient() && attempt + 1 < self.retry_attempts => {
                    let delay = backoff_delay(self.retry_base_delay, attempt);
                    warn!(%path, attempt, error = %err, delay_ms = delay.as_millis() as u64, "transient explorer failure; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Exponential backoff with a random jitter of up to half the delay,
/// capped at [`MAX_BACKOFF`].
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(MAX_BACKOFF);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}

#[async_trait]
impl Explorer for EsploraClient {
    async fn get_mempool_txids(&self) -> Result<HashSet<Txid>, ExplorerError> {
        let txids: Vec<Txid> = self.fetch_with_retry("/mempool/txids").await?;
        Ok(txids.into_iter().collect())
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, ExplorerError> {
        let raw: EsploraTx = self.fetch_with_retry(&format!("/tx/{txid}")).await?;
        into_transaction(raw)
    }

    async fn get_address_txs(
        &self,
        address: &str,
        cursor: Option<Txid>,
    ) -> Result<AddressPage, ExplorerError> {
        let path = match cursor {
            Some(last_seen) => format!("/address/{address}/txs/chain/{last_seen}"),
            None => format!("/address/{address}/txs/chain"),
        };
        let raw: Vec<EsploraTx> = self.fetch_with_retry(&path).await?;
        let txids: Vec<Txid> = raw.into_iter().map(|tx| tx.txid).collect();
        Ok(AddressPage {
            next_cursor: txids.last().copied(),
            txids,
        })
    }

    async fn get_spending_tx(
        &self,
        prev_txid: &Txid,
        vout: u32,
    ) -> Result<Option<Txid>, ExplorerError> {
        let raw: OutspendResponse = self
            .fetch_with_retry(&format!("/tx/{prev_txid}/outspend/{vout}"))
            .await?;
        match (raw.spent, raw.txid) {
            (false, _) => Ok(None),
            (true, Some(txid)) => Ok(Some(txid)),
            (true, None) => Err(ExplorerError::Malformed(
                "outspend marked spent without a spending txid".to_owned(),
            )),
        }
    }
}

// ==============================================================================
// Wire Format
// ==============================================================================

#[derive(Debug, serde::Deserialize)]
struct EsploraTx {
    txid: Txid,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
    #[serde(default)]
    fee: Option<u64>,
    size: u64,
}

#[derive(Debug, serde::Deserialize)]
struct EsploraVin {
    txid: Option<Txid>,
    vout: Option<u32>,
    prevout: Option<EsploraPrevout>,
    #[serde(default)]
    is_coinbase: bool,
}

#[derive(Debug, serde::Deserialize)]
struct EsploraPrevout {
    value: u64,
    scriptpubkey_address: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct EsploraVout {
    value: u64,
    scriptpubkey_address: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct OutspendResponse {
    spent: bool,
    txid: Option<Txid>,
}

fn into_transaction(raw: EsploraTx) -> Result<Transaction, ExplorerError> {
    let mut inputs = Vec::with_capacity(raw.vin.len());
    for vin in raw.vin {
        let prevout = if vin.is_coinbase {
            None
        } else {
            let funding_txid = vin.txid.ok_or_else(|| {
                ExplorerError::Malformed("non-coinbase input without prevout txid".to_owned())
            })?;
            let funding_vout = vin.vout.ok_or_else(|| {
                ExplorerError::Malformed("non-coinbase input without prevout index".to_owned())
            })?;
            Some(OutPoint::new(funding_txid, funding_vout))
        };

        inputs.push(TxInput {
            prevout,
            address: vin.prevout.as_ref().and_then(|p| p.scriptpubkey_address.clone()),
            value: vin.prevout.as_ref().map(|p| Amount::from_sat(p.value)),
        });
    }

    let outputs = raw
        .vout
        .into_iter()
        .map(|vout| TxOutput {
            address: vout.scriptpubkey_address,
            value: Amount::from_sat(vout.value),
        })
        .collect();

    Ok(Transaction {
        txid: raw.txid,
        inputs,
        outputs,
        fee: Amount::from_sat(raw.fee.unwrap_or(0)),
        size: raw.size,
    })
}

// ==============================================================================
// Tests
// ==============================================================================
