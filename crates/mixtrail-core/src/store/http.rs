//! Cypher-over-HTTP graph store adapter.
//!
//! Speaks the transactional commit endpoint of a Neo4j-compatible store:
//! `POST {base}/db/{database}/tx/commit` with a JSON statements envelope.
//! Statement errors come back in-band in an `errors` array, so HTTP
//! success alone does not mean the write landed.

use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Txid;
use reqwest::header;
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::{AddressTag, Transaction, Verdict};

use super::{GraphStore, StoreHealth};

// ==============================================================================
// Statements
// ==============================================================================

const MERGE_TRANSACTION: &str = "MERGE (t:Transaction {txid: $txid}) \
     SET t.is_coinjoin = $is_coinjoin, t.detection_method = $method, \
         t.score = $score, t.fee = $fee, t.size = $size, \
         t.vin = $vin, t.vout = $vout";

/// Tag promotion is encoded in the statement itself: once `coinjoin`,
/// the CASE arm keeps it `coinjoin` no matter what the caller passes.
const MERGE_ADDRESS: &str = "MERGE (a:Address {address: $address}) \
     ON CREATE SET a.first_seen = timestamp(), a.tag = $tag \
     ON MATCH SET a.tag = CASE WHEN a.tag = 'coinjoin' THEN 'coinjoin' ELSE $tag END \
     SET a.last_seen = timestamp()";

const LINK_INPUT: &str = "MATCH (a:Address {address: $address}) \
     MATCH (t:Transaction {txid: $txid}) \
     MERGE (a)-[:INPUT_TO]->(t)";

const LINK_OUTPUT: &str = "MATCH (t:Transaction {txid: $txid}) \
     MATCH (a:Address {address: $address}) \
     MERGE (t)-[:OUTPUT_TO]->(a)";

const LINK_RELATED: &str = "MATCH (a:Address {address: $address}) \
     MATCH (t:Transaction {txid: $txid}) \
     MERGE (a)-[:RELATED_TO]->(t)";

const COUNT_TRANSACTIONS: &str = "MATCH (t:Transaction) RETURN count(t)";
const COUNT_ADDRESSES: &str = "MATCH (a:Address) RETURN count(a)";

// ==============================================================================
// Protocol
// ==============================================================================

#[derive(serde::Serialize)]
struct CypherStatement {
    statement: &'static str,
    parameters: serde_json::Value,
}

#[derive(serde::Serialize)]
struct CommitRequest {
    statements: Vec<CypherStatement>,
}

#[derive(serde::Deserialize, Debug)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<ServerError>,
}

#[derive(serde::Deserialize, Debug)]
struct StatementResult {
    #[serde(default)]
    data: Vec<ResultRow>,
}

#[derive(serde::Deserialize, Debug)]
struct ResultRow {
    #[serde(default)]
    row: Vec<serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct ServerError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn decode_response(body: &str) -> Result<CommitResponse, StoreError> {
    let decoded: CommitResponse = serde_json::from_str(body)
        .map_err(|e| StoreError::InvalidResponse(format!("decode commit response: {e}")))?;

    if let Some(first) = decoded.errors.into_iter().next() {
        return Err(StoreError::Server {
            code: first.code,
            message: first.message,
        });
    }
    Ok(CommitResponse {
        results: decoded.results,
        errors: Vec::new(),
    })
}

// ==============================================================================
// Store
// ==============================================================================

/// Graph store client over the HTTP transactional commit endpoint.
pub struct CypherHttpStore {
    client: reqwest::Client,
    commit_url: String,
    auth: Option<(String, String)>,
}

impl CypherHttpStore {
    pub fn new(config: &StoreConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder uses valid static config");

        let commit_url = format!(
            "{}/db/{}/tx/commit",
            config.uri.trim_end_matches('/'),
            config.database
        );
        let auth = match (&config.user, &config.pass) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Self {
            client,
            commit_url,
            auth,
        }
    }

    async fn commit(&self, statements: Vec<CypherStatement>) -> Result<CommitResponse, StoreError> {
        let request = CommitRequest { statements };
        debug!(url = %self.commit_url, statements = request.statements.len(), "store commit");

        let mut builder = self
            .client
            .post(&self.commit_url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request);
        if let Some((ref user, ref pass)) = self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder.send().await.map_err(StoreError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(StoreError::Transport)?;
        trace!(%status, body = %body, "store commit response");

        if !status.is_success() {
            return Err(StoreError::InvalidResponse(format!(
                "HTTP {status}: {body}"
            )));
        }

        decode_response(&body)
    }

    async fn commit_one(
        &self,
        statement: &'static str,
        parameters: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.commit(vec![CypherStatement {
            statement,
            parameters,
        }])
        .await
        .map(|_| ())
    }

    /// Like [`GraphStore::health`], but surfaces the failure so startup
    /// probes can explain what went wrong.
    pub async fn probe(&self) -> Result<StoreHealth, StoreError> {
        let statements = vec![
            CypherStatement {
                statement: COUNT_TRANSACTIONS,
                parameters: serde_json::json!({}),
            },
            CypherStatement {
                statement: COUNT_ADDRESSES,
                parameters: serde_json::json!({}),
            },
        ];

        let response = self.commit(statements).await?;
        Ok(StoreHealth {
            connected: true,
            transaction_count: first_count(&response, 0),
            address_count: first_count(&response, 1),
        })
    }
}

#[async_trait]
impl GraphStore for CypherHttpStore {
    async fn merge_transaction(
        &self,
        tx: &Transaction,
        verdict: &Verdict,
    ) -> Result<(), StoreError> {
        self.commit_one(
            MERGE_TRANSACTION,
            serde_json::json!({
                "txid": tx.txid.to_string(),
                "is_coinjoin": verdict.is_coinjoin,
                "method": verdict.detection_method.to_string(),
                "score": verdict.score,
                "fee": tx.fee.to_sat(),
                "size": tx.size,
                "vin": tx.inputs.len(),
                "vout": tx.outputs.len(),
            }),
        )
        .await
    }

    async fn merge_address(&self, address: &str, tag: AddressTag) -> Result<(), StoreError> {
        self.commit_one(
            MERGE_ADDRESS,
            serde_json::json!({ "address": address, "tag": tag.as_str() }),
        )
        .await
    }

    async fn link_input(&self, address: &str, txid: &Txid) -> Result<(), StoreError> {
        self.commit_one(
            LINK_INPUT,
            serde_json::json!({ "address": address, "txid": txid.to_string() }),
        )
        .await
    }

    async fn link_output(&self, txid: &Txid, address: &str) -> Result<(), StoreError> {
        self.commit_one(
            LINK_OUTPUT,
            serde_json::json!({ "address": address, "txid": txid.to_string() }),
        )
        .await
    }

    async fn link_related(&self, address: &str, txid: &Txid) -> Result<(), StoreError> {
        self.commit_one(
            LINK_RELATED,
            serde_json::json!({ "address": address, "txid": txid.to_string() }),
        )
        .await
    }

    async fn health(&self) -> StoreHealth {
        match self.probe().await {
            Ok(health) => health,
            Err(err) => {
                debug!(error = %err, "store health probe failed");
                StoreHealth::disconnected()
            }
        }
    }
}

fn first_count(response: &CommitResponse, statement_index: usize) -> u64 {
    response
        .results
        .get(statement_index)
        .and_then(|result| result.data.first())
        .and_then(|row| row.row.first())
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0)
}

// ==============================================================================
// Tests
// ==============================================================================
