//! JSON-RPC 2.0 client for Ethereum-style development nodes.
//!
//! Transactions are sent with `eth_sendTransaction` from an account the node keeps unlocked
//! (as development nodes do for their prefunded accounts) and confirmed by polling
//! `eth_getTransactionReceipt`. Reads use `eth_call` against the latest block.

use super::{Address, B256};
use crate::{
    retry::{poll, Backoff},
    Error,
};
use alloy_primitives::{hex, Bytes, U64};
use alloy_sol_types::{sol, SolCall, SolConstructor};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

sol! {
    contract CertificateRegistry {
        constructor(address owner);

        function addInstitution(address institution) external;

        function issueCertificate(bytes32 certificateHash) external;

        function getCertificateStatus(bytes32 certificateHash)
            external
            view
            returns (uint8 status, uint256 issuedAt, address issuer);
    }
}

/// Configuration for [Dialer].
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on any single HTTP request
    pub request_timeout: Duration,

    /// How long to wait for deployment and authorization transactions to be confirmed
    pub deployment_timeout: Duration,

    /// Schedule for polling transaction receipts
    pub receipt_backoff: Backoff,

    /// Creation bytecode of the registry contract
    pub bytecode: Vec<u8>,
}

/// Compiled contract artifact, either Hardhat (`"bytecode": "0x.."`) or Foundry
/// (`"bytecode": {"object": "0x.."}`) flavored.
#[derive(Deserialize)]
struct Artifact {
    bytecode: Bytecode,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Bytecode {
    Plain(String),
    Object { object: String },
}

/// Load the creation bytecode from a compiled contract artifact.
pub fn load_bytecode(path: &Path) -> Result<Vec<u8>, Error> {
    let file = std::fs::File::open(path)?;
    let artifact: Artifact = serde_json::from_reader(file)?;
    let raw = match artifact.bytecode {
        Bytecode::Plain(raw) => raw,
        Bytecode::Object { object } => object,
    };
    let bytecode = hex::decode(raw).map_err(|e| Error::InvalidArtifact(e.to_string()))?;
    if bytecode.is_empty() {
        return Err(Error::InvalidArtifact(format!(
            "{} has no bytecode",
            path.display()
        )));
    }
    Ok(bytecode)
}

struct Shared {
    http: reqwest::Client,
    next_id: AtomicU64,
    deployment_timeout: Duration,
    receipt_backoff: Backoff,
    bytecode: Vec<u8>,
}

/// Binds [Client]s to node endpoints over a shared HTTP connection pool.
#[derive(Clone)]
pub struct Dialer {
    shared: Arc<Shared>,
}

impl Dialer {
    pub fn new(cfg: Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                http,
                next_id: AtomicU64::new(1),
                deployment_timeout: cfg.deployment_timeout,
                receipt_backoff: cfg.receipt_backoff,
                bytecode: cfg.bytecode,
            }),
        })
    }
}

impl super::Dialer for Dialer {
    type Client = Client;

    fn dial(&self, endpoint: &str) -> Client {
        Client {
            shared: self.shared.clone(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    contract_address: Option<Address>,
}

impl Receipt {
    fn succeeded(&self) -> bool {
        // Pre-Byzantium receipts carry no status; treat them as successful
        self.status.is_none_or(|status| status == U64::from(1))
    }
}

/// Interpret a JSON-RPC result as `T`.
fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, Error> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::MalformedResponse(format!("unexpected {what} {value}: {e}")))
}

/// A JSON-RPC client bound to one node.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    endpoint: Arc<str>,
}

impl Client {
    /// Issue a single JSON-RPC request.
    ///
    /// Transport failures map to [Error::ConnectionFailure]; errors reported by the node map
    /// to [Error::Reverted].
    async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        let connection_failure = |reason: String| Error::ConnectionFailure {
            endpoint: self.endpoint.to_string(),
            reason,
        };
        let response = self
            .shared
            .http
            .post(&*self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| connection_failure(e.to_string()))?;
        if !response.status().is_success() {
            return Err(connection_failure(format!("HTTP {}", response.status())));
        }
        let response: Response = response
            .json()
            .await
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(Error::Reverted(format!("{} (code {})", error.message, error.code)));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Submit a transaction from an unlocked account and return its hash.
    async fn send_transaction(
        &self,
        from: &Address,
        to: Option<&Address>,
        data: &[u8],
    ) -> Result<B256, Error> {
        let mut tx = json!({
            "from": from,
            "data": hex::encode_prefixed(data),
        });
        if let Some(to) = to {
            tx["to"] = json!(to);
        }
        let hash = self.call("eth_sendTransaction", json!([tx])).await?;
        decode("transaction hash", hash)
    }

    /// Poll for the receipt of `hash` until it appears or `limit` elapses.
    async fn wait_for_receipt(&self, hash: B256, limit: Duration) -> Result<Receipt, Error> {
        let receipt = poll(limit, self.shared.receipt_backoff, move || async move {
            match self.call("eth_getTransactionReceipt", json!([hash])).await {
                Ok(Value::Null) => None,
                Ok(value) => Some(decode::<Receipt>("receipt", value)),
                Err(e) => {
                    debug!(endpoint = %self.endpoint, %hash, error = %e, "receipt poll failed");
                    None
                }
            }
        })
        .await;
        match receipt {
            Some(receipt) => receipt,
            None => Err(Error::TransactionTimeout {
                hash: hash.to_string(),
                timeout: limit,
            }),
        }
    }

    /// Send a transaction and require a successful receipt within the deployment timeout.
    async fn transact_confirmed(
        &self,
        from: &Address,
        to: Option<&Address>,
        data: &[u8],
    ) -> Result<Receipt, Error> {
        let hash = self.send_transaction(from, to, data).await?;
        let receipt = self
            .wait_for_receipt(hash, self.shared.deployment_timeout)
            .await?;
        if !receipt.succeeded() {
            return Err(Error::Reverted(format!("transaction {hash} failed")));
        }
        Ok(receipt)
    }
}

impl super::Client for Client {
    async fn block_number(&self) -> Result<u64, Error> {
        let height = self.call("eth_blockNumber", json!([])).await?;
        Ok(decode::<U64>("block number", height)?.to::<u64>())
    }

    async fn deploy(&self, from: &Address) -> Result<Address, Error> {
        let constructor = CertificateRegistry::constructorCall { owner: *from };
        let data = [self.shared.bytecode.as_slice(), &constructor.abi_encode()].concat();
        let receipt = self
            .transact_confirmed(from, None, &data)
            .await
            .map_err(|e| Error::DeploymentFailure(e.to_string()))?;
        receipt
            .contract_address
            .ok_or_else(|| Error::DeploymentFailure("receipt has no contract address".into()))
    }

    async fn authorize(
        &self,
        contract: &Address,
        from: &Address,
        issuer: &Address,
    ) -> Result<(), Error> {
        let call = CertificateRegistry::addInstitutionCall {
            institution: *issuer,
        };
        self.transact_confirmed(from, Some(contract), &call.abi_encode())
            .await
            .map_err(|e| Error::DeploymentFailure(format!("authorization failed: {e}")))?;
        Ok(())
    }

    async fn issue(
        &self,
        contract: &Address,
        from: &Address,
        record: &B256,
        confirmation: Duration,
    ) -> Result<(), Error> {
        let call = CertificateRegistry::issueCertificateCall {
            certificateHash: *record,
        };
        let hash = self
            .send_transaction(from, Some(contract), &call.abi_encode())
            .await
            .map_err(|e| Error::TransactionSubmission(e.to_string()))?;
        let receipt = self.wait_for_receipt(hash, confirmation).await?;
        if !receipt.succeeded() {
            return Err(Error::TransactionSubmission(format!(
                "transaction {hash} reverted"
            )));
        }
        Ok(())
    }

    async fn status(&self, contract: &Address, record: &B256) -> Result<u64, Error> {
        let call = CertificateRegistry::getCertificateStatusCall {
            certificateHash: *record,
        };
        let request = json!({
            "to": contract,
            "data": hex::encode_prefixed(call.abi_encode()),
        });
        let output = self.call("eth_call", json!([request, "latest"])).await?;
        let output: Bytes = decode("call output", output)?;
        if output.is_empty() {
            return Err(Error::Reverted(format!("{record} returned no data")));
        }
        let returns = CertificateRegistry::getCertificateStatusCall::abi_decode_returns(&output)
            .map_err(|e| Error::MalformedResponse(e.to_string()))?;
        Ok(u64::from(returns.status))
    }
}
