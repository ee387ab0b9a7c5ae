//! Ethereum JSON-RPC transport.
//!
//! Reads (`eth_call`, receipts, logs) are retried with backoff. Transactions
//! are sent through `eth_sendTransaction` once, to a node or wallet endpoint
//! that holds the signing key for the configured account.

use crate::config::ClientConfig;
use crate::error::{Result, SahakariError};
use crate::retry::RetryStrategy;
use crate::types::{RawLog, TransactionHash, TransactionStatus, TxReceipt};
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// JSON-RPC request ID type
type RequestId = u64;

/// EIP-1193 code for a request the user declined to sign
const USER_REJECTED_CODE: i64 = 4001;

/// Ethereum JSON-RPC client
#[derive(Clone)]
pub struct JsonRpcClient {
    /// HTTP client
    client: Client,
    /// Endpoint URL
    base_url: String,
    /// Retry strategy
    retry_strategy: RetryStrategy,
    /// Request ID counter
    request_id: Arc<AtomicU64>,
}

/// JSON-RPC request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: RequestId,
    method: String,
    params: Value,
}

/// JSON-RPC response
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: RequestId,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl JsonRpcError {
    fn describe(&self) -> String {
        match self.data.as_ref().and_then(Value::as_str) {
            Some(data) => format!("{} (code: {}, data: {})", self.message, self.code, data),
            None => format!("{} (code: {})", self.message, self.code),
        }
    }
}

/// A contract call ready to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    /// Target contract
    pub to: Address,
    /// ABI-encoded calldata
    pub data: Bytes,
    /// ETH attached to the call
    pub value: U256,
}

impl JsonRpcClient {
    /// Create a new JSON-RPC client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(SahakariError::Network)?;

        Ok(Self {
            client,
            base_url: config.rpc_url.clone(),
            retry_strategy: RetryStrategy::from_config(config),
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    fn next_request_id(&self) -> RequestId {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Single round trip, returning the raw `result` or the node's error
    async fn send_request(&self, method: &str, params: &Value) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_request_id(),
            method: method.to_string(),
            params: params.clone(),
        };

        debug!("JSON-RPC request: {} (id: {})", method, request.id);

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(SahakariError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(SahakariError::RateLimitExceeded(retry_after));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SahakariError::Rpc(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let rpc_response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| SahakariError::InvalidResponse(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            error!("JSON-RPC error on {}: {}", method, error.describe());
            if error.code == USER_REJECTED_CODE {
                return Err(SahakariError::SubmissionRejected(error.message));
            }
            return Err(SahakariError::Rpc(error.describe()));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    /// Make a read-only call, retrying transient failures
    async fn call_rpc(&self, method: &str, params: Value) -> Result<Value> {
        self.retry_strategy
            .retry(|| self.send_request(method, &params))
            .await
    }

    /// Chain id reported by the node
    pub async fn chain_id(&self) -> Result<u64> {
        let result = self.call_rpc("eth_chainId", json!([])).await?;
        parse_quantity_u64(&result, "chain id")
    }

    /// Latest block number
    pub async fn block_number(&self) -> Result<u64> {
        let result = self.call_rpc("eth_blockNumber", json!([])).await?;
        parse_quantity_u64(&result, "block number")
    }

    /// Execute a call against the latest block without sending a transaction
    pub async fn call(&self, from: Address, request: &CallRequest) -> Result<Bytes> {
        let tx = json!({
            "from": format!("{:?}", from),
            "to": format!("{:?}", request.to),
            "data": format!("0x{}", hex::encode(&request.data)),
        });

        let result = self.call_rpc("eth_call", json!([tx, "latest"])).await?;
        let data = result.as_str().ok_or_else(|| {
            SahakariError::InvalidResponse("eth_call result is not a string".to_string())
        })?;

        decode_hex(data).map(Bytes::from)
    }

    /// Send a transaction signed by the node for `from`.
    ///
    /// Never retried. A refusal from the node is
    /// [`SahakariError::SubmissionRejected`]; a failure that leaves open
    /// whether the node took the transaction is
    /// [`SahakariError::SubmissionUnknown`].
    pub async fn send_transaction(
        &self,
        from: Address,
        request: &CallRequest,
    ) -> Result<TransactionHash> {
        let tx = TransactionRequest::new()
            .from(from)
            .to(request.to)
            .data(request.data.clone())
            .value(request.value);

        info!(
            "Sending transaction to {:?} (value: {} wei)",
            request.to, request.value
        );

        let params = json!([tx]);
        let result = self
            .send_request("eth_sendTransaction", &params)
            .await
            .map_err(classify_send_error)?;

        let hash = result
            .as_str()
            .ok_or_else(|| {
                SahakariError::SubmissionUnknown("missing hash in send response".to_string())
            })?
            .to_string();

        info!("Transaction sent: {}", hash);
        Ok(hash)
    }

    /// Receipt for a mined transaction, `None` while pending
    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>> {
        debug!("Fetching receipt: {}", tx_hash);

        let result = self
            .call_rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let status = match result["status"].as_str() {
            Some("0x1") => TransactionStatus::Success,
            Some("0x0") => TransactionStatus::Failed,
            Some(other) => {
                return Err(SahakariError::InvalidResponse(format!(
                    "Unknown receipt status {}",
                    other
                )))
            }
            None => {
                return Err(SahakariError::InvalidResponse(
                    "Missing status in receipt".to_string(),
                ))
            }
        };

        let block_number = result["blockNumber"]
            .as_str()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());
        let gas_used = result["gasUsed"]
            .as_str()
            .and_then(|s| U256::from_str_radix(s.trim_start_matches("0x"), 16).ok());

        Ok(Some(TxReceipt {
            hash: tx_hash.to_string(),
            status,
            block_number,
            gas_used,
        }))
    }

    /// Logs emitted by `addresses` between two blocks, inclusive
    pub async fn get_logs(
        &self,
        addresses: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        debug!(
            "Fetching logs from block {} to {} for {} contracts",
            from_block,
            to_block,
            addresses.len()
        );

        let filter = json!({
            "address": addresses.iter().map(|a| format!("{:?}", a)).collect::<Vec<_>>(),
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        });

        let result = self.call_rpc("eth_getLogs", json!([filter])).await?;
        let entries = result.as_array().ok_or_else(|| {
            SahakariError::InvalidResponse("eth_getLogs result is not an array".to_string())
        })?;

        entries.iter().map(parse_log).collect()
    }

    /// Health check - verify the node answers
    pub async fn health_check(&self) -> Result<u64> {
        match self.chain_id().await {
            Ok(chain_id) => {
                info!("RPC health check passed (chain id {})", chain_id);
                Ok(chain_id)
            }
            Err(e) => {
                error!("RPC health check failed: {:?}", e);
                Err(e)
            }
        }
    }
}

/// Map a failed `eth_sendTransaction` onto the submission taxonomy.
///
/// A JSON-RPC error object means the node answered and refused. A failed
/// connection means nothing was sent. Anything else (gateway status codes,
/// throttling, dropped or garbled responses) leaves it open whether the node
/// accepted the transaction.
fn classify_send_error(err: SahakariError) -> SahakariError {
    match err {
        SahakariError::Rpc(msg) if msg.starts_with("HTTP ") => {
            SahakariError::SubmissionUnknown(msg)
        }
        SahakariError::Rpc(msg) => SahakariError::SubmissionRejected(msg),
        SahakariError::Network(e) if e.is_connect() => {
            SahakariError::SubmissionRejected(e.to_string())
        }
        SahakariError::Network(e) => SahakariError::SubmissionUnknown(e.to_string()),
        SahakariError::RateLimitExceeded(secs) => SahakariError::SubmissionUnknown(format!(
            "rate limited, retry after {} seconds",
            secs
        )),
        SahakariError::InvalidResponse(msg) => SahakariError::SubmissionUnknown(msg),
        other => other,
    }
}

fn decode_hex(data: &str) -> Result<Vec<u8>> {
    hex::decode(data.trim_start_matches("0x"))
        .map_err(|e| SahakariError::InvalidResponse(format!("Invalid hex: {}", e)))
}

fn parse_quantity_u64(value: &Value, what: &str) -> Result<u64> {
    value
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| SahakariError::InvalidResponse(format!("Invalid {}: {}", what, value)))
}

fn parse_log(entry: &Value) -> Result<RawLog> {
    let address = entry["address"]
        .as_str()
        .and_then(|s| Address::from_str(s).ok())
        .ok_or_else(|| SahakariError::InvalidResponse("Missing log address".to_string()))?;

    let topics = entry["topics"]
        .as_array()
        .ok_or_else(|| SahakariError::InvalidResponse("Missing log topics".to_string()))?
        .iter()
        .map(|t| {
            t.as_str()
                .and_then(|s| H256::from_str(s).ok())
                .ok_or_else(|| SahakariError::InvalidResponse(format!("Invalid topic {}", t)))
        })
        .collect::<Result<Vec<_>>>()?;

    let data = decode_hex(entry["data"].as_str().unwrap_or("0x"))?;

    let quantity = |key: &str| {
        entry[key]
            .as_str()
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
    };

    Ok(RawLog {
        address,
        topics,
        data: Bytes::from(data),
        block_number: quantity("blockNumber"),
        transaction_hash: entry["transactionHash"].as_str().map(|s| s.to_string()),
        log_index: quantity("logIndex"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_rpc_client_creation() {
        let client = JsonRpcClient::new(&test_config());
        assert!(client.is_ok());
    }

    #[test]
    fn test_request_id_increment() {
        let client = JsonRpcClient::new(&test_config()).unwrap();
        assert_eq!(client.next_request_id(), 1);
        assert_eq!(client.next_request_id(), 2);
        assert_eq!(client.next_request_id(), 3);
    }

    #[test]
    fn test_parse_log() {
        let entry = serde_json::json!({
            "address": "0x0303030303030303030303030303030303030303",
            "topics": ["0x00000000000000000000000000000000000000000000000000000000000000ff"],
            "data": "0x0102",
            "blockNumber": "0x10",
            "transactionHash": "0xabc",
            "logIndex": "0x2"
        });

        let log = parse_log(&entry).unwrap();
        assert_eq!(log.address, Address::repeat_byte(0x03));
        assert_eq!(log.topics.len(), 1);
        assert_eq!(log.data.to_vec(), vec![1u8, 2u8]);
        assert_eq!(log.block_number, Some(16));
        assert_eq!(log.log_index, Some(2));
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(
            parse_quantity_u64(&serde_json::json!("0xaa36a7"), "chain id").unwrap(),
            11_155_111
        );
        assert!(parse_quantity_u64(&serde_json::json!(12), "chain id").is_err());
    }

    #[test]
    fn test_classify_send_error() {
        assert!(matches!(
            classify_send_error(SahakariError::Rpc("-32000: nonce too low".into())),
            SahakariError::SubmissionRejected(_)
        ));
        assert!(matches!(
            classify_send_error(SahakariError::SubmissionRejected("denied".into())),
            SahakariError::SubmissionRejected(_)
        ));
        assert!(matches!(
            classify_send_error(SahakariError::Rpc("HTTP 504 Gateway Timeout: ".into())),
            SahakariError::SubmissionUnknown(_)
        ));
        assert!(matches!(
            classify_send_error(SahakariError::RateLimitExceeded(2)),
            SahakariError::SubmissionUnknown(_)
        ));
        assert!(matches!(
            classify_send_error(SahakariError::InvalidResponse("eof".into())),
            SahakariError::SubmissionUnknown(_)
        ));
    }
}
