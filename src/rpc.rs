use serde_json::{json, Value};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// Three-way submit classification. This is the only information the
/// dispatcher needs from the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Submitted { tx_id: String },
    RejectedByChain { reason: String },
    NetworkError { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Confirmed,
    Pending,
    Failed(String),
    Unknown,
}

/// Settlement-chain RPC seam. Both calls are suspension points with a bounded
/// timeout; transport failures during a status poll degrade to `Unknown`
/// rather than erroring.
pub trait SettlementRpc: Send + Sync {
    fn submit(&self, tx_blob_b64: &str) -> impl Future<Output = SubmitResult> + Send;

    fn get_tx_status(&self, tx_id: &str) -> impl Future<Output = TxStatus> + Send;
}

/// JSON-RPC 2.0 client for the settlement chain (`sendTransaction` /
/// `getSignatureStatuses`). Submissions share a fixed pool of permits so a
/// slow RPC cannot pile up unbounded outcalls; waiters are served FIFO.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl HttpRpcClient {
    pub fn new(url: String, timeout: Duration, max_in_flight: usize) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| eyre::eyre!("failed to build http client: {e}"))?;
        Ok(Self {
            url,
            http,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, RpcCallError> {
        let req = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RpcCallError::Network(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcCallError::Network(format!("failed to decode JSON: {e}")))?;

        if !status.is_success() {
            return Err(RpcCallError::Network(format!("HTTP {status}: {body}")));
        }

        if let Some(err) = body.get("error") {
            return Err(RpcCallError::Chain(err.to_string()));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| RpcCallError::Network("missing result field".to_string()))
    }
}

enum RpcCallError {
    /// Transport-level problem: timeout, connection failure, garbage body.
    Network(String),
    /// The node answered with a JSON-RPC error object.
    Chain(String),
}

impl SettlementRpc for HttpRpcClient {
    async fn submit(&self, tx_blob_b64: &str) -> SubmitResult {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return SubmitResult::NetworkError {
                    reason: "submission pool closed".to_string(),
                }
            }
        };

        let params = json!([tx_blob_b64, { "encoding": "base64" }]);
        match self.rpc("sendTransaction", params).await {
            Ok(Value::String(tx_id)) => SubmitResult::Submitted { tx_id },
            Ok(other) => SubmitResult::NetworkError {
                reason: format!("unexpected sendTransaction result: {other}"),
            },
            Err(RpcCallError::Chain(reason)) => SubmitResult::RejectedByChain { reason },
            Err(RpcCallError::Network(reason)) => SubmitResult::NetworkError { reason },
        }
    }

    async fn get_tx_status(&self, tx_id: &str) -> TxStatus {
        let params = json!([[tx_id]]);
        let res = match self.rpc("getSignatureStatuses", params).await {
            Ok(v) => v,
            Err(RpcCallError::Chain(reason)) | Err(RpcCallError::Network(reason)) => {
                tracing::warn!(tx_id, %reason, "status poll failed");
                return TxStatus::Unknown;
            }
        };

        let entry = res.get("value").and_then(|v| v.get(0));
        match entry {
            None | Some(Value::Null) => TxStatus::Unknown,
            Some(entry) => {
                if let Some(err) = entry.get("err").filter(|e| !e.is_null()) {
                    return TxStatus::Failed(err.to_string());
                }
                match entry.get("confirmationStatus").and_then(|c| c.as_str()) {
                    Some("confirmed") | Some("finalized") => TxStatus::Confirmed,
                    _ => TxStatus::Pending,
                }
            }
        }
    }
}

/// Scripted in-memory RPC used by tests and local development, in the same
/// spirit as a mock settlement mode: submissions drain a queue of prepared
/// results, status polls drain a queue of statuses.
#[derive(Default)]
pub struct MockRpc {
    submits: std::sync::Mutex<std::collections::VecDeque<SubmitResult>>,
    statuses: std::sync::Mutex<std::collections::VecDeque<TxStatus>>,
    submitted: std::sync::Mutex<Vec<String>>,
    gate: Option<Gate>,
}

/// Lets a test hold a submit mid-flight: the mock signals `entered`, then
/// waits for `release` before answering.
pub struct Gate {
    pub entered: tokio::sync::Notify,
    pub release: tokio::sync::Notify,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Gate {
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }),
            ..Self::default()
        }
    }

    pub fn gate(&self) -> Option<&Gate> {
        self.gate.as_ref()
    }

    pub fn script_submit(&self, result: SubmitResult) {
        self.submits.lock().unwrap().push_back(result);
    }

    pub fn script_status(&self, status: TxStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    /// Base64 blobs seen so far, in submission order.
    pub fn submitted_blobs(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }
}

impl SettlementRpc for MockRpc {
    async fn submit(&self, tx_blob_b64: &str) -> SubmitResult {
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.submitted.lock().unwrap().push(tx_blob_b64.to_string());
        self.submits
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitResult::NetworkError {
                reason: "mock: no scripted submit result".to_string(),
            })
    }

    async fn get_tx_status(&self, _tx_id: &str) -> TxStatus {
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(TxStatus::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_drains_script_in_order() {
        let rpc = MockRpc::new();
        rpc.script_submit(SubmitResult::Submitted {
            tx_id: "sig1".into(),
        });
        rpc.script_submit(SubmitResult::RejectedByChain {
            reason: "nope".into(),
        });

        assert_eq!(
            rpc.submit("blob-a").await,
            SubmitResult::Submitted {
                tx_id: "sig1".into()
            }
        );
        assert_eq!(
            rpc.submit("blob-b").await,
            SubmitResult::RejectedByChain {
                reason: "nope".into()
            }
        );
        // Exhausted script degrades to a network error, never a panic.
        assert!(matches!(
            rpc.submit("blob-c").await,
            SubmitResult::NetworkError { .. }
        ));
        assert_eq!(rpc.submitted_blobs(), vec!["blob-a", "blob-b", "blob-c"]);
    }

    #[tokio::test]
    async fn unscripted_status_is_unknown() {
        let rpc = MockRpc::new();
        assert_eq!(rpc.get_tx_status("sig").await, TxStatus::Unknown);
    }
}
