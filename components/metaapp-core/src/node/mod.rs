use std::time::Duration;

use reqwest::Client as HttpClient;
use serde_json::{json, Value as JsonValue};

use crate::config::Config;

/// JSON-RPC 1.0 client for the chain node. Errors are surfaced verbatim;
/// retrying is the caller's decision.
pub struct NodeRpcClient {
    rpc_url: String,
    rpc_username: String,
    rpc_password: String,
    http_client: HttpClient,
}

#[derive(Deserialize, Debug)]
pub struct RpcResponse {
    pub result: Option<JsonValue>,
    pub error: Option<RpcError>,
    pub id: Option<JsonValue>,
}

#[derive(Deserialize, Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl NodeRpcClient {
    pub fn new(config: &Config) -> NodeRpcClient {
        NodeRpcClient {
            rpc_url: config.network.rpc_url.clone(),
            rpc_username: config.network.rpc_username.clone(),
            rpc_password: config.network.rpc_password.clone(),
            http_client: build_http_client(config.resources.rpc_timeout_secs),
        }
    }

    pub async fn block_count(&self) -> Result<u64, String> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| "invalid block height response".to_string())
    }

    pub async fn block_hash(&self, height: u64) -> Result<String, String> {
        let result = self.call("getblockhash", json!([height])).await?;
        expect_string(result, "invalid block hash response")
    }

    /// Raw block bytes, hex encoded (`getblock` verbosity 0).
    pub async fn block_hex(&self, block_hash: &str) -> Result<String, String> {
        let result = self.call("getblock", json!([block_hash, 0])).await?;
        expect_string(result, "invalid block hex response")
    }

    /// Raw transaction bytes, hex encoded (`getrawtransaction` verbosity 0).
    pub async fn raw_tx_hex(&self, txid: &str) -> Result<String, String> {
        let result = self.call("getrawtransaction", json!([txid, 0])).await?;
        expect_string(result, "invalid transaction hex response")
    }

    async fn call(&self, method: &str, params: JsonValue) -> Result<JsonValue, String> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": method,
            "method": method,
            "params": params,
        });
        let response = self
            .http_client
            .post(&self.rpc_url)
            .basic_auth(&self.rpc_username, Some(&self.rpc_password))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("rpc call failed ({})", e))?
            .json::<RpcResponse>()
            .await
            .map_err(|e| format!("unable to parse rpc response ({})", e))?;
        unwrap_envelope(response)
    }
}

pub fn build_http_client(timeout_secs: u64) -> HttpClient {
    HttpClient::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("unable to build http client")
}

fn unwrap_envelope(response: RpcResponse) -> Result<JsonValue, String> {
    if let Some(error) = response.error {
        return Err(format!("rpc error ({}): {}", error.code, error.message));
    }
    response
        .result
        .ok_or_else(|| "rpc response carries neither result nor error".to_string())
}

fn expect_string(result: JsonValue, label: &str) -> Result<String, String> {
    result
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| label.to_string())
}
