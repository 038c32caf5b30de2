use crate::block::{Block, BlockHeight};
use crate::quantity::{parse_hex_u64, to_hex};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ENDPOINT: &str = "https://eth.getblock.io/mainnet/";
const REQUEST_ID: &str = "getblock.io";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("couldn't call method {method} on eth node")]
    Network {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("eth node returned an unusable response to {method}: {reason}")]
    Protocol { method: &'static str, reason: String },
    #[error("block {0} not found")]
    NotFound(BlockHeight),
}

/// Source of chain data for the aggregator.
#[async_trait]
pub trait LedgerNode: Send + Sync + 'static {
    async fn current_height(&self) -> Result<BlockHeight, FetchError>;

    /// Block at `height` with full transaction objects.
    async fn block_at(&self, height: BlockHeight) -> Result<Block, FetchError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcBody<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client for an Ethereum node behind an API-key protected gateway.
#[derive(Clone, Debug)]
pub struct GetBlockClient {
    client: Client,
    endpoint: String,
}

impl GetBlockClient {
    pub fn new(endpoint: impl Into<String>, api_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.append(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.append(
            "x-api-key",
            HeaderValue::from_str(api_key).context("The API key is not in a valid format")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP Client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Vec<serde_json::Value>,
    ) -> Result<Option<R>, FetchError> {
        let body = JsonRpcBody {
            jsonrpc: "2.0",
            id: REQUEST_ID,
            method,
            params,
        };
        let network = |source| FetchError::Network { method, source };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(network)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Protocol {
                method,
                reason: format!("http status {}", status),
            });
        }

        let bytes = resp.bytes().await.map_err(network)?;
        let resp: JsonRpcResponse<R> = serde_json::from_slice(&bytes).map_err(|err| {
            tracing::debug!(
                method,
                "full response body: {}",
                String::from_utf8_lossy(&bytes)
            );
            FetchError::Protocol {
                method,
                reason: format!("couldn't decode response: {}", err),
            }
        })?;

        if let Some(error) = resp.error {
            return Err(FetchError::Protocol {
                method,
                reason: format!("error {}: {}", error.code, error.message),
            });
        }
        Ok(resp.result)
    }
}

#[async_trait]
impl LedgerNode for GetBlockClient {
    async fn current_height(&self) -> Result<BlockHeight, FetchError> {
        const METHOD: &str = "eth_blockNumber";
        let number: String = self
            .call(METHOD, vec![])
            .await?
            .ok_or_else(|| FetchError::Protocol {
                method: METHOD,
                reason: "missing result".to_string(),
            })?;

        parse_hex_u64(&number).map_err(|err| FetchError::Protocol {
            method: METHOD,
            reason: err.to_string(),
        })
    }

    async fn block_at(&self, height: BlockHeight) -> Result<Block, FetchError> {
        const METHOD: &str = "eth_getBlockByNumber";
        let block: Block = self
            .call(METHOD, vec![to_hex(height).into(), true.into()])
            .await?
            .ok_or(FetchError::NotFound(height))?;

        match block.height() {
            Ok(number) if number == height => Ok(block),
            Ok(number) => Err(FetchError::Protocol {
                method: METHOD,
                reason: format!("asked for block {} but got {}", height, number),
            }),
            Err(err) => Err(FetchError::Protocol {
                method: METHOD,
                reason: err.to_string(),
            }),
        }
    }
}
