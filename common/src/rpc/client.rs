use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use log::trace;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSON_RPC_VERSION, RATE_LIMITED_CODE};

pub type JsonRpcResult<T> = Result<T, JsonRpcError>;

// Default timeout applied to every HTTP request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// A plain HTTP JSON-RPC 2.0 client
// One instance is shared across all callers of a gateway, ids are
// allocated from a process wide counter so concurrent calls can be
// matched to their responses in logs
pub struct HttpJsonRpcClient {
    client: reqwest::Client,
    target: String,
    count: AtomicUsize,
}

impl HttpJsonRpcClient {
    pub fn new(target: String) -> Result<Self, JsonRpcError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            target,
            count: AtomicUsize::new(0),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn next_id(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    // Send one request and decode its result field
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> JsonRpcResult<R> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("call: {}", method);
        }

        let request = JsonRpcRequest {
            jsonrpc: JSON_RPC_VERSION,
            id: self.next_id(),
            method,
            params: Some(params),
        };

        let response = self
            .client
            .post(&self.target)
            .json(&request)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(JsonRpcError::RateLimited);
        }

        let body: JsonRpcResponse = serde_json::from_slice(&response.bytes().await?)?;
        if body.jsonrpc != JSON_RPC_VERSION {
            return Err(JsonRpcError::InvalidVersion);
        }

        if let Some(error) = body.error {
            if error.code == RATE_LIMITED_CODE {
                return Err(JsonRpcError::RateLimited);
            }
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
            });
        }

        let result: Value = body.result.ok_or(JsonRpcError::MissingResult)?;
        Ok(serde_json::from_value(result)?)
    }
}

impl std::fmt::Debug for HttpJsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonRpcClient")
            .field("target", &self.target)
            .finish()
    }
}
