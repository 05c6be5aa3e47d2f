use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use umbra_common::{
    crypto::{Ed25519Signature, PublicKey},
    rpc::{client::HttpJsonRpcClient, JsonRpcError},
};

// Confidence level requested for a ledger query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

// Options forwarded with a transaction submission
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SendOptions {
    pub skip_preflight: bool,
    pub commitment: Commitment,
    pub max_retries: u32,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            skip_preflight: true,
            commitment: Commitment::Confirmed,
            max_retries: 3,
        }
    }
}

// Observed status of a submitted signature
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureStatus {
    pub confirmation: Option<Commitment>,
    pub error: Option<String>,
}

impl SignatureStatus {
    pub fn is_confirmed(&self) -> bool {
        self.error.is_none() && self.confirmation >= Some(Commitment::Confirmed)
    }
}

/// Abstract RPC surface of the ledger.
///
/// The executor and gateway only ever talk to this trait so tests can
/// swap in a scriptable stub ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    // Recent block identifier used to sign transfers
    async fn latest_blockhash(&self, commitment: Commitment) -> Result<String, JsonRpcError>;

    // Balance of an address in native units
    async fn balance(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<u64, JsonRpcError>;

    // Submit a signed transaction, returns its on-chain signature
    async fn send_transaction(
        &self,
        transaction: &str,
        options: &SendOptions,
    ) -> Result<Ed25519Signature, JsonRpcError>;

    // Batched status query for in-flight signatures
    async fn signature_statuses(
        &self,
        signatures: &[Ed25519Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, JsonRpcError>;

    // Raw account bytes, None when the account does not exist
    async fn account_data(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<Option<Vec<u8>>, JsonRpcError>;
}

// Wire shapes of the JSON-RPC endpoint

#[derive(Deserialize)]
struct RpcEnvelope<T> {
    value: T,
}

#[derive(Deserialize)]
struct BlockhashValue {
    blockhash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignatureStatus {
    confirmation_status: Option<Commitment>,
    err: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AccountValue {
    // (base64 data, encoding tag)
    data: (String, String),
}

/// JSON-RPC client for a Solana compatible endpoint.
pub struct HttpLedger {
    client: HttpJsonRpcClient,
}

impl HttpLedger {
    pub fn new(endpoint: String) -> Result<Self, JsonRpcError> {
        Ok(Self {
            client: HttpJsonRpcClient::new(endpoint)?,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.client.target()
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn latest_blockhash(&self, commitment: Commitment) -> Result<String, JsonRpcError> {
        let response: RpcEnvelope<BlockhashValue> = self
            .client
            .call("getLatestBlockhash", &json!([{ "commitment": commitment }]))
            .await?;
        Ok(response.value.blockhash)
    }

    async fn balance(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<u64, JsonRpcError> {
        let response: RpcEnvelope<u64> = self
            .client
            .call(
                "getBalance",
                &json!([address.to_base58(), { "commitment": commitment }]),
            )
            .await?;
        Ok(response.value)
    }

    async fn send_transaction(
        &self,
        transaction: &str,
        options: &SendOptions,
    ) -> Result<Ed25519Signature, JsonRpcError> {
        let signature: String = self
            .client
            .call(
                "sendTransaction",
                &json!([transaction, {
                    "encoding": "base58",
                    "skipPreflight": options.skip_preflight,
                    "preflightCommitment": options.commitment,
                    "maxRetries": options.max_retries,
                }]),
            )
            .await?;

        Ed25519Signature::from_base58(&signature)
            .map_err(|e| JsonRpcError::InvalidValue(e.to_string()))
    }

    async fn signature_statuses(
        &self,
        signatures: &[Ed25519Signature],
    ) -> Result<Vec<Option<SignatureStatus>>, JsonRpcError> {
        let encoded: Vec<String> = signatures.iter().map(|s| s.to_base58()).collect();
        let response: RpcEnvelope<Vec<Option<RawSignatureStatus>>> = self
            .client
            .call(
                "getSignatureStatuses",
                &json!([encoded, { "searchTransactionHistory": false }]),
            )
            .await?;

        Ok(response
            .value
            .into_iter()
            .map(|raw| {
                raw.map(|raw| SignatureStatus {
                    confirmation: raw.confirmation_status,
                    error: raw.err.map(|e| e.to_string()),
                })
            })
            .collect())
    }

    async fn account_data(
        &self,
        address: &PublicKey,
        commitment: Commitment,
    ) -> Result<Option<Vec<u8>>, JsonRpcError> {
        let response: RpcEnvelope<Option<AccountValue>> = self
            .client
            .call(
                "getAccountInfo",
                &json!([address.to_base58(), {
                    "commitment": commitment,
                    "encoding": "base64",
                }]),
            )
            .await?;

        match response.value {
            Some(account) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(account.data.0.as_bytes())
                    .map_err(|e| JsonRpcError::InvalidValue(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }
}
