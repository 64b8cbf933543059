use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::SimulatorConfig;
use crate::error::NodeClientError;

// Wire constants
const PASSWORD_NEEDED: &str = "Password needed";
const TX_ID_MARKER: &str = "trnxid ";
const IDENTITY_TYPE: u8 = 4;
const QUORUM_ENTRY_TYPE: u8 = 2;
const RBT_TRANSFER_TYPE: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedIdentity {
    pub identity: String,
    pub peer_id: String,
}

/// Operations against one node's local HTTP surface.
///
/// Every call is bounded by a timeout; calls that need a signature go
/// through the password handshake and may wait much longer.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn start(&self) -> Result<(), NodeClientError>;
    async fn shutdown(&self) -> Result<(), NodeClientError>;
    /// `true` once the node reports itself up.
    async fn status(&self) -> Result<bool, NodeClientError>;
    async fn ping(&self) -> Result<(), NodeClientError>;
    async fn create_identity(&self, password: &str) -> Result<CreatedIdentity, NodeClientError>;
    async fn register_identity(&self, identity: &str, password: &str)
        -> Result<(), NodeClientError>;
    async fn configure_topology(&self, consensus: &[String]) -> Result<(), NodeClientError>;
    async fn get_topology(&self) -> Result<Vec<String>, NodeClientError>;
    async fn setup_consensus_role(
        &self,
        identity: &str,
        password: &str,
        key_password: &str,
    ) -> Result<(), NodeClientError>;
    async fn get_balance(&self, identity: &str) -> Result<f64, NodeClientError>;
    async fn request_funding(
        &self,
        identity: &str,
        units: u32,
        password: &str,
    ) -> Result<(), NodeClientError>;
    /// Returns the transaction id reported by the node.
    async fn initiate_transfer(
        &self,
        sender: &str,
        receiver: &str,
        amount: f64,
        memo: &str,
        password: &str,
    ) -> Result<String, NodeClientError>;
    async fn peer_count(&self) -> Result<usize, NodeClientError>;

    /// Poll `status` until the node is up or `timeout` elapses.
    async fn wait_until_ready(
        &self,
        timeout: Duration,
        backoff: &Backoff,
    ) -> Result<(), NodeClientError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempt = 0u32;

        loop {
            if let Ok(true) = self.status().await {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(NodeClientError::Timeout(timeout));
            }

            attempt += 1;
            if attempt % 5 == 0 {
                debug!(attempt, elapsed = ?now - started, "still waiting for node");
            }
            sleep(backoff.delay(attempt - 1).min(deadline - now)).await;
        }
    }
}

/// Builds clients for the node listening on a given port.
pub trait ClientFactory: Send + Sync {
    fn client(&self, port: u16) -> Arc<dyn NodeApi>;
}

/// Truncate to the three decimals the ledger accepts. Never rounds up, so
/// the amount on the wire stays within the balance it was checked against.
pub fn round_amount(amount: f64) -> f64 {
    // absorb representation error such as 1.001 * 1000.0 = 1000.9999999999999
    (amount * 1000.0 + 1e-9).trunc() / 1000.0
}

/// Pull `<id>` out of a "... with trnxid <id>" confirmation.
pub fn extract_tx_id(message: &str) -> Option<String> {
    let start = message.find(TX_ID_MARKER)? + TX_ID_MARKER.len();
    let id = message[start..].split_whitespace().next()?;
    (!id.is_empty()).then(|| id.to_string())
}

// Response shapes

#[derive(Debug, Deserialize)]
struct Envelope<T = Value> {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SigningRequest {
    id: String,
    #[serde(default)]
    mode: i64,
}

#[derive(Debug, Deserialize)]
struct CreatedDid {
    #[serde(default)]
    did: String,
    #[serde(rename = "peerID", default)]
    peer_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuorumEntry {
    #[serde(rename = "type")]
    kind: u8,
    address: String,
}

#[derive(Debug, Deserialize)]
struct AccountReply {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    account_info: Vec<AccountInfo>,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(default)]
    rbt_amount: f64,
}

#[derive(Debug, Deserialize)]
struct PeerCountReply {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(rename = "peerCount", default)]
    peer_count: usize,
}

#[derive(Debug, Deserialize)]
struct TransferResult {
    #[serde(default)]
    transaction_id: String,
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    sender: &'a str,
    receiver: &'a str,
    #[serde(rename = "tokenCOunt")]
    token_count: f64,
    comment: &'a str,
    #[serde(rename = "type")]
    kind: u8,
}

/// What a signature-gated call ended with.
enum Signed {
    /// The node answered without asking for a password.
    Direct(Envelope),
    Confirmed { request_id: String, message: String },
}

async fn read_body(response: Response) -> Result<String, NodeClientError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(NodeClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(operation: &'static str, body: &str) -> Result<T, NodeClientError> {
    serde_json::from_str(body).map_err(|e| NodeClientError::Decode {
        operation,
        detail: e.to_string(),
    })
}

fn accepted<T>(operation: &'static str, reply: Envelope<T>) -> Result<Envelope<T>, NodeClientError> {
    if reply.status {
        Ok(reply)
    } else {
        Err(NodeClientError::Rejected {
            operation,
            message: reply.message,
        })
    }
}

/// HTTP client bound to one node.
#[derive(Clone, Debug)]
pub struct NodeClient {
    base_url: String,
    http: Client,
    signing: Client,
}

impl NodeClient {
    pub fn new(
        port: u16,
        request_timeout: Duration,
        signing_timeout: Duration,
    ) -> Result<Self, NodeClientError> {
        Self::with_base_url(
            format!("http://localhost:{}", port),
            request_timeout,
            signing_timeout,
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        request_timeout: Duration,
        signing_timeout: Duration,
    ) -> Result<Self, NodeClientError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        let signing = Client::builder().timeout(signing_timeout).build()?;
        Ok(Self::with_clients(base_url, http, signing))
    }

    /// Reuse pooled clients; `signing` carries the long handshake timeout.
    pub fn with_clients(base_url: impl Into<String>, http: Client, signing: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            signing,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, NodeClientError> {
        let body = read_body(request.send().await?).await?;
        decode(operation, &body)
    }

    /// Send a request that may answer with a password challenge, and
    /// complete the challenge if it does.
    async fn signed_call(
        &self,
        operation: &'static str,
        request: RequestBuilder,
        password: &str,
    ) -> Result<Signed, NodeClientError> {
        let reply: Envelope = self.call(operation, request).await?;
        if !(reply.status && reply.message == PASSWORD_NEEDED) {
            return accepted(operation, reply).map(Signed::Direct);
        }

        let challenge: SigningRequest = reply
            .result
            .map(serde_json::from_value::<SigningRequest>)
            .transpose()
            .map_err(|e| NodeClientError::Decode {
                operation,
                detail: e.to_string(),
            })?
            .ok_or(NodeClientError::Decode {
                operation,
                detail: "password challenge without request id".into(),
            })?;

        debug!(operation, request_id = %challenge.id, mode = challenge.mode, "answering signing challenge");
        let started = Instant::now();
        let confirmation: Envelope = self
            .call(
                operation,
                self.signing.post(self.url("/api/signature-response")).json(&json!({
                    "id": challenge.id,
                    "mode": challenge.mode,
                    "password": password,
                })),
            )
            .await?;
        let confirmation = accepted(operation, confirmation)?;
        debug!(operation, elapsed = ?started.elapsed(), message = %confirmation.message, "signing confirmed");

        Ok(Signed::Confirmed {
            request_id: challenge.id,
            message: confirmation.message,
        })
    }

    async fn simple(&self, operation: &'static str, request: RequestBuilder) -> Result<(), NodeClientError> {
        let reply: Envelope = self.call(operation, request).await?;
        accepted(operation, reply).map(|_| ())
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn start(&self) -> Result<(), NodeClientError> {
        self.simple("start", self.http.get(self.url("/api/start"))).await
    }

    async fn shutdown(&self) -> Result<(), NodeClientError> {
        self.simple("shutdown", self.http.post(self.url("/api/shutdown")))
            .await
    }

    async fn status(&self) -> Result<bool, NodeClientError> {
        let reply: Envelope = self
            .call("node-status", self.http.get(self.url("/api/node-status")))
            .await?;
        Ok(reply.status)
    }

    async fn ping(&self) -> Result<(), NodeClientError> {
        read_body(self.http.get(self.url("/api/ping")).send().await?)
            .await
            .map(|_| ())
    }

    async fn create_identity(&self, password: &str) -> Result<CreatedIdentity, NodeClientError> {
        let did_config = json!({
            "Type": IDENTITY_TYPE,
            "priv_pwd": password,
            "mnemonic_file": "",
            "childPath": 0,
        });
        let form = reqwest::multipart::Form::new().text("did_config", did_config.to_string());

        let reply: Envelope<CreatedDid> = self
            .call(
                "createdid",
                self.http.post(self.url("/api/createdid")).multipart(form),
            )
            .await?;
        let created = accepted("createdid", reply)?
            .result
            .filter(|r| !r.did.is_empty())
            .ok_or(NodeClientError::Decode {
                operation: "createdid",
                detail: "no identity in response".into(),
            })?;

        Ok(CreatedIdentity {
            identity: created.did,
            peer_id: created.peer_id,
        })
    }

    async fn register_identity(
        &self,
        identity: &str,
        password: &str,
    ) -> Result<(), NodeClientError> {
        let request = self
            .http
            .post(self.url("/api/register-did"))
            .json(&json!({ "did": identity }));
        self.signed_call("register-did", request, password).await?;
        Ok(())
    }

    async fn configure_topology(&self, consensus: &[String]) -> Result<(), NodeClientError> {
        let entries: Vec<QuorumEntry> = consensus
            .iter()
            .map(|address| QuorumEntry {
                kind: QUORUM_ENTRY_TYPE,
                address: address.clone(),
            })
            .collect();
        self.simple(
            "addquorum",
            self.http.post(self.url("/api/addquorum")).json(&entries),
        )
        .await
    }

    async fn get_topology(&self) -> Result<Vec<String>, NodeClientError> {
        let reply: Envelope<Vec<QuorumEntry>> = self
            .call("getallquorum", self.http.get(self.url("/api/getallquorum")))
            .await?;
        Ok(accepted("getallquorum", reply)?
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|entry| entry.address)
            .collect())
    }

    async fn setup_consensus_role(
        &self,
        identity: &str,
        password: &str,
        key_password: &str,
    ) -> Result<(), NodeClientError> {
        self.simple(
            "setup-quorum",
            self.http.post(self.url("/api/setup-quorum")).json(&json!({
                "did": identity,
                "password": password,
                "priv_password": key_password,
            })),
        )
        .await
    }

    async fn get_balance(&self, identity: &str) -> Result<f64, NodeClientError> {
        let reply: AccountReply = self
            .call(
                "get-account-info",
                self.http
                    .get(self.url("/api/get-account-info"))
                    .query(&[("did", identity)]),
            )
            .await?;
        if !reply.status {
            return Err(NodeClientError::Rejected {
                operation: "get-account-info",
                message: reply.message,
            });
        }
        reply
            .account_info
            .first()
            .map(|info| info.rbt_amount)
            .ok_or_else(|| NodeClientError::MissingAccount(identity.to_string()))
    }

    async fn request_funding(
        &self,
        identity: &str,
        units: u32,
        password: &str,
    ) -> Result<(), NodeClientError> {
        let request = self
            .http
            .post(self.url("/api/generate-test-token"))
            .json(&json!({ "number_of_tokens": units, "did": identity }));
        self.signed_call("generate-test-token", request, password)
            .await?;
        Ok(())
    }

    async fn initiate_transfer(
        &self,
        sender: &str,
        receiver: &str,
        amount: f64,
        memo: &str,
        password: &str,
    ) -> Result<String, NodeClientError> {
        let payload = TransferRequest {
            sender,
            receiver,
            token_count: round_amount(amount),
            comment: memo,
            kind: RBT_TRANSFER_TYPE,
        };
        info!(sender = %crate::model::short(sender), receiver = %crate::model::short(receiver), amount = payload.token_count, "initiating transfer");

        let request = self
            .http
            .post(self.url("/api/initiate-rbt-transfer"))
            .json(&payload);
        match self
            .signed_call("initiate-rbt-transfer", request, password)
            .await?
        {
            Signed::Confirmed {
                request_id,
                message,
            } => Ok(extract_tx_id(&message).unwrap_or_else(|| {
                warn!(%request_id, "no transaction id in confirmation, using request id");
                request_id
            })),
            Signed::Direct(reply) => Ok(reply
                .result
                .and_then(|r| serde_json::from_value::<TransferResult>(r).ok())
                .map(|r| r.transaction_id)
                .unwrap_or_default()),
        }
    }

    async fn peer_count(&self) -> Result<usize, NodeClientError> {
        let reply: PeerCountReply = self
            .call(
                "get-peer-count",
                self.http.get(self.url("/api/get-peer-count")),
            )
            .await?;
        if !reply.status {
            return Err(NodeClientError::Rejected {
                operation: "get-peer-count",
                message: reply.message,
            });
        }
        Ok(reply.peer_count)
    }
}

/// Hands out `NodeClient`s for `localhost:<port>` sharing two pooled clients.
#[derive(Clone, Debug)]
pub struct HttpClientFactory {
    http: Client,
    signing: Client,
}

impl HttpClientFactory {
    pub fn new(config: &SimulatorConfig) -> Result<Self, NodeClientError> {
        Ok(Self {
            http: Client::builder().timeout(config.request_timeout()).build()?,
            signing: Client::builder().timeout(config.signing_timeout()).build()?,
        })
    }
}

impl ClientFactory for HttpClientFactory {
    fn client(&self, port: u16) -> Arc<dyn NodeApi> {
        Arc::new(NodeClient::with_clients(
            format!("http://localhost:{}", port),
            self.http.clone(),
            self.signing.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_truncate_to_three_decimals() {
        assert_eq!(round_amount(0.4), 0.4);
        assert_eq!(round_amount(1.23456), 1.234);
        assert_eq!(round_amount(9.9996), 9.999);
        assert_eq!(round_amount(1.001), 1.001);
        assert_eq!(round_amount(0.8 * 0.5), 0.4);
        assert_eq!(round_amount(7.0), 7.0);
    }

    #[test]
    fn tx_id_from_confirmation() {
        let message = "Transfer finished successfully in 5m51.7s with trnxid 08765414814e03e9 ";
        assert_eq!(extract_tx_id(message).as_deref(), Some("08765414814e03e9"));
        assert_eq!(extract_tx_id("Transfer finished successfully"), None);
        assert_eq!(extract_tx_id("with trnxid "), None);
    }

    #[test]
    fn quorum_entries_use_wire_names() {
        let entry = QuorumEntry {
            kind: QUORUM_ENTRY_TYPE,
            address: "bafy".into(),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"type": 2, "address": "bafy"})
        );
    }
}
