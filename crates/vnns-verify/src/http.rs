// crates/vnns-verify/src/http.rs
//
// HTTP relay client for the verification network.
//
// Talks JSON to a relay service that fronts the chain:
//   POST {base}/register-vk      KeyRegistrationRequest -> KeyFinalization
//   POST {base}/submit-proof     ProofStatement         -> { "ticket": "..." }
//   GET  {base}/statement-path   ?blockHash&domainId&aggregationId&statement -> MerklePath
//   GET  {base}/events           ?domain&cursor -> { "events": [...], "cursor": n }
//
// Subscriptions are served by a background task that long-polls `/events`
// and forwards into the returned channel until the receiver is dropped.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use vnns_core::artifact::{KeyFinalization, KeyRegistrationRequest, NetworkTicket, ProofStatement};
use vnns_core::crypto::hash_bytes;
use vnns_core::error::NetworkError;
use vnns_core::event::{EventFilter, NetworkEvent};
use vnns_core::merkle::MerklePath;
use vnns_core::traits::{EventStream, PathQuery, VerificationNetwork};

const EVENT_BUFFER: usize = 256;
const ACCOUNT_HEADER: &str = "x-vnns-account";

#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: NetworkTicket,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    #[serde(default)]
    events: Vec<NetworkEvent>,
    cursor: u64,
}

/// Verification network reached through an HTTP relay.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    /// Base URL of the relay (e.g., "http://127.0.0.1:8545").
    pub base_url: String,
    client: reqwest::Client,
    /// Public account identifier derived from the signing seed.
    account: Option<String>,
    poll_interval: Duration,
}

impl HttpNetwork {
    pub fn new(base_url: &str, request_timeout: Duration, poll_interval: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetworkError::Transport(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            account: None,
            poll_interval,
        })
    }

    /// Identify requests with the account behind `seed`. The seed itself
    /// never leaves the process.
    pub fn with_account_seed(mut self, seed: &str) -> Self {
        self.account = Some(hash_bytes(seed.as_bytes()).to_hex());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.account {
            Some(account) => builder.header(ACCOUNT_HEADER, account),
            None => builder,
        }
    }

    async fn send_json<T>(&self, what: &str, builder: reqwest::RequestBuilder) -> Result<T, NetworkError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = builder.send().await.map_err(|e| classify(what, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                NetworkError::Rejected(format!("{} ({}): {}", what, status, body))
            } else {
                NetworkError::Transport(format!("{} failed ({}): {}", what, status, body))
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| NetworkError::Protocol(format!("{} response parse failed: {}", what, e)))
    }
}

fn classify(what: &str, e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::Timeout
    } else {
        NetworkError::Transport(format!("{} request failed: {}", what, e))
    }
}

#[async_trait]
impl VerificationNetwork for HttpNetwork {
    async fn register_key(
        &self,
        request: &KeyRegistrationRequest,
    ) -> Result<KeyFinalization, NetworkError> {
        let builder = self.request(reqwest::Method::POST, "register-vk").json(request);
        self.send_json("register-vk", builder).await
    }

    async fn submit_statement(
        &self,
        statement: &ProofStatement,
    ) -> Result<NetworkTicket, NetworkError> {
        let builder = self.request(reqwest::Method::POST, "submit-proof").json(statement);
        let response: TicketResponse = self.send_json("submit-proof", builder).await?;
        Ok(response.ticket)
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<EventStream, NetworkError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let relay = self.clone();

        tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                let mut builder = relay
                    .request(reqwest::Method::GET, "events")
                    .query(&[("cursor", cursor.to_string())]);
                if let Some(domain) = filter.domain_id {
                    builder = builder.query(&[("domain", domain.to_string())]);
                }

                match relay.send_json::<EventPage>("events", builder).await {
                    Ok(page) => {
                        cursor = page.cursor.max(cursor);
                        for event in page.events {
                            if !filter.accepts(&event) {
                                continue;
                            }
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Event poll failed: {}", e);
                    }
                }

                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(relay.poll_interval).await;
            }
        });

        Ok(rx)
    }

    async fn statement_path(&self, query: &PathQuery) -> Result<MerklePath, NetworkError> {
        let builder = self.request(reqwest::Method::GET, "statement-path").query(&[
            ("blockHash", query.block_hash.clone()),
            ("domainId", query.domain_id.to_string()),
            ("aggregationId", query.aggregation_id.to_string()),
            ("statement", query.statement.clone()),
        ]);
        self.send_json("statement-path", builder).await
    }
}
