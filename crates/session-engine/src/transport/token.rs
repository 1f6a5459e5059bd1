//! Credential tokens and the renewal background task.
//!
//! Renewal runs on a deadline of `expires_at - refresh_lead`. A failed
//! fetch is retried on a short interval instead of waiting a full TTL
//! cycle, so a single transient failure never silently kills the session.
//! The transport's own "token will expire" warning feeds the same path as
//! a redundant trigger against client-side timer drift.

use crate::errors::EngineError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection timeout for the credential HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request timeout for the credential HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A short-lived transport credential.
#[derive(Clone)]
pub struct CredentialToken {
    pub value: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl CredentialToken {
    #[must_use]
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: SecretString::from(value.into()),
            expires_at,
        }
    }

    /// Seconds until expiry; zero if already expired.
    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(0) as u64
    }
}

impl fmt::Debug for CredentialToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Fetches fresh credentials from the external token service.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> Result<CredentialToken, EngineError>;
}

/// Wire format of the credential service response.
#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_in: u64,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// HTTP fetcher against the platform credential service.
pub struct HttpTokenFetcher {
    client: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    channel: String,
    identity: String,
}

impl HttpTokenFetcher {
    /// Build a fetcher for the given credential endpoint.
    pub fn new(
        endpoint: String,
        api_key: SecretString,
        channel: String,
        identity: String,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            channel,
            identity,
        })
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    #[instrument(skip_all)]
    async fn fetch(&self) -> Result<CredentialToken, EngineError> {
        debug!(
            target: "engine.token",
            endpoint = %self.endpoint,
            channel = %self.channel,
            "Requesting credential token"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&serde_json::json!({
                "channel": self.channel,
                "identity": self.identity,
            }))
            .send()
            .await
            .map_err(|e| EngineError::TokenRenewal(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                target: "engine.token",
                status = %status,
                "Credential service rejected token request"
            );
            return Err(EngineError::TokenRenewal(format!("status {status}")));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| EngineError::TokenRenewal(format!("invalid response: {e}")))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(body.expires_in as i64);
        debug!(
            target: "engine.token",
            expires_in_secs = body.expires_in,
            "Credential token acquired"
        );
        Ok(CredentialToken::new(body.token, expires_at))
    }
}

/// Commands into the renewal task.
#[derive(Debug, Clone, Copy)]
pub enum RenewalCommand {
    /// Renew immediately, regardless of the computed deadline. Sent when
    /// the transport itself warns the token will expire soon.
    RenewNow,
}

/// Spawn the background renewal task.
///
/// Renewed tokens are delivered on `renewed_tx`; the engine applies them
/// to the transport. The task exits when `cancel` fires or the receiver
/// side is dropped — cancellation is the first step of session teardown,
/// so no renewal can race a torn-down transport handle.
pub fn spawn_renewal_task(
    initial: CredentialToken,
    fetcher: Arc<dyn TokenFetcher>,
    refresh_lead: Duration,
    retry_interval: Duration,
    mut force_rx: mpsc::Receiver<RenewalCommand>,
    renewed_tx: mpsc::Sender<CredentialToken>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut expires_at = initial.expires_at;

        loop {
            let sleep_for = sleep_until_renewal(expires_at, refresh_lead);
            debug!(
                target: "engine.token",
                sleep_secs = sleep_for.as_secs(),
                "Renewal scheduled"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(target: "engine.token", "Renewal task cancelled");
                    break;
                }
                () = tokio::time::sleep(sleep_for) => {}
                cmd = force_rx.recv() => {
                    match cmd {
                        Some(RenewalCommand::RenewNow) => {
                            info!(
                                target: "engine.token",
                                "Transport signalled imminent expiry, renewing now"
                            );
                        }
                        None => break,
                    }
                }
            }

            match fetcher.fetch().await {
                Ok(token) => {
                    expires_at = token.expires_at;
                    info!(
                        target: "engine.token",
                        ttl_secs = token.ttl_secs(),
                        "Token renewed"
                    );
                    if renewed_tx.send(token).await.is_err() {
                        debug!(target: "engine.token", "Receiver dropped, stopping renewal task");
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "engine.token",
                        error = %e,
                        retry_secs = retry_interval.as_secs(),
                        "Token renewal failed, scheduling short retry"
                    );
                    // Pull the next deadline in so the retry happens on the
                    // short interval instead of a full TTL cycle.
                    expires_at = Utc::now()
                        + chrono::Duration::from_std(refresh_lead + retry_interval)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                }
            }
        }
    })
}

/// Time until `expires_at - refresh_lead`, floored at one second.
fn sleep_until_renewal(expires_at: DateTime<Utc>, refresh_lead: Duration) -> Duration {
    let lead = chrono::Duration::from_std(refresh_lead)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let renew_at = expires_at - lead;
    let until = (renew_at - Utc::now()).num_seconds().max(1) as u64;
    Duration::from_secs(until)
}
