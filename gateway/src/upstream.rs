//! Timeout-bounded, retrying client for the per-domain upstream APIs.

use crate::config::{DomainsConfig, GatewayConfig};
use crate::errors::UpstreamError;
use crate::metrics_defs::{UPSTREAM_ATTEMPT, UPSTREAM_FAILURE};
use crate::normalizer::RawPayload;
use crate::types::{Domain, VehicleIdentity};
use async_trait::async_trait;
use bytes::Bytes;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use url::Url;

pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A single HTTP GET against an upstream, body included. Dropping the returned
/// future cancels the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: Url) -> Result<TransportResponse, UpstreamError>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        ReqwestTransport {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: Url) -> Result<TransportResponse, UpstreamError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        Ok(TransportResponse { status, body })
    }
}

/// Attempt budget, exponential backoff and per-attempt timeout. Independent of
/// any domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
            attempt_timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Delay between attempt `attempt` and `attempt + 1`, counting from 1:
    /// `base, 2 * base, 4 * base, ...`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    domains: DomainsConfig,
}

impl UpstreamClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, domains: DomainsConfig) -> Self {
        UpstreamClient {
            transport,
            policy,
            domains,
        }
    }

    pub fn from_config(config: &GatewayConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            transport,
            config.upstream.retry_policy(),
            config.domains.clone(),
        )
    }

    /// Fetches and parses the domain's payload for a vehicle. Every failed
    /// attempt, whether timeout, non-2xx status, transport error or
    /// unparseable body, is retried until the attempt budget is spent.
    pub async fn fetch(
        &self,
        domain: Domain,
        identity: &VehicleIdentity,
    ) -> Result<RawPayload, UpstreamError> {
        let url = self.request_url(domain, identity);
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            counter!(UPSTREAM_ATTEMPT, "domain" => domain.as_str()).increment(1);

            let err = match self.attempt(domain, url.clone()).await {
                Ok(payload) => {
                    tracing::debug!(%domain, attempt, "upstream attempt succeeded");
                    return Ok(payload);
                }
                Err(err) => err,
            };

            counter!(UPSTREAM_FAILURE, "domain" => domain.as_str(), "reason" => failure_reason(&err))
                .increment(1);

            if attempt >= max_attempts {
                tracing::warn!(%domain, attempts = attempt, error = %err, "upstream retries exhausted");
                return Err(UpstreamError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.backoff(attempt);
            tracing::info!(
                %domain,
                attempt,
                max_attempts,
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "upstream attempt failed, backing off"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, domain: Domain, url: Url) -> Result<RawPayload, UpstreamError> {
        let attempt_timeout = self.policy.attempt_timeout();

        // Elapsed timeout drops the transport future, cancelling the request
        let response = timeout(attempt_timeout, self.transport.get(url))
            .await
            .map_err(|_| UpstreamError::Timeout(attempt_timeout))??;

        if !(200..300).contains(&response.status) {
            return Err(UpstreamError::Status(response.status));
        }

        RawPayload::parse(domain, &response.body).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    fn request_url(&self, domain: Domain, identity: &VehicleIdentity) -> Url {
        let mut url = self.domains.get(domain).base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            match identity {
                VehicleIdentity::Vin(vin) => {
                    query.append_pair("vin", vin);
                }
                VehicleIdentity::YearMakeModel { year, make, model } => {
                    query
                        .append_pair("modelYear", &year.to_string())
                        .append_pair("make", make)
                        .append_pair("model", model);
                }
            }
        }
        url
    }
}

fn failure_reason(err: &UpstreamError) -> &'static str {
    match err {
        UpstreamError::Timeout(_) => "timeout",
        UpstreamError::Status(_) => "status",
        UpstreamError::Malformed(_) => "malformed",
        UpstreamError::Transport(_) => "transport",
        UpstreamError::RetriesExhausted { .. } => "exhausted",
    }
}
