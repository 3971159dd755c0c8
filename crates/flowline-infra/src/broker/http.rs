//! HTTP implementation of the broker client.
//!
//! Speaks a small REST protocol against a distributed job-broker service:
//!
//! - `GET  /health` -- reachability probe
//! - `POST /queues/{queue}/jobs` -- submit a job with priority and retry
//!   parameters
//! - `POST /queues/{queue}/pull?wait_secs=N` -- long-poll for the next
//!   delivery (204 when the wait elapses empty)
//! - `POST /deliveries/{receipt}/ack` / `.../nack` -- settle a delivery
//!
//! Connection failures map to `BrokerError::Unreachable`, HTTP error codes
//! to `BrokerError::Status`, and undecodable bodies to
//! `BrokerError::Protocol`, so the queue's retry/circuit wiring can
//! classify them.

use std::time::Duration;

use flowline_core::queue::broker::{BrokerClient, BrokerDelivery, BrokerError, BrokerPush};
use flowline_types::config::BrokerConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Headroom added to the HTTP timeout over the requested long-poll wait.
const PULL_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Broker client over HTTP.
pub struct HttpBrokerClient {
    base_url: String,
    queue: String,
    client: reqwest::Client,
}

impl HttpBrokerClient {
    /// Build a client from broker configuration.
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.pull_wait_secs) + PULL_TIMEOUT_MARGIN)
            .build()
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            queue: config.queue.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(BrokerError::Status(status.as_u16()))
        }
    }
}

fn transport_error(err: reqwest::Error) -> BrokerError {
    if err.is_connect() || err.is_timeout() {
        BrokerError::Unreachable(err.to_string())
    } else {
        BrokerError::Protocol(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PushBody {
    job_id: Uuid,
    task_id: Uuid,
    priority: u8,
    max_attempts: u32,
    backoff_base_ms: u64,
}

#[derive(Deserialize)]
struct DeliveryBody {
    receipt: String,
    job_id: Uuid,
    task_id: Uuid,
    attempt: u32,
}

#[derive(Serialize)]
struct NackBody<'a> {
    error: &'a str,
}

// ---------------------------------------------------------------------------
// BrokerClient impl
// ---------------------------------------------------------------------------

impl BrokerClient for HttpBrokerClient {
    async fn ping(&self) -> Result<(), BrokerError> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(transport_error)?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn push(&self, push: &BrokerPush) -> Result<(), BrokerError> {
        let body = PushBody {
            job_id: push.job_id,
            task_id: push.task_id,
            priority: push.priority,
            max_attempts: push.max_attempts,
            backoff_base_ms: push.backoff_base.as_millis() as u64,
        };
        let response = self
            .client
            .post(self.url(&format!("/queues/{}/jobs", self.queue)))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check_status(response).await?;

        tracing::debug!(job_id = %push.job_id, priority = push.priority, "job pushed to broker");
        Ok(())
    }

    async fn pull(&self, wait: Duration) -> Result<Option<BrokerDelivery>, BrokerError> {
        let response = self
            .client
            .post(self.url(&format!(
                "/queues/{}/pull?wait_secs={}",
                self.queue,
                wait.as_secs()
            )))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        let body: DeliveryBody = response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;

        Ok(Some(BrokerDelivery {
            receipt: body.receipt,
            job_id: body.job_id,
            task_id: body.task_id,
            attempt: body.attempt,
        }))
    }

    async fn ack(&self, receipt: &str) -> Result<(), BrokerError> {
        let response = self
            .client
            .post(self.url(&format!("/deliveries/{receipt}/ack")))
            .send()
            .await
            .map_err(transport_error)?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn nack(&self, receipt: &str, error: &str) -> Result<(), BrokerError> {
        let response = self
            .client
            .post(self.url(&format!("/deliveries/{receipt}/nack")))
            .json(&NackBody { error })
            .send()
            .await
            .map_err(transport_error)?;
        Self::check_status(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
