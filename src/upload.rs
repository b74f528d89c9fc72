//! Upload client: gzip-compressed JSON POST with bounded retries and
//! exponential backoff. Exhausted retries defer the batch to the offline
//! store instead of dropping it; durability substitutes for delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Client, StatusCode};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::retry::RetryPolicy;
use crate::store::OfflineStore;
use crate::types::{DataPoint, UploadEnvelope};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONCURRENT_UPLOADS: usize = 3;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compress: {0}")]
    Compress(#[from] std::io::Error),
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {0}, expected 201")]
    Status(StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Server acknowledged with 201.
    Delivered,
    /// Not delivered now; persisted whole for the offline replayer.
    Deferred,
}

/// The compressed-POST path shared by live uploads and offline replay.
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// POST one gzipped envelope body. Ok only on HTTP 201; retries with
    /// backoff happen inside.
    async fn send_compressed(&self, body: Vec<u8>) -> Result<(), UploadError>;
}

/// What the session controller needs from the upload pipeline. Split out so
/// the tick loop can be tested without a network.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Hand a full batch to the pipeline. Returns immediately; delivery or
    /// deferral happens on a bounded background task.
    async fn submit(self: Arc<Self>, points: Vec<DataPoint>);

    /// Wait (bounded) for in-flight uploads to settle at shutdown.
    async fn drain(&self, grace: Duration) -> bool;
}

pub fn compress_envelope(envelope: &UploadEnvelope) -> Result<Vec<u8>, UploadError> {
    let json = serde_json::to_vec(envelope)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub struct UploadClient {
    http: Client,
    ingest_url: String,
    device_uuid: String,
    session_start: DateTime<Utc>,
    sleep_interval: u64,
    policy: RetryPolicy,
    store: Arc<OfflineStore>,
    permits: Arc<Semaphore>,
}

impl UploadClient {
    pub fn new(
        ingest_url: String,
        device_uuid: String,
        sleep_interval: u64,
        policy: RetryPolicy,
        store: Arc<OfflineStore>,
    ) -> Result<Self, UploadError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            ingest_url,
            device_uuid,
            session_start: Utc::now(),
            sleep_interval,
            policy,
            store,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
        })
    }

    fn envelope(&self, points: Vec<DataPoint>) -> UploadEnvelope {
        UploadEnvelope {
            device_uuid: self.device_uuid.clone(),
            session_timestamp: self.session_start,
            sleep_time: self.sleep_interval,
            payload: points,
        }
    }

    async fn post_once(&self, body: Vec<u8>) -> Result<(), UploadError> {
        let response = self
            .http
            .post(&self.ingest_url)
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
            .body(body)
            .send()
            .await?;
        if response.status() == StatusCode::CREATED {
            Ok(())
        } else {
            Err(UploadError::Status(response.status()))
        }
    }

    /// One batch through the whole pipeline: compress, POST with retries,
    /// defer to disk on exhaustion. Never an error to the caller — a batch
    /// is atomically either accepted by the server or persisted whole.
    pub async fn upload(&self, points: Vec<DataPoint>) -> Outcome {
        let count = points.len();
        let envelope = self.envelope(points);
        let body = match compress_envelope(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "could not build upload body, deferring batch");
                return self.defer(&envelope);
            }
        };

        match self.send_compressed(body).await {
            Ok(()) => {
                info!(points = count, "batch delivered");
                Outcome::Delivered
            }
            Err(e) => {
                warn!(error = %e, points = count, "all upload attempts failed, deferring batch");
                self.defer(&envelope)
            }
        }
    }

    fn defer(&self, envelope: &UploadEnvelope) -> Outcome {
        if let Err(e) = self.store.save(envelope) {
            // The one place data can actually be lost; say so loudly.
            error!(error = %e, "FAILED to persist deferred batch, data lost");
        }
        Outcome::Deferred
    }
}

#[async_trait]
impl BatchSender for UploadClient {
    async fn send_compressed(&self, body: Vec<u8>) -> Result<(), UploadError> {
        let mut attempts = 0u32;
        loop {
            match self.post_once(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if self.policy.is_exhausted(attempts) {
                        return Err(e);
                    }
                    let wait = self.policy.backoff(attempts - 1);
                    warn!(error = %e, attempt = attempts, wait_s = wait.as_secs_f64(),
                        "upload attempt failed, backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[async_trait]
impl BatchSink for UploadClient {
    async fn submit(self: Arc<Self>, points: Vec<DataPoint>) {
        // The permit is taken before the task exists: a fourth ready batch
        // queues here instead of fanning out, and a drain that follows a
        // submit always waits for the submitted batch to settle.
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let _permit = permit;
            self.upload(points).await;
        });
    }

    async fn drain(&self, grace: Duration) -> bool {
        let all = MAX_CONCURRENT_UPLOADS as u32;
        match tokio::time::timeout(grace, self.permits.acquire_many(all)).await {
            Ok(Ok(_permit)) => true,
            _ => {
                warn!("shutdown grace period expired with uploads still in flight");
                false
            }
        }
    }
}
