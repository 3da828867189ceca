// SPDX-License-Identifier: Apache-2.0

//! Telemetry client and background submitter.
//!
//! Handlers hand finished items to a cheap-clone [`TelemetryClient`]; a
//! background task turns them into envelopes and posts them to the ingestion
//! endpoint in batches, on a flush interval or when a batch fills. Tracking
//! never blocks the pipeline: if the queue is full the item is dropped.

pub mod envelope;

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use envelope::{Envelope, EnvelopeContext, Telemetry};

pub const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Submit when this many items have accumulated, regardless of the interval.
const BATCH_MAX: usize = 1024;

const QUEUE_SIZE: usize = 2048;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialization-time telemetry constants; never mutated after start.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub ikey: String,
    pub endpoint: Option<String>,
    pub role: String,
    pub role_instance: String,
    pub custom_properties: HashMap<String, String>,
    pub flush_interval: Duration,
}

impl TelemetryConfig {
    /// Role and role instance default to the machine hostname.
    pub fn new(ikey: String) -> TelemetryConfig {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        TelemetryConfig {
            ikey,
            endpoint: None,
            role: hostname.clone(),
            role_instance: hostname,
            custom_properties: HashMap::new(),
            flush_interval: Duration::from_secs(3),
        }
    }
}

enum Command {
    Track(Box<Telemetry>),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Handle for tracking telemetry. Cloned into every handler.
#[derive(Clone)]
pub struct TelemetryClient {
    tx: BoundedSender<Command>,
}

impl TelemetryClient {
    /// Spawn the submitter task and return its handle. Must be called from
    /// within a tokio runtime.
    pub fn start(config: TelemetryConfig) -> TelemetryClient {
        let (tx, rx) = bounded(QUEUE_SIZE);
        tokio::spawn(submit_loop(config, rx));
        TelemetryClient { tx }
    }

    /// Queue an item for submission. Never blocks; a full queue drops the
    /// item.
    pub fn track(&self, item: Telemetry) {
        if let Err(e) = self.tx.try_send(Command::Track(Box::new(item))) {
            debug!(error = %e, "telemetry item dropped");
        }
    }

    /// Submit everything queued so far, waiting at most `bound`. Used on
    /// shutdown.
    pub async fn flush(&self, bound: Duration) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(Command::Flush(ack_tx)).await.is_ok() {
            if tokio::time::timeout(bound, ack_rx).await.is_err() {
                warn!("telemetry flush timed out");
            }
        }
    }
}

async fn submit_loop(config: TelemetryConfig, mut rx: BoundedReceiver<Command>) {
    let endpoint = config
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string());

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default();

    let ctx = EnvelopeContext {
        ikey: config.ikey,
        role: config.role,
        role_instance: config.role_instance,
        custom_properties: config.custom_properties,
    };

    let mut batch: Vec<Envelope> = Vec::new();

    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            cmd = rx.next() => match cmd {
                Some(Command::Track(item)) => {
                    batch.push(item.into_envelope(&ctx));
                    if batch.len() >= BATCH_MAX {
                        submit(&client, &endpoint, &mut batch).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    submit(&client, &endpoint, &mut batch).await;
                    let _ = ack.send(());
                }
                None => {
                    // Every client handle is gone; final drain
                    submit(&client, &endpoint, &mut batch).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                submit(&client, &endpoint, &mut batch).await;
            }
        }
    }
}

/// Post the batch as newline-delimited JSON envelopes. Failures are logged
/// and the batch is dropped; upload retry is the endpoint's problem, not the
/// forwarder's.
async fn submit(client: &reqwest::Client, endpoint: &str, batch: &mut Vec<Envelope>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len();
    let mut body = String::with_capacity(count * 256);
    for env in batch.drain(..) {
        match serde_json::to_string(&env) {
            Ok(line) => {
                body.push_str(&line);
                body.push('\n');
            }
            Err(e) => warn!(error = %e, "failed to serialize telemetry envelope"),
        }
    }

    match client
        .post(endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/x-json-stream")
        .body(body)
        .send()
        .await
    {
        Ok(resp) if resp.status().is_success() => {
            debug!(count, "submitted telemetry batch");
        }
        Ok(resp) => {
            warn!(status = %resp.status(), count, "telemetry endpoint rejected batch");
        }
        Err(e) => {
            warn!(error = %e, count, "failed to submit telemetry batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::envelope::{SeverityLevel, TraceTelemetry};

    #[test]
    fn config_defaults_roles_to_hostname() {
        let config = TelemetryConfig::new("ikey".to_string());
        assert!(!config.role.is_empty());
        assert_eq!(config.role, config.role_instance);
        assert!(config.endpoint.is_none());
    }

    #[tokio::test]
    async fn flush_is_bounded_even_when_endpoint_is_down() {
        let mut config = TelemetryConfig::new("ikey".to_string());
        // Nothing listens here; submission fails fast and flush returns
        config.endpoint = Some("http://127.0.0.1:9/v2/track".to_string());
        config.flush_interval = Duration::from_secs(3600);

        let client = TelemetryClient::start(config);
        client.track(Telemetry::Trace(TraceTelemetry::new(
            "line".to_string(),
            SeverityLevel::Information,
        )));

        let started = std::time::Instant::now();
        client.flush(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
