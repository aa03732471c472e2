//! Downstream analytics reporting.
//!
//! `send` is fire-and-forget: implementations never report failure to the caller and
//! never block on delivery.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::circuit::CircuitBreaker;
use crate::config::EngineConfig;
use crate::logging::{self, log_sink_failure, ts_epoch_ms, ts_now, v_str, Domain, Level};

pub trait AnalyticsSink {
    fn send(&mut self, event_name: &str, properties: &Map<String, Value>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl AnalyticsSink for NullSink {
    fn send(&mut self, _event_name: &str, _properties: &Map<String, Value>) {}
}

/// Forwards events into the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AnalyticsSink for LogSink {
    fn send(&mut self, event_name: &str, properties: &Map<String, Value>) {
        let mut fields = properties.clone();
        fields.insert("sink_event".to_string(), v_str(event_name));
        logging::log(Level::Debug, Domain::Sink, "forward", fields);
    }
}

pub type SentEvents = Arc<Mutex<Vec<(String, Map<String, Value>)>>>;

/// Keeps every event; clones of the handle observe what was sent.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    sent: SentEvents,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> SentEvents {
        Arc::clone(&self.sent)
    }
}

impl AnalyticsSink for MemorySink {
    fn send(&mut self, event_name: &str, properties: &Map<String, Value>) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((event_name.to_string(), properties.clone()));
        }
    }
}

// =============================================================================
// HTTP webhook
// =============================================================================

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const WEBHOOK_COOLDOWN_MS: u64 = 30_000;

/// JSON POST per event, spawned on a tokio runtime. A breaker stops sending after
/// consecutive failures and probes again after a cooldown.
pub struct WebhookSink {
    client: reqwest::Client,
    endpoint: Url,
    runtime: tokio::runtime::Handle,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl WebhookSink {
    pub fn new(endpoint: &str, runtime: tokio::runtime::Handle, failure_threshold: u32) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("unsupported sink scheme {}", endpoint.scheme());
        }
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint,
            runtime,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new(failure_threshold, WEBHOOK_COOLDOWN_MS))),
        })
    }

    pub fn breaker(&self) -> Arc<Mutex<CircuitBreaker>> {
        Arc::clone(&self.breaker)
    }
}

impl AnalyticsSink for WebhookSink {
    fn send(&mut self, event_name: &str, properties: &Map<String, Value>) {
        let allowed = self.breaker.lock().map(|mut b| b.allow(ts_epoch_ms())).unwrap_or(false);
        if !allowed {
            return;
        }
        let payload = json!({
            "event": event_name,
            "properties": properties,
            "ts": ts_now(),
        });
        let request = self.client.post(self.endpoint.clone()).json(&payload);
        let breaker = Arc::clone(&self.breaker);
        let name = event_name.to_string();
        self.runtime.spawn(async move {
            let outcome = match request.send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(format!("status {}", resp.status())),
                Err(err) => Err(err.to_string()),
            };
            if let Ok(mut b) = breaker.lock() {
                match outcome {
                    Ok(()) => b.record_success(),
                    Err(reason) => {
                        b.record_failure(ts_epoch_ms());
                        log_sink_failure(&name, &reason, b.failures);
                    }
                }
            }
        });
    }
}

/// Why a configured webhook URL will not be used.
fn webhook_unavailable(cfg: &EngineConfig, has_runtime: bool) -> Option<&'static str> {
    match (&cfg.sink_url, has_runtime) {
        (Some(_), false) => Some("webhook sink needs a tokio runtime"),
        _ => None,
    }
}

/// Webhook when a URL and runtime are available, otherwise the log forwarder.
pub fn from_config(cfg: &EngineConfig, runtime: Option<tokio::runtime::Handle>) -> Box<dyn AnalyticsSink> {
    if let Some(reason) = webhook_unavailable(cfg, runtime.is_some()) {
        log_sink_failure("configure", reason, 0);
    }
    match (&cfg.sink_url, runtime) {
        (Some(url), Some(rt)) => match WebhookSink::new(url, rt, cfg.sink_failure_threshold) {
            Ok(sink) => Box::new(sink),
            Err(err) => {
                log_sink_failure("configure", &format!("{:#}", err), 0);
                Box::new(LogSink)
            }
        },
        _ => Box::new(LogSink),
    }
}
