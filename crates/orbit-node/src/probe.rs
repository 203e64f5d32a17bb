//! Outbound liveness and latency probing.
//!
//! Probes issue a HEAD request against an external target from the
//! host's own network stack. They are a reachability/quality signal for
//! the target URL, not a measurement through the managed tunnel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use tracing::debug;

use orbit_types::{NodeError, NodeResult};

use crate::document::TaggedSlot;
use crate::store::ConfigStore;

/// Default probe target; returns 204 with an empty body.
pub const DEFAULT_PROBE_URL: &str = "https://www.google.com/generate_204";
/// Default per-request timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default sample count for latency averaging.
pub const DEFAULT_PROBE_SAMPLES: u32 = 3;

/// One probe result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeOutcome {
    pub success: bool,
    /// Round-trip time in milliseconds (also reported for failures).
    pub latency: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated latency over several serial samples.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyReport {
    /// Integer-rounded average of the successful samples; absent when
    /// every sample failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
    /// Latencies of the successful samples, in order.
    pub samples: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// HEAD-probing client bound to the config store for tag validation.
pub struct OutboundProber {
    store: Arc<ConfigStore>,
    client: reqwest::Client,
}

impl OutboundProber {
    /// Build a prober sharing the node's config store.
    pub fn new(store: Arc<ConfigStore>) -> NodeResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build probe HTTP client")?;
        Ok(Self { store, client })
    }

    /// Probe once on behalf of `tag`.
    ///
    /// The tag must name an existing outbound; the request itself goes
    /// over the host network.
    pub async fn test(
        &self,
        tag: &str,
        url: Option<&str>,
        timeout: Option<Duration>,
    ) -> NodeResult<ProbeOutcome> {
        self.ensure_outbound(tag).await?;
        Ok(self
            .head(
                url.unwrap_or(DEFAULT_PROBE_URL),
                timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT),
            )
            .await)
    }

    /// Probe `samples` times serially and average the successes.
    pub async fn latency(
        &self,
        tag: &str,
        url: Option<&str>,
        timeout: Option<Duration>,
        samples: Option<u32>,
    ) -> NodeResult<LatencyReport> {
        self.ensure_outbound(tag).await?;

        let url = url.unwrap_or(DEFAULT_PROBE_URL);
        let timeout = timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT);
        let samples = samples.unwrap_or(DEFAULT_PROBE_SAMPLES).max(1);

        let mut successes = Vec::new();
        let mut last_error = None;
        for _ in 0..samples {
            let outcome = self.head(url, timeout).await;
            if outcome.success {
                successes.push(outcome.latency);
            } else {
                last_error = outcome.error;
            }
        }

        if successes.is_empty() {
            return Ok(LatencyReport {
                latency: None,
                samples: Vec::new(),
                error: Some(last_error.unwrap_or_else(|| "All samples failed".to_string())),
            });
        }

        let sum: u64 = successes.iter().sum();
        let average = (sum as f64 / successes.len() as f64).round() as u64;
        Ok(LatencyReport {
            latency: Some(average),
            samples: successes,
            error: None,
        })
    }

    async fn ensure_outbound(&self, tag: &str) -> NodeResult<()> {
        if self
            .store
            .get_tagged(TaggedSlot::Outbounds, tag)
            .await?
            .is_none()
        {
            return Err(NodeError::not_found(format!(
                "outbound '{}' not found",
                tag
            )));
        }
        Ok(())
    }

    async fn head(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let start = Instant::now();
        let result = self.client.head(url).timeout(timeout).send().await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    ProbeOutcome {
                        success: true,
                        latency,
                        error: None,
                    }
                } else {
                    ProbeOutcome {
                        success: false,
                        latency,
                        error: Some(format!("Unexpected status: {}", status.as_u16())),
                    }
                }
            }
            Err(e) if e.is_timeout() => ProbeOutcome {
                success: false,
                latency,
                error: Some("Connection timeout".to_string()),
            },
            Err(e) => {
                debug!(url, error = %e, "probe request failed");
                ProbeOutcome {
                    success: false,
                    latency,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
