//! Operator alarm channel

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, warn};

use crate::metrics;

#[async_trait]
pub trait Alarm: Send + Sync + 'static {
    /// Deliver an alarm. Delivery failures are logged, never propagated.
    async fn notify(&self, chain: &str, message: &str);
}

/// Alarms that only reach the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlarm;

#[async_trait]
impl Alarm for LogAlarm {
    async fn notify(&self, chain: &str, message: &str) {
        metrics::record_alarm(chain);
        error!(chain, alarm = message, "ALARM");
    }
}

#[derive(Serialize)]
struct AlarmPayload<'a> {
    chain: &'a str,
    message: &'a str,
    timestamp: String,
}

/// Posts alarms as JSON to an operator webhook and logs them
pub struct WebhookAlarm {
    url: String,
    http: Client,
}

impl WebhookAlarm {
    pub fn new(url: impl Into<String>) -> eyre::Result<Self> {
        let url = url.into();
        reqwest::Url::parse(&url).map_err(|e| eyre::eyre!("Invalid alarm webhook URL: {}", e))?;
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl Alarm for WebhookAlarm {
    async fn notify(&self, chain: &str, message: &str) {
        LogAlarm.notify(chain, message).await;

        let payload = AlarmPayload {
            chain,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        match self.http.post(&self.url).json(&payload).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "Alarm webhook rejected the alarm");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to deliver alarm webhook"),
        }
    }
}
