//! InfluxDB v2 write API sink.
//!
//! Records are posted as line protocol to `/api/v2/write` with nanosecond
//! precision. Every call is a single HTTP request; retries are the flush
//! coordinator's business.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use tracing::debug;

use fieldlog_core::{Record, Sink, SinkError, SinkResult, line};

use crate::config::SinkConfig;

/// Sink writing to an InfluxDB v2 bucket.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    token: String,
    timeout: Duration,
}

impl InfluxSink {
    /// Create a sink from validated settings.
    ///
    /// No request is made until the first write.
    pub fn new(config: &SinkConfig) -> SinkResult<Self> {
        let write_url = write_url(&config.url, &config.org, &config.bucket)?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SinkError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
            timeout: config.timeout(),
        })
    }

    /// URL every write is posted to.
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    async fn post(&self, body: String, count: usize) -> SinkResult<()> {
        let response = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if status.is_success() {
            debug!("Wrote {} record(s) to {}", count, self.write_url);
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            message: message.trim().to_string(),
        })
    }

    fn map_error(&self, error: reqwest::Error) -> SinkError {
        if error.is_timeout() {
            SinkError::Timeout(self.timeout)
        } else {
            SinkError::Unavailable(error.to_string())
        }
    }
}

/// Build `{base}/api/v2/write?org=..&bucket=..&precision=ns`.
fn write_url(base: &str, org: &str, bucket: &str) -> SinkResult<Url> {
    let endpoint = format!("{}/api/v2/write", base.trim_end_matches('/'));
    Url::parse_with_params(
        &endpoint,
        &[("org", org), ("bucket", bucket), ("precision", "ns")],
    )
    .map_err(|e| SinkError::Unavailable(format!("invalid store URL '{}': {}", base, e)))
}

/// Newline-joined line protocol for a batch.
fn body(records: &[Record]) -> String {
    records
        .iter()
        .map(line::encode)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, record: &Record) -> SinkResult<()> {
        self.post(line::encode(record), 1).await
    }

    async fn write_batch(&self, records: &[Record]) -> SinkResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.post(body(records), records.len()).await
    }
}
