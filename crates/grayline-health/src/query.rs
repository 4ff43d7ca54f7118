//! Metric query client.
//!
//! [`MetricsQuery`] abstracts the time-series backend. [`PrometheusClient`]
//! speaks the Prometheus HTTP API (`/api/v1/query_range`) over a plain
//! hyper HTTP/1 connection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One sample: unix timestamp in seconds and value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

/// A labeled series returned by a range query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: HashMap<String, String>,
    /// Oldest first.
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn latest(&self) -> Option<Sample> {
        self.samples.last().copied()
    }

    /// Whether every `(key, value)` in `wanted` is present on this series.
    pub fn matches_labels(&self, wanted: &HashMap<String, String>) -> bool {
        wanted
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// Range queries against a time-series backend.
pub trait MetricsQuery: Send + Sync {
    /// Query `expr` over `[start, end]` (unix seconds) at `step` resolution.
    fn query_range<'a>(
        &'a self,
        expr: &'a str,
        start: u64,
        end: u64,
        step: Duration,
    ) -> BoxFuture<'a, Result<Vec<TimeSeries>, QueryError>>;
}

/// Prometheus HTTP API client.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    /// `host:port` of the Prometheus server.
    address: String,
}

impl PrometheusClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn range_url(&self, expr: &str, start: u64, end: u64, step: Duration) -> Result<url::Url, QueryError> {
        let mut url = url::Url::parse(&format!("http://{}/api/v1/query_range", self.address))
            .map_err(|e| QueryError::Request(format!("bad prometheus address: {e}")))?;
        url.query_pairs_mut()
            .append_pair("query", expr)
            .append_pair("start", &start.to_string())
            .append_pair("end", &end.to_string())
            .append_pair("step", &format!("{}s", step.as_secs().max(1)));
        Ok(url)
    }

    async fn get(&self, url: &url::Url) -> Result<(u16, bytes::Bytes), QueryError> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| QueryError::Connect {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let req = http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "grayline-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| QueryError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| QueryError::Request(e.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

impl MetricsQuery for PrometheusClient {
    fn query_range<'a>(
        &'a self,
        expr: &'a str,
        start: u64,
        end: u64,
        step: Duration,
    ) -> BoxFuture<'a, Result<Vec<TimeSeries>, QueryError>> {
        Box::pin(async move {
            let url = self.range_url(expr, start, end, step)?;
            let (status, body) = self.get(&url).await?;
            debug!(%expr, status, bytes = body.len(), "prometheus range query");
            decode_matrix(status, &body)
        })
    }
}

#[derive(Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    data: Option<MatrixData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct MatrixData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<MatrixSeries>,
}

#[derive(Deserialize)]
struct MatrixSeries {
    #[serde(default)]
    metric: HashMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

fn decode_matrix(status: u16, body: &[u8]) -> Result<Vec<TimeSeries>, QueryError> {
    let envelope: ApiEnvelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) if (200..300).contains(&status) => return Err(QueryError::Decode(e.to_string())),
        Err(_) => {
            return Err(QueryError::Backend {
                status,
                message: String::from_utf8_lossy(body).into_owned(),
            });
        }
    };

    if envelope.status != "success" {
        return Err(QueryError::Backend {
            status,
            message: envelope.error.unwrap_or_else(|| "unknown error".into()),
        });
    }
    let data = envelope
        .data
        .ok_or_else(|| QueryError::Decode("missing data".into()))?;
    if data.result_type != "matrix" {
        return Err(QueryError::Decode(format!(
            "expected matrix result, got {}",
            data.result_type
        )));
    }

    data.result
        .into_iter()
        .map(|series| {
            let samples = series
                .values
                .into_iter()
                .map(|(timestamp, raw)| {
                    raw.parse::<f64>()
                        .map(|value| Sample { timestamp, value })
                        .map_err(|_| QueryError::Decode(format!("bad sample value {raw:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(TimeSeries {
                labels: series.metric,
                samples,
            })
        })
        .collect()
}
