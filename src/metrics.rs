// Prometheus client for WireGuard exporter byte counters

use crate::error::MetricsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

const SENT_METRIC: &str = "wireguard_sent_bytes_total";
const RECEIVED_METRIC: &str = "wireguard_received_bytes_total";

/// Cumulative counters for one address at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSample {
    pub address: IpAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub sampled_at: DateTime<Utc>,
}

impl UsageSample {
    pub fn total(&self) -> u64 {
        self.bytes_sent.saturating_add(self.bytes_received)
    }
}

/// Anything that can report cumulative usage for an address
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// `window` shifts the evaluation instant into the past; None = latest
    async fn query(
        &self,
        address: IpAddr,
        window: Option<Duration>,
    ) -> Result<UsageSample, MetricsError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Debug, Deserialize)]
struct Series {
    value: (f64, String),
}

/// HTTP client for the Prometheus instant-query API
pub struct MetricsClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl MetricsClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Unreachable(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Run one instant query and sum every returned series
    async fn instant_query(
        &self,
        promql: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Option<(u64, DateTime<Utc>)>, MetricsError> {
        let mut params = vec![("query", promql.to_string())];
        if let Some(at) = at {
            params.push(("time", at.timestamp().to_string()));
        }

        log::debug!("Prometheus query: {promql}");

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Backend(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        parse_query_response(&body)
    }

    fn map_transport_error(&self, e: reqwest::Error) -> MetricsError {
        if e.is_timeout() {
            MetricsError::Timeout(self.timeout)
        } else {
            MetricsError::Unreachable(e.to_string())
        }
    }
}

#[async_trait]
impl UsageSource for MetricsClient {
    async fn query(
        &self,
        address: IpAddr,
        window: Option<Duration>,
    ) -> Result<UsageSample, MetricsError> {
        let at = match window {
            Some(window) => {
                let window = chrono::Duration::from_std(window)
                    .map_err(|e| MetricsError::Malformed(format!("window out of range: {e}")))?;
                Some(Utc::now() - window)
            }
            None => None,
        };

        let (bytes_sent, sent_at) = self
            .instant_query(&counter_query(SENT_METRIC, address), at)
            .await?
            .ok_or(MetricsError::Empty(address))?;

        let (bytes_received, received_at) = self
            .instant_query(&counter_query(RECEIVED_METRIC, address), at)
            .await?
            .ok_or(MetricsError::Empty(address))?;

        Ok(UsageSample {
            address,
            bytes_sent,
            bytes_received,
            sampled_at: sent_at.max(received_at),
        })
    }
}

/// `sum(metric{allowed_ips="10.8.0.2/32"})`
fn counter_query(metric: &str, address: IpAddr) -> String {
    let prefix = match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    format!("sum({metric}{{allowed_ips=\"{address}/{prefix}\"}})")
}

fn parse_query_response(body: &str) -> Result<Option<(u64, DateTime<Utc>)>, MetricsError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| MetricsError::Malformed(e.to_string()))?;

    if response.status != "success" {
        let detail = response.error.unwrap_or_default();
        return Err(MetricsError::Backend(
            format!("{} {}", response.status, detail).trim().to_string(),
        ));
    }

    let series = response.data.map(|d| d.result).unwrap_or_default();
    if series.is_empty() {
        return Ok(None);
    }

    let mut total = 0u64;
    let mut latest: Option<DateTime<Utc>> = None;
    for Series { value: (ts, raw) } in series {
        let value: f64 = raw
            .parse()
            .map_err(|_| MetricsError::Malformed(format!("non-numeric sample value '{raw}'")))?;
        if !value.is_finite() || value < 0.0 {
            return Err(MetricsError::Malformed(format!("invalid counter value {value}")));
        }
        total = total.saturating_add(value.round() as u64);

        let at = timestamp_to_datetime(ts)
            .ok_or_else(|| MetricsError::Malformed(format!("invalid timestamp {ts}")))?;
        latest = Some(latest.map_or(at, |l| l.max(at)));
    }

    Ok(latest.map(|at| (total, at)))
}

fn timestamp_to_datetime(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = ((ts.fract()) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Throwaway HTTP server answering each request with `respond(request_line)`
    async fn spawn_backend(respond: fn(&str) -> (u16, String)) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let request = String::from_utf8_lossy(&buf);
                    let request_line = request.lines().next().unwrap_or_default().to_string();
                    let (code, body) = respond(&request_line);
                    let response = format!(
                        "HTTP/1.1 {code} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        format!("http://{addr}/api/v1/query")
    }

    fn vector(ts: f64, value: &str) -> String {
        format!(
            r#"{{"status":"success","data":{{"resultType":"vector","result":[{{"metric":{{}},"value":[{ts},"{value}"]}}]}}}}"#
        )
    }

    fn addr() -> IpAddr {
        "10.8.0.2".parse().unwrap()
    }

    #[test]
    fn test_counter_query_shape() {
        assert_eq!(
            counter_query(SENT_METRIC, addr()),
            r#"sum(wireguard_sent_bytes_total{allowed_ips="10.8.0.2/32"})"#
        );
        assert_eq!(
            counter_query(RECEIVED_METRIC, "fd42::2".parse().unwrap()),
            r#"sum(wireguard_received_bytes_total{allowed_ips="fd42::2/128"})"#
        );
    }

    #[test]
    fn test_parse_sums_series() {
        let body = r#"{"status":"success","data":{"result":[
            {"value":[1700000000.5,"100"]},
            {"value":[1700000001,"2.5e2"]}
        ]}}"#;
        let (total, at) = parse_query_response(body).unwrap().unwrap();
        assert_eq!(total, 350);
        assert_eq!(at.timestamp(), 1_700_000_001);
    }

    #[test]
    fn test_parse_empty_result() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert!(parse_query_response(body).unwrap().is_none());
    }

    #[test]
    fn test_parse_error_status() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        assert!(matches!(
            parse_query_response(body),
            Err(MetricsError::Backend(msg)) if msg.contains("parse error")
        ));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_query_response("<html>"),
            Err(MetricsError::Malformed(_))
        ));
        let body = r#"{"status":"success","data":{"result":[{"value":[1700000000,"NaN"]}]}}"#;
        assert!(matches!(
            parse_query_response(body),
            Err(MetricsError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_query_combines_sent_and_received() {
        let endpoint = spawn_backend(|line| {
            if line.contains(SENT_METRIC) {
                (200, vector(1700000000.0, "700000000"))
            } else {
                (200, vector(1700000002.0, "500000000"))
            }
        })
        .await;

        let client = MetricsClient::new(endpoint, Duration::from_secs(5)).unwrap();
        let sample = client.query(addr(), None).await.unwrap();
        assert_eq!(sample.bytes_sent, 700_000_000);
        assert_eq!(sample.bytes_received, 500_000_000);
        assert_eq!(sample.total(), 1_200_000_000);
        assert_eq!(sample.sampled_at.timestamp(), 1_700_000_002);
    }

    #[tokio::test]
    async fn test_query_empty_result_is_error() {
        let endpoint = spawn_backend(|_| {
            (
                200,
                r#"{"status":"success","data":{"result":[]}}"#.to_string(),
            )
        })
        .await;

        let client = MetricsClient::new(endpoint, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.query(addr(), None).await,
            Err(MetricsError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn test_query_http_error_status() {
        let endpoint = spawn_backend(|_| (503, "{}".to_string())).await;

        let client = MetricsClient::new(endpoint, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.query(addr(), None).await,
            Err(MetricsError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_query_unreachable_backend() {
        // Bind then drop so the port is closed
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_closed = listener.local_addr().unwrap();
        drop(listener);

        let client = MetricsClient::new(
            format!("http://{addr_closed}/api/v1/query"),
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(matches!(
            client.query(addr(), None).await,
            Err(MetricsError::Unreachable(_)) | Err(MetricsError::Timeout(_))
        ));
    }
}
