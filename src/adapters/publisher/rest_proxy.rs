//! Kafka REST Proxy Publisher - v3 records API over reqwest.
//!
//! One batch becomes one record on
//! `POST {broker}/v3/clusters/{cluster}/topics/{topic}/records`, keyed by
//! symbol so the proxy's partitioner keeps a symbol on one partition.
//! Key, value and header values travel base64-encoded (`BINARY`).

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::errors::PublishError;
use crate::ports::event_publisher::{BatchHeaders, EventPublisher};

#[derive(Debug, Serialize)]
struct ProduceRequest {
    key: BinaryData,
    value: BinaryData,
    headers: Vec<RecordHeader>,
}

#[derive(Debug, Serialize)]
struct BinaryData {
    #[serde(rename = "type")]
    kind: &'static str,
    data: String,
}

impl BinaryData {
    fn new(bytes: &[u8]) -> Self {
        Self {
            kind: "BINARY",
            data: STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordHeader {
    name: &'static str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct ProduceResponse {
    #[serde(default = "ok_code")]
    error_code: u16,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    partition_id: Option<i32>,
    #[serde(default)]
    offset: Option<u64>,
}

fn ok_code() -> u16 {
    200
}

/// Publisher backed by a Kafka REST proxy.
pub struct RestProxyPublisher {
    /// HTTP client with request timeout.
    http: Client,
    /// Records endpoint for the topic.
    records_url: String,
    /// Topic metadata endpoint, used as health probe.
    topic_url: String,
}

impl RestProxyPublisher {
    /// Create a publisher for `topic` on `cluster_id`.
    pub fn new(
        broker_url: &str,
        cluster_id: &str,
        topic: &str,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(request_timeout).build()?;
        let topic_url = format!(
            "{}/v3/clusters/{cluster_id}/topics/{topic}",
            broker_url.trim_end_matches('/')
        );
        Ok(Self {
            http,
            records_url: format!("{topic_url}/records"),
            topic_url,
        })
    }

    fn request_body(key: &str, payload: &[u8], headers: &BatchHeaders) -> ProduceRequest {
        ProduceRequest {
            key: BinaryData::new(key.as_bytes()),
            value: BinaryData::new(payload),
            headers: headers
                .pairs()
                .into_iter()
                .map(|(name, value)| RecordHeader {
                    name,
                    value: STANDARD.encode(value.as_bytes()),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl EventPublisher for RestProxyPublisher {
    #[instrument(skip(self, payload, headers), fields(bytes = payload.len()))]
    async fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
        headers: &BatchHeaders,
    ) -> Result<u64, PublishError> {
        let body = Self::request_body(key, &payload, headers);
        let response = self
            .http
            .post(&self.records_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PublishError::Transport(format!("proxy returned {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("{status}: {text}")));
        }

        let produced: ProduceResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        if produced.error_code != 200 {
            return Err(PublishError::Rejected(
                produced
                    .message
                    .unwrap_or_else(|| format!("error_code {}", produced.error_code)),
            ));
        }

        let offset = produced
            .offset
            .ok_or_else(|| PublishError::Rejected("response carried no offset".to_string()))?;
        debug!(key, partition = ?produced.partition_id, offset, "Record produced");
        Ok(offset)
    }

    async fn is_healthy(&self) -> bool {
        self.http
            .get(&self.topic_url)
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    fn name(&self) -> &'static str {
        "rest_proxy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick::Compression;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn produce(
        State(seen): State<Seen>,
        Json(body): Json<serde_json::Value>,
    ) -> (axum::http::StatusCode, Json<serde_json::Value>) {
        let mut seen = seen.lock().unwrap();
        seen.push(body);
        let offset = seen.len() - 1;
        (
            axum::http::StatusCode::OK,
            Json(serde_json::json!({"error_code": 200, "partition_id": 0, "offset": offset})),
        )
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_publish_encodes_record_and_returns_offset() {
        let seen: Seen = Arc::default();
        let router = Router::new()
            .route("/v3/clusters/c1/topics/ticks/records", post(produce))
            .route("/v3/clusters/c1/topics/ticks", get(|| async { "{}" }))
            .with_state(Arc::clone(&seen));
        let base = serve(router).await;

        let publisher = RestProxyPublisher::new(&base, "c1", "ticks", Duration::from_secs(5)).unwrap();
        let headers = BatchHeaders::ndjson(Compression::None, 2);
        assert_eq!(publisher.publish("TXFR1", b"a\nb\n".to_vec(), &headers).await, Ok(0));
        assert_eq!(publisher.publish("TXFR1", b"c\n".to_vec(), &headers).await, Ok(1));
        assert!(publisher.is_healthy().await);

        let body = seen.lock().unwrap()[0].clone();
        assert_eq!(body["key"]["type"], "BINARY");
        assert_eq!(body["key"]["data"], STANDARD.encode("TXFR1"));
        assert_eq!(body["value"]["data"], STANDARD.encode("a\nb\n"));
        assert_eq!(body["headers"][2]["name"], "record-count");
        assert_eq!(body["headers"][2]["value"], STANDARD.encode("2"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_client_error_is_not() {
        let router = Router::new()
            .route(
                "/v3/clusters/c1/topics/busy/records",
                post(|| async { axum::http::StatusCode::SERVICE_UNAVAILABLE }),
            )
            .route(
                "/v3/clusters/c1/topics/bad/records",
                post(|| async { axum::http::StatusCode::BAD_REQUEST }),
            );
        let base = serve(router).await;
        let headers = BatchHeaders::ndjson(Compression::None, 1);

        let busy = RestProxyPublisher::new(&base, "c1", "busy", Duration::from_secs(5)).unwrap();
        assert!(busy.publish("k", vec![1], &headers).await.unwrap_err().is_retryable());

        let bad = RestProxyPublisher::new(&base, "c1", "bad", Duration::from_secs(5)).unwrap();
        let err = bad.publish("k", vec![1], &headers).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
        assert!(!bad.is_healthy().await);
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_transport_error() {
        let publisher =
            RestProxyPublisher::new("http://127.0.0.1:1", "c1", "ticks", Duration::from_secs(1)).unwrap();
        let headers = BatchHeaders::ndjson(Compression::Zstd, 1);
        let err = publisher.publish("k", vec![1], &headers).await.unwrap_err();
        assert!(matches!(err, PublishError::Transport(_)));
    }
}
