//! Completion event publishing
//!
//! The bus is reached through a Kafka REST proxy. A publish succeeds only
//! when the proxy acknowledges the record with a 2xx response.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::error::TransferError;
use super::types::TransferEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, event: &TransferEvent) -> Result<(), TransferError>;
}

const KAFKA_JSON_V2: &str = "application/vnd.kafka.json.v2+json";

/// Publisher for the Confluent-style REST proxy (`POST /topics/{topic}`)
pub struct RestProxyPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl RestProxyPublisher {
    pub fn new(base_url: &str, topic: &str, timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransferError::SystemError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/topics/{}", base_url.trim_end_matches('/'), topic),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Proxy payload: one record keyed by transaction id
    pub fn payload(event: &TransferEvent) -> Value {
        json!({
            "records": [{
                "key": event.transaction_id.to_string(),
                "value": event,
            }]
        })
    }
}

#[async_trait]
impl EventPublisher for RestProxyPublisher {
    fn name(&self) -> &'static str {
        "kafka-rest"
    }

    async fn publish(&self, event: &TransferEvent) -> Result<(), TransferError> {
        let body = serde_json::to_vec(&Self::payload(event))?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, KAFKA_JSON_V2)
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Publish(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(TransferError::Publish(format!(
                "proxy rejected record: {} - {}",
                status, error_text
            )));
        }

        debug!(transaction_id = %event.transaction_id, endpoint = %self.endpoint, "Event published");
        Ok(())
    }
}

/// Publisher that keeps delivered events in memory
#[cfg(any(test, feature = "fault-injection"))]
pub use recording::RecordingPublisher;

#[cfg(any(test, feature = "fault-injection"))]
mod recording {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::EventPublisher;
    use crate::transfer::error::TransferError;
    use crate::transfer::types::TransferEvent;

    #[derive(Default)]
    pub struct RecordingPublisher {
        events: Mutex<Vec<TransferEvent>>,
        attempts: AtomicU32,
        fail_next: AtomicU32,
    }

    impl RecordingPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reject the next `n` publishes with a transient error
        pub fn fail_next(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn events(&self) -> Vec<TransferEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        /// Publish calls, failed ones included
        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn publish(&self, event: &TransferEvent) -> Result<(), TransferError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let fail = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(TransferError::Publish("broker unavailable".to_string()));
            }

            self.events
                .lock()
                .map_err(|_| TransferError::SystemError("event log poisoned".to_string()))?
                .push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::{TransferParams, TransferRecord, TransferId, TransferStatus};

    fn event() -> TransferEvent {
        let params = TransferParams::new("alice", "bob", 200_000, "idr", None).unwrap();
        let record = TransferRecord::new(TransferId::new(), &params, TransferStatus::Completed);
        TransferEvent::from(&record)
    }

    #[test]
    fn test_payload_keyed_by_transaction_id() {
        let event = event();
        let payload = RestProxyPublisher::payload(&event);

        let record = &payload["records"][0];
        assert_eq!(record["key"], event.transaction_id.to_string());
        assert_eq!(record["value"]["sender_id"], "alice");
        assert_eq!(record["value"]["amount"], 200_000);
        assert_eq!(record["value"]["currency"], "IDR");
        assert_eq!(record["value"]["status"], "COMPLETED");
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let publisher =
            RestProxyPublisher::new("http://localhost:8082/", "transfers", Duration::from_secs(1))
                .unwrap();
        assert_eq!(publisher.endpoint(), "http://localhost:8082/topics/transfers");
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_publish_error() {
        let publisher =
            RestProxyPublisher::new("http://127.0.0.1:1", "transfers", Duration::from_millis(500))
                .unwrap();
        let err = publisher.publish(&event()).await.unwrap_err();
        assert!(matches!(err, TransferError::Publish(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_recording_publisher_fails_then_delivers() {
        let publisher = RecordingPublisher::new();
        publisher.fail_next(1);

        assert!(publisher.publish(&event()).await.is_err());
        assert!(publisher.publish(&event()).await.is_ok());
        assert_eq!(publisher.attempts(), 2);
        assert_eq!(publisher.events().len(), 1);
    }
}
