//! Delivery dispatcher
//!
//! Turns a flushed batch into one webhook POST per configured target. Every POST runs on its own
//! task so a slow or failing endpoint never holds up the pipeline or the other targets. Failed
//! batches are logged and dropped. Tasks are tracked so shutdown can wait for POSTs already on
//! the wire.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tickrelay_config::{DeliveryConfig, TargetConfig};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::message::{AdmittedItem, BatchPayload};
use crate::metrics;
use crate::traits::Delivery;

/// Webhook client: JSON POST with a shared-secret header and a bounded timeout
pub struct HttpDelivery {
    http: Client,
    secret: Option<String>,
    secret_header: String,
    timeout: Duration,
}

impl HttpDelivery {
    pub fn new(
        secret: Option<String>,
        secret_header: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Request(e.to_string()))?;

        Ok(Self {
            http,
            secret,
            secret_header: secret_header.into(),
            timeout,
        })
    }

    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        Self::new(
            config.secret.clone(),
            config.secret_header.clone(),
            config.timeout(),
        )
    }
}

#[async_trait]
impl Delivery for HttpDelivery {
    async fn deliver(&self, endpoint: &str, payload: &BatchPayload) -> Result<(), DeliveryError> {
        let mut request = self.http.post(endpoint).json(payload);
        if let Some(ref secret) = self.secret {
            request = request.header(self.secret_header.as_str(), secret);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                DeliveryError::Request(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
}

/// Maps channels to targets and fires deliveries on a bounded set of tasks.
pub struct Dispatcher {
    targets: Vec<TargetConfig>,
    delivery: Arc<dyn Delivery>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        targets: Vec<TargetConfig>,
        delivery: Arc<dyn Delivery>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            targets,
            delivery,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Deliveries spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Close the tracker and wait up to `grace` for in-flight deliveries. Returns true when
    /// every delivery finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tasks.close();
        let pending = self.tasks.len();
        if pending > 0 {
            info!(pending, grace_ms = grace.as_millis() as u64, "Waiting for in-flight deliveries");
        }
        match tokio::time::timeout(grace, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(pending = self.tasks.len(), "In-flight deliveries abandoned at shutdown");
                false
            }
        }
    }

    /// Channel names in configuration order
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.name.as_str())
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.targets.iter().any(|t| t.name == channel)
    }

    /// Fire-and-forget delivery of one flushed batch. Returns the task handle when a POST was
    /// started; `None` when the channel is inert (no URL) or unknown.
    pub fn dispatch(
        &self,
        channel: &str,
        items: Vec<AdmittedItem>,
    ) -> Option<JoinHandle<DeliveryOutcome>> {
        let Some(target) = self.targets.iter().find(|t| t.name == channel) else {
            debug!(channel = %channel, "No target for channel, dropping batch");
            return None;
        };
        let Some(endpoint) = target.url.clone().filter(|u| !u.is_empty()) else {
            debug!(channel = %channel, items = items.len(), "Target has no endpoint, skipping");
            metrics::record_delivery(channel, "skipped");
            return None;
        };

        let payload = BatchPayload::for_target(&items, target.interval);
        let delivery = Arc::clone(&self.delivery);
        let permits = Arc::clone(&self.permits);
        let channel = channel.to_string();

        Some(self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                metrics::record_delivery(&channel, "failed");
                return DeliveryOutcome::Failed;
            };

            let started = Instant::now();
            let result = delivery.deliver(&endpoint, &payload).await;
            metrics::observe_delivery_duration(&channel, started.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    info!(channel = %channel, items = payload.len(), "Batch delivered");
                    metrics::record_delivery(&channel, "ok");
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    warn!(
                        channel = %channel,
                        items = payload.len(),
                        error = %e,
                        "Delivery failed, batch dropped"
                    );
                    metrics::record_delivery(&channel, "failed");
                    DeliveryOutcome::Failed
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PayloadItem, Tick};
    use std::sync::Mutex;
    use tickrelay_config::Interval;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every call; endpoints containing "fail" return an error
    #[derive(Default)]
    struct RecordingDelivery {
        calls: Mutex<Vec<(String, BatchPayload)>>,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(
            &self,
            endpoint: &str,
            payload: &BatchPayload,
        ) -> Result<(), DeliveryError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), payload.clone()));
            if endpoint.contains("fail") {
                return Err(DeliveryError::Status { status: 500 });
            }
            Ok(())
        }
    }

    fn target(name: &str, interval: Option<Interval>, url: Option<&str>) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            interval,
            url: url.map(ToString::to_string),
        }
    }

    fn items() -> Vec<AdmittedItem> {
        vec![
            AdmittedItem::from(Tick::new("BTCUSDT", 100.0, 1_704_105_000_000)),
            AdmittedItem::from(Tick::new("ETHUSDT", 2000.0, 1_704_105_000_150)),
            AdmittedItem::from(Tick::new("BTCUSDT", 100.2, 1_704_105_000_400)),
        ]
    }

    #[tokio::test]
    async fn test_inert_channel_receives_nothing() {
        let delivery = Arc::new(RecordingDelivery::default());
        let dispatcher = Dispatcher::new(
            vec![
                target("1h", Some(Interval::H1), Some("http://hooks/1h")),
                target("4h", Some(Interval::H4), None),
            ],
            delivery.clone(),
            4,
        );

        let handle = dispatcher.dispatch("1h", items()).unwrap();
        assert!(dispatcher.dispatch("4h", items()).is_none());
        assert_eq!(handle.await.unwrap(), DeliveryOutcome::Delivered);

        let calls = delivery.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://hooks/1h");
        assert_eq!(calls[0].1.len(), 3);
    }

    #[tokio::test]
    async fn test_payload_keeps_order_and_bucket() {
        let delivery = Arc::new(RecordingDelivery::default());
        let dispatcher = Dispatcher::new(
            vec![target("1h", Some(Interval::H1), Some("http://hooks/1h"))],
            delivery.clone(),
            4,
        );
        dispatcher.dispatch("1h", items()).unwrap().await.unwrap();

        let calls = delivery.calls.lock().unwrap();
        let prices: Vec<_> = calls[0]
            .1
            .items
            .iter()
            .map(|item| match item {
                PayloadItem::Price(p) => {
                    assert_eq!(p.open_time, Some(1_704_103_200_000));
                    p.price
                }
                PayloadItem::Candle(_) => panic!("unexpected candle"),
            })
            .collect();
        assert_eq!(prices, vec![100.0, 2000.0, 100.2]);
    }

    #[tokio::test]
    async fn test_failure_on_one_target_does_not_affect_another() {
        let delivery = Arc::new(RecordingDelivery::default());
        let dispatcher = Dispatcher::new(
            vec![
                target("1h", Some(Interval::H1), Some("http://fail/1h")),
                target("4h", Some(Interval::H4), Some("http://hooks/4h")),
            ],
            delivery.clone(),
            4,
        );

        let failed = dispatcher.dispatch("1h", items()).unwrap();
        let delivered = dispatcher.dispatch("4h", items()).unwrap();
        assert_eq!(failed.await.unwrap(), DeliveryOutcome::Failed);
        assert_eq!(delivered.await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(delivery.calls.lock().unwrap().len(), 2);
    }

    /// Sleeps before recording, like an endpoint that is slow to answer
    struct SlowDelivery {
        delay: Duration,
        completed: Mutex<usize>,
    }

    #[async_trait]
    impl Delivery for SlowDelivery {
        async fn deliver(
            &self,
            _endpoint: &str,
            _payload: &BatchPayload,
        ) -> Result<(), DeliveryError> {
            tokio::time::sleep(self.delay).await;
            *self.completed.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_in_flight_delivery() {
        let delivery = Arc::new(SlowDelivery {
            delay: Duration::from_millis(300),
            completed: Mutex::new(0),
        });
        let dispatcher = Dispatcher::new(
            vec![target("1h", Some(Interval::H1), Some("http://hooks/1h"))],
            delivery.clone(),
            4,
        );

        // Handle intentionally dropped, as the pipeline does
        drop(dispatcher.dispatch("1h", items()));
        assert_eq!(dispatcher.in_flight(), 1);

        assert!(dispatcher.drain(Duration::from_secs(1)).await);
        assert_eq!(*delivery.completed.lock().unwrap(), 1);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_grace() {
        let delivery = Arc::new(SlowDelivery {
            delay: Duration::from_secs(30),
            completed: Mutex::new(0),
        });
        let dispatcher = Dispatcher::new(
            vec![target("1h", Some(Interval::H1), Some("http://hooks/1h"))],
            delivery.clone(),
            4,
        );

        drop(dispatcher.dispatch("1h", items()));
        assert!(!dispatcher.drain(Duration::from_millis(500)).await);
        assert_eq!(*delivery.completed.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight() {
        let dispatcher = Dispatcher::new(vec![], Arc::new(RecordingDelivery::default()), 1);
        assert!(dispatcher.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_dropped() {
        let delivery = Arc::new(RecordingDelivery::default());
        let dispatcher = Dispatcher::new(vec![], delivery.clone(), 1);
        assert!(dispatcher.dispatch("nope", items()).is_none());
        assert!(delivery.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_delivery_posts_items_with_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Webhook-Secret", "s3cret"))
            .and(body_partial_json(serde_json::json!({
                "items": [{"symbol": "BTCUSDT", "price": 100.0, "interval": "1h", "isFinal": false}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let delivery =
            HttpDelivery::new(Some("s3cret".into()), "X-Webhook-Secret", Duration::from_secs(2))
                .unwrap();
        let items = vec![AdmittedItem::from(Tick::new("BTCUSDT", 100.0, 1_704_105_000_000))];
        let payload = BatchPayload::for_target(&items, Some(Interval::H1));

        let result = delivery
            .deliver(&format!("{}/hook", server.uri()), &payload)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_http_delivery_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let delivery = HttpDelivery::new(None, "X-Webhook-Secret", Duration::from_secs(2)).unwrap();
        let payload = BatchPayload { items: vec![] };
        let result = delivery.deliver(&server.uri(), &payload).await;
        assert!(matches!(result, Err(DeliveryError::Status { status: 503 })));
    }

    #[tokio::test]
    async fn test_http_delivery_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let delivery =
            HttpDelivery::new(None, "X-Webhook-Secret", Duration::from_millis(50)).unwrap();
        let payload = BatchPayload { items: vec![] };
        let result = delivery.deliver(&server.uri(), &payload).await;
        assert!(matches!(result, Err(DeliveryError::Timeout { timeout_ms: 50 })));
    }
}
