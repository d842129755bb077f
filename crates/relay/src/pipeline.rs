//! The relay event loop
//!
//! One task owns the filter state and the batch buffers. It wakes for three reasons: a tick
//! arrived, the earliest flush window closed, or shutdown was requested.

use std::sync::Arc;
use std::time::Duration;
use tickrelay_config::RelayConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batcher::BatchAccumulator;
use crate::dispatcher::{DeliveryOutcome, Dispatcher};
use crate::filter::AdmissionFilter;
use crate::message::{AdmittedItem, Tick};
use crate::metrics;
use crate::shutdown::shutdown_requested;
use crate::traits::Delivery;

pub struct Pipeline {
    filter: AdmissionFilter,
    accumulator: BatchAccumulator,
    dispatcher: Dispatcher,
    price_channels: Vec<String>,
}

impl Pipeline {
    pub fn new(
        filter: AdmissionFilter,
        accumulator: BatchAccumulator,
        dispatcher: Dispatcher,
    ) -> Self {
        let price_channels = dispatcher.channels().map(ToString::to_string).collect();
        Self {
            filter,
            accumulator,
            dispatcher,
            price_channels,
        }
    }

    pub fn from_config(config: &RelayConfig, delivery: Arc<dyn Delivery>) -> Self {
        Self::new(
            AdmissionFilter::from_config(&config.filter),
            BatchAccumulator::new(config.batch.window()),
            Dispatcher::new(
                config.delivery.targets.clone(),
                delivery,
                config.delivery.max_in_flight,
            ),
        )
    }

    pub fn filter(&self) -> &AdmissionFilter {
        &self.filter
    }

    pub fn accumulator(&self) -> &BatchAccumulator {
        &self.accumulator
    }

    /// Filter one tick and, if admitted, enqueue it on its channels. Returns the admission
    /// decision.
    pub fn on_tick(&mut self, tick: Tick, now: Instant) -> bool {
        if !self.filter.admit(&tick) {
            metrics::inc_rejected();
            return false;
        }
        metrics::inc_admitted();

        let item = AdmittedItem::from(tick);
        match item.candle.as_ref().map(|c| c.interval.as_str()) {
            Some(interval) => {
                if self.dispatcher.has_channel(interval) {
                    self.accumulator.enqueue(interval, item, now);
                } else {
                    debug!(
                        symbol = %item.symbol,
                        interval = %interval,
                        "No channel for candle interval"
                    );
                }
            }
            None => {
                if let Some((last, rest)) = self.price_channels.split_last() {
                    for channel in rest {
                        self.accumulator.enqueue(channel, item.clone(), now);
                    }
                    self.accumulator.enqueue(last, item, now);
                }
            }
        }
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.accumulator.next_deadline()
    }

    /// Hand every closed window to the dispatcher.
    pub fn flush_due(&mut self, now: Instant) -> Vec<JoinHandle<DeliveryOutcome>> {
        self.accumulator
            .take_due(now)
            .into_iter()
            .filter_map(|(channel, items)| {
                debug!(channel = %channel, items = items.len(), "Flushing batch");
                metrics::record_flush(&channel, items.len());
                self.dispatcher.dispatch(&channel, items)
            })
            .collect()
    }

    /// Cancel pending windows. Returns how many buffered items were dropped.
    pub fn stop(&mut self) -> usize {
        self.accumulator.cancel_all()
    }

    /// Wait up to `grace` for deliveries that were flushed before the pipeline stopped.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.dispatcher.drain(grace).await
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Run until shutdown or until the tick sender is dropped.
    pub async fn run(
        &mut self,
        mut ticks: mpsc::UnboundedReceiver<Tick>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(channels = ?self.price_channels, "Pipeline started");

        loop {
            let deadline = self.accumulator.next_deadline();
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = sleep_until(deadline) => {
                    self.flush_due(Instant::now());
                }
                tick = ticks.recv() => match tick {
                    Some(tick) => {
                        self.on_tick(tick, Instant::now());
                    }
                    None => {
                        info!("Tick stream closed");
                        break;
                    }
                }
            }
        }

        let dropped = self.stop();
        info!(
            dropped,
            tracked = self.filter.tracked(),
            "Pipeline stopped"
        );
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::message::{BatchPayload, Candle, PayloadItem};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tickrelay_config::{Interval, TargetConfig};

    #[derive(Default)]
    struct RecordingDelivery {
        calls: Mutex<Vec<(String, BatchPayload)>>,
    }

    impl RecordingDelivery {
        fn calls(&self) -> Vec<(String, BatchPayload)> {
            self.calls.lock().unwrap().clone()
        }
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
            Ok(())
        }
    }

    fn target(name: &str, interval: Interval, url: Option<&str>) -> TargetConfig {
        TargetConfig {
            name: name.to_string(),
            interval: Some(interval),
            url: url.map(ToString::to_string),
        }
    }

    fn pipeline(targets: Vec<TargetConfig>, delivery: Arc<RecordingDelivery>) -> Pipeline {
        Pipeline::new(
            AdmissionFilter::new(2_000, 0.0005),
            BatchAccumulator::new(Duration::from_millis(800)),
            Dispatcher::new(targets, delivery, 4),
        )
    }

    fn candle(interval: Interval, close: f64) -> Candle {
        Candle {
            interval,
            open_time: 1_704_096_000_000,
            close_time: 1_704_110_399_999,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_final: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flushes_once_with_all_items() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
            delivery.clone(),
        );
        let t0 = Instant::now();

        assert!(pipeline.on_tick(Tick::new("A", 1.0, 1_000), t0));
        assert!(pipeline.on_tick(Tick::new("B", 1.0, 1_150), t0 + Duration::from_millis(150)));
        assert!(pipeline.on_tick(Tick::new("C", 1.0, 1_400), t0 + Duration::from_millis(400)));
        assert_eq!(pipeline.next_deadline(), Some(t0 + Duration::from_millis(800)));

        assert!(pipeline.flush_due(t0 + Duration::from_millis(799)).is_empty());
        let handles = pipeline.flush_due(t0 + Duration::from_millis(800));
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), DeliveryOutcome::Delivered);
        }

        let calls = delivery.calls();
        assert_eq!(calls.len(), 1);
        let symbols: Vec<_> = calls[0]
            .1
            .items
            .iter()
            .map(|item| match item {
                PayloadItem::Price(p) => p.symbol.clone(),
                PayloadItem::Candle(c) => c.symbol.clone(),
            })
            .collect();
        assert_eq!(symbols, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_tick_is_not_enqueued() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
            delivery.clone(),
        );
        let now = Instant::now();

        assert!(pipeline.on_tick(Tick::new("BTCUSDT", 100.0, 0), now));
        assert!(!pipeline.on_tick(Tick::new("BTCUSDT", 100.1, 500), now));
        assert_eq!(pipeline.accumulator().pending("1h"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_ticks_fan_out_to_every_channel() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![
                target("1h", Interval::H1, Some("http://hooks/1h")),
                target("4h", Interval::H4, None),
            ],
            delivery.clone(),
        );
        let t0 = Instant::now();
        pipeline.on_tick(Tick::new("BTCUSDT", 100.0, 1_704_105_000_000), t0);
        assert_eq!(pipeline.accumulator().pending("1h"), 1);
        assert_eq!(pipeline.accumulator().pending("4h"), 1);

        // The inert channel is flushed but nothing is sent for it
        let handles = pipeline.flush_due(t0 + Duration::from_millis(800));
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        let calls = delivery.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://hooks/1h");
        assert_eq!(pipeline.accumulator().pending("4h"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candles_route_by_interval() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![
                target("1h", Interval::H1, Some("http://hooks/1h")),
                target("4h", Interval::H4, Some("http://hooks/4h")),
            ],
            delivery.clone(),
        );
        let now = Instant::now();

        let four_hour = Tick::new("BTCUSDT", 100.0, 0).with_candle(candle(Interval::H4, 100.0));
        let fifteen = Tick::new("BTCUSDT", 100.0, 0).with_candle(candle(Interval::M15, 100.0));
        assert!(pipeline.on_tick(four_hour, now));
        assert!(pipeline.on_tick(fifteen, now));

        assert_eq!(pipeline.accumulator().pending("4h"), 1);
        assert_eq!(pipeline.accumulator().pending("1h"), 0);
        assert_eq!(pipeline.accumulator().pending("15m"), 0);
        assert_eq!(pipeline.filter().tracked(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_flushes_on_window_expiry() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
            delivery.clone(),
        );
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            pipeline.run(tick_rx, shutdown_rx).await;
            pipeline
        });

        tick_tx.send(Tick::new("BTCUSDT", 100.0, 0)).unwrap();
        tick_tx.send(Tick::new("ETHUSDT", 2000.0, 10)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(delivery.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let calls = delivery.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 2);

        shutdown_tx.send(true).unwrap();
        let pipeline = task.await.unwrap();
        assert!(pipeline.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_batch() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
            delivery.clone(),
        );
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            pipeline.run(tick_rx, shutdown_rx).await;
            pipeline
        });

        tick_tx.send(Tick::new("BTCUSDT", 100.0, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        let pipeline = task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(delivery.calls().is_empty());
        assert_eq!(pipeline.accumulator().pending("1h"), 0);
        assert!(pipeline.next_deadline().is_none());
    }

    struct SlowDelivery {
        delivered: Mutex<usize>,
    }

    #[async_trait]
    impl Delivery for SlowDelivery {
        async fn deliver(
            &self,
            _endpoint: &str,
            _payload: &BatchPayload,
        ) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_millis(300)).await;
            *self.delivered.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushed_delivery_completes_across_shutdown() {
        let delivery = Arc::new(SlowDelivery {
            delivered: Mutex::new(0),
        });
        let mut pipeline = Pipeline::new(
            AdmissionFilter::new(2_000, 0.0005),
            BatchAccumulator::new(Duration::from_millis(50)),
            Dispatcher::new(
                vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
                delivery.clone(),
                4,
            ),
        );
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            pipeline.run(tick_rx, shutdown_rx).await;
            pipeline
        });

        tick_tx.send(Tick::new("BTCUSDT", 100.0, 0)).unwrap();
        // Window closes at 50ms, the POST is still running at 120ms
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();
        let pipeline = task.await.unwrap();
        assert_eq!(pipeline.in_flight(), 1);
        assert_eq!(*delivery.delivered.lock().unwrap(), 0);

        assert!(pipeline.drain(Duration::from_secs(1)).await);
        assert_eq!(*delivery.delivered.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ends_when_tick_sender_dropped() {
        let delivery = Arc::new(RecordingDelivery::default());
        let mut pipeline = pipeline(
            vec![target("1h", Interval::H1, Some("http://hooks/1h"))],
            delivery,
        );
        let (tick_tx, tick_rx) = mpsc::unbounded_channel::<Tick>();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(tick_tx);
        pipeline.run(tick_rx, shutdown_rx).await;
    }
}
