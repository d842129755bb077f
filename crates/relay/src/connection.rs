//! Stream connection manager
//!
//! Owns the upstream session: connects, heartbeats while open, turns every inbound frame into a
//! [`Tick`] (or discards it), and after any transport fault schedules exactly one reconnect
//! after a fixed delay. Ticks leave through an unbounded channel to the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::FeedError;
use crate::message::Tick;
use crate::metrics;
use crate::scheduler::OneShot;
use crate::shutdown::shutdown_requested;
use crate::traits::{FeedConnector, FeedSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Lifecycle bookkeeping for one upstream connection, free of I/O.
#[derive(Debug)]
pub struct ConnectionState {
    phase: ConnectionPhase,
    reconnect: OneShot,
    reconnect_delay: Duration,
    heartbeat_armed: bool,
    sessions: u64,
}

impl ConnectionState {
    pub fn new(reconnect_delay: Duration) -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect: OneShot::new(),
            reconnect_delay,
            heartbeat_armed: false,
            sessions: 0,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn heartbeat_armed(&self) -> bool {
        self.heartbeat_armed
    }

    /// Sessions opened so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect.deadline()
    }

    pub fn on_connecting(&mut self) {
        self.phase = ConnectionPhase::Connecting;
    }

    pub fn on_open(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.heartbeat_armed = true;
        self.sessions += 1;
    }

    /// Record a close or transport error. Returns true only when this call scheduled the
    /// reconnect; a fault while one is already pending leaves its deadline untouched.
    pub fn on_fault(&mut self, now: Instant) -> bool {
        if self.phase == ConnectionPhase::Closing {
            return false;
        }
        self.phase = ConnectionPhase::Disconnected;
        self.heartbeat_armed = false;
        self.reconnect.arm(now, self.reconnect_delay)
    }

    /// Consume the pending reconnect if it is due.
    pub fn take_reconnect(&mut self, now: Instant) -> bool {
        self.reconnect.fire_if_due(now)
    }

    /// Enter the terminal phase: no heartbeat, no pending reconnect.
    pub fn on_stop(&mut self) {
        self.phase = ConnectionPhase::Closing;
        self.heartbeat_armed = false;
        self.reconnect.clear();
    }
}

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Fault(FeedError),
    ReceiverGone,
}

/// Upper bound on a single heartbeat write
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the close handshake at shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectionManager<C: FeedConnector> {
    connector: C,
    ticks: mpsc::UnboundedSender<Tick>,
    heartbeat_interval: Duration,
    state: ConnectionState,
    connected: Arc<AtomicBool>,
}

impl<C: FeedConnector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        heartbeat_interval: Duration,
        reconnect_delay: Duration,
        ticks: mpsc::UnboundedSender<Tick>,
    ) -> Self {
        Self {
            connector,
            ticks,
            heartbeat_interval,
            state: ConnectionState::new(reconnect_delay),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag for health checks
    pub fn connected_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.connected)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Run until shutdown is requested or the tick receiver is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state.on_connecting();
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(session) => {
                    self.mark_open();
                    match self.run_session(session, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::ReceiverGone => {
                            info!("Tick receiver dropped, stopping feed");
                            break;
                        }
                        SessionEnd::Fault(e) => {
                            warn!(error = %e, "Feed session ended");
                            self.schedule_reconnect();
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Feed connect failed");
                    self.schedule_reconnect();
                }
            }

            let Some(deadline) = self.state.reconnect_deadline() else {
                continue;
            };
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep_until(deadline) => {
                    self.state.take_reconnect(Instant::now());
                    debug!("Reconnecting");
                }
            }
        }

        self.state.on_stop();
        self.connected.store(false, Ordering::SeqCst);
        metrics::set_feed_connected(false);
        info!(sessions = self.state.sessions(), "Feed connection manager stopped");
    }

    async fn run_session(
        &mut self,
        mut session: C::Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        // First beat one full interval after open
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
                _ = heartbeat.tick() => {
                    trace!("Sending heartbeat");
                    let sent = tokio::select! {
                        biased;
                        _ = shutdown_requested(shutdown) => break SessionEnd::Shutdown,
                        sent = tokio::time::timeout(HEARTBEAT_TIMEOUT, session.heartbeat()) => sent,
                    };
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Heartbeat failed"),
                        Err(_) => warn!(
                            timeout_secs = HEARTBEAT_TIMEOUT.as_secs(),
                            "Heartbeat timed out"
                        ),
                    }
                }
                frame = session.next_frame() => match frame {
                    Ok(raw) => {
                        if !self.forward(&raw) {
                            break SessionEnd::ReceiverGone;
                        }
                    }
                    Err(e) => break SessionEnd::Fault(e),
                }
            }
        };

        if !matches!(end, SessionEnd::Fault(_)) {
            self.state.on_stop();
            match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Error closing feed session"),
                Err(_) => warn!(
                    timeout_secs = CLOSE_TIMEOUT.as_secs(),
                    "Feed session close timed out"
                ),
            }
        }
        end
    }

    /// Parse one frame and push it downstream. Returns false once nobody is listening.
    fn forward(&self, raw: &str) -> bool {
        let observed_at = chrono::Utc::now().timestamp_millis();
        match Tick::parse(raw, observed_at) {
            Some(tick) => self.ticks.send(tick).is_ok(),
            None => {
                debug!(len = raw.len(), "Discarding unrecognized frame");
                metrics::inc_discarded();
                true
            }
        }
    }

    fn mark_open(&mut self) {
        self.state.on_open();
        self.connected.store(true, Ordering::SeqCst);
        metrics::set_feed_connected(true);
        info!(session = self.state.sessions(), "Feed connected");
    }

    fn schedule_reconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        metrics::set_feed_connected(false);
        if self.state.on_fault(Instant::now()) {
            metrics::inc_reconnects();
            info!(
                delay_ms = self.state.reconnect_delay.as_millis() as u64,
                "Reconnect scheduled"
            );
        } else {
            debug!("Reconnect already pending");
        }
    }
}
