//! Binance combined-stream WebSocket client
//!
//! One connection carries every subscribed topic: the subscription is encoded in the URL
//! (`/stream?streams=btcusdt@miniTicker/ethusdt@miniTicker`), so there is no subscribe handshake.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tickrelay_config::{FeedConfig, Interval, StreamKind};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::FeedError;
use crate::traits::{FeedConnector, FeedSession};

/// Topic names for the configured symbols, lower-cased as the exchange expects.
pub fn stream_topics(symbols: &[String], kind: StreamKind, intervals: &[Interval]) -> Vec<String> {
    symbols
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .flat_map(|symbol| match kind {
            StreamKind::MiniTicker => vec![format!("{}@miniTicker", symbol)],
            StreamKind::Kline => intervals
                .iter()
                .map(|i| format!("{}@kline_{}", symbol, i))
                .collect(),
        })
        .collect()
}

/// `<base>/stream?streams=a/b/c`
pub fn combined_stream_url(base: &str, topics: &[String]) -> Result<Url, FeedError> {
    let mut url = Url::parse(base)?.join("/stream")?;
    url.set_query(Some(&format!("streams={}", topics.join("/"))));
    Ok(url)
}

/// Opens combined-stream sessions for a fixed topic set
pub struct BinanceConnector {
    url: Url,
}

impl BinanceConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self, FeedError> {
        let topics = stream_topics(&config.symbols, config.stream, &config.kline_intervals);
        Ok(Self::new(combined_stream_url(&config.url, &topics)?))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl FeedConnector for BinanceConnector {
    type Session = BinanceSocket;

    async fn connect(&self) -> Result<BinanceSocket, FeedError> {
        BinanceSocket::connect(&self.url).await
    }
}

pub struct BinanceSocket {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl BinanceSocket {
    /// Connect timeout in seconds
    const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// A healthy stream pushes at least once per second; this long without a frame is a dead link.
    const READ_TIMEOUT_SECS: u64 = 60;

    pub async fn connect(url: &Url) -> Result<Self, FeedError> {
        info!(url = %url, "Connecting to Binance combined stream");

        let (ws, response) = tokio::time::timeout(
            Duration::from_secs(Self::CONNECT_TIMEOUT_SECS),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| {
            FeedError::ConnectionFailed(format!(
                "connect timeout after {} seconds",
                Self::CONNECT_TIMEOUT_SECS
            ))
        })??;

        info!(status = ?response.status(), "Binance WebSocket connected");
        Ok(Self { ws })
    }
}

#[async_trait]
impl FeedSession for BinanceSocket {
    async fn next_frame(&mut self) -> Result<String, FeedError> {
        loop {
            let recv_result = tokio::time::timeout(
                Duration::from_secs(Self::READ_TIMEOUT_SECS),
                self.ws.next(),
            )
            .await;

            match recv_result {
                Err(_) => {
                    warn!(timeout_secs = Self::READ_TIMEOUT_SECS, "Binance WebSocket read timeout");
                    return Err(FeedError::ConnectionFailed(format!(
                        "read timeout after {} seconds",
                        Self::READ_TIMEOUT_SECS
                    )));
                }
                Ok(Some(Ok(Message::Text(text)))) => return Ok(text),
                Ok(Some(Ok(Message::Binary(data)))) => match String::from_utf8(data) {
                    Ok(text) => return Ok(text),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Some(Ok(Message::Ping(data)))) => {
                    trace!("Received WS ping, sending pong");
                    self.ws.send(Message::Pong(data)).await?;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    info!(frame = ?frame, "Binance WebSocket closed");
                    return Err(FeedError::ConnectionClosed);
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(FeedError::ConnectionClosed),
            }
        }
    }

    async fn heartbeat(&mut self) -> Result<(), FeedError> {
        self.ws.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.ws.close(None).await?;
        Ok(())
    }
}
