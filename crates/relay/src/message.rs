//! Binance combined-stream packets and the items that flow through the relay
//!
//! Inbound packets arrive either wrapped (`{"stream":..,"data":{..}}`) or bare. Only mini-ticker
//! and kline payloads are understood; anything else is discarded by the caller.

use serde::{Deserialize, Serialize};
use tickrelay_config::Interval;

/// Decimal fields arrive as strings on the spot streams, numbers are tolerated too.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Text(String),
    Number(f64),
}

impl WireNumber {
    fn value(&self) -> Option<f64> {
        match self {
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Number(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamData {
    #[serde(rename = "s", default)]
    symbol: Option<String>,
    #[serde(rename = "c", default)]
    close: Option<WireNumber>,
    #[serde(rename = "k", default)]
    kline: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: WireNumber,
    #[serde(rename = "h")]
    high: WireNumber,
    #[serde(rename = "l")]
    low: WireNumber,
    #[serde(rename = "c")]
    close: WireNumber,
    #[serde(rename = "v")]
    volume: WireNumber,
    #[serde(rename = "x", default)]
    is_final: bool,
}

/// OHLCV snapshot carried by kline packets
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_final: bool,
}

impl Candle {
    fn from_wire(k: &KlineData) -> Option<Self> {
        let interval = k.interval.parse::<Interval>().ok()?;
        let values = [
            k.open.value()?,
            k.high.value()?,
            k.low.value()?,
            k.close.value()?,
            k.volume.value()?,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let [open, high, low, close, volume] = values;
        Some(Self {
            interval,
            open_time: k.open_time,
            close_time: k.close_time,
            open,
            high,
            low,
            close,
            volume: volume.max(0.0),
            is_final: k.is_final,
        })
    }
}

/// One observed sample from the feed
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    /// Local wall clock at receipt (epoch ms)
    pub observed_at: i64,
    pub candle: Option<Candle>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: f64, observed_at: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            observed_at,
            candle: None,
        }
    }

    pub fn with_candle(mut self, candle: Candle) -> Self {
        self.candle = Some(candle);
        self
    }

    /// Filter state key: the symbol, or `SYMBOL@interval` for kline streams so that each
    /// interval of a symbol is throttled independently.
    pub fn state_key(&self) -> String {
        match &self.candle {
            Some(candle) => format!("{}@{}", self.symbol, candle.interval),
            None => self.symbol.clone(),
        }
    }

    /// Parse a raw frame, returning `None` for anything that is not a usable price sample.
    /// Zero, negative and non-finite prices are rejected here.
    pub fn parse(raw: &str, observed_at: i64) -> Option<Self> {
        let packet: serde_json::Value = serde_json::from_str(raw).ok()?;
        let data = packet.get("data").unwrap_or(&packet);
        let data = StreamData::deserialize(data).ok()?;

        let symbol = data.symbol?.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return None;
        }

        let (price, candle) = match &data.kline {
            Some(k) => {
                let candle = Candle::from_wire(k)?;
                (candle.close, Some(candle))
            }
            None => (data.close?.value()?, None),
        };

        if !price.is_finite() || price <= 0.0 {
            return None;
        }

        Some(Self {
            symbol,
            price,
            observed_at,
            candle,
        })
    }
}

/// A tick that passed the admission filter. Owned by the batcher until flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedItem {
    pub symbol: String,
    pub price: f64,
    pub observed_at: i64,
    pub candle: Option<Candle>,
}

impl From<Tick> for AdmittedItem {
    fn from(tick: Tick) -> Self {
        Self {
            symbol: tick.symbol,
            price: tick.price,
            observed_at: tick.observed_at,
            candle: tick.candle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePayload {
    pub symbol: String,
    pub price: f64,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandlePayload {
    pub symbol: String,
    #[serde(flatten)]
    pub candle: Candle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PayloadItem {
    Price(PricePayload),
    Candle(CandlePayload),
}

/// Outbound body: `{"items":[...]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchPayload {
    pub items: Vec<PayloadItem>,
}

impl BatchPayload {
    /// Build the payload for one target. Price items are tagged with the target interval and
    /// the bucket that contains the batch's first observation; candles pass through unchanged.
    pub fn for_target(items: &[AdmittedItem], interval: Option<Interval>) -> Self {
        let open_time = items
            .first()
            .zip(interval)
            .map(|(first, interval)| interval.bucket_open(first.observed_at));

        let items = items
            .iter()
            .map(|item| match &item.candle {
                Some(candle) => PayloadItem::Candle(CandlePayload {
                    symbol: item.symbol.clone(),
                    candle: candle.clone(),
                }),
                None => PayloadItem::Price(PricePayload {
                    symbol: item.symbol.clone(),
                    price: item.price,
                    ts: item.observed_at,
                    interval,
                    is_final: false,
                    open_time,
                }),
            })
            .collect();

        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
