//! Tick model and batch wire codec.
//!
//! A `Tick` is created once per upstream quote callback, published once,
//! and never mutated. Batches are newline-delimited JSON, optionally
//! zstd-compressed; `decode_batch` is the exact inverse of `encode_batch`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::errors::PublishError;

/// zstd level used for batches; favours speed over ratio.
const ZSTD_LEVEL: i32 = 3;

/// Field names owned by `Tick`; upstream extras with these names are renamed.
const RESERVED_FIELDS: [&str; 6] = ["symbol", "timestamp", "price", "volume", "sequence", "received_at"];

/// Prefix for renamed upstream extras.
const UPSTREAM_PREFIX: &str = "upstream_";

/// Naive timestamp layouts accepted from the upstream (exchange local time).
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Upstream quote exactly as the source delivered it, before parsing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQuote {
    /// Instrument code.
    pub symbol: String,
    /// Exchange timestamp: RFC 3339, epoch milliseconds, or naive local time.
    pub timestamp: String,
    /// Trade price as text.
    pub price: String,
    /// Trade volume as text.
    pub volume: String,
    /// Upstream sequence number, if the source provides one.
    pub sequence: Option<u64>,
    /// Every other field the upstream sent.
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Why a raw quote could not become a `Tick`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TickError {
    /// Quote had no symbol.
    #[error("quote has no symbol")]
    EmptySymbol,
    /// Price was not a decimal number.
    #[error("invalid price: {0}")]
    InvalidPrice(String),
    /// Volume was not a decimal number.
    #[error("invalid volume: {0}")]
    InvalidVolume(String),
    /// Timestamp matched none of the accepted layouts.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// One price/volume event for a traded instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument code; also the batch / partition key.
    pub symbol: String,
    /// Exchange-supplied event time.
    pub timestamp: DateTime<Utc>,
    /// Trade price.
    pub price: Decimal,
    /// Trade volume.
    pub volume: Decimal,
    /// Upstream sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// When the bridge received the quote.
    pub received_at: DateTime<Utc>,
    /// Pass-through upstream fields (open, high, low, tick type, ...).
    /// Keys never collide with the fields above.
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Tick {
    /// Parse an upstream quote. Naive timestamps are read in `exchange_tz`.
    pub fn parse(raw: RawQuote, exchange_tz: Tz, received_at: DateTime<Utc>) -> Result<Self, TickError> {
        if raw.symbol.trim().is_empty() {
            return Err(TickError::EmptySymbol);
        }
        let price = Decimal::from_str(raw.price.trim())
            .map_err(|_| TickError::InvalidPrice(raw.price.clone()))?;
        let volume = Decimal::from_str(raw.volume.trim())
            .map_err(|_| TickError::InvalidVolume(raw.volume.clone()))?;
        let timestamp = parse_timestamp(raw.timestamp.trim(), exchange_tz)?;

        Ok(Self {
            symbol: raw.symbol,
            timestamp,
            price,
            volume,
            sequence: raw.sequence,
            received_at,
            attributes: disambiguate(raw.attributes),
        })
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> Result<Vec<u8>, PublishError> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| PublishError::Serialization(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Move extras whose key is a `Tick` field under an `upstream_` key.
fn disambiguate(attributes: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, serde_json::Value> {
    let (clashing, mut kept): (BTreeMap<_, _>, BTreeMap<_, _>) = attributes
        .into_iter()
        .partition(|(key, _)| RESERVED_FIELDS.contains(&key.as_str()));
    for (key, value) in clashing {
        let mut renamed = format!("{UPSTREAM_PREFIX}{key}");
        while kept.contains_key(&renamed) {
            renamed.insert_str(0, UPSTREAM_PREFIX);
        }
        kept.insert(renamed, value);
    }
    kept
}

fn parse_timestamp(text: &str, exchange_tz: Tz) -> Result<DateTime<Utc>, TickError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| TickError::InvalidTimestamp(text.to_string()));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .and_then(|naive| exchange_tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| TickError::InvalidTimestamp(text.to_string()))
}

/// Batch payload compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Plain NDJSON.
    None,
    /// zstd frame around the NDJSON body.
    #[default]
    Zstd,
}

impl Compression {
    /// Value for the `content-encoding` header.
    pub fn content_encoding(self) -> &'static str {
        match self {
            Self::None => "identity",
            Self::Zstd => "zstd",
        }
    }

    /// Compress an already-encoded NDJSON body.
    pub fn compress(self, body: Vec<u8>) -> Result<Vec<u8>, PublishError> {
        match self {
            Self::None => Ok(body),
            Self::Zstd => zstd::encode_all(body.as_slice(), ZSTD_LEVEL)
                .map_err(|e| PublishError::Compression(e.to_string())),
        }
    }

    /// Inverse of [`Compression::compress`].
    pub fn decompress(self, payload: &[u8]) -> Result<Vec<u8>, PublishError> {
        match self {
            Self::None => Ok(payload.to_vec()),
            Self::Zstd => {
                zstd::decode_all(payload).map_err(|e| PublishError::Compression(e.to_string()))
            }
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

/// Encode ticks as one compressed NDJSON payload.
pub fn encode_batch(ticks: &[Tick], compression: Compression) -> Result<Vec<u8>, PublishError> {
    let mut body = Vec::new();
    for tick in ticks {
        body.extend_from_slice(&tick.to_line()?);
    }
    compression.compress(body)
}

/// Decode a payload produced by [`encode_batch`].
pub fn decode_batch(payload: &[u8], compression: Compression) -> Result<Vec<Tick>, PublishError> {
    let body = compression.decompress(payload)?;
    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line).map_err(|e| PublishError::Serialization(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn raw(ts: &str) -> RawQuote {
        RawQuote {
            symbol: "TXFR1".to_string(),
            timestamp: ts.to_string(),
            price: "17350.0".to_string(),
            volume: "3".to_string(),
            sequence: Some(42),
            attributes: BTreeMap::from([
                ("tick_type".to_string(), serde_json::json!(1)),
                ("high".to_string(), serde_json::json!("17360.0")),
            ]),
        }
    }

    #[test]
    fn test_parse_naive_timestamp_uses_exchange_zone() {
        let received = Utc::now();
        let tick = Tick::parse(raw("2024-03-04 09:00:00.250"), chrono_tz::Asia::Taipei, received)
            .unwrap();
        // Taipei is UTC+8 with no DST.
        assert_eq!(
            tick.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
        assert_eq!(tick.price, dec!(17350.0));
        assert_eq!(tick.volume, dec!(3));
    }

    #[test]
    fn test_parse_rfc3339_and_epoch_millis() {
        let a = Tick::parse(raw("2024-03-04T01:00:00Z"), chrono_tz::Asia::Taipei, Utc::now()).unwrap();
        let b = Tick::parse(raw("1709514000000"), chrono_tz::Asia::Taipei, Utc::now()).unwrap();
        assert_eq!(a.timestamp, b.timestamp);
    }

    #[test]
    fn test_parse_rejects_bad_price() {
        let mut quote = raw("2024-03-04T01:00:00Z");
        quote.price = "n/a".to_string();
        let err = Tick::parse(quote, chrono_tz::Asia::Taipei, Utc::now()).unwrap_err();
        assert_eq!(err, TickError::InvalidPrice("n/a".to_string()));
    }

    #[test]
    fn test_parse_rejects_empty_symbol() {
        let mut quote = raw("2024-03-04T01:00:00Z");
        quote.symbol = " ".to_string();
        assert_eq!(
            Tick::parse(quote, chrono_tz::Asia::Taipei, Utc::now()).unwrap_err(),
            TickError::EmptySymbol
        );
    }

    #[test]
    fn test_batch_roundtrip_keeps_attributes() {
        let tick = Tick::parse(raw("2024-03-04T01:00:00Z"), chrono_tz::Asia::Taipei, Utc::now()).unwrap();

        let mut clashing = raw("2024-03-04T01:00:00Z");
        clashing.attributes.insert("received_at".to_string(), serde_json::json!("2024-03-04T01:00:00Z"));
        clashing.attributes.insert("price".to_string(), serde_json::json!(1));
        clashing.attributes.insert("upstream_price".to_string(), serde_json::json!(2));
        let renamed = Tick::parse(clashing, chrono_tz::Asia::Taipei, Utc::now()).unwrap();
        assert_eq!(renamed.attributes["upstream_received_at"], serde_json::json!("2024-03-04T01:00:00Z"));
        assert_eq!(renamed.attributes["upstream_price"], serde_json::json!(2));
        assert_eq!(renamed.attributes["upstream_upstream_price"], serde_json::json!(1));
        assert_eq!(renamed.attributes.len(), 5);

        let ticks = vec![tick.clone(), Tick { sequence: None, ..tick }, renamed];

        for compression in [Compression::None, Compression::Zstd] {
            let payload = encode_batch(&ticks, compression).unwrap();
            let decoded = decode_batch(&payload, compression).unwrap();
            assert_eq!(decoded, ticks);
        }
    }

    #[test]
    fn test_line_omits_missing_sequence() {
        let mut tick = Tick::parse(raw("2024-03-04T01:00:00Z"), chrono_tz::Asia::Taipei, Utc::now()).unwrap();
        tick.sequence = None;
        let line = String::from_utf8(tick.to_line().unwrap()).unwrap();
        assert!(!line.contains("sequence"));
        assert!(line.ends_with('\n'));
    }
}
