//! Wire-level metric record and HMAC-SHA256 signing.
//!
//! A [`Metric`] is the JSON document exchanged between agent and server:
//!
//! ```json
//! {"id": "PollCount", "type": "counter", "delta": 1, "hash": "ce97…"}
//! ```
//!
//! Decoding is lenient (missing or unrecognized fields decode to
//! `None`) so that validation happens in one place, [`Metric::value`], and
//! produces a [`MetricError`] the caller can turn into a rejection status.
//!
//! # Signing message
//!
//! The HMAC input is `"<id>:gauge:<value>"` with the value rendered with six
//! fixed decimals, or `"<id>:counter:<delta>"` with a plain integer. The
//! format is part of the wire contract and must match the peer byte-for-byte.

use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Kind and value
// ---------------------------------------------------------------------------

/// Metric kind as carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Point-in-time value, last write wins.
    Gauge,
    /// Accumulating integer, each update adds its delta.
    Counter,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(Self::Gauge),
            "counter" => Ok(Self::Counter),
            other => Err(MetricError::UnknownKind(other.to_string())),
        }
    }
}

/// A typed metric value, the unit the storage layer works with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Counter(_) => MetricKind::Counter,
        }
    }

    /// Apply an incoming update on top of the currently stored value.
    ///
    /// Gauges overwrite. Counters add the incoming delta to the stored total,
    /// treating a missing or differently-typed previous value as zero.
    pub fn accumulate(self, previous: Option<MetricValue>) -> MetricValue {
        match (self, previous) {
            (Self::Counter(delta), Some(Self::Counter(prev))) => {
                Self::Counter(prev.wrapping_add(delta))
            }
            (incoming, _) => incoming,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauge(value) => write!(f, "{value:.6}"),
            Self::Counter(delta) => write!(f, "{delta}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation failures for a decoded [`Metric`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("metric id is empty")]
    EmptyId,
    #[error("metric {0} has no recognized type")]
    MissingKind(String),
    #[error("unknown metric type {0:?}")]
    UnknownKind(String),
    #[error("{kind} metric {id} carries no {field}")]
    MissingValue {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },
    #[error("{kind} metric {id} must not carry {field}")]
    WrongField {
        id: String,
        kind: MetricKind,
        field: &'static str,
    },
    #[error("signing key rejected by HMAC")]
    InvalidKey,
}

// ---------------------------------------------------------------------------
// Wire record
// ---------------------------------------------------------------------------

/// JSON wire record exchanged between agent and server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub id: String,
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_kind",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<MetricKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Hex-encoded HMAC-SHA256 tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Unrecognized `type` strings decode to `None` instead of failing the
/// whole document, so the handler can answer with a validation status.
fn lenient_kind<'de, D>(deserializer: D) -> Result<Option<MetricKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            kind: Some(MetricKind::Gauge),
            value: Some(value),
            ..Self::default()
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            kind: Some(MetricKind::Counter),
            delta: Some(delta),
            ..Self::default()
        }
    }

    /// A read request: id and kind only.
    pub fn query(id: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id: id.into(),
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn from_value(id: impl Into<String>, value: MetricValue) -> Self {
        match value {
            MetricValue::Gauge(value) => Self::gauge(id, value),
            MetricValue::Counter(delta) => Self::counter(id, delta),
        }
    }

    /// Validate the record and extract its typed value.
    ///
    /// Exactly one of `value`/`delta` must be populated, and it must be the
    /// one matching the declared kind.
    pub fn value(&self) -> Result<MetricValue, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::EmptyId);
        }
        let kind = self
            .kind
            .ok_or_else(|| MetricError::MissingKind(self.id.clone()))?;

        match kind {
            MetricKind::Gauge => {
                if self.delta.is_some() {
                    return Err(self.wrong_field(kind, "delta"));
                }
                self.value
                    .map(MetricValue::Gauge)
                    .ok_or_else(|| self.missing_value(kind, "value"))
            }
            MetricKind::Counter => {
                if self.value.is_some() {
                    return Err(self.wrong_field(kind, "value"));
                }
                self.delta
                    .map(MetricValue::Counter)
                    .ok_or_else(|| self.missing_value(kind, "delta"))
            }
        }
    }

    fn wrong_field(&self, kind: MetricKind, field: &'static str) -> MetricError {
        MetricError::WrongField {
            id: self.id.clone(),
            kind,
            field,
        }
    }

    fn missing_value(&self, kind: MetricKind, field: &'static str) -> MetricError {
        MetricError::MissingValue {
            id: self.id.clone(),
            kind,
            field,
        }
    }

    // -----------------------------------------------------------------------
    // Signing
    // -----------------------------------------------------------------------

    /// Canonical message the HMAC is computed over.
    pub fn signing_message(&self) -> Result<String, MetricError> {
        Ok(match self.value()? {
            MetricValue::Gauge(value) => format!("{}:gauge:{value:.6}", self.id),
            MetricValue::Counter(delta) => format!("{}:counter:{delta}", self.id),
        })
    }

    fn mac(&self, key: &str) -> Result<HmacSha256, MetricError> {
        let message = self.signing_message()?;
        let mut mac =
            HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| MetricError::InvalidKey)?;
        mac.update(message.as_bytes());
        Ok(mac)
    }

    /// Raw HMAC-SHA256 tag for this metric under `key`.
    pub fn signature(&self, key: &str) -> Result<Vec<u8>, MetricError> {
        Ok(self.mac(key)?.finalize().into_bytes().to_vec())
    }

    /// Store the hex-encoded signature in `hash`. An empty key leaves the
    /// metric unsigned.
    pub fn sign(&mut self, key: &str) -> Result<(), MetricError> {
        if key.is_empty() {
            self.hash = None;
            return Ok(());
        }
        self.hash = Some(hex::encode(self.signature(key)?));
        Ok(())
    }

    /// Recompute the signature from the metric's own fields and compare it
    /// with `hash` in constant time.
    pub fn verify(&self, key: &str) -> bool {
        let Some(hash) = self.hash.as_deref() else {
            return false;
        };
        let Ok(tag) = hex::decode(hash) else {
            return false;
        };
        match self.mac(key) {
            Ok(mac) => mac.verify_slice(&tag).is_ok(),
            Err(_) => false,
        }
    }
}
