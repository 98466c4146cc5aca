//! Per-send message properties and delay encoding.
//!
//! [`MessageProperties`] is a plain data carrier: setters overwrite, nothing
//! is range-checked here. The one rule it does enforce is the delay
//! precedence, and it enforces it at serialization time in
//! [`MessageProperties::to_serializable`]:
//!
//! - an absolute start time beats a legacy delay level,
//! - the active start time always travels in the reserved
//!   [`START_DELIVER_TIME_PROPERTY`] entry, which older brokers understand,
//! - a reserved entry put there by the caller wins over the typed field,
//! - the top-level `startDeliverTime` is never emitted beside the reserved
//!   entry.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MqError, Result};

/// Reserved user-property key carrying an absolute delivery time (epoch ms).
pub const START_DELIVER_TIME_PROPERTY: &str = "__STARTDELIVERTIME";

/// Delay of each legacy tier, index 0 is level 1.
const DELAY_LEVEL_MILLIS: [u64; 18] = [
    1_000, 5_000, 10_000, 30_000, // 1s 5s 10s 30s
    60_000, 120_000, 180_000, 240_000, 300_000, 360_000, 420_000, 480_000, 540_000,
    600_000, // 1m .. 10m
    1_200_000, 1_800_000, // 20m 30m
    3_600_000, 7_200_000, // 1h 2h
];

/// A legacy delay tier, `1..=18`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DelayLevel(u8);

impl DelayLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = DELAY_LEVEL_MILLIS.len() as u8;

    /// Validate a raw tier number.
    ///
    /// # Errors
    ///
    /// Returns [`MqError::Validation`] outside `1..=18`.
    pub fn new(level: u8) -> Result<Self> {
        // ---
        if (Self::MIN..=Self::MAX).contains(&level) {
            Ok(Self(level))
        } else {
            Err(MqError::Validation(format!(
                "delay level {level} outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// The smallest tier whose delay covers `deliver_at_ms - now_ms`.
    ///
    /// Past or immediate times map to level 1; anything beyond two hours
    /// saturates at the top tier.
    pub fn for_deliver_time(deliver_at_ms: u64, now_ms: u64) -> Self {
        // ---
        let remaining = deliver_at_ms.saturating_sub(now_ms);
        let index = DELAY_LEVEL_MILLIS
            .iter()
            .position(|&tier| remaining <= tier)
            .unwrap_or(DELAY_LEVEL_MILLIS.len() - 1);
        Self(index as u8 + 1)
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// Delay the broker applies for this tier.
    pub fn duration(self) -> Duration {
        Duration::from_millis(DELAY_LEVEL_MILLIS[usize::from(self.0 - 1)])
    }
}

/// Delay intent for [`Producer::publish_delayed`](crate::Producer::publish_delayed).
///
/// Both may be given; the start time then wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayOptions {
    /// Legacy tier number, validated by the producer.
    pub delay_time_level: Option<u8>,
    /// Absolute delivery time in epoch milliseconds.
    pub start_deliver_time: Option<u64>,
}

impl DelayOptions {
    /// Deliver at an absolute epoch-millisecond timestamp.
    pub fn deliver_at(start_deliver_time: u64) -> Self {
        Self {
            delay_time_level: None,
            start_deliver_time: Some(start_deliver_time),
        }
    }

    /// Deliver after a legacy tier delay.
    pub fn level(delay_time_level: u8) -> Self {
        Self {
            delay_time_level: Some(delay_time_level),
            start_deliver_time: None,
        }
    }
}

/// Mutable property bag for a single send.
///
/// Built per call and consumed by serialization; never shared between sends.
///
/// ```
/// use mq_bridge::MessageProperties;
///
/// let props = MessageProperties::new()
///     .put_property("region", "eu")
///     .with_message_key("order-42")
///     .with_start_deliver_time(1_700_000_000_000);
///
/// let wire = props.to_serializable();
/// assert_eq!(wire.properties["__STARTDELIVERTIME"], "1700000000000");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    properties: BTreeMap<String, String>,
    message_key: String,
    sharding_key: String,
    start_deliver_time: Option<u64>,
    delay_time_level: Option<u8>,
    trans_check_immunity_time: u64,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user property; the value is stringified.
    pub fn put_property(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn with_message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = key.into();
        self
    }

    pub fn with_sharding_key(mut self, key: impl Into<String>) -> Self {
        self.sharding_key = key.into();
        self
    }

    /// Absolute delivery time in epoch milliseconds. `0` clears it.
    pub fn with_start_deliver_time(mut self, epoch_ms: u64) -> Self {
        self.start_deliver_time = (epoch_ms > 0).then_some(epoch_ms);
        self
    }

    /// Legacy delay tier. Not range-checked here.
    pub fn with_delay_time_level(mut self, level: u8) -> Self {
        self.delay_time_level = Some(level);
        self
    }

    /// Transaction check-immunity window in seconds.
    pub fn with_trans_check_immunity_time(mut self, secs: u64) -> Self {
        self.trans_check_immunity_time = secs;
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn message_key(&self) -> &str {
        &self.message_key
    }

    pub fn sharding_key(&self) -> &str {
        &self.sharding_key
    }

    pub fn start_deliver_time(&self) -> Option<u64> {
        self.start_deliver_time
    }

    pub fn delay_time_level(&self) -> Option<u8> {
        self.delay_time_level
    }

    pub fn trans_check_immunity_time(&self) -> u64 {
        self.trans_check_immunity_time
    }

    /// Produce the canonical wire form, applying delay precedence.
    pub fn to_serializable(&self) -> SerializedProperties {
        // ---
        let mut properties = self.properties.clone();
        if let Some(at) = self.start_deliver_time {
            properties
                .entry(START_DELIVER_TIME_PROPERTY.to_string())
                .or_insert_with(|| at.to_string());
        }

        // The reserved entry is the only delay encoding once present: no
        // top-level start time and no tier travel beside it.
        let reserved = properties.contains_key(START_DELIVER_TIME_PROPERTY);
        let delay_time_level = if reserved { None } else { self.delay_time_level };

        SerializedProperties {
            properties,
            message_key: self.message_key.clone(),
            sharding_key: self.sharding_key.clone(),
            trans_check_immunity_time: self.trans_check_immunity_time,
            start_deliver_time: None,
            delay_time_level,
        }
    }

    /// JSON text of [`to_serializable`](Self::to_serializable), as handed to
    /// the transport.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_serializable())?)
    }
}

/// Wire form of [`MessageProperties`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedProperties {
    pub properties: BTreeMap<String, String>,
    pub message_key: String,
    pub sharding_key: String,
    pub trans_check_immunity_time: u64,

    /// Read from peers that still send it; never set by
    /// [`MessageProperties::to_serializable`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_deliver_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_time_level: Option<u8>,
}

impl SerializedProperties {
    /// The effective absolute delivery time, read from the reserved entry.
    pub fn deliver_at(&self) -> Option<u64> {
        self.properties
            .get(START_DELIVER_TIME_PROPERTY)
            .and_then(|v| v.parse().ok())
            .or(self.start_deliver_time)
    }
}
