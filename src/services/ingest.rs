//! Ingestion pipeline: topic filter, device resolution, idempotent persistence
//! and alert evaluation, with a dead-letter fallback for anything that fails.

use crate::db::models::{NewSensorReading, SensorReading, alert_types, identifier_types};
use crate::db::pool::PgPool;
use crate::models::z2m::{self, HumidTempPayload, PayloadError};
use crate::schema;
use crate::services::alerts::{self, TransitionOutcome};
use crate::services::{inbox, provision};
use crate::utils::{error_chain, idempotency_key};
use chrono::{DateTime, Utc};
use core::fmt;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, error, info, warn};
use std::error::Error;

const CONTROL_SEGMENTS: [&str; 3] = ["set", "get", "availability"];

/// What an inbound topic addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Device state message; holds the device segment after the prefix.
    Device(String),
    /// Bridge or command topic under the prefix.
    Control,
    /// Outside the prefix.
    Foreign,
}

pub fn classify_topic(prefix: &str, topic: &str) -> TopicKind {
    let Some(rest) = topic.strip_prefix(prefix).and_then(|r| r.strip_prefix('/')) else {
        return TopicKind::Foreign;
    };
    let mut segments = rest.split('/');
    let first = segments.next().unwrap_or_default();
    let last = rest.rsplit('/').next().unwrap_or_default();
    if first.is_empty() || last.is_empty() {
        return TopicKind::Foreign;
    }
    if first == "bridge" || CONTROL_SEGMENTS.contains(&last) {
        return TopicKind::Control;
    }
    TopicKind::Device(rest.to_string())
}

#[derive(Debug)]
pub enum IngestError {
    /// Body is not a valid sensor payload.
    Payload(PayloadError),
    /// No `device_identifiers` mapping for the topic's device segment.
    UnknownDevice(String),
    Store(diesel::result::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Payload(e) => write!(f, "invalid payload at {}: {}", e.path(), e.inner()),
            IngestError::UnknownDevice(name) => write!(f, "no device mapped to topic name {}", name),
            IngestError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IngestError::Payload(e) => Some(e),
            IngestError::Store(e) => Some(e),
            IngestError::UnknownDevice(_) => None,
        }
    }
}

impl From<PayloadError> for IngestError {
    fn from(value: PayloadError) -> Self {
        IngestError::Payload(value)
    }
}

impl From<diesel::result::Error> for IngestError {
    fn from(value: diesel::result::Error) -> Self {
        IngestError::Store(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Topic filtered out; not an error.
    Ignored(TopicKind),
    Stored {
        device_id: i64,
        /// `None` when the reading had been stored before.
        reading_id: Option<i64>,
        transition: Option<TransitionOutcome>,
    },
}

/// Final disposition of one transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed(IngestOutcome),
    DeadLettered { newly_captured: bool },
    /// Neither processed nor dead-lettered; leave it for redelivery.
    Unhandled,
}

impl MessageOutcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, MessageOutcome::Unhandled)
    }
}

pub fn build_reading(
    device_id: i64,
    payload: &HumidTempPayload,
    received_at: DateTime<Utc>,
    idempotency_key: &str,
) -> NewSensorReading {
    let mut row = NewSensorReading::new(device_id, received_at, idempotency_key);
    row.temperature = payload.temperature;
    row.humidity = payload.humidity;
    row.battery = payload.battery;
    row.link_quality = payload.linkquality;
    row.comfort_humidity_min = payload.comfort_humidity_min;
    row.comfort_humidity_max = payload.comfort_humidity_max;
    row.comfort_temperature_min = payload.comfort_temperature_min;
    row.comfort_temperature_max = payload.comfort_temperature_max;
    row.humidity_calibration = payload.humidity_calibration;
    row.temperature_calibration = payload.temperature_calibration;
    row.temperature_units = payload.temperature_units.clone();
    row
}

/// Insert-or-ignore on `(device_id, idempotency_key)`; `None` means already seen.
pub fn insert_reading(conn: &mut PgConnection, reading: &NewSensorReading) -> QueryResult<Option<SensorReading>> {
    use schema::humid_temp_readings::dsl as R;

    diesel::insert_into(R::humid_temp_readings)
        .values(reading)
        .on_conflict((R::device_id, R::idempotency_key))
        .do_nothing()
        .returning(SensorReading::as_returning())
        .get_result(conn)
        .optional()
}

pub fn latest_reading(conn: &mut PgConnection, device_id: i64) -> QueryResult<Option<SensorReading>> {
    use schema::humid_temp_readings::dsl as R;

    R::humid_temp_readings
        .filter(R::device_id.eq(device_id))
        .order(R::received_at.desc())
        .select(SensorReading::as_select())
        .first(conn)
        .optional()
}

/// Persist the reading, then evaluate the alert for it.
///
/// Evaluation also runs for duplicates so a redelivery after a crash between
/// the two steps still gets its evaluation.
pub fn handle_reading(
    conn: &mut PgConnection,
    reading: &NewSensorReading,
) -> QueryResult<(Option<SensorReading>, Option<TransitionOutcome>)> {
    let stored = insert_reading(conn, reading)?;
    if stored.is_none() {
        debug!(
            "Ingest: reading {} for device {} already stored",
            reading.idempotency_key, reading.device_id
        );
    }
    let transition = alerts::evaluate_humidity_alert(
        conn,
        reading.device_id,
        reading.humidity,
        alert_types::HUMIDITY_SENSOR_ALERT,
        &reading.idempotency_key,
        reading.received_at,
    )?;
    Ok((stored, transition))
}

/// Steps 1-5 of ingestion; errors are returned, not dead-lettered.
pub fn ingest_message(
    conn: &mut PgConnection,
    topic_prefix: &str,
    topic: &str,
    raw: &[u8],
    message_key: &str,
) -> Result<IngestOutcome, IngestError> {
    let device_name = match classify_topic(topic_prefix, topic) {
        TopicKind::Device(name) => name,
        other => return Ok(IngestOutcome::Ignored(other)),
    };

    let device_id = provision::resolve_device(conn, identifier_types::TOPIC_NAME, &device_name)?
        .ok_or_else(|| IngestError::UnknownDevice(device_name.clone()))?;
    let payload = z2m::parse_humid_temp(raw)?;
    let reading = build_reading(device_id, &payload, Utc::now(), message_key);
    let (stored, transition) = handle_reading(conn, &reading)?;

    Ok(IngestOutcome::Stored {
        device_id,
        reading_id: stored.map(|r| r.id),
        transition,
    })
}

/// Process one message, dead-lettering it on any failure. Never returns an error.
pub fn handle_message(conn: &mut PgConnection, topic_prefix: &str, topic: &str, raw: &[u8]) -> MessageOutcome {
    let key = idempotency_key(topic, raw);
    match ingest_message(conn, topic_prefix, topic, raw, &key) {
        Ok(outcome) => {
            log_outcome(topic, &key, &outcome);
            MessageOutcome::Processed(outcome)
        }
        Err(e) => {
            let reason = error_chain(&e);
            error!("Ingest: message {} on {} failed: {}", key, topic, reason);
            dead_letter(conn, topic, raw, &key, &reason)
        }
    }
}

fn dead_letter(conn: &mut PgConnection, topic: &str, raw: &[u8], key: &str, reason: &str) -> MessageOutcome {
    match inbox::capture(conn, topic, raw, key, Some(reason)) {
        Ok(newly_captured) => MessageOutcome::DeadLettered { newly_captured },
        Err(e) => {
            error!("Inbox: failed to capture message {}: {}", key, e);
            MessageOutcome::Unhandled
        }
    }
}

fn log_outcome(topic: &str, key: &str, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::Ignored(kind) => debug!("Ingest: ignoring {:?} topic {}", kind, topic),
        IngestOutcome::Stored {
            device_id,
            reading_id: Some(id),
            ..
        } => info!("Ingest: stored reading {} for device {} ({})", id, device_id, key),
        IngestOutcome::Stored { device_id, .. } => {
            info!("Ingest: duplicate message {} for device {}", key, device_id)
        }
    }
}

/// Pool-backed front end used by the subscriber loop.
pub struct Ingestor<'a> {
    pool: &'a PgPool,
    topic_prefix: String,
}

impl<'a> Ingestor<'a> {
    pub fn new(pool: &'a PgPool, topic_prefix: impl Into<String>) -> Self {
        Ingestor {
            pool,
            topic_prefix: topic_prefix.into(),
        }
    }

    pub fn handle(&self, topic: &str, raw: &[u8]) -> MessageOutcome {
        if let kind @ (TopicKind::Control | TopicKind::Foreign) = classify_topic(&self.topic_prefix, topic) {
            debug!("Ingest: ignoring {:?} topic {}", kind, topic);
            return MessageOutcome::Processed(IngestOutcome::Ignored(kind));
        }
        let mut conn = match self.pool.get() {
            Ok(c) => c,
            Err(e) => {
                warn!("Ingest: no store connection for message on {}: {}", topic, e);
                return MessageOutcome::Unhandled;
            }
        };
        handle_message(&mut conn, &self.topic_prefix, topic, raw)
    }
}
