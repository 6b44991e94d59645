//! Diesel model structs for the ingestion, alerting and outbox tables.
//!
//! Uniqueness that concurrent writers rely on lives in the migrations, not here:
//! `(device_id, idempotency_key)` on readings, `(id_type, id_value)` on
//! identifiers, `(device_id, alert_type)` on alert states and the
//! `idempotency_key` / `message_key` columns of the outbox and inbox.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

/// Values of `device_identifiers.id_type`.
pub mod identifier_types {
    /// Device segment of the MQTT topic, e.g. `toilet_humid_temp_sensor`.
    pub const TOPIC_NAME: &str = "topic_name";
    pub const IEEE_ADDRESS: &str = "ieee_address";
}

/// Values of `outbox_events.status`.
pub mod outbox_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const DONE: &str = "done";
}

/// Values of `device_alert_states.alert_type`, doubling as outbox `event_type`.
pub mod alert_types {
    pub const HUMIDITY_SENSOR_ALERT: &str = "humidity_sensor_alert";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct Device {
    pub id: i64,
    pub device_type: String,
    pub display_name: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub device_type: String,
    pub display_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_identifiers)]
pub struct NewDeviceIdentifier {
    pub device_id: i64,
    pub id_type: String,
    pub id_value: String,
}

// Append-only; never updated or deleted.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::humid_temp_readings)]
#[diesel(belongs_to(Device))]
pub struct SensorReading {
    pub id: i64,
    pub device_id: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub link_quality: Option<f64>,
    pub comfort_humidity_min: Option<f64>,
    pub comfort_humidity_max: Option<f64>,
    pub comfort_temperature_min: Option<f64>,
    pub comfort_temperature_max: Option<f64>,
    pub humidity_calibration: Option<f64>,
    pub temperature_calibration: Option<f64>,
    pub temperature_units: Option<String>,
    pub received_at: DateTime<Utc>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::humid_temp_readings)]
pub struct NewSensorReading {
    pub device_id: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub link_quality: Option<f64>,
    pub comfort_humidity_min: Option<f64>,
    pub comfort_humidity_max: Option<f64>,
    pub comfort_temperature_min: Option<f64>,
    pub comfort_temperature_max: Option<f64>,
    pub humidity_calibration: Option<f64>,
    pub temperature_calibration: Option<f64>,
    pub temperature_units: Option<String>,
    pub received_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl NewSensorReading {
    /// Empty reading for `device_id`; measurement fields are filled in by the caller.
    pub fn new(device_id: i64, received_at: DateTime<Utc>, idempotency_key: impl Into<String>) -> Self {
        NewSensorReading {
            device_id,
            temperature: None,
            humidity: None,
            battery: None,
            link_quality: None,
            comfort_humidity_min: None,
            comfort_humidity_max: None,
            comfort_temperature_min: None,
            comfort_temperature_max: None,
            humidity_calibration: None,
            temperature_calibration: None,
            temperature_units: None,
            received_at,
            idempotency_key: idempotency_key.into(),
        }
    }
}

// Also loaded by name from the raw upsert in `services::alerts`.
#[derive(Debug, Clone, Queryable, QueryableByName, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::device_alert_states)]
#[diesel(belongs_to(Device))]
pub struct DeviceAlertState {
    pub id: i64,
    pub device_id: i64,
    pub alert_type: String,
    pub alert_state: bool,
    pub last_triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::outbox_events)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub idempotency_key: String,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::outbox_events)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub attempts: i32,
}

// Dead-letter record; never consumed by this service.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::inbox_messages)]
pub struct InboxMessage {
    pub id: i64,
    pub message_key: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::inbox_messages)]
pub struct NewInboxMessage {
    pub message_key: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
}
