//! Payloads published by zigbee2mqtt for temperature/humidity sensors.
//!
//! Only the device state message is modelled. Every field is optional because
//! z2m omits values the device has not reported yet; unknown fields are ignored.

use serde::{Deserialize, Serialize};

pub type PayloadError = serde_path_to_error::Error<serde_json::Error>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumidTempPayload {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: Option<f64>,
    pub linkquality: Option<f64>,
    pub comfort_humidity_min: Option<f64>,
    pub comfort_humidity_max: Option<f64>,
    pub comfort_temperature_min: Option<f64>,
    pub comfort_temperature_max: Option<f64>,
    pub humidity_calibration: Option<f64>,
    pub temperature_calibration: Option<f64>,
    /// Stored verbatim (`celsius`, `fahrenheit`, ...).
    pub temperature_units: Option<String>,
    /// Firmware update block; kept opaque so new z2m states never reject a reading.
    pub update: Option<serde_json::Value>,
}

/// Parse a raw MQTT body, reporting the JSON path of the first offending field.
pub fn parse_humid_temp(raw: &[u8]) -> Result<HumidTempPayload, PayloadError> {
    let de = &mut serde_json::Deserializer::from_slice(raw);
    serde_path_to_error::deserialize(de)
}
