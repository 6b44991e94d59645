//! Outbound notification transport.
//!
//! - Blocking HTTP client using `ureq` (no async).
//! - One POST per outbox row; any transport error or non-2xx status is
//!   reported as a failure and retried by the dispatcher.
//! - Deliveries are at-least-once, so every request carries an
//!   `Idempotency-Key` header the receiver can deduplicate on.

use crate::db::models::alert_types;
use http::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

const DEFAULT_SUBJECT: &str = "Notification";
const HUMIDITY_SUBJECT: &str = "Humidity Alert";
const HUMIDITY_MESSAGE: &str = "Humidity has remained above 60% for the past 30 minutes.\n\
This may increase the risk of mould.\n\
Please consider ventilating the area or turning on a dehumidifier.";

#[derive(Debug)]
pub enum NotifyError {
    Transport(String),
    Status(StatusCode),
}

impl core::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NotifyError::Transport(s) => write!(f, "transport error: {}", s),
            NotifyError::Status(status) => write!(f, "http {}", status),
        }
    }
}

impl std::error::Error for NotifyError {}

/// One outbox row as handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct Notification<'a> {
    pub event_type: &'a str,
    pub payload: &'a Value,
    pub idempotency_key: &'a str,
}

pub trait Notifier {
    fn publish(&self, notification: &Notification<'_>) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for &N {
    fn publish(&self, notification: &Notification<'_>) -> Result<(), NotifyError> {
        (**self).publish(notification)
    }
}

/// Request body: the stored payload plus a human-readable subject and message.
pub fn envelope(notification: &Notification<'_>) -> Value {
    let (subject, message) = match notification.event_type {
        alert_types::HUMIDITY_SENSOR_ALERT => (HUMIDITY_SUBJECT, Some(HUMIDITY_MESSAGE)),
        _ => (DEFAULT_SUBJECT, None),
    };
    json!({
        "event_type": notification.event_type,
        "subject": subject,
        "message": message,
        "payload": notification.payload,
    })
}

pub struct HttpNotifier {
    agent: ureq::Agent,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder().timeout_global(Some(timeout)).build();
        HttpNotifier {
            agent: ureq::Agent::new_with_config(config),
            url: url.into(),
        }
    }
}

impl Notifier for HttpNotifier {
    fn publish(&self, notification: &Notification<'_>) -> Result<(), NotifyError> {
        let body = envelope(notification);
        let resp = self
            .agent
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, notification.idempotency_key)
            .header(EVENT_TYPE_HEADER, notification.event_type)
            .send_json(&body);
        match resp {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code)) => Err(NotifyError::Status(
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            )),
            Err(e) => Err(NotifyError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humidity_envelope_carries_advice() {
        let payload = json!({"device_id": "1", "alert_state": true, "alert_type": "humidity_sensor_alert"});
        let n = Notification {
            event_type: alert_types::HUMIDITY_SENSOR_ALERT,
            payload: &payload,
            idempotency_key: "k",
        };
        let body = envelope(&n);
        assert_eq!(body["subject"], "Humidity Alert");
        assert!(body["message"].as_str().unwrap_or_default().contains("mould"));
        assert_eq!(body["payload"], payload);
        assert_eq!(body["event_type"], "humidity_sensor_alert");
    }

    #[test]
    fn other_events_use_generic_subject() {
        let payload = json!({"test": "test"});
        let n = Notification {
            event_type: "test",
            payload: &payload,
            idempotency_key: "k",
        };
        let body = envelope(&n);
        assert_eq!(body["subject"], "Notification");
        assert!(body["message"].is_null());
    }

    #[test]
    fn status_errors_render_code() {
        assert_eq!(NotifyError::Status(StatusCode::BAD_GATEWAY).to_string(), "http 502 Bad Gateway");
        assert_eq!(
            NotifyError::Transport("connection refused".into()).to_string(),
            "transport error: connection refused"
        );
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() {
        // port 9 (discard) on localhost is expected to refuse connections
        let notifier = HttpNotifier::new("http://127.0.0.1:9/notify", Duration::from_secs(2));
        let payload = json!({});
        let err = notifier
            .publish(&Notification {
                event_type: "test",
                payload: &payload,
                idempotency_key: "k",
            })
            .unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
    }
}
