//! Humidity alert state machine.
//!
//! Entry into the alert needs a sustained window: more than
//! [`MIN_RECENT_READINGS`] readings in the last [`RECENT_READINGS_WINDOW_SECS`]
//! with at least [`HIGH_RATIO_THRESHOLD`] of them at or above
//! [`HIGH_HUMIDITY_THRESHOLD`]. Exit happens on the first reading below the
//! threshold. Only the rising edge enqueues a notification.

use crate::db::models::{DeviceAlertState, NewOutboxEvent, OutboxEvent};
use crate::schema;
use chrono::{DateTime, Duration, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Text, Timestamptz};
use log::{debug, info};
use serde_json::json;

pub const HIGH_HUMIDITY_THRESHOLD: f64 = 60.0;
pub const MIN_RECENT_READINGS: i64 = 10;
pub const RECENT_READINGS_WINDOW_SECS: i64 = 60 * 60;
pub const HIGH_RATIO_THRESHOLD: f64 = 0.9;

/// Humidity readings of one device inside the trailing window.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct WindowStats {
    pub total: i64,
    pub high: i64,
}

impl WindowStats {
    pub fn is_sustained_high(&self) -> bool {
        if self.total <= MIN_RECENT_READINGS {
            return false;
        }
        (self.high as f64 / self.total as f64) >= HIGH_RATIO_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// The stored state actually changed.
    pub flipped: bool,
    /// Outbox row written by this call, if any.
    pub outbox_event_id: Option<i64>,
}

impl TransitionOutcome {
    pub const UNCHANGED: TransitionOutcome = TransitionOutcome {
        flipped: false,
        outbox_event_id: None,
    };
}

/// Store operations the evaluator needs.
pub trait AlertStore {
    fn humidity_window(&mut self, device_id: i64, since: DateTime<Utc>) -> QueryResult<WindowStats>;

    fn alert_state(&mut self, device_id: i64, alert_type: &str) -> QueryResult<Option<bool>>;

    fn transition_and_enqueue(
        &mut self,
        device_id: i64,
        alert_state: bool,
        alert_type: &str,
        idempotency_key: &str,
    ) -> QueryResult<TransitionOutcome>;
}

impl AlertStore for PgConnection {
    fn humidity_window(&mut self, device_id: i64, since: DateTime<Utc>) -> QueryResult<WindowStats> {
        humidity_window_stats(self, device_id, since)
    }

    fn alert_state(&mut self, device_id: i64, alert_type: &str) -> QueryResult<Option<bool>> {
        Ok(get_alert_state(self, device_id, alert_type)?.map(|s| s.alert_state))
    }

    fn transition_and_enqueue(
        &mut self,
        device_id: i64,
        alert_state: bool,
        alert_type: &str,
        idempotency_key: &str,
    ) -> QueryResult<TransitionOutcome> {
        transition_alert_state_and_enqueue(self, device_id, alert_state, alert_type, idempotency_key)
    }
}

/// Run the hysteresis for one persisted reading.
///
/// Returns `None` when no transition was attempted.
pub fn evaluate_humidity_alert<S: AlertStore + ?Sized>(
    store: &mut S,
    device_id: i64,
    humidity: Option<f64>,
    alert_type: &str,
    idempotency_key: &str,
    now: DateTime<Utc>,
) -> QueryResult<Option<TransitionOutcome>> {
    let Some(humidity) = humidity else {
        return Ok(None);
    };

    if humidity >= HIGH_HUMIDITY_THRESHOLD {
        let since = now - Duration::seconds(RECENT_READINGS_WINDOW_SECS);
        let stats = store.humidity_window(device_id, since)?;
        debug!(
            "Alert: device {} window total={} high={} (humidity {})",
            device_id, stats.total, stats.high, humidity
        );
        if !stats.is_sustained_high() {
            return Ok(None);
        }
        return store
            .transition_and_enqueue(device_id, true, alert_type, idempotency_key)
            .map(Some);
    }

    match store.alert_state(device_id, alert_type)? {
        Some(true) => store
            .transition_and_enqueue(device_id, false, alert_type, idempotency_key)
            .map(Some),
        _ => Ok(None),
    }
}

pub fn humidity_window_stats(conn: &mut PgConnection, device_id: i64, since: DateTime<Utc>) -> QueryResult<WindowStats> {
    use schema::humid_temp_readings::dsl as R;

    let recent = R::humid_temp_readings
        .filter(R::device_id.eq(device_id))
        .filter(R::received_at.ge(since))
        .filter(R::humidity.is_not_null());

    let total: i64 = recent.clone().count().get_result(conn)?;
    let high: i64 = recent
        .filter(R::humidity.ge(HIGH_HUMIDITY_THRESHOLD))
        .count()
        .get_result(conn)?;
    Ok(WindowStats { total, high })
}

pub fn get_alert_state(
    conn: &mut PgConnection,
    device_id: i64,
    alert_type: &str,
) -> QueryResult<Option<DeviceAlertState>> {
    use schema::device_alert_states::dsl as A;

    A::device_alert_states
        .filter(A::device_id.eq(device_id).and(A::alert_type.eq(alert_type)))
        .select(DeviceAlertState::as_select())
        .first(conn)
        .optional()
}

/// Upsert that only writes when the stored state differs.
///
/// Returns the row when it was inserted or flipped, `None` when the call was a no-op.
pub fn update_alert_state(
    conn: &mut PgConnection,
    device_id: i64,
    alert_state: bool,
    alert_type: &str,
) -> QueryResult<Option<DeviceAlertState>> {
    diesel::sql_query(
        r#"
        INSERT INTO device_alert_states (device_id, alert_type, alert_state, last_triggered_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (device_id, alert_type) DO UPDATE
        SET alert_state = EXCLUDED.alert_state,
            last_triggered_at = EXCLUDED.last_triggered_at
        WHERE device_alert_states.alert_state IS DISTINCT FROM EXCLUDED.alert_state
        RETURNING id, device_id, alert_type, alert_state, last_triggered_at
        "#,
    )
    .bind::<BigInt, _>(device_id)
    .bind::<Text, _>(alert_type)
    .bind::<Bool, _>(alert_state)
    .bind::<Timestamptz, _>(Utc::now())
    .get_result::<DeviceAlertState>(conn)
    .optional()
}

/// Insert-or-ignore on `idempotency_key`; `None` when the key was already used.
pub fn insert_outbox_event(conn: &mut PgConnection, event: &NewOutboxEvent) -> QueryResult<Option<OutboxEvent>> {
    use schema::outbox_events::dsl as O;

    diesel::insert_into(O::outbox_events)
        .values(event)
        .on_conflict(O::idempotency_key)
        .do_nothing()
        .returning(OutboxEvent::as_returning())
        .get_result(conn)
        .optional()
}

pub fn alert_payload(device_id: i64, alert_state: bool, alert_type: &str) -> serde_json::Value {
    json!({
        "device_id": device_id.to_string(),
        "alert_state": alert_state,
        "alert_type": alert_type,
    })
}

/// Flip the alert state and, on a rising edge, enqueue its notification.
///
/// Both writes share one transaction: an outbox row exists if and only if
/// this call committed the flip to `true`. Any error rolls back both.
pub fn transition_alert_state_and_enqueue(
    conn: &mut PgConnection,
    device_id: i64,
    alert_state: bool,
    alert_type: &str,
    idempotency_key: &str,
) -> QueryResult<TransitionOutcome> {
    conn.transaction(|conn| {
        if update_alert_state(conn, device_id, alert_state, alert_type)?.is_none() {
            debug!(
                "Alert: device {} {} already {}; nothing to do",
                device_id, alert_type, alert_state
            );
            return Ok(TransitionOutcome::UNCHANGED);
        }
        info!("Alert: device {} {} -> {}", device_id, alert_type, alert_state);

        if !alert_state {
            return Ok(TransitionOutcome {
                flipped: true,
                outbox_event_id: None,
            });
        }

        let event = NewOutboxEvent {
            event_type: alert_type.to_string(),
            payload: alert_payload(device_id, alert_state, alert_type),
            idempotency_key: idempotency_key.to_string(),
            attempts: 0,
        };
        let inserted = insert_outbox_event(conn, &event)?;
        if let Some(row) = inserted.as_ref() {
            info!("Alert: enqueued outbox event {} ({})", row.id, row.event_type);
        }
        Ok(TransitionOutcome {
            flipped: true,
            outbox_event_id: inserted.map(|row| row.id),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::alert_types::HUMIDITY_SENSOR_ALERT;
    use crate::db::testing;
    use std::collections::HashMap;

    /// In-memory store with the same no-op guard and rising-edge rules.
    #[derive(Default)]
    struct FakeStore {
        readings: Vec<f64>,
        states: HashMap<(i64, String), bool>,
        outbox: Vec<(String, serde_json::Value, String)>,
    }

    impl AlertStore for FakeStore {
        fn humidity_window(&mut self, _device_id: i64, _since: DateTime<Utc>) -> QueryResult<WindowStats> {
            Ok(WindowStats {
                total: self.readings.len() as i64,
                high: self.readings.iter().filter(|h| **h >= HIGH_HUMIDITY_THRESHOLD).count() as i64,
            })
        }

        fn alert_state(&mut self, device_id: i64, alert_type: &str) -> QueryResult<Option<bool>> {
            Ok(self.states.get(&(device_id, alert_type.to_string())).copied())
        }

        fn transition_and_enqueue(
            &mut self,
            device_id: i64,
            alert_state: bool,
            alert_type: &str,
            idempotency_key: &str,
        ) -> QueryResult<TransitionOutcome> {
            let key = (device_id, alert_type.to_string());
            if self.states.get(&key) == Some(&alert_state) {
                return Ok(TransitionOutcome::UNCHANGED);
            }
            self.states.insert(key, alert_state);
            let mut outbox_event_id = None;
            if alert_state && !self.outbox.iter().any(|(_, _, k)| k == idempotency_key) {
                self.outbox.push((
                    alert_type.to_string(),
                    alert_payload(device_id, alert_state, alert_type),
                    idempotency_key.to_string(),
                ));
                outbox_event_id = Some(self.outbox.len() as i64);
            }
            Ok(TransitionOutcome {
                flipped: true,
                outbox_event_id,
            })
        }
    }

    fn feed(store: &mut FakeStore, humidity: f64, key: &str) -> Option<TransitionOutcome> {
        store.readings.push(humidity);
        evaluate_humidity_alert(store, 1, Some(humidity), HUMIDITY_SENSOR_ALERT, key, Utc::now()).expect("evaluate")
    }

    #[test]
    fn window_needs_more_than_min_readings() {
        assert!(!WindowStats { total: 10, high: 10 }.is_sustained_high());
        assert!(WindowStats { total: 11, high: 11 }.is_sustained_high());
        assert!(WindowStats { total: 20, high: 18 }.is_sustained_high());
        assert!(!WindowStats { total: 20, high: 17 }.is_sustained_high());
        assert!(!WindowStats::default().is_sustained_high());
    }

    #[test]
    fn missing_humidity_skips_evaluation() {
        let mut store = FakeStore::default();
        let out = evaluate_humidity_alert(&mut store, 1, None, HUMIDITY_SENSOR_ALERT, "k", Utc::now()).expect("evaluate");
        assert!(out.is_none());
        assert!(store.states.is_empty());
    }

    #[test]
    fn low_reading_without_alert_writes_nothing() {
        let mut store = FakeStore::default();
        assert!(feed(&mut store, 40.0, "k").is_none());
        assert!(store.states.is_empty());
    }

    #[test]
    fn sustained_high_then_low_scenario() {
        let mut store = FakeStore::default();
        for i in 0..10 {
            assert!(feed(&mut store, 65.0, &format!("k{i}")).is_none(), "reading {i} must not alert");
        }

        let out = feed(&mut store, 65.0, "k10").expect("11th reading transitions");
        assert!(out.flipped);
        assert!(out.outbox_event_id.is_some());
        assert_eq!(store.outbox.len(), 1);
        assert_eq!(store.outbox[0].0, "humidity_sensor_alert");
        assert_eq!(
            store.outbox[0].1,
            json!({"device_id": "1", "alert_state": true, "alert_type": "humidity_sensor_alert"})
        );

        // still high: re-asserting true is a no-op
        let again = feed(&mut store, 65.0, "k11").expect("attempted");
        assert_eq!(again, TransitionOutcome::UNCHANGED);
        assert_eq!(store.outbox.len(), 1);

        let cleared = feed(&mut store, 40.0, "k12").expect("clears");
        assert!(cleared.flipped);
        assert!(cleared.outbox_event_id.is_none());
        assert_eq!(store.outbox.len(), 1);
        assert_eq!(store.states.get(&(1, HUMIDITY_SENSOR_ALERT.to_string())), Some(&false));
    }

    // Store-backed properties; need TEST_DATABASE_URL.

    fn device(conn: &mut PgConnection) -> i64 {
        testing::insert_device(conn, &format!("alert_{}", testing::unique_suffix()))
    }

    fn outbox_count(conn: &mut PgConnection, key: &str) -> i64 {
        use schema::outbox_events::dsl as O;
        O::outbox_events
            .filter(O::idempotency_key.eq(key))
            .count()
            .get_result(conn)
            .expect("count outbox")
    }

    #[test]
    fn outbox_insert_is_idempotent() {
        let Some(mut conn) = testing::transaction() else { return };
        let key = format!("outbox-{}", testing::unique_suffix());
        let event = NewOutboxEvent {
            event_type: "test".into(),
            payload: json!({"test": "test"}),
            idempotency_key: key.clone(),
            attempts: 0,
        };
        assert!(insert_outbox_event(&mut conn, &event).expect("insert").is_some());
        assert!(insert_outbox_event(&mut conn, &event).expect("insert").is_none());
        assert_eq!(outbox_count(&mut conn, &key), 1);

        let other = NewOutboxEvent {
            idempotency_key: format!("{key}-2"),
            ..event
        };
        assert!(insert_outbox_event(&mut conn, &other).expect("insert").is_some());
    }

    #[test]
    fn same_state_twice_enqueues_once() {
        let Some(mut conn) = testing::transaction() else { return };
        let device_id = device(&mut conn);
        let k1 = format!("k1-{}", testing::unique_suffix());
        let k2 = format!("k2-{}", testing::unique_suffix());

        let first = transition_alert_state_and_enqueue(&mut conn, device_id, true, HUMIDITY_SENSOR_ALERT, &k1)
            .expect("first transition");
        assert!(first.flipped);
        assert!(first.outbox_event_id.is_some());

        let second = transition_alert_state_and_enqueue(&mut conn, device_id, true, HUMIDITY_SENSOR_ALERT, &k2)
            .expect("second transition");
        assert_eq!(second, TransitionOutcome::UNCHANGED);
        assert_eq!(outbox_count(&mut conn, &k1), 1);
        assert_eq!(outbox_count(&mut conn, &k2), 0);
    }

    #[test]
    fn falling_edge_updates_state_without_event() {
        let Some(mut conn) = testing::transaction() else { return };
        let device_id = device(&mut conn);
        let up = format!("up-{}", testing::unique_suffix());
        let down = format!("down-{}", testing::unique_suffix());

        transition_alert_state_and_enqueue(&mut conn, device_id, true, HUMIDITY_SENSOR_ALERT, &up).expect("rise");
        let out = transition_alert_state_and_enqueue(&mut conn, device_id, false, HUMIDITY_SENSOR_ALERT, &down)
            .expect("fall");
        assert!(out.flipped);
        assert!(out.outbox_event_id.is_none());
        assert_eq!(outbox_count(&mut conn, &down), 0);

        let state = get_alert_state(&mut conn, device_id, HUMIDITY_SENSOR_ALERT)
            .expect("load")
            .expect("row exists");
        assert!(!state.alert_state);
    }

    #[test]
    fn failed_enqueue_rolls_back_state() {
        let Some(mut conn) = testing::transaction() else { return };
        let device_id = device(&mut conn);
        let alert_type = "reject_me";

        transition_alert_state_and_enqueue(&mut conn, device_id, false, alert_type, &testing::unique_suffix())
            .expect("seed false state");

        // DDL is transactional; the constraint vanishes with the test transaction
        diesel::sql_query(
            "ALTER TABLE outbox_events ADD CONSTRAINT outbox_reject_test CHECK (event_type <> 'reject_me')",
        )
        .execute(&mut conn)
        .expect("add rejecting constraint");

        let err =
            transition_alert_state_and_enqueue(&mut conn, device_id, true, alert_type, &testing::unique_suffix());
        assert!(err.is_err());

        let state = get_alert_state(&mut conn, device_id, alert_type)
            .expect("load")
            .expect("row exists");
        assert!(!state.alert_state, "state must keep its pre-transition value");
    }

    #[test]
    fn window_counts_only_recent_readings() {
        let Some(mut conn) = testing::transaction() else { return };
        let device_id = device(&mut conn);
        let now = Utc::now();
        for _ in 0..3 {
            testing::insert_reading(&mut conn, device_id, 70.0, now - Duration::minutes(5));
        }
        testing::insert_reading(&mut conn, device_id, 50.0, now - Duration::minutes(1));
        testing::insert_reading(&mut conn, device_id, 90.0, now - Duration::hours(2));

        let stats = humidity_window_stats(&mut conn, device_id, now - Duration::hours(1)).expect("stats");
        assert_eq!(stats, WindowStats { total: 4, high: 3 });
    }

    #[test]
    fn sustained_window_in_store_triggers_once() {
        let Some(mut conn) = testing::transaction() else { return };
        let device_id = device(&mut conn);
        let now = Utc::now();

        for i in 0..10 {
            testing::insert_reading(&mut conn, device_id, 65.0, now - Duration::seconds(i));
            let out = evaluate_humidity_alert(
                &mut conn,
                device_id,
                Some(65.0),
                HUMIDITY_SENSOR_ALERT,
                &format!("scenario-{i}-{}", testing::unique_suffix()),
                now,
            )
            .expect("evaluate");
            assert!(out.is_none());
        }

        testing::insert_reading(&mut conn, device_id, 65.0, now);
        let key = format!("scenario-10-{}", testing::unique_suffix());
        let out = evaluate_humidity_alert(&mut conn, device_id, Some(65.0), HUMIDITY_SENSOR_ALERT, &key, now)
            .expect("evaluate")
            .expect("transition attempted");
        assert!(out.flipped);
        assert_eq!(outbox_count(&mut conn, &key), 1);
    }
}
