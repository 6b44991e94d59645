//! Helpers for tests that need a real Postgres.
//!
//! Set `TEST_DATABASE_URL` to run them; without it every store-backed test
//! returns early. Migrations are applied once per test binary.

use crate::db::models::{NewDevice, NewSensorReading};
use crate::db::pool::apply_database_migrations;
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use std::sync::Mutex;

static MIGRATED: Mutex<bool> = Mutex::new(false);

/// Fresh connection to the test database, or `None` when not configured.
pub fn connection() -> Option<PgConnection> {
    let url = std::env::var("TEST_DATABASE_URL").ok().filter(|s| !s.trim().is_empty())?;
    let mut conn = PgConnection::establish(&url).expect("connect to TEST_DATABASE_URL");
    let mut migrated = MIGRATED.lock().unwrap_or_else(|e| e.into_inner());
    if !*migrated {
        apply_database_migrations(&mut conn).expect("migrate test database");
        *migrated = true;
    }
    Some(conn)
}

/// Connection already inside a test transaction that is never committed.
pub fn transaction() -> Option<PgConnection> {
    let mut conn = connection()?;
    conn.begin_test_transaction().expect("begin test transaction");
    Some(conn)
}

pub fn unique_suffix() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn insert_device(conn: &mut PgConnection, name: &str) -> i64 {
    use schema::devices::dsl as D;

    diesel::insert_into(D::devices)
        .values(&NewDevice {
            device_type: "humid_temp_sensor".into(),
            display_name: format!("Test {name}"),
            name: name.to_string(),
        })
        .returning(D::id)
        .get_result(conn)
        .expect("insert test device")
}

pub fn insert_reading(conn: &mut PgConnection, device_id: i64, humidity: f64, at: DateTime<Utc>) {
    use schema::humid_temp_readings::dsl as R;

    let mut row = NewSensorReading::new(device_id, at, unique_suffix());
    row.humidity = Some(humidity);
    diesel::insert_into(R::humid_temp_readings)
        .values(&row)
        .execute(conn)
        .expect("insert test reading");
}
