use crate::config::DeviceConfig;
use crate::db::models::{self as dbm, identifier_types};
use crate::schema;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{debug, info};

/// Ensure the configured device and its identifiers exist; returns `devices.id`.
///
/// Runs on every broker CONNACK. Devices are looked up by `name` and never
/// updated; identifiers are insert-or-ignore on `(id_type, id_value)`.
pub fn provision_device(conn: &mut PgConnection, device: &DeviceConfig) -> Result<i64, String> {
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        let device_id = ensure_device(conn, device)?;
        let mut identifiers = vec![(identifier_types::TOPIC_NAME, device.name.as_str())];
        if let Some(ieee) = device.ieee_address.as_deref() {
            identifiers.push((identifier_types::IEEE_ADDRESS, ieee));
        }
        for (id_type, id_value) in identifiers {
            if insert_device_identifier(conn, device_id, id_type, id_value)? {
                info!("Provision: mapped {}={} to device {}", id_type, id_value, device_id);
            } else {
                debug!("Provision: identifier {}={} already present", id_type, id_value);
            }
        }
        Ok(device_id)
    })
    .map_err(|e| format!("provision device {} failed: {}", device.name, e))
}

fn ensure_device(conn: &mut PgConnection, device: &DeviceConfig) -> QueryResult<i64> {
    use schema::devices::dsl as D;

    let new_row = dbm::NewDevice {
        device_type: device.device_type.clone(),
        display_name: device.display_name.clone(),
        name: device.name.clone(),
    };
    diesel::insert_into(D::devices)
        .values(&new_row)
        .on_conflict(D::name)
        .do_nothing()
        .execute(conn)?;

    D::devices.filter(D::name.eq(&device.name)).select(D::id).first(conn)
}

/// Insert-or-ignore; `true` when a new mapping was written.
pub fn insert_device_identifier(
    conn: &mut PgConnection,
    device_id: i64,
    id_type: &str,
    id_value: &str,
) -> QueryResult<bool> {
    use schema::device_identifiers::dsl as DI;

    let new_row = dbm::NewDeviceIdentifier {
        device_id,
        id_type: id_type.to_string(),
        id_value: id_value.to_string(),
    };
    diesel::insert_into(DI::device_identifiers)
        .values(&new_row)
        .on_conflict((DI::id_type, DI::id_value))
        .do_nothing()
        .execute(conn)
        .map(|count| count == 1)
}

pub fn resolve_device(conn: &mut PgConnection, id_type: &str, id_value: &str) -> QueryResult<Option<i64>> {
    use schema::device_identifiers::dsl as DI;

    DI::device_identifiers
        .filter(DI::id_type.eq(id_type).and(DI::id_value.eq(id_value)))
        .select(DI::device_id)
        .first(conn)
        .optional()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    fn device_config(name: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            display_name: "Bathroom".to_string(),
            device_type: "humid_temp_sensor".to_string(),
            ieee_address: Some(format!("0x{name}")),
        }
    }

    #[test]
    fn provisioning_is_idempotent() {
        let Some(mut conn) = testing::transaction() else { return };
        let cfg = device_config(&format!("sensor_{}", testing::unique_suffix()));

        let first = provision_device(&mut conn, &cfg).expect("first provision");
        let second = provision_device(&mut conn, &cfg).expect("second provision");
        assert_eq!(first, second);

        let by_topic = resolve_device(&mut conn, identifier_types::TOPIC_NAME, &cfg.name).expect("resolve");
        assert_eq!(by_topic, Some(first));
        let ieee = cfg.ieee_address.clone().expect("ieee configured");
        let by_ieee = resolve_device(&mut conn, identifier_types::IEEE_ADDRESS, &ieee).expect("resolve");
        assert_eq!(by_ieee, Some(first));
    }

    #[test]
    fn identifier_insert_reports_duplicates() {
        let Some(mut conn) = testing::transaction() else { return };
        let name = format!("sensor_{}", testing::unique_suffix());
        let device_id = testing::insert_device(&mut conn, &name);

        assert!(insert_device_identifier(&mut conn, device_id, identifier_types::TOPIC_NAME, &name).expect("insert"));
        assert!(!insert_device_identifier(&mut conn, device_id, identifier_types::TOPIC_NAME, &name).expect("insert"));
    }

    #[test]
    fn unknown_address_resolves_to_none() {
        let Some(mut conn) = testing::transaction() else { return };
        let missing = format!("nobody_{}", testing::unique_suffix());
        assert_eq!(
            resolve_device(&mut conn, identifier_types::TOPIC_NAME, &missing).expect("resolve"),
            None
        );
    }
}
