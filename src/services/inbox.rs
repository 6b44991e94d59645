use crate::db::models::NewInboxMessage;
use crate::schema;
use chrono::Utc;
use diesel::PgConnection;
use diesel::prelude::*;
use log::{info, warn};

/// Dead-letter a raw message that could not be processed.
///
/// Insert-or-ignore on `message_key`; returns `true` when a new row was
/// written and `false` when the same message had been captured before.
pub fn capture(
    conn: &mut PgConnection,
    topic: &str,
    raw: &[u8],
    message_key: &str,
    error: Option<&str>,
) -> QueryResult<bool> {
    use schema::inbox_messages::dsl as I;

    let row = NewInboxMessage {
        message_key: message_key.to_string(),
        topic: topic.to_string(),
        payload: raw.to_vec(),
        error: error.map(str::to_string),
        received_at: Utc::now(),
    };
    let inserted = diesel::insert_into(I::inbox_messages)
        .values(&row)
        .on_conflict(I::message_key)
        .do_nothing()
        .execute(conn)?
        == 1;

    if inserted {
        info!("Inbox: captured message {} from {}", message_key, topic);
    } else {
        warn!("Inbox: message {} from {} was already captured", message_key, topic);
    }
    Ok(inserted)
}
