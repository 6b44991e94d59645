//! Transactional-outbox dispatcher.
//!
//! A polling loop that claims pending rows with `FOR UPDATE SKIP LOCKED`,
//! publishes them one by one, then deletes (or marks `done`) each delivered
//! row and reschedules each failed one with capped exponential backoff.
//! Several dispatchers may run against the same store; the row lock keeps
//! their claims disjoint.

use crate::config::OutboxConfig;
use crate::db::models::{OutboxEvent, outbox_status};
use crate::db::pool::PgPool;
use crate::notifier::{Notification, Notifier};
use crate::schema;
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::dsl::{now, sql};
use diesel::prelude::*;
use diesel::sql_types::{Double, Timestamptz};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

pub const MAX_BACKOFF_SECS: i64 = 60;
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Seconds until the next attempt: `min(60, 2^min(attempts, 6))`.
pub fn backoff_delay_secs(attempts: i32) -> i64 {
    let exponent = attempts.clamp(0, MAX_BACKOFF_EXPONENT as i32) as u32;
    MAX_BACKOFF_SECS.min(2_i64.pow(exponent))
}

/// Claim up to `limit` due rows, oldest first, marking them `processing`.
///
/// Due-ness and every timestamp the dispatcher writes use the store clock, so
/// instances on hosts with skewed clocks agree on when a row is due.
pub fn claim_batch(conn: &mut PgConnection, limit: i64) -> QueryResult<Vec<OutboxEvent>> {
    use schema::outbox_events::dsl as O;

    conn.transaction(|conn| {
        let ids: Vec<i64> = O::outbox_events
            .filter(O::status.eq(outbox_status::PENDING))
            .filter(O::available_at.le(now))
            .order(O::created_at.asc())
            .limit(limit)
            .select(O::id)
            .for_update()
            .skip_locked()
            .load(conn)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed: Vec<OutboxEvent> = diesel::update(O::outbox_events.filter(O::id.eq_any(ids)))
            .set((O::status.eq(outbox_status::PROCESSING), O::locked_at.eq(now)))
            .returning(OutboxEvent::as_returning())
            .get_results(conn)?;
        claimed.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimed)
    })
}

pub fn mark_done(conn: &mut PgConnection, id: i64, retain: bool) -> QueryResult<()> {
    use schema::outbox_events::dsl as O;

    if retain {
        diesel::update(O::outbox_events.find(id))
            .set((
                O::status.eq(outbox_status::DONE),
                O::processed_at.eq(now),
                O::locked_at.eq(None::<DateTime<Utc>>),
            ))
            .execute(conn)?;
    } else {
        diesel::delete(O::outbox_events.find(id)).execute(conn)?;
    }
    Ok(())
}

/// Put a failed row back to `pending` after its backoff; returns the new attempt count.
pub fn mark_retry(conn: &mut PgConnection, id: i64, attempts: i32, last_error: &str) -> QueryResult<i32> {
    use schema::outbox_events::dsl as O;

    let next_attempts = attempts.saturating_add(1);
    let delay = backoff_delay_secs(next_attempts);
    // store clock, like the claim filter
    let retry_at = sql::<Timestamptz>("now() + make_interval(secs => ")
        .bind::<Double, _>(delay as f64)
        .sql(")");
    diesel::update(O::outbox_events.find(id))
        .set((
            O::status.eq(outbox_status::PENDING),
            O::attempts.eq(next_attempts),
            O::available_at.eq(retry_at),
            O::last_error.eq(Some(last_error)),
            O::locked_at.eq(None::<DateTime<Utc>>),
        ))
        .execute(conn)?;
    Ok(next_attempts)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub rescheduled: usize,
}

/// Publish claimed rows sequentially, settling each one before the next.
///
/// A failure to publish or to record delivery reschedules the row. Only a
/// failure to reschedule aborts the batch.
pub fn dispatch_batch<N: Notifier + ?Sized>(
    conn: &mut PgConnection,
    notifier: &N,
    events: &[OutboxEvent],
    retain_done: bool,
) -> QueryResult<BatchReport> {
    let mut report = BatchReport::default();
    for event in events {
        let notification = Notification {
            event_type: &event.event_type,
            payload: &event.payload,
            idempotency_key: &event.idempotency_key,
        };
        let delivered = notifier
            .publish(&notification)
            .map_err(|e| e.to_string())
            .and_then(|()| mark_done(conn, event.id, retain_done).map_err(|e| format!("mark done failed: {}", e)));

        match delivered {
            Ok(()) => {
                debug!("Outbox: delivered event {} ({})", event.id, event.event_type);
                report.delivered += 1;
            }
            Err(msg) => {
                let attempts = mark_retry(conn, event.id, event.attempts, &msg)?;
                warn!(
                    "Outbox: event {} attempt {} failed: {}; retrying in {}s",
                    event.id,
                    attempts,
                    msg,
                    backoff_delay_secs(attempts)
                );
                report.rescheduled += 1;
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Idle,
    Dispatched(BatchReport),
}

/// Cooperative stop flag shared with a running dispatcher.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct OutboxDispatcher<N> {
    pool: PgPool,
    notifier: N,
    cfg: OutboxConfig,
    running: Arc<AtomicBool>,
}

impl<N: Notifier> OutboxDispatcher<N> {
    pub fn new(pool: PgPool, notifier: N, cfg: OutboxConfig) -> Self {
        OutboxDispatcher {
            pool,
            notifier,
            cfg,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// One claim-and-publish pass on a freshly checked-out connection.
    pub fn run_once(&self) -> Result<Cycle, String> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| format!("store connection unavailable: {}", e))?;
        let events = claim_batch(&mut conn, i64::from(self.cfg.batch_size.get()))
            .map_err(|e| format!("claim batch failed: {}", e))?;
        if events.is_empty() {
            return Ok(Cycle::Idle);
        }
        debug!("Outbox: claimed {} event(s)", events.len());
        dispatch_batch(&mut conn, &self.notifier, &events, self.cfg.retain_done)
            .map(Cycle::Dispatched)
            .map_err(|e| format!("reschedule failed: {}", e))
    }

    /// Loop until stopped. Errors are logged and the next pass starts on a new connection.
    pub fn run(&self) {
        info!(
            "Outbox: dispatcher started (batch={}, idle={}ms, retain_done={})",
            self.cfg.batch_size,
            self.cfg.idle_interval.as_millis(),
            self.cfg.retain_done
        );
        while self.running.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(Cycle::Idle) => thread::sleep(self.cfg.idle_interval),
                Ok(Cycle::Dispatched(report)) => {
                    if report.rescheduled > 0 {
                        info!(
                            "Outbox: batch delivered={} rescheduled={}",
                            report.delivered, report.rescheduled
                        );
                    }
                }
                Err(e) => {
                    error!("Outbox: {}", e);
                    thread::sleep(self.cfg.idle_interval);
                }
            }
        }
        info!("Outbox: dispatcher stopped");
    }
}

pub struct DispatcherHandle {
    stop: StopHandle,
    thread: thread::JoinHandle<()>,
}

impl DispatcherHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for the loop to exit; an in-flight publish finishes first.
    pub fn join(self) -> Result<(), String> {
        self.thread
            .join()
            .map_err(|_| "outbox dispatcher thread panicked".to_string())
    }
}

impl<N: Notifier + Send + 'static> OutboxDispatcher<N> {
    pub fn spawn(self) -> Result<DispatcherHandle, String> {
        let stop = self.stop_handle();
        let thread = thread::Builder::new()
            .name("outbox-dispatcher".into())
            .spawn(move || self.run())
            .map_err(|e| format!("failed to spawn outbox dispatcher: {}", e))?;
        Ok(DispatcherHandle { stop, thread })
    }
}
