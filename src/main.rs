pub mod models {
    pub mod z2m;
}

pub mod config;
pub mod db {
    pub mod models;
    pub mod pool;
    #[cfg(test)]
    pub mod testing;
}
pub mod env_file;
pub mod mqtt;
pub mod notifier;
pub mod schema;
pub mod utils;
pub mod services {
    pub mod alerts;
    pub mod inbox;
    pub mod ingest;
    pub mod outbox;
    pub mod provision;
}

use crate::config::Config;
use crate::db::pool::{apply_database_migrations, build_pool};
use crate::mqtt::{ShutdownHandle, Subscriber};
use crate::notifier::HttpNotifier;
use crate::services::outbox::{OutboxDispatcher, StopHandle};
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::thread;

/// First SIGINT/SIGTERM stops both loops cooperatively; a second one exits at once.
fn stop_on_signal(subscriber: Option<ShutdownHandle>, dispatcher: Option<StopHandle>) -> Result<(), String> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(|e| format!("failed to register signal handlers: {}", e))?;
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let mut received = signals.forever();
            if let Some(sig) = received.next() {
                info!("Received signal {}; finishing in-flight work", sig);
                if let Some(h) = subscriber.as_ref() {
                    h.shutdown();
                }
                if let Some(h) = dispatcher.as_ref() {
                    h.stop();
                }
            }
            if let Some(sig) = received.next() {
                warn!("Received signal {} again; exiting immediately", sig);
                std::process::exit(1);
            }
        })
        .map_err(|e| format!("failed to spawn signal thread: {}", e))?;
    Ok(())
}

pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (mqtt={}:{}, topics=[{}], device={}, ingest_enabled={}, dispatcher_enabled={}, outbox_batch={}, outbox_idle={}ms, retain_done={}, pool_size={})",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.mqtt.topics.join(", "),
        cfg.device.name,
        cfg.ingest_enabled,
        cfg.dispatcher_enabled,
        cfg.outbox.batch_size,
        cfg.outbox.idle_interval.as_millis(),
        cfg.outbox.retain_done,
        cfg.database_pool_size
    );
    if cfg.mqtt.client_id_generated {
        warn!(
            "MQTT_CLIENT_ID not set; using generated id {}. Unacked messages will not survive a restart",
            cfg.mqtt.client_id
        );
    }

    // 2) Connect DB
    let pool = build_pool(&cfg.database_url, cfg.database_pool_size)?;
    let mut conn = pool.get().map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;
    drop(conn);

    // 4) Outbox dispatcher on its own thread
    let dispatcher = match cfg.notify_url.as_deref() {
        Some(url) if cfg.dispatcher_enabled => {
            let notifier = HttpNotifier::new(url, cfg.notify_timeout);
            Some(OutboxDispatcher::new(pool.clone(), notifier, cfg.outbox.clone()).spawn()?)
        }
        _ => {
            info!("Outbox dispatcher disabled via DISPATCHER_ENABLED={}", cfg.dispatcher_enabled);
            None
        }
    };

    // 5) Ingest loop on this thread, both loops stoppable by signal
    let subscriber = cfg.ingest_enabled.then(|| Subscriber::new(&cfg.mqtt));
    stop_on_signal(
        subscriber.as_ref().map(Subscriber::shutdown_handle),
        dispatcher.as_ref().map(|d| d.stop_handle()),
    )?;

    if let Some(subscriber) = subscriber {
        let result = subscriber.run(&cfg.mqtt, &cfg.device, &pool);
        if let Some(handle) = dispatcher {
            handle.stop();
            handle.join()?;
        }
        result
    } else {
        info!("MQTT ingest disabled via INGEST_ENABLED={}", cfg.ingest_enabled);
        match dispatcher {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn main() {
    let loaded_env = match env_file::load_from_args(std::env::args_os().skip(1)) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "humidity-outbox {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run() {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
