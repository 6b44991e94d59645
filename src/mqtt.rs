//! Broker subscriber loop.
//!
//! Runs on the calling thread using the blocking `rumqttc` client. The session
//! is persistent (`clean_session = false`, stable client id) and acks are
//! manual, so a message is only acknowledged once its reading is committed or
//! it has been dead-lettered. Anything left unacked is redelivered after a
//! reconnect.

use crate::config::{DeviceConfig, MqttConfig};
use crate::db::pool::PgPool;
use crate::services::ingest::Ingestor;
use crate::services::provision::provision_device;
use log::{debug, error, info, warn};
use rumqttc::{Client, ConnAck, Connection, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeReasonCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_keep_alive(KEEP_ALIVE);
    opts.set_clean_session(false);
    opts.set_manual_acks(true);
    if let Some(username) = cfg.username.as_deref() {
        opts.set_credentials(username, cfg.password.as_deref().unwrap_or_default());
    }
    opts
}

/// Topic filters the broker refused, paired positionally with the SUBACK codes.
pub fn rejected_filters<'a>(topics: &'a [String], codes: &[SubscribeReasonCode]) -> Vec<&'a str> {
    topics
        .iter()
        .zip(codes)
        .filter(|(_, code)| matches!(code, SubscribeReasonCode::Failure))
        .map(|(topic, _)| topic.as_str())
        .collect()
}

/// Clears the subscriber's running flag and asks the event loop to disconnect.
#[derive(Clone)]
pub struct ShutdownHandle {
    client: Client,
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // wakes `connection.iter()` when it is idle on a live session
        if let Err(e) = self.client.try_disconnect() {
            debug!("MQTT: disconnect request not queued: {}", e);
        }
    }
}

pub struct Subscriber {
    client: Client,
    connection: Connection,
    running: Arc<AtomicBool>,
}

impl Subscriber {
    /// Set up the client; nothing is sent until [`Subscriber::run`] drives the event loop.
    pub fn new(cfg: &MqttConfig) -> Self {
        let (client, connection) = Client::new(mqtt_options(cfg), REQUEST_CAPACITY);
        Subscriber {
            client,
            connection,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            client: self.client.clone(),
            running: Arc::clone(&self.running),
        }
    }

    /// Consume until shut down.
    ///
    /// Connection errors never end the loop: it waits and lets the event loop
    /// reconnect. On every successful CONNACK the topics are re-subscribed and
    /// the configured device is provisioned. The flag is checked after every
    /// event, so an in-flight message is settled before the loop exits.
    pub fn run(mut self, cfg: &MqttConfig, device: &DeviceConfig, pool: &PgPool) -> Result<(), String> {
        let ingestor = Ingestor::new(pool, cfg.topic_prefix.clone());
        info!(
            "MQTT: connecting to {}:{} as {} (topics: {})",
            cfg.host,
            cfg.port,
            cfg.client_id,
            cfg.topics.join(", ")
        );

        for notification in self.connection.iter() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => on_connected(&self.client, &ack, cfg, device, pool),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let outcome = ingestor.handle(&publish.topic, &publish.payload);
                    if outcome.should_ack() {
                        if let Err(e) = self.client.try_ack(&publish) {
                            warn!("MQTT: ack for {} failed: {}", publish.topic, e);
                        }
                    } else {
                        warn!("MQTT: leaving message on {} unacked for redelivery", publish.topic);
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    let rejected = rejected_filters(&cfg.topics, &suback.return_codes);
                    if rejected.is_empty() {
                        debug!("MQTT: subscription {} acknowledged", suback.pkid);
                    } else {
                        error!("MQTT: broker rejected subscription to {}", rejected.join(", "));
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => warn!("MQTT: broker sent disconnect"),
                Ok(_) => {}
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("MQTT: connection error: {}; retrying in {}s", e, RECONNECT_DELAY.as_secs());
                    thread::sleep(RECONNECT_DELAY);
                }
            }
        }

        info!("MQTT: subscriber stopped");
        Ok(())
    }
}

fn on_connected(client: &Client, ack: &ConnAck, cfg: &MqttConfig, device: &DeviceConfig, pool: &PgPool) {
    if ack.code != ConnectReturnCode::Success {
        error!("MQTT: connection refused: {:?}", ack.code);
        return;
    }
    info!("MQTT: connected (session_present={})", ack.session_present);

    for topic in &cfg.topics {
        match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
            Ok(()) => info!("MQTT: subscribing to {}", topic),
            Err(e) => error!("MQTT: subscribe to {} failed: {}", topic, e),
        }
    }

    let provisioned = pool
        .get()
        .map_err(|e| format!("store connection unavailable: {}", e))
        .and_then(|mut conn| provision_device(&mut conn, device));
    match provisioned {
        Ok(device_id) => info!("Provision: device {} ready as id {}", device.name, device_id),
        Err(e) => error!("Provision: {}", e),
    }
}
