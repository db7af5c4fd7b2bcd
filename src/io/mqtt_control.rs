//! MQTT control channel for runtime commands and device configuration
//!
//! Topics (prefix and room from config):
//! - `<prefix>/rooms/<room>/<command>/set`  -> `FingerprintCollection::command`
//! - `<prefix>/rooms/<room>/enabled/set`    -> `set_disable` (`ON` / `OFF`)
//! - `<prefix>/settings/<id>/config`        -> `FingerprintCollection::config`

use crate::infra::config::Config;
use crate::services::collection::FingerprintCollection;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a control topic addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlTopic {
    Command(String),
    DeviceConfig(String),
    Enabled,
}

#[derive(Debug, Clone)]
pub struct ControlTopics {
    rooms: String,
    settings: String,
}

impl ControlTopics {
    pub fn new(prefix: &str, room: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self { rooms: format!("{prefix}/rooms/{room}/"), settings: format!("{prefix}/settings/") }
    }

    /// Filters to subscribe to
    pub fn subscriptions(&self) -> [String; 2] {
        [format!("{}+/set", self.rooms), format!("{}+/config", self.settings)]
    }

    pub fn parse(&self, topic: &str) -> Option<ControlTopic> {
        if let Some(rest) = topic.strip_prefix(&self.rooms) {
            let name = rest.strip_suffix("/set")?;
            if name.is_empty() || name.contains('/') {
                return None;
            }
            return Some(if name == "enabled" {
                ControlTopic::Enabled
            } else {
                ControlTopic::Command(name.to_string())
            });
        }
        let id = topic.strip_prefix(&self.settings)?.strip_suffix("/config")?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(ControlTopic::DeviceConfig(id.to_string()))
    }
}

/// Route one control message into the collection
pub fn apply_control(collection: &FingerprintCollection, control: &ControlTopic, payload: &str) -> bool {
    match control {
        ControlTopic::Command(name) => collection.command(name, payload),
        ControlTopic::DeviceConfig(id) => collection.config(id, payload),
        ControlTopic::Enabled => match payload.trim().to_ascii_uppercase().as_str() {
            "ON" | "TRUE" | "1" => {
                collection.set_disable(false);
                true
            }
            "OFF" | "FALSE" | "0" => {
                collection.set_disable(true);
                true
            }
            _ => {
                warn!(payload = %payload, "enabled_payload_invalid");
                false
            }
        },
    }
}

/// Connect, subscribe and apply control messages until shutdown
pub async fn start_mqtt_control(
    config: &Config,
    collection: Arc<FingerprintCollection>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut mqttoptions = MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let topics = ControlTopics::new(config.mqtt_prefix(), config.room());
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    for filter in topics.subscriptions() {
        client.subscribe(filter.as_str(), QoS::AtLeastOnce).await?;
        info!(topic = %filter, host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_control_subscribed");
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_control_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(control) = topics.parse(&publish.topic) else {
                            debug!(topic = %publish.topic, "mqtt_control_topic_ignored");
                            continue;
                        };
                        match std::str::from_utf8(&publish.payload) {
                            Ok(payload) => {
                                let ok = apply_control(&collection, &control, payload);
                                debug!(topic = %publish.topic, ok, "mqtt_control_applied");
                            }
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "Invalid UTF-8 in MQTT payload");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
