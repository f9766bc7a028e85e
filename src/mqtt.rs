//! MQTT side of the bridge.
//!
//! Topic convention:
//!   {prefix}/{device_id}/erd/0xNNNN/value        -> retained hex value
//!   {prefix}/{device_id}/erd/0xNNNN/write        <- hex value to write
//!   {prefix}/{device_id}/erd/0xNNNN/write_result -> "success" / "failure (reason N)"

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;

use crate::erd::Erd;

/// Something the MQTT side asks of the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    WriteRequest { erd: Erd, value: Vec<u8> },
    /// The broker session was lost; registrations must be replayed.
    Disconnected,
}

/// Calls the bridge makes into the MQTT side.
pub trait MqttGateway {
    fn register_erd(&mut self, erd: Erd);
    fn update_erd(&mut self, erd: Erd, data: &[u8]);
    fn update_erd_write_result(&mut self, erd: Erd, success: bool, reason: u8);
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client id; generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Requests buffered while the broker is unreachable
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "geappliances".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_request_capacity() -> usize {
    512
}

fn default_reconnect_delay() -> u64 {
    5000
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
            keep_alive_secs: default_keep_alive(),
            request_capacity: default_request_capacity(),
            reconnect_delay_ms: default_reconnect_delay(),
        }
    }
}

/// Builds and parses the per-ERD topics for one device.
#[derive(Debug, Clone)]
pub struct TopicLayout {
    base: String,
}

impl TopicLayout {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        Self {
            base: format!("{}/{}/erd", prefix, device_id),
        }
    }

    pub fn value_topic(&self, erd: Erd) -> String {
        format!("{}/{}/value", self.base, erd)
    }

    pub fn write_topic(&self, erd: Erd) -> String {
        format!("{}/{}/write", self.base, erd)
    }

    pub fn write_result_topic(&self, erd: Erd) -> String {
        format!("{}/{}/write_result", self.base, erd)
    }

    /// `{base}/0x1234/write` -> `0x1234`
    pub fn erd_from_write_topic(&self, topic: &str) -> Option<Erd> {
        let rest = topic.strip_prefix(&self.base)?.strip_prefix('/')?;
        let erd = rest.strip_suffix("/write")?;
        if erd.contains('/') {
            return None;
        }
        Erd::parse_hex(erd)
    }
}

/// Uppercase hex, no prefix: `[0x01, 0xAB]` -> `01AB`
pub fn encode_value(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Accepts an optional `0x` prefix and either case.
pub fn decode_value(payload: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    hex::decode(digits).ok()
}

pub fn write_result_payload(success: bool, reason: u8) -> String {
    if success {
        "success".to_string()
    } else {
        format!("failure (reason {})", reason)
    }
}

/// Room for queued requests beyond a full round of subscribes and publishes.
const REQUEST_HEADROOM: usize = 64;

/// Size the request channel so a full replay of registrations after a
/// reconnect, plus one publish per ERD, fits without dropping anything.
pub fn request_capacity(configured: usize, polling_list_capacity: usize) -> usize {
    configured.max(polling_list_capacity * 2 + REQUEST_HEADROOM)
}

/// [`MqttGateway`] backed by a rumqttc client.
///
/// The matching [`EventLoop`] is driven by the run loop, which feeds every
/// event back through [`MqttClientAdapter::handle_event`].
pub struct MqttClientAdapter {
    client: AsyncClient,
    topics: TopicLayout,
}

impl MqttClientAdapter {
    pub fn connect(
        config: &MqttConfig,
        device_id: &str,
        polling_list_capacity: usize,
    ) -> (Self, EventLoop) {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("erd-bridge-{}", uuid::Uuid::new_v4()));

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let capacity = request_capacity(config.request_capacity, polling_list_capacity);
        if capacity > config.request_capacity {
            tracing::debug!("MQTT request capacity raised to {}", capacity);
        }
        let (client, eventloop) = AsyncClient::new(options, capacity);
        let adapter = Self {
            client,
            topics: TopicLayout::new(&config.topic_prefix, device_id),
        };
        (adapter, eventloop)
    }

    /// Translate a rumqttc event into something the bridge cares about.
    pub fn handle_event(&self, event: &Event) -> Option<GatewayEvent> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                tracing::info!("MQTT connected (session_present={})", ack.session_present);
                Some(GatewayEvent::Disconnected)
            }
            Event::Incoming(Packet::Publish(publish)) => {
                parse_write_request(&self.topics, &publish.topic, &publish.payload)
            }
            _ => None,
        }
    }
}

fn parse_write_request(topics: &TopicLayout, topic: &str, payload: &[u8]) -> Option<GatewayEvent> {
    let erd = topics.erd_from_write_topic(topic)?;
    match decode_value(payload) {
        Some(value) => {
            tracing::debug!("MQTT write request {} = {}", erd, encode_value(&value));
            Some(GatewayEvent::WriteRequest { erd, value })
        }
        None => {
            tracing::warn!(
                "MQTT write request for {} has invalid payload {:?}",
                erd,
                String::from_utf8_lossy(payload)
            );
            None
        }
    }
}

impl MqttGateway for MqttClientAdapter {
    fn register_erd(&mut self, erd: Erd) {
        let topic = self.topics.write_topic(erd);
        if let Err(e) = self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
            tracing::warn!("MQTT subscribe {} failed: {}", topic, e);
        }
    }

    fn update_erd(&mut self, erd: Erd, data: &[u8]) {
        let topic = self.topics.value_topic(erd);
        if let Err(e) = self
            .client
            .try_publish(&topic, QoS::AtMostOnce, true, encode_value(data))
        {
            tracing::warn!("MQTT publish {} failed: {}", topic, e);
        }
    }

    fn update_erd_write_result(&mut self, erd: Erd, success: bool, reason: u8) {
        let topic = self.topics.write_result_topic(erd);
        if let Err(e) = self.client.try_publish(
            &topic,
            QoS::AtLeastOnce,
            false,
            write_result_payload(success, reason),
        ) {
            tracing::warn!("MQTT publish {} failed: {}", topic, e);
        }
    }
}
