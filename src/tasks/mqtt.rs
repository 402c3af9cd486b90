//! MQTT transport with Home-Assistant discovery.
//!
//! Inbound commands arrive on `<device_id>/<name>` or on the discovery
//! `homeassistant/{switch|button}/<device_id>_<name>/set` topics. Every
//! state change observed on the slideshow's watch channel is republished,
//! retained, together with the directory options whenever they changed.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use serde_json::{Map, Value, json};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MqttConfig;
use crate::gateway::{COMMANDS, CommandError, CommandGateway, CommandSpec, Entity, lookup};

const DISCOVERY_PREFIX: &str = "homeassistant";
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// One message ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Outgoing {
    fn retained(topic: String, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: true,
        }
    }
}

pub fn availability_topic(device_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/switch/{device_id}/available")
}

fn sensor_state_topic(device_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/sensor/{device_id}/state")
}

fn image_topic(device_id: &str, leaf: &str) -> String {
    format!("{DISCOVERY_PREFIX}/sensor/{device_id}_image/{leaf}")
}

fn entity_topic(component: &str, device_id: &str, name: &str, leaf: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{component}/{device_id}_{name}/{leaf}")
}

/// Name under which a command is advertised and addressed.
fn entity_name(command: &str) -> &str {
    match command {
        "subdirectory" => "directory",
        other => other,
    }
}

fn component(entity: Entity) -> Option<&'static str> {
    match entity {
        Entity::Switch => Some("switch"),
        Entity::Button => Some("button"),
        Entity::Number { .. } => Some("number"),
        Entity::Text => Some("text"),
        Entity::Select => Some("select"),
        Entity::Topic => None,
    }
}

/// Map an inbound topic to a command name, if it addresses this device.
pub fn route<'a>(device_id: &str, topic: &'a str) -> Option<&'a str> {
    if let Some(name) = topic
        .strip_prefix(device_id)
        .and_then(|rest| rest.strip_prefix('/'))
    {
        return (!name.is_empty() && !name.contains('/')).then_some(name);
    }
    let rest = topic.strip_prefix(DISCOVERY_PREFIX)?.strip_prefix('/')?;
    let (component, rest) = rest.split_once('/')?;
    if component != "switch" && component != "button" {
        return None;
    }
    let name = rest
        .strip_suffix("/set")?
        .strip_prefix(device_id)?
        .strip_prefix('_')?;
    (!name.is_empty()).then_some(name)
}

/// Topics the device listens on.
pub fn subscriptions(device_id: &str) -> Vec<String> {
    let mut topics = Vec::new();
    for spec in COMMANDS {
        let name = entity_name(spec.name);
        match spec.entity {
            Entity::Switch => topics.push(entity_topic("switch", device_id, name, "set")),
            Entity::Button => topics.push(entity_topic("button", device_id, name, "set")),
            _ => topics.push(format!("{device_id}/{name}")),
        }
    }
    topics
}

fn device_element(cfg: &MqttConfig) -> Value {
    let mut dev = json!({
        "ids": [cfg.device_id],
        "name": cfg.device_id,
        "mdl": "PictureFrame",
        "sw": env!("CARGO_PKG_VERSION"),
        "mf": "picture-frame",
    });
    if !cfg.device_url.is_empty() {
        dev["cu"] = json!(cfg.device_url);
    }
    dev
}

/// Retained discovery config for one command, `None` for topic-only commands.
fn entity_config(
    cfg: &MqttConfig,
    dev: &Value,
    spec: &CommandSpec,
    directories: &[String],
) -> Option<Outgoing> {
    let component = component(spec.entity)?;
    let id = cfg.device_id.as_str();
    let avty = availability_topic(id);
    let name = entity_name(spec.name);
    let mut payload = json!({
        "name": name,
        "icon": spec.icon,
        "avty_t": avty,
        "uniq_id": format!("{id}_{name}"),
        "dev": dev,
    });
    match spec.entity {
        Entity::Switch => {
            payload["command_topic"] = json!(entity_topic("switch", id, name, "set"));
            payload["state_topic"] = json!(entity_topic("switch", id, name, "state"));
        }
        Entity::Button => {
            payload["command_topic"] = json!(entity_topic("button", id, name, "set"));
            payload["payload_press"] = json!("ON");
        }
        Entity::Number { min, max, step } => {
            payload["min"] = json!(min);
            payload["max"] = json!(max);
            payload["step"] = json!(step);
            payload["entity_category"] = json!("config");
        }
        Entity::Text => {
            payload["entity_category"] = json!("config");
        }
        Entity::Select => {
            payload["options"] = json!(directories);
            payload["entity_category"] = json!("config");
        }
        Entity::Topic => {}
    }
    if matches!(
        spec.entity,
        Entity::Number { .. } | Entity::Text | Entity::Select
    ) {
        payload["command_topic"] = json!(format!("{id}/{name}"));
        payload["state_topic"] = json!(sensor_state_topic(id));
        payload["value_template"] = json!(format!("{{{{ value_json.{name} }}}}"));
    }
    Some(Outgoing::retained(
        entity_topic(component, id, name, "config"),
        payload.to_string(),
    ))
}

/// Re-advertise the directory `select` when the options differ from what
/// was last advertised.
pub fn directory_update(
    cfg: &MqttConfig,
    advertised: &mut Vec<String>,
    directories: Vec<String>,
) -> Option<Outgoing> {
    if *advertised == directories {
        return None;
    }
    *advertised = directories;
    let spec = lookup("subdirectory")?;
    entity_config(cfg, &device_element(cfg), spec, advertised)
}

/// Retained discovery configs for every advertised entity and sensor.
pub fn discovery_messages(cfg: &MqttConfig, directories: &[String]) -> Vec<Outgoing> {
    let id = cfg.device_id.as_str();
    let avty = availability_topic(id);
    let dev = device_element(cfg);
    let mut out: Vec<Outgoing> = COMMANDS
        .iter()
        .filter_map(|spec| entity_config(cfg, &dev, spec, directories))
        .collect();

    let counter = json!({
        "name": "image_counter",
        "icon": "mdi:camera-burst",
        "value_template": "{{ value_json.image_counter }}",
        "state_topic": sensor_state_topic(id),
        "avty_t": avty,
        "uniq_id": format!("{id}_image_counter"),
        "entity_category": "diagnostic",
        "dev": dev,
    });
    out.push(Outgoing::retained(
        entity_topic("sensor", id, "image_counter", "config"),
        counter.to_string(),
    ));
    let image = json!({
        "name": "image",
        "icon": "mdi:file-image",
        "value_template": "{{ value_json.image }}",
        "state_topic": image_topic(id, "state"),
        "json_attributes_topic": image_topic(id, "attributes"),
        "avty_t": avty,
        "uniq_id": format!("{id}_image"),
        "entity_category": "diagnostic",
        "dev": dev,
    });
    out.push(Outgoing::retained(
        entity_topic("sensor", id, "image", "config"),
        image.to_string(),
    ));
    out
}

/// Sensor state, switch states and the current image for one snapshot of
/// gateway state. All retained so a controller connecting later sees them.
pub fn state_messages(
    device_id: &str,
    state: &BTreeMap<String, Value>,
    attributes: &BTreeMap<String, Value>,
) -> Vec<Outgoing> {
    let mut out = Vec::new();
    let sensor: Map<String, Value> = state.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.push(Outgoing::retained(
        sensor_state_topic(device_id),
        Value::Object(sensor).to_string(),
    ));

    for spec in COMMANDS.iter().filter(|s| s.entity == Entity::Switch) {
        let on = state.get(spec.name).and_then(Value::as_bool).unwrap_or(false);
        out.push(Outgoing::retained(
            entity_topic("switch", device_id, spec.name, "state"),
            if on { "ON" } else { "OFF" },
        ));
    }

    let file_name = state
        .get("image")
        .and_then(Value::as_str)
        .and_then(|p| Path::new(p).file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    out.push(Outgoing::retained(
        image_topic(device_id, "state"),
        json!({ "image": file_name }).to_string(),
    ));
    out.push(Outgoing::retained(
        image_topic(device_id, "attributes"),
        json!(attributes).to_string(),
    ));
    out
}

fn options(cfg: &MqttConfig) -> Result<MqttOptions> {
    let mut opts = MqttOptions::new(cfg.device_id.clone(), cfg.server.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(60));
    opts.set_clean_session(true);
    if !cfg.login.is_empty() {
        opts.set_credentials(cfg.login.clone(), cfg.password.clone());
    }
    opts.set_last_will(LastWill::new(
        availability_topic(&cfg.device_id),
        "offline",
        QoS::AtMostOnce,
        true,
    ));
    if !cfg.tls.as_os_str().is_empty() {
        let ca = std::fs::read(&cfg.tls)
            .with_context(|| format!("failed to read mqtt CA certificate {}", cfg.tls.display()))?;
        opts.set_transport(Transport::tls(ca, None, None));
    }
    Ok(opts)
}

fn send_all(client: &AsyncClient, messages: Vec<Outgoing>) {
    for msg in messages {
        if let Err(err) = client.try_publish(
            msg.topic.as_str(),
            QoS::AtMostOnce,
            msg.retain,
            msg.payload.into_bytes(),
        ) {
            warn!(topic = %msg.topic, error = %err, "mqtt publish dropped");
        }
    }
}

async fn publish_state(
    client: &AsyncClient,
    gateway: &CommandGateway,
    cfg: &MqttConfig,
    advertised: &mut Vec<String>,
) {
    let gw = gateway.clone();
    let snapshot = tokio::task::spawn_blocking(move || {
        (gw.state(), gw.image_attributes(), gw.directory_list())
    })
    .await;
    match snapshot {
        Ok((state, attributes, directories)) => {
            let mut messages = Vec::new();
            if let Some(select) = directory_update(cfg, advertised, directories) {
                debug!(options = advertised.len(), "directory options changed");
                messages.push(select);
            }
            messages.extend(state_messages(&cfg.device_id, &state, &attributes));
            send_all(client, messages);
        }
        Err(err) => warn!(error = %err, "state snapshot task failed"),
    }
}

async fn on_connected(
    client: &AsyncClient,
    gateway: &CommandGateway,
    cfg: &MqttConfig,
    advertised: &mut Vec<String>,
) {
    for topic in subscriptions(&cfg.device_id) {
        if let Err(err) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            warn!(%topic, error = %err, "mqtt subscribe dropped");
        }
    }
    let gw = gateway.clone();
    let directories = tokio::task::spawn_blocking(move || gw.directory_list())
        .await
        .unwrap_or_default();
    send_all(client, discovery_messages(cfg, &directories));
    *advertised = directories;
    send_all(
        client,
        vec![Outgoing::retained(availability_topic(&cfg.device_id), "online")],
    );
    publish_state(client, gateway, cfg, advertised).await;
}

async fn handle_command(gateway: &CommandGateway, name: String, payload: String) {
    let gw = gateway.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let result = gw.execute(&name, &payload);
        (name, result)
    })
    .await;
    match outcome {
        Ok((name, Ok(value))) => debug!(%name, %value, "mqtt command applied"),
        Ok((name, Err(CommandError::Unknown(_)))) => debug!(%name, "ignoring unknown mqtt command"),
        Ok((_, Err(err))) => warn!(error = %err, "rejected mqtt command"),
        Err(err) => warn!(error = %err, "mqtt command task failed"),
    }
}

#[instrument(skip_all, fields(server = %cfg.server, device_id = %cfg.device_id))]
pub async fn run(cfg: MqttConfig, gateway: CommandGateway, cancel: CancellationToken) -> Result<()> {
    let (client, mut eventloop) = AsyncClient::new(options(&cfg)?, 128);
    let mut changes = gateway.slideshow().subscribe();
    let mut connected = false;
    let mut backoff = INITIAL_BACKOFF;
    let mut advertised = Vec::new();

    loop {
        select! {
            _ = cancel.cancelled() => {
                info!("cancel received; leaving mqtt broker");
                if connected {
                    send_all(&client, vec![Outgoing::retained(availability_topic(&cfg.device_id), "offline")]);
                    let _ = client.try_disconnect();
                }
                break;
            }

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to mqtt broker");
                    connected = true;
                    backoff = INITIAL_BACKOFF;
                    on_connected(&client, &gateway, &cfg, &mut advertised).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(name) = route(&cfg.device_id, &publish.topic) else {
                        debug!(topic = %publish.topic, "unrouted mqtt message");
                        continue;
                    };
                    if lookup(name).is_none() {
                        debug!(%name, "ignoring unknown mqtt command");
                        continue;
                    }
                    let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                    info!(%name, %payload, "mqtt command received");
                    handle_command(&gateway, name.to_string(), payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    if connected {
                        warn!(error = %err, "mqtt connection lost");
                    } else {
                        warn!(error = %err, retry_in = ?backoff, "mqtt connection failed");
                    }
                    connected = false;
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            },

            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                if connected {
                    publish_state(&client, &gateway, &cfg, &mut advertised).await;
                }
            }
        }
    }
    Ok(())
}
