//! Home Assistant MQTT discovery: topic layout, entity table and payloads.
//!
//! Topics follow `homeassistant/<component>/<device><entity>/<config|state|set>`.
//! The registry is built once at startup and never mutated; the same device
//! id always yields byte-identical config payloads, so retained configs stay
//! stable across restarts.

use serde::{Deserialize, Serialize};

/// Root of every discovery topic.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

// ---------------------------------------------------------------------------
// Device + topics
// ---------------------------------------------------------------------------

/// The single logical device every entity belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Temperature,
    Ip,
    Switch,
    Power,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [Self::Temperature, Self::Ip, Self::Switch, Self::Power];

    fn component(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            _ => "sensor",
        }
    }

    /// Suffix appended to the device id in the topic path.
    fn topic_suffix(self) -> &'static str {
        match self {
            Self::Temperature => "t",
            Self::Ip => "ip",
            Self::Switch => "sw",
            Self::Power => "p",
        }
    }

    fn unique_suffix(self) -> &'static str {
        match self {
            Self::Power => "pow",
            other => other.topic_suffix(),
        }
    }

    fn has_command(self) -> bool {
        self == Self::Switch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTopics {
    pub config: String,
    pub state: String,
    pub command: Option<String>,
}

impl EntityTopics {
    fn new(device_id: &str, kind: EntityKind) -> Self {
        let base = format!(
            "{DISCOVERY_PREFIX}/{}/{device_id}{}",
            kind.component(),
            kind.topic_suffix()
        );
        Self {
            config: format!("{base}/config"),
            state: format!("{base}/state"),
            command: kind.has_command().then(|| format!("{base}/set")),
        }
    }
}

/// Every topic the node uses, derived once from the device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub temperature: EntityTopics,
    pub ip: EntityTopics,
    pub switch: EntityTopics,
    pub power: EntityTopics,
    command: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        let switch = EntityTopics::new(device_id, EntityKind::Switch);
        let command = switch.command.clone().unwrap_or_default();
        Self {
            temperature: EntityTopics::new(device_id, EntityKind::Temperature),
            ip: EntityTopics::new(device_id, EntityKind::Ip),
            switch,
            power: EntityTopics::new(device_id, EntityKind::Power),
            command,
        }
    }

    pub fn get(&self, kind: EntityKind) -> &EntityTopics {
        match kind {
            EntityKind::Temperature => &self.temperature,
            EntityKind::Ip => &self.ip,
            EntityKind::Switch => &self.switch,
            EntityKind::Power => &self.power,
        }
    }

    /// The switch command topic (the only subscription).
    pub fn command(&self) -> &str {
        &self.command
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Entity {
    pub kind: EntityKind,
    pub name: String,
    pub unique_id: String,
    pub topics: EntityTopics,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub category: Option<&'static str>,
}

impl Entity {
    fn new(kind: EntityKind, device_id: &str, topics: &Topics, switch_name: &str) -> Self {
        let (name, unit, device_class, category) = match kind {
            EntityKind::Temperature => ("Temperature", Some("C"), Some("temperature"), None),
            EntityKind::Ip => ("IP", None, None, Some("diagnostic")),
            EntityKind::Switch => (switch_name, None, None, None),
            EntityKind::Power => ("Power", Some("W"), Some("power"), None),
        };
        Self {
            kind,
            name: name.to_string(),
            unique_id: format!("{device_id}{}", kind.unique_suffix()),
            topics: topics.get(kind).clone(),
            unit,
            device_class,
            category,
        }
    }

    fn payload(&self, device: &DeviceInfo) -> DiscoveryPayload {
        let is_switch = self.kind == EntityKind::Switch;
        DiscoveryPayload {
            name: self.name.clone(),
            uniq_id: self.unique_id.clone(),
            stat_t: self.topics.state.clone(),
            unit_of_meas: self.unit.map(str::to_string),
            dev_cla: self.device_class.map(str::to_string),
            cmd_t: self.topics.command.clone(),
            payload_on: is_switch.then(|| PAYLOAD_ON.to_string()),
            payload_off: is_switch.then(|| PAYLOAD_OFF.to_string()),
            ent_cat: self.category.map(str::to_string),
            dev: DevicePayload {
                ids: vec![device.id.clone()],
                name: device.display_name.clone(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Discovery document, abbreviated keys as Home Assistant accepts them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub uniq_id: String,
    pub stat_t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_meas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_cla: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ent_cat: Option<String>,
    pub dev: DevicePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePayload {
    pub ids: Vec<String>,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// State published once right after the configs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub value: String,
    pub retain: bool,
}

/// One entity ready to announce.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub config_topic: String,
    pub payload: Vec<u8>,
    pub state_topic: String,
    pub initial_state: Option<InitialState>,
}

/// Read-only descriptor table consumed by the startup announcement.
#[derive(Debug)]
pub struct DiscoveryRegistry {
    entities: Vec<Entity>,
    announcements: Vec<Announcement>,
}

impl DiscoveryRegistry {
    pub fn new(
        device: &DeviceInfo,
        topics: &Topics,
        ip: &str,
        switch_name: &str,
    ) -> serde_json::Result<Self> {
        let entities: Vec<Entity> = EntityKind::ALL
            .iter()
            .map(|&kind| Entity::new(kind, &device.id, topics, switch_name))
            .collect();

        let announcements = entities
            .iter()
            .map(|e| -> serde_json::Result<Announcement> {
                let payload = serde_json::to_vec(&e.payload(device))?;
                let initial_state = match e.kind {
                    EntityKind::Ip => Some(InitialState {
                        value: ip.to_string(),
                        retain: true,
                    }),
                    EntityKind::Switch => Some(InitialState {
                        value: PAYLOAD_OFF.to_string(),
                        retain: false,
                    }),
                    EntityKind::Temperature | EntityKind::Power => None,
                };
                Ok(Announcement {
                    config_topic: e.topics.config.clone(),
                    payload,
                    state_topic: e.topics.state.clone(),
                    initial_state,
                })
            })
            .collect::<serde_json::Result<Vec<_>>>()?;

        tracing::debug!(entities = entities.len(), "discovery registry built");

        Ok(Self {
            entities,
            announcements,
        })
    }

    /// Every entity in announcement order: temperature, ip, switch, power.
    pub fn all_entities(&self) -> &[Announcement] {
        &self.announcements
    }

    pub fn entity(&self, kind: EntityKind) -> Option<&Entity> {
        self.entities.iter().find(|e| e.kind == kind)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
