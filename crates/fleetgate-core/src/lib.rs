use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

pub mod control_ipc;
pub mod device_codec;
pub mod observer_wire;
pub mod roster;

use device_codec::CommandUpdate;

/// Static description of one device, loaded from the roster at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub key: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default)]
    pub detect_objects: bool,
    #[serde(default)]
    pub save_sensor_data: bool,
    #[serde(default)]
    pub commands: Vec<CommandSlot>,
    /// Roster fields this gateway does not interpret; passed through to observers.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// A named, stateful control point on a device (a relay, a fan...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSlot {
    #[serde(deserialize_with = "deserialize_scalar")]
    pub id: String,
    #[serde(default, deserialize_with = "deserialize_scalar")]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(flatten)]
    pub config: DeviceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<SensorSnapshot>,
}

impl DeviceState {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            image: None,
            sensors: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    /// Overwrites the state of every slot whose id matches; unknown ids are ignored.
    /// Returns how many slots changed.
    pub fn apply_command_updates(&mut self, updates: &[CommandUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            if let Some(slot) = self
                .config
                .commands
                .iter_mut()
                .find(|slot| slot.id == update.id)
            {
                slot.state = update.value.clone();
                applied += 1;
            }
        }
        applied
    }
}

/// Latest decoded telemetry of a device, as shown to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SensorSnapshot {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

impl SensorSnapshot {
    /// The device key always wins over a `sensorId` token sent by the device.
    pub fn new(sensor_id: &str, mut values: BTreeMap<String, String>) -> Self {
        values.remove("sensorId");
        Self {
            sensor_id: sensor_id.to_string(),
            values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Record keys owned by the gateway; device tokens with these names are dropped.
const RESERVED_RECORD_KEYS: [&str; 2] = ["sensorId", "timestamp"];

impl TelemetryRecord {
    pub fn from_snapshot(snapshot: &SensorSnapshot, timestamp: DateTime<Utc>) -> Self {
        let fields = snapshot
            .values
            .iter()
            .filter(|(key, _)| !RESERVED_RECORD_KEYS.contains(&key.as_str()))
            .map(|(key, raw)| (key.clone(), telemetry_value(raw)))
            .collect();
        Self {
            sensor_id: snapshot.sensor_id.clone(),
            timestamp,
            fields,
        }
    }
}

/// Numbers are stored as numbers, everything else verbatim.
pub fn telemetry_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) => Value::Number(number),
        None => Value::String(raw.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    pub label: String,
    pub score: f64,
    /// `[x, y, width, height]` in image pixels.
    pub bbox: [f64; 4],
    pub image: String,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// A point-to-point command from an observer, addressed by device key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    pub target_device_key: String,
    pub command_id: String,
    pub value: String,
}

impl DeviceCommand {
    pub fn encoded(&self) -> String {
        device_codec::encode_command(&self.command_id, &self.value)
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim()).map(|ts| ts.with_timezone(&Utc))
}

pub mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Deserialize a string, number or bool into a String; null becomes empty.
fn deserialize_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(serde::de::Error::custom(
            "expected string, number or bool",
        )),
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => s.trim().parse::<u16>().map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_u64()
            .and_then(|u| u16::try_from(u).ok())
            .ok_or_else(|| serde::de::Error::custom("port out of range")),
        _ => Err(serde::de::Error::custom("expected string or number for port")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config() -> DeviceConfig {
        serde_json::from_value(serde_json::json!({
            "key": "greenhouse",
            "port": "9001",
            "detectObjects": true,
            "commands": [{"id": 1, "state": "off"}, {"id": "fan", "state": false}],
            "label": "Greenhouse A"
        }))
        .expect("parse config")
    }

    #[test]
    fn config_accepts_loose_scalars_and_keeps_extra_fields() {
        let cfg = config();
        assert_eq!(cfg.port, 9001);
        assert!(cfg.detect_objects);
        assert!(!cfg.save_sensor_data);
        assert_eq!(cfg.commands[0].id, "1");
        assert_eq!(cfg.commands[1].state, "false");
        assert_eq!(cfg.extra.get("label"), Some(&Value::from("Greenhouse A")));
    }

    #[test]
    fn unknown_command_ids_are_ignored_when_folding() {
        let mut state = DeviceState::new(config());
        let applied = state.apply_command_updates(&[
            CommandUpdate {
                id: "1".to_string(),
                value: "on".to_string(),
            },
            CommandUpdate {
                id: "pump".to_string(),
                value: "on".to_string(),
            },
        ]);
        assert_eq!(applied, 1);
        assert_eq!(state.config.commands[0].state, "on");
        assert_eq!(state.config.commands[1].state, "false");
    }

    #[test]
    fn device_state_serializes_flat_with_sensor_id() {
        let mut state = DeviceState::new(config());
        let mut values = BTreeMap::new();
        values.insert("temp".to_string(), "21.5".to_string());
        values.insert("sensorId".to_string(), "spoofed".to_string());
        state.sensors = Some(SensorSnapshot::new("greenhouse", values));

        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["key"], "greenhouse");
        assert_eq!(json["detectObjects"], true);
        assert_eq!(json["label"], "Greenhouse A");
        assert_eq!(json["sensors"]["sensorId"], "greenhouse");
        assert_eq!(json["sensors"]["temp"], "21.5");
        assert!(json.get("image").is_none());

        let back: DeviceState = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, state);
    }

    #[test]
    fn telemetry_record_types_numeric_fields() {
        let mut values = BTreeMap::new();
        values.insert("temp".to_string(), "21.5".to_string());
        values.insert("hum".to_string(), "40".to_string());
        values.insert("state".to_string(), "idle".to_string());
        let snapshot = SensorSnapshot::new("A", values);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("ts");

        let record = TelemetryRecord::from_snapshot(&snapshot, ts);
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["sensorId"], "A");
        assert_eq!(json["timestamp"], "2024-01-01T12:00:00.000Z");
        assert_eq!(json["hum"], 40);
        assert_eq!(json["temp"], 21.5);
        assert_eq!(json["state"], "idle");
    }

    #[test]
    fn device_timestamp_token_does_not_shadow_receipt_time() {
        let frame = device_codec::decode_text("(s:timestamp=5,temp=1)");
        let snapshot = SensorSnapshot::new("A", frame.sensors);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("ts");

        let record = TelemetryRecord::from_snapshot(&snapshot, ts);
        assert!(!record.fields.contains_key("timestamp"));
        let raw = serde_json::to_string(&record).expect("serialize");
        assert_eq!(raw.matches("\"timestamp\"").count(), 1, "{raw}");

        let back: TelemetryRecord = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.timestamp, ts);
        assert_eq!(back.fields["temp"], 1);
    }
}
