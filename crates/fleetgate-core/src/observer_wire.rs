//! JSON messages exchanged with observer clients over `/ws`.

use crate::{parse_timestamp, DeviceCommand, DeviceState, TelemetryRecord};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "operation")]
pub enum ObserverRequest {
    #[serde(rename = "getSensors")]
    GetSensors,
    #[serde(rename = "getSensorReadings")]
    GetSensorReadings { command: ReadingsQuery },
    #[serde(rename = "function")]
    Function { command: FunctionCall },
}

impl ObserverRequest {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingsQuery {
    pub sensor_id: String,
    #[serde(deserialize_with = "deserialize_instant")]
    pub start_time: DateTime<Utc>,
    #[serde(deserialize_with = "deserialize_instant")]
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionCall {
    pub recipient: String,
    pub message: FunctionMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FunctionMessage {
    pub key: Value,
    pub value: Value,
}

impl FunctionCall {
    pub fn into_command(self) -> DeviceCommand {
        DeviceCommand {
            target_device_key: self.recipient,
            command_id: render_value(&self.message.key),
            value: render_value(&self.message.value),
        }
    }
}

/// Strings go out verbatim, anything else as its JSON text.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorIdRow {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation")]
pub enum ObserverResponse {
    #[serde(rename = "sendSensors")]
    SendSensors {
        #[serde(rename = "sensorIDs")]
        sensor_ids: Vec<SensorIdRow>,
    },
    #[serde(rename = "sendSensorReadings")]
    SendSensorReadings {
        #[serde(rename = "sensorData")]
        sensor_data: Vec<TelemetryRecord>,
    },
}

impl ObserverResponse {
    pub fn sensors(ids: Vec<String>) -> Self {
        ObserverResponse::SendSensors {
            sensor_ids: ids
                .into_iter()
                .map(|sensor_id| SensorIdRow { sensor_id })
                .collect(),
        }
    }
}

/// Periodic push of the whole registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub devices: Vec<DeviceState>,
}

/// Accepts an RFC 3339 string or epoch milliseconds.
fn deserialize_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => parse_timestamp(&s).map_err(serde::de::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| serde::de::Error::custom("epoch millis out of range")),
        _ => Err(serde::de::Error::custom(
            "expected timestamp string or epoch millis",
        )),
    }
}
