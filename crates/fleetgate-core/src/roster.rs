//! Device roster loading and shard planning.

use crate::DeviceConfig;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read roster {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("roster is not a JSON object keyed by device: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid roster entry '{key}': {source}")]
    InvalidEntry {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("devices '{first}' and '{second}' share port {port}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },
}

pub fn load_roster(path: &Path) -> Result<Vec<DeviceConfig>, RosterError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RosterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_roster(&raw)
}

/// Entries come back in file order. The object key is the device key and
/// overrides any `key` field inside the entry.
pub fn parse_roster(raw: &str) -> Result<Vec<DeviceConfig>, RosterError> {
    let entries: Map<String, Value> = serde_json::from_str(raw)?;
    let mut devices = Vec::with_capacity(entries.len());
    let mut ports: HashMap<u16, String> = HashMap::new();

    for (key, mut value) in entries {
        if let Value::Object(fields) = &mut value {
            fields.insert("key".to_string(), Value::String(key.clone()));
        }
        let device: DeviceConfig =
            serde_json::from_value(value).map_err(|source| RosterError::InvalidEntry {
                key: key.clone(),
                source,
            })?;
        if let Some(first) = ports.insert(device.port, key.clone()) {
            return Err(RosterError::DuplicatePort {
                port: device.port,
                first,
                second: key,
            });
        }
        devices.push(device);
    }

    Ok(devices)
}

/// Which devices of a shard get a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssignmentPolicy {
    /// One worker per non-empty shard, serving the shard's first device.
    #[default]
    ShardLeads,
    /// One worker per device; the pool size is ignored.
    EveryDevice,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown assignment policy '{0}' (expected shard-leads or every-device)")]
pub struct ParsePolicyError(String);

impl FromStr for AssignmentPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shard-leads" | "shard_leads" => Ok(Self::ShardLeads),
            "every-device" | "every_device" => Ok(Self::EveryDevice),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

impl fmt::Display for AssignmentPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShardLeads => f.write_str("shard-leads"),
            Self::EveryDevice => f.write_str("every-device"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub devices: Range<usize>,
}

impl Shard {
    pub fn lead(&self) -> usize {
        self.devices.start
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Contiguous shards of `ceil(device_count / pool_size)` devices. Empty
/// shards are left out, so there may be fewer shards than pool slots.
pub fn plan_shards(device_count: usize, pool_size: usize) -> Vec<Shard> {
    let pool_size = pool_size.max(1);
    let per_shard = device_count.div_ceil(pool_size);
    if per_shard == 0 {
        return Vec::new();
    }

    (0..device_count.div_ceil(per_shard))
        .map(|index| {
            let start = (index * per_shard).min(device_count);
            let end = ((index + 1) * per_shard).min(device_count);
            Shard {
                index,
                devices: start..end,
            }
        })
        .filter(|shard| !shard.is_empty())
        .collect()
}

/// Roster indices that get a worker of their own.
pub fn assigned_devices(
    device_count: usize,
    pool_size: usize,
    policy: AssignmentPolicy,
) -> Vec<usize> {
    match policy {
        AssignmentPolicy::ShardLeads => plan_shards(device_count, pool_size)
            .iter()
            .map(Shard::lead)
            .collect(),
        AssignmentPolicy::EveryDevice => (0..device_count).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_devices_pool_two_gives_shards_of_three_and_two() {
        let shards = plan_shards(5, 2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].devices, 0..3);
        assert_eq!(shards[1].devices, 3..5);
        assert_eq!(shards[0].len(), 3);
        assert_eq!(shards[1].len(), 2);
        assert_eq!(
            assigned_devices(5, 2, AssignmentPolicy::ShardLeads),
            vec![0, 3]
        );
    }

    #[test]
    fn oversized_pool_skips_empty_shards() {
        let shards = plan_shards(5, 4);
        let ranges: Vec<_> = shards.iter().map(|s| s.devices.clone()).collect();
        assert_eq!(ranges, vec![0..2, 2..4, 4..5]);
        assert!(plan_shards(0, 4).is_empty());
        assert_eq!(plan_shards(3, 0).len(), 1);
    }

    #[test]
    fn huge_pool_plans_only_the_shards_it_needs() {
        let shards = plan_shards(3, usize::MAX);
        let ranges: Vec<_> = shards.iter().map(|s| s.devices.clone()).collect();
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn every_device_policy_ignores_pool() {
        assert_eq!(
            assigned_devices(4, 1, AssignmentPolicy::EveryDevice),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            "every-device".parse::<AssignmentPolicy>(),
            Ok(AssignmentPolicy::EveryDevice)
        );
        assert_eq!(
            "Shard-Leads".parse::<AssignmentPolicy>(),
            Ok(AssignmentPolicy::ShardLeads)
        );
        assert!("round-robin".parse::<AssignmentPolicy>().is_err());
    }

    #[test]
    fn roster_keeps_file_order_and_object_keys() {
        let raw = r#"{
            "zeta": {"port": 9003, "commands": [{"id": "1", "state": "off"}]},
            "alpha": {"key": "ignored", "port": "9001", "saveSensorData": true},
            "mid": {"port": 9002, "detectObjects": true, "label": "Yard"}
        }"#;
        let devices = parse_roster(raw).expect("parse roster");
        let keys: Vec<_> = devices.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(devices[1].port, 9001);
        assert!(devices[1].save_sensor_data);
        assert!(devices[2].detect_objects);
        assert_eq!(devices[2].extra["label"], "Yard");
    }

    #[test]
    fn roster_rejects_bad_entries_and_shared_ports() {
        assert!(matches!(
            parse_roster(r#"{"a": {"port": "nope"}}"#),
            Err(RosterError::InvalidEntry { ref key, .. }) if key == "a"
        ));
        assert!(matches!(
            parse_roster(r#"{"a": {"port": 1}, "b": {"port": 1}}"#),
            Err(RosterError::DuplicatePort { port: 1, .. })
        ));
        assert!(matches!(parse_roster("[]"), Err(RosterError::Parse(_))));
    }

    #[test]
    fn missing_roster_file_is_io_error() {
        let err = load_roster(Path::new("/definitely/not/here/sensors.json"))
            .expect_err("missing file");
        assert!(matches!(err, RosterError::Io { .. }));
    }
}
