use crate::{DeviceConfig, DeviceState};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

/// Large enough for a base64 camera frame inside a `report_state`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Control channel revision. Written as a number; a numeric string is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(1);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u16),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Number(version) => Ok(Self(version)),
            Wire::Text(raw) => raw.trim().parse().map(Self).map_err(de::Error::custom),
        }
    }
}

/// One line on the supervisor/worker pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub worker_id: u64,
    pub timestamp: String,
    #[serde(flatten)]
    pub msg: ControlMsg,
}

impl ControlEnvelope {
    pub fn new(worker_id: u64, msg: ControlMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            worker_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMsg {
    /// Supervisor -> worker, once per worker lifetime.
    AssignDevice(DeviceConfig),
    /// Supervisor -> worker; replaces any command not yet flushed to the device.
    PushCommand(PushCommandPayload),
    /// Worker -> supervisor, after every processed device message.
    ReportState(DeviceState),
}

impl ControlMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMsg::AssignDevice(_) => "assign_device",
            ControlMsg::PushCommand(_) => "push_command",
            ControlMsg::ReportState(_) => "report_state",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushCommandPayload {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let raw = trim_line_end(bytes);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

fn trim_line_end(bytes: &[u8]) -> &[u8] {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

/// Incremental decoder for a byte stream of newline-delimited frames.
/// Bad lines are reported and skipped; the stream keeps going.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line_end(&line);
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            self.decode_raw_frame(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let final_frame = std::mem::take(&mut self.pending);
        if !final_frame.iter().all(|b| b.is_ascii_whitespace()) {
            self.decode_raw_frame(&final_frame, &mut report);
        }
        report
    }

    fn decode_raw_frame(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}
