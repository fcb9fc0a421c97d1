//! Per-device state machine. Pure: no sockets, no tasks. The server glue
//! decides what to do with the [`FrameOutcome`].

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use fleetgate_core::control_ipc::DEFAULT_MAX_FRAME_BYTES;
use fleetgate_core::device_codec::{decode_text, DevicePayload};
use fleetgate_core::{DeviceConfig, DeviceState, SensorSnapshot, TelemetryRecord};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Largest base64 image kept in the reported state. The rest of a
/// `report_state` frame has to fit in what is left.
pub const MAX_REPORTED_IMAGE_BYTES: usize = DEFAULT_MAX_FRAME_BYTES - 256 * 1024;

#[derive(Debug, Clone)]
pub struct SamplingSettings {
    /// Classify every n-th image frame. Zero is treated as one.
    pub prediction_frequency: u32,
    /// Hits must score strictly above this to be kept.
    pub score_threshold: f64,
    pub entities: Arc<HashSet<String>>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            prediction_frequency: 10,
            score_threshold: 0.5,
            entities: Arc::new(HashSet::new()),
        }
    }
}

/// An image frame selected for classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyJob {
    pub sensor_id: String,
    pub image: Arc<[u8]>,
    pub image_base64: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub report: DeviceState,
    pub telemetry: Option<TelemetryRecord>,
    pub classify: Option<ClassifyJob>,
}

pub struct DeviceSession {
    state: DeviceState,
    sampling: SamplingSettings,
    frames_since_prediction: u32,
    pending_command: Option<String>,
}

impl DeviceSession {
    pub fn new(config: DeviceConfig, sampling: SamplingSettings) -> Self {
        Self {
            state: DeviceState::new(config),
            sampling,
            frames_since_prediction: 0,
            pending_command: None,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn sampling(&self) -> &SamplingSettings {
        &self.sampling
    }

    /// Returns the command that was still waiting, if any.
    pub fn push_command(&mut self, command: String) -> Option<String> {
        self.pending_command.replace(command)
    }

    pub fn take_pending_command(&mut self) -> Option<String> {
        self.pending_command.take()
    }

    pub fn handle_payload(
        &mut self,
        payload: DevicePayload,
        received_at: DateTime<Utc>,
    ) -> FrameOutcome {
        match payload {
            DevicePayload::Image(bytes) => self.handle_image(bytes, received_at),
            DevicePayload::Text(text) => self.handle_text(&text, received_at),
        }
    }

    fn handle_image(&mut self, bytes: Vec<u8>, received_at: DateTime<Utc>) -> FrameOutcome {
        let image_base64 = general_purpose::STANDARD.encode(&bytes);
        let mut classify = None;

        if self.state.config.detect_objects {
            self.frames_since_prediction += 1;
            if self.frames_since_prediction >= self.sampling.prediction_frequency.max(1) {
                self.frames_since_prediction = 0;
                classify = Some(ClassifyJob {
                    sensor_id: self.state.key().to_string(),
                    image: Arc::from(bytes),
                    image_base64: image_base64.clone(),
                    received_at,
                });
            }
        }

        if image_base64.len() > MAX_REPORTED_IMAGE_BYTES {
            warn!(
                event = "image_too_large_to_report",
                key = %self.state.key(),
                encoded_bytes = image_base64.len(),
                max = MAX_REPORTED_IMAGE_BYTES
            );
        } else {
            self.state.image = Some(image_base64);
        }
        FrameOutcome {
            report: self.state.clone(),
            telemetry: None,
            classify,
        }
    }

    fn handle_text(&mut self, text: &str, received_at: DateTime<Utc>) -> FrameOutcome {
        let frame = decode_text(text);
        self.state.apply_command_updates(&frame.commands);

        let snapshot = SensorSnapshot::new(self.state.key(), frame.sensors);
        let telemetry = self
            .state
            .config
            .save_sensor_data
            .then(|| TelemetryRecord::from_snapshot(&snapshot, received_at));
        self.state.sensors = Some(snapshot);

        FrameOutcome {
            report: self.state.clone(),
            telemetry,
            classify: None,
        }
    }
}
