use chrono::{DateTime, Utc};
use fleetgate_core::Detection;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: String,
    pub score: f64,
    /// `[x, y, width, height]`.
    pub bbox: [f64; 4],
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to start classifier: {0}")]
    Spawn(#[source] io::Error),
    #[error("classifier io failed: {0}")]
    Io(#[from] io::Error),
    #[error("classifier exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("classifier output is not a prediction list: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ClassifyFuture = BoxFuture<'static, Result<Vec<Prediction>, ClassifyError>>;

pub trait Classifier: Send + Sync {
    fn classify(&self, image: Arc<[u8]>) -> ClassifyFuture;
}

/// Fixed answers, no model. Used when no classifier command is configured.
#[derive(Debug, Clone)]
pub struct StubClassifier {
    predictions: Vec<Prediction>,
}

impl StubClassifier {
    pub fn with_predictions(predictions: Vec<Prediction>) -> Self {
        Self { predictions }
    }
}

impl Default for StubClassifier {
    fn default() -> Self {
        Self::with_predictions(vec![Prediction {
            class: "person".to_string(),
            score: 0.9,
            bbox: [0.0, 0.0, 100.0, 100.0],
        }])
    }
}

impl Classifier for StubClassifier {
    fn classify(&self, _image: Arc<[u8]>) -> ClassifyFuture {
        let predictions = self.predictions.clone();
        Box::pin(async move { Ok(predictions) })
    }
}

/// Runs an external program per image: raw bytes on stdin, a JSON array of
/// `{class, score, bbox}` expected on stdout.
#[derive(Debug, Clone)]
pub struct CommandClassifier {
    program: String,
    args: Vec<String>,
}

impl CommandClassifier {
    /// Splits `command_line` on whitespace. Returns `None` when it is blank.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Classifier for CommandClassifier {
    fn classify(&self, image: Arc<[u8]>) -> ClassifyFuture {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Box::pin(async move {
            let mut child = command.spawn().map_err(ClassifyError::Spawn)?;
            if let Some(mut stdin) = child.stdin.take() {
                // A classifier may exit without draining stdin; its status says why.
                if let Err(err) = stdin.write_all(&image).await {
                    if err.kind() != io::ErrorKind::BrokenPipe {
                        return Err(err.into());
                    }
                }
                drop(stdin);
            }
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(ClassifyError::Exit {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            Ok(serde_json::from_slice(&output.stdout)?)
        })
    }
}

/// Hits on a recognised entity with a score strictly above `threshold`.
pub fn select_detections(
    predictions: Vec<Prediction>,
    entities: &HashSet<String>,
    threshold: f64,
    sensor_id: &str,
    image_base64: &str,
    timestamp: DateTime<Utc>,
) -> Vec<Detection> {
    predictions
        .into_iter()
        .filter(|p| entities.contains(&p.class) && p.score > threshold)
        .map(|p| Detection {
            sensor_id: sensor_id.to_string(),
            label: p.class,
            score: p.score,
            bbox: p.bbox,
            image: image_base64.to_string(),
            timestamp,
        })
        .collect()
}

/// Names of the sub-directories of `dir`. A missing or unreadable directory
/// gives an empty set.
pub fn load_entities(dir: &Path) -> HashSet<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(
                event = "entities_dir_unreadable",
                dir = %dir.display(),
                error = %err,
                "no recognised entities"
            );
            return HashSet::new();
        }
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect()
}
