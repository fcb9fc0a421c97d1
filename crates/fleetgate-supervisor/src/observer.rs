//! Observer hub: `/ws` for requests and snapshot pushes, `/health` for liveness checks.

use crate::fleet::{FleetState, RouteOutcome};
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use fleetgate_core::observer_wire::{ObserverRequest, ObserverResponse};
use fleetgate_storage::{SqliteStore, StorageError, TelemetryStore};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const REPLY_QUEUE: usize = 8;

pub type SharedStore = Arc<Mutex<SqliteStore>>;

#[derive(Clone)]
pub struct ObserverState {
    pub fleet: Arc<FleetState>,
    pub store: Option<SharedStore>,
    pub write_timeout: Duration,
}

/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: ObserverState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<ObserverState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: ObserverState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (observer_id, mut ticks) = state.fleet.register_observer().await;
    let (tx, mut rx) = mpsc::channel::<String>(REPLY_QUEUE);
    let write_timeout = state.write_timeout;
    let write_task = tokio::spawn(async move {
        loop {
            // Replies first; a tick waiting behind them is replaced, not queued.
            let text = tokio::select! {
                biased;
                reply = rx.recv() => match reply {
                    Some(text) => text,
                    None => return,
                },
                changed = ticks.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let tick = ticks.borrow_and_update().clone();
                    match tick {
                        Some(tick) => tick.to_string(),
                        None => continue,
                    }
                }
            };
            let send = ws_sender.send(Message::Text(text));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return,
            }
        }
    });

    info!(event = "observer_connected", observer_id, remote = %remote);

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "observer_read_failed", observer_id, error = %err);
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if let Some(response) = handle_request(&state.fleet, state.store.as_ref(), &text).await {
            if tx.send(response).await.is_err() {
                break;
            }
        }
    }

    state.fleet.remove_observer(observer_id).await;
    info!(event = "observer_disconnected", observer_id, remote = %remote);
    drop(tx);
    let _ = write_task.await;
}

/// Answers one observer request. `None` when there is nothing to send back,
/// including for unparsable input and failed queries.
pub async fn handle_request(
    fleet: &FleetState,
    store: Option<&SharedStore>,
    raw: &str,
) -> Option<String> {
    let request = match ObserverRequest::parse(raw) {
        Ok(request) => request,
        Err(err) => {
            debug!(event = "observer_request_ignored", error = %err);
            return None;
        }
    };

    let response = match request {
        ObserverRequest::GetSensors => {
            let ids = query_store(store, "get_sensors", |store| {
                store.list_distinct_sensor_ids()
            })
            .await?;
            ObserverResponse::sensors(ids)
        }
        ObserverRequest::GetSensorReadings { command } => {
            let sensor_data = query_store(store, "get_sensor_readings", move |store| {
                store.query_by_id_and_range(&command.sensor_id, command.start_time, command.end_time)
            })
            .await?;
            ObserverResponse::SendSensorReadings { sensor_data }
        }
        ObserverRequest::Function { command } => {
            let command = command.into_command();
            if let RouteOutcome::Dropped(reason) = fleet.route_command(&command).await {
                debug!(event = "function_not_routed", key = %command.target_device_key, reason);
            }
            return None;
        }
    };

    match serde_json::to_string(&response) {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(event = "observer_encode_failed", error = %err);
            None
        }
    }
}

async fn query_store<T, F>(store: Option<&SharedStore>, op: &'static str, query: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T, StorageError> + Send + 'static,
{
    let Some(store) = store.cloned() else {
        warn!(event = "observer_query_skipped", op, reason = "no_store");
        return None;
    };
    let joined = tokio::task::spawn_blocking(move || match store.lock() {
        Ok(guard) => Some(query(&guard)),
        Err(_) => None,
    })
    .await;
    match joined {
        Ok(Some(Ok(value))) => Some(value),
        Ok(Some(Err(err))) => {
            warn!(event = "observer_query_failed", op, error = %err);
            None
        }
        Ok(None) => {
            warn!(event = "observer_query_failed", op, error = "store lock poisoned");
            None
        }
        Err(err) => {
            warn!(event = "observer_query_failed", op, error = %err);
            None
        }
    }
}

/// Serialises the registry once and offers it to every observer.
pub async fn broadcast_snapshot(fleet: &FleetState) -> usize {
    if fleet.observer_count().await == 0 {
        return 0;
    }
    let snapshot = fleet.snapshot().await;
    match serde_json::to_string(&snapshot) {
        Ok(text) => fleet.broadcast(&text).await,
        Err(err) => {
            warn!(event = "snapshot_encode_failed", error = %err);
            0
        }
    }
}

pub fn spawn_broadcast(
    fleet: Arc<FleetState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let delivered = broadcast_snapshot(&fleet).await;
            debug!(event = "snapshot_broadcast", delivered);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{WorkerHandle, WorkerId};
    use chrono::{TimeZone, Utc};
    use fleetgate_core::control_ipc::{ControlMsg, PushCommandPayload};
    use fleetgate_core::observer_wire::FleetSnapshot;
    use fleetgate_core::{DeviceConfig, TelemetryRecord};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn roster() -> Vec<DeviceConfig> {
        vec![
            serde_json::from_value(json!({"key": "A", "port": 9001})).expect("device"),
            serde_json::from_value(json!({"key": "B", "port": 9002})).expect("device"),
        ]
    }

    fn store_with(records: &[(&str, i64, f64)]) -> SharedStore {
        let store = SqliteStore::open_in_memory().expect("store");
        for (sensor_id, secs, temp) in records {
            let mut fields = BTreeMap::new();
            fields.insert("temp".to_string(), json!(temp));
            store
                .append(&TelemetryRecord {
                    sensor_id: sensor_id.to_string(),
                    timestamp: Utc.timestamp_opt(*secs, 0).single().expect("ts"),
                    fields,
                })
                .expect("append");
        }
        Arc::new(Mutex::new(store))
    }

    #[tokio::test]
    async fn get_sensors_lists_stored_ids() {
        let fleet = FleetState::new(roster(), false);
        let store = store_with(&[("B", 10, 1.0), ("A", 11, 2.0), ("B", 12, 3.0)]);

        let raw = handle_request(&fleet, Some(&store), r#"{"operation":"getSensors"}"#)
            .await
            .expect("response");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(
            value,
            json!({"operation": "sendSensors", "sensorIDs": [{"sensorId": "A"}, {"sensorId": "B"}]})
        );
    }

    #[tokio::test]
    async fn get_sensor_readings_returns_the_inclusive_window() {
        let fleet = FleetState::new(roster(), false);
        let store = store_with(&[
            ("A", 1_700_000_000, 20.0),
            ("A", 1_700_000_060, 21.0),
            ("A", 1_700_000_120, 22.0),
            ("B", 1_700_000_060, 99.0),
        ]);
        let request = json!({
            "operation": "getSensorReadings",
            "command": {
                "sensorId": "A",
                "startTime": "2023-11-14T22:13:20Z",
                "endTime": "2023-11-14T22:14:20Z"
            }
        })
        .to_string();

        let raw = handle_request(&fleet, Some(&store), &request)
            .await
            .expect("response");
        let value: Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(value["operation"], "sendSensorReadings");
        let temps: Vec<f64> = value["sensorData"]
            .as_array()
            .expect("array")
            .iter()
            .map(|row| row["temp"].as_f64().expect("temp"))
            .collect();
        assert_eq!(temps, vec![20.0, 21.0]);
    }

    #[tokio::test]
    async fn queries_without_a_store_get_no_answer() {
        let fleet = FleetState::new(roster(), false);
        assert!(handle_request(&fleet, None, r#"{"operation":"getSensors"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn function_routes_to_the_recipient_worker() {
        let fleet = FleetState::new(roster(), false);
        let (tx, mut rx) = mpsc::channel(4);
        fleet
            .attach_worker(
                9002,
                WorkerHandle {
                    worker_id: WorkerId(7),
                    control: tx,
                },
            )
            .await;

        let request = json!({
            "operation": "function",
            "command": {"recipient": "B", "message": {"key": 2, "value": true}}
        })
        .to_string();
        assert!(handle_request(&fleet, None, &request).await.is_none());

        let msg = rx.try_recv().expect("routed");
        assert_eq!(
            msg,
            ControlMsg::PushCommand(PushCommandPayload {
                command: "2=true".to_string()
            })
        );
    }

    #[tokio::test]
    async fn garbage_and_unknown_operations_are_swallowed() {
        let fleet = FleetState::new(roster(), false);
        let store = store_with(&[]);
        for raw in ["not json", "{}", r#"{"operation":"reboot"}"#, "[1,2]"] {
            assert!(handle_request(&fleet, Some(&store), raw).await.is_none(), "{raw}");
        }
    }

    #[tokio::test]
    async fn snapshot_reaches_every_observer() {
        let fleet = FleetState::new(roster(), false);
        let (_, mut rx_one) = fleet.register_observer().await;
        let (_, mut rx_two) = fleet.register_observer().await;

        assert_eq!(broadcast_snapshot(&fleet).await, 2);
        for rx in [&mut rx_one, &mut rx_two] {
            assert!(rx.has_changed().expect("open"));
            let text = rx.borrow_and_update().clone().expect("snapshot");
            let snapshot: FleetSnapshot = serde_json::from_str(&text).expect("decode");
            let keys: Vec<&str> = snapshot.devices.iter().map(|d| d.key()).collect();
            assert_eq!(keys, vec!["A", "B"]);
        }
    }
}
