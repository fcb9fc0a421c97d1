//! Shared supervisor state. Every map sits behind its own lock and is only
//! touched through [`FleetState`] methods.

use fleetgate_core::control_ipc::{ControlMsg, PushCommandPayload};
use fleetgate_core::observer_wire::FleetSnapshot;
use fleetgate_core::{DeviceCommand, DeviceConfig, DeviceState};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// The live worker serving a port.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub control: mpsc::Sender<ControlMsg>,
}

/// Latest snapshot text for one observer; `None` until the first tick.
pub type TickReceiver = watch::Receiver<Option<Arc<str>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(WorkerId),
    /// No live worker; kept for the next worker on that port.
    Held,
    Dropped(&'static str),
}

pub struct FleetState {
    roster: Vec<DeviceConfig>,
    ports_by_key: HashMap<String, u16>,
    hold_commands: bool,
    registry: RwLock<HashMap<String, DeviceState>>,
    assignments: RwLock<HashMap<u16, WorkerHandle>>,
    held_commands: RwLock<HashMap<u16, String>>,
    observers: RwLock<HashMap<u64, watch::Sender<Option<Arc<str>>>>>,
    observer_counter: AtomicU64,
}

impl FleetState {
    pub fn new(roster: Vec<DeviceConfig>, hold_commands: bool) -> Self {
        let ports_by_key = roster
            .iter()
            .map(|device| (device.key.clone(), device.port))
            .collect();
        let registry = roster
            .iter()
            .map(|device| (device.key.clone(), DeviceState::new(device.clone())))
            .collect();
        Self {
            roster,
            ports_by_key,
            hold_commands,
            registry: RwLock::new(registry),
            assignments: RwLock::new(HashMap::new()),
            held_commands: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
            observer_counter: AtomicU64::new(0),
        }
    }

    pub fn roster(&self) -> &[DeviceConfig] {
        &self.roster
    }

    /// Registry in roster order.
    pub async fn snapshot(&self) -> FleetSnapshot {
        let registry = self.registry.read().await;
        let devices = self
            .roster
            .iter()
            .filter_map(|device| registry.get(&device.key).cloned())
            .collect();
        FleetSnapshot { devices }
    }

    pub async fn device_state(&self, key: &str) -> Option<DeviceState> {
        self.registry.read().await.get(key).cloned()
    }

    /// Last write wins. Reports for keys outside the roster are ignored.
    pub async fn apply_report(&self, worker_id: WorkerId, state: DeviceState) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get_mut(state.key()) {
            Some(entry) => {
                *entry = state;
                true
            }
            None => {
                warn!(event = "report_unknown_device", worker_id = %worker_id, key = %state.key());
                false
            }
        }
    }

    /// Records `handle` as the owner of `port`. A command held while the port
    /// had no worker is queued on `handle` before the handle becomes visible
    /// to routing, so it cannot land behind a newer command. Call after
    /// `assign_device` has been queued. Returns the forwarded command.
    pub async fn attach_worker(&self, port: u16, handle: WorkerHandle) -> Option<String> {
        let worker_id = handle.worker_id;
        let mut assignments = self.assignments.write().await;
        let mut held_commands = self.held_commands.write().await;

        let mut forwarded = None;
        if let Some(command) = held_commands.remove(&port) {
            let msg = ControlMsg::PushCommand(PushCommandPayload {
                command: command.clone(),
            });
            if handle.control.try_send(msg).is_ok() {
                forwarded = Some(command);
            } else {
                warn!(event = "held_command_not_forwarded", port, worker_id = %worker_id);
                held_commands.insert(port, command);
            }
        }
        drop(held_commands);

        if let Some(previous) = assignments.insert(port, handle) {
            warn!(
                event = "assignment_replaced",
                port,
                previous = %previous.worker_id,
                worker_id = %worker_id
            );
        }
        forwarded
    }

    /// Removes the assignment only if `worker_id` still owns `port`.
    pub async fn detach_worker(&self, port: u16, worker_id: WorkerId) -> bool {
        let mut assignments = self.assignments.write().await;
        match assignments.get(&port) {
            Some(handle) if handle.worker_id == worker_id => {
                assignments.remove(&port);
                true
            }
            _ => false,
        }
    }

    pub async fn worker_for_port(&self, port: u16) -> Option<WorkerId> {
        self.assignments
            .read()
            .await
            .get(&port)
            .map(|handle| handle.worker_id)
    }

    pub async fn route_command(&self, command: &DeviceCommand) -> RouteOutcome {
        let Some(&port) = self.ports_by_key.get(&command.target_device_key) else {
            debug!(event = "route_unknown_device", key = %command.target_device_key);
            return RouteOutcome::Dropped("unknown_device");
        };
        let encoded = command.encoded();

        // Held across the hold decision so a concurrent attach sees it.
        let assignments = self.assignments.read().await;
        if let Some(handle) = assignments.get(&port) {
            let msg = ControlMsg::PushCommand(PushCommandPayload {
                command: encoded.clone(),
            });
            if handle.control.try_send(msg).is_ok() {
                debug!(
                    event = "command_routed",
                    key = %command.target_device_key,
                    worker_id = %handle.worker_id,
                    command = %encoded
                );
                return RouteOutcome::Delivered(handle.worker_id);
            }
        }

        if self.hold_commands {
            info!(event = "command_held", key = %command.target_device_key, port, command = %encoded);
            self.held_commands.write().await.insert(port, encoded);
            return RouteOutcome::Held;
        }
        debug!(event = "command_dropped", key = %command.target_device_key, port, reason = "no_worker");
        RouteOutcome::Dropped("no_worker")
    }

    pub async fn held_command(&self, port: u16) -> Option<String> {
        self.held_commands.read().await.get(&port).cloned()
    }

    /// Each observer holds at most one undelivered tick; a newer one replaces it.
    pub async fn register_observer(&self) -> (u64, TickReceiver) {
        let id = self.observer_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(None);
        self.observers.write().await.insert(id, tx);
        (id, rx)
    }

    pub async fn remove_observer(&self, id: u64) {
        self.observers.write().await.remove(&id);
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }

    /// Replaces every observer's pending tick. Observers whose receiver is
    /// gone are pruned.
    pub async fn broadcast(&self, text: &str) -> usize {
        let tick: Arc<str> = Arc::from(text);
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in self.observers.read().await.iter() {
            match sender.send(Some(tick.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => closed.push(*id),
            }
        }

        if !closed.is_empty() {
            let mut observers = self.observers.write().await;
            for id in closed {
                debug!(event = "observer_pruned", observer_id = id);
                observers.remove(&id);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgate_core::SensorSnapshot;
    use std::collections::BTreeMap;

    fn roster() -> Vec<DeviceConfig> {
        ["zeta", "alpha", "mid"]
            .iter()
            .enumerate()
            .map(|(i, key)| {
                serde_json::from_value(serde_json::json!({
                    "key": key,
                    "port": 9000 + i as u16,
                    "commands": [{"id": "1", "state": "off"}]
                }))
                .expect("device")
            })
            .collect()
    }

    fn command(key: &str) -> DeviceCommand {
        DeviceCommand {
            target_device_key: key.to_string(),
            command_id: "1".to_string(),
            value: "on".to_string(),
        }
    }

    fn handle(id: u64) -> (WorkerHandle, mpsc::Receiver<ControlMsg>) {
        let (tx, rx) = mpsc::channel(4);
        (
            WorkerHandle {
                worker_id: WorkerId(id),
                control: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn snapshot_follows_roster_order() {
        let fleet = FleetState::new(roster(), false);
        let keys: Vec<String> = fleet
            .snapshot()
            .await
            .devices
            .iter()
            .map(|d| d.key().to_string())
            .collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn report_replaces_entry_wholesale() {
        let fleet = FleetState::new(roster(), false);
        let mut state = fleet.device_state("alpha").await.expect("seeded");
        state.image = Some("aW1n".to_string());
        state.config.commands[0].state = "on".to_string();
        assert!(fleet.apply_report(WorkerId(1), state).await);

        // A later report without an image clears it.
        let mut values = BTreeMap::new();
        values.insert("temp".to_string(), "20".to_string());
        let mut next = fleet.device_state("alpha").await.expect("entry");
        next.image = None;
        next.sensors = Some(SensorSnapshot::new("alpha", values));
        assert!(fleet.apply_report(WorkerId(1), next.clone()).await);

        assert_eq!(fleet.device_state("alpha").await, Some(next));
    }

    #[tokio::test]
    async fn reports_for_unknown_keys_are_ignored() {
        let fleet = FleetState::new(roster(), false);
        let mut stray = fleet.device_state("alpha").await.expect("seeded");
        stray.config.key = "ghost".to_string();
        assert!(!fleet.apply_report(WorkerId(1), stray).await);
        assert!(fleet.device_state("ghost").await.is_none());
        assert_eq!(fleet.snapshot().await.devices.len(), 3);
    }

    #[tokio::test]
    async fn routes_to_the_owning_worker() {
        let fleet = FleetState::new(roster(), false);
        let (worker, mut rx) = handle(7);
        assert_eq!(fleet.attach_worker(9001, worker).await, None);

        assert_eq!(
            fleet.route_command(&command("alpha")).await,
            RouteOutcome::Delivered(WorkerId(7))
        );
        match rx.recv().await.expect("pushed") {
            ControlMsg::PushCommand(payload) => assert_eq!(payload.command, "1=on"),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn routing_miss_drops_without_hold() {
        let fleet = FleetState::new(roster(), false);
        assert_eq!(
            fleet.route_command(&command("alpha")).await,
            RouteOutcome::Dropped("no_worker")
        );
        assert_eq!(
            fleet.route_command(&command("ghost")).await,
            RouteOutcome::Dropped("unknown_device")
        );
        assert_eq!(fleet.held_command(9001).await, None);
    }

    #[tokio::test]
    async fn held_command_is_handed_to_the_next_worker() {
        let fleet = FleetState::new(roster(), true);
        assert_eq!(fleet.route_command(&command("alpha")).await, RouteOutcome::Held);
        let mut newer = command("alpha");
        newer.value = "off".to_string();
        assert_eq!(fleet.route_command(&newer).await, RouteOutcome::Held);

        let (worker, mut rx) = handle(2);
        assert_eq!(
            fleet.attach_worker(9001, worker).await,
            Some("1=off".to_string())
        );
        assert_eq!(fleet.held_command(9001).await, None);

        let mut live = command("alpha");
        live.value = "blink".to_string();
        assert_eq!(
            fleet.route_command(&live).await,
            RouteOutcome::Delivered(WorkerId(2))
        );

        let mut queued = Vec::new();
        while let Ok(ControlMsg::PushCommand(payload)) = rx.try_recv() {
            queued.push(payload.command);
        }
        assert_eq!(queued, vec!["1=off", "1=blink"]);
    }

    #[tokio::test]
    async fn stale_worker_cannot_detach_its_replacement() {
        let fleet = FleetState::new(roster(), false);
        let (old, _old_rx) = handle(1);
        let (new, _new_rx) = handle(2);
        fleet.attach_worker(9000, old).await;
        fleet.attach_worker(9000, new).await;

        assert!(!fleet.detach_worker(9000, WorkerId(1)).await);
        assert_eq!(fleet.worker_for_port(9000).await, Some(WorkerId(2)));
        assert!(fleet.detach_worker(9000, WorkerId(2)).await);
        assert_eq!(fleet.worker_for_port(9000).await, None);
    }

    #[tokio::test]
    async fn broadcast_prunes_closed_observers() {
        let fleet = FleetState::new(roster(), false);
        let (_, mut open_rx) = fleet.register_observer().await;
        let (_, closed_rx) = fleet.register_observer().await;
        drop(closed_rx);

        assert_eq!(fleet.broadcast("tick").await, 1);
        assert_eq!(fleet.observer_count().await, 1);
        assert!(open_rx.has_changed().expect("sender alive"));
        assert_eq!(open_rx.borrow_and_update().as_deref(), Some("tick"));
    }

    #[tokio::test]
    async fn stalled_observer_holds_only_the_latest_tick() {
        let fleet = FleetState::new(roster(), false);
        let (_, mut rx) = fleet.register_observer().await;
        for tick in ["one", "two", "three"] {
            assert_eq!(fleet.broadcast(tick).await, 1);
        }

        assert_eq!(rx.borrow_and_update().as_deref(), Some("three"));
        assert!(!rx.has_changed().expect("sender alive"));
    }
}
