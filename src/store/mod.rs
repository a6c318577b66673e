//! Process-wide store of per-drone state.
//!
//! The store is the only mutable structure shared between the sessions
//! (telemetry writers), the task agent (task facet writer), and the publisher
//! (reader). Writes are linearizable per drone via the map entry; readers
//! always receive value copies. Change notifications are dispatched after the
//! entry is released and never block writers.

pub mod error;

use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use self::error::{StoreError, UnknownDrone};
use crate::drone_id::DroneId;
use crate::telemetry::{FlightMode, Position, Snapshot, VelocityNed};

/// Link health of a managed drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Disconnected,
    Connected,
    Error,
}

/// Task lifecycle phase mirrored into the entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskPhase {
    #[default]
    None,
    Accepted,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Error,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskPhase::Completed | TaskPhase::Failed | TaskPhase::Cancelled | TaskPhase::Error
        )
    }
}

/// Complete per-drone record. Cloned out to readers.
#[derive(Debug, Clone)]
pub struct DroneState {
    pub drone_id: DroneId,
    pub connection_string: String,
    pub link_status: LinkStatus,

    pub armed: bool,
    pub flight_mode: FlightMode,
    pub position: Option<Position>,
    pub velocity: Option<VelocityNed>,
    pub heading_deg: Option<f64>,
    pub speed_mps: f64,
    pub battery_pct: Option<f64>,
    pub battery_voltage_v: Option<f64>,
    pub gps_fix_type: Option<u8>,

    pub current_task_id: Option<String>,
    pub task_phase: TaskPhase,
    pub task_progress: f64,

    pub last_update: SystemTime,
    pub connected_since: Option<SystemTime>,
}

impl DroneState {
    fn new(drone_id: DroneId, connection_string: String) -> Self {
        Self {
            drone_id,
            connection_string,
            link_status: LinkStatus::Disconnected,
            armed: false,
            flight_mode: FlightMode::Unknown,
            position: None,
            velocity: None,
            heading_deg: None,
            speed_mps: 0.0,
            battery_pct: None,
            battery_voltage_v: None,
            gps_fix_type: None,
            current_task_id: None,
            task_phase: TaskPhase::None,
            task_progress: 0.0,
            last_update: SystemTime::now(),
            connected_since: None,
        }
    }
}

/// Post-commit change notification. `old` is `None` on registration, `new` is
/// `None` on removal.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub drone_id: DroneId,
    pub old: Option<DroneState>,
    pub new: Option<DroneState>,
}

pub struct StateStore {
    states: DashMap<DroneId, DroneState, ahash::RandomState>,
    notify: broadcast::Sender<StateChange>,
}

impl StateStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(64);
        Self {
            states: DashMap::default(),
            notify,
        }
    }

    /// Create the record for a drone. Overwrites nothing; re-registration of a
    /// live drone is a no-op.
    pub fn register(&self, drone_id: DroneId, connection_string: &str) {
        use dashmap::Entry;
        match self.states.entry(drone_id.clone()) {
            Entry::Occupied(_) => {
                debug!(drone_id = %drone_id, "Drone already registered");
            }
            Entry::Vacant(slot) => {
                let state = DroneState::new(drone_id.clone(), connection_string.to_string());
                slot.insert(state.clone());
                info!(drone_id = %drone_id, "Registered drone");
                self.publish_change(drone_id, None, Some(state));
            }
        }
    }

    pub fn unregister(&self, drone_id: &DroneId) {
        if let Some((_, old)) = self.states.remove(drone_id) {
            info!(drone_id = %drone_id, "Unregistered drone");
            self.publish_change(drone_id.clone(), Some(old), None);
        }
    }

    /// Merge a telemetry snapshot into the record; empty fields leave the
    /// previous values in place.
    pub fn update_telemetry(
        &self,
        drone_id: &DroneId,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        let (old, new) = {
            let mut entry = self.states.get_mut(drone_id).ok_or(UnknownDrone {
                drone_id: drone_id.clone(),
            })?;
            let old = entry.value().clone();

            if snapshot.position.is_some() {
                entry.position = snapshot.position;
            }
            if snapshot.velocity.is_some() {
                entry.velocity = snapshot.velocity;
            }
            if snapshot.heading_deg.is_some() {
                entry.heading_deg = snapshot.heading_deg;
            }
            if snapshot.battery_pct.is_some() {
                entry.battery_pct = snapshot.battery_pct;
            }
            if snapshot.battery_voltage_v.is_some() {
                entry.battery_voltage_v = snapshot.battery_voltage_v;
            }
            if snapshot.gps_fix_type.is_some() {
                entry.gps_fix_type = snapshot.gps_fix_type;
            }
            entry.speed_mps = snapshot.speed_mps;
            entry.armed = snapshot.armed;
            entry.flight_mode = snapshot.flight_mode;
            entry.last_update = SystemTime::now();

            (old, entry.value().clone())
        };
        self.publish_change(drone_id.clone(), Some(old), Some(new));
        Ok(())
    }

    pub fn set_link_status(&self, drone_id: &DroneId, status: LinkStatus) -> Result<(), StoreError> {
        let (old, new) = {
            let mut entry = self.states.get_mut(drone_id).ok_or(UnknownDrone {
                drone_id: drone_id.clone(),
            })?;
            let old = entry.value().clone();
            if old.link_status != LinkStatus::Connected && status == LinkStatus::Connected {
                entry.connected_since = Some(SystemTime::now());
            }
            entry.link_status = status;
            entry.last_update = SystemTime::now();
            (old, entry.value().clone())
        };
        self.publish_change(drone_id.clone(), Some(old), Some(new));
        Ok(())
    }

    /// Atomic update of the task facet.
    ///
    /// Rejects progress decreases while the same task stays in
    /// [`TaskPhase::Executing`], and rejects a cleared task id paired with a
    /// non-terminal phase.
    pub fn update_task_status(
        &self,
        drone_id: &DroneId,
        task_id: Option<&str>,
        phase: TaskPhase,
        progress: f64,
    ) -> Result<(), StoreError> {
        if task_id.is_none() && !(phase == TaskPhase::None || phase.is_terminal()) {
            return Err(StoreError::InvalidTaskFacet(
                "active phase requires a task id",
            ));
        }

        let (old, new) = {
            let mut entry = self.states.get_mut(drone_id).ok_or(UnknownDrone {
                drone_id: drone_id.clone(),
            })?;
            let old = entry.value().clone();

            let same_task = task_id.is_some() && old.current_task_id.as_deref() == task_id;
            if same_task
                && old.task_phase == TaskPhase::Executing
                && phase == TaskPhase::Executing
                && progress < old.task_progress
            {
                return Err(StoreError::ProgressRegression {
                    task_id: task_id.unwrap_or_default().to_string(),
                    from: old.task_progress,
                    to: progress,
                });
            }

            entry.current_task_id = task_id.map(str::to_string);
            entry.task_phase = phase;
            entry.task_progress = progress;
            entry.last_update = SystemTime::now();

            (old, entry.value().clone())
        };

        if old.task_phase != new.task_phase || old.current_task_id != new.current_task_id {
            info!(
                drone_id = %drone_id,
                task_id = new.current_task_id.as_deref().unwrap_or("-"),
                phase = ?new.task_phase,
                progress = format_args!("{:.2}", new.task_progress),
                "Task facet updated"
            );
        }
        self.publish_change(drone_id.clone(), Some(old), Some(new));
        Ok(())
    }

    /// Value-copy read.
    pub fn get(&self, drone_id: &DroneId) -> Option<DroneState> {
        self.states.get(drone_id).map(|entry| entry.value().clone())
    }

    pub fn drone_ids(&self) -> Vec<DroneId> {
        self.states.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Subscribe to post-commit change notifications. Delivery is best-effort:
    /// a lagging subscriber loses the oldest events, never the writers.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notify.subscribe()
    }

    fn publish_change(&self, drone_id: DroneId, old: Option<DroneState>, new: Option<DroneState>) {
        // send only fails when no subscriber exists, which is fine
        let _ = self.notify.send(StateChange { drone_id, old, new });
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Log helper used by the supervisor's notification task.
pub fn log_transition(change: &StateChange) {
    let Some(new) = &change.new else {
        return;
    };
    let Some(old) = &change.old else {
        return;
    };
    if old.link_status != new.link_status {
        warn!(
            drone_id = %change.drone_id,
            from = ?old.link_status,
            to = ?new.link_status,
            "Link status changed"
        );
    }
    if old.current_task_id != new.current_task_id {
        info!(
            drone_id = %change.drone_id,
            from = old.current_task_id.as_deref().unwrap_or("-"),
            to = new.current_task_id.as_deref().unwrap_or("-"),
            "Task changed"
        );
    }
}
