//! Per-UAV session: owns the adapter, pumps telemetry into the smoothing
//! filter and the state store, and serves value-copy snapshots.

pub mod error;

use std::sync::{Arc, Mutex};

use dashmap::{DashMap, Entry};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use self::error::SessionError;
use crate::config::DroneConfig;
use crate::drone_id::DroneId;
use crate::store::{LinkStatus, StateStore};
use crate::telemetry::smoothing::KinematicsFilter;
use crate::telemetry::{FlightMode, Position, Snapshot};
use crate::uav::client::UavClient;
use crate::uav::{RawAttitude, RawBattery, RawGpsInfo, RawPosition, RawVelocity};

/// Mutable telemetry view maintained by the pump.
#[derive(Debug)]
struct SessionShared {
    filter: KinematicsFilter,
    last_good_position: Option<Position>,
    fix_valid: bool,
    battery_pct: Option<f64>,
    battery_voltage_v: Option<f64>,
    armed: bool,
    gps_fix_type: Option<u8>,
    flight_mode: FlightMode,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            filter: KinematicsFilter::default(),
            last_good_position: None,
            fix_valid: false,
            battery_pct: None,
            battery_voltage_v: None,
            armed: false,
            gps_fix_type: None,
            flight_mode: FlightMode::Unknown,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            position: self.last_good_position,
            fix_valid: self.fix_valid,
            velocity: self.filter.velocity(),
            heading_deg: self.filter.heading_deg(),
            speed_mps: self.filter.speed_mps(),
            battery_pct: self.battery_pct,
            battery_voltage_v: self.battery_voltage_v,
            armed: self.armed,
            gps_fix_type: self.gps_fix_type,
            flight_mode: self.flight_mode,
            taken_at: tokio::time::Instant::now(),
        }
    }
}

pub struct DroneSession {
    config: DroneConfig,
    drone_id: DroneId,
    client: UavClient,
    store: Arc<StateStore>,
    shared: Arc<Mutex<SessionShared>>,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DroneSession {
    pub fn new(config: DroneConfig, client: UavClient, store: Arc<StateStore>) -> Self {
        let drone_id = DroneId::from(config.id.as_str());
        Self {
            config,
            drone_id,
            client,
            store,
            shared: Arc::new(Mutex::new(SessionShared::new())),
            pump: Mutex::new(None),
        }
    }

    pub fn drone_id(&self) -> &DroneId {
        &self.drone_id
    }

    pub fn config(&self) -> &DroneConfig {
        &self.config
    }

    /// Flight command surface for executors. Borrowed for the duration of one
    /// execute call.
    pub fn client(&self) -> &UavClient {
        &self.client
    }

    /// Connect the adapter and install the telemetry subscribers.
    pub async fn start(&self) -> Result<(), SessionError> {
        if let Err(source) = self.client.connect().await {
            error!(drone_id = %self.drone_id, error = %source, "Session start failed");
            let _ = self.store.set_link_status(&self.drone_id, LinkStatus::Error);
            return Err(SessionError::StartFailed {
                drone_id: self.drone_id.clone(),
                source,
            });
        }

        let _ = self
            .store
            .set_link_status(&self.drone_id, LinkStatus::Connected);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_pump(
            self.drone_id.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.store),
            PumpInputs {
                positions: self.client.positions(),
                velocities: self.client.velocities(),
                attitudes: self.client.attitudes(),
                gps_infos: self.client.gps_infos(),
                batteries: self.client.batteries(),
                armed: self.client.armed_states(),
                modes: self.client.flight_modes(),
            },
            cancel.clone(),
        ));

        let mut pump = self.pump.lock().expect("pump lock poisoned");
        *pump = Some((cancel, handle));
        info!(drone_id = %self.drone_id, "Session started");
        Ok(())
    }

    /// Idempotent: cancels the subscribers before closing the adapter.
    pub async fn stop(&self) {
        let running = self.pump.lock().expect("pump lock poisoned").take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            let _ = handle.await;
        }
        self.client.disconnect().await;
        let _ = self
            .store
            .set_link_status(&self.drone_id, LinkStatus::Disconnected);
        info!(drone_id = %self.drone_id, "Session stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Reopen a dropped link; the pump keeps running across reconnects since
    /// the watch channels survive.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.client
            .reconnect()
            .await
            .map_err(|source| SessionError::StartFailed {
                drone_id: self.drone_id.clone(),
                source,
            })?;
        let _ = self
            .store
            .set_link_status(&self.drone_id, LinkStatus::Connected);
        Ok(())
    }

    /// Value-copy snapshot per the session contract: position is the current
    /// valid fix, else the last-known-good one, else absent.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.lock().expect("session lock poisoned").snapshot()
    }
}

struct PumpInputs {
    positions: tokio::sync::watch::Receiver<Option<RawPosition>>,
    velocities: tokio::sync::watch::Receiver<Option<RawVelocity>>,
    attitudes: tokio::sync::watch::Receiver<Option<RawAttitude>>,
    gps_infos: tokio::sync::watch::Receiver<Option<RawGpsInfo>>,
    batteries: tokio::sync::watch::Receiver<Option<RawBattery>>,
    armed: tokio::sync::watch::Receiver<bool>,
    modes: tokio::sync::watch::Receiver<FlightMode>,
}

enum PumpEvent {
    Position(RawPosition),
    Velocity(RawVelocity),
    Attitude(RawAttitude),
    Gps(RawGpsInfo),
    Battery(RawBattery),
    Armed(bool),
    Mode(FlightMode),
}

async fn run_pump(
    drone_id: DroneId,
    shared: Arc<Mutex<SessionShared>>,
    store: Arc<StateStore>,
    inputs: PumpInputs,
    cancel: CancellationToken,
) {
    let mut positions = WatchStream::new(inputs.positions);
    let mut velocities = WatchStream::new(inputs.velocities);
    let mut attitudes = WatchStream::new(inputs.attitudes);
    let mut gps_infos = WatchStream::new(inputs.gps_infos);
    let mut batteries = WatchStream::new(inputs.batteries);
    let mut armed = WatchStream::new(inputs.armed);
    let mut modes = WatchStream::new(inputs.modes);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(raw) = positions.next() => raw.map(PumpEvent::Position),
            Some(raw) = velocities.next() => raw.map(PumpEvent::Velocity),
            Some(raw) = attitudes.next() => raw.map(PumpEvent::Attitude),
            Some(raw) = gps_infos.next() => raw.map(PumpEvent::Gps),
            Some(raw) = batteries.next() => raw.map(PumpEvent::Battery),
            Some(state) = armed.next() => Some(PumpEvent::Armed(state)),
            Some(mode) = modes.next() => Some(PumpEvent::Mode(mode)),
            else => break,
        };

        let snapshot = {
            let mut view = shared.lock().expect("session lock poisoned");
            if let Some(event) = event {
                apply_event(&mut view, event);
            }
            view.snapshot()
        };
        let _ = store.update_telemetry(&drone_id, &snapshot);
    }

    debug!(drone_id = %drone_id, "Telemetry pump stopped");
}

fn apply_event(view: &mut SessionShared, event: PumpEvent) {
    match event {
        PumpEvent::Position(raw) => apply_position(view, raw),
        PumpEvent::Velocity(raw) => {
            view.filter.update_velocity(crate::telemetry::VelocityNed {
                north_mps: raw.north_mps,
                east_mps: raw.east_mps,
                down_mps: raw.down_mps,
            });
        }
        PumpEvent::Attitude(raw) => view.filter.update_heading(raw.yaw_deg),
        PumpEvent::Gps(raw) => view.gps_fix_type = Some(raw.fix_type),
        PumpEvent::Battery(raw) => {
            view.battery_pct = Some(raw.remaining_pct);
            view.battery_voltage_v = Some(raw.voltage_v);
        }
        PumpEvent::Armed(state) => view.armed = state,
        PumpEvent::Mode(mode) => view.flight_mode = mode,
    }
}

fn apply_position(view: &mut SessionShared, raw: RawPosition) {
    let position = Position {
        latitude_deg: raw.latitude_deg,
        longitude_deg: raw.longitude_deg,
        altitude_agl_m: raw.relative_altitude_m,
        altitude_amsl_m: raw.absolute_altitude_m,
    };
    if position.is_valid() {
        view.last_good_position = Some(position);
        view.fix_valid = true;
    } else {
        // Keep the cached fix; mark the stream degraded
        view.fix_valid = false;
    }
}

/// Registry of live sessions keyed by drone id.
#[derive(Default)]
pub struct SessionMap {
    sessions: DashMap<DroneId, Arc<DroneSession>, ahash::RandomState>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<DroneSession>) -> Result<(), SessionError> {
        match self.sessions.entry(session.drone_id().clone()) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyRegistered {
                drone_id: entry.key().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn remove(&self, drone_id: &DroneId) -> Result<Arc<DroneSession>, SessionError> {
        self.sessions
            .remove(drone_id)
            .map(|(_, session)| session)
            .ok_or_else(|| SessionError::NotRegistered {
                drone_id: drone_id.clone(),
            })
    }

    pub fn get(&self, drone_id: &DroneId) -> Option<Arc<DroneSession>> {
        self.sessions.get(drone_id).map(|entry| Arc::clone(&entry))
    }

    pub fn contains(&self, drone_id: &DroneId) -> bool {
        self.sessions.contains_key(drone_id)
    }

    pub fn drone_ids(&self) -> Vec<DroneId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn all(&self) -> Vec<Arc<DroneSession>> {
        self.sessions.iter().map(|e| Arc::clone(&e)).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uav::sim::{SimConfig, SimLink};
    use std::time::Duration;

    fn sim_session() -> (Arc<DroneSession>, crate::uav::sim::SimHandle, Arc<StateStore>) {
        let config = DroneConfig::builder()
            .id("sitl-drone-1".to_string())
            .connection_string("udp://:14550".to_string())
            .build();
        let link = Arc::new(SimLink::new(
            SimConfig::builder()
                .connection_string(config.connection_string.clone())
                .tick(Duration::from_millis(5))
                .build(),
        ));
        let handle = link.handle();
        let client = UavClient::new(DroneId::from(config.id.as_str()), link);
        let store = Arc::new(StateStore::new());
        store.register(DroneId::from(config.id.as_str()), &config.connection_string);
        (
            Arc::new(DroneSession::new(config, client, Arc::clone(&store))),
            handle,
            store,
        )
    }

    async fn wait_valid_snapshot(session: &DroneSession) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if session.snapshot().position.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no valid position arrived");
    }

    #[tokio::test]
    async fn test_snapshot_carries_first_valid_fix() {
        let (session, _handle, store) = sim_session();
        session.start().await.unwrap();
        wait_valid_snapshot(&session).await;

        let snapshot = session.snapshot();
        assert!(snapshot.fix_valid);
        let position = snapshot.position.unwrap();
        assert!(position.is_valid());

        // Pump also feeds the store
        let state = store.get(session.drone_id()).unwrap();
        assert!(state.position.is_some());
        assert_eq!(state.link_status, LinkStatus::Connected);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_fix_falls_back_to_cache() {
        let (session, handle, _store) = sim_session();
        session.start().await.unwrap();
        wait_valid_snapshot(&session).await;
        let cached = session.snapshot().position.unwrap();

        handle.set_invalid_position(true);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = session.snapshot();
        assert!(!snapshot.fix_valid, "0/0 fix must degrade the snapshot");
        let position = snapshot.position.expect("cache lost");
        assert_eq!(position.latitude_deg, cached.latitude_deg);
        assert_eq!(position.longitude_deg, cached.longitude_deg);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_hover_speed_deadbands_to_zero() {
        let (session, _handle, _store) = sim_session();
        session.start().await.unwrap();
        wait_valid_snapshot(&session).await;

        // Vehicle is parked; after a stream of zero-velocity ticks the
        // published speed must be exactly zero
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.snapshot().speed_mps, 0.0);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (session, _handle, _store) = sim_session();
        session.start().await.unwrap();
        session.stop().await;
        session.stop().await;
        assert!(!session.is_connected());
    }

    #[test]
    fn test_session_map_rejects_duplicates() {
        let (session, _handle, _store) = {
            // Build without a runtime; nothing is started here
            let config = DroneConfig::builder()
                .id("drone-1".to_string())
                .connection_string("udp://:14550".to_string())
                .build();
            let link = Arc::new(SimLink::new(
                SimConfig::builder()
                    .connection_string("udp://:14550".to_string())
                    .build(),
            ));
            let handle = link.handle();
            let store = Arc::new(StateStore::new());
            let client = UavClient::new(DroneId::from("drone-1"), link);
            (
                Arc::new(DroneSession::new(config, client, store.clone())),
                handle,
                store,
            )
        };

        let map = SessionMap::new();
        map.insert(Arc::clone(&session)).unwrap();
        assert!(map.insert(session).is_err());
        assert_eq!(map.len(), 1);

        let removed = map.remove(&DroneId::from("drone-1")).unwrap();
        assert_eq!(removed.drone_id().as_str(), "drone-1");
        assert!(map.remove(&DroneId::from("drone-1")).is_err());
    }
}
