//! Simulated flight link.
//!
//! Stands in for the external MAVLink library in simulated builds and tests:
//! a simple kinematic vehicle that climbs, flies toward goto targets at a
//! bounded speed, and mirrors autopilot quirks the adapter has to handle
//! (rejection of disarm when already disarmed, auto-disarm after landing).
//! A [`SimHandle`] injects faults such as degraded GPS or a frozen climb.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::error::LinkError;
use super::{
    FlightLink, LandedState, LinkHealth, RawAttitude, RawBattery, RawGpsInfo, RawPosition,
    RawVelocity,
};
use crate::telemetry::FlightMode;

/// Base coordinates of the simulated field; vehicles spawn east of it, spaced
/// by the UDP port offset the same way a SITL swarm is brought up.
const HOME_LAT_DEG: f64 = 47.397742;
const HOME_LON_DEG: f64 = 8.545594;
const BASE_UDP_PORT: u16 = 14540;
const SPAWN_SPACING_DEG: f64 = 1.0e-4;

/// Above this height the vehicle counts as airborne.
const IN_AIR_THRESHOLD_M: f64 = 0.5;

#[derive(Debug, Clone, Builder)]
pub struct SimConfig {
    pub connection_string: String,
    #[builder(default = 12.0)]
    pub max_speed_mps: f64,
    #[builder(default = 4.0)]
    pub climb_rate_mps: f64,
    #[builder(default = Duration::from_millis(50))]
    pub tick: Duration,
    #[builder(default = 500.0)]
    pub ground_amsl_m: f64,
}

#[derive(Debug, Clone, Copy)]
struct Target {
    latitude_deg: f64,
    longitude_deg: f64,
    altitude_agl_m: f64,
}

#[derive(Debug)]
struct SimState {
    latitude_deg: f64,
    longitude_deg: f64,
    altitude_agl_m: f64,
    yaw_deg: f64,
    velocity: RawVelocity,
    armed: bool,
    mode: FlightMode,
    landed: LandedState,
    target: Option<Target>,
    takeoff_altitude_m: f64,

    // Fault injection
    gps_fix_type: u8,
    invalid_position: bool,
    takeoff_rejections: u32,
    freeze_climb: bool,
    battery_pct: f64,
}

struct Channels {
    connection: watch::Sender<bool>,
    health: watch::Sender<LinkHealth>,
    position: watch::Sender<Option<RawPosition>>,
    velocity: watch::Sender<Option<RawVelocity>>,
    attitude: watch::Sender<Option<RawAttitude>>,
    gps: watch::Sender<Option<RawGpsInfo>>,
    battery: watch::Sender<Option<RawBattery>>,
    armed: watch::Sender<bool>,
    mode: watch::Sender<FlightMode>,
    landed: watch::Sender<LandedState>,
}

pub struct SimLink {
    config: SimConfig,
    vehicle_uid: Uuid,
    state: Arc<Mutex<SimState>>,
    channels: Arc<Channels>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl SimLink {
    pub fn new(config: SimConfig) -> Self {
        let spawn_index = spawn_index(&config.connection_string);
        let state = SimState {
            latitude_deg: HOME_LAT_DEG,
            longitude_deg: HOME_LON_DEG + spawn_index as f64 * SPAWN_SPACING_DEG,
            altitude_agl_m: 0.0,
            yaw_deg: 0.0,
            velocity: RawVelocity::default(),
            armed: false,
            mode: FlightMode::Unknown,
            landed: LandedState::OnGround,
            target: None,
            takeoff_altitude_m: 10.0,
            gps_fix_type: 4,
            invalid_position: false,
            takeoff_rejections: 0,
            freeze_climb: false,
            battery_pct: 100.0,
        };

        let channels = Channels {
            connection: watch::channel(false).0,
            health: watch::channel(LinkHealth::default()).0,
            position: watch::channel(None).0,
            velocity: watch::channel(None).0,
            attitude: watch::channel(None).0,
            gps: watch::channel(None).0,
            battery: watch::channel(None).0,
            armed: watch::channel(false).0,
            mode: watch::channel(FlightMode::Unknown).0,
            landed: watch::channel(LandedState::OnGround).0,
        };

        Self {
            config,
            vehicle_uid: Uuid::new_v4(),
            state: Arc::new(Mutex::new(state)),
            channels: Arc::new(channels),
            ticker: Mutex::new(None),
        }
    }

    /// Handle for test-side fault injection and vehicle manipulation.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn ensure_connected(&self) -> Result<(), LinkError> {
        if *self.channels.connection.borrow() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock poisoned")
    }
}

#[async_trait]
impl FlightLink for SimLink {
    async fn connect(&self) -> Result<(), LinkError> {
        let mut ticker = self.ticker.lock().expect("ticker lock poisoned");
        if ticker.is_some() {
            return Ok(());
        }

        info!(
            vehicle_uid = %self.vehicle_uid,
            connection = %self.config.connection_string,
            "Simulated vehicle online"
        );
        self.channels.connection.send_replace(true);
        self.channels.health.send_replace(LinkHealth {
            global_position_ok: true,
            home_position_ok: true,
        });

        let cancel = CancellationToken::new();
        tokio::spawn(run_physics(
            Arc::clone(&self.state),
            Arc::clone(&self.channels),
            self.config.clone(),
            cancel.clone(),
        ));
        *ticker = Some(cancel);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(cancel) = self.ticker.lock().expect("ticker lock poisoned").take() {
            cancel.cancel();
        }
        self.channels.connection.send_replace(false);
    }

    async fn set_rate_position(&self, _hz: f64) -> Result<(), LinkError> {
        Ok(())
    }
    async fn set_rate_velocity(&self, _hz: f64) -> Result<(), LinkError> {
        Ok(())
    }
    async fn set_rate_attitude(&self, _hz: f64) -> Result<(), LinkError> {
        Ok(())
    }
    async fn set_rate_gps(&self, _hz: f64) -> Result<(), LinkError> {
        Ok(())
    }
    async fn set_rate_battery(&self, _hz: f64) -> Result<(), LinkError> {
        Ok(())
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.lock().armed = true;
        Ok(())
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        if !state.armed {
            // ArduPilot NAKs a disarm when the vehicle is already disarmed.
            return Err(LinkError::CommandRejected("already disarmed".into()));
        }
        if state.altitude_agl_m > IN_AIR_THRESHOLD_M {
            return Err(LinkError::CommandRejected("vehicle in air".into()));
        }
        state.armed = false;
        Ok(())
    }

    async fn set_takeoff_altitude(&self, altitude_agl_m: f64) -> Result<(), LinkError> {
        self.ensure_connected()?;
        self.lock().takeoff_altitude_m = altitude_agl_m;
        Ok(())
    }

    async fn takeoff(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        if state.takeoff_rejections > 0 {
            state.takeoff_rejections -= 1;
            return Err(LinkError::CommandRejected("takeoff rejected".into()));
        }
        if !state.armed {
            return Err(LinkError::CommandRejected("not armed".into()));
        }
        state.mode = FlightMode::Takeoff;
        state.landed = LandedState::TakingOff;
        state.target = Some(Target {
            latitude_deg: state.latitude_deg,
            longitude_deg: state.longitude_deg,
            altitude_agl_m: state.takeoff_altitude_m,
        });
        Ok(())
    }

    async fn land(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        state.mode = FlightMode::Land;
        state.landed = LandedState::Landing;
        state.target = Some(Target {
            latitude_deg: state.latitude_deg,
            longitude_deg: state.longitude_deg,
            altitude_agl_m: 0.0,
        });
        Ok(())
    }

    async fn return_to_launch(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let spawn_index = spawn_index(&self.config.connection_string);
        let mut state = self.lock();
        state.mode = FlightMode::ReturnToLaunch;
        state.target = Some(Target {
            latitude_deg: HOME_LAT_DEG,
            longitude_deg: HOME_LON_DEG + spawn_index as f64 * SPAWN_SPACING_DEG,
            altitude_agl_m: 0.0,
        });
        Ok(())
    }

    async fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_amsl_m: f64,
        _yaw_deg: f64,
    ) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        if !state.armed {
            return Err(LinkError::CommandRejected("not armed".into()));
        }
        state.mode = FlightMode::Guided;
        state.target = Some(Target {
            latitude_deg,
            longitude_deg,
            altitude_agl_m: altitude_amsl_m - self.config.ground_amsl_m,
        });
        Ok(())
    }

    async fn hold(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        let mut state = self.lock();
        state.target = None;
        state.mode = FlightMode::Hold;
        Ok(())
    }

    async fn release_payload(&self) -> Result<(), LinkError> {
        self.ensure_connected()?;
        debug!(vehicle_uid = %self.vehicle_uid, "Simulated payload release");
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.channels.connection.subscribe()
    }
    fn health(&self) -> watch::Receiver<LinkHealth> {
        self.channels.health.subscribe()
    }
    fn position(&self) -> watch::Receiver<Option<RawPosition>> {
        self.channels.position.subscribe()
    }
    fn velocity_ned(&self) -> watch::Receiver<Option<RawVelocity>> {
        self.channels.velocity.subscribe()
    }
    fn attitude(&self) -> watch::Receiver<Option<RawAttitude>> {
        self.channels.attitude.subscribe()
    }
    fn gps_info(&self) -> watch::Receiver<Option<RawGpsInfo>> {
        self.channels.gps.subscribe()
    }
    fn battery(&self) -> watch::Receiver<Option<RawBattery>> {
        self.channels.battery.subscribe()
    }
    fn armed(&self) -> watch::Receiver<bool> {
        self.channels.armed.subscribe()
    }
    fn flight_mode(&self) -> watch::Receiver<FlightMode> {
        self.channels.mode.subscribe()
    }
    fn landed_state(&self) -> watch::Receiver<LandedState> {
        self.channels.landed.subscribe()
    }
}

/// Test-side control over a simulated vehicle.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock poisoned")
    }

    pub fn set_gps_fix(&self, fix_type: u8) {
        self.lock().gps_fix_type = fix_type;
    }

    /// Make the position stream emit 0/0 coordinates, as some stacks do
    /// before the first GPS solution.
    pub fn set_invalid_position(&self, on: bool) {
        self.lock().invalid_position = on;
    }

    /// NAK the next `n` takeoff commands.
    pub fn reject_next_takeoffs(&self, n: u32) {
        self.lock().takeoff_rejections = n;
    }

    /// Stop the vehicle from climbing without rejecting commands.
    pub fn set_freeze_climb(&self, on: bool) {
        self.lock().freeze_climb = on;
    }

    /// Simulate an in-flight disarm (failsafe, kill switch).
    pub fn force_disarm(&self) {
        let mut state = self.lock();
        state.armed = false;
        state.target = None;
    }

    pub fn set_battery_pct(&self, pct: f64) {
        self.lock().battery_pct = pct;
    }

    pub fn teleport(&self, latitude_deg: f64, longitude_deg: f64, altitude_agl_m: f64) {
        let mut state = self.lock();
        state.latitude_deg = latitude_deg;
        state.longitude_deg = longitude_deg;
        state.altitude_agl_m = altitude_agl_m;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed
    }

    pub fn flight_mode(&self) -> FlightMode {
        self.lock().mode
    }
}

async fn run_physics(
    state: Arc<Mutex<SimState>>,
    channels: Arc<Channels>,
    config: SimConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.tick);
    let dt = config.tick.as_secs_f64();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let outputs = {
            let mut s = state.lock().expect("sim state lock poisoned");
            step(&mut s, &config, dt);
            Outputs {
                position: if s.invalid_position {
                    RawPosition {
                        latitude_deg: 0.0,
                        longitude_deg: 0.0,
                        relative_altitude_m: s.altitude_agl_m,
                        absolute_altitude_m: config.ground_amsl_m + s.altitude_agl_m,
                    }
                } else {
                    RawPosition {
                        latitude_deg: s.latitude_deg,
                        longitude_deg: s.longitude_deg,
                        relative_altitude_m: s.altitude_agl_m,
                        absolute_altitude_m: config.ground_amsl_m + s.altitude_agl_m,
                    }
                },
                velocity: s.velocity,
                yaw_deg: s.yaw_deg,
                gps_fix_type: s.gps_fix_type,
                battery_pct: s.battery_pct,
                armed: s.armed,
                mode: s.mode,
                landed: s.landed,
            }
        };

        channels.position.send_replace(Some(outputs.position));
        channels.velocity.send_replace(Some(outputs.velocity));
        channels.attitude.send_replace(Some(RawAttitude {
            roll_deg: 0.0,
            pitch_deg: 0.0,
            yaw_deg: outputs.yaw_deg,
        }));
        channels.gps.send_replace(Some(RawGpsInfo {
            fix_type: outputs.gps_fix_type,
            num_satellites: 12,
        }));
        channels.battery.send_replace(Some(RawBattery {
            remaining_pct: outputs.battery_pct,
            voltage_v: 12.6,
        }));
        channels.armed.send_replace(outputs.armed);
        channels.mode.send_replace(outputs.mode);
        channels.landed.send_replace(outputs.landed);
    }
}

struct Outputs {
    position: RawPosition,
    velocity: RawVelocity,
    yaw_deg: f64,
    gps_fix_type: u8,
    battery_pct: f64,
    armed: bool,
    mode: FlightMode,
    landed: LandedState,
}

fn step(s: &mut SimState, config: &SimConfig, dt: f64) {
    let Some(target) = s.target else {
        s.velocity = RawVelocity::default();
        return;
    };

    if !s.armed {
        // Motors off mid-command: the vehicle stops producing motion.
        s.velocity = RawVelocity::default();
        return;
    }

    // Horizontal step toward the target at bounded ground speed.
    let cos_lat = s.latitude_deg.to_radians().cos();
    let d_north = (target.latitude_deg - s.latitude_deg) * 111_000.0;
    let d_east = (target.longitude_deg - s.longitude_deg) * 111_000.0 * cos_lat;
    let horizontal = (d_north * d_north + d_east * d_east).sqrt();
    let max_step = config.max_speed_mps * dt;

    let (step_north, step_east) = if horizontal <= max_step || horizontal == 0.0 {
        (d_north, d_east)
    } else {
        let scale = max_step / horizontal;
        (d_north * scale, d_east * scale)
    };
    s.latitude_deg += step_north / 111_000.0;
    if cos_lat != 0.0 {
        s.longitude_deg += step_east / (111_000.0 * cos_lat);
    }

    // Vertical step at climb rate, unless the climb is frozen.
    let d_alt = target.altitude_agl_m - s.altitude_agl_m;
    let climb_step = config.climb_rate_mps * dt;
    let step_alt = if s.freeze_climb && d_alt > 0.0 {
        0.0
    } else if d_alt.abs() <= climb_step {
        d_alt
    } else {
        climb_step * d_alt.signum()
    };
    s.altitude_agl_m += step_alt;

    s.velocity = RawVelocity {
        north_mps: step_north / dt,
        east_mps: step_east / dt,
        down_mps: -step_alt / dt,
    };
    if horizontal > 0.5 {
        s.yaw_deg = d_east.atan2(d_north).to_degrees();
    }

    let climbing_out = s.landed == LandedState::TakingOff
        && (s.altitude_agl_m - target.altitude_agl_m).abs() > 0.1;
    if s.altitude_agl_m > IN_AIR_THRESHOLD_M && s.landed != LandedState::Landing && !climbing_out {
        s.landed = LandedState::InAir;
    }

    let arrived = horizontal <= max_step && (target.altitude_agl_m - s.altitude_agl_m).abs() < 0.05;
    if arrived {
        s.target = None;
        s.velocity = RawVelocity::default();
        match s.mode {
            FlightMode::Land | FlightMode::ReturnToLaunch => {
                if s.altitude_agl_m <= IN_AIR_THRESHOLD_M {
                    s.landed = LandedState::OnGround;
                    // ArduPilot auto-disarms after landing.
                    s.armed = false;
                    s.mode = FlightMode::Hold;
                }
            }
            FlightMode::Takeoff => {
                s.landed = LandedState::InAir;
                s.mode = FlightMode::Hold;
            }
            _ => {}
        }
    }
}

/// Vehicles are spaced by the UDP port offset from the base SITL port, the
/// same layout a swarm bring-up produces.
fn spawn_index(connection_string: &str) -> u16 {
    let port = Url::parse(connection_string)
        .ok()
        .and_then(|url| url.port())
        .or_else(|| {
            connection_string
                .rsplit(':')
                .next()
                .and_then(|p| p.parse().ok())
        });
    match port {
        Some(p) if p > BASE_UDP_PORT => (p - BASE_UDP_PORT) / 10,
        _ => 0,
    }
}
