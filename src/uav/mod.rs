//! UAV flight-control surface.
//!
//! [`FlightLink`] mirrors the external MAVLink-library contract: typed
//! commands plus watch-channel telemetry streams. [`client::UavClient`] layers
//! the operational protocols (connect health gates, takeoff ladder, AGL
//! conversions) on top of any link implementation. [`sim::SimLink`] is the
//! in-process implementation used for simulated builds and tests.

pub mod client;
pub mod error;
pub mod sim;

use async_trait::async_trait;
use tokio::sync::watch;

use self::error::LinkError;
use crate::telemetry::FlightMode;

/// Raw global position as streamed by the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawPosition {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub relative_altitude_m: f64,
    pub absolute_altitude_m: f64,
}

/// Raw NED velocity sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawVelocity {
    pub north_mps: f64,
    pub east_mps: f64,
    pub down_mps: f64,
}

/// Euler attitude; yaw is reported in [-180, 180] and normalized downstream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawAttitude {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawGpsInfo {
    /// 0 = none, 2 = 2D, 3 = 3D, 4 = DGPS, 5/6 = RTK.
    pub fix_type: u8,
    pub num_satellites: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawBattery {
    pub remaining_pct: f64,
    pub voltage_v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LandedState {
    #[default]
    Unknown,
    OnGround,
    TakingOff,
    InAir,
    Landing,
}

/// Autopilot health gates required before flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkHealth {
    pub global_position_ok: bool,
    pub home_position_ok: bool,
}

/// Contract of the underlying flight-control library for a single vehicle.
///
/// Commands resolve once the autopilot acknowledges them; convergence (reaching
/// an altitude or a location) is observed through the telemetry streams, not
/// through command completion.
#[async_trait]
pub trait FlightLink: Send + Sync {
    /// Open the transport. Does not wait for vehicle health; see
    /// [`client::UavClient::connect`] for the full gate sequence.
    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self);

    /// Request a telemetry stream rate in Hz. Links that cannot honor the rate
    /// keep streaming at whatever the transport provides.
    async fn set_rate_position(&self, hz: f64) -> Result<(), LinkError>;
    async fn set_rate_velocity(&self, hz: f64) -> Result<(), LinkError>;
    async fn set_rate_attitude(&self, hz: f64) -> Result<(), LinkError>;
    async fn set_rate_gps(&self, hz: f64) -> Result<(), LinkError>;
    async fn set_rate_battery(&self, hz: f64) -> Result<(), LinkError>;

    async fn arm(&self) -> Result<(), LinkError>;
    async fn disarm(&self) -> Result<(), LinkError>;
    async fn set_takeoff_altitude(&self, altitude_agl_m: f64) -> Result<(), LinkError>;
    async fn takeoff(&self) -> Result<(), LinkError>;
    async fn land(&self) -> Result<(), LinkError>;
    async fn return_to_launch(&self) -> Result<(), LinkError>;
    /// Altitude here is AMSL; AGL conversion happens in the adapter.
    async fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_amsl_m: f64,
        yaw_deg: f64,
    ) -> Result<(), LinkError>;
    async fn hold(&self) -> Result<(), LinkError>;
    /// Payload release actuator. Simulated links log and succeed.
    async fn release_payload(&self) -> Result<(), LinkError>;

    fn connection_state(&self) -> watch::Receiver<bool>;
    fn health(&self) -> watch::Receiver<LinkHealth>;
    fn position(&self) -> watch::Receiver<Option<RawPosition>>;
    fn velocity_ned(&self) -> watch::Receiver<Option<RawVelocity>>;
    fn attitude(&self) -> watch::Receiver<Option<RawAttitude>>;
    fn gps_info(&self) -> watch::Receiver<Option<RawGpsInfo>>;
    fn battery(&self) -> watch::Receiver<Option<RawBattery>>;
    fn armed(&self) -> watch::Receiver<bool>;
    fn flight_mode(&self) -> watch::Receiver<FlightMode>;
    fn landed_state(&self) -> watch::Receiver<LandedState>;
}
