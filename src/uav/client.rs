//! Adapter over a [`FlightLink`] implementing the operational flight
//! protocols: gated connect, idempotent disarm, the takeoff ladder with a
//! guided-climb fallback, and AGL-referenced goto with convergence checking.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::error::{LinkError, UavError};
use super::{FlightLink, LandedState, RawPosition};
use crate::drone_id::DroneId;
use crate::telemetry::{FlightMode, geo};

/// Horizontal and vertical tolerance for goto convergence.
const GOTO_TOLERANCE_M: f64 = 2.0;

/// Fraction of the target altitude that counts as a completed takeoff.
const TAKEOFF_REACHED_FRACTION: f64 = 0.95;

/// Relaxed fraction accepted from the guided-climb fallback.
const GUIDED_CLIMB_FRACTION: f64 = 0.90;

/// Wait bounds for the adapter protocols. Defaults match multirotor firmware
/// behavior; tests compress them.
#[derive(Debug, Clone, Builder)]
pub struct UavTimings {
    #[builder(default = 3)]
    pub connect_attempts: u32,
    #[builder(default = Duration::from_secs(2))]
    pub connect_retry_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub connect_wait: Duration,
    /// EKF/mode settle time after arming, before takeoff.
    #[builder(default = Duration::from_millis(1500))]
    pub arm_settle: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub takeoff_mode_wait: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub climb_wait: Duration,
    #[builder(default = Duration::from_secs(2))]
    pub takeoff_retry_delay: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub land_wait: Duration,
}

impl Default for UavTimings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Typed command-and-telemetry handle for one vehicle.
pub struct UavClient {
    drone_id: DroneId,
    link: Arc<dyn FlightLink>,
    timings: UavTimings,
}

impl UavClient {
    pub fn new(drone_id: DroneId, link: Arc<dyn FlightLink>) -> Self {
        Self::with_timings(drone_id, link, UavTimings::default())
    }

    pub fn with_timings(drone_id: DroneId, link: Arc<dyn FlightLink>, timings: UavTimings) -> Self {
        Self {
            drone_id,
            link,
            timings,
        }
    }

    pub fn drone_id(&self) -> &DroneId {
        &self.drone_id
    }

    /// Open the link, wait for the connection-state stream and the
    /// global/home position health gates, then request stream rates.
    pub async fn connect(&self) -> Result<(), UavError> {
        let mut last_err: Option<LinkError> = None;
        for attempt in 1..=self.timings.connect_attempts {
            match self.link.connect().await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!(
                        drone_id = %self.drone_id,
                        attempt,
                        error = %err,
                        "Link connect attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < self.timings.connect_attempts {
                        sleep(self.timings.connect_retry_delay).await;
                    }
                }
            }
        }
        if let Some(err) = last_err {
            return Err(err.into());
        }

        let mut connected = self.link.connection_state();
        wait_watch(&mut connected, "connection", self.timings.connect_wait, |up| {
            *up
        })
        .await?;

        let mut health = self.link.health();
        wait_watch(&mut health, "position health", self.timings.connect_wait, |h| {
            h.global_position_ok && h.home_position_ok
        })
        .await?;

        info!(drone_id = %self.drone_id, "Vehicle connected with global position");

        // Faster telemetry keeps published motion responsive; links that
        // cannot honor a rate keep streaming at their native cadence.
        let _ = self.link.set_rate_position(5.0).await;
        let _ = self.link.set_rate_velocity(5.0).await;
        let _ = self.link.set_rate_attitude(5.0).await;
        let _ = self.link.set_rate_gps(1.0).await;
        let _ = self.link.set_rate_battery(1.0).await;

        Ok(())
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await;
        info!(drone_id = %self.drone_id, "Link closed");
    }

    /// Close and reopen the link after a short pause.
    pub async fn reconnect(&self) -> Result<(), UavError> {
        self.disconnect().await;
        sleep(self.timings.connect_retry_delay).await;
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        *self.link.connection_state().borrow()
    }

    pub async fn arm(&self) -> Result<(), UavError> {
        self.link.arm().await?;
        info!(drone_id = %self.drone_id, "Armed");
        Ok(())
    }

    /// Disarm, treating "already disarmed" rejections as success so shutdown
    /// sequences stay idempotent.
    pub async fn disarm(&self) -> Result<(), UavError> {
        match self.link.disarm().await {
            Ok(()) => {
                info!(drone_id = %self.drone_id, "Disarmed");
                Ok(())
            }
            Err(err) => {
                if !*self.link.armed().borrow() {
                    debug!(
                        drone_id = %self.drone_id,
                        "Disarm command rejected but vehicle is already disarmed"
                    );
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Takeoff to `altitude_agl_m`: arm if needed, command takeoff, wait for
    /// the mode transition and the climb. One retry, then a guided climb to
    /// the same height as fallback.
    pub async fn takeoff(&self, altitude_agl_m: f64) -> Result<(), UavError> {
        if !*self.link.armed().borrow() {
            self.arm().await?;
        }
        sleep(self.timings.arm_settle).await;

        self.link.set_takeoff_altitude(altitude_agl_m).await?;

        if self.takeoff_attempt(altitude_agl_m).await? {
            return Ok(());
        }

        info!(drone_id = %self.drone_id, "Retrying takeoff");
        sleep(self.timings.takeoff_retry_delay).await;
        if self.takeoff_attempt(altitude_agl_m).await? {
            return Ok(());
        }

        // Guided climb: command a goto at the current coordinates, raised by
        // the requested height. Accepts a slightly lower ceiling.
        let origin = self.current_position().ok_or(UavError::NoPosition)?;
        let target_amsl = origin.absolute_altitude_m + altitude_agl_m;
        info!(
            drone_id = %self.drone_id,
            target_amsl_m = format_args!("{target_amsl:.1}"),
            "Falling back to guided climb"
        );
        self.link
            .goto_location(
                origin.latitude_deg,
                origin.longitude_deg,
                target_amsl,
                0.0,
            )
            .await?;

        let mut position = self.link.position();
        let threshold = altitude_agl_m * GUIDED_CLIMB_FRACTION;
        match wait_watch(&mut position, "guided climb", self.timings.climb_wait, |p| {
            p.is_some_and(|p| p.relative_altitude_m >= threshold)
        })
        .await
        {
            Ok(()) => {
                info!(drone_id = %self.drone_id, "Guided climb reached target band");
                Ok(())
            }
            Err(UavError::Timeout(_)) => Err(UavError::TakeoffFailed),
            Err(err) => Err(err),
        }
    }

    async fn takeoff_attempt(&self, altitude_agl_m: f64) -> Result<bool, UavError> {
        if let Err(err) = self.link.takeoff().await {
            warn!(drone_id = %self.drone_id, error = %err, "Takeoff command rejected");
            return Ok(false);
        }

        // The mode switch can lag; a missed transition is not fatal as long as
        // the climb itself happens.
        let mut mode = self.link.flight_mode();
        let _ = wait_watch(&mut mode, "takeoff mode", self.timings.takeoff_mode_wait, |m| {
            *m == FlightMode::Takeoff
        })
        .await;

        let mut position = self.link.position();
        let threshold = altitude_agl_m * TAKEOFF_REACHED_FRACTION;
        match wait_watch(&mut position, "takeoff climb", self.timings.climb_wait, |p| {
            p.is_some_and(|p| p.relative_altitude_m >= threshold)
        })
        .await
        {
            Ok(()) => {
                info!(drone_id = %self.drone_id, "Takeoff complete");
                Ok(true)
            }
            Err(UavError::Timeout(_)) => {
                warn!(drone_id = %self.drone_id, "Takeoff timed out short of target altitude");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Fly to the coordinates at `altitude_agl_m` above ground. The AMSL
    /// altitude sent to the autopilot is derived from the current
    /// (absolute − relative) baseline. Resolves once within 2 m horizontally
    /// and vertically; convergence is drone-controlled and uncapped.
    pub async fn goto_location(
        &self,
        latitude_deg: f64,
        longitude_deg: f64,
        altitude_agl_m: f64,
    ) -> Result<(), UavError> {
        let current = self.current_position().ok_or(UavError::NoPosition)?;
        let ground_amsl = current.absolute_altitude_m - current.relative_altitude_m;
        let target_amsl = ground_amsl + altitude_agl_m;

        self.link
            .goto_location(latitude_deg, longitude_deg, target_amsl, 0.0)
            .await?;

        let mut position = self.link.position();
        loop {
            let reached = position.borrow_and_update().is_some_and(|p| {
                let horizontal = geo::haversine_m(
                    p.latitude_deg,
                    p.longitude_deg,
                    latitude_deg,
                    longitude_deg,
                );
                let vertical = (p.relative_altitude_m - altitude_agl_m).abs();
                horizontal < GOTO_TOLERANCE_M && vertical < GOTO_TOLERANCE_M
            });
            if reached {
                debug!(drone_id = %self.drone_id, "Reached target position");
                return Ok(());
            }
            if position.changed().await.is_err() {
                return Err(LinkError::NotConnected.into());
            }
        }
    }

    /// Land and wait for touchdown.
    pub async fn land(&self) -> Result<(), UavError> {
        self.link.land().await?;
        let mut landed = self.link.landed_state();
        wait_watch(&mut landed, "touchdown", self.timings.land_wait, |s| {
            *s == LandedState::OnGround
        })
        .await?;
        info!(drone_id = %self.drone_id, "Landing complete");
        Ok(())
    }

    pub async fn return_to_launch(&self) -> Result<(), UavError> {
        self.link.return_to_launch().await?;
        info!(drone_id = %self.drone_id, "Returning to launch");
        Ok(())
    }

    pub async fn hold(&self) -> Result<(), UavError> {
        self.link.hold().await?;
        Ok(())
    }

    pub async fn release_payload(&self) -> Result<(), UavError> {
        self.link.release_payload().await?;
        info!(drone_id = %self.drone_id, "Payload release triggered");
        Ok(())
    }

    fn current_position(&self) -> Option<RawPosition> {
        *self.link.position().borrow()
    }

    // Stream handles consumed by the session pump.

    pub fn positions(&self) -> watch::Receiver<Option<RawPosition>> {
        self.link.position()
    }

    pub fn velocities(&self) -> watch::Receiver<Option<super::RawVelocity>> {
        self.link.velocity_ned()
    }

    pub fn attitudes(&self) -> watch::Receiver<Option<super::RawAttitude>> {
        self.link.attitude()
    }

    pub fn gps_infos(&self) -> watch::Receiver<Option<super::RawGpsInfo>> {
        self.link.gps_info()
    }

    pub fn batteries(&self) -> watch::Receiver<Option<super::RawBattery>> {
        self.link.battery()
    }

    pub fn armed_states(&self) -> watch::Receiver<bool> {
        self.link.armed()
    }

    pub fn flight_modes(&self) -> watch::Receiver<FlightMode> {
        self.link.flight_mode()
    }
}

/// Wait until `pred` holds on the watch channel, bounded by `dur`.
async fn wait_watch<T>(
    rx: &mut watch::Receiver<T>,
    what: &'static str,
    dur: Duration,
    pred: impl FnMut(&T) -> bool,
) -> Result<(), UavError> {
    match timeout(dur, rx.wait_for(pred)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(LinkError::NotConnected.into()),
        Err(_) => Err(UavError::Timeout(what)),
    }
}
