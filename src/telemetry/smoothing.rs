//! Low-pass filtering of kinematic telemetry.
//!
//! Raw MAVLink streams twitch enough to make the C2 map arrow flicker; the
//! filter below smooths velocity, scalar speed, and heading before anything is
//! published. It is pure state: no clocks, no IO, ticks are whatever cadence
//! the caller feeds it.

use super::VelocityNed;

/// Default low-pass coefficient. Higher = more responsive, lower = smoother.
pub const DEFAULT_SMOOTH_ALPHA: f64 = 0.2;

/// Heading gets stronger smoothing than the translational components to
/// remove yaw twitch.
const HEADING_GAIN: f64 = 0.7;

/// Speeds below this magnitude clamp to zero to stop near-hover oscillation.
pub const SPEED_DEADBAND_MPS: f64 = 0.15;

/// Exponential-moving-average filter over velocity, speed, and heading.
#[derive(Debug, Clone)]
pub struct KinematicsFilter {
    alpha: f64,
    velocity: Option<VelocityNed>,
    speed_mps: Option<f64>,
    heading_deg: Option<f64>,
}

impl KinematicsFilter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            velocity: None,
            speed_mps: None,
            heading_deg: None,
        }
    }

    /// Feed a raw NED velocity sample. Speed is derived from the raw sample
    /// magnitude and smoothed independently of the components.
    pub fn update_velocity(&mut self, raw: VelocityNed) {
        let prev = self.velocity.unwrap_or(raw);
        let a = self.alpha;
        self.velocity = Some(VelocityNed {
            north_mps: a * raw.north_mps + (1.0 - a) * prev.north_mps,
            east_mps: a * raw.east_mps + (1.0 - a) * prev.east_mps,
            down_mps: a * raw.down_mps + (1.0 - a) * prev.down_mps,
        });

        let raw_speed = raw.magnitude_mps();
        let prev_speed = self.speed_mps.unwrap_or(raw_speed);
        let mut smoothed = a * raw_speed + (1.0 - a) * prev_speed;
        if smoothed.abs() < SPEED_DEADBAND_MPS {
            smoothed = 0.0;
        }
        self.speed_mps = Some(smoothed);
    }

    /// Feed a raw heading sample in degrees. Wrap-around is handled by moving
    /// along the shortest signed angular difference.
    pub fn update_heading(&mut self, raw_deg: f64) {
        let normalized = raw_deg.rem_euclid(360.0);
        match self.heading_deg {
            None => self.heading_deg = Some(normalized),
            Some(prev) => {
                let delta = (normalized - prev + 180.0).rem_euclid(360.0) - 180.0;
                self.heading_deg = Some((prev + self.alpha * HEADING_GAIN * delta).rem_euclid(360.0));
            }
        }
    }

    pub fn velocity(&self) -> Option<VelocityNed> {
        self.velocity
    }

    pub fn speed_mps(&self) -> f64 {
        self.speed_mps.unwrap_or(0.0)
    }

    pub fn heading_deg(&self) -> Option<f64> {
        self.heading_deg
    }
}

impl Default for KinematicsFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTH_ALPHA)
    }
}
