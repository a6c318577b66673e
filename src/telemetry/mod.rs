//! Telemetry value types shared by the session, store, publisher, and tasks.

pub mod geo;
pub mod smoothing;

use tokio::time::Instant;

/// Below this magnitude a coordinate is treated as a not-yet-ready GPS fix.
/// Some stacks transiently emit 0/0 before the first solution.
pub const COORD_EPSILON: f64 = 1e-6;

/// A GPS position with both altitude references carried along.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    /// Altitude above ground level (relative to the arming point).
    pub altitude_agl_m: f64,
    /// Altitude above mean sea level.
    pub altitude_amsl_m: f64,
}

impl Position {
    /// A fix is usable once both coordinates have left the origin.
    pub fn is_valid(&self) -> bool {
        self.latitude_deg.abs() > COORD_EPSILON && self.longitude_deg.abs() > COORD_EPSILON
    }
}

/// Velocity in the north-east-down frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VelocityNed {
    pub north_mps: f64,
    pub east_mps: f64,
    pub down_mps: f64,
}

impl VelocityNed {
    pub fn magnitude_mps(&self) -> f64 {
        (self.north_mps * self.north_mps
            + self.east_mps * self.east_mps
            + self.down_mps * self.down_mps)
            .sqrt()
    }
}

/// Flight mode as reported by the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlightMode {
    #[default]
    Unknown,
    Hold,
    Takeoff,
    Land,
    ReturnToLaunch,
    Guided,
    Mission,
}

/// Value-copy view of a drone's telemetry as maintained by its session.
///
/// `position` follows the snapshot contract: the current valid fix if there is
/// one, else the last-known-good fix, else `None` (callers defer publishing).
/// `fix_valid` is true only when the latest raw tick carried a valid fix, so
/// consumers can tell a fresh position from a cached one.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub position: Option<Position>,
    pub fix_valid: bool,
    pub velocity: Option<VelocityNed>,
    pub heading_deg: Option<f64>,
    pub speed_mps: f64,
    pub battery_pct: Option<f64>,
    pub battery_voltage_v: Option<f64>,
    pub armed: bool,
    pub gps_fix_type: Option<u8>,
    pub flight_mode: FlightMode,
    pub taken_at: Instant,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            position: None,
            fix_valid: false,
            velocity: None,
            heading_deg: None,
            speed_mps: 0.0,
            battery_pct: None,
            battery_voltage_v: None,
            armed: false,
            gps_fix_type: None,
            flight_mode: FlightMode::Unknown,
            taken_at: Instant::now(),
        }
    }

    /// Minimum GPS fix for flight is a 3D solution (fix type 3).
    pub fn has_3d_fix(&self) -> bool {
        self.gps_fix_type.is_some_and(|fix| fix >= 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_validity() {
        let valid = Position {
            latitude_deg: 47.3978,
            longitude_deg: 8.5456,
            altitude_agl_m: 0.0,
            altitude_amsl_m: 500.0,
        };
        assert!(valid.is_valid());

        let origin = Position {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            altitude_agl_m: 0.0,
            altitude_amsl_m: 0.0,
        };
        assert!(!origin.is_valid());

        // One axis at the origin is still not a usable fix
        let half = Position {
            latitude_deg: 47.3978,
            longitude_deg: 0.0,
            altitude_agl_m: 0.0,
            altitude_amsl_m: 0.0,
        };
        assert!(!half.is_valid());
    }

    #[test]
    fn test_velocity_magnitude() {
        let v = VelocityNed {
            north_mps: 3.0,
            east_mps: 4.0,
            down_mps: 0.0,
        };
        assert!((v.magnitude_mps() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_fix_type_threshold() {
        let mut snapshot = Snapshot::empty();
        assert!(!snapshot.has_3d_fix());
        snapshot.gps_fix_type = Some(2);
        assert!(!snapshot.has_3d_fix());
        snapshot.gps_fix_type = Some(3);
        assert!(snapshot.has_3d_fix());
        snapshot.gps_fix_type = Some(6);
        assert!(snapshot.has_3d_fix());
    }
}
