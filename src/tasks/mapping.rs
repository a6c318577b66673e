//! Area mapping: fly a waypoint pattern over a bounding box at constant
//! altitude, then return to launch.
//!
//! The flown pattern draws the letters "MC3" over the area. A classical
//! lawn-mower sweep is also available for callers that want uniform coverage.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::ExecError;
use super::{LatLon, MappingParams, ProgressSender, idle, primitive, report};
use crate::session::DroneSession;
use crate::telemetry::geo;

/// Letter width as a fraction of letter height.
const LETTER_ASPECT_RATIO: f64 = 0.7;

/// Gap between letters as a fraction of letter height.
const LETTER_SPACING_RATIO: f64 = 0.25;

/// Pause at each waypoint before moving on.
const WAYPOINT_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_agl_m: f64,
}

pub(crate) async fn run(
    session: &DroneSession,
    params: &MappingParams,
    ctx: &CancellationToken,
    progress: &ProgressSender,
) -> Result<(), ExecError> {
    info!(drone_id = %session.drone_id(), "Starting mapping task");

    let center = match params.area_center {
        Some(center) => center,
        None => {
            // No explicit area: map around wherever the vehicle is now
            let snapshot = session.snapshot();
            let position = snapshot.position.ok_or_else(|| {
                ExecError::PreFlight("no area center provided and current position unavailable".into())
            })?;
            LatLon {
                latitude_deg: position.latitude_deg,
                longitude_deg: position.longitude_deg,
            }
        }
    };

    report(progress, 0.02, "taking off").await;
    primitive(ctx, session, session.client().takeoff(params.altitude_m)).await?;
    report(progress, 0.1, "at survey altitude").await;

    let waypoints = mc3_waypoints(center, params.width_m, params.height_m, params.altitude_m);
    info!(
        drone_id = %session.drone_id(),
        waypoints = waypoints.len(),
        "Flying letter pattern"
    );

    let total = waypoints.len();
    for (index, waypoint) in waypoints.iter().enumerate() {
        match primitive(
            ctx,
            session,
            session.client().goto_location(
                waypoint.latitude_deg,
                waypoint.longitude_deg,
                waypoint.altitude_agl_m,
            ),
        )
        .await
        {
            Ok(()) => {}
            Err(ExecError::Cancelled) => return Err(ExecError::Cancelled),
            Err(err) => {
                // Best-effort coverage: a missed waypoint does not abort the survey
                warn!(
                    drone_id = %session.drone_id(),
                    waypoint = index + 1,
                    total,
                    error = %err,
                    "Failed to reach waypoint; continuing"
                );
            }
        }
        let fraction = 0.1 + 0.8 * (index + 1) as f64 / total as f64;
        report(progress, fraction, format!("waypoint {}/{}", index + 1, total)).await;
        idle(ctx, session, WAYPOINT_PAUSE).await?;
    }

    report(progress, 0.95, "returning to launch").await;
    if let Err(err) = session.client().return_to_launch().await {
        warn!(
            drone_id = %session.drone_id(),
            error = %err,
            "RTL rejected; holding position"
        );
        session.client().hold().await.map_err(ExecError::from)?;
    }

    info!(drone_id = %session.drone_id(), "Mapping task complete");
    Ok(())
}

/// Waypoints spelling "MC3", centered on `center` and fitted into the
/// width×height box.
///
/// Letters share a height solved from
/// `width = letter_height × (3·aspect + 2·spacing_ratio)`, capped by the box
/// height. Strokes per letter are fixed polylines: M is drawn
/// BL→TL→bottom-center→TR→BR (5 points), C as a square open to the east
/// TR→TL→BL→BR (4 points), and 3 as a seven-point zig
/// TL→TR→upper-right→center→lower-right→BR→BL.
pub fn mc3_waypoints(center: LatLon, width_m: f64, height_m: f64, altitude_m: f64) -> Vec<Waypoint> {
    let denom = 3.0 * LETTER_ASPECT_RATIO + 2.0 * LETTER_SPACING_RATIO;
    let letter_height = height_m.min(width_m / denom);
    let letter_width = LETTER_ASPECT_RATIO * letter_height;
    let spacing = LETTER_SPACING_RATIO * letter_height;
    let half_w = letter_width / 2.0;

    let total_width = 3.0 * letter_width + 2.0 * spacing;
    let left_x = -total_width / 2.0;

    let m_center = left_x + half_w;
    let c_center = m_center + letter_width + spacing;
    let three_center = c_center + letter_width + spacing;

    let top = letter_height / 2.0;
    let bottom = -letter_height / 2.0;
    let quarter = letter_height / 4.0;

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(16);

    // M
    points.extend([
        (m_center - half_w, bottom),
        (m_center - half_w, top),
        (m_center, bottom),
        (m_center + half_w, top),
        (m_center + half_w, bottom),
    ]);
    // C
    points.extend([
        (c_center + half_w, top),
        (c_center - half_w, top),
        (c_center - half_w, bottom),
        (c_center + half_w, bottom),
    ]);
    // 3
    points.extend([
        (three_center - half_w, top),
        (three_center + half_w, top),
        (three_center + half_w, quarter),
        (three_center, 0.0),
        (three_center + half_w, -quarter),
        (three_center + half_w, bottom),
        (three_center - half_w, bottom),
    ]);

    points
        .into_iter()
        .map(|(east_m, north_m)| {
            let (latitude_deg, longitude_deg) =
                geo::offset_deg(center.latitude_deg, center.longitude_deg, east_m, north_m);
            Waypoint {
                latitude_deg,
                longitude_deg,
                altitude_agl_m: altitude_m,
            }
        })
        .collect()
}

/// Classical lawn-mower sweep over the same bounding box. Line spacing is the
/// camera footprint reduced by the requested overlap.
pub fn lawnmower_waypoints(
    center: LatLon,
    width_m: f64,
    height_m: f64,
    altitude_m: f64,
    overlap: f64,
    camera_fov_m: f64,
) -> Vec<Waypoint> {
    let line_spacing = camera_fov_m * (1.0 - overlap);
    if line_spacing <= 0.0 {
        return Vec::new();
    }

    let west = -width_m / 2.0;
    let east = width_m / 2.0;
    let mut north = -height_m / 2.0;
    let mut eastbound = true;
    let mut waypoints = Vec::new();

    while north <= height_m / 2.0 {
        let (first_x, second_x) = if eastbound { (west, east) } else { (east, west) };
        for east_m in [first_x, second_x] {
            let (latitude_deg, longitude_deg) =
                geo::offset_deg(center.latitude_deg, center.longitude_deg, east_m, north);
            waypoints.push(Waypoint {
                latitude_deg,
                longitude_deg,
                altitude_agl_m: altitude_m,
            });
        }
        north += line_spacing;
        eastbound = !eastbound;
    }

    waypoints
}

#[cfg(test)]
mod tests {
    use super::*;

    const CENTER: LatLon = LatLon {
        latitude_deg: 47.3978,
        longitude_deg: 8.5456,
    };

    #[test]
    fn test_mc3_waypoint_count() {
        let waypoints = mc3_waypoints(CENTER, 100.0, 100.0, 50.0);
        // 5 for M, 4 for C, 7 for 3
        assert_eq!(waypoints.len(), 16);
    }

    #[test]
    fn test_mc3_constant_altitude() {
        let waypoints = mc3_waypoints(CENTER, 100.0, 100.0, 42.0);
        assert!(waypoints.iter().all(|w| w.altitude_agl_m == 42.0));
    }

    #[test]
    fn test_mc3_stroke_order_of_m() {
        let waypoints = mc3_waypoints(CENTER, 100.0, 100.0, 50.0);

        // BL -> TL: same longitude, latitude climbs
        assert!((waypoints[0].longitude_deg - waypoints[1].longitude_deg).abs() < 1e-12);
        assert!(waypoints[1].latitude_deg > waypoints[0].latitude_deg);
        // TL -> bottom-center: east and down
        assert!(waypoints[2].longitude_deg > waypoints[1].longitude_deg);
        assert!(waypoints[2].latitude_deg < waypoints[1].latitude_deg);
        // TR shares the top latitude with TL
        assert!((waypoints[3].latitude_deg - waypoints[1].latitude_deg).abs() < 1e-12);
        // BR closes the letter at the bottom
        assert!((waypoints[4].latitude_deg - waypoints[0].latitude_deg).abs() < 1e-12);
    }

    #[test]
    fn test_mc3_letters_advance_eastward() {
        let waypoints = mc3_waypoints(CENTER, 100.0, 100.0, 50.0);
        let m_east = waypoints[..5]
            .iter()
            .map(|w| w.longitude_deg)
            .fold(f64::MIN, f64::max);
        let c_west = waypoints[5..9]
            .iter()
            .map(|w| w.longitude_deg)
            .fold(f64::MAX, f64::min);
        let three_west = waypoints[9..]
            .iter()
            .map(|w| w.longitude_deg)
            .fold(f64::MAX, f64::min);
        assert!(c_west > m_east, "C must start east of M");
        assert!(three_west > c_west, "3 must start east of C");
    }

    #[test]
    fn test_mc3_fits_requested_width() {
        let waypoints = mc3_waypoints(CENTER, 100.0, 100.0, 50.0);
        // Text block spans the full requested width when height allows:
        // 3 letters + 2 gaps resolve to letter_height = width / 2.6
        let west = waypoints
            .iter()
            .map(|w| w.longitude_deg)
            .fold(f64::MAX, f64::min);
        let east = waypoints
            .iter()
            .map(|w| w.longitude_deg)
            .fold(f64::MIN, f64::max);
        let span_m = geo::haversine_m(CENTER.latitude_deg, west, CENTER.latitude_deg, east);
        assert!((span_m - 100.0).abs() < 1.0, "span {span_m:.1} m");
    }

    #[test]
    fn test_mc3_height_caps_letter_size() {
        let wide = mc3_waypoints(CENTER, 1000.0, 20.0, 50.0);
        let north = wide
            .iter()
            .map(|w| w.latitude_deg)
            .fold(f64::MIN, f64::max);
        let south = wide
            .iter()
            .map(|w| w.latitude_deg)
            .fold(f64::MAX, f64::min);
        let height_m = geo::haversine_m(south, CENTER.longitude_deg, north, CENTER.longitude_deg);
        assert!(height_m <= 20.5, "letters overflow the box: {height_m:.1} m");
    }

    #[test]
    fn test_lawnmower_alternates_direction() {
        let waypoints = lawnmower_waypoints(CENTER, 100.0, 60.0, 50.0, 0.8, 30.0);
        assert!(!waypoints.is_empty());
        assert_eq!(waypoints.len() % 2, 0);

        // First line runs west→east, second east→west
        assert!(waypoints[1].longitude_deg > waypoints[0].longitude_deg);
        assert!(waypoints[3].longitude_deg < waypoints[2].longitude_deg);
        // Rows climb north
        assert!(waypoints[2].latitude_deg > waypoints[0].latitude_deg);
    }

    #[test]
    fn test_lawnmower_full_overlap_is_degenerate() {
        let waypoints = lawnmower_waypoints(CENTER, 100.0, 60.0, 50.0, 1.0, 30.0);
        assert!(waypoints.is_empty());
    }
}
