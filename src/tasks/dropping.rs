//! Payload delivery: visit each drop location, descend, stabilize, release,
//! and climb back out.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::ExecError;
use super::{DroppingParams, ProgressSender, idle, primitive, report};
use crate::session::DroneSession;
use crate::telemetry::geo;

/// Wait after release for the payload to clear the airframe.
const PAYLOAD_CLEAR_WAIT: Duration = Duration::from_secs(2);

pub(crate) async fn run(
    session: &DroneSession,
    params: &DroppingParams,
    ctx: &CancellationToken,
    progress: &ProgressSender,
) -> Result<(), ExecError> {
    let total = params.drop_locations.len();
    info!(
        drone_id = %session.drone_id(),
        drops = total,
        "Starting dropping task"
    );

    for (index, location) in params.drop_locations.iter().enumerate() {
        info!(
            drone_id = %session.drone_id(),
            drop = index + 1,
            total,
            "Proceeding to drop location"
        );
        primitive(
            ctx,
            session,
            session.client().goto_location(
                location.latitude_deg,
                location.longitude_deg,
                params.approach_altitude_m,
            ),
        )
        .await?;

        report(
            progress,
            fraction_for(index, total, 0.3),
            format!("approaching drop {}/{}", index + 1, total),
        )
        .await;

        primitive(
            ctx,
            session,
            session.client().goto_location(
                location.latitude_deg,
                location.longitude_deg,
                params.drop_altitude_m,
            ),
        )
        .await?;

        // Settle tighter than the goto tolerance before releasing
        if let Some(position) = session.snapshot().position {
            let offset = geo::haversine_m(
                position.latitude_deg,
                position.longitude_deg,
                location.latitude_deg,
                location.longitude_deg,
            );
            if offset > params.position_tolerance_m {
                primitive(
                    ctx,
                    session,
                    session.client().goto_location(
                        location.latitude_deg,
                        location.longitude_deg,
                        params.drop_altitude_m,
                    ),
                )
                .await?;
            }
        }

        info!(drone_id = %session.drone_id(), "Stabilizing for drop");
        idle(
            ctx,
            session,
            Duration::from_secs_f64(params.stabilization_time_s),
        )
        .await?;

        if let Err(err) = session.client().release_payload().await {
            warn!(
                drone_id = %session.drone_id(),
                error = %err,
                "Payload release failed; continuing to next location"
            );
        } else {
            info!(
                drone_id = %session.drone_id(),
                latitude = format_args!("{:.6}", location.latitude_deg),
                longitude = format_args!("{:.6}", location.longitude_deg),
                "Payload dropped"
            );
        }
        idle(ctx, session, PAYLOAD_CLEAR_WAIT).await?;

        // Climb back to the transit altitude; a failure here only degrades
        // the path to the next location
        if let Err(err) = primitive(
            ctx,
            session,
            session.client().goto_location(
                location.latitude_deg,
                location.longitude_deg,
                params.approach_altitude_m,
            ),
        )
        .await
        {
            match err {
                ExecError::Cancelled => return Err(ExecError::Cancelled),
                other => warn!(
                    drone_id = %session.drone_id(),
                    error = %other,
                    "Climb-out failed; continuing"
                ),
            }
        }

        report(
            progress,
            fraction_for(index, total, 1.0),
            format!("drop {}/{} complete", index + 1, total),
        )
        .await;
    }

    info!(drone_id = %session.drone_id(), "Dropping task complete");
    Ok(())
}

/// Monotone progress: each location owns an equal slice of [0.05, 0.95], and
/// `within` advances inside the slice.
fn fraction_for(index: usize, total: usize, within: f64) -> f64 {
    let slice = 0.9 / total as f64;
    0.05 + slice * (index as f64 + within)
}
