//! Communications relay: hold a position at altitude for a duration,
//! correcting drift.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::ExecError;
use super::{RelayParams, ProgressSender, idle, primitive, report};
use crate::session::DroneSession;
use crate::telemetry::geo;

/// Drift beyond this distance triggers a corrective goto.
const POSITION_TOLERANCE_M: f64 = 5.0;

/// Cadence of the drift check.
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) async fn run(
    session: &DroneSession,
    params: &RelayParams,
    ctx: &CancellationToken,
    progress: &ProgressSender,
) -> Result<(), ExecError> {
    info!(
        drone_id = %session.drone_id(),
        duration_s = params.duration_s,
        "Starting relay task"
    );

    report(progress, 0.02, "taking off").await;
    primitive(ctx, session, session.client().takeoff(params.altitude_m)).await?;

    report(progress, 0.05, "moving to relay position").await;
    primitive(
        ctx,
        session,
        session.client().goto_location(
            params.relay_position.latitude_deg,
            params.relay_position.longitude_deg,
            params.altitude_m,
        ),
    )
    .await?;

    info!(
        drone_id = %session.drone_id(),
        "On station; maintaining relay position"
    );

    let started = Instant::now();
    let duration = Duration::from_secs_f64(params.duration_s);
    loop {
        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }

        idle(ctx, session, CHECK_INTERVAL.min(duration - elapsed)).await?;

        if let Some(position) = session.snapshot().position {
            let drift = geo::haversine_m(
                position.latitude_deg,
                position.longitude_deg,
                params.relay_position.latitude_deg,
                params.relay_position.longitude_deg,
            );
            if drift > POSITION_TOLERANCE_M {
                info!(
                    drone_id = %session.drone_id(),
                    drift_m = format_args!("{drift:.1}"),
                    "Correcting position drift"
                );
                primitive(
                    ctx,
                    session,
                    session.client().goto_location(
                        params.relay_position.latitude_deg,
                        params.relay_position.longitude_deg,
                        params.altitude_m,
                    ),
                )
                .await?;
            } else {
                debug!(drone_id = %session.drone_id(), "Relay on station");
            }
        }

        let fraction = (0.1 + 0.9 * started.elapsed().as_secs_f64() / duration.as_secs_f64())
            .min(0.99);
        report(progress, fraction, "relaying").await;
    }

    info!(drone_id = %session.drone_id(), "Relay task complete");
    Ok(())
}
