//! Task execution: kinds, validated parameters, the shared executor contract,
//! and pre-flight checks.
//!
//! Executors receive a borrowed session, a cancellation token, and a progress
//! channel. They observe the token at every primitive boundary and at least
//! once per second while idle; on cancellation they put the vehicle into Hold
//! and return [`ExecError::Cancelled`].

pub mod dropping;
pub mod error;
pub mod mapping;
pub mod relay;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use self::error::{ExecError, ValidationError};
use crate::c2_proto::{DroppingSpec, MappingSpec, RelaySpec};
use crate::config::ExecutionPolicy;
use crate::session::DroneSession;
use crate::uav::error::UavError;

/// How long pre-flight waits for the arm state to confirm via telemetry.
const ARM_CONFIRM_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Mapping,
    Relay,
    Dropping,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Mapping => write!(f, "mapping"),
            TaskKind::Relay => write!(f, "relay"),
            TaskKind::Dropping => write!(f, "dropping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

#[derive(Debug, Clone)]
pub struct MappingParams {
    /// Falls back to the drone's current position when absent.
    pub area_center: Option<LatLon>,
    pub width_m: f64,
    pub height_m: f64,
    pub altitude_m: f64,
    pub overlap: f64,
    pub camera_fov_m: f64,
}

impl Default for MappingParams {
    fn default() -> Self {
        Self {
            area_center: None,
            width_m: 100.0,
            height_m: 100.0,
            altitude_m: 50.0,
            overlap: 0.8,
            camera_fov_m: 30.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayParams {
    pub relay_position: LatLon,
    pub altitude_m: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone)]
pub struct DroppingParams {
    pub drop_locations: Vec<LatLon>,
    pub approach_altitude_m: f64,
    pub drop_altitude_m: f64,
    pub position_tolerance_m: f64,
    pub stabilization_time_s: f64,
}

/// Validated, kind-tagged task parameters.
#[derive(Debug, Clone)]
pub enum TaskParams {
    Mapping(MappingParams),
    Relay(RelayParams),
    Dropping(DroppingParams),
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::Mapping(_) => TaskKind::Mapping,
            TaskParams::Relay(_) => TaskKind::Relay,
            TaskParams::Dropping(_) => TaskKind::Dropping,
        }
    }

    /// Decode and validate the specification payload for the routed kind.
    ///
    /// Mapping accepts an empty payload (everything has defaults); relay and
    /// dropping carry required fields. Proto3 zeros read as "unset" and fall
    /// back to the kind defaults.
    pub fn from_specification(
        kind: TaskKind,
        specification: Option<&prost_types::Any>,
    ) -> Result<Self, ValidationError> {
        let payload = specification.map(|any| any.value.as_slice()).unwrap_or(&[]);
        match kind {
            TaskKind::Mapping => {
                if payload.is_empty() {
                    return Ok(TaskParams::Mapping(MappingParams::default()));
                }
                let spec = MappingSpec::decode(payload)?;
                let defaults = MappingParams::default();
                let overlap = if spec.overlap > 0.0 {
                    spec.overlap
                } else {
                    defaults.overlap
                };
                if !(0.0..=1.0).contains(&overlap) {
                    return Err(ValidationError::InvalidParameter {
                        name: "overlap",
                        reason: format!("{overlap} outside [0, 1]"),
                    });
                }
                Ok(TaskParams::Mapping(MappingParams {
                    area_center: spec.area_center.map(|c| LatLon {
                        latitude_deg: c.latitude_degrees,
                        longitude_deg: c.longitude_degrees,
                    }),
                    width_m: positive_or(spec.width_m, defaults.width_m),
                    height_m: positive_or(spec.height_m, defaults.height_m),
                    altitude_m: positive_or(spec.altitude_m, defaults.altitude_m),
                    overlap,
                    camera_fov_m: positive_or(spec.camera_fov_m, defaults.camera_fov_m),
                }))
            }
            TaskKind::Relay => {
                if payload.is_empty() {
                    return Err(ValidationError::MissingParameter("relay_position"));
                }
                let spec = RelaySpec::decode(payload)?;
                let position = spec
                    .relay_position
                    .ok_or(ValidationError::MissingParameter("relay_position"))?;
                Ok(TaskParams::Relay(RelayParams {
                    relay_position: LatLon {
                        latitude_deg: position.latitude_degrees,
                        longitude_deg: position.longitude_degrees,
                    },
                    altitude_m: positive_or(spec.altitude_m, 100.0),
                    duration_s: positive_or(spec.duration_s, 300.0),
                }))
            }
            TaskKind::Dropping => {
                if payload.is_empty() {
                    return Err(ValidationError::MissingParameter("drop_locations"));
                }
                let spec = DroppingSpec::decode(payload)?;
                if spec.drop_locations.is_empty() {
                    return Err(ValidationError::MissingParameter("drop_locations"));
                }
                Ok(TaskParams::Dropping(DroppingParams {
                    drop_locations: spec
                        .drop_locations
                        .into_iter()
                        .map(|l| LatLon {
                            latitude_deg: l.latitude_degrees,
                            longitude_deg: l.longitude_degrees,
                        })
                        .collect(),
                    approach_altitude_m: positive_or(spec.approach_altitude_m, 50.0),
                    drop_altitude_m: positive_or(spec.drop_altitude_m, 10.0),
                    position_tolerance_m: positive_or(spec.position_tolerance_m, 1.0),
                    stabilization_time_s: positive_or(spec.stabilization_time_s, 3.0),
                }))
            }
        }
    }
}

fn positive_or(value: f64, default: f64) -> f64 {
    if value > 0.0 { value } else { default }
}

/// Progress milestone emitted by executors.
#[derive(Debug, Clone)]
pub struct Progress {
    pub fraction: f64,
    pub note: String,
}

pub type ProgressSender = mpsc::Sender<Progress>;

/// Best-effort progress report; a closed consumer never fails the flight.
pub(crate) async fn report(progress: &ProgressSender, fraction: f64, note: impl Into<String>) {
    let _ = progress
        .send(Progress {
            fraction,
            note: note.into(),
        })
        .await;
}

/// Run the executor for validated parameters after the shared pre-flight.
pub async fn execute(
    params: &TaskParams,
    session: &DroneSession,
    policy: &ExecutionPolicy,
    ctx: &CancellationToken,
    progress: &ProgressSender,
) -> Result<(), ExecError> {
    pre_flight(session, policy).await?;
    match params {
        TaskParams::Mapping(p) => mapping::run(session, p, ctx, progress).await,
        TaskParams::Relay(p) => relay::run(session, p, ctx, progress).await,
        TaskParams::Dropping(p) => dropping::run(session, p, ctx, progress).await,
    }
}

/// Shared pre-flight gate: armed (arming if needed, confirmed via fresh
/// telemetry), a 3D GPS fix, and the optional battery floor.
pub async fn pre_flight(
    session: &DroneSession,
    policy: &ExecutionPolicy,
) -> Result<(), ExecError> {
    let snapshot = session.snapshot();

    if !snapshot.armed {
        warn!(drone_id = %session.drone_id(), "Vehicle not armed; arming for task");
        session
            .client()
            .arm()
            .await
            .map_err(|err| ExecError::PreFlight(format!("arm failed: {err}")))?;

        let confirmed = tokio::time::timeout(ARM_CONFIRM_WAIT, async {
            loop {
                if session.snapshot().armed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .is_ok();
        if !confirmed {
            return Err(ExecError::PreFlight(
                "arm confirmation failed (still disarmed)".to_string(),
            ));
        }
    }

    let snapshot = session.snapshot();
    if !snapshot.has_3d_fix() {
        return Err(ExecError::PreFlight(format!(
            "insufficient GPS fix (type={})",
            snapshot.gps_fix_type.unwrap_or(0)
        )));
    }

    if let Some(min_pct) = policy.min_battery_pct {
        let battery = snapshot.battery_pct.unwrap_or(0.0);
        if battery < min_pct {
            return Err(ExecError::PreFlight(format!(
                "battery too low: {battery:.0}%"
            )));
        }
    }

    Ok(())
}

/// Run one flight primitive under the cancellation token. On cancellation the
/// vehicle is put into Hold and the executor unwinds with `Cancelled`.
pub(crate) async fn primitive<F, T>(
    ctx: &CancellationToken,
    session: &DroneSession,
    fut: F,
) -> Result<T, ExecError>
where
    F: Future<Output = Result<T, UavError>>,
{
    tokio::select! {
        _ = ctx.cancelled() => {
            if let Err(err) = session.client().hold().await {
                error!(drone_id = %session.drone_id(), error = %err, "Hold after cancel failed");
            }
            Err(ExecError::Cancelled)
        }
        result = fut => result.map_err(ExecError::from),
    }
}

/// Cancellable idle wait between primitives.
pub(crate) async fn idle(
    ctx: &CancellationToken,
    session: &DroneSession,
    duration: Duration,
) -> Result<(), ExecError> {
    tokio::select! {
        _ = ctx.cancelled() => {
            if let Err(err) = session.client().hold().await {
                error!(drone_id = %session.drone_id(), error = %err, "Hold after cancel failed");
            }
            Err(ExecError::Cancelled)
        }
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c2_proto;

    fn any_of(value: Vec<u8>, url: &str) -> prost_types::Any {
        prost_types::Any {
            type_url: url.to_string(),
            value,
        }
    }

    #[test]
    fn test_mapping_defaults_from_empty_payload() {
        let params = TaskParams::from_specification(TaskKind::Mapping, None).unwrap();
        let TaskParams::Mapping(p) = params else {
            panic!("wrong kind");
        };
        assert!(p.area_center.is_none());
        assert_eq!(p.altitude_m, 50.0);
        assert_eq!(p.overlap, 0.8);
    }

    #[test]
    fn test_mapping_decodes_explicit_area() {
        let spec = c2_proto::MappingSpec {
            area_center: Some(c2_proto::LatLon {
                latitude_degrees: 47.0,
                longitude_degrees: 8.0,
            }),
            width_m: 200.0,
            height_m: 150.0,
            altitude_m: 60.0,
            overlap: 0.7,
            camera_fov_m: 25.0,
        };
        let any = any_of(spec.encode_to_vec(), "type.googleapis.com/acme.Mapping");
        let params = TaskParams::from_specification(TaskKind::Mapping, Some(&any)).unwrap();
        let TaskParams::Mapping(p) = params else {
            panic!("wrong kind");
        };
        assert_eq!(p.area_center.unwrap().latitude_deg, 47.0);
        assert_eq!(p.width_m, 200.0);
        assert_eq!(p.altitude_m, 60.0);
    }

    #[test]
    fn test_relay_requires_position() {
        let result = TaskParams::from_specification(TaskKind::Relay, None);
        assert!(matches!(
            result,
            Err(ValidationError::MissingParameter("relay_position"))
        ));

        let spec = c2_proto::RelaySpec {
            relay_position: None,
            altitude_m: 80.0,
            duration_s: 120.0,
        };
        let any = any_of(spec.encode_to_vec(), "type.googleapis.com/acme.Relay");
        let result = TaskParams::from_specification(TaskKind::Relay, Some(&any));
        assert!(matches!(
            result,
            Err(ValidationError::MissingParameter("relay_position"))
        ));
    }

    #[test]
    fn test_dropping_requires_locations() {
        let spec = c2_proto::DroppingSpec::default();
        let any = any_of(spec.encode_to_vec(), "type.googleapis.com/acme.Dropping");
        let result = TaskParams::from_specification(TaskKind::Dropping, Some(&any));
        assert!(matches!(
            result,
            Err(ValidationError::MissingParameter("drop_locations"))
        ));
    }

    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::DroneConfig;
    use crate::drone_id::DroneId;
    use crate::session::DroneSession;
    use crate::store::StateStore;
    use crate::uav::FlightLink;
    use crate::uav::client::{UavClient, UavTimings};
    use crate::uav::sim::{SimConfig, SimHandle, SimLink};

    async fn sim_session() -> (Arc<DroneSession>, SimHandle) {
        let link = Arc::new(SimLink::new(
            SimConfig::builder()
                .connection_string("udp://:14550".to_string())
                .tick(Duration::from_millis(5))
                .build(),
        ));
        let handle = link.handle();
        let client = UavClient::with_timings(
            DroneId::from("sitl-drone-1"),
            Arc::clone(&link) as Arc<dyn FlightLink>,
            UavTimings::builder()
                .connect_retry_delay(Duration::from_millis(5))
                .connect_wait(Duration::from_secs(2))
                .arm_settle(Duration::from_millis(5))
                .build(),
        );
        let store = Arc::new(StateStore::new());
        store.register(DroneId::from("sitl-drone-1"), "udp://:14550");
        let session = Arc::new(DroneSession::new(
            DroneConfig::builder()
                .id("sitl-drone-1".to_string())
                .connection_string("udp://:14550".to_string())
                .build(),
            client,
            store,
        ));
        session.start().await.unwrap();
        (session, handle)
    }

    async fn wait_snapshot(session: &DroneSession, pred: impl Fn(&crate::telemetry::Snapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&session.snapshot()) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("snapshot condition never held");
    }

    #[tokio::test]
    async fn test_pre_flight_rejects_weak_gps_fix() {
        let (session, handle) = sim_session().await;
        handle.set_gps_fix(2);
        wait_snapshot(&session, |s| s.gps_fix_type == Some(2)).await;

        let result = pre_flight(&session, &ExecutionPolicy::default()).await;
        match result {
            Err(ExecError::PreFlight(reason)) => {
                assert!(reason.contains("insufficient GPS fix"), "{reason}");
            }
            other => panic!("expected pre-flight failure, got {other:?}"),
        }
        session.stop().await;
    }

    #[tokio::test]
    async fn test_pre_flight_arms_a_disarmed_vehicle() {
        let (session, handle) = sim_session().await;
        wait_snapshot(&session, |s| s.gps_fix_type.is_some()).await;
        assert!(!handle.is_armed());

        pre_flight(&session, &ExecutionPolicy::default()).await.unwrap();
        assert!(handle.is_armed());
        session.stop().await;
    }

    #[tokio::test]
    async fn test_pre_flight_enforces_battery_floor_when_configured() {
        let (session, handle) = sim_session().await;
        handle.set_battery_pct(10.0);
        wait_snapshot(&session, |s| s.battery_pct == Some(10.0)).await;

        let policy = ExecutionPolicy::builder().min_battery_pct(20.0).build();
        let result = pre_flight(&session, &policy).await;
        match result {
            Err(ExecError::PreFlight(reason)) => assert!(reason.contains("battery"), "{reason}"),
            other => panic!("expected battery rejection, got {other:?}"),
        }

        // Default policy leaves the check off
        handle.set_gps_fix(4);
        pre_flight(&session, &ExecutionPolicy::default()).await.unwrap();
        session.stop().await;
    }

    #[test]
    fn test_dropping_fills_defaults() {
        let spec = c2_proto::DroppingSpec {
            drop_locations: vec![c2_proto::LatLon {
                latitude_degrees: 47.0,
                longitude_degrees: 8.0,
            }],
            ..Default::default()
        };
        let any = any_of(spec.encode_to_vec(), "type.googleapis.com/acme.Dropping");
        let params = TaskParams::from_specification(TaskKind::Dropping, Some(&any)).unwrap();
        let TaskParams::Dropping(p) = params else {
            panic!("wrong kind");
        };
        assert_eq!(p.approach_altitude_m, 50.0);
        assert_eq!(p.drop_altitude_m, 10.0);
        assert_eq!(p.position_tolerance_m, 1.0);
        assert_eq!(p.stabilization_time_s, 3.0);
    }
}
