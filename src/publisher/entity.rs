//! Entity assembly: turn a telemetry snapshot into the C2 entity message.

use std::time::Duration;

use crate::c2::{timestamp_in, timestamp_now};
use crate::c2_proto;
use crate::drone_id::DroneId;
use crate::telemetry::Snapshot;

/// Task specification URLs advertised in the entity catalog; these make the
/// asset taskable in the C2 UI.
pub const SPECIFICATION_URLS: [&str; 3] = [
    "type.googleapis.com/anduril.tasks.v2.VisualId",
    "type.googleapis.com/anduril.tasks.v2.Investigate",
    "type.googleapis.com/anduril.tasks.v2.Monitor",
];

/// Error ellipse radius attached when publishing a cached fix.
pub const CACHED_FIX_UNCERTAINTY_M: f64 = 1000.0;

/// Whether the published location came from a live fix or the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationQuality {
    Fresh,
    Cached,
}

pub struct EntityAssembly<'a> {
    pub drone_id: &'a DroneId,
    pub integration_name: &'a str,
    pub expiry: Duration,
}

/// Assemble the entity for one publish tick.
///
/// Returns `None` when no position (current or cached) exists yet; publishing
/// without a location would reset the asset on the C2 map. A snapshot whose
/// latest fix was invalid publishes the cached position under a large error
/// ellipse instead.
pub fn build_entity(
    assembly: &EntityAssembly<'_>,
    snapshot: &Snapshot,
) -> Option<(c2_proto::Entity, LocationQuality)> {
    let position = snapshot.position?;
    let quality = if snapshot.fix_valid {
        LocationQuality::Fresh
    } else {
        LocationQuality::Cached
    };

    // NED -> ENU: e = east, n = north, u = -down
    let velocity = snapshot.velocity.unwrap_or_default();
    let velocity_enu = c2_proto::Enu {
        e: velocity.east_mps,
        n: velocity.north_mps,
        u: -velocity.down_mps,
    };

    let now = timestamp_now();
    let entity = c2_proto::Entity {
        entity_id: assembly.drone_id.to_string(),
        description: format!("Drone asset managed by {}", assembly.integration_name),
        is_live: true,
        created_time: Some(now.clone()),
        expiry_time: Some(timestamp_in(assembly.expiry)),
        aliases: Some(c2_proto::Aliases {
            name: assembly.drone_id.display_name(),
        }),
        ontology: Some(c2_proto::Ontology {
            template: c2_proto::Template::Asset as i32,
            platform_type: "UAV".to_string(),
            specific_type: "Drone".to_string(),
        }),
        provenance: Some(c2_proto::Provenance {
            integration_name: assembly.integration_name.to_string(),
            data_type: "drone_telemetry".to_string(),
            source_update_time: Some(now.clone()),
            source_description: "UAV control bridge".to_string(),
        }),
        health: Some(c2_proto::Health {
            connection_status: c2_proto::ConnectionStatus::Online as i32,
            health_status: c2_proto::HealthStatus::Healthy as i32,
            update_time: Some(now),
        }),
        mil_view: Some(c2_proto::MilView {
            disposition: c2_proto::Disposition::Friendly as i32,
            environment: c2_proto::Environment::Air as i32,
        }),
        location: Some(c2_proto::Location {
            position: Some(c2_proto::Position {
                latitude_degrees: position.latitude_deg,
                longitude_degrees: position.longitude_deg,
                // HAE treated as AMSL-equivalent
                altitude_hae_meters: position.altitude_amsl_m,
            }),
            velocity_enu: Some(velocity_enu),
            speed_mps: snapshot.speed_mps,
            attitude_enu: None,
        }),
        location_uncertainty: (quality == LocationQuality::Cached).then(|| {
            c2_proto::LocationUncertainty {
                position_error_ellipse: Some(c2_proto::ErrorEllipse {
                    probability: 0.5,
                    semi_major_axis_m: CACHED_FIX_UNCERTAINTY_M,
                    semi_minor_axis_m: CACHED_FIX_UNCERTAINTY_M,
                    orientation_d: 0.0,
                }),
            }
        }),
        task_catalog: Some(c2_proto::TaskCatalog {
            task_definitions: SPECIFICATION_URLS
                .iter()
                .map(|url| c2_proto::TaskDefinition {
                    task_specification_url: url.to_string(),
                })
                .collect(),
        }),
    };

    Some((entity, quality))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Position, VelocityNed};

    fn assembly<'a>(drone_id: &'a DroneId) -> EntityAssembly<'a> {
        EntityAssembly {
            drone_id,
            integration_name: "lattice-drone-bridge",
            expiry: Duration::from_secs(600),
        }
    }

    fn valid_snapshot() -> Snapshot {
        let mut snapshot = Snapshot::empty();
        snapshot.position = Some(Position {
            latitude_deg: 47.3978,
            longitude_deg: 8.5456,
            altitude_agl_m: 0.0,
            altitude_amsl_m: 500.0,
        });
        snapshot.fix_valid = true;
        snapshot.velocity = Some(VelocityNed {
            north_mps: 3.0,
            east_mps: 4.0,
            down_mps: -1.0,
        });
        snapshot.speed_mps = 5.0;
        snapshot
    }

    #[test]
    fn test_fresh_fix_builds_plain_location() {
        let drone_id = DroneId::from("sitl-drone-1");
        let (entity, quality) = build_entity(&assembly(&drone_id), &valid_snapshot()).unwrap();

        assert_eq!(quality, LocationQuality::Fresh);
        assert_eq!(entity.entity_id, "sitl-drone-1");
        assert!(entity.is_live);
        assert_eq!(entity.aliases.unwrap().name, "Drone-sitl-drone-1");
        assert!(entity.location_uncertainty.is_none());

        let location = entity.location.unwrap();
        let position = location.position.unwrap();
        assert_eq!(position.latitude_degrees, 47.3978);
        assert_eq!(position.longitude_degrees, 8.5456);
        assert_eq!(position.altitude_hae_meters, 500.0);

        assert!(!entity.task_catalog.unwrap().task_definitions.is_empty());
    }

    #[test]
    fn test_ned_to_enu_conversion() {
        let drone_id = DroneId::from("d");
        let (entity, _) = build_entity(&assembly(&drone_id), &valid_snapshot()).unwrap();
        let enu = entity.location.unwrap().velocity_enu.unwrap();
        assert_eq!(enu.e, 4.0);
        assert_eq!(enu.n, 3.0);
        assert_eq!(enu.u, 1.0);
    }

    #[test]
    fn test_cached_fix_carries_uncertainty() {
        let drone_id = DroneId::from("d");
        let mut snapshot = valid_snapshot();
        snapshot.fix_valid = false;

        let (entity, quality) = build_entity(&assembly(&drone_id), &snapshot).unwrap();
        assert_eq!(quality, LocationQuality::Cached);
        let ellipse = entity
            .location_uncertainty
            .unwrap()
            .position_error_ellipse
            .unwrap();
        assert_eq!(ellipse.semi_major_axis_m, CACHED_FIX_UNCERTAINTY_M);
        // Cached coordinates are still published
        assert!(entity.location.is_some());
    }

    #[test]
    fn test_no_position_defers_publish() {
        let drone_id = DroneId::from("d");
        let snapshot = Snapshot::empty();
        assert!(build_entity(&assembly(&drone_id), &snapshot).is_none());
    }

    #[test]
    fn test_expiry_follows_created_time() {
        let drone_id = DroneId::from("d");
        let (entity, _) = build_entity(&assembly(&drone_id), &valid_snapshot()).unwrap();
        let created = entity.created_time.unwrap();
        let expiry = entity.expiry_time.unwrap();
        assert_eq!(expiry.seconds - created.seconds, 600);
    }
}
