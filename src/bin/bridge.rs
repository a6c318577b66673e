//! Bridge service entry point.
//!
//! Configuration comes from the environment: `DRONE_CONNECTIONS` is a
//! comma-separated list of vehicle connection strings (default
//! `udp://:14550`), and the C2 endpoint/credentials come from `LATTICE_URL`,
//! `ENVIRONMENT_TOKEN`, and `SANDBOXES_TOKEN`. Without a primary token the
//! bridge runs in mock mode: vehicles fly, nothing is published.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use lattice_drone_bridge::c2::{C2Client, C2Gateway};
use lattice_drone_bridge::config::{BridgeConfig, C2Config, DroneConfig, ENV_TOKEN};
use lattice_drone_bridge::supervisor::Supervisor;
use lattice_drone_bridge::uav::sim::{SimConfig, SimLink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let connections =
        std::env::var("DRONE_CONNECTIONS").unwrap_or_else(|_| "udp://:14550".to_string());
    let drones: Vec<DroneConfig> = connections
        .split(',')
        .enumerate()
        .map(|(index, connection)| {
            DroneConfig::builder()
                .id(format!("sitl-drone-{}", index + 1))
                .connection_string(connection.trim().to_string())
                .build()
        })
        .collect();

    let c2_config = C2Config::from_env();
    let mock_mode = c2_config.is_none();
    if mock_mode {
        warn!("{ENV_TOKEN} not set; running in mock mode without C2");
    }

    let config = BridgeConfig::builder()
        .maybe_c2(c2_config)
        .mock_mode(mock_mode)
        .drones(drones)
        .build();

    let gateway: Option<Arc<dyn C2Gateway>> = match &config.c2 {
        Some(c2) => Some(Arc::new(
            C2Client::connect(c2, &config.integration_name).await?,
        )),
        None => None,
    };

    let supervisor = Supervisor::new(
        config,
        gateway,
        Box::new(|drone| {
            Arc::new(SimLink::new(
                SimConfig::builder()
                    .connection_string(drone.connection_string.clone())
                    .build(),
            ))
        }),
    );
    supervisor.start().await?;

    info!("Bridge running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    supervisor.shutdown().await;
    Ok(())
}
