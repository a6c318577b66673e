//! Bring every configured vehicle home: return-to-launch, falling back to
//! an in-place landing when RTL is rejected.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use lattice_drone_bridge::DroneId;
use lattice_drone_bridge::uav::client::UavClient;
use lattice_drone_bridge::uav::sim::{SimConfig, SimLink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let connections =
        std::env::var("DRONE_CONNECTIONS").unwrap_or_else(|_| "udp://:14550".to_string());

    for (index, connection) in connections.split(',').enumerate() {
        let drone_id = DroneId::from(format!("sitl-drone-{}", index + 1));
        let link = Arc::new(SimLink::new(
            SimConfig::builder()
                .connection_string(connection.trim().to_string())
                .build(),
        ));
        let client = UavClient::new(drone_id.clone(), link);

        if let Err(err) = client.connect().await {
            error!(drone_id = %drone_id, error = %err, "Cannot reach vehicle; skipping");
            continue;
        }

        info!(drone_id = %drone_id, "Commanding return to launch");
        if client.return_to_launch().await.is_err() {
            warn!(drone_id = %drone_id, "RTL rejected; landing in place");
            if let Err(err) = client.land().await {
                error!(drone_id = %drone_id, error = %err, "Landing failed");
            }
        }
        client.disconnect().await;
    }

    Ok(())
}
