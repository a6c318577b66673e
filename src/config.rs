//! Bridge configuration. Values come from the embedding process or the
//! environment; file formats and CLI parsing live outside this crate.

use std::env;
use std::time::Duration;

use bon::Builder;

use crate::tasks::TaskKind;

/// Environment variables carrying the two bearer credentials and the C2 URL.
pub const ENV_C2_URL: &str = "LATTICE_URL";
pub const ENV_TOKEN: &str = "ENVIRONMENT_TOKEN";
pub const ENV_SANDBOX_TOKEN: &str = "SANDBOXES_TOKEN";

/// Task kinds a drone can advertise and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Mapping,
    Relay,
    Dropping,
}

/// Static description of one managed vehicle.
#[derive(Debug, Clone, Builder)]
pub struct DroneConfig {
    pub id: String,
    /// e.g. `udp://:14550`
    pub connection_string: String,
    #[builder(default = vec![Capability::Mapping, Capability::Relay, Capability::Dropping])]
    pub capabilities: Vec<Capability>,
    #[builder(default = 120.0)]
    pub max_altitude_m: f64,
    #[builder(default = 20.0)]
    pub max_speed_mps: f64,
    #[builder(default = 50.0)]
    pub rtl_altitude_m: f64,
    #[builder(default = true)]
    pub geofence_enabled: bool,
}

/// C2 endpoint and credentials.
#[derive(Debug, Clone, Builder)]
pub struct C2Config {
    pub url: String,
    pub environment_token: String,
    pub sandboxes_token: Option<String>,
    /// Long-poll window for ListenAsAgent; timeouts are normal completions.
    #[builder(default = Duration::from_secs(330))]
    pub listen_timeout: Duration,
}

impl C2Config {
    /// Build from `LATTICE_URL` / `ENVIRONMENT_TOKEN` / `SANDBOXES_TOKEN`.
    /// Returns `None` when the primary token is absent, which puts the bridge
    /// in mock mode.
    pub fn from_env() -> Option<Self> {
        let environment_token = env::var(ENV_TOKEN).ok()?;
        let url =
            env::var(ENV_C2_URL).unwrap_or_else(|_| "https://lattice.anduril.com".to_string());
        Some(
            Self::builder()
                .url(url)
                .environment_token(environment_token)
                .maybe_sandboxes_token(env::var(ENV_SANDBOX_TOKEN).ok())
                .build(),
        )
    }
}

/// Publish cadences and log throttles for the asset publisher.
#[derive(Debug, Clone, Builder)]
pub struct PublisherConfig {
    #[builder(default = 3.0)]
    pub position_rate_hz: f64,
    /// Strictly slower than the position rate so status frames never race
    /// location updates.
    #[builder(default = 0.8)]
    pub status_rate_hz: f64,
    #[builder(default = Duration::from_secs(300))]
    pub publish_info_interval: Duration,
    #[builder(default = Duration::from_secs(10))]
    pub invalid_warn_interval: Duration,
    #[builder(default = Duration::from_secs(600))]
    pub entity_expiry: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Safety gates applied before task execution.
#[derive(Debug, Clone, Default, Builder)]
pub struct ExecutionPolicy {
    /// Minimum battery percentage required by pre-flight; `None` disables the
    /// check (simulated vehicles report synthetic batteries).
    pub min_battery_pct: Option<f64>,
}

/// Ordered substring routes from task specification URLs to internal kinds.
///
/// Surveillance specifications (VisualId / Investigate / Monitor) have no
/// dedicated executor and route to mapping; unknown URLs fall back to mapping
/// as well.
#[derive(Debug, Clone)]
pub struct TaskRoutes {
    routes: Vec<(String, TaskKind)>,
    fallback: TaskKind,
}

impl TaskRoutes {
    pub fn new(routes: Vec<(String, TaskKind)>, fallback: TaskKind) -> Self {
        Self { routes, fallback }
    }

    pub fn kind_for(&self, specification_url: &str) -> TaskKind {
        self.routes
            .iter()
            .find(|(pattern, _)| specification_url.contains(pattern))
            .map(|(_, kind)| *kind)
            .unwrap_or(self.fallback)
    }
}

impl Default for TaskRoutes {
    fn default() -> Self {
        Self {
            routes: vec![
                ("Mapping".to_string(), TaskKind::Mapping),
                ("Relay".to_string(), TaskKind::Relay),
                ("Dropping".to_string(), TaskKind::Dropping),
                ("VisualId".to_string(), TaskKind::Mapping),
                ("Investigate".to_string(), TaskKind::Mapping),
                ("Monitor".to_string(), TaskKind::Mapping),
            ],
            fallback: TaskKind::Mapping,
        }
    }
}

/// Top-level configuration for one bridge process.
#[derive(Debug, Clone, Builder)]
pub struct BridgeConfig {
    #[builder(default = "lattice-drone-bridge".to_string())]
    pub integration_name: String,
    /// Without C2 credentials the bridge flies drones but publishes nothing.
    #[builder(default = false)]
    pub mock_mode: bool,
    pub c2: Option<C2Config>,
    pub drones: Vec<DroneConfig>,
    #[builder(default = Duration::from_secs(10))]
    pub health_check_interval: Duration,
    #[builder(default)]
    pub publisher: PublisherConfig,
    #[builder(default)]
    pub policy: ExecutionPolicy,
    #[builder(default)]
    pub task_routes: TaskRoutes,
    /// How long terminal task records linger to absorb duplicate requests.
    #[builder(default = Duration::from_secs(60))]
    pub task_retention: Duration,
    /// Wait bounds for the UAV adapter protocols.
    #[builder(default)]
    pub uav_timings: crate::uav::client::UavTimings,
}
