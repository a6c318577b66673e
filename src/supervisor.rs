//! Top-level lifecycle: brings up one session per configured drone, starts
//! the publisher and task agent, watches link health, and shuts everything
//! down in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::TaskAgent;
use crate::c2::C2Gateway;
use crate::config::{BridgeConfig, DroneConfig};
use crate::drone_id::DroneId;
use crate::publisher::AssetPublisher;
use crate::session::{DroneSession, SessionMap};
use crate::store::{LinkStatus, StateChange, StateStore, log_transition};
use crate::uav::FlightLink;
use crate::uav::client::UavClient;

/// Builds the flight link for one configured drone. The default binary wires
/// in the simulated link; a hardware deployment plugs its MAVLink-backed
/// implementation in here.
pub type LinkFactory = Box<dyn Fn(&DroneConfig) -> Arc<dyn FlightLink> + Send + Sync>;

/// Reconnect attempts per health cycle, so one flapping vehicle cannot starve
/// the rest of the fleet.
const MAX_RECONNECTS_PER_CYCLE: usize = 2;

pub struct Supervisor {
    config: BridgeConfig,
    c2: Option<Arc<dyn C2Gateway>>,
    link_factory: LinkFactory,
    store: Arc<StateStore>,
    sessions: Arc<SessionMap>,
    agent_cancel: CancellationToken,
    publisher_cancel: CancellationToken,
    background_cancel: CancellationToken,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: BridgeConfig,
        c2: Option<Arc<dyn C2Gateway>>,
        link_factory: LinkFactory,
    ) -> Self {
        Self {
            config,
            c2,
            link_factory,
            store: Arc::new(StateStore::new()),
            sessions: Arc::new(SessionMap::new()),
            agent_cancel: CancellationToken::new(),
            publisher_cancel: CancellationToken::new(),
            background_cancel: CancellationToken::new(),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    pub fn sessions(&self) -> Arc<SessionMap> {
        Arc::clone(&self.sessions)
    }

    /// Bring up sessions sequentially, then the publisher, agent, health
    /// loop, and notification logger. A drone that fails to connect is logged
    /// and skipped; it does not abort startup.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(drones = self.config.drones.len(), "Starting drone bridge");

        for drone_config in &self.config.drones {
            let drone_id = DroneId::from(drone_config.id.as_str());
            let link = (self.link_factory)(drone_config);
            let client = UavClient::with_timings(
                drone_id.clone(),
                link,
                self.config.uav_timings.clone(),
            );
            self.store
                .register(drone_id.clone(), &drone_config.connection_string);

            let session = Arc::new(DroneSession::new(
                drone_config.clone(),
                client,
                Arc::clone(&self.store),
            ));
            match session.start().await {
                Ok(()) => {
                    if let Err(err) = self.sessions.insert(session) {
                        error!(drone_id = %drone_id, error = %err, "Session registration failed");
                    }
                }
                Err(err) => {
                    error!(
                        drone_id = %drone_id,
                        error = %err,
                        "Failed to connect drone; continuing without it"
                    );
                }
            }
        }

        let mut running = self.running.lock().expect("task list lock poisoned");

        match (&self.c2, self.config.mock_mode, self.sessions.is_empty()) {
            (Some(c2), false, false) => {
                let publisher = Arc::new(AssetPublisher::new(
                    Arc::clone(c2),
                    Arc::clone(&self.sessions),
                    Arc::clone(&self.store),
                    self.config.publisher.clone(),
                    self.config.integration_name.clone(),
                ));
                running.push(tokio::spawn(publisher.run(self.publisher_cancel.clone())));

                let agent = Arc::new(TaskAgent::new(
                    Arc::clone(c2),
                    Arc::clone(&self.store),
                    Arc::clone(&self.sessions),
                    self.config.task_routes.clone(),
                    self.config.policy.clone(),
                    self.config.task_retention,
                ));
                running.push(tokio::spawn(agent.run(self.agent_cancel.clone())));
            }
            (None, _, _) | (_, true, _) => {
                warn!("Mock mode: C2 publisher and task agent disabled");
            }
            (_, _, true) => {
                warn!("No drone session came up; C2 publisher and task agent disabled");
            }
        }

        running.push(tokio::spawn(health_loop(
            Arc::clone(&self.sessions),
            Arc::clone(&self.store),
            self.config.health_check_interval,
            self.background_cancel.clone(),
        )));
        running.push(tokio::spawn(notification_logger(
            self.store.subscribe(),
            self.background_cancel.clone(),
        )));

        info!(sessions = self.sessions.len(), "Bridge started");
        Ok(())
    }

    /// Ordered shutdown: agent first so no new executors spawn, then the
    /// publisher, then every session.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.agent_cancel.cancel();
        self.publisher_cancel.cancel();
        self.background_cancel.cancel();

        let running = std::mem::take(&mut *self.running.lock().expect("task list lock poisoned"));
        for task in running {
            let _ = task.await;
        }

        for session in self.sessions.all() {
            session.stop().await;
            let _ = self.sessions.remove(session.drone_id());
        }

        info!("Bridge shutdown complete");
    }
}

/// Reconnect sessions whose adapter dropped the link, a bounded number per
/// cycle.
async fn health_loop(
    sessions: Arc<SessionMap>,
    store: Arc<StateStore>,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let mut attempts = 0;
        for session in sessions.all() {
            if session.is_connected() {
                continue;
            }
            if attempts >= MAX_RECONNECTS_PER_CYCLE {
                break;
            }
            attempts += 1;

            warn!(
                drone_id = %session.drone_id(),
                "Drone disconnected; attempting reconnect"
            );
            match session.reconnect().await {
                Ok(()) => info!(drone_id = %session.drone_id(), "Reconnected"),
                Err(err) => {
                    error!(
                        drone_id = %session.drone_id(),
                        error = %err,
                        "Reconnect failed"
                    );
                    let _ = store.set_link_status(session.drone_id(), LinkStatus::Error);
                }
            }
        }
    }
}

/// Logs significant state transitions off the store's notification bus.
async fn notification_logger(
    mut changes: tokio::sync::broadcast::Receiver<StateChange>,
    cancel: CancellationToken,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = changes.recv() => match result {
                Ok(change) => log_transition(&change),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }
}
