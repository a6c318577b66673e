//! Asset publisher: advertises each managed drone to the C2 as a live,
//! taskable entity.
//!
//! Every drone gets two independent loops: a position loop (~3 Hz) keeping
//! the map smooth and a slower status loop (~0.8 Hz) refreshing liveness.
//! Publish failures retry on the next tick; a drone whose session lost its
//! link is skipped entirely.

pub mod entity;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::entity::{EntityAssembly, LocationQuality, build_entity};
use crate::c2::C2Gateway;
use crate::config::PublisherConfig;
use crate::session::{DroneSession, SessionMap};
use crate::store::{LinkStatus, StateStore};

/// Minimum-interval gate for noisy log statements.
#[derive(Debug)]
pub struct LogThrottle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// True when enough time has passed since the last accepted log; marks
    /// the moment as used.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Position,
    Status,
}

pub struct AssetPublisher {
    c2: Arc<dyn C2Gateway>,
    sessions: Arc<SessionMap>,
    store: Arc<StateStore>,
    config: PublisherConfig,
    integration_name: String,
}

impl AssetPublisher {
    pub fn new(
        c2: Arc<dyn C2Gateway>,
        sessions: Arc<SessionMap>,
        store: Arc<StateStore>,
        config: PublisherConfig,
        integration_name: String,
    ) -> Self {
        Self {
            c2,
            sessions,
            store,
            config,
            integration_name,
        }
    }

    /// Spawn the per-drone loops and park until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(drones = self.sessions.len(), "Asset publisher starting");

        let mut loops = Vec::new();
        for session in self.sessions.all() {
            loops.push(tokio::spawn(publish_loop(
                Arc::clone(&self),
                Arc::clone(&session),
                LoopKind::Position,
                cancel.clone(),
            )));
            loops.push(tokio::spawn(publish_loop(
                Arc::clone(&self),
                session,
                LoopKind::Status,
                cancel.clone(),
            )));
        }

        cancel.cancelled().await;
        for task in loops {
            let _ = task.await;
        }
        info!("Asset publisher stopped");
    }
}

async fn publish_loop(
    publisher: Arc<AssetPublisher>,
    session: Arc<DroneSession>,
    kind: LoopKind,
    cancel: CancellationToken,
) {
    let rate_hz = match kind {
        LoopKind::Position => publisher.config.position_rate_hz,
        LoopKind::Status => publisher.config.status_rate_hz,
    };
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rate_hz));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut success_info = LogThrottle::new(publisher.config.publish_info_interval);
    let mut invalid_warn = LogThrottle::new(publisher.config.invalid_warn_interval);
    let mut defer_note = LogThrottle::new(publisher.config.invalid_warn_interval);

    let drone_id = session.drone_id().clone();
    debug!(drone_id = %drone_id, kind = ?kind, rate_hz, "Publish loop started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // A failed or disconnected UAV is not advertised
        if !session.is_connected() {
            continue;
        }

        if kind == LoopKind::Status {
            if let Some(state) = publisher.store.get(&drone_id) {
                if state.link_status != LinkStatus::Connected {
                    continue;
                }
                debug!(
                    drone_id = %drone_id,
                    task = state.current_task_id.as_deref().unwrap_or("-"),
                    phase = ?state.task_phase,
                    progress = format_args!("{:.2}", state.task_progress),
                    "Status frame"
                );
            }
        }

        let snapshot = session.snapshot();
        let assembly = EntityAssembly {
            drone_id: &drone_id,
            integration_name: &publisher.integration_name,
            expiry: publisher.config.entity_expiry,
        };
        let Some((entity, quality)) = build_entity(&assembly, &snapshot) else {
            if defer_note.ready() {
                debug!(drone_id = %drone_id, "No location available yet; deferring publish");
            }
            continue;
        };

        if quality == LocationQuality::Cached && invalid_warn.ready() {
            warn!(
                drone_id = %drone_id,
                gps_fix = snapshot.gps_fix_type.unwrap_or(0),
                "Invalid location; publishing cached fix with uncertainty"
            );
        }

        match publisher.c2.publish_entity(entity).await {
            Ok(()) => {
                if success_info.ready() {
                    info!(drone_id = %drone_id, kind = ?kind, "Published entity");
                } else {
                    debug!(drone_id = %drone_id, kind = ?kind, "Published entity");
                }
            }
            Err(err) => {
                warn!(
                    drone_id = %drone_id,
                    error = %err,
                    "Entity publish failed; retrying next tick"
                );
            }
        }
    }

    debug!(drone_id = %drone_id, kind = ?kind, "Publish loop stopped");
}
