//! Task agent: consumes the C2 long-poll request stream, validates and
//! accepts tasks, drives executors, and reports status under the monotonic
//! version protocol.
//!
//! Every task gets exactly one terminal status. Record phases are the guard:
//! whichever path (completion, cancel, complete-request, auto-fail) flips the
//! record into a terminal phase first owns the terminal update; the others
//! become no-ops. Terminal records linger for the retention window to absorb
//! duplicate requests before they are evicted.

pub mod backoff;
pub mod error;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::backoff::{backoff_delay, with_jitter};
use self::error::RejectReason;
use crate::c2::error::C2Error;
use crate::c2::C2Gateway;
use crate::c2_proto::agent_request::Request as AgentRequestKind;
use crate::c2_proto::{AgentRequest, ExecuteRequest, TaskStatusCode};
use crate::config::{ExecutionPolicy, TaskRoutes};
use crate::drone_id::DroneId;
use crate::session::{DroneSession, SessionMap};
use crate::store::{StateStore, TaskPhase};
use crate::store::error::StoreError;
use crate::tasks::error::ExecError;
use crate::tasks::{Progress, TaskKind, TaskParams};

/// Pause between the ACK and WILCO acknowledgements.
const ACK_TO_WILCO: Duration = Duration::from_millis(100);

/// Live view of one accepted task. Keyed by the server-assigned task id; the
/// execution id disambiguates re-runs of the same task id in logs.
#[derive(Debug)]
struct TaskRecord {
    execution_id: Uuid,
    drone_id: DroneId,
    kind: TaskKind,
    phase: TaskPhase,
    cancel: CancellationToken,
    started_at: Instant,
}

pub struct TaskAgent {
    c2: Arc<dyn C2Gateway>,
    store: Arc<StateStore>,
    sessions: Arc<SessionMap>,
    routes: TaskRoutes,
    policy: ExecutionPolicy,
    retention: Duration,
    records: Arc<DashMap<String, TaskRecord, ahash::RandomState>>,
}

impl TaskAgent {
    pub fn new(
        c2: Arc<dyn C2Gateway>,
        store: Arc<StateStore>,
        sessions: Arc<SessionMap>,
        routes: TaskRoutes,
        policy: ExecutionPolicy,
        retention: Duration,
    ) -> Self {
        Self {
            c2,
            store,
            sessions,
            routes,
            policy,
            retention,
            records: Arc::new(DashMap::default()),
        }
    }

    /// Listen loop. Long-poll timeouts re-poll immediately; errors back off
    /// exponentially with jitter. Cancelling the token stops the loop and
    /// cancels every in-flight executor.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Task agent listening");
        let mut consecutive_errors = 0u32;

        loop {
            let entity_ids: Vec<String> = self
                .sessions
                .drone_ids()
                .iter()
                .map(|id| id.as_str().to_string())
                .collect();

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.c2.listen_as_agent(entity_ids) => result,
            };

            match result {
                Ok(request) => {
                    consecutive_errors = 0;
                    self.dispatch(request, &cancel).await;
                }
                Err(C2Error::ListenTimeout) => {
                    consecutive_errors = 0;
                    debug!("Listen poll timed out; repolling");
                }
                Err(err) => {
                    consecutive_errors += 1;
                    let delay = with_jitter(backoff_delay(consecutive_errors));
                    warn!(
                        error = %err,
                        consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Listen failed; backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        for entry in self.records.iter() {
            entry.cancel.cancel();
        }
        info!("Task agent stopped");
    }

    async fn dispatch(self: &Arc<Self>, request: AgentRequest, parent: &CancellationToken) {
        match request.request {
            Some(AgentRequestKind::ExecuteRequest(execute)) => {
                self.handle_execute(execute, parent).await;
            }
            Some(AgentRequestKind::CancelRequest(cancel)) => {
                self.handle_cancel(&cancel.task_id).await;
            }
            Some(AgentRequestKind::CompleteRequest(complete)) => {
                self.handle_complete(&complete.task_id).await;
            }
            None => debug!("Ignoring empty agent request (keep-alive)"),
        }
    }

    async fn handle_execute(self: &Arc<Self>, execute: ExecuteRequest, parent: &CancellationToken) {
        let Some(task) = execute.task else {
            debug!("Execute request without task body; ignoring");
            return;
        };

        let task_id = task
            .version
            .as_ref()
            .map(|v| v.task_id.clone())
            .unwrap_or_default();
        let spec_url = task
            .specification
            .as_ref()
            .map(|s| s.type_url.clone())
            .unwrap_or_default();
        let assignee = task
            .relations
            .as_ref()
            .and_then(|r| r.assignee.as_ref())
            .and_then(|a| a.system.as_ref())
            .map(|s| s.entity_id.clone())
            .unwrap_or_default();

        info!(
            task_id = %task_id,
            specification = %spec_url,
            assignee = %assignee,
            "Execute request received"
        );

        if task_id.is_empty() {
            self.reject("", None, RejectReason::MissingTaskId).await;
            return;
        }
        if assignee.is_empty() {
            self.reject(&task_id, None, RejectReason::MissingAssignee).await;
            return;
        }

        let drone_id = DroneId::from(assignee.as_str());
        let Some(session) = self.sessions.get(&drone_id) else {
            self.reject(&task_id, None, RejectReason::UnknownDrone(assignee))
                .await;
            return;
        };

        // A record inside the retention window means we already saw this task
        if self.records.contains_key(&task_id) {
            warn!(task_id = %task_id, "Duplicate execute request; ignoring");
            return;
        }

        let kind = self.routes.kind_for(&spec_url);
        let params = match TaskParams::from_specification(kind, task.specification.as_ref()) {
            Ok(params) => params,
            Err(err) => {
                self.reject(&task_id, Some(&drone_id), err.into()).await;
                return;
            }
        };

        let execution_id = Uuid::new_v4();
        let exec_cancel = parent.child_token();
        self.records.insert(
            task_id.clone(),
            TaskRecord {
                execution_id,
                drone_id: drone_id.clone(),
                kind,
                phase: TaskPhase::Accepted,
                cancel: exec_cancel.clone(),
                started_at: Instant::now(),
            },
        );
        let _ = self
            .store
            .update_task_status(&drone_id, Some(&task_id), TaskPhase::Accepted, 0.0);
        info!(
            task_id = %task_id,
            kind = %kind,
            execution_id = %execution_id,
            "Task accepted"
        );

        self.send_status(&task_id, &drone_id, TaskStatusCode::StatusAck, 0.0)
            .await;
        sleep(ACK_TO_WILCO).await;
        if self.phase_of(&task_id).is_none_or(|p| p.is_terminal()) {
            return;
        }
        self.send_status(&task_id, &drone_id, TaskStatusCode::StatusWilco, 0.0)
            .await;

        if let Some(mut record) = self.records.get_mut(&task_id) {
            if record.phase.is_terminal() {
                return;
            }
            record.phase = TaskPhase::Executing;
        } else {
            return;
        }
        let _ = self
            .store
            .update_task_status(&drone_id, Some(&task_id), TaskPhase::Executing, 0.0);
        self.send_status(&task_id, &drone_id, TaskStatusCode::StatusExecuting, 0.0)
            .await;

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent
                .drive(task_id, drone_id, session, params, exec_cancel)
                .await;
        });
    }

    /// Run one executor to completion, forwarding its progress stream.
    async fn drive(
        self: Arc<Self>,
        task_id: String,
        drone_id: DroneId,
        session: Arc<DroneSession>,
        params: TaskParams,
        cancel: CancellationToken,
    ) {
        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(16);
        let execution = crate::tasks::execute(&params, &session, &self.policy, &cancel, &progress_tx);
        tokio::pin!(execution);

        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                Some(progress) = progress_rx.recv() => {
                    self.on_progress(&task_id, &drone_id, &session, progress).await;
                }
            }
        };

        match result {
            Ok(()) => {
                info!(task_id = %task_id, "Task completed");
                self.finish(&task_id, &drone_id, TaskPhase::Completed).await;
            }
            Err(ExecError::Cancelled) => {
                info!(task_id = %task_id, "Task cancelled");
                self.finish(&task_id, &drone_id, TaskPhase::Cancelled).await;
            }
            Err(err) => {
                error!(task_id = %task_id, error = %err, "Task failed");
                self.finish(&task_id, &drone_id, TaskPhase::Failed).await;
            }
        }
    }

    async fn on_progress(
        &self,
        task_id: &str,
        drone_id: &DroneId,
        session: &DroneSession,
        progress: Progress,
    ) {
        // Never report EXECUTING after the terminal status went out
        if self.phase_of(task_id).is_none_or(|p| p.is_terminal()) {
            return;
        }

        // Auto-failure: a disarm mid-task fails the task before any further
        // progress reaches the server
        if !session.snapshot().armed {
            warn!(task_id = %task_id, "Vehicle disarmed mid-task; failing task");
            if let Some(record) = self.records.get(task_id) {
                record.cancel.cancel();
            }
            self.finish(task_id, drone_id, TaskPhase::Failed).await;
            return;
        }

        match self.store.update_task_status(
            drone_id,
            Some(task_id),
            TaskPhase::Executing,
            progress.fraction,
        ) {
            Ok(()) => {}
            Err(StoreError::ProgressRegression { .. }) => {
                debug!(task_id = %task_id, "Dropping regressive progress report");
                return;
            }
            Err(err) => debug!(task_id = %task_id, error = %err, "Store update failed"),
        }

        if !progress.note.is_empty() {
            debug!(
                task_id = %task_id,
                progress = format_args!("{:.0}%", progress.fraction * 100.0),
                note = %progress.note,
                "Task progress"
            );
        }
        self.send_status(task_id, drone_id, TaskStatusCode::StatusExecuting, progress.fraction)
            .await;
    }

    async fn handle_cancel(&self, task_id: &str) {
        if task_id.is_empty() {
            warn!("Cancel request without task_id");
            return;
        }
        let Some((drone_id, cancel)) = self
            .records
            .get(task_id)
            .map(|r| (r.drone_id.clone(), r.cancel.clone()))
        else {
            debug!(task_id = %task_id, "Cancel for unknown task");
            return;
        };

        info!(task_id = %task_id, "Cancelling task");
        cancel.cancel();
        self.finish(task_id, &drone_id, TaskPhase::Cancelled).await;
    }

    async fn handle_complete(&self, task_id: &str) {
        if task_id.is_empty() {
            warn!("Complete request without task_id");
            return;
        }
        let Some(drone_id) = self.records.get(task_id).map(|r| r.drone_id.clone()) else {
            debug!(task_id = %task_id, "Complete for unknown task");
            return;
        };

        info!(task_id = %task_id, "Task marked complete by server");
        self.finish(task_id, &drone_id, TaskPhase::Completed).await;
    }

    /// Transition to a terminal phase and emit the single terminal status.
    /// Returns silently when another path already finished the task.
    async fn finish(&self, task_id: &str, drone_id: &DroneId, phase: TaskPhase) {
        if !self.try_finish(task_id, phase) {
            return;
        }

        let (code, progress) = match phase {
            TaskPhase::Completed => (TaskStatusCode::StatusDoneOk, 1.0),
            _ => (TaskStatusCode::StatusDoneNotOk, 0.0),
        };
        let _ = self
            .store
            .update_task_status(drone_id, None, phase, progress);
        self.send_status(task_id, drone_id, code, progress).await;

        if let Some(record) = self.records.get(task_id) {
            debug!(
                task_id = %task_id,
                execution_id = %record.execution_id,
                kind = %record.kind,
                phase = ?phase,
                elapsed_s = record.started_at.elapsed().as_secs(),
                "Task finished"
            );
        }
        self.schedule_eviction(task_id.to_string());
    }

    fn try_finish(&self, task_id: &str, phase: TaskPhase) -> bool {
        match self.records.get_mut(task_id) {
            Some(mut record) if !record.phase.is_terminal() => {
                record.phase = phase;
                true
            }
            _ => false,
        }
    }

    fn phase_of(&self, task_id: &str) -> Option<TaskPhase> {
        self.records.get(task_id).map(|r| r.phase)
    }

    fn schedule_eviction(&self, task_id: String) {
        let records = Arc::clone(&self.records);
        let retention = self.retention;
        tokio::spawn(async move {
            sleep(retention).await;
            if records.remove(&task_id).is_some() {
                debug!(task_id = %task_id, "Evicted terminal task record");
            }
        });
    }

    async fn reject(&self, task_id: &str, drone_id: Option<&DroneId>, reason: RejectReason) {
        warn!(task_id = %task_id, reason = %reason, "Rejecting task");
        if task_id.is_empty() {
            error!("Reject requested without task_id; cannot address a status update");
            return;
        }
        if let Err(err) = self
            .c2
            .update_task_status(
                task_id,
                TaskStatusCode::StatusDoneNotOk,
                0.0,
                drone_id.map(|d| d.as_str()),
            )
            .await
        {
            error!(task_id = %task_id, error = %err, "Failed to send rejection");
        }
    }

    async fn send_status(
        &self,
        task_id: &str,
        drone_id: &DroneId,
        code: TaskStatusCode,
        progress: f64,
    ) {
        if let Err(err) = self
            .c2
            .update_task_status(task_id, code, progress, Some(drone_id.as_str()))
            .await
        {
            error!(
                task_id = %task_id,
                status = ?code,
                error = %err,
                "Failed to send task status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    use crate::c2::testing::{
        MockC2, RecordedStatus, cancel_request, complete_request, execute_request,
        execute_request_with_params,
    };
    use crate::c2_proto;
    use crate::config::DroneConfig;
    use crate::telemetry::FlightMode;
    use crate::uav::FlightLink;
    use crate::uav::client::{UavClient, UavTimings};
    use crate::uav::sim::{SimConfig, SimHandle, SimLink};

    const DRONE: &str = "sitl-drone-1";

    struct Harness {
        mock: Arc<MockC2>,
        script: mpsc::Sender<Result<AgentRequest, C2Error>>,
        sim: SimHandle,
        store: Arc<StateStore>,
        session: Arc<DroneSession>,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn fast_timings() -> UavTimings {
        UavTimings::builder()
            .connect_retry_delay(Duration::from_millis(5))
            .connect_wait(Duration::from_secs(2))
            .arm_settle(Duration::from_millis(5))
            .takeoff_mode_wait(Duration::from_millis(100))
            .climb_wait(Duration::from_secs(5))
            .takeoff_retry_delay(Duration::from_millis(5))
            .land_wait(Duration::from_secs(5))
            .build()
    }

    async fn harness() -> Harness {
        let (mock, script) = MockC2::new();
        let store = Arc::new(StateStore::new());
        let sessions = Arc::new(SessionMap::new());

        let link = Arc::new(SimLink::new(
            SimConfig::builder()
                .connection_string("udp://:14550".to_string())
                .tick(Duration::from_millis(5))
                .max_speed_mps(500.0)
                .climb_rate_mps(200.0)
                .build(),
        ));
        let sim = link.handle();
        let client = UavClient::with_timings(
            DroneId::from(DRONE),
            Arc::clone(&link) as Arc<dyn FlightLink>,
            fast_timings(),
        );

        store.register(DroneId::from(DRONE), "udp://:14550");
        let session = Arc::new(DroneSession::new(
            DroneConfig::builder()
                .id(DRONE.to_string())
                .connection_string("udp://:14550".to_string())
                .build(),
            client,
            Arc::clone(&store),
        ));
        session.start().await.unwrap();
        sessions.insert(Arc::clone(&session)).unwrap();

        let agent = Arc::new(TaskAgent::new(
            Arc::clone(&mock) as Arc<dyn C2Gateway>,
            Arc::clone(&store),
            sessions,
            TaskRoutes::default(),
            ExecutionPolicy::default(),
            Duration::from_secs(60),
        ));
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&agent).run(cancel.clone()));

        Harness {
            mock,
            script,
            sim,
            store,
            session,
            cancel,
        }
    }

    fn relay_params(duration_s: f64) -> Vec<u8> {
        c2_proto::RelaySpec {
            relay_position: Some(c2_proto::LatLon {
                latitude_degrees: 47.3985,
                longitude_degrees: 8.5460,
            }),
            altitude_m: 20.0,
            duration_s,
        }
        .encode_to_vec()
    }

    async fn wait_for_status(
        mock: &MockC2,
        task_id: &str,
        code: TaskStatusCode,
        timeout: Duration,
    ) -> Vec<RecordedStatus> {
        tokio::time::timeout(timeout, async {
            loop {
                let statuses = mock.statuses_for(task_id);
                if statuses.iter().any(|s| s.status == code) {
                    return statuses;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {code:?} for {task_id}"))
    }

    fn assert_versions_strictly_increase(statuses: &[RecordedStatus]) {
        for pair in statuses.windows(2) {
            assert!(
                pair[1].version > pair[0].version,
                "versions not increasing: {} then {}",
                pair[0].version,
                pair[1].version
            );
        }
    }

    fn terminal_count(statuses: &[RecordedStatus]) -> usize {
        statuses
            .iter()
            .filter(|s| {
                matches!(
                    s.status,
                    TaskStatusCode::StatusDoneOk | TaskStatusCode::StatusDoneNotOk
                )
            })
            .count()
    }

    #[tokio::test]
    async fn test_monitor_task_runs_mapping_to_done_ok() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request(
                "T1",
                DRONE,
                "type.googleapis.com/anduril.tasks.v2.Monitor",
            )))
            .await
            .unwrap();

        let statuses =
            wait_for_status(&h.mock, "T1", TaskStatusCode::StatusDoneOk, Duration::from_secs(30))
                .await;

        // ACK -> WILCO -> EXECUTING ... -> DONE_OK
        assert_eq!(statuses[0].status, TaskStatusCode::StatusAck);
        assert_eq!(statuses[1].status, TaskStatusCode::StatusWilco);
        assert_eq!(statuses[2].status, TaskStatusCode::StatusExecuting);
        assert_eq!(statuses.last().unwrap().status, TaskStatusCode::StatusDoneOk);
        assert_eq!(statuses.last().unwrap().progress, 1.0);
        assert_eq!(terminal_count(&statuses), 1);
        assert_versions_strictly_increase(&statuses);

        // EXECUTING progress is non-decreasing
        let executing: Vec<f64> = statuses
            .iter()
            .filter(|s| s.status == TaskStatusCode::StatusExecuting)
            .map(|s| s.progress)
            .collect();
        assert!(executing.windows(2).all(|p| p[1] >= p[0]));

        // Store reflects the completion
        let state = h.store.get(&DroneId::from(DRONE)).unwrap();
        assert_eq!(state.task_phase, TaskPhase::Completed);
    }

    #[tokio::test]
    async fn test_cancel_mid_flight_emits_single_terminal() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request_with_params(
                "T2",
                DRONE,
                "type.googleapis.com/anduril.tasks.v2.Relay",
                relay_params(600.0),
            )))
            .await
            .unwrap();

        wait_for_status(
            &h.mock,
            "T2",
            TaskStatusCode::StatusExecuting,
            Duration::from_secs(10),
        )
        .await;

        h.script.send(Ok(cancel_request("T2"))).await.unwrap();

        let statuses = wait_for_status(
            &h.mock,
            "T2",
            TaskStatusCode::StatusDoneNotOk,
            Duration::from_secs(10),
        )
        .await;
        assert_eq!(terminal_count(&statuses), 1);
        assert_versions_strictly_increase(&statuses);

        // The terminal update outranks every earlier update for the task
        let terminal = statuses.last().unwrap();
        assert_eq!(terminal.status, TaskStatusCode::StatusDoneNotOk);

        // Executor parks the vehicle
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.sim.flight_mode() != FlightMode::Hold {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("vehicle never entered Hold");

        // No EXECUTING updates after the terminal one
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = h.mock.statuses_for("T2");
        assert_eq!(terminal_count(&after), 1);
        assert_eq!(
            after.last().unwrap().status,
            TaskStatusCode::StatusDoneNotOk
        );
    }

    #[tokio::test]
    async fn test_disarm_mid_task_auto_fails() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request_with_params(
                "T3",
                DRONE,
                "type.googleapis.com/anduril.tasks.v2.Relay",
                relay_params(600.0),
            )))
            .await
            .unwrap();

        wait_for_status(
            &h.mock,
            "T3",
            TaskStatusCode::StatusExecuting,
            Duration::from_secs(10),
        )
        .await;

        h.sim.force_disarm();

        let statuses = wait_for_status(
            &h.mock,
            "T3",
            TaskStatusCode::StatusDoneNotOk,
            Duration::from_secs(15),
        )
        .await;
        assert_eq!(terminal_count(&statuses), 1);

        let state = h.store.get(&DroneId::from(DRONE)).unwrap();
        assert_eq!(state.task_phase, TaskPhase::Failed);
        assert!(!h.session.snapshot().armed);

        // Nothing else is reported for the task after the failure
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(terminal_count(&h.mock.statuses_for("T3")), 1);
    }

    #[tokio::test]
    async fn test_unknown_assignee_is_rejected() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request(
                "T4",
                "ghost-drone",
                "type.googleapis.com/anduril.tasks.v2.Monitor",
            )))
            .await
            .unwrap();

        let statuses = wait_for_status(
            &h.mock,
            "T4",
            TaskStatusCode::StatusDoneNotOk,
            Duration::from_secs(5),
        )
        .await;
        // Straight rejection, no handshake
        assert_eq!(statuses.len(), 1);
        assert!(!h.sim.is_armed());
    }

    #[tokio::test]
    async fn test_relay_without_position_is_rejected() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request(
                "T5",
                DRONE,
                "type.googleapis.com/anduril.tasks.v2.Relay",
            )))
            .await
            .unwrap();

        let statuses = wait_for_status(
            &h.mock,
            "T5",
            TaskStatusCode::StatusDoneNotOk,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn test_keepalive_is_ignored() {
        let h = harness().await;
        h.script
            .send(Ok(AgentRequest { request: None }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.mock.recorded_statuses().is_empty());
    }

    #[tokio::test]
    async fn test_complete_request_finishes_task() {
        let h = harness().await;
        h.script
            .send(Ok(execute_request_with_params(
                "T6",
                DRONE,
                "type.googleapis.com/anduril.tasks.v2.Relay",
                relay_params(600.0),
            )))
            .await
            .unwrap();
        wait_for_status(
            &h.mock,
            "T6",
            TaskStatusCode::StatusExecuting,
            Duration::from_secs(10),
        )
        .await;

        h.script.send(Ok(complete_request("T6"))).await.unwrap();

        let statuses = wait_for_status(
            &h.mock,
            "T6",
            TaskStatusCode::StatusDoneOk,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(terminal_count(&statuses), 1);
    }

    #[tokio::test]
    async fn test_listen_error_backs_off_and_recovers() {
        let h = harness().await;
        let before = h.store.get(&DroneId::from(DRONE)).unwrap();

        h.script
            .send(Err(C2Error::Rpc(tonic::Status::unavailable("down"))))
            .await
            .unwrap();
        h.script
            .send(Ok(execute_request(
                "T7",
                "ghost-drone",
                "type.googleapis.com/anduril.tasks.v2.Monitor",
            )))
            .await
            .unwrap();

        // The error must not mutate any task state
        let after = h.store.get(&DroneId::from(DRONE)).unwrap();
        assert_eq!(after.task_phase, before.task_phase);

        // After ~1 s of backoff the loop resumes and processes the request
        let started = Instant::now();
        wait_for_status(
            &h.mock,
            "T7",
            TaskStatusCode::StatusDoneNotOk,
            Duration::from_secs(5),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_millis(900));
    }
}
