//! Gateway to the C2 platform.
//!
//! [`C2Gateway`] is the seam the publisher and task agent work against;
//! [`C2Client`] is the tonic implementation. The gateway owns the
//! process-wide status-version counter: every outbound task status update
//! increments it and attaches the new value, which is how the server totally
//! orders updates from this process.

pub mod error;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tonic::Request;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tracing::{debug, info};

use self::error::C2Error;
use crate::c2_proto::entity_manager_api_client::EntityManagerApiClient;
use crate::c2_proto::task_manager_api_client::TaskManagerApiClient;
use crate::c2_proto::{
    AgentRequest, Entity, EntityIdsSelector, ListenAsAgentRequest, Principal,
    PublishEntityRequest, System, TaskStatus, TaskStatusCode, UpdateTaskStatusRequest,
};
use crate::config::C2Config;

/// Extra slack on top of the server-side long-poll window before the client
/// gives up on a listen call.
const LISTEN_GRACE: Duration = Duration::from_secs(5);

/// Operations the bridge needs from the C2 platform.
#[async_trait]
pub trait C2Gateway: Send + Sync {
    /// Idempotent entity upsert keyed by `entity_id`.
    async fn publish_entity(&self, entity: Entity) -> Result<(), C2Error>;

    /// Send a task status update under a freshly incremented status version.
    /// Returns the version that was attached.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatusCode,
        progress: f64,
        author_entity_id: Option<&str>,
    ) -> Result<u64, C2Error>;

    /// Long-poll for the next agent request addressed to the given entities.
    /// Resolves with [`C2Error::ListenTimeout`] when the window elapses.
    async fn listen_as_agent(&self, entity_ids: Vec<String>) -> Result<AgentRequest, C2Error>;
}

/// tonic-backed gateway with bearer-token metadata on every call.
pub struct C2Client {
    entities: EntityManagerApiClient<Channel>,
    tasks: TaskManagerApiClient<Channel>,
    auth: MetadataValue<tonic::metadata::Ascii>,
    sandbox: Option<MetadataValue<tonic::metadata::Ascii>>,
    listen_timeout: Duration,
    status_version: AtomicU64,
    service_name: String,
}

impl C2Client {
    pub async fn connect(config: &C2Config, integration_name: &str) -> Result<Self, C2Error> {
        let channel = Channel::from_shared(config.url.clone())
            .map_err(|err| C2Error::InvalidEndpoint(err.to_string()))?
            .connect()
            .await?;

        let auth = MetadataValue::try_from(format!("Bearer {}", config.environment_token))
            .map_err(|_| C2Error::InvalidCredentials)?;
        let sandbox = config
            .sandboxes_token
            .as_ref()
            .map(|token| MetadataValue::try_from(format!("Bearer {token}")))
            .transpose()
            .map_err(|_| C2Error::InvalidCredentials)?;

        info!(url = %config.url, "Connected to C2 platform");

        Ok(Self {
            entities: EntityManagerApiClient::new(channel.clone()),
            tasks: TaskManagerApiClient::new(channel),
            auth,
            sandbox,
            listen_timeout: config.listen_timeout,
            status_version: AtomicU64::new(0),
            service_name: integration_name.to_string(),
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert("authorization", self.auth.clone());
        if let Some(sandbox) = &self.sandbox {
            metadata.insert("anduril-sandbox-authorization", sandbox.clone());
        }
        request
    }
}

#[async_trait]
impl C2Gateway for C2Client {
    async fn publish_entity(&self, entity: Entity) -> Result<(), C2Error> {
        let request = self.request(PublishEntityRequest {
            entity: Some(entity),
        });
        self.entities.clone().publish_entity(request).await?;
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatusCode,
        progress: f64,
        author_entity_id: Option<&str>,
    ) -> Result<u64, C2Error> {
        let version = self.status_version.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            task_id,
            status = ?status,
            progress,
            status_version = version,
            "Updating task status"
        );

        let request = self.request(UpdateTaskStatusRequest {
            task_id: task_id.to_string(),
            new_status: Some(TaskStatus {
                status: status as i32,
                progress,
            }),
            status_version: version,
            author: author_entity_id.map(|entity_id| Principal {
                system: Some(System {
                    entity_id: entity_id.to_string(),
                    service_name: self.service_name.clone(),
                }),
            }),
        });
        self.tasks.clone().update_task_status(request).await?;
        Ok(version)
    }

    async fn listen_as_agent(&self, entity_ids: Vec<String>) -> Result<AgentRequest, C2Error> {
        let mut request = self.request(ListenAsAgentRequest {
            agent_selector: Some(EntityIdsSelector { entity_ids }),
        });
        request.set_timeout(self.listen_timeout + LISTEN_GRACE);

        match self.tasks.clone().listen_as_agent(request).await {
            Ok(response) => Ok(response.into_inner()),
            Err(status) if status.code() == tonic::Code::DeadlineExceeded => {
                Err(C2Error::ListenTimeout)
            }
            Err(status) => Err(status.into()),
        }
    }
}

/// `SystemTime` → protobuf timestamp.
pub fn timestamp(time: SystemTime) -> prost_types::Timestamp {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    prost_types::Timestamp {
        seconds: since_epoch.as_secs() as i64,
        nanos: since_epoch.subsec_nanos() as i32,
    }
}

pub fn timestamp_now() -> prost_types::Timestamp {
    timestamp(SystemTime::now())
}

pub fn timestamp_in(duration: Duration) -> prost_types::Timestamp {
    timestamp(SystemTime::now() + duration)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory gateway for loop tests.

    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;
    use crate::c2_proto::{
        AgentTask, CancelRequest, CompleteRequest, ExecuteRequest, TaskRelations, TaskVersion,
        agent_request,
    };

    #[derive(Debug, Clone)]
    pub struct RecordedStatus {
        pub task_id: String,
        pub status: TaskStatusCode,
        pub progress: f64,
        pub version: u64,
    }

    pub struct MockC2 {
        pub entities: Mutex<Vec<Entity>>,
        pub statuses: Mutex<Vec<RecordedStatus>>,
        status_version: AtomicU64,
        inbound: tokio::sync::Mutex<mpsc::Receiver<Result<AgentRequest, C2Error>>>,
        publish_failures: AtomicU64,
    }

    impl MockC2 {
        pub fn new() -> (std::sync::Arc<Self>, mpsc::Sender<Result<AgentRequest, C2Error>>) {
            let (tx, rx) = mpsc::channel(16);
            let mock = std::sync::Arc::new(Self {
                entities: Mutex::new(Vec::new()),
                statuses: Mutex::new(Vec::new()),
                status_version: AtomicU64::new(0),
                inbound: tokio::sync::Mutex::new(rx),
                publish_failures: AtomicU64::new(0),
            });
            (mock, tx)
        }

        /// Make the next `n` publish calls fail with an RPC error.
        pub fn fail_next_publishes(&self, n: u64) {
            self.publish_failures.store(n, Ordering::SeqCst);
        }

        pub fn recorded_statuses(&self) -> Vec<RecordedStatus> {
            self.statuses.lock().expect("statuses lock").clone()
        }

        pub fn statuses_for(&self, task_id: &str) -> Vec<RecordedStatus> {
            self.recorded_statuses()
                .into_iter()
                .filter(|s| s.task_id == task_id)
                .collect()
        }

        pub fn published_entities(&self) -> Vec<Entity> {
            self.entities.lock().expect("entities lock").clone()
        }
    }

    #[async_trait]
    impl C2Gateway for MockC2 {
        async fn publish_entity(&self, entity: Entity) -> Result<(), C2Error> {
            if self.publish_failures.load(Ordering::SeqCst) > 0 {
                self.publish_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(C2Error::Rpc(tonic::Status::unavailable("injected")));
            }
            self.entities.lock().expect("entities lock").push(entity);
            Ok(())
        }

        async fn update_task_status(
            &self,
            task_id: &str,
            status: TaskStatusCode,
            progress: f64,
            _author_entity_id: Option<&str>,
        ) -> Result<u64, C2Error> {
            let version = self.status_version.fetch_add(1, Ordering::SeqCst) + 1;
            self.statuses.lock().expect("statuses lock").push(RecordedStatus {
                task_id: task_id.to_string(),
                status,
                progress,
                version,
            });
            Ok(version)
        }

        async fn listen_as_agent(
            &self,
            _entity_ids: Vec<String>,
        ) -> Result<AgentRequest, C2Error> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(result) => result,
                // Script exhausted: behave like an idle long poll
                None => futures::future::pending().await,
            }
        }
    }

    pub fn execute_request(task_id: &str, assignee: &str, spec_url: &str) -> AgentRequest {
        execute_request_with_params(task_id, assignee, spec_url, Vec::new())
    }

    pub fn execute_request_with_params(
        task_id: &str,
        assignee: &str,
        spec_url: &str,
        params: Vec<u8>,
    ) -> AgentRequest {
        AgentRequest {
            request: Some(agent_request::Request::ExecuteRequest(ExecuteRequest {
                task: Some(AgentTask {
                    version: Some(TaskVersion {
                        task_id: task_id.to_string(),
                    }),
                    specification: Some(prost_types::Any {
                        type_url: spec_url.to_string(),
                        value: params,
                    }),
                    relations: Some(TaskRelations {
                        assignee: Some(Principal {
                            system: Some(System {
                                entity_id: assignee.to_string(),
                                service_name: String::new(),
                            }),
                        }),
                    }),
                }),
            })),
        }
    }

    pub fn cancel_request(task_id: &str) -> AgentRequest {
        AgentRequest {
            request: Some(agent_request::Request::CancelRequest(CancelRequest {
                task_id: task_id.to_string(),
            })),
        }
    }

    pub fn complete_request(task_id: &str) -> AgentRequest {
        AgentRequest {
            request: Some(agent_request::Request::CompleteRequest(CompleteRequest {
                task_id: task_id.to_string(),
            })),
        }
    }
}
