//! Test instance lifecycle.
//!
//! A test instance is an environment running the target application against
//! which content tests execute. This module drives one instance from
//! nothing to test-ready and back:
//!
//! ```text
//! Uninitialized ─► Provisioning ─► Configuring ─► HealthChecking ─► Ready
//!                                                                  │  ▲
//!                                                                  ▼  │
//!                                                               Executing
//!                                                                  │
//!        (any non-terminal state) ─► Errored ─► TearingDown ─► Terminated
//! ```
//!
//! # Architecture
//!
//! - [`InstanceManager`] is the capability set the scheduler drives:
//!   provision, configure, check health, execute, tear down.
//! - [`LifecycleManager`] implements it once, generic over an
//!   [`InstanceBackend`] (how the resource is acquired and released) and an
//!   [`ApplicationApi`] (how the application is spoken to).
//!
//! | Backend | Module | Provision | Teardown |
//! |---------|--------|-----------|----------|
//! | Docker | [`docker`] | Create and start a container | Force-remove it |
//! | Remote | [`remote`] | Claim a host and check reachability | Release the claim |

pub mod api;
pub mod docker;
pub mod remote;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::InstanceConfig;
use crate::job::{JobOutcome, TestJob};
use crate::retry::BackoffPolicy;

pub use api::{ApiError, ApplicationApi, RestApi, Session, TestReport};

/// Result type for lifecycle operations.
pub type InfraResult<T> = Result<T, InfraError>;

/// Infrastructure failures. None of these say anything about the content
/// under test.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// The backend could not allocate the resource.
    #[error("Failed to provision instance: {0}")]
    ProvisionFailed(String),

    /// Every configured remote host is already in use.
    #[error("No remote host available: {0}")]
    NoHostAvailable(String),

    /// The instance could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded wait ran out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Health polling exhausted its attempt budget.
    #[error("Instance {id} failed health checks after {attempts} attempt(s)")]
    Unhealthy {
        /// Instance identifier.
        id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// An operation was attempted from a state that does not allow it.
    #[error("Instance {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Instance identifier.
        id: String,
        /// Current state.
        from: LifecycleState,
        /// Requested state.
        to: LifecycleState,
    },

    /// The application API failed while configuring the instance.
    #[error("Application API error: {0}")]
    Api(#[from] ApiError),

    /// Releasing the backend resource failed.
    #[error("Failed to tear down instance: {0}")]
    TeardownFailed(String),
}

/// Lifecycle states of a test instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Created in memory; nothing allocated.
    Uninitialized,
    /// Backend resource being allocated.
    Provisioning,
    /// Application session being established.
    Configuring,
    /// Waiting for the readiness signal.
    HealthChecking,
    /// Idle and able to accept a job.
    Ready,
    /// Running exactly one job.
    Executing,
    /// Backend resource being released.
    TearingDown,
    /// Resource released. Terminal.
    Terminated,
    /// Failed; only teardown remains.
    Errored,
}

impl LifecycleState {
    /// Returns `true` if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Errored) => self != Errored,
            (_, TearingDown) => self != TearingDown,
            (Uninitialized, Provisioning)
            | (Provisioning, Configuring)
            | (Configuring, HealthChecking)
            | (HealthChecking, Ready)
            | (Ready, Executing)
            | (Executing, Ready)
            | (TearingDown, Terminated) => true,
            _ => false,
        }
    }

    /// Returns `true` once nothing further can happen.
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of backend an instance lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Ephemeral container.
    Docker,
    /// Pre-existing host.
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => f.write_str("docker"),
            BackendKind::Remote => f.write_str("remote"),
        }
    }
}

/// Application login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// What the backend needs to allocate one instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Instance identifier, used as the container name.
    pub name: String,
    /// Application admin password to bake into a fresh instance.
    pub password: String,
}

/// A single test instance. Owned by exactly one worker.
#[derive(Debug)]
pub struct TestInstance {
    /// Unique identifier.
    pub id: String,

    /// Backend the instance lives on.
    pub backend: BackendKind,

    /// Backend handle (container id or host), once provisioned.
    pub handle: Option<String>,

    /// `host:port` of the application API, once provisioned.
    pub address: Option<String>,

    /// Application login.
    pub credentials: Credentials,

    /// Authenticated session, once configured.
    pub session: Option<Session>,

    /// Health probes made so far.
    pub health_attempts: u32,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    state: LifecycleState,
}

impl TestInstance {
    /// Creates an uninitialized instance.
    pub fn new(id: impl Into<String>, backend: BackendKind, credentials: Credentials) -> Self {
        Self {
            id: id.into(),
            backend,
            handle: None,
            address: None,
            credentials,
            session: None,
            health_attempts: 0,
            created_at: Utc::now(),
            state: LifecycleState::Uninitialized,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: LifecycleState) -> InfraResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(InfraError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!("Instance {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Moves to [`LifecycleState::Errored`] unless already terminal or errored.
    pub fn fail(&mut self) {
        if self.state.can_transition_to(LifecycleState::Errored) {
            self.state = LifecycleState::Errored;
        }
    }

    fn address_or_err(&self) -> InfraResult<&str> {
        self.address
            .as_deref()
            .ok_or_else(|| InfraError::Connection(format!("instance {} has no address", self.id)))
    }
}

/// Acquires and releases the resource behind a test instance.
#[async_trait]
pub trait InstanceBackend: Send + Sync {
    /// Backend kind, for logging and instance metadata.
    fn kind(&self) -> BackendKind;

    /// Allocates a resource and returns its handle.
    async fn create(&self, spec: &InstanceSpec) -> InfraResult<String>;

    /// `host:port` of the application API on `handle`.
    async fn address(&self, handle: &str) -> InfraResult<String>;

    /// Releases `handle`. Releasing an already released handle succeeds.
    async fn destroy(&self, handle: &str) -> InfraResult<()>;
}

/// The capability set the scheduler drives an instance through.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &str;

    /// Backoff used while waiting for readiness.
    fn health_policy(&self) -> &BackoffPolicy;

    /// Allocates a new instance. On error nothing is left allocated.
    async fn provision(&self) -> InfraResult<TestInstance>;

    /// Establishes the application session and test permissions.
    async fn configure(&self, instance: &mut TestInstance) -> InfraResult<()>;

    /// One readiness probe.
    async fn check_health(&self, instance: &mut TestInstance) -> bool;

    /// Runs `job` on a ready instance.
    async fn execute(&self, instance: &mut TestInstance, job: &TestJob) -> JobOutcome;

    /// Releases the instance. Safe to call more than once.
    async fn teardown(&self, instance: &mut TestInstance) -> InfraResult<()>;
}

/// Takes a freshly provisioned instance to [`LifecycleState::Ready`].
///
/// Configures the application, then polls [`InstanceManager::check_health`]
/// with the manager's backoff policy. On failure the instance is left in
/// [`LifecycleState::Errored`]; the caller still owns teardown.
pub async fn bring_up<M: InstanceManager + ?Sized>(
    manager: &M,
    instance: &mut TestInstance,
) -> InfraResult<()> {
    manager.configure(instance).await?;
    instance.transition(LifecycleState::HealthChecking)?;

    let policy = manager.health_policy();
    for attempt in 1..=policy.attempts() {
        if manager.check_health(instance).await {
            instance.transition(LifecycleState::Ready)?;
            info!("Instance {} is ready", instance.id);
            return Ok(());
        }
        if attempt < policy.attempts() {
            let delay = policy.delay_for(attempt);
            debug!(
                "Instance {} not healthy (attempt {}), retrying in {:?}",
                instance.id, attempt, delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    instance.fail();
    Err(InfraError::Unhealthy {
        id: instance.id.clone(),
        attempts: instance.health_attempts,
    })
}

/// [`InstanceManager`] over any backend and application API.
pub struct LifecycleManager<B, A> {
    backend: B,
    api: A,
    config: InstanceConfig,
}

impl<B: InstanceBackend, A: ApplicationApi> LifecycleManager<B, A> {
    /// Creates a manager.
    pub fn new(backend: B, api: A, config: InstanceConfig) -> Self {
        Self {
            backend,
            api,
            config,
        }
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(&self.config.username, &self.config.password)
    }

    /// Polls liveness until the application answers or the budget runs out.
    async fn wait_until_live(&self, instance: &TestInstance, address: &str) -> InfraResult<()> {
        let policy = &self.config.startup;
        let mut last_error = String::from("not live");
        for attempt in 1..=policy.attempts() {
            match self.api.is_live(address, &instance.credentials).await {
                Ok(true) => return Ok(()),
                Ok(false) => last_error = "application reports unhealthy".to_string(),
                Err(e) => last_error = e.to_string(),
            }
            if attempt < policy.attempts() {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
        Err(InfraError::Timeout(format!(
            "instance {} at {} did not come up after {} attempt(s): {}",
            instance.id,
            address,
            policy.attempts(),
            last_error
        )))
    }

    async fn release(&self, instance: &TestInstance, handle: &str) {
        if let Err(e) = self.backend.destroy(handle).await {
            warn!("Failed to release {} after provisioning error: {}", instance.id, e);
        }
    }
}

#[async_trait]
impl<B: InstanceBackend, A: ApplicationApi> InstanceManager for LifecycleManager<B, A> {
    fn name(&self) -> &str {
        match self.backend.kind() {
            BackendKind::Docker => "docker",
            BackendKind::Remote => "remote",
        }
    }

    fn health_policy(&self) -> &BackoffPolicy {
        &self.config.health
    }

    async fn provision(&self) -> InfraResult<TestInstance> {
        let id = format!("retest-{}", uuid::Uuid::new_v4());
        let mut instance = TestInstance::new(id, self.backend.kind(), self.credentials());
        instance.transition(LifecycleState::Provisioning)?;

        let spec = InstanceSpec {
            name: instance.id.clone(),
            password: self.config.password.clone(),
        };
        let handle = self.backend.create(&spec).await?;

        let address = match self.backend.address(&handle).await {
            Ok(address) => address,
            Err(e) => {
                self.release(&instance, &handle).await;
                return Err(e);
            }
        };

        if let Err(e) = self.wait_until_live(&instance, &address).await {
            self.release(&instance, &handle).await;
            return Err(e);
        }

        info!(
            "Provisioned {} instance {} at {}",
            instance.backend, instance.id, address
        );
        instance.handle = Some(handle);
        instance.address = Some(address);
        Ok(instance)
    }

    async fn configure(&self, instance: &mut TestInstance) -> InfraResult<()> {
        instance.transition(LifecycleState::Configuring)?;

        let result = async {
            let address = instance.address_or_err()?.to_string();
            let session = self
                .api
                .authenticate(&address, &instance.credentials)
                .await?;

            if !self.config.imported_roles.is_empty() {
                let user = &instance.credentials.username;
                self.api
                    .import_roles(&session, user, &self.config.imported_roles)
                    .await?;
            }
            if !self.config.delete_indexes.is_empty() {
                self.api
                    .allow_delete_indexes(&session, &self.config.delete_indexes)
                    .await?;
            }
            Ok::<_, InfraError>(session)
        }
        .await;

        match result {
            Ok(session) => {
                debug!("Configured instance {}", instance.id);
                instance.session = Some(session);
                Ok(())
            }
            Err(e) => {
                instance.fail();
                Err(e)
            }
        }
    }

    async fn check_health(&self, instance: &mut TestInstance) -> bool {
        instance.health_attempts += 1;
        let Some(address) = instance.address.as_deref() else {
            return false;
        };
        match self.api.is_live(address, &instance.credentials).await {
            Ok(live) => live,
            Err(e) => {
                debug!("Health probe of {} failed: {}", instance.id, e);
                false
            }
        }
    }

    async fn execute(&self, instance: &mut TestInstance, job: &TestJob) -> JobOutcome {
        if let Err(e) = instance.transition(LifecycleState::Executing) {
            return JobOutcome::InfraError {
                message: e.to_string(),
            };
        }
        let Some(session) = instance.session.clone() else {
            instance.fail();
            return JobOutcome::InfraError {
                message: format!("instance {} has no session", instance.id),
            };
        };

        let outcome = match self.api.run_test(&session, &job.item).await {
            Ok(report) if report.passed => JobOutcome::Passed {
                output: report.output,
            },
            Ok(report) => JobOutcome::Failed {
                output: report.output,
            },
            Err(e) if e.is_infrastructure() => JobOutcome::InfraError {
                message: e.to_string(),
            },
            Err(e) => JobOutcome::Failed {
                output: e.to_string(),
            },
        };

        if let Err(e) = instance.transition(LifecycleState::Ready) {
            warn!("{}", e);
        }
        outcome
    }

    async fn teardown(&self, instance: &mut TestInstance) -> InfraResult<()> {
        if instance.state().is_terminal() {
            return Ok(());
        }
        instance.transition(LifecycleState::TearingDown)?;

        let result = match instance.handle.take() {
            Some(handle) => self.backend.destroy(&handle).await,
            None => Ok(()),
        };
        instance.session = None;
        instance.state = LifecycleState::Terminated;

        match &result {
            Ok(()) => info!("Tore down instance {}", instance.id),
            Err(e) => warn!("Teardown of instance {} failed: {}", instance.id, e),
        }
        result
    }
}
