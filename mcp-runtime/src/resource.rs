use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlbridge_core::connection::{ConnectParams, ConnectionProvider, SqlConnection};
use sqlbridge_core::error::DriverError;
use sqlbridge_core::result::ToolFailure;

use crate::offload::BlockingPool;

/// Shared handle to the one live connection.
///
/// Clones point at the same slot. The mutex serializes every operation, so a
/// connection that is not safe for concurrent use is only ever touched by one
/// worker at a time. Once released the slot is empty and further operations
/// fail with [`DriverError::Closed`].
#[derive(Clone)]
pub struct DbHandle {
    slot: Arc<Mutex<Option<Box<dyn SqlConnection>>>>,
}

impl DbHandle {
    pub fn new(connection: Box<dyn SqlConnection>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(connection))),
        }
    }

    /// Runs `op` with exclusive access to the connection. Blocks; call it from
    /// a worker thread.
    pub fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut dyn SqlConnection) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = guard.as_mut().ok_or(DriverError::Closed)?;
        op(connection.as_mut())
    }

    fn close(&self) -> Result<(), DriverError> {
        let taken = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match taken {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Uninitialized,
    Acquiring,
    Ready,
    Degraded,
    Releasing,
    Closed,
}

enum ResourceState {
    Uninitialized,
    Acquiring,
    Ready(DbHandle),
    Degraded { reason: String },
    Releasing,
    Closed,
}

impl ResourceState {
    fn phase(&self) -> LifecyclePhase {
        match self {
            ResourceState::Uninitialized => LifecyclePhase::Uninitialized,
            ResourceState::Acquiring => LifecyclePhase::Acquiring,
            ResourceState::Ready(_) => LifecyclePhase::Ready,
            ResourceState::Degraded { .. } => LifecyclePhase::Degraded,
            ResourceState::Releasing => LifecyclePhase::Releasing,
            ResourceState::Closed => LifecyclePhase::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub phase: LifecyclePhase,
    pub provider: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
}

/// Lifecycle-scoped holder of the server's database connection.
///
/// `Uninitialized -> Acquiring -> {Ready | Degraded} -> Releasing -> Closed`.
/// Acquisition never fails outright: a fault leaves the context `Degraded` and
/// every consumer gets a `ResourceUnavailable` failure instead of a handle.
pub struct ResourceContext {
    state: RwLock<ResourceState>,
    meta: Mutex<ResourceMeta>,
}

#[derive(Default)]
struct ResourceMeta {
    provider: Option<&'static str>,
    acquired_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceContext {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ResourceState::Uninitialized),
            meta: Mutex::new(ResourceMeta::default()),
        }
    }

    /// Builds a context and connects it. The connect call runs on the
    /// blocking pool.
    pub async fn acquire(
        provider: Arc<dyn ConnectionProvider>,
        params: ConnectParams,
        pool: &BlockingPool,
    ) -> Arc<Self> {
        let context = Arc::new(Self::new());
        context.start(provider, params, pool).await;
        context
    }

    pub async fn start(
        &self,
        provider: Arc<dyn ConnectionProvider>,
        params: ConnectParams,
        pool: &BlockingPool,
    ) {
        {
            let mut state = self.write_state();
            if !matches!(*state, ResourceState::Uninitialized) {
                tracing::warn!(
                    event = "resource_start_ignored",
                    phase = ?state.phase(),
                    "Resource context already started"
                );
                return;
            }
            *state = ResourceState::Acquiring;
        }

        let provider_name = provider.name();
        self.meta().provider = Some(provider_name);
        tracing::info!(
            event = "resource_acquiring",
            provider = provider_name,
            host = %params.host,
            database = %params.database,
            "Connecting to database"
        );

        let outcome = pool
            .run("connect", move || provider.connect(&params))
            .await;

        let next = match outcome {
            Ok(Ok(connection)) => {
                self.meta().acquired_at = Some(Utc::now());
                tracing::info!(
                    event = "resource_ready",
                    provider = provider_name,
                    "Database connection established"
                );
                ResourceState::Ready(DbHandle::new(connection))
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    event = "resource_degraded",
                    provider = provider_name,
                    error = %err,
                    "Database connection failed; continuing without database"
                );
                ResourceState::Degraded {
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                tracing::warn!(
                    event = "resource_degraded",
                    provider = provider_name,
                    error = %err,
                    "Database connection failed; continuing without database"
                );
                ResourceState::Degraded {
                    reason: err.to_string(),
                }
            }
        };
        *self.write_state() = next;
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.read_state().phase()
    }

    pub fn status(&self) -> ResourceStatus {
        let (phase, degraded_reason) = {
            let state = self.read_state();
            let reason = match &*state {
                ResourceState::Degraded { reason } => Some(reason.clone()),
                _ => None,
            };
            (state.phase(), reason)
        };
        let meta = self.meta();
        ResourceStatus {
            phase,
            provider: meta.provider,
            degraded_reason,
            acquired_at: meta.acquired_at,
            released_at: meta.released_at,
        }
    }

    /// Handle to the live connection, or the reason there is none.
    pub fn resource(&self) -> Result<DbHandle, ToolFailure> {
        match &*self.read_state() {
            ResourceState::Ready(handle) => Ok(handle.clone()),
            ResourceState::Degraded { reason } => Err(ToolFailure::resource_unavailable(format!(
                "Check server logs for details ({reason})"
            ))),
            ResourceState::Uninitialized | ResourceState::Acquiring => Err(
                ToolFailure::resource_unavailable("the connection has not been established yet"),
            ),
            ResourceState::Releasing | ResourceState::Closed => Err(
                ToolFailure::resource_unavailable("the server is shutting down"),
            ),
        }
    }

    /// Closes the connection if one was acquired. Runs at most once; close
    /// faults are logged and swallowed so shutdown always finishes.
    pub async fn release(&self, pool: &BlockingPool) {
        let handle = {
            let mut state = self.write_state();
            match std::mem::replace(&mut *state, ResourceState::Releasing) {
                ResourceState::Ready(handle) => Some(handle),
                ResourceState::Degraded { .. }
                | ResourceState::Uninitialized
                | ResourceState::Acquiring => None,
                previous @ (ResourceState::Releasing | ResourceState::Closed) => {
                    *state = previous;
                    return;
                }
            }
        };

        if let Some(handle) = handle {
            tracing::info!(event = "resource_releasing", "Closing database connection");
            match pool.run("close", move || handle.close()).await {
                Ok(Ok(())) => {
                    tracing::info!(event = "resource_closed", "Database connection closed");
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        event = "resource_close_failed",
                        error = %err,
                        "Closing the database connection failed"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        event = "resource_close_failed",
                        error = %err,
                        "Closing the database connection failed"
                    );
                }
            }
        }

        self.meta().released_at = Some(Utc::now());
        *self.write_state() = ResourceState::Closed;
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ResourceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ResourceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, ResourceMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
