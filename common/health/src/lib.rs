//! Liveness reporting for the long-running loops of a service.
//!
//! Every background loop (the flush loop, the rdkafka client thread) registers
//! itself and gets a [`HealthHandle`]. The loop must call
//! [`HealthHandle::report_healthy`] more often than its deadline. The process
//! is healthy only while every registered component is healthy:
//!   - a component that never reported is still `Starting`, so unhealthy
//!   - a component that reported `Unhealthy` stays unhealthy until it reports again
//!   - a component whose last healthy report is older than its deadline is `Stalled`
//!
//! Reports are written straight into a shared map, so handles can be used from
//! async tasks and from foreign threads (rdkafka callbacks) alike.
//!
//! ```
//! use std::time::Duration;
//! use health::HealthRegistry;
//!
//! let liveness = HealthRegistry::new("liveness");
//! let handle = liveness.register("flush_loop".to_string(), Duration::from_secs(30));
//! assert!(!liveness.get_status().healthy);
//!
//! handle.report_healthy();
//! assert!(liveness.get_status().healthy);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when all registered components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but not reported yet
    Starting,
    /// Healthy until the given instant, must report again before it
    HealthyUntil(OffsetDateTime),
    /// Reported unhealthy by the component itself
    Unhealthy,
    /// The HealthyUntil deadline passed without a new report
    Stalled,
}

impl ComponentStatus {
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => *until > OffsetDateTime::now_utc(),
            _ => false,
        }
    }
}

type ComponentMap = Arc<RwLock<HashMap<String, ComponentStatus>>>;

fn write_components(
    components: &ComponentMap,
) -> RwLockWriteGuard<'_, HashMap<String, ComponentStatus>> {
    match components.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_components(
    components: &ComponentMap,
) -> RwLockReadGuard<'_, HashMap<String, ComponentStatus>> {
    match components.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: ComponentMap,
}

impl HealthHandle {
    /// Mark the component healthy for one more deadline.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        debug!(component = %self.component, ?status, "health report");
        write_components(&self.components).insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: ComponentMap,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting` state. Hand the returned handle to the
    /// component so it can report on its own schedule.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status. Can be used directly as an axum handler result.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let components = read_components(&self.components);

        let mut status = HealthStatus {
            // Nothing registered yet means nothing is running yet
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if *until <= now => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(current, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
