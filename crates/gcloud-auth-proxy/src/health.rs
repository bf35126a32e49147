//! Liveness and readiness aggregation for `/healthz` and `/readyz`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;

/// Implemented by every component that takes part in health reporting.
pub trait Health: Send + Sync {
    fn is_healthy(&self) -> bool;
    fn is_ready(&self) -> bool;
}

/// Registry of [`Health`] participants. Cheap to clone.
#[derive(Clone, Default)]
pub struct HealthCheck {
    checkees: Vec<Arc<dyn Health>>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, checkee: Arc<dyn Health>) {
        self.checkees.push(checkee);
    }

    /// Healthy when every participant is (vacuously true with none).
    pub fn is_healthy(&self) -> bool {
        self.checkees.iter().all(|c| c.is_healthy())
    }

    pub fn is_ready(&self) -> bool {
        self.checkees.iter().all(|c| c.is_ready())
    }
}

pub async fn healthz(State(health): State<HealthCheck>) -> StatusCode {
    status(health.is_healthy())
}

pub async fn readyz(State(health): State<HealthCheck>) -> StatusCode {
    status(health.is_ready())
}

fn status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
