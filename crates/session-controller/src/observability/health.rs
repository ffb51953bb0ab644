//! Liveness and readiness probes.
//!
//! The controller moves through three phases: `starting` until the listener
//! is bound and the backend is connected, `serving` while it admits traffic,
//! and `draining` once a shutdown signal arrives. Only `serving` is ready.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Serving,
    Draining,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::Serving,
            2 => Phase::Draining,
            _ => Phase::Starting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Serving => 1,
            Phase::Draining => 2,
        }
    }
}

/// Shared process phase, read by the probe handlers.
#[derive(Debug, Default)]
pub struct HealthState {
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.phase.store(Phase::Serving.as_u8(), Ordering::SeqCst);
    }

    /// Enter the draining phase. There is no way back to `serving`.
    pub fn set_not_ready(&self) {
        self.phase.store(Phase::Draining.as_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Serving
    }
}

#[derive(Debug, Serialize)]
struct ProbeBody {
    phase: Phase,
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// The process answers, so it is live. Draining still counts.
async fn liveness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeBody>) {
    (
        StatusCode::OK,
        Json(ProbeBody {
            phase: state.phase(),
        }),
    )
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ProbeBody>) {
    let phase = state.phase();
    let status = if phase == Phase::Serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProbeBody { phase }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn probe(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_phases_progress() {
        let state = HealthState::new();
        assert_eq!(state.phase(), Phase::Starting);
        assert!(!state.is_ready());

        state.set_ready();
        assert_eq!(state.phase(), Phase::Serving);
        assert!(state.is_ready());

        state.set_not_ready();
        assert_eq!(state.phase(), Phase::Draining);
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_readiness_reports_phase() {
        let state = Arc::new(HealthState::new());
        let router = health_router(Arc::clone(&state));

        let (status, body) = probe(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["phase"], "starting");

        state.set_ready();
        let (status, body) = probe(router.clone(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "serving");

        state.set_not_ready();
        let (status, body) = probe(router, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["phase"], "draining");
    }

    #[tokio::test]
    async fn test_liveness_holds_while_draining() {
        let state = Arc::new(HealthState::new());
        state.set_not_ready();
        let (status, body) = probe(health_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "draining");
    }
}
