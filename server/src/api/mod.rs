//! HTTP surface of the user service.
//!
//! | Route | Handler |
//! |-------|---------|
//! | `GET /v1/users/{id}` | [`routes::get_user`] |
//! | `PUT /v1/users/{id}` | [`routes::update_user`] |
//! | `GET /v1/users/short?id=…\|username=…` | [`routes::get_short_projection`] |
//! | `POST /v1/users/short/batch` | [`routes::batch_get_short_projections`] |
//! | `GET /liveness`, `GET /readiness` | [`health`] |
//!
//! The caller identity comes from the gateway-set `x-user-id` header.

pub mod error;
pub mod extractors;
pub mod health;
pub mod routes;

use crate::service::UserService;
use axum::Router;
use axum::extract::{FromRef, State};
use axum::routing::get;
use health::Readiness;
use metrics_exporter_prometheus::PrometheusHandle;
use user_service_core::cache::ProjectionCache;
use user_service_core::store::UserStore;

/// Shared state of the HTTP handlers.
pub struct ApiState<S, C> {
    /// User service.
    pub service: UserService<S, C>,
    /// Readiness flag served on `/readiness`.
    pub readiness: Readiness,
}

impl<S, C> Clone for ApiState<S, C> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            readiness: self.readiness.clone(),
        }
    }
}

impl<S, C> FromRef<ApiState<S, C>> for Readiness {
    fn from_ref(state: &ApiState<S, C>) -> Self {
        state.readiness.clone()
    }
}

/// Router of the user endpoints and health probes.
pub fn router<S: UserStore, C: ProjectionCache>(state: ApiState<S, C>) -> Router {
    Router::new()
        .route(
            "/v1/users/:id",
            get(routes::get_user::<S, C>).put(routes::update_user::<S, C>),
        )
        .route("/v1/users/short", get(routes::get_short_projection::<S, C>))
        .route(
            "/v1/users/short/batch",
            axum::routing::post(routes::batch_get_short_projections::<S, C>),
        )
        .route("/liveness", get(health::liveness))
        .route("/readiness", get(health::readiness))
        .with_state(state)
}

/// Router serving the Prometheus scrape endpoint.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}
