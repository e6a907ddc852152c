use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ociclient::Credentials;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::engine::{DeltaEngine, DeltaOutcome, DeltaRequest};
use crate::error::Result;
use super::models::{DeltaQuery, DeltaResponse};

pub struct AppMetrics {
    pub request_counter: Counter<u64>,
}

// Type alias for our application state
pub type AppState = (Arc<DeltaEngine>, Arc<AppMetrics>);

pub fn delta_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/delta", get(read_delta))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let credentials = Credentials::from_header(value);
    if credentials.is_none() {
        warn!("Ignoring unsupported authorization scheme");
    }
    credentials
}

#[instrument(name = "read_delta", skip_all, fields(from = ?params.from, to = ?params.to, accept = ?params.accept))]
async fn read_delta(
    State((engine, metrics)): State<AppState>,
    Query(params): Query<DeltaQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let request = DeltaRequest {
        accepted: params.accepted(),
        from: params.from.unwrap_or_default(),
        to: params.to.unwrap_or_default(),
        credentials: credentials(&headers),
    };

    let outcome = engine.read_delta(request).await;
    let status = match &outcome {
        Ok(DeltaOutcome::Ready { .. }) => StatusCode::OK,
        Ok(DeltaOutcome::InProgress) => StatusCode::ACCEPTED,
        Ok(DeltaOutcome::NoNewVersion) => StatusCode::NO_CONTENT,
        Err(e) => e.status(),
    };
    metrics.request_counter.add(1, &[KeyValue::new("status", i64::from(status.as_u16()))]);

    match outcome? {
        DeltaOutcome::Ready { target_image, delta_image } => {
            info!("Delta ready: {}", delta_image);
            let body = DeltaResponse {
                target_image: target_image.to_string(),
                delta_image: delta_image.to_string(),
            };
            Ok((StatusCode::OK, Json(body)).into_response())
        }
        DeltaOutcome::InProgress => Ok(StatusCode::ACCEPTED.into_response()),
        DeltaOutcome::NoNewVersion => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[instrument(name = "healthz", skip_all)]
async fn healthz(State((engine, _)): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "computations": engine.tasks().outstanding(),
    });
    (StatusCode::OK, Json(body))
}
