//! HTTP surface: one route per camera returning the latest encoded frame.

use std::collections::HashMap;
use std::io;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::camera::CameraHandle;
use crate::control::ParameterRequest;
use crate::encode::OutputFormat;
use crate::output::Snapshot;

pub const FRAME_SEQUENCE_HEADER: &str = "x-frame-sequence";
pub const FRAME_AGE_HEADER: &str = "x-frame-age-ms";

#[derive(Clone)]
struct AppState {
    camera: CameraHandle,
    shutdown: CancellationToken,
}

/// Build the router for one camera.
pub fn router(camera: CameraHandle, shutdown: CancellationToken) -> Router {
    let route = camera.route();
    Router::new()
        .route(&route, get(frame_handler))
        .with_state(AppState { camera, shutdown })
}

/// Serve until `shutdown` fires, then stop accepting and drain connections.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn plain_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.into(),
    )
        .into_response()
}

fn frame_response(snapshot: Snapshot, format: OutputFormat) -> Response {
    let mut response = snapshot.payload.clone().into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(FRAME_SEQUENCE_HEADER, HeaderValue::from(snapshot.sequence));
    if let Some(age) = snapshot.age() {
        let age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
        headers.insert(FRAME_AGE_HEADER, HeaderValue::from(age_ms));
    }
    response
}

/// Apply any `gain`/`exposure` in the query, then return the latest frame.
async fn frame_handler(
    State(state): State<AppState>,
    query: Option<Query<HashMap<String, String>>>,
) -> Response {
    if state.shutdown.is_cancelled() {
        tracing::debug!("Request refused during shutdown");
        return plain_error(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    let request = query
        .map(|Query(query)| ParameterRequest::from_query(&query))
        .unwrap_or_default();

    if !request.is_empty() {
        let controller = state.camera.controller.clone();
        match tokio::task::spawn_blocking(move || controller.apply(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!("Parameter update failed: {}", err);
                return plain_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
            Err(err) => {
                tracing::error!("Parameter task failed: {}", err);
                return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "parameter update failed");
            }
        }
    }

    frame_response(state.camera.published.read_snapshot(), state.camera.format)
}
