//! HTTP metrics middleware.
//!
//! Applied as the outermost layer so framework-level rejections (415, 400
//! from a bad JSON body, 404, 405) are counted along with handler responses.

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

use crate::observability::metrics::record_http_request;

/// Endpoint label for requests that matched no route.
const UNMATCHED_ENDPOINT: &str = "/other";

/// Record method, route template, status and duration for every request.
///
/// The endpoint label is the route template (`/api/v1/hosts/:host_id/...`),
/// never the raw path.
pub async fn http_metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| UNMATCHED_ENDPOINT.to_string(), |p| p.as_str().to_string());

    let response = next.run(request).await;

    record_http_request(
        &method,
        &endpoint,
        response.status().as_u16(),
        start.elapsed(),
    );

    response
}
