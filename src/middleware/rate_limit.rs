// ABOUTME: Global per-IP rate limiting middleware with standard headers
// ABOUTME: Rejects over-limit clients with 429 and Retry-After before routing
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::errors::AppError;
use crate::routes::chat::apply_rate_limit_headers;
use crate::server::ServerResources;

/// Per-IP sliding-window limit applied to every route.
///
/// The client address comes from `x-forwarded-for` (first hop) when present.
/// Responses gain `X-RateLimit-Limit` / `-Remaining` / `-Reset`; rejects are
/// 429 with `Retry-After`.
pub async fn ip_rate_limit_middleware(
    State(resources): State<Arc<ServerResources>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map_or("unknown", str::trim)
        .to_owned();

    let config = &resources.config.rate_limiting;
    let decision = resources
        .rate_limiter
        .check_request(&format!("ip:{ip}"), config.window_ms, config.max_requests)
        .await;

    if !decision.allowed {
        let retry_after = decision.retry_after_secs(resources.clock.now_epoch_ms());
        let mut response = AppError::rate_limited(retry_after).into_response();
        apply_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    // Per-user decisions set by the chat handlers take precedence
    if !response.headers().contains_key("X-RateLimit-Limit") {
        apply_rate_limit_headers(response.headers_mut(), &decision);
    }
    response
}
