// ABOUTME: Health endpoint reporting readiness of the core's dependencies
// ABOUTME: Database and counter-store reachability checks behind GET /health
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

use std::sync::Arc;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, response::Response, routing::get,
    Json, Router,
};
use serde_json::json;

use crate::server::ServerResources;

/// Health routes (unauthenticated)
pub fn health_routes(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(resources)
}

async fn health(State(resources): State<Arc<ServerResources>>) -> Response {
    let database_ok = resources.database.health_check().await.is_ok();
    let counter_store = match &resources.counter_store {
        Some(store) => {
            if store.health_check().await.is_ok() {
                "ok"
            } else {
                "degraded"
            }
        }
        None => "in-process",
    };

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if database_ok { "ok" } else { "unhealthy" },
        "components": {
            "database": if database_ok { "ok" } else { "unreachable" },
            "counterStore": counter_store,
            "providers": resources.registry.known_names(),
        },
    });

    (status, Json(body)).into_response()
}
