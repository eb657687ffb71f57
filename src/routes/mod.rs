// ABOUTME: HTTP route handlers composing the chat core's REST surface
// ABOUTME: Session lifecycle, streamed and simple message endpoints, health
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

/// Chat session and message routes
pub mod chat;
/// Health endpoint
pub mod health;

pub use chat::ChatRoutes;
pub use health::health_routes;
