// ABOUTME: HTTP middleware pipeline: correlation ids, CORS, global rate limiting
// ABOUTME: Explicit layers composed at server construction time
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

/// CORS layer configuration
pub mod cors;
/// Global per-IP rate limiting
pub mod rate_limit;
/// Request id generation and propagation
pub mod request_id;

pub use cors::setup_cors;
pub use rate_limit::ip_rate_limit_middleware;
pub use request_id::request_id_middleware;
