// ABOUTME: Configuration management for deployment-specific settings
// ABOUTME: Re-exports the environment-driven server configuration types
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

/// Environment-based configuration loading
pub mod environment;

pub use environment::{
    AuthConfig, ChatConfig, CorsConfig, CounterStoreConfig, DatabaseConfig, ProviderConfig,
    RateLimitConfig, SafetyConfig, ServerConfig,
};
