// ABOUTME: Main library entry point for the Quill chat orchestration server
// ABOUTME: Provider-agnostic conversational AI backend with streaming transports
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

#![deny(unsafe_code)]

//! # Quill Chat Server
//!
//! A provider-agnostic conversational AI backend. Clients hold long-lived
//! chat sessions, send user turns, and receive streamed model completions
//! over HTTP-SSE or a persistent WebSocket connection.
//!
//! ## Architecture
//!
//! The core interleaves four concurrency concerns while keeping assistant
//! turns at-most-once persisted and token delivery strictly ordered:
//!
//! - **Rate Limiter**: sliding-window admission backed by an optional shared
//!   counter store with an in-process fail-open fallback
//! - **Safety Gate**: schema validation plus coarse inbound/outbound screens
//! - **Provider Registry**: adapters behind one streaming contract with a
//!   mock last-resort fallback
//! - **Context Manager**: session state, token accounting, and on-demand
//!   summarisation under a bounded budget
//! - **Turn Orchestrator**: the state machine taking a user turn from
//!   admission to a terminal event
//! - **Transports**: SSE and bidirectional WebSocket bindings over the same
//!   orchestrator
//!
//! ## Quick Start
//!
//! ```bash
//! quill-chat-server mint-token you@example.com
//! quill-chat-server
//! ```

/// JWT bearer authentication producing the validated principal
pub mod auth;

/// Configuration management and environment loading
pub mod config;

/// Context manager: session state, prompts, summarisation
pub mod context;

/// Shared counter store backends for the rate limiter
pub mod counters;

/// Database abstraction and per-entity managers
pub mod database;

/// Unified error handling with standard codes and HTTP responses
pub mod errors;

/// LLM provider abstraction and adapters
pub mod llm;

/// Production logging and structured output
pub mod logging;

/// HTTP middleware pipeline
pub mod middleware;

/// Common data models for users, sessions, and messages
pub mod models;

/// Turn orchestrator: the per-turn state machine
pub mod orchestrator;

/// Unified rate limiting for admission and throttling
pub mod rate_limiting;

/// HTTP route handlers
pub mod routes;

/// Safety gate for inbound and outbound content
pub mod safety;

/// Server assembly and lifecycle
pub mod server;

/// Shared utilities (clock, timestamps)
pub mod utils;

/// WebSocket transport binding
pub mod websocket;
