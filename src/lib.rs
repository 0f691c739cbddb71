//! Gatekeeper - API Key Authorization Gate
//!
//! This crate implements an authorization service that validates API keys and
//! applies per-client rate limiting with progressive blocking. Counters live
//! in a shared Redis instance so that any number of stateless workers enforce
//! the same limits without sharing process memory.

pub mod authorizer;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
