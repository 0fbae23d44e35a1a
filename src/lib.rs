//! Ratewall - Distributed Sliding-Window Rate Limiting
//!
//! This crate implements a sliding-window-log rate limiter whose state lives in
//! a shared Redis store, updated by one atomic script per check. When the store
//! is unreachable, checks fail over to an in-process limiter and return to the
//! shared path once a health probe succeeds.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
