// PRESENT - Agent Orchestration Core
//
// This crate provides the asynchronous orchestration layer behind the
// realtime collaborative canvas: a durable Postgres-backed task queue,
// a lease-based worker fleet with cooperative cancellation, a follow-up
// scheduler, and the replay-telemetry pipeline.
//
// Stewards (canvas, scorecard, search, ...) register handlers against the
// worker runtime; everything else in the product talks to this crate through
// the enqueue surface in `server/` and the read models in `kernel/audit`.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
