//! # intakeq
//!
//! Durable submission queue and sequential commit worker for a public
//! report-intake service.
//!
//! Producers call [`queue::QueueDir::enqueue`] to durably persist a
//! submission before it is acknowledged. A single [`worker::Worker`]
//! consumes entries in arrival order, validates and merges them, and
//! commits the result into the atomic [`store::DocumentStore`].

pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod worker;
