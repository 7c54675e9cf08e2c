//! Domain core for the renderhub batch coordinator.
//!
//! Pure types and state machines shared by the dispatch engine and the
//! HTTP boundary. This crate has no internal dependencies and performs no
//! I/O:
//!
//! - [`ledger::UnitLedger`] -- per-session index allocator and completion set.
//! - [`lifecycle::SessionStatus`] -- session state machine.
//! - [`worker_registry::WorkerRegistry`] -- static worker table and report
//!   attribution.
//! - [`envelope::DispatchEnvelope`] -- what a worker receives.

pub mod envelope;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod types;
pub mod validation;
pub mod worker_registry;
