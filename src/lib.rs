//! Detection-and-gating engine for audible error alerts: terminal output and
//! editor diagnostics in, at most one well-timed sound out.

pub mod audio;
pub mod diagnostics;
pub mod engine;
pub mod execution;
pub mod gate;
pub mod sanitize;
pub mod settings;
mod telemetry;

pub use engine::{spawn_engine, DiagnosticsProvider, Engine, EngineCommand, EngineEvent, EngineHandle};
pub use gate::{AlertGate, AlertScope, SuppressionReason};
pub use telemetry::init_tracing;
