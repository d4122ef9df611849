/// Pulseboard: presence-driven widget script engine for live dashboards
///
/// Runs each dashboard widget's script on a fixed cadence inside a restricted
/// interpreter, but only while somebody is watching the dashboard, and pushes
/// every result to the dashboard's viewers.

// Core configuration and setup
pub mod config;

// Widget domain types - descriptors, outcomes, health states, properties
pub mod widget;

// Persistence collaborator - in-memory and SQLite widget stores
pub mod store;

// Script sandbox - restricted Lua execution and failure classification
pub mod sandbox;

// Runtime execution engine - scheduler, worker pool, awaiter, outcome processing
pub mod runtime;

// Presence layer - viewer subscriptions and client event fan-out
pub mod presence;

// HTTP API layer - WebSocket sessions and operational endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use presence::{PresenceRegistry, Subscription};
pub use runtime::WidgetScheduler;
pub use server::start_server;
pub use store::WidgetStore;
pub use widget::{ExecutionDescriptor, ExecutionOutcome, FailureKind, HealthState};
