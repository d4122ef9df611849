/// HTTP API Layer
///
/// This module provides the transport in front of the engine:
/// - The WebSocket endpoint viewers subscribe through
/// - Operational REST endpoints (presence, reload, pairing, refresh)

// Operational REST endpoints and shared state
pub mod dashboards;

// WebSocket viewer sessions
pub mod socket;

// Re-export router builders
pub use dashboards::{create_dashboard_routes, AppState};
pub use socket::create_socket_routes;
