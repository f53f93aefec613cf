//! HTTP API server for local control
//!
//! This module provides a REST API for driving the voice session:
//! - GET /health - Health check
//! - GET /status - Connection state, levels and counters
//! - GET /transcript - Accumulated transcript
//! - POST /interaction/start - Start listening
//! - POST /interaction/stop - Stop listening
//! - POST /interrupt - Silence the agent
//! - POST /reconnect - Manual retry after giving up
//! - POST /text - Send a typed message

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
