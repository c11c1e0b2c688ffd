//! protoscribe-server: HTTP and WebSocket adapters around the task pipeline.

pub mod config;
pub mod logging;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
