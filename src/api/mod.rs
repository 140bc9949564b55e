//! HTTP and WebSocket API.
//!
//! ## Endpoints
//!
//! - `POST /api/research` - Submit a research task (rate limited per client)
//! - `GET /api/research` - List tasks, newest first (rate limited per client)
//! - `GET /api/research/:id` - Task with messages and metrics
//! - `GET /api/research/:id/status` - Lightweight status poll
//! - `GET /api/research/:id/export` - Markdown export
//! - `GET /api/health` - Store and cache probe
//! - `GET /api/config` - Runtime configuration without secrets
//! - `GET /ws`, `GET /ws/research/:id` - Live task events

mod error;
pub mod rate_limit;
mod research;
mod routes;
pub mod types;
mod ws;

pub use error::ApiError;
pub use routes::{router, serve, AppState};
pub use types::*;
