//! research-crew: background research runs by a crew of four LLM agents.
//!
//! A submitted question becomes a persisted task. A worker from the task
//! queue runs the Researcher, Analyst, Writer and Critic over it, storing
//! each turn as it happens and announcing progress to live subscribers.
//! Finished runs are cached so identical questions are answered at once.
//!
//! ## Modules
//! - [`api`]: HTTP and WebSocket surface
//! - [`queue`]: job delivery, workers, deadlines and startup recovery
//! - [`agents`]: roles, routing and the turn loop
//! - [`store`]: SQLite task store
//! - [`cache`]: result cache
//! - [`notify`]: event fan-out
//! - [`llm`]: model gateway clients
//! - [`tools`]: calculator and web search

pub mod agents;
pub mod api;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod notify;
pub mod queue;
pub mod store;
pub mod task;
pub mod tools;

pub use config::Config;
pub use error::{ResearchError, ResearchResult};
