pub mod config;
pub mod history;
pub mod models;
pub mod service;

pub use config::ServiceConfig;
pub use history::{HistoryStore, InMemoryHistoryStore};
pub use service::{AppState, build_router, create_app};
