pub mod applications;
pub mod config;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod session_store;

use std::sync::Arc;

use config::Config;
use gateway::Hub;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<Config>,
}
