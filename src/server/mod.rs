pub mod middleware;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::Router;

use crate::chat::ChatOrchestrator;
use crate::chat::upstream::{CompletionClient, Embedder};
use crate::config::Config;
use crate::notify::NotifyDispatcher;
use crate::pool::ConnectionPool;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<ConnectionPool>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub completions: Arc<dyn CompletionClient>,
    pub embedder: Arc<dyn Embedder>,
    pub notifier: Arc<NotifyDispatcher>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
