//! Tabula API - Conversational Data Agent
//!
//! This crate turns natural-language questions into read-only SQL against a
//! catalog of logical databases and answers in the user's language. A
//! question runs through a five-stage pipeline (validate → decide → plan →
//! execute → summarize), each stage a structured LLM call on its own model
//! tier, with an agentic retry loop around SQL execution.
//!
//! # Architecture
//!
//! - [`config`]: layered configuration and startup validation
//! - [`store`]: session store (threads, messages, tokens, used databases)
//! - [`catalog`]: immutable per-database schema descriptors
//! - [`prompts`]: stage prompt templates with `${var}` rendering
//! - [`llm`]: provider client with forced-tool structured output
//! - [`datasource`]: pooled SQL execution with isolation enforcement
//! - [`pipeline`]: the orchestrator and the agentic step executor
//! - [`api`]: REST endpoints under `/api`
//!
//! # Example
//!
//! ```rust,ignore
//! use tabula_api::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let (app, state) = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     state.datasources.close_all().await;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod datasource;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod prompts;
pub mod server;
pub mod store;

use std::sync::Arc;

use catalog::SchemaCatalog;
use config::AppConfig;
use datasource::DatasourceManager;
use pipeline::orchestrator::Orchestrator;
use prompts::PromptRegistry;
use store::SessionStore;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Session store (threads, messages, tokens, used databases).
    pub store: Arc<dyn SessionStore>,
    /// Immutable schema catalog.
    pub catalog: Arc<SchemaCatalog>,
    /// Prompt template registry.
    pub prompts: Arc<PromptRegistry>,
    /// Datasource routing and isolation.
    pub datasources: Arc<DatasourceManager>,
    /// The question pipeline.
    pub orchestrator: Arc<Orchestrator>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"AppConfig")
            .field("catalog", &self.catalog.list_databases())
            .field("datasources", &self.datasources)
            .finish()
    }
}
