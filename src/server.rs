//! HTTP server setup and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api;
use crate::catalog::SchemaCatalog;
use crate::config::AppConfig;
use crate::datasource::DatasourceManager;
use crate::llm::AnthropicClient;
use crate::logging::OpTimer;
use crate::pipeline::orchestrator::Orchestrator;
use crate::prompts::PromptRegistry;
use crate::store::MemoryStore;
use crate::{log_banner, log_init_step, log_init_warning, log_success, AppState};

/// Tabula API version (from Cargo.toml).
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create the application with all routes and middleware.
///
/// Also returns the shared state so the caller can tear down connection
/// pools on shutdown.
pub async fn create_app(config: AppConfig) -> anyhow::Result<(Router, AppState)> {
    let overall_timer = OpTimer::new("server", "create_app");

    log_banner!(
        format!("Tabula API v{}", VERSION),
        format!("Knowledge dir: {}", config.knowledge.dir.display())
    );

    // [1/6] Schema catalog
    let step_timer = OpTimer::new("server", "schema_catalog");
    let catalog = Arc::new(SchemaCatalog::load(&config.knowledge.schemas_dir())?);
    log_init_step!(
        1,
        6,
        "Schema Catalog",
        format!("{} databases", catalog.list_databases().len())
    );
    step_timer.finish();

    // [2/6] Prompt registry
    let step_timer = OpTimer::new("server", "prompt_registry");
    let prompts = Arc::new(PromptRegistry::load(&config.knowledge.prompts_dir())?);
    log_init_step!(2, 6, "Prompt Registry", "6 stage templates");
    step_timer.finish();

    // [3/6] LLM client
    let step_timer = OpTimer::new("server", "llm_client");
    let llm = Arc::new(AnthropicClient::new(&config.llm)?);
    log_init_step!(
        3,
        6,
        "LLM Client",
        format!(
            "Anthropic | weak={} planning={} developer={}",
            config.llm.weak_model, config.llm.planning_model, config.llm.developer_model
        )
    );
    step_timer.finish();

    // [4/6] Datasource manager
    let step_timer = OpTimer::new("server", "datasources");
    let datasources = Arc::new(DatasourceManager::load(
        &config.knowledge.datasources_path(),
        &config.knowledge.summary_path(),
    )?);
    let status = datasources.connect_all().await;
    let reachable = status.values().filter(|ok| **ok).count();
    if reachable < status.len() {
        log_init_warning!(
            "{} of {} datasources unreachable at startup",
            status.len() - reachable,
            status.len()
        );
    }
    log_init_step!(
        4,
        6,
        "Datasources",
        format!("{}/{} reachable", reachable, status.len())
    );
    step_timer.finish();

    // [5/6] Session store + orchestrator
    let step_timer = OpTimer::new("server", "orchestrator");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        prompts.clone(),
        catalog.clone(),
        datasources.clone(),
        store.clone(),
        &config,
    ));
    log_init_step!(5, 6, "Orchestrator", "5-stage pipeline ready");
    step_timer.finish();

    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        catalog,
        prompts,
        datasources,
        orchestrator,
    };

    // [6/6] Router with middleware
    let step_timer = OpTimer::new("server", "router");
    let app = api::create_router()
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());
    log_init_step!(6, 6, "Router", "Routes + middleware configured");
    step_timer.finish();

    overall_timer.finish();
    log_success!("Tabula API server created successfully");

    Ok((app, state))
}
