//! Data-source catalog endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Create the data-sources router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/data-sources", get(list_data_sources))
}

/// One catalog entry in the response.
#[derive(Debug, Serialize)]
struct DataSourceResponse {
    id: String,
    name: String,
    description: String,
}

/// List the logical databases available to the pipeline.
async fn list_data_sources(State(state): State<AppState>) -> Json<Vec<DataSourceResponse>> {
    let sources = state
        .datasources
        .list_sources()
        .iter()
        .map(|info| DataSourceResponse {
            id: info.id.clone(),
            name: info.name.clone(),
            description: info.description.clone(),
        })
        .collect();
    Json(sources)
}
