use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use ccrelay_core::state::AppState;
use ccrelay_protocol::ModelInfo;

/// `GET /v1/models`: the union of every provider's advertised catalog.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot();
    let mut seen = std::collections::HashSet::new();
    let mut data: Vec<ModelInfo> = Vec::new();
    for info in snapshot.providers.iter() {
        for model in info.provider.models() {
            if seen.insert(model.id.clone()) {
                data.push(model);
            }
        }
    }
    Json(json!({"data": data, "has_more": false}))
}

/// `GET /v1/providers`: provider metadata plus the live health and pool
/// state the dispatcher itself reads.
pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.snapshot();
    let health = state.health();
    let data: Vec<serde_json::Value> = snapshot
        .providers
        .iter()
        .map(|info| {
            let pool = snapshot
                .pools
                .get(info.name())
                .map(|pool| pool.stats())
                .unwrap_or_default();
            json!({
                "name": info.name(),
                "base_url": info.provider.base_url(),
                "weight": info.weight,
                "priority": info.priority,
                "healthy": info.is_healthy(),
                "circuit": health.state(info.name()),
                "pool": {
                    "total": pool.total,
                    "available": pool.available,
                    "exhausted": pool.exhausted,
                    "total_rpm": pool.total_rpm,
                    "total_itpm": pool.total_itpm,
                    "total_otpm": pool.total_otpm,
                }
            })
        })
        .collect();
    Json(json!({"data": data}))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}
