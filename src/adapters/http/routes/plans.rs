use axum::{Json, extract::State};
use serde::Serialize;

use crate::{adapters::http::app_state::AppState, domain::entities::plan::CatalogEntry};

#[derive(Serialize)]
pub struct PlansResponse {
    plans: Vec<CatalogEntry>,
}

pub async fn list_plans(State(app_state): State<AppState>) -> Json<PlansResponse> {
    Json(PlansResponse {
        plans: app_state.subscription_use_cases.plans(),
    })
}
