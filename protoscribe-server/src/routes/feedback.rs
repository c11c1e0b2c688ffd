use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use protoscribe_core::Valuation;

use crate::state::AppState;

pub async fn save_feedback(
    State(state): State<AppState>,
    Json(valuation): Json<Valuation>,
) -> impl IntoResponse {
    match state.feedback.record(&valuation).await {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "id": id }))),
        Err(e) => {
            tracing::error!(error = %e, "Feedback store failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
