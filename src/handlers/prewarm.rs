//! Warm-up endpoint, meant to be hit once after a deploy.

use crate::{
    error::Result,
    services::{RecommendationService, SemanticIndexService, SnapshotStore},
};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{info, warn};

/// Loads the embedding model and the latest semantic index. A failure is
/// reported in the body with status 200, since catalog sync and the chat
/// endpoints do not depend on either.
#[actix_web::get("/prewarm")]
pub async fn prewarm(
    recommendation_service: web::Data<RecommendationService>,
    index_service: web::Data<SemanticIndexService>,
) -> Result<HttpResponse> {
    let timestamp = chrono::Utc::now().to_rfc3339();

    let first_prewarm = match recommendation_service.prewarm().await {
        Ok(first) => first,
        Err(e) => {
            warn!("Prewarm incomplete: {}", e);
            return Ok(HttpResponse::Ok().json(json!({
                "status": "partial",
                "warning": e.to_string(),
                "timestamp": timestamp,
            })));
        }
    };

    // Absence of a snapshot is not an error here; the index may not be built yet.
    let snapshot = index_service.snapshots().latest_info().await.unwrap_or_else(|e| {
        warn!("Could not read index metadata: {}", e);
        None
    });
    info!(
        first_prewarm,
        index_loaded = snapshot.is_some(),
        "Prewarm finished"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "first_prewarm": first_prewarm,
        "index": snapshot,
        "timestamp": timestamp,
    })))
}
