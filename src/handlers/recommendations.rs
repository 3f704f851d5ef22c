use crate::{
    error::ApiError,
    models::{RecommendationRequest, SearchResponse},
    services::RecommendationService,
};
use actix_web::{
    web::{self, Json},
    HttpResponse,
};

pub fn recommendations_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/search").route(web::post().to(search_products)))
        .service(
            web::resource("/v1/recommendations").route(web::post().to(get_recommendations)),
        );
}

/// Nearest catalog rows for the query, without LLM synthesis
pub async fn search_products(
    request: Json<RecommendationRequest>,
    recommendation_service: web::Data<RecommendationService>,
) -> Result<HttpResponse, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
    }

    let results = recommendation_service
        .search(&request.query, request.top_k)
        .await?;

    Ok(HttpResponse::Ok().json(SearchResponse { results }))
}

/// Product recommendations written by the LLM from the nearest candidates
pub async fn get_recommendations(
    request: Json<RecommendationRequest>,
    recommendation_service: web::Data<RecommendationService>,
) -> Result<HttpResponse, ApiError> {
    if request.query.trim().is_empty() {
        return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
    }

    let recommendation = recommendation_service
        .recommend(&request.query, request.top_k)
        .await?;

    Ok(HttpResponse::Ok().json(recommendation))
}
