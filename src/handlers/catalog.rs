use crate::{
    error::ApiError,
    models::{CatalogSource, SyncRequest},
    services::{CatalogQueries, CatalogRepository, CatalogSync, SemanticIndexService, SnapshotStore},
};
use actix_web::{
    web::{self, Json},
    HttpResponse,
};
use serde_json::json;

pub fn catalog_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/catalog/sync").route(web::post().to(sync_catalog)))
        .service(
            web::resource("/v1/catalog/product-types").route(web::get().to(list_product_types)),
        )
        .service(web::resource("/v1/index/rebuild").route(web::post().to(rebuild_index)))
        .service(web::resource("/v1/index").route(web::get().to(index_info)));
}

/// Pull the catalog from Shopify. The body is optional and defaults to GraphQL.
pub async fn sync_catalog(
    request: Option<Json<SyncRequest>>,
    catalog_sync: web::Data<CatalogSync>,
) -> Result<HttpResponse, ApiError> {
    let source = request
        .map(|r| r.into_inner().source)
        .unwrap_or(CatalogSource::Graphql);

    let report = catalog_sync.sync(source).await?;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn list_product_types(
    repository: web::Data<CatalogRepository>,
) -> Result<HttpResponse, ApiError> {
    let product_types = repository.distinct_product_types().await?;
    Ok(HttpResponse::Ok().json(json!({ "product_types": product_types })))
}

pub async fn rebuild_index(
    index_service: web::Data<SemanticIndexService>,
) -> Result<HttpResponse, ApiError> {
    let report = index_service.rebuild().await?;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn index_info(
    index_service: web::Data<SemanticIndexService>,
) -> Result<HttpResponse, ApiError> {
    let info = index_service
        .snapshots()
        .latest_info()
        .await?
        .ok_or_else(|| ApiError::NotFound("No semantic index has been built yet".to_string()))?;
    Ok(HttpResponse::Ok().json(info))
}
