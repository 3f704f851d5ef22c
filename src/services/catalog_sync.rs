use crate::{
    error::{ApiError, Result},
    models::{CatalogSource, SyncReport},
    services::{catalog_repository::CatalogRepository, shopify::ShopifyClient},
};
use std::sync::Arc;
use tracing::{info, warn};

/// Pulls the catalog from Shopify and writes it to the store.
#[derive(Clone)]
pub struct CatalogSync {
    shopify: Arc<ShopifyClient>,
    repository: CatalogRepository,
}

impl CatalogSync {
    pub fn new(shopify: Arc<ShopifyClient>, repository: CatalogRepository) -> Self {
        Self {
            shopify,
            repository,
        }
    }

    pub async fn sync(&self, source: CatalogSource) -> Result<SyncReport> {
        info!(?source, "Starting catalog sync");

        let batch = match source {
            CatalogSource::Rest => self.shopify.fetch_products_rest().await?,
            CatalogSource::Graphql => self.shopify.fetch_products_graphql().await?,
        };

        if batch.products.is_empty() {
            return Err(ApiError::NotFound(
                "Shopify returned no products".to_string(),
            ));
        }
        if batch.skipped_variants > 0 {
            warn!("{} variants skipped during normalization", batch.skipped_variants);
        }

        let mut report = self
            .repository
            .upsert_catalog(&batch.products, &batch.variants)
            .await?;
        report.skipped_variants = batch.skipped_variants;

        info!(
            products = report.products,
            variants = report.variants,
            skipped = report.skipped_variants,
            "Catalog sync finished"
        );
        Ok(report)
    }
}
