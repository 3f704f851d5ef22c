//! Paginated product fetch from the Shopify Admin API (REST or GraphQL),
//! normalized into `products` / `variants` rows.

use crate::{
    config::Config,
    error::{ApiError, Result},
    models::{Product, Variant},
};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::{header, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const REST_PAGE_SIZE: usize = 250;
const GRAPHQL_PAGE_SIZE: usize = 50;
const REQUEST_TIMEOUT_SECONDS: u64 = 60;

lazy_static! {
    static ref NEXT_LINK: Regex = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap();
}

const PRODUCTS_QUERY: &str = r#"
query Products($first: Int!, $after: String) {
  products(first: $first, after: $after) {
    edges {
      cursor
      node {
        id
        title
        bodyHtml
        vendor
        handle
        tags
        status
        createdAt
        updatedAt
        productType
        images(first: 1) { edges { node { src } } }
        variants(first: 10) {
          edges {
            node {
              id
              title
              price
              compareAtPrice
              inventoryQuantity
              sku
              createdAt
              updatedAt
              selectedOptions { name value }
            }
          }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}
"#;

/// Normalized rows ready for the store.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CatalogBatch {
    pub products: Vec<Product>,
    pub variants: Vec<Variant>,
    pub skipped_variants: usize,
}

impl CatalogBatch {
    fn extend(&mut self, other: CatalogBatch) {
        self.products.extend(other.products);
        self.variants.extend(other.variants);
        self.skipped_variants += other.skipped_variants;
    }
}

pub struct ShopifyClient {
    client: Client,
    rest_url: String,
    graphql_url: String,
}

impl ShopifyClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "X-Shopify-Access-Token",
            header::HeaderValue::from_str(&config.shopify_access_token).map_err(|e| {
                ApiError::ConfigError(format!("Invalid Shopify access token: {}", e))
            })?,
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .default_headers(headers)
            .build()
            .map_err(|e| ApiError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rest_url: format!(
                "{}/admin/api/{}/products.json?limit={}",
                config.shopify_store_url.trim_end_matches('/'),
                config.shopify_api_version,
                REST_PAGE_SIZE
            ),
            graphql_url: config.graphql_url(),
        })
    }

    /// Walk `products.json` following `Link: <...>; rel="next"` headers.
    #[instrument(skip(self))]
    pub async fn fetch_products_rest(&self) -> Result<CatalogBatch> {
        let mut batch = CatalogBatch::default();
        let mut next_url = Some(self.rest_url.clone());
        let mut pages = 0;

        while let Some(url) = next_url.take() {
            debug!("GET {}", url);
            let response = self.client.get(&url).send().await?;
            let response = ensure_success(response).await?;

            next_url = response
                .headers()
                .get(header::LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_page_url);

            let page: RestProductsPage = response.json().await.map_err(|e| {
                ApiError::ExternalServiceError(format!("Unexpected products.json payload: {}", e))
            })?;

            pages += 1;
            batch.extend(normalize_rest(page.products));
        }

        info!(
            pages,
            products = batch.products.len(),
            variants = batch.variants.len(),
            "Fetched catalog over REST"
        );
        Ok(batch)
    }

    /// Cursor pagination over the Admin GraphQL API, 50 products per page.
    #[instrument(skip(self))]
    pub async fn fetch_products_graphql(&self) -> Result<CatalogBatch> {
        let mut batch = CatalogBatch::default();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let body = json!({
                "query": PRODUCTS_QUERY,
                "variables": { "first": GRAPHQL_PAGE_SIZE, "after": cursor },
            });

            let response = self.client.post(&self.graphql_url).json(&body).send().await?;
            let response = ensure_success(response).await?;
            let payload: GraphqlResponse = response.json().await.map_err(|e| {
                ApiError::ExternalServiceError(format!("Unexpected GraphQL payload: {}", e))
            })?;

            let connection = payload.into_connection()?;
            pages += 1;
            batch.extend(normalize_graphql(
                connection.edges.into_iter().map(|e| e.node).collect(),
            ));

            match (connection.page_info.has_next_page, connection.page_info.end_cursor) {
                (true, Some(end)) => cursor = Some(end),
                _ => break,
            }
        }

        info!(
            pages,
            products = batch.products.len(),
            variants = batch.variants.len(),
            "Fetched catalog over GraphQL"
        );
        Ok(batch)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let snippet: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(240)
        .collect();
    Err(ApiError::ExternalServiceError(format!(
        "Shopify returned {}: {}",
        status, snippet
    )))
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_page_url(link_header: &str) -> Option<String> {
    link_header
        .split(',')
        .find_map(|part| NEXT_LINK.captures(part).map(|c| c[1].to_string()))
}

/// `gid://shopify/Product/123` -> `123`. Plain numeric strings pass through.
pub fn parse_gid(gid: &str) -> Option<i64> {
    gid.rsplit('/').next()?.parse().ok()
}

fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    price.filter(|p| p.is_finite())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct RestProductsPage {
    #[serde(default)]
    products: Vec<RestProduct>,
}

#[derive(Debug, Deserialize)]
struct RestProduct {
    id: i64,
    title: String,
    body_html: Option<String>,
    vendor: Option<String>,
    handle: Option<String>,
    tags: Option<String>,
    status: Option<String>,
    product_type: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    image: Option<RestImage>,
    #[serde(default)]
    variants: Vec<RestVariant>,
}

#[derive(Debug, Deserialize)]
struct RestImage {
    src: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestVariant {
    id: i64,
    title: Option<String>,
    option1: Option<String>,
    option2: Option<String>,
    option3: Option<String>,
    #[serde(default)]
    price: Value,
    #[serde(default)]
    compare_at_price: Value,
    inventory_quantity: Option<i32>,
    sku: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

fn normalize_rest(products: Vec<RestProduct>) -> CatalogBatch {
    let mut batch = CatalogBatch::default();

    for product in products {
        for variant in product.variants {
            let Some(price) = parse_price(&variant.price) else {
                warn!(
                    product_id = product.id,
                    variant_id = variant.id,
                    "Skipping variant with unparseable price {}",
                    variant.price
                );
                batch.skipped_variants += 1;
                continue;
            };

            batch.variants.push(Variant {
                id: variant.id,
                product_id: product.id,
                title: variant.title,
                option1: non_empty(variant.option1),
                option2: non_empty(variant.option2),
                option3: non_empty(variant.option3),
                price,
                compare_at_price: parse_price(&variant.compare_at_price),
                inventory_quantity: variant.inventory_quantity.unwrap_or(0),
                sku: non_empty(variant.sku),
                created_at: variant.created_at,
                updated_at: variant.updated_at,
            });
        }

        batch.products.push(Product {
            id: product.id,
            title: product.title,
            description: non_empty(product.body_html),
            vendor: non_empty(product.vendor),
            handle: product.handle,
            tags: non_empty(product.tags),
            status: normalize_status(product.status.as_deref()),
            product_type: non_empty(product.product_type),
            image_url: product.image.and_then(|i| i.src),
            created_at: product.created_at,
            updated_at: product.updated_at,
        });
    }

    batch
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    products: Connection<GqlProduct>,
}

impl GraphqlResponse {
    fn into_connection(self) -> Result<Connection<GqlProduct>> {
        if !self.errors.is_empty() {
            let messages: Vec<String> = self.errors.into_iter().map(|e| e.message).collect();
            return Err(ApiError::ExternalServiceError(format!(
                "Shopify GraphQL errors: {}",
                messages.join("; ")
            )));
        }

        self.data
            .map(|d| d.products)
            .ok_or_else(|| ApiError::ExternalServiceError("GraphQL response has no data".into()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    #[serde(default = "Vec::new")]
    edges: Vec<Edge<T>>,
    #[serde(default)]
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
struct Edge<T> {
    node: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    #[serde(default)]
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlProduct {
    id: String,
    title: String,
    body_html: Option<String>,
    vendor: Option<String>,
    handle: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    status: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    product_type: Option<String>,
    images: Option<Connection<GqlImage>>,
    variants: Option<Connection<GqlVariant>>,
}

#[derive(Debug, Deserialize)]
struct GqlImage {
    src: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlVariant {
    id: String,
    title: Option<String>,
    #[serde(default)]
    price: Value,
    #[serde(default)]
    compare_at_price: Value,
    inventory_quantity: Option<i32>,
    sku: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    selected_options: Vec<SelectedOption>,
}

#[derive(Debug, Deserialize)]
struct SelectedOption {
    value: String,
}

fn normalize_graphql(products: Vec<GqlProduct>) -> CatalogBatch {
    let mut batch = CatalogBatch::default();

    for product in products {
        let Some(product_id) = parse_gid(&product.id) else {
            warn!("Skipping product with malformed id {}", product.id);
            continue;
        };

        let variants = product.variants.map(|c| c.edges).unwrap_or_default();
        for edge in variants {
            let variant = edge.node;
            let (Some(variant_id), Some(price)) =
                (parse_gid(&variant.id), parse_price(&variant.price))
            else {
                warn!(
                    product_id,
                    "Skipping variant {} with malformed id or price {}", variant.id, variant.price
                );
                batch.skipped_variants += 1;
                continue;
            };

            let mut options = variant.selected_options.into_iter().map(|o| o.value);
            batch.variants.push(Variant {
                id: variant_id,
                product_id,
                title: variant.title,
                option1: non_empty(options.next()),
                option2: non_empty(options.next()),
                option3: non_empty(options.next()),
                price,
                compare_at_price: parse_price(&variant.compare_at_price),
                inventory_quantity: variant.inventory_quantity.unwrap_or(0),
                sku: non_empty(variant.sku),
                created_at: variant.created_at,
                updated_at: variant.updated_at,
            });
        }

        let image_url = product
            .images
            .and_then(|c| c.edges.into_iter().next())
            .and_then(|e| e.node.src);

        batch.products.push(Product {
            id: product_id,
            title: product.title,
            description: non_empty(product.body_html),
            vendor: non_empty(product.vendor),
            handle: product.handle,
            tags: Some(product.tags.join(", ")).filter(|t| !t.is_empty()),
            status: normalize_status(product.status.as_deref()),
            product_type: non_empty(product.product_type),
            image_url,
            created_at: product.created_at,
            updated_at: product.updated_at,
        });
    }

    batch
}

fn normalize_status(status: Option<&str>) -> String {
    status
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "active".to_string())
}
