use crate::{
    error::{ApiError, Result},
    models::{Product, ProductSummary, ProductVariant, SessionFilters, SyncReport, Variant},
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Column, Executor, PgPool, Postgres, QueryBuilder, Statement};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

/// Rows per multi-row INSERT; keeps bind parameters well under the Postgres limit.
const UPSERT_CHUNK: usize = 1000;
const FILTER_FALLBACK_SAMPLE: i64 = 3;

const PAIR_COLUMNS: &str = "p.id AS product_id, v.id AS variant_id, p.title, p.description, \
    p.vendor, p.handle, p.tags, p.status, p.product_type, p.image_url, \
    v.title AS variant_title, v.option1, v.price, v.inventory_quantity, v.sku";

const SUMMARY_COLUMNS: &str =
    "p.id AS shopify_id, v.id AS variant_id, p.title, p.product_type, v.price, p.status";

/// Products matched by a filter query. `fallback` is set when nothing matched
/// and a random sample was returned instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterMatches {
    pub products: Vec<ProductSummary>,
    pub fallback: bool,
}

#[derive(Clone)]
pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update products, then variants, in a single transaction.
    #[instrument(skip_all, fields(products = products.len(), variants = variants.len()))]
    pub async fn upsert_catalog(&self, products: &[Product], variants: &[Variant]) -> Result<SyncReport> {
        let mut tx = self.pool.begin().await?;

        for chunk in products.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO products (id, title, description, vendor, handle, tags, status, \
                 product_type, image_url, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut b, p| {
                b.push_bind(p.id)
                    .push_bind(&p.title)
                    .push_bind(&p.description)
                    .push_bind(&p.vendor)
                    .push_bind(&p.handle)
                    .push_bind(&p.tags)
                    .push_bind(&p.status)
                    .push_bind(&p.product_type)
                    .push_bind(&p.image_url)
                    .push_bind(p.created_at)
                    .push_bind(p.updated_at);
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET title = EXCLUDED.title, \
                 description = EXCLUDED.description, vendor = EXCLUDED.vendor, \
                 handle = EXCLUDED.handle, tags = EXCLUDED.tags, status = EXCLUDED.status, \
                 product_type = EXCLUDED.product_type, image_url = EXCLUDED.image_url, \
                 created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at, \
                 synced_at = now()",
            );
            builder.build().execute(&mut *tx).await?;
        }

        for chunk in variants.chunks(UPSERT_CHUNK) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO variants (id, product_id, title, option1, option2, option3, price, \
                 compare_at_price, inventory_quantity, sku, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut b, v| {
                b.push_bind(v.id)
                    .push_bind(v.product_id)
                    .push_bind(&v.title)
                    .push_bind(&v.option1)
                    .push_bind(&v.option2)
                    .push_bind(&v.option3)
                    .push_bind(v.price)
                    .push_bind(v.compare_at_price)
                    .push_bind(v.inventory_quantity)
                    .push_bind(&v.sku)
                    .push_bind(v.created_at)
                    .push_bind(v.updated_at);
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET product_id = EXCLUDED.product_id, \
                 title = EXCLUDED.title, option1 = EXCLUDED.option1, option2 = EXCLUDED.option2, \
                 option3 = EXCLUDED.option3, price = EXCLUDED.price, \
                 compare_at_price = EXCLUDED.compare_at_price, \
                 inventory_quantity = EXCLUDED.inventory_quantity, sku = EXCLUDED.sku, \
                 created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!("Catalog upsert committed");

        Ok(SyncReport {
            products: products.len(),
            variants: variants.len(),
            skipped_variants: 0,
        })
    }
}

/// Catalog reads used by indexing, retrieval and the chat flows.
#[async_trait]
pub trait CatalogQueries: Send + Sync {
    /// Every product/variant pair, ordered by `(product id, variant id)`.
    /// Index positions are assigned in this order.
    async fn products_with_variants(&self) -> Result<Vec<ProductVariant>>;

    /// Full rows for the given pairs, in the order requested. Pairs that no
    /// longer exist are omitted.
    async fn fetch_pairs(&self, pairs: &[(i64, i64)]) -> Result<Vec<ProductVariant>>;

    async fn distinct_product_types(&self) -> Result<Vec<String>>;

    /// Case-insensitive product type, `price <= budget` and an optional status.
    /// Falls back to a small random sample when nothing matches.
    async fn query_by_filters(&self, filters: &SessionFilters, limit: i64) -> Result<FilterMatches>;

    async fn random_products(&self, n: i64) -> Result<Vec<ProductSummary>>;

    /// Rows ranked by how many of the keywords occur in the product text.
    /// Rows matching none are left out.
    async fn keyword_products(&self, keywords: &[String], limit: i64) -> Result<Vec<ProductSummary>>;

    /// Run an already validated SELECT in a read-only transaction with a
    /// statement timeout. Each row comes back as a JSON object; duplicate
    /// output column names are rejected.
    async fn run_readonly_json(&self, sql: &str, row_limit: i64, timeout_ms: u64) -> Result<Vec<Value>>;
}

#[async_trait]
impl CatalogQueries for CatalogRepository {
    async fn products_with_variants(&self) -> Result<Vec<ProductVariant>> {
        let sql = format!(
            "SELECT {} FROM products p JOIN variants v ON v.product_id = p.id ORDER BY p.id, v.id",
            PAIR_COLUMNS
        );
        let rows = sqlx::query_as::<_, ProductVariant>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn fetch_pairs(&self, pairs: &[(i64, i64)]) -> Result<Vec<ProductVariant>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let (product_ids, variant_ids): (Vec<i64>, Vec<i64>) = pairs.iter().copied().unzip();
        let sql = format!(
            "SELECT {} \
             FROM unnest($1::bigint[], $2::bigint[]) WITH ORDINALITY AS req(product_id, variant_id, ord) \
             JOIN variants v ON v.id = req.variant_id AND v.product_id = req.product_id \
             JOIN products p ON p.id = v.product_id \
             ORDER BY req.ord",
            PAIR_COLUMNS
        );

        let rows = sqlx::query_as::<_, ProductVariant>(&sql)
            .bind(&product_ids)
            .bind(&variant_ids)
            .fetch_all(&self.pool)
            .await?;

        if rows.len() < pairs.len() {
            debug!("{} of {} pairs no longer in catalog", pairs.len() - rows.len(), pairs.len());
        }
        Ok(rows)
    }

    async fn distinct_product_types(&self) -> Result<Vec<String>> {
        let types = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT product_type FROM products \
             WHERE product_type IS NOT NULL AND btrim(product_type) <> '' \
             ORDER BY product_type",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(types)
    }

    #[instrument(skip(self))]
    async fn query_by_filters(&self, filters: &SessionFilters, limit: i64) -> Result<FilterMatches> {
        let sql = format!(
            "SELECT {} FROM products p JOIN variants v ON v.product_id = p.id \
             WHERE ($1::text IS NULL OR lower(p.product_type) = lower($1)) \
               AND ($2::float8 IS NULL OR v.price <= $2) \
               AND ($3::text IS NULL OR p.status = lower($3)) \
             ORDER BY v.price, p.id, v.id \
             LIMIT $4",
            SUMMARY_COLUMNS
        );

        let products = sqlx::query_as::<_, ProductSummary>(&sql)
            .bind(&filters.product_type)
            .bind(filters.price)
            .bind(&filters.status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        if !products.is_empty() {
            return Ok(FilterMatches {
                products,
                fallback: false,
            });
        }

        debug!("No products matched filters, sampling fallback");
        Ok(FilterMatches {
            products: self.random_products(FILTER_FALLBACK_SAMPLE).await?,
            fallback: true,
        })
    }

    async fn random_products(&self, n: i64) -> Result<Vec<ProductSummary>> {
        let sql = format!(
            "SELECT {} FROM products p JOIN variants v ON v.product_id = p.id \
             ORDER BY random() LIMIT $1",
            SUMMARY_COLUMNS
        );
        let rows = sqlx::query_as::<_, ProductSummary>(&sql)
            .bind(n)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn keyword_products(&self, keywords: &[String], limit: i64) -> Result<Vec<ProductSummary>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT shopify_id, variant_id, title, product_type, price, status FROM ( \
               SELECT {}, \
                 (SELECT count(*) FROM unnest($1::text[]) AS k(word) \
                  WHERE strpos(lower(concat_ws(' ', p.title, p.description, p.product_type, \
                        p.vendor, p.handle, p.tags, v.option1)), k.word) > 0) AS score \
               FROM products p JOIN variants v ON v.product_id = p.id \
             ) AS scored \
             WHERE score > 0 \
             ORDER BY score DESC, price, shopify_id, variant_id \
             LIMIT $2",
            SUMMARY_COLUMNS
        );
        let rows = sqlx::query_as::<_, ProductSummary>(&sql)
            .bind(keywords)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self, sql))]
    async fn run_readonly_json(
        &self,
        sql: &str,
        row_limit: i64,
        timeout_ms: u64,
    ) -> Result<Vec<Value>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout_ms))
            .execute(&mut *tx)
            .await?;

        let statement = (&mut *tx).prepare(sql).await?;
        let duplicates = duplicate_columns(statement.columns().iter().map(|c| c.name()));
        if !duplicates.is_empty() {
            return Err(ApiError::InvalidInput(format!(
                "Duplicate output column names: {}. Give each selected column a unique alias.",
                duplicates.join(", ")
            )));
        }

        let rows: Value = sqlx::query_scalar(&wrap_as_json(sql, row_limit))
            .fetch_one(&mut *tx)
            .await?;
        tx.rollback().await?;

        match rows {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }
}

/// Column names that occur more than once, in first-seen order. JSON row
/// objects keep only one value per key, so these would lose data.
fn duplicate_columns<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<String> = Vec::new();
    for name in names {
        if !seen.insert(name) && !duplicates.iter().any(|d| d == name) {
            duplicates.push(name.to_string());
        }
    }
    duplicates
}

/// Wrap a SELECT so Postgres returns its rows as one JSON array.
fn wrap_as_json(sql: &str, row_limit: i64) -> String {
    let inner = sql.trim().trim_end_matches(';').trim_end();
    format!(
        "SELECT COALESCE(json_agg(t), '[]'::json) FROM (SELECT * FROM ({}) AS q LIMIT {}) AS t",
        inner,
        row_limit.max(1)
    )
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// In-memory catalog with scripted read-only query results.
    pub struct InMemoryCatalog {
        pub products: Vec<ProductSummary>,
        pub pairs: Vec<ProductVariant>,
        pub readonly_results: Mutex<Vec<Result<Vec<Value>>>>,
        pub executed: Mutex<Vec<String>>,
    }

    pub fn summary(id: i64, title: &str, product_type: &str, price: f64) -> ProductSummary {
        ProductSummary {
            shopify_id: id,
            variant_id: id * 10,
            title: title.to_string(),
            product_type: Some(product_type.to_string()),
            price,
            status: "active".to_string(),
        }
    }

    impl InMemoryCatalog {
        pub fn new(products: Vec<ProductSummary>) -> Self {
            Self {
                products,
                pairs: Vec::new(),
                readonly_results: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
            }
        }

        /// Full rows served by `products_with_variants` and `fetch_pairs`.
        pub fn with_pairs(mut self, pairs: Vec<ProductVariant>) -> Self {
            self.pairs = pairs;
            self
        }

        /// Queue results for successive `run_readonly_json` calls.
        pub fn with_readonly_results(self, results: Vec<Result<Vec<Value>>>) -> Self {
            *self.readonly_results.lock().unwrap() = results.into_iter().rev().collect();
            self
        }
    }

    #[async_trait]
    impl CatalogQueries for InMemoryCatalog {
        async fn products_with_variants(&self) -> Result<Vec<ProductVariant>> {
            let mut pairs = self.pairs.clone();
            pairs.sort_by_key(|p| (p.product_id, p.variant_id));
            Ok(pairs)
        }

        async fn fetch_pairs(&self, pairs: &[(i64, i64)]) -> Result<Vec<ProductVariant>> {
            Ok(pairs
                .iter()
                .filter_map(|&(product_id, variant_id)| {
                    self.pairs
                        .iter()
                        .find(|p| p.product_id == product_id && p.variant_id == variant_id)
                        .cloned()
                })
                .collect())
        }

        async fn distinct_product_types(&self) -> Result<Vec<String>> {
            let mut types: Vec<String> = self
                .products
                .iter()
                .filter_map(|p| p.product_type.clone())
                .collect();
            types.sort();
            types.dedup();
            Ok(types)
        }

        async fn query_by_filters(&self, filters: &SessionFilters, limit: i64) -> Result<FilterMatches> {
            let products: Vec<ProductSummary> = self
                .products
                .iter()
                .filter(|p| match (&filters.product_type, &p.product_type) {
                    (Some(wanted), Some(actual)) => wanted.eq_ignore_ascii_case(actual),
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .filter(|p| filters.price.map_or(true, |budget| p.price <= budget))
                .filter(|p| filters.status.as_deref().map_or(true, |s| p.status == s))
                .take(limit as usize)
                .cloned()
                .collect();

            if products.is_empty() {
                return Ok(FilterMatches {
                    products: self.random_products(FILTER_FALLBACK_SAMPLE).await?,
                    fallback: true,
                });
            }
            Ok(FilterMatches {
                products,
                fallback: false,
            })
        }

        async fn random_products(&self, n: i64) -> Result<Vec<ProductSummary>> {
            Ok(self.products.iter().take(n as usize).cloned().collect())
        }

        async fn keyword_products(&self, keywords: &[String], limit: i64) -> Result<Vec<ProductSummary>> {
            let mut scored: Vec<(usize, &ProductSummary)> = self
                .products
                .iter()
                .map(|p| {
                    let text = format!(
                        "{} {}",
                        p.title,
                        p.product_type.as_deref().unwrap_or_default()
                    )
                    .to_lowercase();
                    (keywords.iter().filter(|k| text.contains(k.as_str())).count(), p)
                })
                .filter(|(score, _)| *score > 0)
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.price.total_cmp(&b.1.price)));
            Ok(scored
                .into_iter()
                .take(limit as usize)
                .map(|(_, p)| p.clone())
                .collect())
        }

        async fn run_readonly_json(&self, sql: &str, _row_limit: i64, _timeout_ms: u64) -> Result<Vec<Value>> {
            self.executed.lock().unwrap().push(sql.to_string());
            self.readonly_results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ApiError::DatabaseError("no scripted result".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_as_json() {
        assert_eq!(
            wrap_as_json("SELECT id FROM products; ", 20),
            "SELECT COALESCE(json_agg(t), '[]'::json) FROM (SELECT * FROM (SELECT id FROM products) AS q LIMIT 20) AS t"
        );
    }

    #[test]
    fn test_duplicate_columns() {
        assert_eq!(
            duplicate_columns(["id", "title", "id", "price", "title", "id"]),
            vec!["id".to_string(), "title".to_string()]
        );
        assert!(duplicate_columns(["product_id", "variant_id", "title"]).is_empty());
    }

    #[test]
    fn test_wrap_as_json_clamps_limit() {
        assert!(wrap_as_json("SELECT 1", 0).ends_with("LIMIT 1) AS t"));
    }
}
