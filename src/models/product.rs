use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog product as stored in the `products` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub vendor: Option<String>,
    pub handle: Option<String>,
    pub tags: Option<String>,
    pub status: String,
    pub product_type: Option<String>,
    pub image_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A purchasable variant of a [`Product`], stored in the `variants` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Variant {
    pub id: i64,
    pub product_id: i64,
    pub title: Option<String>,
    pub option1: Option<String>,
    pub option2: Option<String>,
    pub option3: Option<String>,
    pub price: f64,
    pub compare_at_price: Option<f64>,
    pub inventory_quantity: i32,
    pub sku: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One product joined with one of its variants. The unit that gets embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductVariant {
    pub product_id: i64,
    pub variant_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub vendor: Option<String>,
    pub handle: Option<String>,
    pub tags: Option<String>,
    pub status: String,
    pub product_type: Option<String>,
    pub image_url: Option<String>,
    pub variant_title: Option<String>,
    pub option1: Option<String>,
    pub price: f64,
    pub inventory_quantity: i32,
    pub sku: Option<String>,
}

impl ProductVariant {
    pub fn option_label(&self) -> &str {
        self.option1
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .or(self.variant_title.as_deref())
            .unwrap_or("Default")
    }

    pub fn product_type_label(&self) -> &str {
        self.product_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("Uncategorized")
    }

    /// Text that is embedded into the semantic index for this pair.
    pub fn search_text(&self) -> String {
        format!(
            "{} - {}, {}, ${:.2}",
            self.title,
            self.product_type_label(),
            self.option_label(),
            self.price
        )
    }

    /// Line describing the candidate to the LLM.
    pub fn prompt_line(&self) -> String {
        format!(
            "product id: {}, variant id: {}, name: {} - category: {}, option: {}, price: ${:.2}, inventory_quantity: {}, status: {}",
            self.product_id,
            self.variant_id,
            self.title,
            self.product_type_label(),
            self.option_label(),
            self.price,
            self.inventory_quantity,
            self.status
        )
    }
}

/// Lean row returned by filter queries and agent fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductSummary {
    pub shopify_id: i64,
    pub variant_id: i64,
    pub title: String,
    pub product_type: Option<String>,
    pub price: f64,
    pub status: String,
}

#[cfg(test)]
pub(crate) fn sample_pair(product_id: i64, variant_id: i64, title: &str, price: f64) -> ProductVariant {
    ProductVariant {
        product_id,
        variant_id,
        title: title.to_string(),
        description: None,
        vendor: Some("Acme".into()),
        handle: None,
        tags: None,
        status: "active".into(),
        product_type: Some("Shoes".into()),
        image_url: None,
        variant_title: Some("Red / 42".into()),
        option1: Some("Red".into()),
        price,
        inventory_quantity: 3,
        sku: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_text_format() {
        let pair = sample_pair(1, 10, "Trail Runner", 89.5);
        assert_eq!(pair.search_text(), "Trail Runner - Shoes, Red, $89.50");
    }

    #[test]
    fn test_option_falls_back_to_variant_title() {
        let mut pair = sample_pair(1, 10, "Trail Runner", 10.0);
        pair.option1 = Some("  ".into());
        assert_eq!(pair.option_label(), "Red / 42");

        pair.variant_title = None;
        pair.option1 = None;
        assert_eq!(pair.option_label(), "Default");
    }}
