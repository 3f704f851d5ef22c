//! Multi-turn slot filling: collect a product type and a budget across chat
//! turns, then query the catalog with them.

use crate::{
    error::{ApiError, Result},
    models::{is_exit_command, FilterChatResponse, SessionFilters},
    services::{
        catalog_repository::CatalogQueries,
        llm::{ask, extract_json_block, ChatModel, ChatOptions},
        session_store::{filters_key, resolve_session_id, SessionStore},
    },
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RESULT_LIMIT: i64 = 10;
const KNOWN_STATUSES: [&str; 3] = ["active", "archived", "draft"];

lazy_static! {
    static ref PRICE_NUMBER: Regex = Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap();
}

#[derive(Clone)]
pub struct FilterChatService {
    catalog: Arc<dyn CatalogQueries>,
    chat: Arc<dyn ChatModel>,
    sessions: Arc<SessionStore>,
    options: ChatOptions,
}

impl FilterChatService {
    pub fn new(
        catalog: Arc<dyn CatalogQueries>,
        chat: Arc<dyn ChatModel>,
        sessions: Arc<SessionStore>,
        options: ChatOptions,
    ) -> Self {
        Self {
            catalog,
            chat,
            sessions,
            options,
        }
    }

    pub async fn handle(&self, session_id: Option<&str>, message: &str) -> Result<FilterChatResponse> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ApiError::InvalidInput("Message cannot be empty".to_string()));
        }

        let session_id = resolve_session_id(session_id);
        let key = filters_key(&session_id);

        if is_exit_command(message) {
            self.sessions.delete(&key).await?;
            info!(session_id = %session_id, "Filter session ended");
            return Ok(reply(session_id, "Session ended. Goodbye!", SessionFilters::default()));
        }

        if message.eq_ignore_ascii_case("reset") {
            self.sessions.delete(&key).await?;
            return Ok(reply(
                session_id,
                "Filters cleared. What kind of product are you looking for?",
                SessionFilters::default(),
            ));
        }

        let known_types = self.catalog.distinct_product_types().await?;
        let extracted = self.extract_filters(message, &known_types).await?;

        let mut filters: SessionFilters = self.sessions.get_json(&key).await?.unwrap_or_default();
        filters.merge(extracted);
        self.sessions.set_json(&key, &filters).await?;
        debug!(
            session_id = %session_id,
            ?filters,
            missing = ?filters.missing_slots(),
            "Session filters updated"
        );

        if !filters.is_complete() {
            let question = follow_up_question(&filters, &known_types);
            return Ok(reply(session_id, &question, filters));
        }

        let matches = self.catalog.query_by_filters(&filters, RESULT_LIMIT).await?;
        let message = if matches.fallback {
            "No products matched your filters. Here are some other products you might like.".to_string()
        } else {
            format!(
                "Found {} {} product(s) within your budget of ${:.2}.",
                matches.products.len(),
                filters.product_type.as_deref().unwrap_or_default(),
                filters.price.unwrap_or_default()
            )
        };

        info!(
            session_id = %session_id,
            results = matches.products.len(),
            fallback = matches.fallback,
            "Filter query answered"
        );

        Ok(FilterChatResponse {
            session_id,
            message,
            filters,
            complete: true,
            fallback: matches.fallback,
            products: matches.products,
        })
    }

    /// Forget the filters collected for a session. Returns whether any existed.
    pub async fn reset(&self, session_id: &str) -> Result<bool> {
        self.sessions.delete(&filters_key(session_id)).await
    }

    /// Ask the LLM for `{status, product_type, price}`. A reply without usable
    /// JSON yields empty filters.
    async fn extract_filters(&self, message: &str, known_types: &[String]) -> Result<SessionFilters> {
        let system = format!(
            "Extract search filters from user queries. Return a JSON object with \
             'status' (e.g., active, archived), 'product_type' (one of: {}), \
             'price' (budget, a number). Use null for anything not mentioned. \
             Reply with the JSON object only.",
            known_types.join(", ")
        );

        let reply = ask(self.chat.as_ref(), &system, message, &self.options).await?;
        match extract_json_block(&reply) {
            Some(value) => Ok(parse_filters(&value, known_types)),
            None => {
                warn!("Filter extraction returned no JSON object");
                Ok(SessionFilters::default())
            }
        }
    }
}

fn reply(session_id: String, message: &str, filters: SessionFilters) -> FilterChatResponse {
    FilterChatResponse {
        session_id,
        message: message.to_string(),
        filters,
        complete: false,
        fallback: false,
        products: Vec::new(),
    }
}

/// Turn the extraction JSON into filters. Unknown product types and
/// statuses are dropped rather than stored.
pub fn parse_filters(value: &Value, known_types: &[String]) -> SessionFilters {
    let text = |field: &str| {
        value
            .get(field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
    };

    let status = text("status")
        .map(str::to_lowercase)
        .filter(|s| KNOWN_STATUSES.contains(&s.as_str()));

    let product_type = text("product_type").and_then(|raw| snap_product_type(raw, known_types));

    let price = value.get("price").and_then(parse_price).filter(|p| *p > 0.0);

    SessionFilters {
        status,
        product_type,
        price,
    }
}

/// Match a free-text product type to a catalog type, ignoring case and a
/// single plural `s` or `es` on either side. With no known types the raw
/// value is kept.
pub fn snap_product_type(raw: &str, known_types: &[String]) -> Option<String> {
    let raw = raw.trim();
    if known_types.is_empty() {
        return Some(raw.to_string()).filter(|r| !r.is_empty());
    }

    let wanted = noun_forms(raw);
    known_types
        .iter()
        .find(|known| known.eq_ignore_ascii_case(raw))
        .or_else(|| {
            known_types
                .iter()
                .find(|known| noun_forms(known).iter().any(|form| wanted.contains(form)))
        })
        .cloned()
}

/// The lower-cased word plus its stems with one `es` or `s` removed.
fn noun_forms(word: &str) -> Vec<String> {
    let lower = word.trim().to_lowercase();
    let stems = [lower.strip_suffix("es"), lower.strip_suffix('s')];
    let mut forms: Vec<String> = stems
        .into_iter()
        .flatten()
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .collect();
    forms.push(lower);
    forms
}

/// Numbers pass through; strings like `"$50"`, `"1,200 USD"` or
/// `"under 80"` yield their first number.
pub fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => PRICE_NUMBER
            .find(s)
            .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok()),
        _ => None,
    }
}

fn follow_up_question(filters: &SessionFilters, known_types: &[String]) -> String {
    let types_hint = if known_types.is_empty() {
        String::new()
    } else {
        format!(" Available product types: {}.", known_types.join(", "))
    };

    match (&filters.product_type, filters.price) {
        (None, None) => format!(
            "What kind of product are you looking for, and what is your budget?{}",
            types_hint
        ),
        (None, Some(price)) => format!(
            "What kind of product are you looking for with a budget of ${:.2}?{}",
            price, types_hint
        ),
        (Some(product_type), None) => {
            format!("What is your budget for {}?", product_type)
        }
        (Some(_), Some(_)) => "Anything else I should know?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        catalog_repository::test_support::{summary, InMemoryCatalog},
        llm::test_support::ScriptedChat,
        session_store::test_support::memory_store,
    };
    use serde_json::json;
    use std::time::Duration;

    fn known() -> Vec<String> {
        vec!["Hats".to_string(), "Shoes".to_string()]
    }

    fn service(replies: &[&str]) -> (FilterChatService, Arc<SessionStore>) {
        let catalog = InMemoryCatalog::new(vec![
            summary(1, "Trail Runner", "Shoes", 90.0),
            summary(2, "Court Classic", "Shoes", 45.0),
            summary(3, "Wool Hat", "Hats", 25.0),
        ]);
        let sessions = Arc::new(memory_store(Duration::from_secs(60)));
        let service = FilterChatService::new(
            Arc::new(catalog),
            Arc::new(ScriptedChat::new(replies)),
            Arc::clone(&sessions),
            ChatOptions {
                temperature: 0.0,
                max_tokens: 200,
            },
        );
        (service, sessions)
    }

    #[test]
    fn test_parse_price_formats() {
        assert_eq!(parse_price(&json!(50)), Some(50.0));
        assert_eq!(parse_price(&json!("$50")), Some(50.0));
        assert_eq!(parse_price(&json!("1,200.50 USD")), Some(1200.5));
        assert_eq!(parse_price(&json!("under 80 dollars")), Some(80.0));
        assert_eq!(parse_price(&json!("cheap")), None);
        assert_eq!(parse_price(&json!(null)), None);
    }

    #[test]
    fn test_snap_product_type() {
        assert_eq!(snap_product_type("shoes", &known()).as_deref(), Some("Shoes"));
        assert_eq!(snap_product_type("Hat", &known()).as_deref(), Some("Hats"));
        assert_eq!(snap_product_type("Jackets", &known()), None);
        assert_eq!(snap_product_type("Jackets", &[]).as_deref(), Some("Jackets"));
    }

    #[test]
    fn test_snap_product_type_handles_es_plurals() {
        let known = vec!["Dress".to_string(), "Glasses".to_string()];
        assert_eq!(snap_product_type("dresses", &known).as_deref(), Some("Dress"));
        assert_eq!(snap_product_type("glass", &known).as_deref(), Some("Glasses"));
        assert_eq!(snap_product_type("dress", &known).as_deref(), Some("Dress"));
        assert_eq!(snap_product_type("s", &known), None);
    }

    #[test]
    fn test_parse_filters_drops_unknown_values() {
        let filters = parse_filters(
            &json!({"status": "ACTIVE", "product_type": "shoe", "price": "$75"}),
            &known(),
        );
        assert_eq!(filters.status.as_deref(), Some("active"));
        assert_eq!(filters.product_type.as_deref(), Some("Shoes"));
        assert_eq!(filters.price, Some(75.0));

        let filters = parse_filters(
            &json!({"status": "sold", "product_type": "null", "price": 0}),
            &known(),
        );
        assert_eq!(filters, SessionFilters::default());
    }

    #[test]
    fn test_follow_up_names_missing_slot() {
        let filters = SessionFilters {
            status: None,
            product_type: Some("Shoes".into()),
            price: None,
        };
        assert_eq!(follow_up_question(&filters, &known()), "What is your budget for Shoes?");

        let question = follow_up_question(&SessionFilters::default(), &known());
        assert!(question.contains("Available product types: Hats, Shoes."));
    }

    #[tokio::test]
    async fn test_slots_fill_across_turns() {
        let (service, _) = service(&[
            r#"```json
{"status": null, "product_type": "shoes", "price": null}
```"#,
            r#"{"price": "$50"}"#,
        ]);

        let first = service.handle(Some("s1"), "I want shoes").await.unwrap();
        assert_eq!(first.session_id, "s1");
        assert!(!first.complete);
        assert_eq!(first.message, "What is your budget for Shoes?");

        let second = service.handle(Some("s1"), "about $50").await.unwrap();
        assert!(second.complete);
        assert!(!second.fallback);
        assert_eq!(second.filters.product_type.as_deref(), Some("Shoes"));
        assert_eq!(second.products.len(), 1);
        assert_eq!(second.products[0].title, "Court Classic");
    }

    #[tokio::test]
    async fn test_no_match_returns_flagged_fallback() {
        let (service, _) = service(&[r#"{"product_type": "Hats", "price": 5}"#]);
        let response = service.handle(None, "a hat under 5 bucks").await.unwrap();

        assert!(response.complete);
        assert!(response.fallback);
        assert_eq!(response.products.len(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_reply_still_counts_as_turn() {
        let (service, sessions) = service(&["Sorry, I am not sure."]);
        let response = service.handle(Some("s2"), "hello").await.unwrap();

        assert!(!response.complete);
        assert_eq!(response.filters, SessionFilters::default());
        let stored: Option<SessionFilters> = sessions.get_json(&filters_key("s2")).await.unwrap();
        assert_eq!(stored, Some(SessionFilters::default()));
    }

    #[tokio::test]
    async fn test_exit_and_reset_clear_session() {
        let (service, sessions) = service(&[r#"{"product_type": "Shoes"}"#]);
        service.handle(Some("s3"), "shoes please").await.unwrap();
        let stored: Option<SessionFilters> = sessions.get_json(&filters_key("s3")).await.unwrap();
        assert_eq!(stored.and_then(|f| f.product_type).as_deref(), Some("Shoes"));

        let bye = service.handle(Some("s3"), "Quit").await.unwrap();
        assert_eq!(bye.message, "Session ended. Goodbye!");
        let stored: Option<SessionFilters> = sessions.get_json(&filters_key("s3")).await.unwrap();
        assert!(stored.is_none());
        assert!(!service.reset("s3").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let (service, _) = service(&[]);
        let result = service.handle(Some("s4"), "   ").await;
        assert!(matches!(result, Err(ApiError::InvalidInput(_))));
    }
}
