use crate::{
    error::{ApiError, Result},
    models::AssistantResponse,
    services::{
        catalog_repository::CatalogQueries,
        llm::{ask, ChatModel, ChatOptions},
    },
};
use std::{fmt, sync::Arc};
use tracing::{debug, info};

const ASSISTANT_PROMPT: &str = "You are a helpful assistant for a shopping assistant app. \
    If the user is asking about available products, and product categories have been provided, \
    include them in your answer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ProductTypes,
    Chat,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::ProductTypes => write!(f, "product_types"),
            Intent::Chat => write!(f, "chat"),
        }
    }
}

/// Read the classifier's one-word answer. Anything unrecognized is chat.
pub fn parse_intent(reply: &str) -> Intent {
    let reply = reply.trim().to_lowercase();
    if reply.contains("get_product_types") || reply.contains("product_types") {
        Intent::ProductTypes
    } else {
        Intent::Chat
    }
}

fn classifier_prompt(message: &str) -> String {
    format!(
        "You are an intent classifier.\n\n\
         Classify the following user message into one of the following categories by replying ONLY with the keyword (no explanation):\n\
         - get_product_types: the user is asking what products are available, what kind of items you sell, product types, product suggestions, categories, or anything related to shopping or browsing products.\n\
         - chatbot: anything else (general questions, casual talk, etc).\n\n\
         User message: \"{}\"\n\n\
         Just reply with: get_product_types OR chatbot",
        message
    )
}

/// Routes a free-form question either to a catalog-aware answer that lists
/// the store's product types, or to a plain chat answer.
#[derive(Clone)]
pub struct AssistantRouter {
    catalog: Arc<dyn CatalogQueries>,
    chat: Arc<dyn ChatModel>,
    classifier_options: ChatOptions,
    options: ChatOptions,
}

impl AssistantRouter {
    pub fn new(catalog: Arc<dyn CatalogQueries>, chat: Arc<dyn ChatModel>, options: ChatOptions) -> Self {
        Self {
            catalog,
            chat,
            classifier_options: ChatOptions {
                temperature: 0.0,
                max_tokens: 16,
            },
            options,
        }
    }

    pub async fn classify(&self, message: &str) -> Result<Intent> {
        let reply = ask(
            self.chat.as_ref(),
            "Reply with a single keyword.",
            &classifier_prompt(message),
            &self.classifier_options,
        )
        .await?;
        let intent = parse_intent(&reply);
        debug!(%intent, "Classified assistant message");
        Ok(intent)
    }

    pub async fn handle(&self, query: &str) -> Result<AssistantResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
        }

        let intent = self.classify(query).await?;
        let product_types = match intent {
            Intent::ProductTypes => self.catalog.distinct_product_types().await?,
            Intent::Chat => Vec::new(),
        };

        let product_info = if product_types.is_empty() {
            String::new()
        } else {
            let list = product_types
                .iter()
                .map(|t| format!("- {}", t))
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "The following product categories are available in our store:\n{}\n\n",
                list
            )
        };

        let response = ask(
            self.chat.as_ref(),
            ASSISTANT_PROMPT,
            &format!("{}{}", product_info, query),
            &self.options,
        )
        .await?;

        info!(route = %intent, types = product_types.len(), "Assistant answered");
        Ok(AssistantResponse {
            route: intent.to_string(),
            response,
            product_types,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        catalog_repository::test_support::{summary, InMemoryCatalog},
        llm::test_support::ScriptedChat,
    };

    fn router(chat: Arc<ScriptedChat>) -> AssistantRouter {
        let catalog = InMemoryCatalog::new(vec![
            summary(1, "Trail Runner", "Shoes", 90.0),
            summary(2, "Wool Hat", "Hats", 25.0),
        ]);
        AssistantRouter::new(
            Arc::new(catalog),
            chat,
            ChatOptions {
                temperature: 0.7,
                max_tokens: 300,
            },
        )
    }

    #[test]
    fn test_parse_intent() {
        assert_eq!(parse_intent("get_product_types"), Intent::ProductTypes);
        assert_eq!(parse_intent("  GET_PRODUCT_TYPES\n"), Intent::ProductTypes);
        assert_eq!(parse_intent("chatbot"), Intent::Chat);
        assert_eq!(parse_intent("I am not sure"), Intent::Chat);
    }

    #[tokio::test]
    async fn test_product_question_includes_types() {
        let chat = Arc::new(ScriptedChat::new(&[
            "get_product_types",
            "We sell hats and shoes.",
        ]));
        let response = router(Arc::clone(&chat))
            .handle("what do you sell?")
            .await
            .unwrap();

        assert_eq!(response.route, "product_types");
        assert_eq!(response.product_types, vec!["Hats", "Shoes"]);
        assert_eq!(response.response, "We sell hats and shoes.");

        let requests = chat.requests.lock().unwrap();
        assert!(requests[1][1].content.contains("- Hats\n- Shoes"));
    }

    #[tokio::test]
    async fn test_small_talk_skips_catalog() {
        let chat = Arc::new(ScriptedChat::new(&["chatbot", "Hello there!"]));
        let response = router(chat).handle("hi").await.unwrap();

        assert_eq!(response.route, "chat");
        assert!(response.product_types.is_empty());
        assert_eq!(response.response, "Hello there!");
    }
}
