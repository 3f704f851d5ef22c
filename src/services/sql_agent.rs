//! Experimental chatbot where the LLM answers product questions by writing
//! SQL against the catalog. Each turn runs a small bounded loop: ask for
//! `{message, query}`, vet the SQL, run it read-only, and feed any database
//! error back for another attempt.

use crate::{
    config::Config,
    error::{ApiError, Result},
    models::{is_exit_command, AgentAnswer, AgentResponse, ChatMessage},
    services::{
        catalog_repository::CatalogQueries,
        llm::{extract_json_block, ChatModel, ChatOptions},
        session_store::{agent_key, resolve_session_id, SessionStore},
    },
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Stored messages per session, user and assistant alike; older ones are
/// dropped first.
const MAX_HISTORY: usize = 20;
const KEYWORD_LIMIT: i64 = 10;

/// Filler words skipped when picking fallback keywords.
const STOPWORDS: [&str; 16] = [
    "the", "and", "for", "any", "you", "are", "have", "with", "what", "show", "some", "can",
    "please", "want", "need", "looking",
];

const FALLBACK_MESSAGE: &str =
    "I couldn't find an exact match, but here are some products you might like.";

lazy_static! {
    static ref FORBIDDEN_SQL: Regex = Regex::new(
        r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|copy|merge|call|vacuum|lock|comment|reindex|refresh|execute|prepare|into|set|reset)\b"
    )
    .unwrap();
    static ref LEADING_KEYWORD: Regex = Regex::new(r"(?i)^(select|with)\b").unwrap();
    /// String literals and quoted identifiers, with doubled-quote escapes.
    static ref QUOTED: Regex = Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*""#).unwrap();
    static ref WORD: Regex = Regex::new(r"\w+").unwrap();
}

const SYSTEM_PROMPT: &str = r#"You are a shopping assistant for an online store. You answer product questions by writing one PostgreSQL query against this schema:

products(id BIGINT PRIMARY KEY, title TEXT, description TEXT, vendor TEXT, handle TEXT, tags TEXT, status TEXT -- active | archived | draft, product_type TEXT, image_url TEXT, created_at TIMESTAMPTZ, updated_at TIMESTAMPTZ)
variants(id BIGINT PRIMARY KEY, product_id BIGINT REFERENCES products(id), title TEXT, option1 TEXT, option2 TEXT, option3 TEXT, price DOUBLE PRECISION, compare_at_price DOUBLE PRECISION, inventory_quantity INTEGER, sku TEXT)

Rules:
1. Only write a single read-only SELECT (or WITH ... SELECT) statement.
2. Compare text case-insensitively (ILIKE or lower()).
3. Prefer active products that are in stock.
4. If the message is not about products, answer it briefly and use an empty query.
5. Do not explain your reasoning.
6. Reply only with JSON in this format:
```json
{"message": "<short friendly message for the customer>", "query": "<the SQL query>"}
```"#;

/// Check that generated SQL is a single read-only statement. Returns the
/// statement without trailing semicolons.
pub fn validate_sql(sql: &str) -> Result<String> {
    let statement = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    if statement.is_empty() {
        return Err(ApiError::InvalidInput("SQL query is empty".to_string()));
    }
    // Keywords and semicolons only count outside quotes.
    let unquoted = QUOTED.replace_all(statement, "''");
    if unquoted.contains(';') {
        return Err(ApiError::InvalidInput(
            "Only a single SQL statement is allowed".to_string(),
        ));
    }
    if !LEADING_KEYWORD.is_match(statement) {
        return Err(ApiError::InvalidInput(
            "Query must start with SELECT or WITH".to_string(),
        ));
    }
    if let Some(found) = FORBIDDEN_SQL.find(&unquoted) {
        return Err(ApiError::InvalidInput(format!(
            "Keyword '{}' is not allowed in a read-only query",
            found.as_str().to_uppercase()
        )));
    }

    Ok(statement.to_string())
}

/// Lowercased words of three or more letters, without filler words or
/// repeats, in the order they appear.
pub fn keywords(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut words: Vec<String> = Vec::new();
    for word in WORD.find_iter(&lower).map(|m| m.as_str()) {
        if word.chars().count() >= 3 && !STOPWORDS.contains(&word) && !words.iter().any(|w| w == word) {
            words.push(word.to_string());
        }
    }
    words
}

#[derive(Clone)]
pub struct SqlAgentService {
    catalog: Arc<dyn CatalogQueries>,
    chat: Arc<dyn ChatModel>,
    sessions: Arc<SessionStore>,
    options: ChatOptions,
    max_attempts: u32,
    fallback_sample: i64,
    row_limit: i64,
    statement_timeout_ms: u64,
}

impl SqlAgentService {
    pub fn new(
        catalog: Arc<dyn CatalogQueries>,
        chat: Arc<dyn ChatModel>,
        sessions: Arc<SessionStore>,
        config: &Config,
    ) -> Self {
        Self {
            catalog,
            chat,
            sessions,
            options: ChatOptions {
                temperature: config.llm_temperature,
                max_tokens: config.llm_max_tokens,
            },
            max_attempts: config.agent_max_attempts.max(1),
            fallback_sample: config.agent_fallback_sample,
            row_limit: config.agent_row_limit,
            statement_timeout_ms: config.agent_statement_timeout_ms,
        }
    }

    #[instrument(skip(self, query))]
    pub async fn handle(&self, session_id: Option<&str>, query: &str) -> Result<AgentResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::InvalidInput("Query cannot be empty".to_string()));
        }

        let session_id = resolve_session_id(session_id);
        let key = agent_key(&session_id);

        if is_exit_command(query) {
            self.sessions.delete(&key).await?;
            info!(session_id = %session_id, "Agent session ended");
            return Ok(AgentResponse {
                session_id,
                response: AgentAnswer {
                    message: "Session ended. Goodbye!".to_string(),
                    ..AgentAnswer::default()
                },
            });
        }

        let mut history: Vec<ChatMessage> = self.sessions.get_json(&key).await?.unwrap_or_default();
        history.push(ChatMessage::user(query));

        let answer = self.run_turn(query, &history).await?;

        history.push(ChatMessage::assistant(answer.message.clone()));
        if history.len() > MAX_HISTORY {
            history.drain(..history.len() - MAX_HISTORY);
        }
        self.sessions.set_json(&key, &history).await?;

        info!(
            session_id = %session_id,
            rows = answer.result.len(),
            fallback = answer.fallback,
            "Agent turn finished"
        );
        Ok(AgentResponse {
            session_id,
            response: answer,
        })
    }

    async fn run_turn(&self, user_query: &str, history: &[ChatMessage]) -> Result<AgentAnswer> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(SYSTEM_PROMPT));
        messages.extend_from_slice(history);

        let mut last_message: Option<String> = None;
        let mut last_query = String::new();

        for attempt in 1..=self.max_attempts {
            let reply = self.chat.chat(&messages, &self.options).await?;
            messages.push(ChatMessage::assistant(reply.clone()));

            let Some(json) = extract_json_block(&reply) else {
                debug!(attempt, "Agent replied without JSON");
                last_message = Some(reply.trim().to_string()).filter(|m| !m.is_empty());
                break;
            };

            let message = json
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            let sql = json.get("query").and_then(Value::as_str).unwrap_or_default();
            if message.is_some() {
                last_message = message.clone();
            }

            if sql.trim().is_empty() {
                break;
            }

            let sql = match validate_sql(sql) {
                Ok(sql) => sql,
                Err(e) => {
                    warn!(attempt, "Rejected generated SQL: {}", e);
                    messages.push(ChatMessage::user(format!(
                        "The query was rejected: {}. Reply again in the same JSON format with a single read-only SELECT.",
                        e
                    )));
                    continue;
                }
            };
            last_query = sql.clone();

            match self
                .catalog
                .run_readonly_json(&sql, self.row_limit, self.statement_timeout_ms)
                .await
            {
                Ok(rows) if !rows.is_empty() => {
                    return Ok(AgentAnswer {
                        message: message.unwrap_or_else(|| "Here is what I found.".to_string()),
                        query: sql,
                        result: rows,
                        fallback: false,
                    });
                }
                Ok(_) => {
                    debug!(attempt, "Generated SQL returned no rows");
                    break;
                }
                Err(e) => {
                    warn!(attempt, "Generated SQL failed: {}", e);
                    messages.push(ChatMessage::user(format!(
                        "The query failed with this error: {}. Fix the SQL and reply again in the same JSON format.",
                        e
                    )));
                }
            }
        }

        self.fallback(user_query, last_message, last_query).await
    }

    /// Products scored by keyword overlap with the customer's words, or a
    /// random sample when none of them match.
    async fn fallback(
        &self,
        user_query: &str,
        message: Option<String>,
        query: String,
    ) -> Result<AgentAnswer> {
        let words = keywords(user_query);
        let mut products = self.catalog.keyword_products(&words, KEYWORD_LIMIT).await?;
        if products.is_empty() {
            products = self.catalog.random_products(self.fallback_sample).await?;
        }
        debug!(?words, rows = products.len(), "Agent fallback products");
        let result = products
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(AgentAnswer {
            message: message.unwrap_or_else(|| FALLBACK_MESSAGE.to_string()),
            query,
            result,
            fallback: true,
        })
    }
}
