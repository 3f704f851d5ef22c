use serde::{Deserialize, Serialize};

/// Slots collected by the filter chat. Values from later turns are merged
/// over earlier ones; a turn that says nothing about a slot leaves it alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type: Option<String>,
    /// Budget: the maximum variant price the customer accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl SessionFilters {
    pub fn merge(&mut self, update: SessionFilters) {
        if update.status.is_some() {
            self.status = update.status;
        }
        if update.product_type.is_some() {
            self.product_type = update.product_type;
        }
        if update.price.is_some() {
            self.price = update.price;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.product_type.is_some() && self.price.is_some()
    }

    pub fn missing_slots(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.product_type.is_none() {
            missing.push("product_type");
        }
        if self.price.is_none() {
            missing.push("price");
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat turn, used both for LLM requests and stored histories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Words that end a chat session and clear its server-side state.
pub fn is_exit_command(input: &str) -> bool {
    matches!(
        input.trim().to_lowercase().as_str(),
        "exit" | "quit" | "q"
    )
}
