use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A tool invocation requested by the model.
///
/// `id` is empty when the provider did not supply one; see
/// `ToolCallParser::ensure_ids` in the session crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: agentloop_core::id::call_id(),
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: serde_json::Value,
    /// Multimodal side-channel for providers that accept media inside a tool result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<InlineData>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Part {
    Text { text: String },
    Thought { text: String },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    InlineData(InlineData),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Part::FunctionResponse(response) => Some(response),
            _ => None,
        }
    }
}

/// One entry of a conversation log. Its index in the log is its identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub is_user_input: bool,
    #[serde(default)]
    pub is_function_response: bool,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_message_count: Option<usize>,
    /// Cached token counts keyed by provider id.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub token_counts: HashMap<String, u64>,
    /// Dynamic context generated once at the start of the round this message opens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_dynamic_context: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: agentloop_core::id::message_id(),
            role,
            parts,
            is_user_input: false,
            is_function_response: false,
            is_summary: false,
            summarized_message_count: None,
            token_counts: HashMap::new(),
            turn_dynamic_context: None,
            created_at: Utc::now(),
        }
    }

    /// A message typed by the user. Opens a new round.
    pub fn user_input(text: impl Into<String>) -> Self {
        let mut content = Self::new(Role::User, vec![Part::text(text)]);
        content.is_user_input = true;
        content
    }

    /// A user-role message that is not direct user input (annotations, notices).
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::model(vec![Part::text(text)])
    }

    pub fn function_responses(parts: Vec<Part>) -> Self {
        let mut content = Self::new(Role::User, parts);
        content.is_function_response = true;
        content
    }

    pub fn summary(text: impl Into<String>, summarized_message_count: usize) -> Self {
        let mut content = Self::new(Role::User, vec![Part::text(text)]);
        content.is_summary = true;
        content.summarized_message_count = Some(summarized_message_count);
        content
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call)
    }

    pub fn function_responses_iter(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(Part::as_function_response)
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall(_)))
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            Part::Text { text } | Part::Thought { text } => text.is_empty(),
            _ => false,
        })
    }
}
