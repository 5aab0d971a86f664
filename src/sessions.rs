use crate::providers::OwnerType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key marking an interaction as a tool invocation.
pub const TOOL_ID_METADATA_KEY: &str = "tool_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creator {
    User,
    Assistant,
    System,
}

impl Creator {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionState {
    Waiting,
    Complete,
    Error,
}

impl InteractionState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Reads an OpenAI `usage` object.
    pub fn from_openai(value: &serde_json::Value) -> Option<Self> {
        let usage = value.get("usage")?.as_object()?;
        let get = |key: &str| usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let prompt_tokens = get("prompt_tokens");
        let completion_tokens = get("completion_tokens");
        let total_tokens = match get("total_tokens") {
            0 => prompt_tokens + completion_tokens,
            n => n,
        };
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub rag_source_id: String,
    #[serde(default)]
    pub assistant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub session_id: String,
    pub generation_id: i64,
    pub creator: Creator,
    pub state: InteractionState,
    pub prompt_message: String,
    pub response_message: String,
    #[serde(default)]
    pub error: String,
    pub finished: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub scheduled: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Interaction {
    /// A fresh interaction waiting for its response.
    pub fn waiting(session_id: &str, generation_id: i64, prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("int_{}", uuid::Uuid::new_v4().to_string().replace("-", "")),
            session_id: session_id.to_string(),
            generation_id,
            creator: Creator::User,
            state: InteractionState::Waiting,
            prompt_message: prompt.to_string(),
            response_message: String::new(),
            error: String::new(),
            finished: false,
            created: now,
            updated: now,
            scheduled: Some(now),
            completed: None,
            duration_ms: 0,
            usage: Usage::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn tool_id(&self) -> Option<&str> {
        self.metadata
            .get(TOOL_ID_METADATA_KEY)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub owner_type: OwnerType,
    pub model_name: String,
    pub provider: String,
    #[serde(default)]
    pub parent_app: String,
    #[serde(default)]
    pub organization_id: String,
    pub generation_id: i64,
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub interactions: Vec<Interaction>,
}

impl Session {
    pub fn new(owner: &str, model_name: &str, provider: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("ses_{}", uuid::Uuid::new_v4().to_string().replace("-", "")),
            name: String::new(),
            owner: owner.to_string(),
            owner_type: OwnerType::User,
            model_name: model_name.to_string(),
            provider: provider.to_string(),
            parent_app: String::new(),
            organization_id: String::new(),
            generation_id: 0,
            metadata: SessionMetadata::default(),
            created: now,
            updated: now,
            interactions: Vec::new(),
        }
    }

    pub fn last_interaction(&self) -> Option<&Interaction> {
        self.interactions.last()
    }
}

/// Temporary session name: the first five words of the prompt.
pub fn session_name_from_prompt(prompt: &str) -> String {
    prompt.split_whitespace().take(5).collect::<Vec<_>>().join(" ")
}

/// Keeps only the most recent `limit` interactions.
pub fn limit_interactions(interactions: &[Interaction], limit: usize) -> &[Interaction] {
    if limit == 0 || interactions.len() <= limit {
        return interactions;
    }
    &interactions[interactions.len() - limit..]
}
