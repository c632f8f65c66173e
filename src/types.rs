use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::atomic::AtomicUsize,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex};

/// Reserved identity for the automated responder. Never present in
/// `identity_tokens`; messages it authors carry the operator role plus
/// a display label so the UI can tell it apart from a human.
pub const ASSISTANT_IDENTITY: &str = "assistant";
pub const ASSISTANT_LABEL: &str = "AI Assistant";

pub const MAX_ATTACHMENT_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_SIGN_TTL_SECS: i64 = 3600;
pub const RESPONDER_CONTEXT_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Client,
    Operator,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Client => "client",
            SenderRole::Operator => "operator",
        }
    }

    pub fn opposite(self) -> SenderRole {
        match self {
            SenderRole::Client => SenderRole::Operator,
            SenderRole::Operator => SenderRole::Client,
        }
    }

    pub fn parse(value: &str) -> Option<SenderRole> {
        match value {
            "client" => Some(SenderRole::Client),
            "operator" => Some(SenderRole::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Open => "open",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<ConversationStatus> {
        match value {
            "open" => Some(ConversationStatus::Open),
            "closed" => Some(ConversationStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub owner_identity: String,
    pub owner_email: String,
    pub owner_display_name: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_identity: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub sender_label: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub storage_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
}

/// One row of the operator console list: the conversation plus its
/// derived unread count and last-message preview, produced by a single
/// grouped query in the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationOverview {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i64,
    pub last_message_preview: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSettings {
    pub active: bool,
    pub persona: String,
    pub knowledge_base: String,
    pub max_response_chars: i32,
}

/// Identity context resolved from a bearer token. Account management
/// itself lives in the external identity service; this is the slice the
/// chat subsystem consumes.
#[derive(Debug, Clone)]
pub struct AuthedIdentity {
    pub identity: String,
    pub email: String,
    pub display_name: String,
    pub role: SenderRole,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendMessageBody {
    pub content: Option<String>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUrlBody {
    pub storage_path: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReplyBody {
    pub conversation_id: Option<String>,
    pub message_content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchAssistantSettingsBody {
    pub active: Option<bool>,
    pub persona: Option<String>,
    pub knowledge_base: Option<String>,
    pub max_response_chars: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub operators: HashSet<usize>,
    pub conversation_watchers: HashMap<String, HashSet<usize>>,
    pub watched_conversation: HashMap<usize, String>,
}

pub struct AppState {
    pub db: PgPool,
    pub realtime: Mutex<RealtimeState>,
    pub next_client_id: AtomicUsize,
    pub http: reqwest::Client,
    pub media_storage_dir: PathBuf,
    pub media_signing_secret: String,
    pub public_base_url: String,
}
