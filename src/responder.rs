use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::AppError;
use crate::feed;
use crate::notify;
use crate::prompting::{render_system_prompt, SystemPromptContext};
use crate::store::{self, NewMessage};
use crate::types::{
    AppState, ChatMessage, SenderRole, ASSISTANT_IDENTITY, ASSISTANT_LABEL,
    RESPONDER_CONTEXT_WINDOW,
};

/// Sent in place of a generated reply when the text-generation service
/// is unavailable or over quota. The client's message is already
/// persisted by then; the orchestrator never fails the send.
pub const FALLBACK_REPLY: &str = "Thanks for reaching out! A member of our team has been \
notified and will get back to you shortly.";

/// Maps the trailing window of the conversation onto generic role-tagged
/// turns: client -> "user", any operator (human or automated) ->
/// "assistant".
pub fn context_turns(messages: &[ChatMessage], window: usize) -> Vec<Value> {
    let start = messages.len().saturating_sub(window);
    messages[start..]
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| {
            let role = match m.sender_role {
                SenderRole::Client => "user",
                SenderRole::Operator => "assistant",
            };
            json!({ "role": role, "content": m.content })
        })
        .collect()
}

async fn chat_completion(
    state: &Arc<AppState>,
    system: &str,
    turns: Vec<Value>,
) -> Result<String, String> {
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.trim().is_empty() {
        return Err("OPENAI_API_KEY not configured".to_string());
    }
    let model =
        std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

    let mut messages = vec![json!({ "role": "system", "content": system })];
    messages.extend(turns);

    let response = state
        .http
        .post("https://api.openai.com/v1/chat/completions")
        .bearer_auth(api_key)
        .json(&json!({
            "model": model,
            "messages": messages,
            "temperature": 0.3
        }))
        .send()
        .await
        .map_err(|err| format!("generation request failed: {err}"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("generation service returned {status}: {body}"));
    }
    let payload = response
        .json::<Value>()
        .await
        .map_err(|err| format!("generation parse failed: {err}"))?;
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if text.is_empty() {
        return Err("generation response had empty content".to_string());
    }
    Ok(text)
}

/// Runs the automated first response for a conversation that just
/// received a client message. Generation failures degrade to
/// [`FALLBACK_REPLY`]; persistence failures surface to the caller.
/// Notification side effects are best-effort and never roll anything
/// back.
pub async fn respond(state: Arc<AppState>, conversation_id: &str) -> Result<(), AppError> {
    let conversation = store::get_conversation(&state.db, conversation_id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;

    let settings = store::load_assistant_settings(&state.db).await?;
    // Count taken before our own reply is appended: <= 1 means this is
    // the conversation's opening client message.
    let is_first = store::message_count(&state.db, conversation_id).await? <= 1;

    if settings.active {
        let history = store::list_messages(&state.db, conversation_id).await?;
        let turns = context_turns(&history, RESPONDER_CONTEXT_WINDOW);
        let system = render_system_prompt(&SystemPromptContext {
            persona: &settings.persona,
            knowledge_base: &settings.knowledge_base,
            max_response_chars: settings.max_response_chars,
        });

        let reply = match chat_completion(&state, &system, turns).await {
            Ok(text) => text,
            Err(err) => {
                warn!(conversation_id, "auto-reply generation failed: {err}");
                FALLBACK_REPLY.to_string()
            }
        };

        let message = store::append_message(
            &state.db,
            NewMessage {
                conversation_id: conversation_id.to_string(),
                sender_identity: ASSISTANT_IDENTITY.to_string(),
                sender_role: SenderRole::Operator,
                sender_label: ASSISTANT_LABEL.to_string(),
                content: reply,
                attachment: None,
            },
        )
        .await?;
        feed::broadcast_message(&state, &message).await;
        info!(conversation_id, message_id = %message.id, "automated reply persisted");
    } else {
        info!(conversation_id, "assistant inactive, skipping generation");
    }

    let digest = format!(
        "New chat message from {} <{}>",
        conversation.owner_display_name, conversation.owner_email
    );
    if let Some(admin) = notify::admin_email() {
        notify::send_email(&state.http, &admin, None, "New support chat message", &digest).await;
    }
    if is_first {
        notify::send_email(
            &state.http,
            &conversation.owner_email,
            Some(&conversation.owner_display_name),
            "We received your message",
            "Thanks for contacting us. Our team will reply as soon as possible.",
        )
        .await;
    }

    Ok(())
}

/// Detached variant used by the append path: the client's send must not
/// wait on (or fail because of) the automated reply.
pub fn spawn(state: Arc<AppState>, conversation_id: String) {
    tokio::spawn(async move {
        if let Err(err) = respond(state, &conversation_id).await {
            warn!(%conversation_id, "auto-responder run failed: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(role: SenderRole, content: &str) -> ChatMessage {
        ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "c1".to_string(),
            sender_identity: "u1".to_string(),
            sender_role: role,
            sender_label: String::new(),
            content: content.to_string(),
            attachment: None,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn turns_map_roles_and_keep_order() {
        let history = vec![
            message(SenderRole::Client, "hello"),
            message(SenderRole::Operator, "hi there"),
            message(SenderRole::Client, "is my order shipped?"),
        ];
        let turns = context_turns(&history, 20);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["role"], "assistant");
        assert_eq!(turns[2]["role"], "user");
        assert_eq!(turns[2]["content"], "is my order shipped?");
    }

    #[test]
    fn window_keeps_only_the_tail() {
        let history: Vec<ChatMessage> = (0..30)
            .map(|i| message(SenderRole::Client, &format!("m{i}")))
            .collect();
        let turns = context_turns(&history, RESPONDER_CONTEXT_WINDOW);
        assert_eq!(turns.len(), RESPONDER_CONTEXT_WINDOW);
        assert_eq!(turns[0]["content"], "m10");
        assert_eq!(turns[19]["content"], "m29");
    }

    #[test]
    fn attachment_only_messages_are_skipped() {
        let history = vec![message(SenderRole::Client, "")];
        assert!(context_turns(&history, 20).is_empty());
    }
}
