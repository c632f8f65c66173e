use chrono::Utc;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppError;
use crate::types::{
    AssistantSettings, Attachment, AuthedIdentity, ChatMessage, Conversation, ConversationOverview,
    ConversationStatus, SenderRole,
};

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_identity: String,
    pub sender_role: SenderRole,
    pub sender_label: String,
    pub content: String,
    pub attachment: Option<Attachment>,
}

/// A status or role string outside the closed enum set means the row
/// was written by something other than this crate; surface it instead
/// of coercing to a default.
fn decode_status(value: &str) -> Result<ConversationStatus, AppError> {
    ConversationStatus::parse(value)
        .ok_or_else(|| AppError::Decode(format!("unknown conversation status: {value}")))
}

fn decode_role(value: &str) -> Result<SenderRole, AppError> {
    SenderRole::parse(value).ok_or_else(|| AppError::Decode(format!("unknown sender role: {value}")))
}

/// Appends are only legal while the conversation is open; a reopened
/// conversation accepts writes again.
pub fn ensure_writable(status: ConversationStatus) -> Result<(), AppError> {
    match status {
        ConversationStatus::Open => Ok(()),
        ConversationStatus::Closed => Err(AppError::ConversationClosed),
    }
}

fn conversation_from_row(row: &sqlx::postgres::PgRow) -> Result<Conversation, AppError> {
    Ok(Conversation {
        id: row.get("id"),
        owner_identity: row.get("owner_identity"),
        owner_email: row.get("owner_email"),
        owner_display_name: row.get("owner_display_name"),
        status: decode_status(&row.get::<String, _>("status"))?,
        created_at: row.get("created_at"),
        last_message_at: row.get("last_message_at"),
    })
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<ChatMessage, AppError> {
    let attachment = row
        .get::<Option<String>, _>("file_storage_path")
        .map(|storage_path| Attachment {
            storage_path,
            file_name: row.get::<Option<String>, _>("file_name").unwrap_or_default(),
            mime_type: row
                .get::<Option<String>, _>("file_mime_type")
                .unwrap_or_default(),
            size_bytes: row
                .get::<Option<i64>, _>("file_size_bytes")
                .unwrap_or_default(),
        });
    Ok(ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        sender_identity: row.get("sender_identity"),
        sender_role: decode_role(&row.get::<String, _>("sender_role"))?,
        sender_label: row.get("sender_label"),
        content: row.get("content"),
        attachment,
        is_read: row.get("is_read"),
        created_at: row.get("created_at"),
    })
}

const CONVERSATION_COLUMNS: &str =
    "id, owner_identity, owner_email, owner_display_name, status, created_at, last_message_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_identity, sender_role, sender_label, \
     content, file_storage_path, file_name, file_mime_type, file_size_bytes, is_read, created_at";

/// Returns the conversation owned by `identity`, creating it on first
/// access, plus whether this call created it. `UNIQUE(owner_identity)`
/// makes the insert race-safe: the losing side of a concurrent first
/// access falls through the conflict clause and re-reads the winning
/// row.
pub async fn get_or_create_conversation(
    pool: &PgPool,
    identity: &str,
    email: &str,
    display_name: &str,
) -> Result<(Conversation, bool), AppError> {
    let inserted: Option<String> = sqlx::query_scalar(
        "INSERT INTO conversations (id, owner_identity, owner_email, owner_display_name, status, created_at) \
         VALUES ($1, $2, $3, $4, 'open', $5) \
         ON CONFLICT (owner_identity) DO NOTHING \
         RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(identity)
    .bind(email)
    .bind(display_name)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE owner_identity = $1"
    ))
    .bind(identity)
    .fetch_one(pool)
    .await?;
    Ok((conversation_from_row(&row)?, inserted.is_some()))
}

pub async fn get_conversation(
    pool: &PgPool,
    conversation_id: &str,
) -> Result<Option<Conversation>, AppError> {
    let row = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(conversation_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(conversation_from_row).transpose()
}

pub async fn list_conversations(pool: &PgPool) -> Result<Vec<Conversation>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations \
         ORDER BY last_message_at DESC NULLS LAST, created_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(conversation_from_row).collect()
}

pub async fn set_status(
    pool: &PgPool,
    conversation_id: &str,
    status: ConversationStatus,
) -> Result<Conversation, AppError> {
    let row = sqlx::query(&format!(
        "UPDATE conversations SET status = $2 WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(conversation_id)
    .bind(status.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref()
        .map(conversation_from_row)
        .transpose()?
        .ok_or(AppError::ConversationNotFound)
}

/// Rejects a message that carries neither text nor an attachment.
pub fn validate_message_payload(
    content: &str,
    attachment: Option<&Attachment>,
) -> Result<(), AppError> {
    if content.trim().is_empty() && attachment.is_none() {
        return Err(AppError::BadRequest(
            "message needs text or an attachment".to_string(),
        ));
    }
    Ok(())
}

/// Inserts the message and bumps the parent conversation's
/// `last_message_at` in the same transaction, so no reader can observe
/// the new row alongside a stale conversation timestamp. Writes to a
/// closed conversation are rejected for both roles.
pub async fn append_message(pool: &PgPool, new: NewMessage) -> Result<ChatMessage, AppError> {
    let content = new.content.trim().to_string();
    validate_message_payload(&content, new.attachment.as_ref())?;

    let mut tx = pool.begin().await?;

    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM conversations WHERE id = $1 FOR UPDATE")
            .bind(&new.conversation_id)
            .fetch_optional(&mut *tx)
            .await?;
    let status = status.ok_or(AppError::ConversationNotFound)?;
    ensure_writable(decode_status(&status)?)?;

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: new.conversation_id.clone(),
        sender_identity: new.sender_identity,
        sender_role: new.sender_role,
        sender_label: new.sender_label,
        content,
        attachment: new.attachment,
        is_read: false,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO messages (id, conversation_id, sender_identity, sender_role, sender_label, \
                               content, file_storage_path, file_name, file_mime_type, file_size_bytes, \
                               is_read, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,FALSE,$11)",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.sender_identity)
    .bind(message.sender_role.as_str())
    .bind(&message.sender_label)
    .bind(&message.content)
    .bind(message.attachment.as_ref().map(|a| a.storage_path.clone()))
    .bind(message.attachment.as_ref().map(|a| a.file_name.clone()))
    .bind(message.attachment.as_ref().map(|a| a.mime_type.clone()))
    .bind(message.attachment.as_ref().map(|a| a.size_bytes))
    .bind(message.created_at)
    .execute(&mut *tx)
    .await?;

    // GREATEST keeps last_message_at monotonically non-decreasing even
    // if clocks skew between concurrent writers.
    sqlx::query(
        "UPDATE conversations \
         SET last_message_at = GREATEST(COALESCE(last_message_at, $2), $2) \
         WHERE id = $1",
    )
    .bind(&message.conversation_id)
    .bind(message.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(message)
}

/// Flips every unread message authored by the opposite role. A single
/// conditional UPDATE, so sends landing mid-call are neither lost nor
/// marked early.
pub async fn mark_read(
    pool: &PgPool,
    conversation_id: &str,
    reader_role: SenderRole,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        "UPDATE messages SET is_read = TRUE \
         WHERE conversation_id = $1 AND sender_role <> $2 AND is_read = FALSE",
    )
    .bind(conversation_id)
    .bind(reader_role.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn list_messages(
    pool: &PgPool,
    conversation_id: &str,
) -> Result<Vec<ChatMessage>, AppError> {
    let rows = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE conversation_id = $1 ORDER BY created_at ASC, seq ASC"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(message_from_row).collect()
}

/// Unread count is always derived from the message rows, never cached.
pub async fn unread_count(
    pool: &PgPool,
    conversation_id: &str,
    viewer_role: SenderRole,
) -> Result<i64, AppError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM messages \
         WHERE conversation_id = $1 AND sender_role = $2 AND is_read = FALSE",
    )
    .bind(conversation_id)
    .bind(viewer_role.opposite().as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn message_count(pool: &PgPool, conversation_id: &str) -> Result<i64, AppError> {
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// The whole operator console list in one round trip: unread counts
/// grouped per conversation plus a lateral last-message preview,
/// instead of a query pair per conversation.
pub async fn operator_overview(pool: &PgPool) -> Result<Vec<ConversationOverview>, AppError> {
    let rows = sqlx::query(
        "SELECT c.id, c.owner_identity, c.owner_email, c.owner_display_name, c.status, \
                c.created_at, c.last_message_at, \
                COALESCE(u.unread, 0) AS unread_count, \
                COALESCE(NULLIF(lm.content, ''), lm.file_name, '') AS last_message_preview \
         FROM conversations c \
         LEFT JOIN ( \
             SELECT conversation_id, COUNT(*) AS unread \
             FROM messages \
             WHERE sender_role = 'client' AND is_read = FALSE \
             GROUP BY conversation_id \
         ) u ON u.conversation_id = c.id \
         LEFT JOIN LATERAL ( \
             SELECT content, file_name FROM messages m \
             WHERE m.conversation_id = c.id \
             ORDER BY m.created_at DESC, m.seq DESC \
             LIMIT 1 \
         ) lm ON TRUE \
         ORDER BY c.last_message_at DESC NULLS LAST, c.created_at DESC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ConversationOverview {
                conversation: conversation_from_row(row)?,
                unread_count: row.get("unread_count"),
                last_message_preview: row
                    .get::<Option<String>, _>("last_message_preview")
                    .unwrap_or_default(),
            })
        })
        .collect()
}

pub async fn load_assistant_settings(pool: &PgPool) -> Result<AssistantSettings, AppError> {
    let row = sqlx::query(
        "SELECT active, persona, knowledge_base, max_response_chars FROM assistant_settings",
    )
    .fetch_one(pool)
    .await?;
    Ok(AssistantSettings {
        active: row.get("active"),
        persona: row.get("persona"),
        knowledge_base: row.get("knowledge_base"),
        max_response_chars: row.get("max_response_chars"),
    })
}

pub async fn update_assistant_settings(
    pool: &PgPool,
    active: Option<bool>,
    persona: Option<String>,
    knowledge_base: Option<String>,
    max_response_chars: Option<i32>,
) -> Result<AssistantSettings, AppError> {
    let row = sqlx::query(
        "UPDATE assistant_settings SET \
             active = COALESCE($1, active), \
             persona = COALESCE($2, persona), \
             knowledge_base = COALESCE($3, knowledge_base), \
             max_response_chars = COALESCE($4, max_response_chars) \
         RETURNING active, persona, knowledge_base, max_response_chars",
    )
    .bind(active)
    .bind(persona)
    .bind(knowledge_base)
    .bind(max_response_chars)
    .fetch_one(pool)
    .await?;
    Ok(AssistantSettings {
        active: row.get("active"),
        persona: row.get("persona"),
        knowledge_base: row.get("knowledge_base"),
        max_response_chars: row.get("max_response_chars"),
    })
}

pub async fn identity_for_token(pool: &PgPool, token: &str) -> Result<AuthedIdentity, AppError> {
    let row = sqlx::query(
        "SELECT identity, email, display_name, role FROM identity_tokens WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::Unauthorized)?;
    let role =
        SenderRole::parse(&row.get::<String, _>("role")).ok_or(AppError::Unauthorized)?;
    Ok(AuthedIdentity {
        identity: row.get("identity"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> Attachment {
        Attachment {
            storage_path: "client-1/abc.pdf".to_string(),
            file_name: "quote.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            size_bytes: 1024,
        }
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(validate_message_payload("", None).is_err());
        assert!(validate_message_payload("   \n", None).is_err());
    }

    #[test]
    fn attachment_alone_is_enough() {
        let file = attachment();
        assert!(validate_message_payload("", Some(&file)).is_ok());
    }

    #[test]
    fn text_alone_is_enough() {
        assert!(validate_message_payload("hello", None).is_ok());
    }

    #[test]
    fn closed_conversation_rejects_appends_until_reopened() {
        assert!(matches!(
            ensure_writable(ConversationStatus::Closed),
            Err(AppError::ConversationClosed)
        ));
        // After a reopen the same write goes through.
        assert!(ensure_writable(ConversationStatus::Open).is_ok());
    }

    #[test]
    fn corrupt_stored_enum_values_are_surfaced() {
        assert!(matches!(
            decode_status("archived"),
            Err(AppError::Decode(_))
        ));
        assert!(matches!(decode_role("bot"), Err(AppError::Decode(_))));
        assert_eq!(decode_status("closed").unwrap(), ConversationStatus::Closed);
        assert_eq!(decode_role("operator").unwrap(), SenderRole::Operator);
    }
}
