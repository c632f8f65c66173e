use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::Ordering, Arc},
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::responder;
use crate::store::{self, NewMessage};
use crate::types::{
    AppState, Attachment, AuthedIdentity, ChatMessage, Conversation, EventEnvelopeIn,
    RealtimeState, SenderRole,
};

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };

    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

pub async fn emit_to_clients<T: Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };

    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };

    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

/// Fans a freshly persisted message out to the scoped watchers of its
/// conversation and to every operator console (unscoped subscription).
pub async fn broadcast_message(state: &Arc<AppState>, message: &ChatMessage) {
    let recipients = {
        let rt = state.realtime.lock().await;
        let mut ids = HashSet::new();
        if let Some(watchers) = rt.conversation_watchers.get(&message.conversation_id) {
            ids.extend(watchers.iter().copied());
        }
        ids.extend(rt.operators.iter().copied());
        ids.into_iter().collect::<Vec<_>>()
    };

    emit_to_clients(state, &recipients, "message:new", message).await;
}

/// Pushes a conversation row change (creation, close, reopen) to every
/// operator console and to the conversation's own watchers.
pub async fn broadcast_conversation(
    state: &Arc<AppState>,
    event: &str,
    conversation: &Conversation,
) {
    let recipients = {
        let rt = state.realtime.lock().await;
        let mut ids = HashSet::new();
        if let Some(watchers) = rt.conversation_watchers.get(&conversation.id) {
            ids.extend(watchers.iter().copied());
        }
        ids.extend(rt.operators.iter().copied());
        ids.into_iter().collect::<Vec<_>>()
    };

    emit_to_clients(state, &recipients, event, conversation).await;
}

/// Points `client_id` at `conversation_id`, detaching it from whatever
/// it watched before.
fn register_watcher(rt: &mut RealtimeState, client_id: usize, conversation_id: &str) {
    if let Some(previous) = rt
        .watched_conversation
        .insert(client_id, conversation_id.to_string())
    {
        remove_watcher(rt, client_id, &previous);
    }
    rt.conversation_watchers
        .entry(conversation_id.to_string())
        .or_default()
        .insert(client_id);
}

/// Drops `client_id` from a conversation's watcher set, pruning the
/// entry once the set is empty so the map cannot grow with dead keys.
fn remove_watcher(rt: &mut RealtimeState, client_id: usize, conversation_id: &str) {
    let emptied = rt
        .conversation_watchers
        .get_mut(conversation_id)
        .map(|watchers| {
            watchers.remove(&client_id);
            watchers.is_empty()
        })
        .unwrap_or(false);
    if emptied {
        rt.conversation_watchers.remove(conversation_id);
    }
}

/// Full teardown for one socket: sender, operator membership, and any
/// watcher registration.
fn disconnect_client(rt: &mut RealtimeState, client_id: usize) {
    rt.clients.remove(&client_id);
    rt.operators.remove(&client_id);
    if let Some(previous) = rt.watched_conversation.remove(&client_id) {
        remove_watcher(rt, client_id, &previous);
    }
}

async fn watch_conversation(state: &Arc<AppState>, client_id: usize, conversation_id: &str) {
    let mut rt = state.realtime.lock().await;
    register_watcher(&mut rt, client_id, conversation_id);
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn emit_error(state: &Arc<AppState>, client_id: usize, reason: &str) {
    emit_to_client(state, client_id, "error", json!({ "reason": reason })).await;
}

async fn authenticate(
    state: &Arc<AppState>,
    data: &Value,
    expected_role: SenderRole,
) -> Result<AuthedIdentity, String> {
    let token = data.get("token").and_then(Value::as_str).unwrap_or("");
    if token.is_empty() {
        return Err("token is required".to_string());
    }
    let authed = store::identity_for_token(&state.db, token)
        .await
        .map_err(|_| "invalid token".to_string())?;
    if authed.role != expected_role {
        return Err("wrong role for this subscription".to_string());
    }
    Ok(authed)
}

fn attachment_from_value(data: &Value) -> Option<Attachment> {
    serde_json::from_value(data.get("attachment")?.clone()).ok()
}

async fn send_history(state: &Arc<AppState>, client_id: usize, conversation: &Conversation) {
    match store::list_messages(&state.db, &conversation.id).await {
        Ok(messages) => {
            emit_to_client(
                state,
                client_id,
                "history",
                json!({ "conversation": conversation, "messages": messages }),
            )
            .await;
        }
        Err(err) => {
            warn!(conversation_id = %conversation.id, "history load failed: {err}");
            emit_error(state, client_id, "failed to load history").await;
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Per-socket session context; lives only as long as the connection.
    let mut authed: Option<AuthedIdentity> = None;
    let mut own_conversation: Option<String> = None;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "client:join" => {
                let identity = match authenticate(&state, &envelope.data, SenderRole::Client).await
                {
                    Ok(identity) => identity,
                    Err(reason) => {
                        emit_error(&state, client_id, &reason).await;
                        continue;
                    }
                };

                let (conversation, created) = match store::get_or_create_conversation(
                    &state.db,
                    &identity.identity,
                    &identity.email,
                    &identity.display_name,
                )
                .await
                {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("conversation bootstrap failed: {err}");
                        emit_error(&state, client_id, "failed to open conversation").await;
                        continue;
                    }
                };

                watch_conversation(&state, client_id, &conversation.id).await;
                own_conversation = Some(conversation.id.clone());
                authed = Some(identity);

                // The client is looking at the thread now, so operator
                // messages count as viewed.
                if let Err(err) =
                    store::mark_read(&state.db, &conversation.id, SenderRole::Client).await
                {
                    warn!("mark-read on join failed: {err}");
                }
                send_history(&state, client_id, &conversation).await;

                if created {
                    broadcast_conversation(&state, "conversation:new", &conversation).await;
                }
            }
            "client:message" => {
                let (Some(identity), Some(conversation_id)) =
                    (authed.as_ref(), own_conversation.as_ref())
                else {
                    emit_error(&state, client_id, "join before sending").await;
                    continue;
                };
                let content = envelope
                    .data
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let attachment = attachment_from_value(&envelope.data);

                match store::append_message(
                    &state.db,
                    NewMessage {
                        conversation_id: conversation_id.clone(),
                        sender_identity: identity.identity.clone(),
                        sender_role: SenderRole::Client,
                        sender_label: identity.display_name.clone(),
                        content,
                        attachment,
                    },
                )
                .await
                {
                    Ok(message) => {
                        broadcast_message(&state, &message).await;
                        responder::spawn(state.clone(), conversation_id.clone());
                    }
                    Err(err) => {
                        emit_error(&state, client_id, &err.to_string()).await;
                    }
                }
            }
            "client:mark-read" => {
                let Some(conversation_id) = own_conversation.as_ref() else {
                    continue;
                };
                if let Err(err) =
                    store::mark_read(&state.db, conversation_id, SenderRole::Client).await
                {
                    warn!("client mark-read failed: {err}");
                }
            }
            "operator:join" => {
                let identity =
                    match authenticate(&state, &envelope.data, SenderRole::Operator).await {
                        Ok(identity) => identity,
                        Err(reason) => {
                            emit_error(&state, client_id, &reason).await;
                            continue;
                        }
                    };

                {
                    let mut rt = state.realtime.lock().await;
                    rt.operators.insert(client_id);
                }
                authed = Some(identity);

                match store::operator_overview(&state.db).await {
                    Ok(overview) => {
                        emit_to_client(&state, client_id, "overview", overview).await;
                    }
                    Err(err) => {
                        warn!("overview load failed: {err}");
                        emit_error(&state, client_id, "failed to load overview").await;
                    }
                }
            }
            "operator:watch" => {
                if authed.as_ref().map(|a| a.role) != Some(SenderRole::Operator) {
                    emit_error(&state, client_id, "join before watching").await;
                    continue;
                }
                let Some(conversation_id) =
                    envelope.data.get("conversationId").and_then(Value::as_str)
                else {
                    emit_error(&state, client_id, "conversationId is required").await;
                    continue;
                };
                let conversation = match store::get_conversation(&state.db, conversation_id).await
                {
                    Ok(Some(conversation)) => conversation,
                    Ok(None) => {
                        emit_error(&state, client_id, "conversation not found").await;
                        continue;
                    }
                    Err(err) => {
                        warn!("conversation load failed: {err}");
                        emit_error(&state, client_id, "failed to load conversation").await;
                        continue;
                    }
                };

                watch_conversation(&state, client_id, conversation_id).await;

                // Actively viewing, so client-authored backlog flips to
                // read straight away.
                if let Err(err) =
                    store::mark_read(&state.db, conversation_id, SenderRole::Operator).await
                {
                    warn!("operator mark-read failed: {err}");
                }
                send_history(&state, client_id, &conversation).await;
            }
            "operator:message" => {
                let Some(identity) = authed
                    .as_ref()
                    .filter(|a| a.role == SenderRole::Operator)
                    .cloned()
                else {
                    emit_error(&state, client_id, "join before sending").await;
                    continue;
                };
                let Some(conversation_id) = envelope
                    .data
                    .get("conversationId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    emit_error(&state, client_id, "conversationId is required").await;
                    continue;
                };
                let content = envelope
                    .data
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let attachment = attachment_from_value(&envelope.data);

                match store::append_message(
                    &state.db,
                    NewMessage {
                        conversation_id,
                        sender_identity: identity.identity.clone(),
                        sender_role: SenderRole::Operator,
                        sender_label: identity.display_name.clone(),
                        content,
                        attachment,
                    },
                )
                .await
                {
                    Ok(message) => broadcast_message(&state, &message).await,
                    Err(err) => emit_error(&state, client_id, &err.to_string()).await,
                }
            }
            other => {
                debug!(event = other, "ignoring unknown feed intent");
            }
        }
    }

    // Teardown contract: a closed socket must leave no listener behind.
    {
        let mut rt = state.realtime.lock().await;
        disconnect_client(&mut rt, client_id);
    }

    send_task.abort();
}

// ---------------------------------------------------------------------
// Feed consumers. The store is the source of truth; these views are
// caches that reconcile from feed events, tolerate at-least-once
// delivery by deduping on message id, and derive unread counts instead
// of storing counters.
// ---------------------------------------------------------------------

/// Single-conversation view held by a client chat session.
pub struct ConversationView {
    viewer_role: SenderRole,
    seen: HashSet<String>,
    pub messages: Vec<ChatMessage>,
}

impl ConversationView {
    pub fn new(viewer_role: SenderRole) -> Self {
        Self {
            viewer_role,
            seen: HashSet::new(),
            messages: Vec::new(),
        }
    }

    /// Applies a `message:new` event. Duplicate deliveries of the same
    /// id are dropped. Returns true if the message was appended.
    pub fn apply_message(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Derived, never stored: unread = opposite-role messages not yet
    /// flagged read.
    pub fn unread_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_role == self.viewer_role.opposite() && !m.is_read)
            .count()
    }

    /// Local mirror of a successful `MarkRead` call.
    pub fn mark_viewed(&mut self) {
        let opposite = self.viewer_role.opposite();
        for message in &mut self.messages {
            if message.sender_role == opposite {
                message.is_read = true;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConsoleRow {
    pub unread_count: usize,
    pub last_message_preview: String,
}

/// Operator console aggregate fed by the unscoped subscription.
pub struct ConsoleView {
    pub open_conversation: Option<String>,
    pub rows: HashMap<String, ConsoleRow>,
    open_thread: ConversationView,
    seen: HashSet<String>,
}

impl ConsoleView {
    pub fn new() -> Self {
        Self {
            open_conversation: None,
            rows: HashMap::new(),
            open_thread: ConversationView::new(SenderRole::Operator),
            seen: HashSet::new(),
        }
    }

    pub fn open(&mut self, conversation_id: &str, history: Vec<ChatMessage>) {
        self.open_conversation = Some(conversation_id.to_string());
        self.open_thread = ConversationView::new(SenderRole::Operator);
        for message in history {
            self.seen.insert(message.id.clone());
            self.open_thread.apply_message(message);
        }
        // Opening the thread views it; the server-side mark-read runs
        // alongside, this mirrors it locally.
        self.open_thread.mark_viewed();
        if let Some(row) = self.rows.get_mut(conversation_id) {
            row.unread_count = 0;
        }
    }

    pub fn open_thread(&self) -> &[ChatMessage] {
        &self.open_thread.messages
    }

    /// Dispatches a `message:new` event from the unscoped feed: into
    /// the open thread (read immediately) or into that conversation's
    /// aggregate row. Redelivered ids are dropped before they can touch
    /// either, so a row's unread count never double-counts.
    pub fn apply_message(&mut self, mut message: ChatMessage) {
        if !self.seen.insert(message.id.clone()) {
            return;
        }
        let preview = if message.content.is_empty() {
            message
                .attachment
                .as_ref()
                .map(|a| a.file_name.clone())
                .unwrap_or_default()
        } else {
            message.content.clone()
        };

        if self.open_conversation.as_deref() == Some(message.conversation_id.as_str()) {
            if message.sender_role == SenderRole::Client {
                message.is_read = true;
            }
            if self.apply_to_open_thread(message) {
                if let Some(id) = self.open_conversation.clone() {
                    let row = self.rows.entry(id).or_default();
                    row.last_message_preview = preview;
                }
            }
            return;
        }

        let row = self.rows.entry(message.conversation_id.clone()).or_default();
        if message.sender_role == SenderRole::Client && !message.is_read {
            row.unread_count += 1;
        }
        row.last_message_preview = preview;
    }

    fn apply_to_open_thread(&mut self, message: ChatMessage) -> bool {
        self.open_thread.apply_message(message)
    }

    pub fn unread_for(&self, conversation_id: &str) -> usize {
        self.rows
            .get(conversation_id)
            .map(|row| row.unread_count)
            .unwrap_or(0)
    }
}

impl Default for ConsoleView {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(conversation: &str, role: SenderRole, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation.to_string(),
            sender_identity: "someone".to_string(),
            sender_role: role,
            sender_label: String::new(),
            content: content.to_string(),
            attachment: None,
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_delivery_is_deduped_by_id() {
        let mut view = ConversationView::new(SenderRole::Client);
        let msg = message("c1", SenderRole::Operator, "hello");
        assert!(view.apply_message(msg.clone()));
        assert!(!view.apply_message(msg));
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.unread_count(), 1);
    }

    #[test]
    fn unread_matches_opposite_role_unread_rows() {
        let mut view = ConversationView::new(SenderRole::Client);
        view.apply_message(message("c1", SenderRole::Operator, "hi"));
        view.apply_message(message("c1", SenderRole::Client, "hello"));
        view.apply_message(message("c1", SenderRole::Operator, "how can we help?"));
        assert_eq!(view.unread_count(), 2);

        view.mark_viewed();
        assert_eq!(view.unread_count(), 0);
        // Idempotent: viewing again with nothing new stays at zero.
        view.mark_viewed();
        assert_eq!(view.unread_count(), 0);
    }

    #[test]
    fn own_messages_never_count_as_unread() {
        let mut view = ConversationView::new(SenderRole::Operator);
        view.apply_message(message("c1", SenderRole::Operator, "checking in"));
        assert_eq!(view.unread_count(), 0);
    }

    #[test]
    fn background_rows_drop_duplicate_deliveries() {
        let mut console = ConsoleView::new();
        console.open("c1", Vec::new());

        let msg = message("c2", SenderRole::Client, "hello?");
        console.apply_message(msg.clone());
        console.apply_message(msg);

        assert_eq!(console.unread_for("c2"), 1);
    }

    #[test]
    fn watcher_registry_prunes_emptied_conversations() {
        let mut rt = RealtimeState::default();
        register_watcher(&mut rt, 1, "c1");
        register_watcher(&mut rt, 2, "c1");

        // Switching leaves the old set non-empty, so the entry stays.
        register_watcher(&mut rt, 1, "c2");
        assert!(rt.conversation_watchers.contains_key("c1"));

        disconnect_client(&mut rt, 2);
        assert!(!rt.conversation_watchers.contains_key("c1"));
        assert!(rt.conversation_watchers.contains_key("c2"));

        disconnect_client(&mut rt, 1);
        assert!(rt.conversation_watchers.is_empty());
        assert!(rt.watched_conversation.is_empty());
    }

    #[test]
    fn console_routes_open_thread_and_background_rows() {
        let mut console = ConsoleView::new();
        console.open("c1", vec![message("c1", SenderRole::Client, "first")]);

        console.apply_message(message("c1", SenderRole::Client, "still there?"));
        console.apply_message(message("c2", SenderRole::Client, "new customer"));
        console.apply_message(message("c2", SenderRole::Client, "anyone?"));

        // Open thread absorbs its messages as read.
        assert_eq!(console.open_thread().len(), 2);
        assert_eq!(console.unread_for("c1"), 0);
        // Background conversation aggregates instead.
        assert_eq!(console.unread_for("c2"), 2);
        assert_eq!(console.rows["c2"].last_message_preview, "anyone?");
    }

    #[test]
    fn operator_replies_do_not_inflate_unread() {
        let mut console = ConsoleView::new();
        console.apply_message(message("c1", SenderRole::Operator, "we are on it"));
        assert_eq!(console.unread_for("c1"), 0);
        assert_eq!(console.rows["c1"].last_message_preview, "we are on it");
    }

    #[test]
    fn opening_a_conversation_clears_only_its_count() {
        let mut console = ConsoleView::new();
        for _ in 0..3 {
            console.apply_message(message("c1", SenderRole::Client, "ping"));
        }
        console.apply_message(message("c2", SenderRole::Client, "other"));

        console.open("c1", Vec::new());
        assert_eq!(console.unread_for("c1"), 0);
        assert_eq!(console.unread_for("c2"), 1);
    }

    #[test]
    fn attachment_only_message_previews_its_file_name() {
        let mut console = ConsoleView::new();
        let mut msg = message("c1", SenderRole::Client, "");
        msg.attachment = Some(Attachment {
            storage_path: "u1/a.png".to_string(),
            file_name: "screenshot.png".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 10,
        });
        console.apply_message(msg);
        assert_eq!(console.rows["c1"].last_message_preview, "screenshot.png");
    }
}
