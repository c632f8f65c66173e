use std::{
    env,
    path::PathBuf,
    sync::{atomic::AtomicUsize, Arc},
};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::AppError;
use crate::feed;
use crate::media;
use crate::responder;
use crate::store::{self, NewMessage};
use crate::types::{
    AppState, AppendMessageBody, AssistantReplyBody, AuthedIdentity, ConversationStatus,
    PatchAssistantSettingsBody, RealtimeState, SenderRole, SignUrlBody, MAX_ATTACHMENT_BYTES,
};

async fn auth_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AuthedIdentity, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    if token.is_empty() {
        return Err(AppError::Unauthorized);
    }
    store::identity_for_token(&state.db, token).await
}

async fn auth_operator(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AuthedIdentity, AppError> {
    let authed = auth_from_headers(state, headers).await?;
    if authed.role != SenderRole::Operator {
        return Err(AppError::Forbidden("operator credential required".to_string()));
    }
    Ok(authed)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": chrono::Utc::now() }))
}

/// One-shot client bootstrap: the conversation (created lazily on first
/// access), full history, and the derived unread count, so a fresh tab
/// renders before its feed subscription settles.
async fn chat_bootstrap(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth_from_headers(&state, &headers).await?;
    if authed.role != SenderRole::Client {
        return Err(AppError::Forbidden("client credential required".to_string()));
    }

    let (conversation, created) = store::get_or_create_conversation(
        &state.db,
        &authed.identity,
        &authed.email,
        &authed.display_name,
    )
    .await?;
    if created {
        feed::broadcast_conversation(&state, "conversation:new", &conversation).await;
    }

    let messages = store::list_messages(&state.db, &conversation.id).await?;
    let unread = store::unread_count(&state.db, &conversation.id, SenderRole::Client).await?;

    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
        "unreadCount": unread,
    })))
}

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    auth_operator(&state, &headers).await?;
    let overview = store::operator_overview(&state.db).await?;
    Ok(Json(json!({ "conversations": overview })))
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth_from_headers(&state, &headers).await?;
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;
    if authed.role == SenderRole::Client && conversation.owner_identity != authed.identity {
        return Err(AppError::Forbidden("not your conversation".to_string()));
    }
    let messages = store::list_messages(&state.db, &conversation_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AppendMessageBody>,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth_from_headers(&state, &headers).await?;
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;
    if authed.role == SenderRole::Client && conversation.owner_identity != authed.identity {
        return Err(AppError::Forbidden("not your conversation".to_string()));
    }
    if let Some(attachment) = body.attachment.as_ref() {
        if !media::is_safe_storage_path(&attachment.storage_path) {
            return Err(AppError::BadRequest("invalid storage path".to_string()));
        }
    }

    let message = store::append_message(
        &state.db,
        NewMessage {
            conversation_id: conversation_id.clone(),
            sender_identity: authed.identity.clone(),
            sender_role: authed.role,
            sender_label: authed.display_name.clone(),
            content: body.content.unwrap_or_default(),
            attachment: body.attachment,
        },
    )
    .await?;

    feed::broadcast_message(&state, &message).await;
    if authed.role == SenderRole::Client {
        responder::spawn(state.clone(), conversation_id);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": message.id, "createdAt": message.created_at })),
    ))
}

async fn post_mark_read(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth_from_headers(&state, &headers).await?;
    let conversation = store::get_conversation(&state.db, &conversation_id)
        .await?
        .ok_or(AppError::ConversationNotFound)?;
    if authed.role == SenderRole::Client && conversation.owner_identity != authed.identity {
        return Err(AppError::Forbidden("not your conversation".to_string()));
    }
    let updated = store::mark_read(&state.db, &conversation_id, authed.role).await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn set_conversation_status(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    conversation_id: &str,
    status: ConversationStatus,
) -> Result<impl IntoResponse, AppError> {
    auth_operator(state, headers).await?;
    let conversation = store::set_status(&state.db, conversation_id, status).await?;
    feed::broadcast_conversation(state, "conversation:updated", &conversation).await;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn close_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    set_conversation_status(&state, &headers, &conversation_id, ConversationStatus::Closed).await
}

async fn reopen_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    set_conversation_status(&state, &headers, &conversation_id, ConversationStatus::Open).await
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let authed = auth_from_headers(&state, &headers).await?;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name().unwrap_or("") != "file" {
            continue;
        }
        let file_name = field.file_name().unwrap_or("").to_string();
        let mime_type = field
            .content_type()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("upload read failed: {e}")))?;
        if bytes.is_empty() {
            return Err(AppError::BadRequest("uploaded file is empty".to_string()));
        }
        if bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(AppError::AttachmentTooLarge {
                size: bytes.len(),
                max: MAX_ATTACHMENT_BYTES,
            });
        }

        let storage_path = media::new_storage_path(&authed.identity, &file_name, &mime_type);
        media::store_bytes(&state.media_storage_dir, &storage_path, &bytes).await?;

        return Ok((
            StatusCode::CREATED,
            Json(json!({
                "storagePath": storage_path,
                "fileName": if file_name.is_empty() { storage_path.clone() } else { file_name },
                "mimeType": mime_type,
                "sizeBytes": bytes.len(),
                "attachmentType": media::attachment_kind_from_mime(&mime_type),
            })),
        ));
    }

    Err(AppError::BadRequest(
        "missing file field in multipart form".to_string(),
    ))
}

/// Mints a short-lived signed URL for a persisted storage path. Called
/// at render time; nothing durable ever holds a fetchable URL.
async fn sign_attachment_url(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SignUrlBody>,
) -> Result<impl IntoResponse, AppError> {
    auth_from_headers(&state, &headers).await?;
    let signed = media::signed_media_url(
        &state.media_signing_secret,
        &state.public_base_url,
        &body.storage_path,
        body.ttl_seconds,
    )?;
    Ok(Json(json!({ "url": signed.url, "expiresAt": signed.expires_at })))
}

#[derive(Debug, Deserialize)]
struct SignedMediaQuery {
    #[serde(default)]
    exp: i64,
    #[serde(default)]
    sig: String,
}

async fn serve_media(
    Path((owner, file_name)): Path<(String, String)>,
    Query(query): Query<SignedMediaQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let storage_path = format!("{owner}/{file_name}");
    media::check_signed_request(&state.media_signing_secret, &storage_path, query.exp, &query.sig)?;
    let bytes = media::read_bytes(&state.media_storage_dir, &storage_path).await?;

    let ext = file_name
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let content_type = media::content_type_from_extension(&ext);

    let mut response = axum::response::Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=300"),
    );
    if let Ok(v) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, v);
    }
    Ok(response)
}

/// Direct orchestrator trigger. 401 without a credential, 400 on
/// missing fields, 404 on an unknown conversation; generation-service
/// failures never surface here.
async fn trigger_assistant_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssistantReplyBody>,
) -> Result<impl IntoResponse, AppError> {
    auth_from_headers(&state, &headers).await?;
    let conversation_id = body
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("conversationId is required".to_string()))?;
    if body
        .message_content
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .is_none()
    {
        return Err(AppError::BadRequest("messageContent is required".to_string()));
    }

    responder::respond(state.clone(), conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_assistant_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    auth_operator(&state, &headers).await?;
    let settings = store::load_assistant_settings(&state.db).await?;
    Ok(Json(json!({ "settings": settings })))
}

async fn patch_assistant_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchAssistantSettingsBody>,
) -> Result<impl IntoResponse, AppError> {
    auth_operator(&state, &headers).await?;
    let settings = store::update_assistant_settings(
        &state.db,
        body.active,
        body.persona,
        body.knowledge_base,
        body.max_response_chars,
    )
    .await?;
    Ok(Json(json!({ "settings": settings })))
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        return url;
    }
    let host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT").unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD").unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB").unwrap_or_else(|_| "support_chat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/bootstrap", get(chat_bootstrap))
        .route("/api/conversations", get(get_conversations))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/read",
            post(post_mark_read),
        )
        .route(
            "/api/conversations/{conversation_id}/close",
            post(close_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/reopen",
            post(reopen_conversation),
        )
        .route("/api/attachments", post(upload_attachment))
        .route("/api/attachments/sign", post(sign_attachment_url))
        .route("/api/media/{owner}/{file_name}", get(serve_media))
        .route("/api/assistant/reply", post(trigger_assistant_reply))
        .route(
            "/api/assistant/settings",
            get(get_assistant_settings).patch(patch_assistant_settings),
        )
        .route("/ws", get(feed::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_ATTACHMENT_BYTES + 1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "support_chat_server=info,warn".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let media_storage_dir = env::var("MEDIA_STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./media_uploads"));
    let media_signing_secret =
        env::var("MEDIA_SIGNING_SECRET").unwrap_or_else(|_| "dev-signing-secret".to_string());
    let public_base_url = env::var("API_PUBLIC_URL")
        .unwrap_or_else(|_| format!("http://localhost:{port}"))
        .trim_end_matches('/')
        .to_string();

    if let Err(err) = tokio::fs::create_dir_all(&media_storage_dir).await {
        panic!(
            "failed to create media storage directory {}: {}",
            media_storage_dir.display(),
            err
        );
    }

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        realtime: Mutex::new(RealtimeState::default()),
        next_client_id: AtomicUsize::new(0),
        http: reqwest::Client::new(),
        media_storage_dir,
        media_signing_secret,
        public_base_url,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("support chat server listening on http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
