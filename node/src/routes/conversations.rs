use crate::messaging::DisplayMessage;
use crate::realtime::ConnectionState;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use deskchat_messaging::{
    Conversation, ConversationId, Metadata, QueuedMessage, TypingUser, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route("/conversations/:id/select", post(select_conversation))
        .route("/conversations/:id/messages", get(list_messages).post(send_message))
        .route("/conversations/:id/messages/more", post(load_more))
        .route("/conversations/:id/typing", get(typing_users).post(send_typing))
        .route("/conversations/:id/connection", post(set_connection))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversation {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Json<Vec<Conversation>> {
    Json(state.context().conversations.list())
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateConversation>,
) -> impl IntoResponse {
    let conversation = state.context().conversations.create(
        payload.title.as_deref().unwrap_or("New conversation"),
        payload.kind.as_deref().unwrap_or("chat"),
    );
    (StatusCode::CREATED, Json(conversation))
}

async fn select_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, StatusCode> {
    state
        .context()
        .conversations
        .select(&ConversationId::new(id))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesView {
    pub messages: Vec<DisplayMessage>,
    pub has_more: bool,
    pub total_messages: usize,
    pub is_loading: bool,
    pub queued: Vec<QueuedMessage>,
    pub connection: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<MessagesView> {
    let chat = state.orchestrator(&ConversationId::new(id)).await;
    Json(MessagesView {
        messages: chat.messages().await,
        has_more: chat.has_more().await,
        total_messages: chat.total_messages().await,
        is_loading: chat.is_loading().await,
        queued: chat.queued_messages().await,
        connection: chat.connection_state(),
        error: chat.error().await,
    })
}

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<SendMessage>,
) -> impl IntoResponse {
    let chat = state.orchestrator(&ConversationId::new(id)).await;
    let accepted = chat.send_message(&payload.content, payload.metadata).await;
    debug!(conversation_id = %chat.conversation_id(), accepted, "send request");

    if accepted {
        let result = SendResult {
            accepted,
            validation_errors: Vec::new(),
            error: None,
        };
        return (StatusCode::ACCEPTED, Json(result));
    }

    let result = SendResult {
        accepted,
        validation_errors: chat.validation_errors().await,
        error: chat.error().await,
    };
    (StatusCode::UNPROCESSABLE_ENTITY, Json(result))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMoreResult {
    pub loaded: bool,
    pub has_more: bool,
    pub visible: usize,
}

async fn load_more(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<LoadMoreResult> {
    let chat = state.orchestrator(&ConversationId::new(id)).await;
    let loaded = chat.load_more_messages().await;
    Json(LoadMoreResult {
        loaded,
        has_more: chat.has_more().await,
        visible: chat.messages().await.len(),
    })
}

async fn typing_users(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<Vec<TypingUser>> {
    let chat = state.orchestrator(&ConversationId::new(id)).await;
    Json(chat.typing_users())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingInput {
    /// Current composer text; drives the debounced indicator.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_typing: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct TypingResult {
    pub sent: bool,
}

async fn send_typing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<TypingInput>,
) -> Json<TypingResult> {
    let chat = state.orchestrator(&ConversationId::new(id)).await;
    let sent = match (payload.text, payload.is_typing) {
        (Some(text), _) => {
            chat.handle_input_change(&text).await;
            !text.trim().is_empty()
        }
        (None, Some(is_typing)) => chat.send_typing_indicator(is_typing).await,
        (None, None) => false,
    };
    Json(TypingResult { sent })
}

#[derive(Debug, Deserialize)]
pub struct ConnectionInput {
    pub attached: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionView {
    pub state: ConnectionState,
}

async fn set_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<ConnectionInput>,
) -> Json<ConnectionView> {
    if payload.attached {
        state.transport().attach(&id);
    } else {
        state.transport().detach(&id);
    }
    Json(ConnectionView {
        state: state.transport().connection_state(&id),
    })
}
