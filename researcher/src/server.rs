use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::assistant::configuration::Configuration;
use crate::assistant::controller::{ChatSink, ConversationController};
use crate::assistant::error::ChatError;
use crate::assistant::state::UserId;
use crate::{build_controller, SWEEP_INTERVAL};

/// How long a request waits for the pipeline before returning what it has.
pub const REPLY_WAIT: Duration = Duration::from_secs(20);

/// Collects replies per user until a request hands them back.
///
/// Two concurrent requests for the same user may receive each other's replies.
#[derive(Default)]
pub struct BufferedSink {
    outbox: DashMap<UserId, Vec<String>>,
}

impl BufferedSink {
    pub fn take(&self, user: &UserId) -> Vec<String> {
        self.outbox.remove(user).map(|(_, replies)| replies).unwrap_or_default()
    }
}

#[async_trait]
impl ChatSink for BufferedSink {
    async fn send_text(&self, user: &UserId, text: &str) -> Result<(), ChatError> {
        self.outbox.entry(user.clone()).or_default().push(text.to_string());
        Ok(())
    }

    async fn send_typing(&self, _user: &UserId) -> Result<(), ChatError> {
        Ok(())
    }
}

pub struct AppState {
    controller: Arc<ConversationController>,
    sink: Arc<BufferedSink>,
    reply_wait: Duration,
}

impl AppState {
    pub fn new(controller: Arc<ConversationController>, sink: Arc<BufferedSink>) -> Self {
        Self {
            controller,
            sink,
            reply_wait: REPLY_WAIT,
        }
    }

    pub fn with_reply_wait(mut self, reply_wait: Duration) -> Self {
        self.reply_wait = reply_wait;
        self
    }

    async fn replies_for(&self, user: &UserId) -> Result<MessageResponse, ApiError> {
        let pending = self.controller.is_busy(user).await.map_err(|e| {
            tracing::error!(%user, error = %e, "could not load session");
            ApiError::Internal
        })?;
        Ok(MessageResponse {
            replies: self.sink.take(user),
            pending,
        })
    }
}

#[derive(serde::Deserialize)]
pub struct MessageRequest {
    user_id: String,
    text: String,
}

#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub struct MessageResponse {
    pub replies: Vec<String>,
    /// More replies will follow; fetch them from `GET /messages/:user_id`.
    #[serde(default)]
    pub pending: bool,
}

enum ApiError {
    BadRequest(&'static str),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(reason) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": reason })),
            )
                .into_response(),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/health", get(|| async { "ok" }))
        .route("/messages", post(handle_message))
        .route("/messages/:user_id", get(poll_replies))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(config: Configuration) -> anyhow::Result<()> {
    let sink = Arc::new(BufferedSink::default());
    let controller = build_controller(&config, sink.clone())?;
    controller.clone().spawn_sweeper(SWEEP_INTERVAL);

    let app = router(Arc::new(AppState::new(controller, sink)));

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!("Starting server on http://{}", config.http_addr);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn handle_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = parse_user(&request.user_id)?;

    let pending = state.controller.accept(user.clone(), &request.text).await.map_err(|e| {
        tracing::error!(%user, error = %e, "could not load session");
        ApiError::Internal
    })?;

    // Spawned so the pipeline outlives a client that disconnects.
    let controller = state.controller.clone();
    let running = tokio::spawn(async move { controller.drive(pending).await });
    match tokio::time::timeout(state.reply_wait, running).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(%user, error = %e, "conversation task failed"),
        Err(_) => tracing::debug!(%user, "pipeline still running, replies will be polled"),
    }

    Ok(Json(state.replies_for(&user).await?))
}

async fn poll_replies(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = parse_user(&user_id)?;
    Ok(Json(state.replies_for(&user).await?))
}

fn parse_user(user_id: &str) -> Result<UserId, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty"));
    }
    Ok(UserId::from(user_id))
}

async fn serve_index() -> Html<&'static str> {
    Html(r#"
    <!DOCTYPE html>
    <html>
    <head>
        <title>Research Assistant</title>
        <style>
            body {
                font-family: Arial, sans-serif;
                max-width: 800px;
                margin: 0 auto;
                padding: 20px;
            }
            #log div {
                white-space: pre-wrap;
                padding: 8px;
                margin: 4px 0;
                border-radius: 4px;
            }
            .user { background-color: #cce5ff; }
            .bot { background-color: #e9ecef; }
        </style>
    </head>
    <body>
        <h1>Research Assistant</h1>
        <label>User id <input id="user" value="web-user"></label>
        <div id="log"></div>
        <form onsubmit="send(event)">
            <input id="text" style="width: 80%" placeholder="Ask a research question...">
            <button>Send</button>
        </form>

        <script>
        function append(cls, text) {
            const el = document.createElement('div');
            el.className = cls;
            el.textContent = text;
            document.getElementById('log').appendChild(el);
        }

        async function send(event) {
            event.preventDefault();
            const input = document.getElementById('text');
            const text = input.value;
            input.value = '';
            append('user', text);
            try {
                const response = await fetch('/messages', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({ user_id: document.getElementById('user').value, text }),
                });
                show(await response.json());
            } catch (error) {
                append('bot', `Error: ${error.message}`);
            }
        }

        function show(data) {
            (data.replies || [data.error]).forEach(reply => append('bot', reply));
            if (data.pending) {
                setTimeout(poll, 2000);
            }
        }

        async function poll() {
            const user = encodeURIComponent(document.getElementById('user').value);
            const response = await fetch(`/messages/${user}`);
            show(await response.json());
        }
        </script>
    </body>
    </html>
    "#)
}
