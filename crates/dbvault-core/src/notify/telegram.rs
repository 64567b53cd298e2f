//! Telegram transport (Bot API)
//!
//! Text-only messages go through `sendMessage`; messages with a backup
//! attached go through `sendDocument` with the artifact streamed as
//! multipart. The bot token comes from `DBVAULT_TELEGRAM_BOT_TOKEN`.

use std::path::Path;

use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};

pub const BOT_TOKEN_ENV: &str = "DBVAULT_TELEGRAM_BOT_TOKEN";

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramTransport {
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var(BOT_TOKEN_ENV).ok().filter(|t| !t.is_empty())?;
        Some(Self::new(bot_token, DEFAULT_API_BASE.to_string()))
    }

    pub fn new(bot_token: String, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base,
            bot_token,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Send one message, with the artifact as a document when attached.
    pub async fn send(&self, chat_id: &str, text: &str, attachment: Option<&Path>) -> Result<()> {
        let response = match attachment {
            None => {
                self.client
                    .post(self.method_url("sendMessage"))
                    .json(&serde_json::json!({
                        "chat_id": chat_id,
                        "text": text,
                    }))
                    .send()
                    .await?
            }
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("backup.bin")
                    .to_string();
                let document = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(
                    ReaderStream::new(file),
                ))
                .file_name(file_name);

                let form = reqwest::multipart::Form::new()
                    .text("chat_id", chat_id.to_string())
                    .text("caption", text.to_string())
                    .part("document", document);

                self.client
                    .post(self.method_url("sendDocument"))
                    .multipart(form)
                    .send()
                    .await?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let tail: String = body.chars().take(200).collect();
            return Err(Error::Permanent(format!(
                "telegram API {}: {}",
                status, tail
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};

    #[test]
    fn test_method_url_shape() {
        let transport = TelegramTransport::new("123:abc".into(), "https://api.telegram.org".into());
        assert_eq!(
            transport.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[derive(Default)]
    struct MockState {
        /// Bot API methods hit, in order.
        methods: Vec<String>,
        last_message: Option<serde_json::Value>,
        document_bytes: usize,
        reject: bool,
    }

    type Shared = Arc<Mutex<MockState>>;

    fn rejection() -> Response {
        (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "ok": false,
                "description": "Forbidden: bot was blocked by the user"
            })),
        )
            .into_response()
    }

    async fn send_message(State(state): State<Shared>, Json(body): Json<serde_json::Value>) -> Response {
        let mut state = state.lock().unwrap();
        if state.reject {
            return rejection();
        }
        state.methods.push("sendMessage".into());
        state.last_message = Some(body);
        Json(serde_json::json!({"ok": true})).into_response()
    }

    async fn send_document(State(state): State<Shared>, body: Bytes) -> Response {
        let mut state = state.lock().unwrap();
        if state.reject {
            return rejection();
        }
        state.methods.push("sendDocument".into());
        state.document_bytes = body.len();
        Json(serde_json::json!({"ok": true})).into_response()
    }

    /// Serve a stand-in Bot API on a loopback port; returns a transport
    /// pointed at it.
    async fn mock() -> (Shared, TelegramTransport) {
        let state: Shared = Arc::new(Mutex::new(MockState::default()));
        let app = Router::new()
            .route("/bottest-token/sendMessage", post(send_message))
            .route("/bottest-token/sendDocument", post(send_document))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (state, TelegramTransport::new("test-token".into(), base))
    }

    #[tokio::test]
    async fn test_send_message() {
        let (state, transport) = mock().await;

        transport.send("42", "backup success", None).await.unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.methods, vec!["sendMessage"]);
        let message = state.last_message.as_ref().unwrap();
        assert_eq!(message["chat_id"], "42");
        assert_eq!(message["text"], "backup success");
    }

    #[tokio::test]
    async fn test_send_with_attachment_uses_send_document() {
        let (state, transport) = mock().await;

        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("backup_app_20250301_033000.sql.gz");
        std::fs::write(&artifact, vec![7u8; 2048]).unwrap();

        transport
            .send("42", "backup success", Some(&artifact))
            .await
            .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.methods, vec!["sendDocument"]);
        // Multipart framing makes the body strictly larger than the file
        assert!(state.document_bytes > 2048);
    }

    #[tokio::test]
    async fn test_api_rejection_is_permanent() {
        let (state, transport) = mock().await;
        state.lock().unwrap().reject = true;

        let err = transport.send("42", "backup failed", None).await.unwrap_err();
        assert_eq!(err.kind().code(), "PERMANENT");
        assert!(err.to_string().contains("403"));
    }
}
