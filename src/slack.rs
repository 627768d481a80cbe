/// Chat backend: the trait the reporter talks to, the Slack Web API client
/// behind it, and the single status message a session owns.
use crate::config::{Credentials, SlackConfig};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Identifier of a posted message (Slack's `ts`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from chat backend calls. All of them are treated as transient.
#[derive(Debug)]
pub enum ChatError {
    /// The request never produced a response.
    Http { source: reqwest::Error },
    /// Non-success HTTP status, e.g. 429 from rate limiting.
    Status {
        status: u16,
        retry_after: Option<u64>,
    },
    /// Slack answered with `ok: false`.
    Api { method: String, error: String },
    /// The configured channel name does not exist or is not visible.
    ChannelNotFound { name: String },
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::Http { source } => write!(f, "chat request failed: {}", source),
            ChatError::Status {
                status,
                retry_after: Some(secs),
            } => write!(f, "chat backend returned HTTP {status} (retry after {secs}s)"),
            ChatError::Status { status, .. } => {
                write!(f, "chat backend returned HTTP {status}")
            }
            ChatError::Api { method, error } => write!(f, "{method} failed: {error}"),
            ChatError::ChannelNotFound { name } => write!(f, "channel '{name}' not found"),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatError::Http { source } => Some(source),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Http { source: e }
    }
}

/// Operations the reporter needs from a chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Post a new message and return its identifier.
    async fn post_message(&self, text: &str) -> Result<MessageId, ChatError>;

    /// Replace the text of an existing message.
    async fn edit_message(&self, id: &MessageId, text: &str) -> Result<(), ChatError>;

    /// Notify the invoking user, threaded under `thread` when given.
    async fn notify_user(&self, thread: Option<&MessageId>, text: &str) -> Result<(), ChatError>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    name: String,
}

/// Slack Web API client bound to one channel.
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    user_id: String,
    channel_name: String,
    channel_id: OnceCell<String>,
}

impl SlackClient {
    pub fn new(credentials: &Credentials, config: &SlackConfig) -> Result<Self, ChatError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let channel_id = match &config.channel_id {
            Some(id) => OnceCell::new_with(Some(id.clone())),
            None => OnceCell::new(),
        };
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: credentials.bot_token.clone(),
            user_id: credentials.user_id.clone(),
            channel_name: config.channel.trim_start_matches('#').to_string(),
            channel_id,
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    /// Resolve the channel id, retrying the lookup on every call until it
    /// succeeds once.
    async fn channel(&self) -> Result<&str, ChatError> {
        self.channel_id
            .get_or_try_init(|| self.lookup_channel())
            .await
            .map(String::as_str)
    }

    async fn lookup_channel(&self) -> Result<String, ChatError> {
        let mut cursor = String::new();
        loop {
            let mut query = vec![
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
                ("limit", "200"),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }
            let response = self
                .http
                .get(self.url("conversations.list"))
                .bearer_auth(&self.token)
                .query(&query)
                .send()
                .await?;
            let body = check_response("conversations.list", response).await?;

            let channels: Vec<Channel> = body
                .get("channels")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Some(found) = channels.into_iter().find(|c| c.name == self.channel_name) {
                tracing::debug!(channel = %found.name, id = %found.id, "resolved slack channel");
                return Ok(found.id);
            }

            cursor = body
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                return Err(ChatError::ChannelNotFound {
                    name: self.channel_name.clone(),
                });
            }
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, ChatError> {
        let response = self
            .http
            .post(self.url(method))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;
        check_response(method, response).await
    }
}

/// Turn an HTTP response into the Slack payload, or an error.
async fn check_response(method: &str, response: reqwest::Response) -> Result<Value, ChatError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        return Err(ChatError::Status {
            status: status.as_u16(),
            retry_after,
        });
    }
    let body: ApiResponse = response.json().await?;
    interpret(method, body)
}

fn interpret(method: &str, body: ApiResponse) -> Result<Value, ChatError> {
    if body.ok {
        Ok(Value::Object(body.rest))
    } else {
        Err(ChatError::Api {
            method: method.to_string(),
            error: body.error.unwrap_or_else(|| "unknown_error".to_string()),
        })
    }
}

#[async_trait]
impl ChatBackend for SlackClient {
    async fn post_message(&self, text: &str) -> Result<MessageId, ChatError> {
        let channel = self.channel().await?;
        let body = self
            .call("chat.postMessage", json!({ "channel": channel, "text": text }))
            .await?;
        body.get("ts")
            .and_then(Value::as_str)
            .map(|ts| MessageId(ts.to_string()))
            .ok_or_else(|| ChatError::Api {
                method: "chat.postMessage".to_string(),
                error: "response has no ts".to_string(),
            })
    }

    async fn edit_message(&self, id: &MessageId, text: &str) -> Result<(), ChatError> {
        let channel = self.channel().await?;
        self.call(
            "chat.update",
            json!({ "channel": channel, "ts": id.0, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn notify_user(&self, thread: Option<&MessageId>, text: &str) -> Result<(), ChatError> {
        let channel = self.channel().await?;
        let mut payload = json!({
            "channel": channel,
            "text": format!("<@{}> {}", self.user_id, text),
        });
        if let Some(thread) = thread {
            payload["thread_ts"] = Value::String(thread.0.clone());
        }
        self.call("chat.postMessage", payload).await?;
        Ok(())
    }
}

/// The one status message of a session.
///
/// The first successful publish posts the message; every later publish
/// edits that same message. A failed first post is retried by the next
/// publish, so at most one message is ever created.
pub struct StatusMessage<'a> {
    backend: &'a dyn ChatBackend,
    id: Option<MessageId>,
}

impl<'a> StatusMessage<'a> {
    pub fn new(backend: &'a dyn ChatBackend) -> Self {
        Self { backend, id: None }
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    /// Post or edit. Failures are logged and reported as `false`.
    pub async fn publish(&mut self, text: &str) -> bool {
        match &self.id {
            Some(id) => match self.backend.edit_message(id, text).await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, message = %id, "status update failed, will retry");
                    false
                }
            },
            None => match self.backend.post_message(text).await {
                Ok(id) => {
                    tracing::info!(message = %id, "posted status message");
                    self.id = Some(id);
                    true
                }
                Err(e) => {
                    tracing::warn!(error = %e, "status post failed, will retry");
                    false
                }
            },
        }
    }

    /// Ping the user, threaded under the status message if it exists.
    pub async fn notify(&self, text: &str) -> bool {
        match self.backend.notify_user(self.id.as_ref(), text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to notify user");
                false
            }
        }
    }
}
