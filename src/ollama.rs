//! Client for the Ollama HTTP API
//!
//! Only the three endpoints the bot needs: `/api/tags`, `/api/pull` and `/api/chat`.  Nothing is
//! cached; every call goes to the server so the bot never advertises a model that was removed.

use crate::{error::ModelError, log_internal};
use reqwest::StatusCode;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: ChatMessageRole,
    pub content: String,
    /// Base64-encoded images
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[allow(non_camel_case_types)] // Serialized literally; case matters
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChatMessageRole {
    system,
    user,
    assistant,
}

impl ChatMessage {
    pub fn new(role: ChatMessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/// A model installed on the inference server
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    /// Bytes on disk
    pub size: u64,
}

/// The external inference service, as seen by the rest of the bot
#[serenity::async_trait]
pub trait ModelService: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError>;

    /// Download a model.  Returns once the server reports the pull finished.
    async fn pull_model(&self, name: &str) -> Result<(), ModelError>;

    /// Continue a conversation, returning the assistant's reply.
    async fn generate(&self, model: &str, messages: Vec<ChatMessage>)
        -> Result<String, ModelError>;
}

pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
    request_timeout: Duration,
    pull_timeout: Duration,
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    /// LLM model name
    model: &'a str,
    /// Whether to stream one token at a time, or return entire response is one go
    stream: bool,
    /// Chat conversation to continue.
    messages: Vec<ChatMessage>,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(serde::Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(serde::Deserialize)]
struct PullResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagsModel>,
}

#[derive(serde::Deserialize)]
struct TagsModel {
    name: String,
    #[serde(default)]
    size: u64,
}

#[derive(serde::Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone, Copy)]
enum Endpoint {
    Tags,
    Pull,
    Chat,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        pull_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
            request_timeout,
            pull_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        endpoint: Endpoint,
        model: &str,
    ) -> Result<reqwest::Response, ModelError> {
        let response = request.send().await.map_err(unavailable)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        Err(classify(endpoint, status, message, model))
    }
}

#[serenity::async_trait]
impl ModelService for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let request = self
            .http
            .get(self.url("/api/tags"))
            .timeout(self.request_timeout);
        let tags = self
            .send(request, Endpoint::Tags, "")
            .await?
            .json::<TagsResponse>()
            .await
            .map_err(|e| decode_error(Endpoint::Tags, e))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size: m.size,
            })
            .collect())
    }

    async fn pull_model(&self, name: &str) -> Result<(), ModelError> {
        log_internal!("Pulling model {}...", name);
        let request = self
            .http
            .post(self.url("/api/pull"))
            .timeout(self.pull_timeout)
            .json(&PullRequest {
                model: name,
                stream: false,
            });
        let response = self
            .send(request, Endpoint::Pull, name)
            .await?
            .json::<PullResponse>()
            .await
            .map_err(|e| decode_error(Endpoint::Pull, e))?;

        if let Some(error) = response.error {
            return Err(classify(Endpoint::Pull, StatusCode::OK, error, name));
        }
        log_internal!("Pulling model {}... {}", name, response.status);
        Ok(())
    }

    async fn generate(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<String, ModelError> {
        let url = self.url("/api/chat");
        log_internal!("Sending request to chat endpoint {}... ", url);
        let request = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&ChatRequest {
                model,
                stream: false,
                messages,
            });
        let response = self
            .send(request, Endpoint::Chat, model)
            .await?
            .json::<ChatResponse>()
            .await
            .map_err(|e| decode_error(Endpoint::Chat, e))?;
        log_internal!("Sending request to chat endpoint {}... done", url);

        Ok(response.message.content)
    }
}

fn unavailable(err: reqwest::Error) -> ModelError {
    ModelError::ServiceUnavailable(err.to_string())
}

/// A body that failed to arrive is the service being unavailable; a body that arrived but made
/// no sense is the service misbehaving.
fn decode_error(endpoint: Endpoint, err: reqwest::Error) -> ModelError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return unavailable(err);
    }
    match endpoint {
        Endpoint::Tags => ModelError::ServiceUnavailable(err.to_string()),
        Endpoint::Pull | Endpoint::Chat => ModelError::InferenceError(err.to_string()),
    }
}

fn classify(endpoint: Endpoint, status: StatusCode, message: String, model: &str) -> ModelError {
    match endpoint {
        Endpoint::Tags => ModelError::ServiceUnavailable(format!("{}: {}", status, message)),
        Endpoint::Pull => {
            let lower = message.to_lowercase();
            if status == StatusCode::NOT_FOUND
                || lower.contains("file does not exist")
                || lower.contains("not found")
            {
                ModelError::ModelNotFound(model.to_owned())
            } else if status.is_server_error() && lower.is_empty() {
                ModelError::ServiceUnavailable(status.to_string())
            } else {
                ModelError::InferenceError(message)
            }
        }
        Endpoint::Chat => {
            if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT
            {
                ModelError::ServiceUnavailable(format!("{}: {}", status, message))
            } else {
                ModelError::InferenceError(format!("{}: {}", status, message))
            }
        }
    }
}

/// Ollama treats an untagged name as `:latest`.  Normalise so both spellings name one model.
pub fn canonical_model_name(name: &str) -> String {
    let name = name.trim();
    // The tag follows the last path segment, e.g. `registry:5000/library/llama3:8b`
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    if last_segment.contains(':') {
        name.to_owned()
    } else {
        format!("{}:latest", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };

    /// Serve one canned HTTP response to every connection, forwarding each raw request.
    async fn serve(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut socket).await;
                    let _ = tx.send(request);
                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{}", addr), rx)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let len = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                break;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn client(url: &str) -> OllamaClient {
        OllamaClient::new(url, Duration::from_secs(5), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_installed_models() {
        let (url, _rx) = serve(
            "200 OK",
            r#"{"models":[{"name":"llama3:latest","model":"llama3:latest","size":4661224676},{"name":"qwen2:1.5b","size":934964902}]}"#,
        )
        .await;

        let models = client(&url).list_models().await.unwrap();
        assert_eq!(
            models,
            vec![
                ModelInfo {
                    name: "llama3:latest".into(),
                    size: 4661224676
                },
                ModelInfo {
                    name: "qwen2:1.5b".into(),
                    size: 934964902
                },
            ]
        );
    }

    #[tokio::test]
    async fn chat_sends_whole_conversation_without_streaming() {
        let (url, mut rx) = serve(
            "200 OK",
            r#"{"model":"llama3","message":{"role":"assistant","content":"Hi there!"},"done":true}"#,
        )
        .await;

        let reply = client(&format!("{}/", url))
            .generate(
                "llama3",
                vec![
                    ChatMessage::new(ChatMessageRole::system, "Be brief."),
                    ChatMessage::new(ChatMessageRole::user, "<@1>: hello"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(reply, "Hi there!");

        let request = rx.recv().await.unwrap();
        assert!(request.starts_with("POST /api/chat "));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let body: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "<@1>: hello");
        assert!(body["messages"][1].get("images").is_none());
    }

    #[tokio::test]
    async fn chat_with_unknown_model_is_an_inference_error() {
        let (url, _rx) = serve(
            "404 Not Found",
            r#"{"error":"model \"nope\" not found, try pulling it first"}"#,
        )
        .await;

        let err = client(&url)
            .generate("nope", vec![ChatMessage::new(ChatMessageRole::user, "hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::InferenceError(msg) if msg.contains("not found")));
    }

    #[tokio::test]
    async fn pull_of_unknown_model_is_not_found() {
        let (url, _rx) = serve(
            "500 Internal Server Error",
            r#"{"error":"pull model manifest: file does not exist"}"#,
        )
        .await;

        let err = client(&url).pull_model("doesnotexist").await.unwrap_err();
        assert!(matches!(err, ModelError::ModelNotFound(name) if name == "doesnotexist"));
    }

    #[tokio::test]
    async fn pull_success() {
        let (url, mut rx) = serve("200 OK", r#"{"status":"success"}"#).await;

        client(&url).pull_model("llama3").await.unwrap();
        let request = rx.recv().await.unwrap();
        assert!(request.starts_with("POST /api/pull "));
        assert!(request.contains(r#""model":"llama3""#));
    }

    #[tokio::test]
    async fn stalled_generation_times_out_as_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                // Hold the connection open without ever answering
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                });
            }
        });

        let client = OllamaClient::new(
            &format!("http://{}", addr),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();
        let err = client
            .generate("llama3", vec![ChatMessage::new(ChatMessageRole::user, "hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{}", addr))
            .list_models()
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::ServiceUnavailable(_)));
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_model_name("llama3"), "llama3:latest");
        assert_eq!(canonical_model_name(" llama3:8b "), "llama3:8b");
        assert_eq!(
            canonical_model_name("registry:5000/library/llama3"),
            "registry:5000/library/llama3:latest"
        );
    }
}
