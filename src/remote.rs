//! Thin authenticated client for the messaging backend. Every messaging tool
//! is a parameter-shaping wrapper over [`RemoteClient::call`].

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Query parameter carrying the shared secret.
pub const CREDENTIAL_PARAM: &str = "token";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid remote path {0:?}: must start with '/'")]
    InvalidPath(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: u16,
    pub data: Value,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: String,
    token: String,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RemoteError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Issue `method path` with an optional JSON body. Non-JSON bodies come
    /// back as `{"error": <raw text>}`; only transport failures are errors.
    pub async fn call(
        &self,
        path: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<RemoteResponse, RemoteError> {
        if !path.starts_with('/') {
            return Err(RemoteError::InvalidPath(path.to_string()));
        }
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, path, "remote call");
        let mut req = self
            .http
            .request(method, url)
            .query(&[(CREDENTIAL_PARAM, self.token.as_str())]);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({ "error": text }))
        };
        Ok(RemoteResponse { status, data })
    }

    pub async fn get(&self, path: &str) -> Result<RemoteResponse, RemoteError> {
        self.call(path, Method::GET, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<RemoteResponse, RemoteError> {
        self.call(path, Method::POST, Some(body)).await
    }

    // ========================= Messaging wrappers =========================

    pub async fn list_chats(&self, limit: u32, offset: u32) -> Result<RemoteResponse, RemoteError> {
        self.get(&format!("/chats?limit={limit}&offset={offset}")).await
    }

    pub async fn search_chats(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<RemoteResponse, RemoteError> {
        self.get(&format!("/chats/search?q={}&limit={limit}", encode_query(query)))
            .await
    }

    pub async fn chat_messages(
        &self,
        chat_id: &str,
        limit: u32,
    ) -> Result<RemoteResponse, RemoteError> {
        self.get(&format!("/chats/{}/messages?limit={limit}", encode_segment(chat_id)))
            .await
    }

    /// Fuzzy lookup by phone number, email, or contact name.
    pub async fn handle_messages(
        &self,
        handle: &str,
        limit: u32,
    ) -> Result<RemoteResponse, RemoteError> {
        self.get(&format!("/messages?handle={}&limit={limit}", encode_query(handle)))
            .await
    }

    pub async fn send_message(&self, to: &str, text: &str) -> Result<RemoteResponse, RemoteError> {
        self.post("/messages", &json!({ "to": to, "text": text })).await
    }

    pub async fn create_chat(
        &self,
        participants: &[String],
        name: Option<&str>,
        message: Option<&str>,
    ) -> Result<RemoteResponse, RemoteError> {
        let mut body = json!({ "participants": participants });
        if let Some(name) = name {
            body["name"] = json!(name);
        }
        if let Some(message) = message {
            body["message"] = json!(message);
        }
        self.post("/chats", &body).await
    }

    pub async fn react(
        &self,
        chat_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> Result<RemoteResponse, RemoteError> {
        self.post(
            &format!("/messages/{}/reactions", encode_segment(message_id)),
            &json!({ "chatId": chat_id, "reaction": reaction }),
        )
        .await
    }

    pub async fn rename_chat(
        &self,
        chat_id: &str,
        name: &str,
    ) -> Result<RemoteResponse, RemoteError> {
        self.call(
            &format!("/chats/{}", encode_segment(chat_id)),
            Method::PATCH,
            Some(&json!({ "name": name })),
        )
        .await
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<RemoteResponse, RemoteError> {
        self.post(&format!("/chats/{}/read", encode_segment(chat_id)), &json!({}))
            .await
    }

    pub async fn attachment(&self, attachment_id: &str) -> Result<RemoteResponse, RemoteError> {
        self.get(&format!("/attachments/{}", encode_segment(attachment_id)))
            .await
    }
}

/// Everything outside RFC 3986 `unreserved` is escaped inside a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn encode_query(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, RawQuery};
    use axum::http::Uri;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn appends_credential_and_decodes_json() {
        let app = Router::new().route(
            "/chats",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                Json(json!({ "token": q.get("token"), "limit": q.get("limit") }))
            }),
        );
        let client = RemoteClient::new(serve(app).await, "s3cret").unwrap();

        let resp = client.list_chats(5, 0).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.data, json!({ "token": "s3cret", "limit": "5" }));
    }

    #[tokio::test]
    async fn non_json_body_becomes_error_payload() {
        let app = Router::new().route(
            "/messages",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream exploded") }),
        );
        let client = RemoteClient::new(serve(app).await, "t").unwrap();

        let resp = client.send_message("+15551234567", "hi").await.unwrap();
        assert_eq!(resp.status, 502);
        assert!(!resp.is_success());
        assert_eq!(resp.data, json!({ "error": "upstream exploded" }));
    }

    #[tokio::test]
    async fn escapes_query_values() {
        let app = Router::new().route(
            "/messages",
            get(|RawQuery(q): RawQuery| async move { Json(json!({ "query": q })) }),
        );
        let client = RemoteClient::new(serve(app).await, "t").unwrap();
        let resp = client.handle_messages("Ana María", 3).await.unwrap();
        let query = resp.data["query"].as_str().unwrap().to_string();
        assert!(query.contains("handle=Ana+Mar%C3%ADa"));
        assert!(query.contains("token=t"));
    }

    #[tokio::test]
    async fn escapes_path_segments() {
        let app = Router::new().route(
            "/chats/:id/read",
            post(|uri: Uri| async move { Json(json!({ "path": uri.path() })) }),
        );
        let client = RemoteClient::new(serve(app).await, "t").unwrap();
        let resp = client.mark_read("a b+c/d").await.unwrap();
        assert_eq!(resp.data["path"], "/chats/a%20b%2Bc%2Fd/read");
    }

    #[tokio::test]
    async fn rejects_relative_paths() {
        let client = RemoteClient::new("http://127.0.0.1:9", "t").unwrap();
        let err = client.call("chats", Method::GET, None).await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidPath(_)));
    }
}
