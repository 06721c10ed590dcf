//! JSON-RPC endpoint: request/response over `POST /mcp`, a duplex WebSocket
//! on `GET /mcp`, and an unauthenticated `GET /health`.

use std::sync::Arc;

use axum::{
    async_trait,
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        FromRequestParts, State, WebSocketUpgrade,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::browser::{BrowserConfig, BrowserSession};
use crate::config::BridgeConfig;
use crate::effectors::{truncate, Effectors, LocalDesktop};
use crate::remote::{RemoteClient, RemoteError, CREDENTIAL_PARAM};
use crate::rpc::{self, JsonRpcRequest, JsonRpcResponse};
use crate::tools::{catalogue, Notifier, ToolContext, Toolbox};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "glass-bridge";
pub const WS_SUBPROTOCOL: &str = "mcp";
const LOG_PARAMS_CHARS: usize = 200;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
            }
        }
    }
}

#[derive(Clone)]
pub struct BridgeService {
    auth_token: Arc<str>,
    tools: Toolbox,
}

impl BridgeService {
    pub fn new(auth_token: impl Into<String>, tools: Toolbox) -> Self {
        Self {
            auth_token: Arc::from(auth_token.into()),
            tools,
        }
    }

    /// Wire the production subsystems described by `cfg`.
    pub fn from_config(cfg: &BridgeConfig) -> Result<Self, RemoteError> {
        let remote = RemoteClient::new(cfg.remote_base_url.clone(), cfg.remote_token.clone())?;
        let browser = Arc::new(BrowserSession::new(BrowserConfig {
            headless: cfg.browser_headless,
            user_agent: None,
            ws_url: cfg.chrome_ws_url.clone(),
        }));
        let effectors = Arc::new(Effectors::new(cfg.cliclick_path.clone()));
        let desktop = Arc::new(LocalDesktop::new(effectors, Arc::clone(&browser)));
        let tools = Toolbox::new(
            remote,
            desktop,
            browser,
            Arc::new(cfg.oracle.clone()),
            cfg.agent.clone(),
            cfg.artifacts_dir.clone(),
        );
        Ok(Self::new(cfg.auth_token.clone(), tools))
    }

    pub fn tools(&self) -> &Toolbox {
        &self.tools
    }

    fn accepts(&self, presented: &str) -> bool {
        presented == self.auth_token.as_ref()
    }

    /// Answer one duplex envelope. Malformed JSON yields a parse error with a
    /// null id; `None` means the envelope was a notification.
    pub async fn handle_text(&self, text: &str, ctx: ToolContext) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                debug!(error = %err, "malformed JSON-RPC payload");
                return Some(rpc::parse_error());
            }
        };
        let notification =
            value.get("id").is_none() && value.get("method").is_some_and(Value::is_string);
        let resp = self.handle_value(value, ctx).await;
        (!notification).then_some(resp)
    }

    pub async fn handle_value(&self, value: Value, ctx: ToolContext) -> JsonRpcResponse {
        let id = value.get("id").cloned();
        let req: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(req) => req,
            Err(err) => {
                debug!(error = %err, "envelope is not a request");
                return rpc::invalid_request(id);
            }
        };
        if !req.has_valid_version() {
            return rpc::invalid_request(req.id);
        }
        self.handle(req, ctx).await
    }

    pub async fn handle(&self, req: JsonRpcRequest, ctx: ToolContext) -> JsonRpcResponse {
        let params = req.params.unwrap_or(Value::Null);
        info!(
            method = %req.method,
            params = %truncate(&params.to_string(), LOG_PARAMS_CHARS),
            "rpc request"
        );
        match req.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                req.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
                }),
            ),
            "notifications/initialized" | "ping" => JsonRpcResponse::success(req.id, json!({})),
            "tools/list" => JsonRpcResponse::success(req.id, json!({ "tools": catalogue() })),
            "tools/call" => {
                let call: CallParams = match serde_json::from_value(params) {
                    Ok(call) => call,
                    Err(err) => {
                        return rpc::invalid_params(req.id, format!("Invalid params: {err}"))
                    }
                };
                let result = self.tools.call(&call.name, call.arguments, ctx).await;
                match serde_json::to_value(result) {
                    Ok(v) => JsonRpcResponse::success(req.id, v),
                    Err(err) => rpc::internal_error(req.id, err.to_string()),
                }
            }
            other => {
                warn!(method = other, "unsupported method");
                rpc::method_not_found(req.id, other)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Request carried the bridge token as a bearer header.
#[derive(Clone, Copy, Debug)]
pub struct Authorized;

/// Upgrade request carried the bridge token, as a bearer header or as the
/// `token` query parameter for clients that cannot set upgrade headers.
#[derive(Clone, Copy, Debug)]
pub struct SocketAuthorized;

#[async_trait]
impl FromRequestParts<BridgeService> for Authorized {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &BridgeService,
    ) -> Result<Self, Self::Rejection> {
        authorize(parts, state, bearer_token(&parts.headers)).map(|_| Authorized)
    }
}

#[async_trait]
impl FromRequestParts<BridgeService> for SocketAuthorized {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &BridgeService,
    ) -> Result<Self, Self::Rejection> {
        let presented = bearer_token(&parts.headers).or_else(|| query_token(parts.uri.query()));
        authorize(parts, state, presented).map(|_| SocketAuthorized)
    }
}

fn authorize(
    parts: &Parts,
    state: &BridgeService,
    presented: Option<String>,
) -> Result<(), ApiError> {
    match presented {
        Some(token) if state.accepts(&token) => Ok(()),
        _ => {
            warn!(path = %parts.uri.path(), "rejected unauthenticated request");
            Err(ApiError::Unauthorized)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.trim().to_owned())
}

fn query_token(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == CREDENTIAL_PARAM)
        .map(|(_, v)| v.into_owned())
}

pub fn router(service: BridgeService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(mcp_http).get(mcp_socket))
        .with_state(service)
}

pub async fn serve(listener: TcpListener, service: BridgeService) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "bridge listening");
    }
    axum::serve(listener, router(service)).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": chrono::Utc::now().to_rfc3339() }))
}

async fn mcp_http(
    State(service): State<BridgeService>,
    _auth: Authorized,
    body: Bytes,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "malformed JSON-RPC body");
            return Json(rpc::parse_error()).into_response();
        }
    };
    Json(service.handle_value(value, ToolContext::default()).await).into_response()
}

async fn mcp_socket(
    State(service): State<BridgeService>,
    _auth: SocketAuthorized,
    ws: WebSocketUpgrade,
) -> Response {
    ws.protocols([WS_SUBPROTOCOL])
        .on_upgrade(move |socket| run_socket(service, socket))
}

async fn run_socket(service: BridgeService, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let ctx = ToolContext {
        notifier: Some(Notifier::new(tx.clone())),
    };
    info!("duplex session opened");

    // Requests still running when the peer leaves finish anyway; their replies are dropped.
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let service = service.clone();
                let ctx = ctx.clone();
                let tx = tx.clone();
                // Envelopes within one frame are answered in order.
                tokio::spawn(async move {
                    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                        let Some(resp) = service.handle_text(line, ctx.clone()).await else {
                            continue;
                        };
                        if let Ok(frame) = serde_json::to_string(&resp) {
                            let _ = tx.send(frame);
                        }
                    }
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "websocket receive failed");
                break;
            }
        }
    }

    writer.abort();
    info!("duplex session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::agent::{AgentError, Desktop, Screenshot};
    use crate::config::{AgentDefaults, ImageDetail, OracleConfig};
    use crate::effectors::EffectorOutput;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct IdleDesktop;

    #[async_trait]
    impl Desktop for IdleDesktop {
        async fn screenshot(&self) -> Result<Screenshot, AgentError> {
            Err(AgentError::Screenshot("no display".into()))
        }

        async fn perform(&self, _action: &Action) -> EffectorOutput {
            EffectorOutput::failed("no display")
        }
    }

    fn service() -> BridgeService {
        let tools = Toolbox::new(
            RemoteClient::new("http://127.0.0.1:9", "remote").unwrap(),
            Arc::new(IdleDesktop),
            Arc::new(BrowserSession::new(BrowserConfig::default())),
            Arc::new(OracleConfig {
                api_base: "http://127.0.0.1:9".into(),
                api_key: None,
                model: "m".into(),
                image_detail: ImageDetail::High,
            }),
            AgentDefaults {
                max_steps: 3,
                post_action_delay: Duration::ZERO,
                history_window: 8,
            },
            std::env::temp_dir().join("glass-bridge-tests"),
        );
        BridgeService::new("secret", tools)
    }

    fn rpc_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn missing_or_wrong_token_is_rejected() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let (status, payload) = call(router(service()), rpc_request(None, body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(payload, json!({"error": "unauthorized"}));

        let (status, _) = call(router(service()), rpc_request(Some("nope"), body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method("POST")
            .uri("/mcp?token=secret")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _) = call(router(service()), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let app = router(service());
        let (status, payload) = call(
            app.clone(),
            rpc_request(
                Some("secret"),
                json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(payload["result"]["serverInfo"]["name"], SERVER_NAME);

        let (_, payload) = call(
            app,
            rpc_request(
                Some("secret"),
                json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"}),
            ),
        )
        .await;
        assert_eq!(payload["id"], "a");
        let tools = payload["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "computer_use"));
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn unknown_method_and_bad_version() {
        let app = router(service());
        let (_, payload) = call(
            app.clone(),
            rpc_request(
                Some("secret"),
                json!({"jsonrpc": "2.0", "id": 7, "method": "resources/list"}),
            ),
        )
        .await;
        assert_eq!(payload["id"], 7);
        assert_eq!(payload["error"]["code"], rpc::ERROR_METHOD_NOT_FOUND);
        assert!(payload.get("result").is_none());

        let (_, payload) = call(
            app,
            rpc_request(Some("secret"), json!({"jsonrpc": "1.0", "id": 8, "method": "tools/list"})),
        )
        .await;
        assert_eq!(payload["id"], 8);
        assert_eq!(payload["error"]["code"], rpc::ERROR_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("authorization", "Bearer secret")
            .body(Body::from("{\"jsonrpc\": \"2.0\", "))
            .unwrap();
        let (status, payload) = call(router(service()), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["id"], Value::Null);
        assert_eq!(payload["error"]["code"], rpc::ERROR_PARSE);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_successful_rpc_with_error_content() {
        let (_, payload) = call(
            router(service()),
            rpc_request(
                Some("secret"),
                json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "tools/call",
                    "params": {"name": "fly", "arguments": {}}
                }),
            ),
        )
        .await;
        assert!(payload.get("error").is_none());
        assert_eq!(payload["result"]["isError"], true);
        let text = payload["result"]["content"][0]["text"].as_str().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!({"error": "Unknown tool: fly"})
        );
    }

    #[tokio::test]
    async fn tools_call_without_name_is_invalid_params() {
        let (_, payload) = call(
            router(service()),
            rpc_request(
                Some("secret"),
                json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {}}),
            ),
        )
        .await;
        assert_eq!(payload["error"]["code"], rpc::ERROR_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn busy_guard_is_reported_to_the_caller() {
        let svc = service();
        let _held = svc.tools().guard().try_acquire().unwrap();
        let (_, payload) = call(
            router(svc.clone()),
            rpc_request(
                Some("secret"),
                json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call",
                       "params": {"name": "computer_use", "arguments": {"task": "open mail"}}}),
            ),
        )
        .await;
        assert_eq!(payload["result"]["isError"], true);
        assert!(payload["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("already running"));
        assert!(svc.tools().guard().is_busy());
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, payload) = call(router(service()), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "ok");
        assert!(payload["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let resp = service()
            .handle_text(
                r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#,
                ToolContext::default(),
            )
            .await;
        assert!(resp.is_none());
    }

    #[test]
    fn token_can_come_from_the_query_string() {
        assert_eq!(query_token(Some("a=1&token=s%20x")), Some("s x".to_string()));
        assert_eq!(query_token(Some("a=1")), None);
        assert_eq!(query_token(None), None);
    }
}
