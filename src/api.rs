//! Backend JSON-RPC client.
//!
//! Talks to the ERP backend over `POST <url>/jsonrpc` using the stateless
//! `common.authenticate` / `object.execute_kw` services. Used for order
//! submission (with or without invoicing) and for record queries such as the
//! post-submission invoice lookup and the customer load.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::BackendSettings;
use crate::order::OrderPayload;

/// Default timeout for backend requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error code used for failures below the JSON-RPC layer (connect, timeout,
/// HTTP status, undecodable body). Negative codes are transport-class.
pub const TRANSPORT_ERROR_CODE: i64 = -32098;

/// Error code the backend uses for structured server faults.
pub const SERVER_ERROR_CODE: i64 = 200;

/// Message of the local rejection for invoicing an order without customer.
pub const MISSING_CUSTOMER: &str = "Missing Customer";

// ---------------------------------------------------------------------------
// URL normalisation & connection strings
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/jsonrpc` or `/web` segment
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    for suffix in ["/jsonrpc", "/web"] {
        if url.ends_with(suffix) {
            url.truncate(url.len() - suffix.len());
        }
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Backend coordinates packed into a connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "database")]
    pub db: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// Decode a connection string: either raw JSON or (url-safe) base64 JSON of
/// the shape `{"url", "db", "login", "key"}`.
pub fn decode_connection_string(raw: &str) -> Option<ConnectionInfo> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let value = if compact.starts_with('{') {
        serde_json::from_str::<Value>(&compact).ok()?
    } else {
        if compact.len() < 20 {
            return None;
        }
        let base64 = compact.replace('-', "+").replace('_', "/");
        let padded = format!(
            "{}{}",
            base64,
            "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
        );
        let decoded = BASE64_STANDARD.decode(padded).ok()?;
        serde_json::from_slice::<Value>(&decoded).ok()?
    };

    let mut info: ConnectionInfo = serde_json::from_value(value).ok()?;
    let non_empty = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
    info.url = non_empty(info.url).map(|u| normalize_backend_url(&u));
    info.db = non_empty(info.db);
    info.login = non_empty(info.login);
    info.key = non_empty(info.key);
    Some(info)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure payload of a backend call: `{message, code, data: {message, debug}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<RpcErrorData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub debug: Option<String>,
}

impl RpcError {
    pub fn transport(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            code: TRANSPORT_ERROR_CODE,
            message: format!("XmlHttpRequestError {detail}"),
            data: Some(RpcErrorData {
                name: Some("xhr".to_string()),
                message: None,
                debug: Some(detail),
            }),
        }
    }

    pub fn missing_customer() -> Self {
        Self {
            code: 400,
            message: MISSING_CUSTOMER.to_string(),
            data: Some(RpcErrorData::default()),
        }
    }

    fn access_denied(login: &str) -> Self {
        Self {
            code: SERVER_ERROR_CODE,
            message: "Odoo Server Error".to_string(),
            data: Some(RpcErrorData {
                name: Some("odoo.exceptions.AccessDenied".to_string()),
                message: Some(format!("Access Denied for login '{login}'")),
                debug: None,
            }),
        }
    }

    pub(crate) fn unexpected(detail: impl Into<String>) -> Self {
        Self {
            code: 0,
            message: detail.into(),
            data: None,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.code < 0
    }
}

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        404 => "Backend JSON-RPC endpoint not found (HTTP 404)".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Generic record query: `{model, method, domain, fields, context}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryParams {
    pub model: String,
    pub method: String,
    pub domain: Value,
    pub fields: Vec<String>,
    pub context: Map<String, Value>,
}

impl QueryParams {
    pub fn search_read(model: &str, domain: Value, fields: &[&str]) -> Self {
        Self {
            model: model.to_string(),
            method: "search_read".to_string(),
            domain,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            context: Map::new(),
        }
    }
}

/// Order submission to the backend.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// Send a paid order. Returns the created server ids.
    async fn push_order(&self, order: &OrderPayload) -> Result<Vec<i64>, RpcError>;

    /// Send a paid order and have the backend generate its invoice.
    async fn push_and_invoice_order(&self, order: &OrderPayload) -> Result<Vec<i64>, RpcError>;
}

/// Read access to persisted backend records.
#[async_trait]
pub trait RecordQuery: Send + Sync {
    async fn query(&self, params: &QueryParams) -> Result<Vec<Value>, RpcError>;
}

// ---------------------------------------------------------------------------
// JSON-RPC client
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

pub struct OdooClient {
    base_url: String,
    database: String,
    login: String,
    api_key: String,
    http: Client,
    uid: OnceCell<i64>,
    next_id: AtomicU64,
}

impl OdooClient {
    pub fn new(settings: &BackendSettings) -> Result<Self, RpcError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RpcError::transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: normalize_backend_url(&settings.url),
            database: settings.database.clone(),
            login: settings.login.clone(),
            api_key: settings.api_key.clone(),
            http,
            uid: OnceCell::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/jsonrpc", self.base_url);
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": { "service": service, "method": method, "args": args },
            "id": id,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::transport(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::transport(status_error(status)));
        }

        let envelope: RpcResponse = resp.json().await.map_err(|e| {
            RpcError::transport(format!(
                "Invalid JSON-RPC response from {}: {e}",
                self.base_url
            ))
        })?;

        if let Some(err) = envelope.error {
            warn!(service, method, code = err.code, message = %err.message, "backend call failed");
            return Err(err);
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// Authenticated user id, resolved once per client.
    async fn uid(&self) -> Result<i64, RpcError> {
        self.uid
            .get_or_try_init(|| async {
                let result = self
                    .call(
                        "common",
                        "authenticate",
                        json!([self.database, self.login, self.api_key, {}]),
                    )
                    .await?;
                match result.as_i64() {
                    Some(uid) if uid > 0 => {
                        info!(database = %self.database, uid, "authenticated against backend");
                        Ok::<i64, RpcError>(uid)
                    }
                    _ => Err(RpcError::access_denied(&self.login)),
                }
            })
            .await
            .copied()
    }

    /// `object.execute_kw(db, uid, key, model, method, args, kwargs)`.
    pub async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, RpcError> {
        let uid = self.uid().await?;
        debug!(model, method, "execute_kw");
        self.call(
            "object",
            "execute_kw",
            json!([self.database, uid, self.api_key, model, method, args, kwargs]),
        )
        .await
    }

    async fn create_from_ui(&self, order: &OrderPayload) -> Result<Vec<i64>, RpcError> {
        let result = self
            .execute_kw("pos.order", "create_from_ui", json!([[order]]), json!({}))
            .await?;
        let ids = server_ids(&result);
        info!(order = %order.data.name, ids = ?ids, to_invoice = order.to_invoice, "order sent to backend");
        Ok(ids)
    }
}

/// `create_from_ui` returns either plain ids or `{id, pos_reference}` rows.
fn server_ids(result: &Value) -> Vec<i64> {
    result
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.as_i64().or_else(|| row.get("id").and_then(Value::as_i64)))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl OrderSubmitter for OdooClient {
    async fn push_order(&self, order: &OrderPayload) -> Result<Vec<i64>, RpcError> {
        self.create_from_ui(order).await
    }

    async fn push_and_invoice_order(&self, order: &OrderPayload) -> Result<Vec<i64>, RpcError> {
        if order.partner_id().is_none() {
            return Err(RpcError::missing_customer());
        }
        self.create_from_ui(order).await
    }
}

#[async_trait]
impl RecordQuery for OdooClient {
    async fn query(&self, params: &QueryParams) -> Result<Vec<Value>, RpcError> {
        let result = self
            .execute_kw(
                &params.model,
                &params.method,
                json!([params.domain]),
                json!({ "fields": params.fields, "context": params.context }),
            )
            .await?;
        match result {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(RpcError::unexpected(format!(
                "Unexpected {} result shape: {other}",
                params.method
            ))),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Order;
    use crate::partner::Partner;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(url: &str) -> BackendSettings {
        BackendSettings {
            url: url.to_string(),
            database: "erp".to_string(),
            login: "pos@example.cr".to_string(),
            api_key: "secret".to_string(),
        }
    }

    async fn mount_auth(server: &MockServer, uid: Value) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_partial_json(json!({ "params": { "service": "common" } })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": uid })),
            )
            .mount(server)
            .await;
    }

    async fn mount_object(server: &MockServer, response: Value) {
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_partial_json(json!({ "params": { "service": "object" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .mount(server)
            .await;
    }

    fn sample_order() -> Order {
        Order::new(12, 3, 4)
    }

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(normalize_backend_url("erp.example.cr/"), "https://erp.example.cr");
        assert_eq!(
            normalize_backend_url("localhost:8069/jsonrpc"),
            "http://localhost:8069"
        );
        assert_eq!(
            normalize_backend_url("https://erp.example.cr/web/"),
            "https://erp.example.cr"
        );
        assert_eq!(normalize_backend_url("   "), "");
    }

    #[test]
    fn test_decode_connection_string_json_and_base64() {
        let raw = r#"{"url":"erp.example.cr","db":"erp","login":"pos","key":"k-123"}"#;
        let info = decode_connection_string(raw).unwrap();
        assert_eq!(info.url.as_deref(), Some("https://erp.example.cr"));
        assert_eq!(info.db.as_deref(), Some("erp"));

        let encoded = BASE64_STANDARD.encode(raw).replace('+', "-").replace('/', "_");
        let encoded = encoded.trim_end_matches('=');
        assert_eq!(decode_connection_string(encoded), Some(info));
    }

    #[test]
    fn test_decode_connection_string_rejects_garbage() {
        assert!(decode_connection_string("short").is_none());
        assert!(decode_connection_string("not base64 at all, definitely!!").is_none());
    }

    #[test]
    fn test_rpc_error_deserializes_server_fault() {
        let err: RpcError = serde_json::from_value(json!({
            "code": 200,
            "message": "Odoo Server Error",
            "data": { "name": "odoo.exceptions.UserError", "message": "No open session", "debug": "Traceback ...", "arguments": [] }
        }))
        .unwrap();
        assert_eq!(err.code, SERVER_ERROR_CODE);
        assert_eq!(err.data.unwrap().message.as_deref(), Some("No open session"));
    }

    #[test]
    fn test_server_ids_both_shapes() {
        assert_eq!(server_ids(&json!([5, 6])), vec![5, 6]);
        assert_eq!(
            server_ids(&json!([{ "id": 9, "pos_reference": "Order 1" }])),
            vec![9]
        );
        assert!(server_ids(&json!(true)).is_empty());
    }

    #[tokio::test]
    async fn test_search_read_returns_rows() {
        let server = MockServer::start().await;
        mount_auth(&server, json!(7)).await;
        mount_object(
            &server,
            json!({ "jsonrpc": "2.0", "id": 2, "result": [
                { "id": 41, "invoice_number": "007", "invoice_cr_einvoicing_full_number": "506..." }
            ] }),
        )
        .await;

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let params = QueryParams::search_read(
            "pos.order",
            json!([["pos_reference", "=", "Order 00012-003-0004"]]),
            &["invoice_number"],
        );
        let rows = client.query(&params).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["invoice_number"], "007");

        let requests = server.received_requests().await.unwrap();
        let last: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        let args = &last["params"]["args"];
        assert_eq!(args[0], "erp");
        assert_eq!(args[1], 7);
        assert_eq!(args[3], "pos.order");
        assert_eq!(args[4], "search_read");
        assert_eq!(args[5][0][0][2], "Order 00012-003-0004");
        assert_eq!(args[6]["fields"], json!(["invoice_number"]));
    }

    #[tokio::test]
    async fn test_authenticates_once() {
        let server = MockServer::start().await;
        mount_auth(&server, json!(7)).await;
        mount_object(&server, json!({ "jsonrpc": "2.0", "id": 2, "result": [] })).await;

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let params = QueryParams::search_read("res.partner", json!([]), &["name"]);
        client.query(&params).await.unwrap();
        client.query(&params).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let auth_calls = requests
            .iter()
            .filter(|r| {
                serde_json::from_slice::<Value>(&r.body).unwrap()["params"]["service"] == "common"
            })
            .count();
        assert_eq!(auth_calls, 1);
    }

    #[tokio::test]
    async fn test_rejected_login_is_access_denied() {
        let server = MockServer::start().await;
        mount_auth(&server, json!(false)).await;

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let err = client
            .query(&QueryParams::search_read("res.partner", json!([]), &[]))
            .await
            .unwrap_err();
        assert_eq!(err.code, SERVER_ERROR_CODE);
        assert!(err.data.unwrap().name.unwrap().contains("AccessDenied"));
    }

    #[tokio::test]
    async fn test_server_fault_is_passed_through() {
        let server = MockServer::start().await;
        mount_auth(&server, json!(7)).await;
        mount_object(
            &server,
            json!({ "jsonrpc": "2.0", "id": 2, "error": {
                "code": 200,
                "message": "Odoo Server Error",
                "data": { "message": "Hacienda rejected the document", "debug": "Traceback (most recent call last)" }
            } }),
        )
        .await;

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let err = client
            .push_order(&sample_order().export_as_json())
            .await
            .unwrap_err();
        assert_eq!(err.code, 200);
        assert_eq!(
            err.data.unwrap().message.as_deref(),
            Some("Hacienda rejected the document")
        );
    }

    #[tokio::test]
    async fn test_http_error_is_transport_class() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let err = client
            .push_order(&sample_order().export_as_json())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.code, TRANSPORT_ERROR_CODE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport_class() {
        let client = OdooClient::new(&settings("http://127.0.0.1:1")).unwrap();
        let err = client
            .push_order(&sample_order().export_as_json())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.message.starts_with("XmlHttpRequestError"));
    }

    #[tokio::test]
    async fn test_invoice_without_customer_rejected_locally() {
        let server = MockServer::start().await;
        let client = OdooClient::new(&settings(&server.uri())).unwrap();

        let err = client
            .push_and_invoice_order(&sample_order().export_as_json())
            .await
            .unwrap_err();
        assert_eq!(err.message, MISSING_CUSTOMER);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoice_with_customer_sends_create_from_ui() {
        let server = MockServer::start().await;
        mount_auth(&server, json!(7)).await;
        mount_object(&server, json!({ "jsonrpc": "2.0", "id": 2, "result": [88] })).await;

        let mut order = sample_order();
        order.set_client(Some(Partner {
            id: 15,
            name: Some("Comercial La Sabana S.A.".to_string()),
            ..Partner::default()
        }));
        order.set_to_invoice(true);

        let client = OdooClient::new(&settings(&server.uri())).unwrap();
        let ids = client
            .push_and_invoice_order(&order.export_as_json())
            .await
            .unwrap();
        assert_eq!(ids, vec![88]);

        let requests = server.received_requests().await.unwrap();
        let last: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
        let args = &last["params"]["args"];
        assert_eq!(args[4], "create_from_ui");
        assert_eq!(args[5][0][0]["to_invoice"], true);
        assert_eq!(args[5][0][0]["data"]["partner_id"], 15);
    }
}
