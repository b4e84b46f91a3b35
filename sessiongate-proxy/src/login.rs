//! Session issuance for `/login` and `/login_oauth`.
//!
//! Credential exchange happens elsewhere; by the time a request reaches these
//! handlers the caller already knows its username (and optionally the account
//! email). The handlers validate that input, remember which account the
//! client address belongs to, and set the session cookie.

use async_trait::async_trait;
use axum::extract::Query;
use bytes::Bytes;
use http::header::{ALLOW, LOCATION, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use sessiongate_core::auth::{ErrorBody, json_response};
use sessiongate_core::identity::ClientIdentity;
use sessiongate_core::storage::SessionStore;
use sessiongate_core::telemetry::GatewayMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ProxyError, ProxyResult};

/// Inbound login request with its body already collected.
#[derive(Debug)]
pub struct LoginRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub identity: Option<ClientIdentity>,
}

/// Handlers for the two login routes.
///
/// Validation failures are ordinary responses. Only infrastructure failures
/// (storage, response assembly) are returned as errors.
#[async_trait]
pub trait LoginFlow: Send + Sync {
    async fn direct_login(&self, req: LoginRequest) -> ProxyResult<Response<Bytes>>;

    async fn oauth_login(&self, req: LoginRequest) -> ProxyResult<Response<Bytes>>;
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct LoginSuccess<'a> {
    status: &'static str,
    username: &'a str,
}

/// Validated login input.
#[derive(Debug, PartialEq, Eq)]
struct Login {
    username: String,
    email: Option<String>,
}

impl LoginParams {
    fn validate(self) -> Result<Login, &'static str> {
        let username = self
            .username
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or("Missing username")?;
        if !username.bytes().all(is_cookie_octet) {
            return Err("Invalid username");
        }
        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        if let Some(email) = &email
            && !email.contains('@')
        {
            return Err("Invalid email");
        }
        Ok(Login { username, email })
    }
}

/// Bytes allowed in an unquoted cookie value.
fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2B | 0x2D..=0x3A | 0x3C..=0x5B | 0x5D..=0x7E)
}

/// Cookie-setting login backed by a [`SessionStore`].
pub struct CookieLogin {
    store: Arc<dyn SessionStore>,
    cookie_name: String,
    max_age: Duration,
    share_url: Uri,
    metrics: Arc<GatewayMetrics>,
}

impl CookieLogin {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cookie_name: impl Into<String>,
        max_age: Duration,
        share_url: Uri,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
            max_age,
            share_url,
            metrics,
        }
    }

    /// `Set-Cookie` value for a new session.
    pub fn session_cookie(&self, username: &str) -> String {
        format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
            self.cookie_name,
            username,
            self.max_age.as_secs()
        )
    }

    async fn establish(&self, login: &Login, identity: Option<&ClientIdentity>) -> ProxyResult<()> {
        match (&login.email, identity) {
            (Some(email), Some(identity)) => {
                self.store.bind_identity(identity, email).await?;
                debug!(identity = %identity, email = %email, "Client identity bound");
            }
            (Some(_), None) => debug!("Login carried an email but no client identity"),
            _ => {}
        }
        Ok(())
    }

    fn rejected(
        &self,
        flow: &str,
        status: StatusCode,
        message: &str,
    ) -> ProxyResult<Response<Bytes>> {
        self.metrics.record_login(flow, "rejected");
        debug!(flow, message, "Login rejected");
        error_response(status, message)
    }
}

#[async_trait]
impl LoginFlow for CookieLogin {
    async fn direct_login(&self, req: LoginRequest) -> ProxyResult<Response<Bytes>> {
        const FLOW: &str = "direct";

        if req.method != Method::POST {
            self.metrics.record_login(FLOW, "rejected");
            let mut response =
                error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")?;
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            return Ok(response);
        }

        let params: LoginParams = match serde_json::from_slice(&req.body) {
            Ok(params) => params,
            Err(_) => return self.rejected(FLOW, StatusCode::BAD_REQUEST, "Invalid JSON body"),
        };
        let login = match params.validate() {
            Ok(login) => login,
            Err(message) => return self.rejected(FLOW, StatusCode::BAD_REQUEST, message),
        };

        self.establish(&login, req.identity.as_ref()).await?;

        let body = serde_json::to_vec(&LoginSuccess {
            status: "success",
            username: &login.username,
        })?;
        let mut response = json_response(StatusCode::OK, Bytes::from(body));
        response
            .headers_mut()
            .insert(SET_COOKIE, cookie_header(&self.session_cookie(&login.username))?);

        self.metrics.record_login(FLOW, "success");
        info!(flow = FLOW, username = %login.username, "Session issued");
        Ok(response)
    }

    async fn oauth_login(&self, req: LoginRequest) -> ProxyResult<Response<Bytes>> {
        const FLOW: &str = "oauth";

        if req.method != Method::GET {
            self.metrics.record_login(FLOW, "rejected");
            let mut response =
                error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")?;
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET"));
            return Ok(response);
        }

        let Query(params) = match Query::<LoginParams>::try_from_uri(&req.uri) {
            Ok(query) => query,
            Err(_) => return self.rejected(FLOW, StatusCode::BAD_REQUEST, "Invalid query"),
        };
        let login = match params.validate() {
            Ok(login) => login,
            Err(message) => return self.rejected(FLOW, StatusCode::BAD_REQUEST, message),
        };

        self.establish(&login, req.identity.as_ref()).await?;

        let response = Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, self.share_url.to_string())
            .header(SET_COOKIE, cookie_header(&self.session_cookie(&login.username))?)
            .body(Bytes::new())?;

        self.metrics.record_login(FLOW, "success");
        info!(flow = FLOW, username = %login.username, "Session issued");
        Ok(response)
    }
}

fn error_response(status: StatusCode, message: &str) -> ProxyResult<Response<Bytes>> {
    let body = serde_json::to_vec(&ErrorBody {
        status: "error",
        message,
    })?;
    Ok(json_response(status, Bytes::from(body)))
}

fn cookie_header(value: &str) -> ProxyResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::Build(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::registry::Registry;
    use sessiongate_core::storage::MemoryStore;

    fn login_flow(store: Arc<MemoryStore>) -> CookieLogin {
        let metrics = Arc::new(GatewayMetrics::new(&mut Registry::default()));
        CookieLogin::new(
            store,
            "username",
            Duration::from_secs(7 * 86_400),
            "https://share.example.com/".parse().unwrap(),
            metrics,
        )
    }

    fn request(method: Method, uri: &str, body: &'static str, ip: Option<&str>) -> LoginRequest {
        LoginRequest {
            method,
            uri: uri.parse().unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
            identity: ip.map(ClientIdentity::new),
        }
    }

    fn body_json(resp: &Response<Bytes>) -> serde_json::Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn test_direct_login_sets_cookie_and_binds_identity() {
        let store = Arc::new(MemoryStore::new());
        let flow = login_flow(store.clone());

        let resp = flow
            .direct_login(request(
                Method::POST,
                "/login",
                r#"{"username":"alice","email":"alice@example.com"}"#,
                Some("203.0.113.7"),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[SET_COOKIE],
            "username=alice; Path=/; Max-Age=604800; HttpOnly; Secure; SameSite=Lax"
        );
        assert_eq!(
            body_json(&resp),
            serde_json::json!({"status": "success", "username": "alice"})
        );
        let email = store
            .lookup_email_by_identity(&ClientIdentity::new("203.0.113.7"))
            .await
            .unwrap();
        assert_eq!(email.as_deref(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_direct_login_without_email_skips_binding() {
        let store = Arc::new(MemoryStore::new());
        let flow = login_flow(store.clone());

        let resp = flow
            .direct_login(request(
                Method::POST,
                "/login",
                r#"{"username":"bob"}"#,
                Some("203.0.113.8"),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(store.binding_count(), 0);
    }

    #[tokio::test]
    async fn test_direct_login_rejects_bad_input() {
        let flow = login_flow(Arc::new(MemoryStore::new()));

        for body in [
            "not json",
            r#"{}"#,
            r#"{"username":"   "}"#,
            r#"{"username":"a;b"}"#,
            r#"{"username":"alice","email":"nope"}"#,
        ] {
            let resp = flow
                .direct_login(request(Method::POST, "/login", body, None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(body_json(&resp)["status"], "error");
            assert!(resp.headers().get(SET_COOKIE).is_none());
        }
    }

    #[tokio::test]
    async fn test_direct_login_requires_post() {
        let flow = login_flow(Arc::new(MemoryStore::new()));
        let resp = flow
            .direct_login(request(Method::GET, "/login", "", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers()[ALLOW], "POST");
    }

    #[tokio::test]
    async fn test_direct_login_storage_failure_is_error() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let flow = login_flow(store);

        let result = flow
            .direct_login(request(
                Method::POST,
                "/login",
                r#"{"username":"alice","email":"alice@example.com"}"#,
                Some("203.0.113.7"),
            ))
            .await;
        assert!(matches!(result, Err(ProxyError::Storage(_))));
    }

    #[tokio::test]
    async fn test_oauth_login_redirects_to_share_url() {
        let store = Arc::new(MemoryStore::new());
        let flow = login_flow(store.clone());

        let resp = flow
            .oauth_login(request(
                Method::GET,
                "/login_oauth?username=carol&email=carol%40example.com",
                "",
                Some("198.51.100.4"),
            ))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "https://share.example.com/");
        assert!(
            resp.headers()[SET_COOKIE]
                .to_str()
                .unwrap()
                .starts_with("username=carol; Path=/;")
        );
        assert_eq!(store.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_oauth_login_missing_username() {
        let flow = login_flow(Arc::new(MemoryStore::new()));
        let resp = flow
            .oauth_login(request(Method::GET, "/login_oauth", "", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(&resp)["message"], "Missing username");
    }

    #[test]
    fn test_cookie_octets() {
        assert!("alice_01-x.y".bytes().all(is_cookie_octet));
        assert!(!"a b".bytes().all(is_cookie_octet));
        assert!(!"a,b".bytes().all(is_cookie_octet));
        assert!(!"a\"b".bytes().all(is_cookie_octet));
        assert!(!"a\\b".bytes().all(is_cookie_octet));
    }
}
