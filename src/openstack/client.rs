//! OpenStack request client
//!
//! Thin wrapper over reqwest that every remote operation goes through. It
//! attaches the token, serializes query parameters and turns non-2xx answers
//! into one descriptive `ApiError`. It never retries.

use super::error::{ApiError, Result};
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

const USER_AGENT: &str = concat!("nimbus/", env!("CARGO_PKG_VERSION"));

/// Per-call options.
#[derive(Debug, Default, Clone)]
pub struct RequestOptions<'a> {
    pub token: Option<&'a str>,
    pub body: Option<Value>,
    pub params: Vec<(&'a str, String)>,
}

impl<'a> RequestOptions<'a> {
    pub fn with_token(token: &'a str) -> Self {
        Self {
            token: Some(token),
            ..Default::default()
        }
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn param(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.params.push((key, value.into()));
        self
    }
}

/// Shared HTTP client for all services.
#[derive(Clone)]
pub struct HttpClient {
    http: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }

    /// Underlying reqwest client, for calls that need raw response headers.
    pub fn raw(&self) -> &Client {
        &self.http
    }

    /// Issue a request and decode the JSON answer. Empty answers (204, or a
    /// zero content length) decode to `T::default()`.
    pub async fn request<T>(&self, method: Method, url: &str, opts: RequestOptions<'_>) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let (final_url, body) = self.send(method, url, opts).await?;
        match body {
            None => Ok(T::default()),
            Some(text) => serde_json::from_str(&text).map_err(|source| ApiError::Decode {
                url: final_url,
                source,
            }),
        }
    }

    /// Issue a request whose answer is not interesting (actions, deletes).
    pub async fn request_empty(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions<'_>,
    ) -> Result<()> {
        self.send(method, url, opts).await.map(|_| ())
    }

    pub async fn get<T>(&self, url: &str, opts: RequestOptions<'_>) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        self.request(Method::GET, url, opts).await
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        opts: RequestOptions<'_>,
    ) -> Result<(String, Option<String>)> {
        let full_url = build_url(url, &opts.params)?;

        tracing::debug!("API request: {} {}", method, full_url);

        let mut request = self
            .http
            .request(method, full_url.clone())
            .header(header::ACCEPT, "application/json")
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(token) = opts.token {
            request = request.header(AUTH_TOKEN_HEADER, token);
        }
        if let Some(body) = &opts.body {
            tracing::trace!("Request body: {}", body);
            request = request.body(body.to_string());
        }

        let response = request.send().await?;
        let status = response.status();
        let response_url = response.url().to_string();
        let empty_by_header = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim() == "0")
            .unwrap_or(false);

        let text = response.text().await?;

        if !status.is_success() {
            let detail = extract_error_detail(&text, status);
            tracing::error!("OpenStack API error: {} {} - {}", status, response_url, detail);
            return Err(classify_status(response_url, status, detail));
        }

        tracing::trace!("Response body: {}", text);

        if status == StatusCode::NO_CONTENT || empty_by_header || text.trim().is_empty() {
            return Ok((response_url, None));
        }
        Ok((response_url, Some(text)))
    }
}

/// Append query parameters to a URL.
pub fn build_url(url: &str, params: &[(&str, String)]) -> Result<String> {
    if params.is_empty() {
        return Ok(url.to_string());
    }
    let mut parsed = Url::parse(url).map_err(|source| ApiError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    {
        let mut pairs = parsed.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(parsed.to_string())
}

/// Map a non-2xx status to the matching error variant.
pub fn classify_status(url: String, status: StatusCode, detail: String) -> ApiError {
    if status == StatusCode::UNAUTHORIZED {
        ApiError::Unauthorized { url, detail }
    } else {
        ApiError::Http {
            url,
            status: status.as_u16(),
            detail,
        }
    }
}

/// Best-effort server-provided detail from an error body.
///
/// Keystone uses `{"error": {"message"}}`, some proxies a bare `{"message"}`,
/// Nova, Cinder and Neutron wrap the fault in a single named object such as
/// `{"itemNotFound": {"message", "code"}}`.
pub fn extract_error_detail(body: &str, status: StatusCode) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json.pointer("/error/message").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(msg) = json.get("message").and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(obj) = json.as_object() {
            if obj.len() == 1 {
                if let Some(msg) = obj
                    .values()
                    .next()
                    .and_then(|v| v.get("message"))
                    .and_then(Value::as_str)
                {
                    return msg.to_string();
                }
            }
            return json.to_string();
        }
    }

    let text = body.trim();
    if !text.is_empty() {
        return text.to_string();
    }

    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Echo {
        #[serde(default)]
        value: String,
    }

    #[test]
    fn test_extract_detail_keystone_shape() {
        let body = r#"{"error": {"message": "The request you have made requires authentication.", "code": 401}}"#;
        assert_eq!(
            extract_error_detail(body, StatusCode::UNAUTHORIZED),
            "The request you have made requires authentication."
        );
    }

    #[test]
    fn test_extract_detail_nova_fault_shape() {
        let body = r#"{"itemNotFound": {"code": 404, "message": "Instance abc could not be found."}}"#;
        assert_eq!(
            extract_error_detail(body, StatusCode::NOT_FOUND),
            "Instance abc could not be found."
        );
    }

    #[test]
    fn test_extract_detail_falls_back_to_text_then_status() {
        assert_eq!(
            extract_error_detail("<html>Bad Gateway</html>", StatusCode::BAD_GATEWAY),
            "<html>Bad Gateway</html>"
        );
        assert_eq!(
            extract_error_detail("", StatusCode::SERVICE_UNAVAILABLE),
            "Service Unavailable"
        );
    }

    #[test]
    fn test_extract_detail_unknown_json_is_stringified() {
        let detail = extract_error_detail(r#"{"a": 1, "b": 2}"#, StatusCode::BAD_REQUEST);
        assert!(detail.contains("\"a\""));
    }

    #[test]
    fn test_build_url_serializes_params() {
        let url = build_url(
            "http://host/v2.0/ports",
            &[("device_id", "inst 1".to_string()), ("network_id", "net-1".to_string())],
        )
        .unwrap();
        assert_eq!(url, "http://host/v2.0/ports?device_id=inst+1&network_id=net-1");
        assert_eq!(build_url("not a url", &[]).unwrap(), "not a url");
        assert!(build_url("not a url", &[("a", "b".to_string())]).is_err());
    }

    #[tokio::test]
    async fn test_request_sends_token_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/subnets"))
            .and(header("X-Auth-Token", "tok"))
            .and(header("Accept", "application/json"))
            .and(query_param("network_id", "net-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": "ok"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/v2.0/subnets", server.uri());
        let echo: Echo = client
            .get(&url, RequestOptions::with_token("tok").param("network_id", "net-1"))
            .await
            .unwrap();
        assert_eq!(echo.value, "ok");
    }

    #[tokio::test]
    async fn test_request_posts_json_body() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({"os-start": null});
        Mock::given(method("POST"))
            .and(path("/servers/abc/action"))
            .and(body_json(&payload))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        client
            .request_empty(
                Method::POST,
                &format!("{}/servers/abc/action", server.uri()),
                RequestOptions::with_token("tok").body(payload.clone()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_content_resolves_to_default() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/volumes/vol-1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let echo: Echo = client
            .request(
                Method::DELETE,
                &format!("{}/volumes/vol-1", server.uri()),
                RequestOptions::with_token("tok"),
            )
            .await
            .unwrap();
        assert_eq!(echo, Echo::default());
    }

    #[tokio::test]
    async fn test_empty_200_does_not_fail_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/thing"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let echo: Echo = client
            .request(
                Method::PUT,
                &format!("{}/thing", server.uri()),
                RequestOptions::with_token("tok"),
            )
            .await
            .unwrap();
        assert_eq!(echo, Echo::default());
    }

    #[tokio::test]
    async fn test_401_is_flagged_as_session_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/detail"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": {"code": 401, "message": "The request you have made requires authentication.", "title": "Unauthorized"}
            })))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let err = client
            .get::<Echo>(
                &format!("{}/servers/detail", server.uri()),
                RequestOptions::with_token("expired"),
            )
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        let msg = err.to_string();
        assert!(msg.contains("session might have expired"));
        assert!(msg.contains("/servers/detail"));
        assert!(msg.contains("requires authentication"));
    }

    #[tokio::test]
    async fn test_http_error_carries_status_and_text_detail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/images"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let err = client
            .get::<Echo>(&format!("{}/images", server.uri()), RequestOptions::with_token("t"))
            .await
            .unwrap_err();

        match err {
            ApiError::Http { url, status, detail } => {
                assert_eq!(status, 500);
                assert!(url.ends_with("/images"));
                assert_eq!(detail, "upstream exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flavors/detail"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{not json"))
            .mount(&server)
            .await;

        let client = HttpClient::new().unwrap();
        let err = client
            .get::<Echo>(
                &format!("{}/flavors/detail", server.uri()),
                RequestOptions::with_token("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_transport_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 500\r\n\r\n{\"servers\": [",
                )
                .await;
            let _ = socket.shutdown().await;
        });

        let client = HttpClient::new().unwrap();
        let err = client
            .get::<Echo>(
                &format!("http://{}/servers/detail", addr),
                RequestOptions::with_token("t"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)), "got {err:?}");
    }
}
