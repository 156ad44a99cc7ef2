use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use beacon_core::{OutgoingRequest, RequestKind, Transport, TransportError, TransportResponse};

use crate::interceptor::{HttpMethod, PreparedRequest, RequestInterceptor};

pub const CHECKSUM_PARAM: &str = "checksum256";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Collector base URL, without a trailing path.
    pub server_url: String,
    /// Query strings at least this long are sent as a POST body.
    pub post_threshold: usize,
    pub force_post: bool,
    /// Tamper-protection salt; when set every request carries `checksum256`.
    pub salt: Option<SecretString>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            post_threshold: 2000,
            force_post: false,
            salt: None,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// `hex(sha256(query + salt))`.
pub fn checksum256(query: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(salt.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Sends queued requests to the collector's ingest endpoint over HTTP.
pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
    interceptor: Option<Arc<dyn RequestInterceptor>>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout);
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::InvalidRequest(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            interceptor: None,
        })
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Resolve method, URL and body for one request, before interception.
    pub fn prepare(&self, request: &OutgoingRequest) -> PreparedRequest {
        let mut query = request.to_query_string();
        if let Some(salt) = &self.config.salt {
            let sum = checksum256(&query, salt.expose_secret());
            query.push_str(&format!("&{CHECKSUM_PARAM}={sum}"));
        }

        let url = format!(
            "{}{}",
            self.config.server_url.trim_end_matches('/'),
            request.endpoint
        );
        let use_post = self.config.force_post
            || request.kind == RequestKind::Crash
            || query.len() >= self.config.post_threshold;

        if use_post {
            PreparedRequest {
                method: HttpMethod::Post,
                url,
                headers: vec![("content-type".into(), FORM_CONTENT_TYPE.into())],
                body: Some(Bytes::from(query)),
            }
        } else {
            PreparedRequest {
                method: HttpMethod::Get,
                url: format!("{url}?{query}"),
                headers: Vec::new(),
                body: None,
            }
        }
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.config.request_timeout)
        } else if e.is_builder() {
            TransportError::InvalidRequest(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Delay in whole seconds from a `Retry-After` header. HTTP dates are
/// ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// A 2xx answer only counts when its body is a JSON object with `result`.
pub fn parse_response(status: u16, body: &str) -> Result<TransportResponse, TransportError> {
    if !(200..300).contains(&status) {
        return Err(TransportError::from_status(status, body.to_owned()));
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) if json.get("result").is_some() => Ok(TransportResponse {
            status,
            body: Some(json),
        }),
        Ok(_) => Err(TransportError::InvalidResponse {
            status,
            detail: format!("missing result field: {body}"),
        }),
        Err(e) => Err(TransportError::InvalidResponse {
            status,
            detail: format!("invalid JSON: {e}"),
        }),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(request_id = %request.request_id, kind = %request.kind))]
    async fn send(&self, request: &OutgoingRequest) -> Result<TransportResponse, TransportError> {
        let mut prepared = self.prepare(request);
        if let Some(interceptor) = &self.interceptor {
            prepared = interceptor.intercept(prepared);
        }

        let mut builder = match prepared.method {
            HttpMethod::Get => self.client.get(&prepared.url),
            HttpMethod::Post => self.client.post(&prepared.url),
        };
        for (name, value) in &prepared.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = prepared.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let suggested = retry_after(response.headers());
        let body = response.text().await.map_err(|e| self.classify(e))?;
        debug!(status, method = ?prepared.method, "collector responded");

        let parsed = match parse_response(status, &body) {
            Err(TransportError::RateLimited { retry_after: None }) => {
                Err(TransportError::RateLimited { retry_after: suggested })
            }
            other => other,
        };
        if let Err(e) = &parsed {
            warn!(status, error_kind = e.error_kind(), "request not accepted");
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{RequestBlob, RequestKind};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outgoing(kind: RequestKind, params: Vec<(&str, &str)>) -> OutgoingRequest {
        let mut blob = RequestBlob::new(
            kind,
            params.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
        blob.device_id = Some("dev-1".into());
        blob.to_outgoing(0)
    }

    fn transport(server_url: &str, tweak: impl FnOnce(&mut HttpTransportConfig)) -> HttpTransport {
        let mut config = HttpTransportConfig {
            server_url: server_url.to_owned(),
            ..Default::default()
        };
        tweak(&mut config);
        HttpTransport::new(config).unwrap()
    }

    #[test]
    fn checksum_matches_known_digest() {
        // sha256("abc")
        assert_eq!(
            checksum256("ab", "c"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn short_request_uses_get() {
        let t = transport("https://collector.example/", |_| {});
        let p = t.prepare(&outgoing(RequestKind::Session, vec![("begin_session", "1")]));
        assert_eq!(p.method, HttpMethod::Get);
        assert_eq!(p.url, "https://collector.example/i?begin_session=1&device_id=dev-1&rr=0");
        assert!(p.body.is_none());
    }

    #[test]
    fn long_request_switches_to_post() {
        let t = transport("https://collector.example", |c| c.post_threshold = 10);
        let p = t.prepare(&outgoing(RequestKind::Events, vec![("events", "[{\"key\":\"a\"}]")]));
        assert_eq!(p.method, HttpMethod::Post);
        assert_eq!(p.url, "https://collector.example/i");
        assert!(p.body.is_some());
    }

    #[test]
    fn crash_always_posts() {
        let t = transport("https://collector.example", |_| {});
        let p = t.prepare(&outgoing(RequestKind::Crash, vec![("crash", "{}")]));
        assert_eq!(p.method, HttpMethod::Post);
    }

    #[test]
    fn salt_appends_checksum_of_query() {
        let t = transport("https://c.example", |c| c.salt = Some(SecretString::from("pepper")));
        let req = outgoing(RequestKind::Session, vec![("end_session", "1")]);
        let p = t.prepare(&req);
        let expected = checksum256(&req.to_query_string(), "pepper");
        assert!(p.url.ends_with(&format!("&checksum256={expected}")), "got {}", p.url);
    }

    #[test]
    fn parse_response_rules() {
        assert!(parse_response(200, r#"{"result":"Success"}"#).is_ok());
        assert!(matches!(
            parse_response(200, r#"{"ok":true}"#),
            Err(TransportError::InvalidResponse { status: 200, .. })
        ));
        assert!(matches!(
            parse_response(200, "<html>"),
            Err(TransportError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_response(400, r#"{"result":"Missing parameter"}"#),
            Err(TransportError::ServerStatus { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn get_request_succeeds_against_collector() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/i"))
            .and(query_param("begin_session", "1"))
            .and(query_param("device_id", "dev-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "Success"})))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server.uri(), |_| {});
        let resp = t
            .send(&outgoing(RequestKind::Session, vec![("begin_session", "1")]))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.unwrap()["result"], "Success");
    }

    #[tokio::test]
    async fn post_body_carries_form_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/i"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "Success"})))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), |c| c.force_post = true);
        t.send(&outgoing(RequestKind::Events, vec![("events", "[]")]))
            .await
            .unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let body = String::from_utf8(received[0].body.clone()).unwrap();
        assert_eq!(body, "events=%5B%5D&device_id=dev-1&rr=0");
    }

    #[tokio::test]
    async fn server_error_is_retryable_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), |_| {});
        let err = t
            .send(&outgoing(RequestKind::Session, vec![("begin_session", "1")]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.detail(), "maintenance");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let t = transport(&server.uri(), |_| {});
        let err = t
            .send(&outgoing(RequestKind::Session, vec![("begin_session", "1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RateLimited { .. }));
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_ignores_http_dates() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(retry_after(&headers), None);
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn unreachable_server_is_network_error() {
        let t = transport("http://127.0.0.1:9", |c| c.connect_timeout = Duration::from_millis(200));
        let err = t
            .send(&outgoing(RequestKind::Session, vec![("begin_session", "1")]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_) | TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn interceptor_rewrites_request() {
        struct AddHeader;
        impl RequestInterceptor for AddHeader {
            fn intercept(&self, mut request: PreparedRequest) -> PreparedRequest {
                request.headers.push(("x-beacon-test".into(), "1".into()));
                request
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header("x-beacon-test", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": "Success"})))
            .expect(1)
            .mount(&server)
            .await;

        let t = transport(&server.uri(), |_| {}).with_interceptor(Arc::new(AddHeader));
        t.send(&outgoing(RequestKind::Session, vec![("begin_session", "1")]))
            .await
            .unwrap();
    }
}
