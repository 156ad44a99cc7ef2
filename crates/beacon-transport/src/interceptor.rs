use bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Fully resolved exchange, handed to the interceptor just before sending.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    /// Complete URL; carries the query string for GET.
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Form-encoded parameters for POST.
    pub body: Option<Bytes>,
}

impl PreparedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Hook that may rewrite method, URL, headers or body of every request.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, request: PreparedRequest) -> PreparedRequest;
}

/// Adds a fixed set of headers, e.g. for a proxy in front of the collector.
pub struct StaticHeaders(pub Vec<(String, String)>);

impl RequestInterceptor for StaticHeaders {
    fn intercept(&self, mut request: PreparedRequest) -> PreparedRequest {
        for (name, value) in &self.0 {
            request.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            request.headers.push((name.clone(), value.clone()));
        }
        request
    }
}
