//! Requests entering the runtime and the rewritten form handed to guests.

use bytes::Bytes;

/// An inbound HTTP request as seen by the front door.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method.
    pub method: String,
    /// Request path including its leading slash, without the query.
    pub path: String,
    /// Raw query string without `?`.
    pub query: Option<String>,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl InboundRequest {
    /// Create a request with no headers, query or body.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: None,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value by name (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build the guest-visible request for `forwarded_path`.
    ///
    /// Method, headers and body are carried over unchanged; only the URL is
    /// rewritten. An `x-forwarded-url` header replaces the scheme and host
    /// part as the URL base.
    pub fn rewrite(&self, forwarded_path: &str) -> GuestRequest {
        let base = match self.get_header("x-forwarded-url") {
            Some(forwarded) => forwarded.trim_end_matches('/').to_string(),
            None => {
                let scheme = self.get_header("x-forwarded-proto").unwrap_or("http");
                let host = self.get_header("host").unwrap_or("localhost");
                format!("{scheme}://{host}")
            }
        };

        let mut url = format!("{base}{forwarded_path}");
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        GuestRequest {
            method: self.method.clone(),
            url,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// The request a guest handler receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute URL with the route stripped from the path.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_keeps_everything_but_url() {
        let inbound = InboundRequest::new("POST", "/hello/items")
            .with_header("Host", "example.test:3000")
            .with_header("X-Custom", "1")
            .with_query("page=2")
            .with_body("payload");

        let guest = inbound.rewrite("/items");

        assert_eq!(guest.url, "http://example.test:3000/items?page=2");
        assert_eq!(guest.method, "POST");
        assert_eq!(guest.headers, inbound.headers);
        assert_eq!(guest.body, Bytes::from("payload"));
    }

    #[test]
    fn test_rewrite_honours_forwarding_headers() {
        let proto = InboundRequest::new("GET", "/w")
            .with_header("host", "edge.test")
            .with_header("x-forwarded-proto", "https");
        assert_eq!(proto.rewrite("/").url, "https://edge.test/");

        let forwarded = InboundRequest::new("GET", "/w/a")
            .with_header("x-forwarded-url", "https://public.test/base/");
        assert_eq!(forwarded.rewrite("/a").url, "https://public.test/base/a");
    }

    #[test]
    fn test_rewrite_without_host() {
        let inbound = InboundRequest::new("GET", "/w").with_query("");
        assert_eq!(inbound.rewrite("/").url, "http://localhost/");
    }

    #[test]
    fn test_get_header_is_case_insensitive() {
        let inbound = InboundRequest::new("GET", "/").with_header("Content-Type", "text/plain");
        assert_eq!(inbound.get_header("content-type"), Some("text/plain"));
        assert!(inbound.get_header("x-missing").is_none());
    }
}
