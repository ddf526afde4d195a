//! HTTP/1.x request sniffing
//!
//! Extracts the `Host` header and request target from the first payload
//! of a plain-HTTP flow. Parsing is delegated to `httparse`; even a
//! partial request is useful as long as the headers of interest were
//! captured.

use tracing::trace;

/// Maximum number of headers considered
const MAX_HEADERS: usize = 64;

/// Fields extracted from an HTTP request head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestInfo {
    /// `Host` header value, port stripped
    pub host: Option<String>,
    /// Request method
    pub method: Option<String>,
    /// Request target (path)
    pub path: Option<String>,
}

impl HttpRequestInfo {
    /// Full URL in `host + path` form, when both parts are known.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        match (&self.host, &self.path) {
            (Some(host), Some(path)) => Some(format!("{host}{path}")),
            (Some(host), None) => Some(host.clone()),
            _ => None,
        }
    }
}

/// Fast heuristic: does this payload start with a known HTTP method?
#[must_use]
pub fn looks_like_http(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    matches!(
        &data[..4],
        b"GET " | b"POST" | b"PUT " | b"HEAD" | b"DELE" | b"OPTI" | b"PATC" | b"CONN" | b"TRAC"
    )
}

/// Parse an HTTP request head, returning whatever could be extracted.
#[must_use]
pub fn parse_request(data: &[u8]) -> Option<HttpRequestInfo> {
    if !looks_like_http(data) {
        return None;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        // A partial head still carries the request line and early headers.
        Ok(httparse::Status::Complete(_) | httparse::Status::Partial) => {
            let mut info = HttpRequestInfo {
                method: req.method.map(str::to_string),
                path: req.path.map(str::to_string),
                ..HttpRequestInfo::default()
            };

            for header in req.headers.iter() {
                if header.name.eq_ignore_ascii_case("host") {
                    if let Ok(value) = std::str::from_utf8(header.value) {
                        let host = strip_port(value.trim());
                        if is_valid_host(host) {
                            info.host = Some(host.to_string());
                        }
                    }
                    break;
                }
            }

            if info == HttpRequestInfo::default() {
                None
            } else {
                Some(info)
            }
        }
        Err(e) => {
            trace!("HTTP parse failed: {e:?}");
            None
        }
    }
}

/// Strip a port suffix, handling bracketed IPv6 literals.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[1..end];
        }
    }
    if let Some(colon) = host.rfind(':') {
        let port = &host[colon + 1..];
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return &host[..colon];
        }
    }
    host
}

/// Hostnames and IP literals only.
fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':')
}
