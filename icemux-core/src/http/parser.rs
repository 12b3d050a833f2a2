//! Request parsing for the ICE/HTTP dialect

use std::collections::HashMap;
use std::str::FromStr;

use super::{HttpError, HttpResult};

/// Request methods understood by the front-end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Source,
    Put,
    Stats,
    Options,
    /// Anything else; answered with 501
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Source => "SOURCE",
            Method::Put => "PUT",
            Method::Stats => "STATS",
            Method::Options => "OPTIONS",
            Method::Other(s) => s,
        }
    }
}

impl FromStr for Method {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "SOURCE" => Method::Source,
            "PUT" => Method::Put,
            "STATS" => Method::Stats,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wire protocol named on the request line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Ice,
    Icy,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Ice => "ICE",
            Protocol::Icy => "ICY",
        }
    }
}

/// Parsed request headers
pub type Headers = HashMap<String, String>;

/// Parsed query parameters
pub type QueryParams = HashMap<String, String>;

/// A parsed request: request line, lower-cased headers and query parameters.
///
/// The parser only consumes the header block; any payload bytes after the
/// terminator stay with the request-assembly buffer.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    query_params: QueryParams,
    protocol: Protocol,
    version: String,
    headers: Headers,
    icy_password: Option<String>,
}

impl Request {
    /// Parse a header block (request line through terminator).
    ///
    /// Accepts `\r\n`, bare `\n` and `\r\r\n` line endings. Header names are
    /// lower-cased; values keep their case.
    pub fn parse(raw: &[u8]) -> HttpResult<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| HttpError::InvalidRequest(format!("not valid UTF-8: {}", e)))?;

        let mut lines = text.split('\n').map(|l| l.trim_end_matches('\r'));
        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HttpError::InvalidRequest("empty request".to_string()))?;

        let (method, uri, protocol, version, icy_password) =
            Self::parse_request_line(request_line)?;
        let headers = Self::parse_headers(lines)?;
        let (uri, query_params) = Self::parse_uri_and_query(&uri);

        Ok(Self { method, uri, query_params, protocol, version, headers, icy_password })
    }

    fn parse_request_line(
        line: &str,
    ) -> HttpResult<(Method, String, Protocol, String, Option<String>)> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(HttpError::InvalidRequest(format!("bad request line: {}", line)));
        }

        let method: Method = parts[0].parse()?;

        // Shoutcast 1.x sources put the password on the request line:
        // "SOURCE <password> <mount>". The mount, not a protocol token,
        // occupies the third slot.
        if method == Method::Source && parts[2].starts_with('/') {
            return Ok((
                method,
                parts[2].to_string(),
                Protocol::Icy,
                "1.0".to_string(),
                Some(parts[1].to_string()),
            ));
        }

        let (proto, version) = parts[2]
            .split_once('/')
            .ok_or_else(|| HttpError::InvalidRequest(format!("bad protocol token: {}", parts[2])))?;
        let protocol = match proto {
            "HTTP" => Protocol::Http,
            "ICE" => Protocol::Ice,
            "ICY" => Protocol::Icy,
            other => {
                return Err(HttpError::InvalidRequest(format!("unknown protocol: {}", other)));
            }
        };

        Ok((method, parts[1].to_string(), protocol, version.to_string(), None))
    }

    fn parse_headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> HttpResult<Headers> {
        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::InvalidHeaders(format!("bad header line: {}", line)))?;
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
        Ok(headers)
    }

    fn parse_uri_and_query(full: &str) -> (String, QueryParams) {
        let (path, query) = match full.split_once('?') {
            Some((p, q)) => (p, q),
            None => return (full.to_string(), HashMap::new()),
        };
        let mut params = HashMap::new();
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some((k, v)) => {
                    params.insert(urlcode_decode(k), urlcode_decode(v));
                }
                None if !pair.is_empty() => {
                    params.insert(urlcode_decode(pair), String::new());
                }
                None => {}
            }
        }
        (path.to_string(), params)
    }

    // Accessors

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI without the query string
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Protocol version as written on the request line, e.g. "1.1"
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Header lookup by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(|s| s.as_str())
    }

    /// Password from a Shoutcast-style `SOURCE <password> <mount>` line
    pub fn icy_password(&self) -> Option<&str> {
        self.icy_password.as_deref()
    }
}

/// URL decoding for query parameters (RFC 3986)
fn urlcode_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                result.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let (Some(hi), Some(lo)) =
                    (super::hex_digit(bytes[i + 1]), super::hex_digit(bytes[i + 2]))
                {
                    result.push((hi << 4) | lo);
                    i += 3;
                } else {
                    result.push(b'%');
                    i += 1;
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(result).unwrap_or_else(|_| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_get() {
        let req = Request::parse(b"GET /stream.ogg HTTP/1.0\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(*req.method(), Method::Get);
        assert_eq!(req.uri(), "/stream.ogg");
        assert_eq!(req.protocol(), Protocol::Http);
        assert_eq!(req.version(), "1.0");
        assert_eq!(req.header("host"), Some("x"));
        assert_eq!(req.header("Host"), Some("x"));
    }

    #[test]
    fn test_ice_source() {
        let req =
            Request::parse(b"SOURCE /live ICE/1.0\r\nice-name: Demo\r\n\r\n").unwrap();
        assert_eq!(*req.method(), Method::Source);
        assert_eq!(req.protocol(), Protocol::Ice);
        assert_eq!(req.header("ice-name"), Some("Demo"));
    }

    #[test]
    fn test_lf_only_lines() {
        let req = Request::parse(b"GET / HTTP/1.1\nHost: y\n\n").unwrap();
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("host"), Some("y"));
    }

    #[test]
    fn test_double_cr_lines() {
        let req = Request::parse(b"GET / HTTP/1.0\r\r\nHost: z\r\r\n\r\r\n").unwrap();
        assert_eq!(req.header("host"), Some("z"));
    }

    #[test]
    fn test_icy_source_line() {
        let req = Request::parse(b"SOURCE hackme /live\r\n\r\n").unwrap();
        assert_eq!(*req.method(), Method::Source);
        assert_eq!(req.protocol(), Protocol::Icy);
        assert_eq!(req.uri(), "/live");
        assert_eq!(req.icy_password(), Some("hackme"));
    }

    #[test]
    fn test_query_params() {
        let req = Request::parse(b"GET /s?type=.flv&x=a%20b HTTP/1.0\r\n\r\n").unwrap();
        assert_eq!(req.uri(), "/s");
        assert_eq!(req.query_param("type"), Some(".flv"));
        assert_eq!(req.query_param("x"), Some("a b"));
    }

    #[test]
    fn test_unknown_method_preserved() {
        let req = Request::parse(b"BREW /pot HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(*req.method(), Method::Other("BREW".to_string()));
    }

    #[test]
    fn test_bad_request_line() {
        assert!(Request::parse(b"GET /\r\n\r\n").is_err());
        assert!(Request::parse(b"GET / FOO/1.0\r\n\r\n").is_err());
        assert!(Request::parse(b"\r\n\r\n").is_err());
    }
}
