//! Recorded requests.
//!
//! A [`RecordedRequest`] is the immutable snapshot the server takes of every
//! inbound request. It is what predicates are evaluated against, what the
//! journal stores and what the control protocol serializes.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Snapshot of an inbound request, taken at arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedRequest {
    /// Arrival sequence number, assigned when the journal records the request
    #[serde(default)]
    pub sequence: u64,
    pub method: String,
    pub path: String,
    /// Raw query string, without the leading `?`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub version: String,
    /// Header multimap in arrival order
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    /// Decoded `application/x-www-form-urlencoded` fields
    #[serde(default)]
    pub form: Vec<(String, String)>,
    pub scheme: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
}

impl RecordedRequest {
    /// Capture a request received on `local_addr`.
    ///
    /// The sequence number is left at zero; the journal assigns it.
    pub fn capture(parts: &http::request::Parts, body: &[u8], local_addr: SocketAddr) -> Self {
        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| find_header(&headers, "host").map(String::from));
        let (host, port) = authority
            .as_deref()
            .map(split_host_port)
            .unwrap_or((None, None));

        let (auth_user, auth_password) = find_header(&headers, "authorization")
            .and_then(parse_basic_auth)
            .map(|(user, password)| (Some(user), password))
            .unwrap_or((None, None));

        let is_form = find_header(&headers, "content-type")
            .map(|ct| {
                ct.to_ascii_lowercase()
                    .starts_with("application/x-www-form-urlencoded")
            })
            .unwrap_or(false);
        let form = if is_form {
            parse_urlencoded(&String::from_utf8_lossy(body))
        } else {
            Vec::new()
        };

        Self {
            sequence: 0,
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(String::from),
            version: format!("{:?}", parts.version),
            user_agent: find_header(&headers, "user-agent").map(String::from),
            headers,
            body: body.to_vec(),
            form,
            scheme: parts.uri.scheme_str().unwrap_or("http").to_string(),
            host: host.or_else(|| Some(local_addr.ip().to_string())),
            port: port.or(Some(local_addr.port())),
            auth_user,
            auth_password,
        }
    }

    /// First value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// All values of a header, in arrival order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Decoded query parameters, in order of appearance.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.query.as_deref().map(parse_urlencoded).unwrap_or_default()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Serialize for the control protocol.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a control protocol payload.
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Split `host[:port]`, keeping IPv6 literals bracketed.
fn split_host_port(authority: &str) -> (Option<String>, Option<u16>) {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => {
                let host = &authority[..=end];
                let port = authority[end + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok());
                (Some(host.to_string()), port)
            }
            None => (Some(authority.to_string()), None),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (Some(host.to_string()), Some(port)),
            Err(_) => (Some(authority.to_string()), None),
        },
        None if authority.is_empty() => (None, None),
        None => (Some(authority.to_string()), None),
    }
}

/// Extract user and password from a `Basic` authorization header.
fn parse_basic_auth(value: &str) -> Option<(String, Option<String>)> {
    let (scheme, credentials) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(credentials.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    match decoded.split_once(':') {
        Some((user, password)) => Some((user.to_string(), Some(password.to_string()))),
        None => Some((decoded, None)),
    }
}

/// Parse `application/x-www-form-urlencoded` pairs.
pub(crate) fn parse_urlencoded(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(request: http::Request<()>, body: &[u8]) -> RecordedRequest {
        let (parts, _) = request.into_parts();
        RecordedRequest::capture(&parts, body, "127.0.0.1:28080".parse().unwrap())
    }

    #[test]
    fn test_capture_request_line_and_headers() {
        let request = http::Request::builder()
            .method("POST")
            .uri("/api/users?page=2&name=John%20Doe")
            .header("Host", "mock.local:9000")
            .header("X-Special", "1")
            .header("X-Multi", "a")
            .header("X-Multi", "b")
            .header("User-Agent", "CUSTOM UA")
            .body(())
            .unwrap();
        let recorded = capture(request, b"payload");

        assert_eq!(recorded.method, "POST");
        assert_eq!(recorded.path, "/api/users");
        assert_eq!(recorded.version, "HTTP/1.1");
        assert_eq!(recorded.header("x-special"), Some("1"));
        assert_eq!(recorded.header("X-SPECIAL"), Some("1"));
        assert_eq!(recorded.header_values("x-multi").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(recorded.query_param("page").as_deref(), Some("2"));
        assert_eq!(recorded.query_param("name").as_deref(), Some("John Doe"));
        assert_eq!(recorded.host.as_deref(), Some("mock.local"));
        assert_eq!(recorded.port, Some(9000));
        assert_eq!(recorded.user_agent.as_deref(), Some("CUSTOM UA"));
        assert_eq!(recorded.body_text(), Some("payload"));
    }

    #[test]
    fn test_capture_falls_back_to_listener_address() {
        let request = http::Request::builder().uri("/").body(()).unwrap();
        let recorded = capture(request, b"");

        assert_eq!(recorded.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(recorded.port, Some(28080));
        assert_eq!(recorded.scheme, "http");
    }

    #[test]
    fn test_capture_basic_auth_and_form() {
        // "user:s3cr:et"
        let request = http::Request::builder()
            .method("PUT")
            .uri("/")
            .header("Authorization", "Basic dXNlcjpzM2NyOmV0")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(())
            .unwrap();
        let recorded = capture(request, b"put-key=put-value&empty=&flag");

        assert_eq!(recorded.auth_user.as_deref(), Some("user"));
        assert_eq!(recorded.auth_password.as_deref(), Some("s3cr:et"));
        assert_eq!(recorded.form_field("put-key"), Some("put-value"));
        assert_eq!(recorded.form_field("empty"), Some(""));
        assert_eq!(recorded.form_field("flag"), Some(""));
    }

    #[test]
    fn test_bearer_token_is_not_a_credential() {
        let request = http::Request::builder()
            .uri("/")
            .header("Authorization", "Bearer abc")
            .body(())
            .unwrap();
        let recorded = capture(request, b"");
        assert!(recorded.auth_user.is_none());
        assert!(recorded.auth_password.is_none());
    }

    #[test]
    fn test_payload_round_trip_preserves_binary_body() {
        let request = http::Request::builder()
            .method("PATCH")
            .uri("/bin?x=1")
            .header("Content-Type", "application/octet-stream")
            .body(())
            .unwrap();
        let mut recorded = capture(request, &[0, 159, 146, 150, 255]);
        recorded.sequence = 7;

        let payload = recorded.to_payload().unwrap();
        let decoded = RecordedRequest::from_payload(&payload).unwrap();

        assert_eq!(decoded, recorded);
        assert_eq!(decoded.body, vec![0, 159, 146, 150, 255]);
    }

    #[test]
    fn test_percent_decoding() {
        let params = parse_urlencoded("a=%E2%9C%93&b=50%25&c=bad%zz&d=%4");
        assert_eq!(params[0], ("a".to_string(), "✓".to_string()));
        assert_eq!(params[1], ("b".to_string(), "50%".to_string()));
        assert_eq!(params[2], ("c".to_string(), "bad%zz".to_string()));
        assert_eq!(params[3], ("d".to_string(), "%4".to_string()));
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("[::1]:8080"),
            (Some("[::1]".to_string()), Some(8080))
        );
        assert_eq!(split_host_port("example.com"), (Some("example.com".to_string()), None));
    }
}
