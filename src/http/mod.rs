use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::Error;

/// Receive-buffer size for client requests and origin responses. Requests
/// larger than this are truncated silently.
pub(crate) const BUFFER_SIZE: usize = 65536;

const SCHEME_HTTP: &str = "http://";
const HEADER_SEP: &[u8] = b": ";

const CACHE_CONTROL: &str = "cache-control";
const CONTENT_LENGTH: &str = "content-length";
const TRANSFER_ENCODING: &str = "transfer-encoding";
const ETAG: &str = "etag";
pub(crate) const LAST_MODIFIED: &str = "last-modified";

const CACHE_CONTROL_NO_STORE: &str = "no-store";
const CACHE_CONTROL_NO_CACHE: &str = "no-cache";
const CACHE_CONTROL_MAX_AGE: &str = "max-age=";
const TRANSFER_ENCODING_CHUNKED: &str = "chunked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Connect,
    Other(String),
}

impl Method {
    fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "CONNECT" => Method::Connect,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Connect => "CONNECT",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed client request. `raw_bytes` keeps the request verbatim so it
/// can be forwarded to the origin, possibly with a conditional header
/// spliced in after the start line.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub raw_target: String,
    pub host: String,
    pub port: u16,
    pub start_line: String,
    pub request_time: SystemTime,
    pub raw_bytes: Vec<u8>,
}

impl Request {
    pub fn parse(raw: &[u8], request_time: SystemTime) -> Result<Request, Error> {
        let line_end = raw.iter().position(|&b| b == b'\r').unwrap_or(raw.len());
        let start_line = std::str::from_utf8(&raw[..line_end])
            .map_err(|_| Error::InvalidRequest)?
            .to_string();
        let mut tokens = start_line.split_whitespace();
        let (Some(method), Some(target)) = (tokens.next(), tokens.next()) else {
            return Err(Error::InvalidRequest);
        };
        let method = Method::from_token(method);
        let (host, port) = if let Some(rest) = target.strip_prefix(SCHEME_HTTP) {
            // Absolute form: authority runs up to the third slash or the end.
            let authority = rest.split('/').next().unwrap_or(rest);
            split_host_port(authority, 80)?
        } else {
            // Authority form, as sent by CONNECT.
            split_host_port(target, 443)?
        };
        Ok(Request {
            method,
            raw_target: target.to_string(),
            host,
            port,
            start_line,
            request_time,
            raw_bytes: raw.to_vec(),
        })
    }

    /// The cache key: the request-target exactly as the client sent it.
    pub fn url(&self) -> &str {
        &self.raw_target
    }
}

/// Split `host[:port]` on the last colon. Bracketed IPv6 literals keep
/// their colons; the brackets themselves are stripped from the host.
fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), Error> {
    if let Some(bracket_idx) = authority.rfind(']') {
        let host = authority
            .strip_prefix('[')
            .map(|rest| &rest[..bracket_idx - 1])
            .unwrap_or(&authority[..bracket_idx + 1])
            .to_string();
        return match authority[bracket_idx..].find(':') {
            Some(rel_idx) => {
                let port = parse_port(authority, &authority[bracket_idx + rel_idx + 1..])?;
                Ok((host, port))
            }
            None => Ok((host, default_port)),
        };
    }
    match authority.rfind(':') {
        Some(idx) => {
            let port = parse_port(authority, &authority[idx + 1..])?;
            Ok((authority[..idx].to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

fn parse_port(authority: &str, digits: &str) -> Result<u16, Error> {
    digits
        .parse()
        .map_err(|_| Error::InvalidPort(authority.to_string()))
}

/// One origin response, either in flight or cached. The freshness metadata
/// is derived once at parse time and never recomputed.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub url: String,
    pub start_line: String,
    pub raw_header: Bytes,
    pub header_fields: HashMap<String, String>,
    pub body_segments: Vec<Bytes>,
    pub no_store: bool,
    pub no_cache: bool,
    pub received_at: SystemTime,
    pub expires_at: SystemTime,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl Response {
    pub fn parse(
        url: &str,
        raw_header: Bytes,
        body_segments: Vec<Bytes>,
        received_at: SystemTime,
    ) -> Result<Response, Error> {
        let start_line = start_line_of(&raw_header)?;
        let status_code = status_code_of(&start_line)?;
        let header_fields = parse_header_fields(&raw_header);
        let cache_control = header_fields
            .get(CACHE_CONTROL)
            .map(String::as_str)
            .unwrap_or("");
        let no_store = cache_control.contains(CACHE_CONTROL_NO_STORE);
        let no_cache = cache_control.contains(CACHE_CONTROL_NO_CACHE);
        let expires_at = received_at + Duration::from_secs(parse_max_age(cache_control));
        let etag = header_fields
            .get(ETAG)
            .filter(|value| !value.is_empty())
            .cloned();
        let last_modified = header_fields
            .get(LAST_MODIFIED)
            .and_then(|value| httpdate::parse_http_date(value).ok());
        Ok(Response {
            status_code,
            url: url.to_string(),
            start_line,
            raw_header,
            header_fields,
            body_segments,
            no_store,
            no_cache,
            received_at,
            expires_at,
            etag,
            last_modified,
        })
    }

    /// A response is fresh while `expires_at` has not passed and the origin
    /// did not demand revalidation on every use.
    pub fn fresh_at(&self, now: SystemTime) -> bool {
        now <= self.expires_at && !self.no_cache
    }
}

/// Find the end of HTTP headers (double CRLF).
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

pub(crate) fn start_line_of(header: &[u8]) -> Result<String, Error> {
    let line_end = header.iter().position(|&b| b == b'\r').unwrap_or(header.len());
    std::str::from_utf8(&header[..line_end])
        .map(str::to_string)
        .map_err(|_| Error::InvalidStatusLine)
}

/// The middle token of `HTTP/1.1 200 OK`, as an integer.
pub(crate) fn status_code_of(start_line: &str) -> Result<u16, Error> {
    start_line
        .split_whitespace()
        .nth(1)
        .and_then(|token| token.parse().ok())
        .ok_or(Error::InvalidStatusLine)
}

/// Split a header block into name → value, last wins on duplicates. Names
/// are lowercased so lookups are case-insensitive; values stay verbatim.
/// Lines without a `": "` separator or with non-UTF-8 content are skipped.
pub(crate) fn parse_header_fields(block: &[u8]) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in header_lines(block).skip(1) {
        if line.is_empty() {
            break;
        }
        let Some(sep_idx) = line.windows(HEADER_SEP.len()).position(|w| w == HEADER_SEP) else {
            continue;
        };
        let (name, value) = (&line[..sep_idx], &line[sep_idx + HEADER_SEP.len()..]);
        if let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) {
            fields.insert(name.to_ascii_lowercase(), value.to_string());
        }
    }
    fields
}

fn header_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn parse_max_age(cache_control: &str) -> u64 {
    let Some(idx) = cache_control.find(CACHE_CONTROL_MAX_AGE) else {
        return 0;
    };
    let rest = &cache_control[idx + CACHE_CONTROL_MAX_AGE.len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().unwrap_or(0)
}

/// Framing of a response body, decided from the header fields. The order
/// matters: an explicit length wins over chunking, and a response with
/// neither is delimited by the origin closing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    ContentLength(usize),
    Chunked,
    Close,
}

impl Framing {
    pub(crate) fn detect(fields: &HashMap<String, String>) -> Framing {
        if let Some(length) = fields
            .get(CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
        {
            return Framing::ContentLength(length);
        }
        if fields
            .get(TRANSFER_ENCODING)
            .is_some_and(|value| value.contains(TRANSFER_ENCODING_CHUNKED))
        {
            return Framing::Chunked;
        }
        Framing::Close
    }
}

/// Splice a conditional-header section (led by a literal `\r\n`) in right
/// after the request start line, preserving all original client headers.
pub(crate) fn insert_after_start_line(raw: &[u8], section: &str) -> Vec<u8> {
    let idx = raw.iter().position(|&b| b == b'\r').unwrap_or(raw.len());
    let mut spliced = Vec::with_capacity(raw.len() + section.len());
    spliced.extend_from_slice(&raw[..idx]);
    spliced.extend_from_slice(section.as_bytes());
    spliced.extend_from_slice(&raw[idx..]);
    spliced
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn parse_get_absolute_form() {
        let raw = b"GET http://people.duke.edu/~bmr23/ece568/ HTTP/1.1\r\nHost: people.duke.edu\r\n\r\n";
        let request = Request::parse(raw, now()).unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.host, "people.duke.edu");
        assert_eq!(request.port, 80);
        assert_eq!(request.raw_target, "http://people.duke.edu/~bmr23/ece568/");
        assert_eq!(
            request.start_line,
            "GET http://people.duke.edu/~bmr23/ece568/ HTTP/1.1"
        );
        assert_eq!(request.raw_bytes, raw.to_vec());
    }

    #[test]
    fn parse_get_absolute_form_with_port() {
        let raw = b"GET http://localhost:8080/api/test HTTP/1.1\r\n\r\n";
        let request = Request::parse(raw, now()).unwrap();
        assert_eq!(request.host, "localhost");
        assert_eq!(request.port, 8080);
    }

    #[test]
    fn parse_get_absolute_form_no_path() {
        let raw = b"GET http://example.com HTTP/1.1\r\n\r\n";
        let request = Request::parse(raw, now()).unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);
    }

    #[test]
    fn parse_connect_authority_form() {
        let raw = b"CONNECT github.com:443 HTTP/1.1\r\nHost: github.com:443\r\n\r\n";
        let request = Request::parse(raw, now()).unwrap();
        assert_eq!(request.method, Method::Connect);
        assert_eq!(request.host, "github.com");
        assert_eq!(request.port, 443);
    }

    #[test]
    fn parse_connect_defaults_to_443() {
        let request = Request::parse(b"CONNECT github.com HTTP/1.1\r\n\r\n", now()).unwrap();
        assert_eq!(request.host, "github.com");
        assert_eq!(request.port, 443);
    }

    #[test]
    fn parse_connect_ipv6_authority() {
        let request = Request::parse(b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n", now()).unwrap();
        assert_eq!(request.host, "::1");
        assert_eq!(request.port, 8443);
    }

    #[test]
    fn parse_unknown_method_passes_through() {
        let request = Request::parse(b"BREW http://coffee/pot HTTP/1.1\r\n\r\n", now()).unwrap();
        assert_eq!(request.method, Method::Other("BREW".to_string()));
    }

    #[test]
    fn parse_rejects_single_token_line() {
        assert!(matches!(
            Request::parse(b"GET\r\n\r\n", now()),
            Err(Error::InvalidRequest)
        ));
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(matches!(
            Request::parse(b"CONNECT host:notaport HTTP/1.1\r\n\r\n", now()),
            Err(Error::InvalidPort(_))
        ));
    }

    #[test]
    fn response_parse_basic() {
        let header = Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\nCache-Control: max-age=3600\r\n\r\n",
        );
        let response =
            Response::parse("http://o/a", header, vec![Bytes::from_static(b"abc")], now()).unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.start_line, "HTTP/1.1 200 OK");
        assert_eq!(response.url, "http://o/a");
        assert_eq!(
            response.header_fields.get("content-length").map(String::as_str),
            Some("3")
        );
        assert_eq!(response.expires_at, now() + Duration::from_secs(3600));
        assert!(!response.no_store);
        assert!(!response.no_cache);
        assert!(response.etag.is_none());
        assert!(response.last_modified.is_none());
    }

    #[test]
    fn response_parse_duplicate_header_last_wins() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert_eq!(response.header_fields.get("x-tag").map(String::as_str), Some("two"));
    }

    #[test]
    fn response_parse_header_names_case_insensitive() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\netag: \"v1\"\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert_eq!(response.etag.as_deref(), Some("\"v1\""));
    }

    #[test]
    fn response_parse_missing_max_age_means_immediately_stale() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert_eq!(response.expires_at, response.received_at);
        assert!(!response.fresh_at(now() + Duration::from_secs(1)));
    }

    #[test]
    fn response_parse_cache_control_directives() {
        let header = Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nCache-Control: no-cache, no-store, max-age=60\r\n\r\n",
        );
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert!(response.no_store);
        assert!(response.no_cache);
        assert_eq!(response.expires_at, now() + Duration::from_secs(60));
        // no-cache forces revalidation even inside the max-age window
        assert!(!response.fresh_at(now()));
    }

    #[test]
    fn response_parse_max_age_with_trailing_directive() {
        let header =
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=120, public\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert_eq!(response.expires_at, now() + Duration::from_secs(120));
    }

    #[test]
    fn response_parse_last_modified() {
        let header = Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nLast-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n",
        );
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        let expected = httpdate::parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(response.last_modified, Some(expected));
    }

    #[test]
    fn response_parse_unparseable_last_modified_is_absent() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nLast-Modified: yesterday\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert!(response.last_modified.is_none());
    }

    #[test]
    fn response_parse_empty_etag_is_absent() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nETag: \r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert!(response.etag.is_none());
    }

    #[test]
    fn response_parse_malformed_status_line_fails() {
        let header = Bytes::from_static(b"HTTP/1.1 OK\r\n\r\n");
        assert!(matches!(
            Response::parse("u", header, Vec::new(), now()),
            Err(Error::InvalidStatusLine)
        ));
    }

    #[test]
    fn response_parse_fresh_at_boundary_is_inclusive() {
        let header =
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nCache-Control: max-age=10\r\n\r\n");
        let response = Response::parse("u", header, Vec::new(), now()).unwrap();
        assert!(response.fresh_at(now() + Duration::from_secs(10)));
        assert!(!response.fresh_at(now() + Duration::from_secs(11)));
    }

    #[test]
    fn framing_detection_prefers_content_length() {
        let header = Bytes::from_static(
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let fields = parse_header_fields(&header);
        assert_eq!(Framing::detect(&fields), Framing::ContentLength(10));
    }

    #[test]
    fn framing_detection_chunked() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
        let fields = parse_header_fields(&header);
        assert_eq!(Framing::detect(&fields), Framing::Chunked);
    }

    #[test]
    fn framing_detection_falls_back_to_close() {
        let header = Bytes::from_static(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n");
        let fields = parse_header_fields(&header);
        assert_eq!(Framing::detect(&fields), Framing::Close);
    }

    #[test]
    fn find_header_end_positions() {
        assert_eq!(find_header_end(b"Hello\r\nWorld"), None);
        assert_eq!(find_header_end(b"Header: value\r\n\r\n"), Some(13));
        assert_eq!(find_header_end(b"Header: value\r\n\r\nBody"), Some(13));
        assert_eq!(find_header_end(b""), None);
        assert_eq!(find_header_end(b"\r\n\r\n"), Some(0));
    }

    #[test]
    fn insert_after_start_line_splices_section() {
        let raw = b"GET http://o/b HTTP/1.1\r\nHost: o\r\n\r\n";
        let spliced = insert_after_start_line(raw, "\r\nIf-None-Match: \"v1\"");
        assert_eq!(
            spliced,
            b"GET http://o/b HTTP/1.1\r\nIf-None-Match: \"v1\"\r\nHost: o\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn status_code_of_parses_middle_token() {
        assert_eq!(status_code_of("HTTP/1.1 304 Not Modified").unwrap(), 304);
        assert_eq!(status_code_of("HTTP/1.1 200 OK").unwrap(), 200);
        assert!(status_code_of("garbage").is_err());
    }
}
