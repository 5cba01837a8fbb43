//! The minimal HTTP surface of the proxy.
//!
//! Only two request behaviors exist: deciding the keep-alive disposition
//! from the request line and `Connection` header, and injecting the
//! forwarding headers after the request line. Everything else passes
//! through untouched. The module also synthesizes the three canned error
//! responses the proxy may emit before a backend lease succeeds.

/// Decide the connection disposition of a request.
///
/// HTTP/1.1 is keep-alive by default unless the request carries
/// `Connection: close`; HTTP/1.0 is close by default unless it carries
/// `Connection: keep-alive`. Token matching is case-insensitive.
pub fn wants_keep_alive(request: &[u8]) -> bool {
    let http_10 = request_line(request)
        .map(|line| line.ends_with(b"HTTP/1.0"))
        .unwrap_or(false);

    match connection_tokens(request) {
        Some(tokens) if contains_token(&tokens, "close") => false,
        Some(tokens) if contains_token(&tokens, "keep-alive") => true,
        _ => !http_10,
    }
}

/// Insert `X-Forwarded-For` and `X-Real-IP` immediately after the request
/// line, shifting the remainder. Returns false (and leaves the buffer
/// untouched) when the request has no complete request line yet or the
/// injected bytes would overflow `capacity`.
pub fn inject_forwarded_headers(buf: &mut Vec<u8>, client_ip: &str, capacity: usize) -> bool {
    let Some(line_end) = find_crlf(buf) else {
        return false;
    };
    let headers = format!("X-Forwarded-For: {client_ip}\r\nX-Real-IP: {client_ip}\r\n");
    if buf.len() + headers.len() > capacity {
        return false;
    }
    let insert_at = line_end + 2;
    buf.splice(insert_at..insert_at, headers.into_bytes());
    true
}

pub fn bad_gateway() -> Vec<u8> {
    canned(502, "Bad Gateway", "502 - Backend Unavailable\n")
}

pub fn service_unavailable() -> Vec<u8> {
    canned(503, "Service Unavailable", "503 - No Healthy Backends\n")
}

pub fn too_many_requests() -> Vec<u8> {
    canned(429, "Too Many Requests", "")
}

fn canned(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn request_line(request: &[u8]) -> Option<&[u8]> {
    find_crlf(request).map(|end| &request[..end])
}

/// The value of the first `Connection` header, split on commas and trimmed.
fn connection_tokens(request: &[u8]) -> Option<Vec<String>> {
    let head_end = request
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(request.len());
    let head = &request[..head_end];

    for line in head.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("connection") {
            return Some(
                value
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .collect(),
            );
        }
    }
    None
}

fn contains_token(tokens: &[String], wanted: &str) -> bool {
    tokens.iter().any(|t| t == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(wants_keep_alive(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"));
    }

    #[test]
    fn http11_connection_close_wins() {
        assert!(!wants_keep_alive(
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"
        ));
        assert!(!wants_keep_alive(
            b"GET / HTTP/1.1\r\nCONNECTION: Close\r\n\r\n"
        ));
    }

    #[test]
    fn http10_defaults_to_close() {
        assert!(!wants_keep_alive(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n"));
        assert!(wants_keep_alive(
            b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n"
        ));
    }

    #[test]
    fn connection_token_list_is_matched_per_token() {
        assert!(!wants_keep_alive(
            b"GET / HTTP/1.1\r\nConnection: close, upgrade\r\n\r\n"
        ));
    }

    #[test]
    fn injects_after_request_line() {
        let mut buf = b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n".to_vec();
        assert!(inject_forwarded_headers(&mut buf, "203.0.113.7", 16384));
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.starts_with(
            "GET /x HTTP/1.1\r\nX-Forwarded-For: 203.0.113.7\r\nX-Real-IP: 203.0.113.7\r\nHost: a\r\n"
        ));
    }

    #[test]
    fn injection_skipped_when_buffer_would_overflow() {
        let mut buf = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec();
        let before = buf.clone();
        let limit = buf.len() + 4;
        assert!(!inject_forwarded_headers(&mut buf, "10.0.0.1", limit));
        assert_eq!(buf, before);
    }

    #[test]
    fn injection_requires_complete_request_line() {
        let mut buf = b"GET / HT".to_vec();
        assert!(!inject_forwarded_headers(&mut buf, "10.0.0.1", 16384));
    }

    #[test]
    fn canned_responses_declare_body_length() {
        let resp = String::from_utf8(bad_gateway()).expect("utf8");
        assert!(resp.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        let body = resp.split("\r\n\r\n").nth(1).expect("body");
        assert!(resp.contains(&format!("Content-Length: {}\r\n", body.len())));

        let resp = String::from_utf8(too_many_requests()).expect("utf8");
        assert!(resp.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(resp.contains("Content-Length: 0\r\n"));
    }
}
