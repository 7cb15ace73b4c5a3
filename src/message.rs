//! SIP message parsing and serialization
//!
//! A redirect server only ever inspects the request line and a handful of
//! headers, so messages are parsed into an owned header list instead of a
//! full message model. Header lookup understands the RFC 3261 compact forms
//! (`f` for `From`, `i` for `Call-ID`, ...).

use std::fmt;
use std::str::FromStr;

use crate::error::{GoMobileError, GoMobileResult};
use crate::types::{Method, CRLF};

/// Map a long header name to its RFC 3261 compact form
fn compact_form(lower_name: &str) -> Option<&'static str> {
    match lower_name {
        "from" => Some("f"),
        "to" => Some("t"),
        "via" => Some("v"),
        "contact" => Some("m"),
        "call-id" => Some("i"),
        "content-length" => Some("l"),
        "content-type" => Some("c"),
        "subject" => Some("s"),
        _ => None,
    }
}

/// A parsed inbound SIP request
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: Method,
    /// Full request-URI as received
    pub uri: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl SipRequest {
    /// Parse one UDP datagram into a request. Bodies are ignored; the
    /// redirect server never consumes SDP.
    pub fn parse(raw: &str) -> GoMobileResult<SipRequest> {
        let mut lines = raw.lines();
        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| GoMobileError::parse_error("empty datagram", None))?;

        let mut parts = request_line.split_whitespace();
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => {
                return Err(GoMobileError::parse_error(
                    "malformed request line",
                    Some(request_line.to_string()),
                ))
            }
        };
        if !version.starts_with("SIP/") {
            return Err(GoMobileError::parse_error(
                "not a SIP request",
                Some(request_line.to_string()),
            ));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break; // end of headers; anything after is body
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Ok(SipRequest {
            method: Method::from_str(method).expect("strum default variant"),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First value of a header, long or compact form, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        let compact = compact_form(&lower);
        self.headers
            .iter()
            .find(|(n, _)| {
                let n = n.to_lowercase();
                n == lower || compact.map(|c| n == c).unwrap_or(false)
            })
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeating header (Via, Contact), in message order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let lower = name.to_lowercase();
        let compact = compact_form(&lower);
        self.headers
            .iter()
            .filter(|(n, _)| {
                let n = n.to_lowercase();
                n == lower || compact.map(|c| n == c).unwrap_or(false)
            })
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn call_id(&self) -> &str {
        self.header("Call-ID").unwrap_or("")
    }

    pub fn cseq(&self) -> &str {
        self.header("CSeq").unwrap_or("")
    }

    /// The branch parameter of the topmost Via, identifying the transaction
    pub fn top_branch(&self) -> &str {
        self.header("Via")
            .and_then(|via| header_parameter(via, "branch"))
            .unwrap_or("")
    }

    /// User part of the From address (the caller number)
    pub fn from_user(&self) -> Option<String> {
        self.header("From").map(address_user)
    }

    /// User part of the To address (the callee number)
    pub fn to_user(&self) -> Option<String> {
        self.header("To").map(address_user)
    }

    /// Diversion number: first value, angle brackets stripped, URI scheme
    /// and `+` stripped, user portion before `@`. Empty when absent.
    pub fn diversion_number(&self) -> String {
        match self.header("Diversion") {
            Some(value) => {
                let first = value.split(',').next().unwrap_or("");
                extract_number(first.trim().trim_matches(|c| c == '<' || c == '>'))
            }
            None => String::new(),
        }
    }

    /// Host (and port, when present) of the request-URI
    pub fn ruri_endpoint(&self) -> String {
        let uri = &self.uri;
        let after_scheme = uri
            .strip_prefix("sips:")
            .or_else(|| uri.strip_prefix("sip:"))
            .unwrap_or(uri);
        let host_part = after_scheme
            .rsplit_once('@')
            .map(|(_, host)| host)
            .unwrap_or(after_scheme);
        host_part
            .split(';')
            .next()
            .unwrap_or("")
            .to_string()
    }
}

/// Extract the user part of an address header value
/// (`"Alice" <sip:555@host>;tag=x` yields `555`)
fn address_user(value: &str) -> String {
    let uri = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if end > start => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value),
    };
    extract_number(uri)
}

/// Strip URI scheme and `+`, keep what precedes `@`
pub fn extract_number(s: &str) -> String {
    let mut s = s.trim();
    for prefix in ["sip:", "sips:", "tel:"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    s = s.strip_prefix('+').unwrap_or(s);
    let s = s.split('@').next().unwrap_or(s);
    s.to_string()
}

/// Extract a `;param=value` from a header value, unquoting the value
pub fn header_parameter<'a>(header_value: &'a str, param_name: &str) -> Option<&'a str> {
    let prefix_len = param_name.len() + 1;
    for part in header_value.split(';') {
        let part = part.trim();
        if part.len() > prefix_len
            && part[..prefix_len].eq_ignore_ascii_case(&format!("{}=", param_name))
        {
            let value = part[prefix_len..].trim();
            return Some(value.trim_matches('"'));
        }
    }
    None
}

/// An outbound SIP response under construction
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub code: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
}

impl SipResponse {
    /// Start a response from a request: status line plus the mirrored
    /// Via set, From, To, Call-ID and CSeq.
    pub fn from_request(req: &SipRequest, code: u16, reason: &str) -> SipResponse {
        let mut headers = Vec::new();
        for via in req.header_values("Via") {
            headers.push(("Via".to_string(), via.to_string()));
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.header(name) {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        SipResponse {
            code,
            reason: reason.to_string(),
            headers,
        }
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .filter(|(n, _)| n.to_lowercase() == lower)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}{}", self.code, self.reason, CRLF)?;
        for (name, value) in &self.headers {
            write!(f, "{}: {}{}", name, value, CRLF)?;
        }
        write!(f, "Content-Length: 0{}{}", CRLF, CRLF)
    }
}
