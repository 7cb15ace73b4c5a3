//! Common types and constants used throughout the redirect server

use strum_macros::{Display, EnumString};

/// Application name advertised in the `Server` response header
pub const APP_NAME: &str = "goMobile";

/// Current application version
pub const VERSION: &str = "25.11.25";

/// SIP line terminator
pub const CRLF: &str = "\r\n";

/// SIP request methods handled by the redirect server (RFC 3261)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Method {
    INVITE,
    ACK,
    OPTIONS,
    BYE,
    CANCEL,
    REGISTER,
    #[strum(default)]
    UNKNOWN(String),
}

/// Inputs extracted from one INVITE transaction and fed to the policy engine.
///
/// `num_c` is empty when the request carries no Diversion header; `sbc_ip`
/// equals `src_ip` in the plain single-hop configuration.
#[derive(Debug, Clone, Default)]
pub struct CallInputs {
    pub num_a: String,
    pub num_b: String,
    pub num_c: String,
    pub src_ip: String,
    pub sbc_ip: String,
    pub call_id: String,
    pub ruri: String,
    pub now_unix: i64,
}

/// Outcome of a policy evaluation.
///
/// Either `target` holds a concrete redirect string (possibly several
/// contacts separated by `|`), or it holds the literal `"Bad Gateway"` and
/// `reason` explains why no redirect could be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyResult {
    pub target: String,
    pub reason: String,
    pub priority: i64,
    pub id: i64,
}

impl PolicyResult {
    /// Build the 502 result carrying a failure reason
    pub fn bad_gateway(reason: impl Into<String>) -> Self {
        PolicyResult {
            target: "Bad Gateway".to_string(),
            reason: reason.into(),
            priority: 0,
            id: 0,
        }
    }

    /// True when this result maps to a 502 on the wire
    pub fn is_bad_gateway(&self) -> bool {
        self.target == "Bad Gateway"
    }
}
