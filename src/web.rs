//! HTTP simulation endpoint
//!
//! `GET /simulation` runs the same policy engine the SIP listener uses
//! against a synthesized INVITE and returns both raw packets plus a parsed
//! header view, so operators can test rule files without placing a call.
//! Access requires the `token` query parameter to match the `HTTP_TOKEN`
//! environment variable.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::engine::PolicyEngine;
use crate::error::{GoMobileError, GoMobileResult};
use crate::message::{SipRequest, SipResponse};
use crate::server::contact_set;
use crate::types::{CallInputs, CRLF};

/// One SIP header pair in the simulation response body
#[derive(Debug, Serialize, PartialEq)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct SimulationQuery {
    #[serde(default)]
    pub a_number: String,
    #[serde(default)]
    pub b_number: String,
    #[serde(default)]
    pub c_number: String,
    #[serde(default)]
    pub src_ip: String,
    #[serde(default)]
    pub sbc_ip: String,
    #[serde(default)]
    pub token: String,
}

pub struct WebServer {
    engine: Arc<PolicyEngine>,
    expected_token: Option<String>,
}

impl WebServer {
    /// The expected token is read from `HTTP_TOKEN` once at construction
    pub fn new(engine: Arc<PolicyEngine>) -> Arc<Self> {
        Arc::new(WebServer {
            engine,
            expected_token: std::env::var("HTTP_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/simulation", get(handle_simulate))
            .with_state(Arc::clone(self))
    }

    /// Bind `0.0.0.0:<port>` and serve until the process exits
    pub async fn run(self: Arc<Self>, port: u16) -> GoMobileResult<()> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| GoMobileError::transport_error(&addr, e.to_string(), false))?;
        info!("starting HTTP server on :{}", port);
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (tests bind to an ephemeral port)
    pub async fn serve_on(self: Arc<Self>, listener: tokio::net::TcpListener) -> GoMobileResult<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| GoMobileError::transport_error("http serve", e.to_string(), false))
    }
}

async fn handle_simulate(
    State(server): State<Arc<WebServer>>,
    Query(query): Query<SimulationQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    // token gate
    let Some(expected) = server.expected_token.as_deref() else {
        warn!("HTTP_TOKEN not set in environment");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "server misconfiguration"})),
        );
    };
    if query.token != expected {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid token"})),
        );
    }

    let start = Instant::now();
    let sbc_ip = if query.sbc_ip.is_empty() {
        "0.0.0.0".to_string()
    } else {
        query.sbc_ip.clone()
    };
    let call_id = format!("cid-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());

    let invite_raw = synthesize_invite(&query, &sbc_ip, &call_id);
    let req = match SipRequest::parse(&invite_raw) {
        Ok(req) => req,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("failed to build SIP request: {}", e)})),
            )
        }
    };

    let inputs = CallInputs {
        num_a: query.a_number.clone(),
        num_b: query.b_number.clone(),
        num_c: query.c_number.clone(),
        src_ip: query.src_ip.clone(),
        sbc_ip: sbc_ip.clone(),
        call_id: call_id.clone(),
        ruri: req.ruri_endpoint(),
        now_unix: Utc::now().timestamp(),
    };
    let result = server.engine.find_policy_result(&inputs);

    let elapsed = format!("{}ms", start.elapsed().as_millis());
    let resp = if result.is_bad_gateway() {
        let mut resp = SipResponse::from_request(&req, 502, "Bad Gateway");
        resp.append_header("Reason", result.reason.clone());
        resp.append_header("X-Elapsed-Time", elapsed);
        resp
    } else {
        let mut resp = SipResponse::from_request(&req, 302, "Moved Temporarily");
        for contact in contact_set(&result.target) {
            resp.append_header("Contact", contact);
        }
        resp.append_header("X-Elapsed-Time", elapsed);
        resp
    };
    let response_raw = resp.to_string();

    (
        StatusCode::OK,
        Json(json!({
            "invite_packet_raw": invite_raw,
            "sip_response_raw": response_raw,
            "data": {
                "invite": parse_sip_headers(&invite_raw),
                "result": parse_sip_headers(&response_raw),
            },
        })),
    )
}

fn synthesize_invite(query: &SimulationQuery, sbc_ip: &str, call_id: &str) -> String {
    let mut packet = String::new();
    packet.push_str(&format!(
        "INVITE sip:{}@{} SIP/2.0{}",
        query.b_number, sbc_ip, CRLF
    ));
    packet.push_str(&format!("From: <sip:{}>{}", query.a_number, CRLF));
    packet.push_str(&format!("To: <sip:{}>{}", query.b_number, CRLF));
    packet.push_str(&format!("Call-ID: {}{}", call_id, CRLF));
    packet.push_str(&format!("CSeq: 1 INVITE{}", CRLF));
    packet.push_str(&format!(
        "Contact: <sip:{}@{}:53799;transport=udp>{}",
        query.a_number, query.src_ip, CRLF
    ));
    packet.push_str(&format!("User-Agent: PolicySimulation/1.0{}", CRLF));
    packet.push_str(&format!("X-SrcIP: {}{}", query.src_ip, CRLF));
    if !query.c_number.is_empty() {
        packet.push_str(&format!("Diversion: <sip:{}>{}", query.c_number, CRLF));
    }
    packet.push_str(CRLF);
    packet
}

/// Extract the header view of a raw packet: the start line first, then the
/// headers the simulation UI knows how to display
fn parse_sip_headers(packet: &str) -> Vec<SipHeader> {
    const SHOWN: [&str; 11] = [
        "From",
        "To",
        "Call-ID",
        "CSeq",
        "Contact",
        "User-Agent",
        "Diversion",
        "Content-Length",
        "X-SrcIP",
        "Reason",
        "X-Elapsed-Time",
    ];

    let mut headers = Vec::new();
    let mut lines = packet.lines();
    if let Some(start_line) = lines.next() {
        headers.push(SipHeader {
            name: "Method".to_string(),
            value: start_line.to_string(),
        });
    }
    for line in lines {
        for name in SHOWN {
            if line.len() > name.len() + 1 && line[..name.len() + 1].eq(&format!("{}:", name)) {
                if let Some((_, value)) = line.split_once(':') {
                    headers.push(SipHeader {
                        name: name.to_string(),
                        value: value.trim().to_string(),
                    });
                }
            }
        }
    }
    headers
}
