//! UDP SIP server-transaction handling
//!
//! One task per inbound datagram. Every internal condition is translated
//! into a SIP response; nothing propagates out of the loop. The server keeps
//! no state across transactions except the absorption cache that replays the
//! final INVITE response to UDP retransmissions until the ACK arrives (or
//! Timer H expires).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::engine::PolicyEngine;
use crate::error::{GoMobileError, GoMobileResult};
use crate::message::{SipRequest, SipResponse};
use crate::types::{CallInputs, Method, APP_NAME, VERSION};

/// Timer H: how long a completed INVITE transaction absorbs retransmissions
/// while waiting for the ACK (64*T1, RFC 3261)
const TIMER_H: Duration = Duration::from_secs(32);

const MAX_DATAGRAM: usize = 8192;

/// Key identifying one server transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransactionKey {
    call_id: String,
    cseq: String,
    branch: String,
}

impl TransactionKey {
    fn of(req: &SipRequest) -> TransactionKey {
        TransactionKey {
            call_id: req.call_id().to_string(),
            cseq: req.cseq().to_string(),
            branch: req.top_branch().to_string(),
        }
    }
}

/// Completed-transaction record: the final response replayed on
/// retransmission, held until ACK or Timer H
#[derive(Debug)]
struct CompletedTransaction {
    final_response: String,
    completed_at: Instant,
}

pub struct SipServer {
    acl: Vec<String>,
    engine: Arc<PolicyEngine>,
    transactions: Mutex<HashMap<TransactionKey, CompletedTransaction>>,
}

impl SipServer {
    pub fn new(engine: Arc<PolicyEngine>, acl: Vec<String>) -> Arc<Self> {
        Arc::new(SipServer {
            acl,
            engine,
            transactions: Mutex::new(HashMap::new()),
        })
    }

    /// Bind `0.0.0.0:<port>` and serve until the process exits
    pub async fn run(self: Arc<Self>, port: u16) -> GoMobileResult<()> {
        let addr = format!("0.0.0.0:{}", port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| GoMobileError::transport_error(&addr, e.to_string(), false))?;
        info!("starting SIP server on UDP :{}", port);
        self.serve_on(socket).await
    }

    /// Serve on an already-bound socket (tests bind to an ephemeral port)
    pub async fn serve_on(self: Arc<Self>, socket: UdpSocket) -> GoMobileResult<()> {
        let socket = Arc::new(socket);

        // Timer H sweeper
        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMER_H);
            loop {
                ticker.tick().await;
                sweeper.sweep_expired();
            }
        });

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| GoMobileError::transport_error("udp recv", e.to_string(), false))?;
            let datagram = buf[..len].to_vec();
            let server = Arc::clone(&self);
            let socket = Arc::clone(&socket);
            tokio::spawn(async move {
                server.handle_datagram(&socket, &datagram, peer).await;
            });
        }
    }

    async fn handle_datagram(&self, socket: &UdpSocket, datagram: &[u8], peer: SocketAddr) {
        let start = Instant::now();
        let Ok(text) = std::str::from_utf8(datagram) else {
            debug!("dropping non-UTF8 datagram from {}", peer);
            return;
        };
        let req = match SipRequest::parse(text) {
            Ok(req) => req,
            Err(e) => {
                debug!("dropping unparseable datagram from {}: {}", peer, e);
                return;
            }
        };

        // ACL gate runs before any handler
        let peer_host = peer.ip().to_string();
        if !self.acl.iter().any(|allowed| allowed == &peer_host) {
            warn!("ACL deny {} from {}", req.method, peer);
            let mut resp = SipResponse::from_request(&req, 603, "Decline");
            resp.append_header("Reason", "Access denied by ACL");
            decorate(&mut resp);
            resp.append_header("X-Elapsed-Time", elapsed_ms(start));
            self.send(socket, &resp.to_string(), peer, req.call_id()).await;
            return;
        }

        match req.method.clone() {
            Method::INVITE => self.handle_invite(socket, &req, peer).await,
            Method::OPTIONS => self.handle_options(socket, &req, peer).await,
            Method::CANCEL => self.handle_cancel(socket, &req, peer).await,
            Method::ACK => self.handle_ack(&req, peer),
            Method::BYE => {
                info!("Call-ID: {} BYE received from {}", req.call_id(), peer);
            }
            other => {
                debug!("Call-ID: {} ignoring {} from {}", req.call_id(), other, peer);
            }
        }
    }

    async fn handle_invite(&self, socket: &UdpSocket, req: &SipRequest, peer: SocketAddr) {
        let start = Instant::now();
        let call_id = req.call_id().to_string();
        info!("Call-ID: {} INVITE received from {}", call_id, peer);

        // Retransmission: replay the cached final response verbatim
        let key = TransactionKey::of(req);
        let cached = {
            let transactions = self.transactions.lock().expect("transaction map poisoned");
            transactions.get(&key).map(|tx| tx.final_response.clone())
        };
        if let Some(final_response) = cached {
            debug!("Call-ID: {} retransmitted INVITE, replaying final response", call_id);
            self.send(socket, &final_response, peer, &call_id).await;
            return;
        }

        // 100 Trying precedes any final response
        let mut trying = SipResponse::from_request(req, 100, "Trying");
        decorate(&mut trying);
        trying.append_header("X-Elapsed-Time", elapsed_ms(start));
        self.send(socket, &trying.to_string(), peer, &call_id).await;
        info!("Call-ID: {} 100 Trying sent", call_id);

        let (Some(num_a), Some(num_b)) = (req.from_user(), req.to_user()) else {
            error!("Call-ID: {} missing From or To header", call_id);
            let mut resp = SipResponse::from_request(req, 502, "Bad Request");
            decorate(&mut resp);
            resp.append_header("X-Elapsed-Time", elapsed_ms(start));
            self.complete(socket, key, resp.to_string(), peer, &call_id).await;
            return;
        };
        let src_ip = peer.ip().to_string();
        let inputs = CallInputs {
            num_a,
            num_b,
            num_c: req.diversion_number(),
            sbc_ip: src_ip.clone(),
            src_ip,
            call_id: call_id.clone(),
            ruri: req.ruri_endpoint(),
            now_unix: Utc::now().timestamp(),
        };

        let result = self.engine.find_policy_result(&inputs);

        let resp = if result.is_bad_gateway() {
            let mut resp = SipResponse::from_request(req, 502, "Bad Gateway");
            resp.append_header("Reason", result.reason.clone());
            decorate(&mut resp);
            resp.append_header("X-Elapsed-Time", elapsed_ms(start));
            resp
        } else {
            let mut resp = SipResponse::from_request(req, 302, "Moved Temporarily");
            for contact in contact_set(&result.target) {
                resp.append_header("Contact", contact);
            }
            decorate(&mut resp);
            resp.append_header("X-Elapsed-Time", elapsed_ms(start));
            info!("Call-ID: {} 302 Redirect to {}", call_id, result.target);
            resp
        };
        self.complete(socket, key, resp.to_string(), peer, &call_id).await;
    }

    async fn handle_options(&self, socket: &UdpSocket, req: &SipRequest, peer: SocketAddr) {
        let start = Instant::now();
        info!("Call-ID: {} OPTIONS from {}", req.call_id(), peer);
        let mut resp = SipResponse::from_request(req, 200, "OK");
        decorate(&mut resp);
        resp.append_header("X-Elapsed-Time", elapsed_ms(start));
        self.send(socket, &resp.to_string(), peer, req.call_id()).await;
    }

    async fn handle_cancel(&self, socket: &UdpSocket, req: &SipRequest, peer: SocketAddr) {
        let start = Instant::now();
        let call_id = req.call_id();
        info!("Call-ID: {} CANCEL received from {}", call_id, peer);
        let mut resp = SipResponse::from_request(req, 200, "OK");
        decorate(&mut resp);
        resp.append_header("X-Elapsed-Time", elapsed_ms(start));
        self.send(socket, &resp.to_string(), peer, call_id).await;
        info!("Call-ID: {} 200 OK sent", call_id);
    }

    /// ACK confirms the final response; the transaction can be dropped
    fn handle_ack(&self, req: &SipRequest, peer: SocketAddr) {
        info!("Call-ID: {} ACK received from {}", req.call_id(), peer);
        let key = TransactionKey::of(req);
        let mut transactions = self.transactions.lock().expect("transaction map poisoned");
        transactions.remove(&key);
    }

    /// Record the final response for retransmission absorption, then send it
    async fn complete(
        &self,
        socket: &UdpSocket,
        key: TransactionKey,
        final_response: String,
        peer: SocketAddr,
        call_id: &str,
    ) {
        {
            let mut transactions = self.transactions.lock().expect("transaction map poisoned");
            transactions.insert(
                key,
                CompletedTransaction {
                    final_response: final_response.clone(),
                    completed_at: Instant::now(),
                },
            );
        }
        self.send(socket, &final_response, peer, call_id).await;
    }

    fn sweep_expired(&self) {
        let mut transactions = self.transactions.lock().expect("transaction map poisoned");
        transactions.retain(|_, tx| tx.completed_at.elapsed() < TIMER_H);
    }

    async fn send(&self, socket: &UdpSocket, response: &str, peer: SocketAddr, call_id: &str) {
        if let Err(e) = socket.send_to(response.as_bytes(), peer).await {
            error!("Call-ID: {} failed to send response to {}: {}", call_id, peer, e);
        }
    }
}

/// Split a resolved target into Contact header values: `|`-separated,
/// trimmed, a literal `Contact:` prefix stripped, empty pieces omitted
pub fn contact_set(target: &str) -> Vec<String> {
    target
        .split('|')
        .map(|piece| {
            let piece = piece.trim();
            let piece = piece
                .strip_prefix("Contact:")
                .or_else(|| piece.strip_prefix("contact:"))
                .unwrap_or(piece);
            piece.trim().to_string()
        })
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn decorate(resp: &mut SipResponse) {
    resp.append_header("Server", format!("{} {}", APP_NAME, VERSION));
}

fn elapsed_ms(start: Instant) -> String {
    format!("{:.3}ms", start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_set_fanout() {
        let contacts = contact_set("sip:1@h1 | sip:2@h2 | sip:3@h3");
        assert_eq!(contacts, vec!["sip:1@h1", "sip:2@h2", "sip:3@h3"]);
    }

    #[test]
    fn test_contact_set_strips_prefix_and_empties() {
        let contacts = contact_set("Contact: sip:1@h1 |  | contact: sip:2@h2 |");
        assert_eq!(contacts, vec!["sip:1@h1", "sip:2@h2"]);
    }

    #[test]
    fn test_contact_set_single() {
        assert_eq!(contact_set("sip:777@10.0.0.5"), vec!["sip:777@10.0.0.5"]);
    }

    #[test]
    fn test_elapsed_format() {
        let rendered = elapsed_ms(Instant::now());
        assert!(rendered.ends_with("ms"));
        assert!(rendered.contains('.'));
    }
}
