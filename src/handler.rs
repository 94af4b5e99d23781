//! Per-connection request handling.
//!
//! One thread per accepted pod-manager connection reads fixed-length request
//! frames and dispatches them. Memory requests are answered inline; quota
//! requests are queued for the scheduler daemon, which replies on the same
//! connection once it grants a token.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::protocol::{self, RequestBody, Response, REQ_MSG_LEN};
use crate::scheduler::{Candidate, Scheduler};

const SEND_ATTEMPTS: u32 = 5;
const SEND_BACKOFF: Duration = Duration::from_millis(3);

/// Write one response frame, retrying transient failures a bounded number of
/// times before giving up.
pub(crate) fn send_with_retry(mut stream: &TcpStream, frame: &[u8]) -> std::io::Result<()> {
    let mut last_err = None;
    for attempt in 1..=SEND_ATTEMPTS {
        match stream.write_all(frame) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::debug!(attempt, %err, "send failed");
                last_err = Some(err);
                thread::sleep(SEND_BACKOFF);
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

/// Accept loop: one handler thread per connection.
pub fn serve(listener: TcpListener, sched: Arc<Scheduler>) {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                tracing::info!(peer = ?stream.peer_addr().ok(), "received an incoming connection");
                let sched = sched.clone();
                thread::spawn(move || run(Arc::new(stream), sched));
            }
            Err(err) => tracing::error!(%err, "accept failed"),
        }
    }
}

/// Read and dispatch requests until the peer disconnects.
pub fn run(stream: Arc<TcpStream>, sched: Arc<Scheduler>) {
    let mut buf = [0u8; REQ_MSG_LEN];
    loop {
        if let Err(err) = (&*stream).read_exact(&mut buf) {
            tracing::debug!(%err, "connection closed by pod manager");
            return;
        }
        handle_message(&stream, &sched, &buf);
    }
}

fn handle_message(stream: &Arc<TcpStream>, sched: &Scheduler, buf: &[u8; REQ_MSG_LEN]) {
    let request = match protocol::parse_request(buf) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(%err, "ignoring undecodable request");
            return;
        }
    };

    let mut state = sched.lock();
    if !state.registry.contains(&request.client_name) {
        tracing::warn!(client = %request.client_name, "unknown client, ignoring request");
        return;
    }

    match request.body {
        RequestBody::Quota { overuse, burst } => {
            let now = sched.clock.now_ms();
            let actual = state.history.adjust_return(&request.client_name, now, overuse);
            let client = state
                .registry
                .get_mut(&request.client_name)
                .expect("checked above");
            client.latest_overuse = overuse;
            if let Some(actual) = actual {
                client.latest_actual_usage = actual;
            }
            client.set_burst(burst);

            state.candidates.push_back(Candidate {
                stream: stream.clone(),
                name: request.client_name.clone(),
                req_id: request.req_id,
                arrived_ms: now,
            });
            drop(state);
            // the scheduler daemon replies once it grants a token
            sched.notify();
        }
        RequestBody::MemLimit => {
            let client = state.registry.get(&request.client_name).expect("checked above");
            let response = Response::MemLimit {
                used: client.mem_used,
                limit: client.mem_limit,
            };
            drop(state);
            reply(stream, &request.client_name, request.req_id, &response);
        }
        RequestBody::MemUpdate { bytes, is_allocate } => {
            let client = state
                .registry
                .get_mut(&request.client_name)
                .expect("checked above");
            let verdict = client.mem_update(bytes, is_allocate);
            tracing::debug!(
                client = %request.client_name,
                bytes,
                is_allocate,
                verdict,
                mem_used = client.mem_used,
                "memory update"
            );
            drop(state);
            reply(
                stream,
                &request.client_name,
                request.req_id,
                &Response::MemUpdate { verdict },
            );
        }
    }
}

fn reply(stream: &TcpStream, client: &str, req_id: u32, response: &Response) {
    let frame = protocol::encode_response(req_id, response);
    if let Err(err) = send_with_retry(stream, &frame) {
        tracing::error!(client = %client, req_id, %err, "dropping reply");
    }
}
