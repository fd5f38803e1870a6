//! PUB/SUB socket plumbing: retrying bind/connect and part-wise receive.
//!
//! Stages may start in any order, so binds retry a fixed number of times
//! (another process squatting the endpoint is fatal) while connects retry
//! until the shutdown flag flips (the peer simply is not up yet).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Receive timeout applied to every subscribing socket.
pub const RECV_TIMEOUT_MS: i32 = 500;
/// Send timeout applied to every publishing socket; hitting it surfaces as a
/// would-block condition, never a fatal error.
pub const SEND_TIMEOUT_MS: i32 = 1000;

const BIND_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that can occur while setting up bus sockets
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to bind {role} on {endpoint} after {attempts} attempts: {source}")]
    BindExhausted {
        role: &'static str,
        endpoint: String,
        attempts: u32,
        #[source]
        source: zmq::Error,
    },

    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),
}

/// Bind `socket` on `endpoint`, retrying with one-second backoffs. Exhausting
/// the attempts usually means another process owns the endpoint.
pub fn bind_with_retry(
    socket: &zmq::Socket,
    endpoint: &str,
    role: &'static str,
) -> Result<(), BusError> {
    let mut last_error = zmq::Error::EADDRINUSE;
    for attempt in 1..=BIND_ATTEMPTS {
        match socket.bind(endpoint) {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!(
                    "failed to bind {} on {} (attempt {}/{}): {}",
                    role, endpoint, attempt, BIND_ATTEMPTS, err
                );
                last_error = err;
                if attempt < BIND_ATTEMPTS {
                    std::thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }
    Err(BusError::BindExhausted {
        role,
        endpoint: endpoint.to_string(),
        attempts: BIND_ATTEMPTS,
        source: last_error,
    })
}

/// Connect `socket` to `endpoint`, retrying with one-second backoffs until it
/// succeeds or the shutdown flag flips. Returns `false` on shutdown.
pub fn connect_with_retry(
    socket: &zmq::Socket,
    endpoint: &str,
    what: &str,
    running: &AtomicBool,
) -> bool {
    let mut attempt = 1u64;
    while running.load(Ordering::SeqCst) {
        match socket.connect(endpoint) {
            Ok(()) => return true,
            Err(err) => {
                warn!(
                    "failed to connect {} to {} (attempt {}): {}; waiting for peer",
                    what, endpoint, attempt, err
                );
                attempt += 1;
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
    }
    false
}

/// Outcome of one envelope receive.
#[derive(Debug)]
pub enum RecvOutcome {
    /// Nothing arrived within the receive timeout.
    Timeout,
    /// A structurally invalid envelope arrived; discard it with a warning.
    Malformed(&'static str),
    /// A complete envelope with `min_parts..=max_parts` parts.
    Parts(Vec<Vec<u8>>),
}

/// Receive one multipart envelope part by part.
///
/// The follow-on indicator is consulted after every part: a required part
/// missing it, or parts beyond `max_parts`, make the envelope malformed.
/// Surplus parts are drained so the socket stays aligned on message
/// boundaries.
pub fn recv_envelope(
    socket: &zmq::Socket,
    min_parts: usize,
    max_parts: usize,
) -> Result<RecvOutcome, zmq::Error> {
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(max_parts);

    loop {
        match socket.recv_bytes(0) {
            Ok(part) => parts.push(part),
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => {
                return Ok(if parts.is_empty() {
                    RecvOutcome::Timeout
                } else {
                    RecvOutcome::Malformed("envelope truncated mid-receive")
                });
            }
            Err(err) => return Err(err),
        }

        if !socket.get_rcvmore()? {
            break;
        }
        if parts.len() == max_parts {
            // Drain the surplus so the next receive starts on a boundary.
            while socket.get_rcvmore()? {
                let _ = socket.recv_bytes(0)?;
            }
            return Ok(RecvOutcome::Malformed("too many parts"));
        }
    }

    if parts.len() < min_parts {
        return Ok(RecvOutcome::Malformed("missing required parts"));
    }
    Ok(RecvOutcome::Parts(parts))
}

/// Send an envelope as one atomic multipart message.
pub fn send_parts(socket: &zmq::Socket, parts: &[&[u8]]) -> Result<(), zmq::Error> {
    let last = parts.len().saturating_sub(1);
    for (index, part) in parts.iter().enumerate() {
        let flags = if index == last { 0 } else { zmq::SNDMORE };
        socket.send(*part, flags)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // PAIR sockets keep multipart framing without PUB/SUB subscription
    // timing, which makes the receive contract deterministic to exercise.
    fn pair(ctx: &zmq::Context) -> (zmq::Socket, zmq::Socket) {
        let left = ctx.socket(zmq::PAIR).unwrap();
        left.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = left.get_last_endpoint().unwrap().unwrap();
        let right = ctx.socket(zmq::PAIR).unwrap();
        right.connect(&endpoint).unwrap();
        for socket in [&left, &right] {
            socket.set_rcvtimeo(RECV_TIMEOUT_MS).unwrap();
            socket.set_linger(0).unwrap();
        }
        (left, right)
    }

    #[test]
    fn receives_complete_envelope() {
        let ctx = zmq::Context::new();
        let (tx, rx) = pair(&ctx);
        send_parts(&tx, &[b"header", b"payload"]).unwrap();

        match recv_envelope(&rx, 2, 2).unwrap() {
            RecvOutcome::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[0], b"header");
                assert_eq!(parts[1], b"payload");
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn short_envelope_is_malformed() {
        let ctx = zmq::Context::new();
        let (tx, rx) = pair(&ctx);
        send_parts(&tx, &[b"header-only"]).unwrap();

        assert!(matches!(
            recv_envelope(&rx, 2, 2).unwrap(),
            RecvOutcome::Malformed(_)
        ));
    }

    #[test]
    fn oversized_envelope_is_drained_and_malformed() {
        let ctx = zmq::Context::new();
        let (tx, rx) = pair(&ctx);
        send_parts(&tx, &[b"a", b"b", b"c", b"d", b"e"]).unwrap();
        send_parts(&tx, &[b"h2", b"d2", b"i2"]).unwrap();

        assert!(matches!(
            recv_envelope(&rx, 3, 4).unwrap(),
            RecvOutcome::Malformed(_)
        ));
        // The follow-up envelope is still intact.
        match recv_envelope(&rx, 3, 4).unwrap() {
            RecvOutcome::Parts(parts) => assert_eq!(parts[0], b"h2"),
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn optional_fourth_part_is_accepted() {
        let ctx = zmq::Context::new();
        let (tx, rx) = pair(&ctx);
        send_parts(&tx, &[b"h", b"d", b"i", b"annotated"]).unwrap();

        match recv_envelope(&rx, 3, 4).unwrap() {
            RecvOutcome::Parts(parts) => assert_eq!(parts.len(), 4),
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn empty_socket_times_out() {
        let ctx = zmq::Context::new();
        let (_tx, rx) = pair(&ctx);
        assert!(matches!(
            recv_envelope(&rx, 2, 2).unwrap(),
            RecvOutcome::Timeout
        ));
    }
}
