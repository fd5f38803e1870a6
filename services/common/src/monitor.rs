//! Subscriber-presence tracking for fan-out sockets.
//!
//! A PUB socket silently drops messages when nothing is subscribed, so a
//! publisher that wants application-level queueing has to know whether any
//! peer is connected at all. The monitor consumes the socket's out-of-band
//! lifecycle events on a dedicated thread and keeps a signed counter:
//! connect/accept increments, disconnect/close decrements.
//!
//! Lifecycle rule: `stop()` must run before the monitored socket and its
//! context are dropped, otherwise context teardown blocks on the monitor's
//! internal pipe.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

const MONITOR_POLL_MS: i32 = 250;

/// Tracks whether a fan-out socket currently has at least one connected peer.
pub struct SubscriberMonitor {
    subscribers: Arc<AtomicI64>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SubscriberMonitor {
    /// Register a lifecycle-event monitor on `socket` and start the counting
    /// thread. `name` keeps the internal event endpoint unique per socket.
    pub fn start(
        ctx: &zmq::Context,
        socket: &zmq::Socket,
        name: &str,
    ) -> Result<Self, zmq::Error> {
        let endpoint = format!("inproc://monitor-{name}");
        let events = (zmq::SocketEvent::CONNECTED.to_raw()
            | zmq::SocketEvent::ACCEPTED.to_raw()
            | zmq::SocketEvent::DISCONNECTED.to_raw()
            | zmq::SocketEvent::CLOSED.to_raw()) as i32;
        socket.monitor(&endpoint, events)?;

        let listener = ctx.socket(zmq::PAIR)?;
        listener.set_rcvtimeo(MONITOR_POLL_MS)?;
        listener.set_linger(0)?;
        listener.connect(&endpoint)?;

        let subscribers = Arc::new(AtomicI64::new(0));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_subscribers = subscribers.clone();
        let thread_stop = stop_flag.clone();
        let handle =
            std::thread::spawn(move || run(listener, thread_subscribers, thread_stop));

        Ok(Self {
            subscribers,
            stop_flag,
            handle: Some(handle),
        })
    }

    /// Whether at least one peer is currently connected.
    pub fn has_subscriber(&self) -> bool {
        self.subscribers.load(Ordering::Acquire) > 0
    }

    /// Stop and join the monitor thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("subscriber monitor thread panicked");
            }
        }
    }
}

impl Drop for SubscriberMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(listener: zmq::Socket, subscribers: Arc<AtomicI64>, stop_flag: Arc<AtomicBool>) {
    while !stop_flag.load(Ordering::Relaxed) {
        // Event messages are two frames: [event id + value][endpoint].
        let frame = match listener.recv_bytes(0) {
            Ok(frame) => frame,
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => continue,
            Err(_) => break,
        };
        if listener.get_rcvmore().unwrap_or(false) {
            let _ = listener.recv_bytes(0);
        }
        if frame.len() < 2 {
            continue;
        }

        let event = u16::from_le_bytes([frame[0], frame[1]]);
        if event == zmq::SocketEvent::CONNECTED.to_raw()
            || event == zmq::SocketEvent::ACCEPTED.to_raw()
        {
            let count = subscribers.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("subscriber connected ({count} total)");
        } else if event == zmq::SocketEvent::DISCONNECTED.to_raw()
            || event == zmq::SocketEvent::CLOSED.to_raw()
        {
            let count = subscribers.fetch_sub(1, Ordering::Relaxed) - 1;
            debug!("subscriber disconnected ({count} remaining)");
        }
    }
}
