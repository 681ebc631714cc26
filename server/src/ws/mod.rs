pub mod actor;
pub mod handler;

use axum::extract::ws::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Sender half of a connection's writer channel. The router and the
/// watchdog clone this to push frames to a specific client; the reader
/// side is owned by the connection's writer task.
pub type ConnectionSender = mpsc::UnboundedSender<Message>;

// Close codes. Stable; documented in the config template and README.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_INVALID_QUERY_PARAMS: u16 = 4002;
pub const CLOSE_INVALID_MESSAGE_PAYLOAD: u16 = 4003;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 4004;
pub const CLOSE_INACTIVE_CONNECTION: u16 = 4005;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Opcode classes delivered to the router.
///
/// The axum transport reassembles fragmented frames itself, so the live
/// endpoint only produces `Text`, `Binary` and `Pong`; the fragment
/// variants exist for transports that surface raw continuation frames and
/// for exercising the reassembly path directly.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    FragmentBegin { binary: bool, data: Vec<u8> },
    FragmentContinue(Vec<u8>),
    FragmentEnd(Vec<u8>),
    Pong,
}
