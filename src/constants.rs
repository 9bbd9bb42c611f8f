//! Queue bounds, device parameters and loop deadlines.
//!
//! The queues drop on overflow rather than block: the dispatcher must never
//! stall behind one slow client, and a reconnecting client must not replay a
//! backlog of stale packets into a fresh session.

use std::time::Duration;

/// Queue from TUN into the router (server) or towards the remote end
/// (client).
pub const PKT_IN_MAX_BUFF: usize = 150;

/// Queue out to TUN.
pub const PKT_OUT_MAX_BUFF: usize = 150;

/// Aggregate queue from all network clients into dispatch.
pub const SERV_MAX_INBOUND_QUEUE: usize = 400;

/// Queue out to each network client.
pub const SERV_PER_CLIENT_QUEUE: usize = 200;

pub const DEV_MTU: i32 = 1500;
pub const DEV_PKT_BUFF_SIZE: usize = 4096;

/// Deadlines keep every blocking loop responsive to the shutdown flag.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(300);
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(300);
pub const SERVER_UDP_READ_TIMEOUT: Duration = Duration::from_millis(250);
pub const CLIENT_UDP_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Pause after a transport error before the loop tries again.
pub const ERROR_PAUSE: Duration = Duration::from_millis(150);
