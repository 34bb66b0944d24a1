// src/conn.rs
use std::net::SocketAddr;

use libc::c_int;

use crate::parser::ParseContext;
use crate::stream::Stream;

/// One accepted connection: the buffered stream, the peer address, the
/// resumable parser context and the activity clock the dispatcher uses for
/// idle teardown.
pub struct Session {
    pub stream: Stream,
    pub peer: SocketAddr,
    pub context: ParseContext,
    /// Seconds since the epoch of the last observed progress.
    pub activity: u64,
}

impl Session {
    pub fn new(stream: Stream, peer: SocketAddr, now: u64) -> Session {
        Session {
            stream,
            peer,
            context: ParseContext::new(),
            activity: now,
        }
    }

    pub fn fd(&self) -> c_int {
        self.stream.fd
    }
}

/// What a pollset slot stands for. The lifecycle is monotonic per slot:
/// `Listen` never changes; an accepted socket enters `Parse` and then
/// alternates with `ResponseDynamic` while the peer keeps the connection
/// alive.
pub enum Connection {
    /// The polled descriptor is a listening socket; readability means a
    /// client is waiting to be accepted.
    Listen,
    /// The polled descriptor is the connection's socket; readability feeds
    /// the parser.
    Parse(Box<Session>),
    /// The session has been handed to worker `worker`; the polled
    /// descriptor is that worker's response pipe, so completion wakes the
    /// dispatcher. The boxed session travels through the pipes.
    ResponseDynamic { worker: usize },
}

impl Connection {
    pub fn is_parse(&self) -> bool {
        matches!(self, Connection::Parse(_))
    }
}
