// src/server.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::conn::{Connection, Session};
use crate::error::{VersoError, VersoResult};
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::stream::{Stream, TIMEOUT_MS};
use crate::syscalls;
use crate::worker::{Outcome, WorkerPool};

pub const DEFAULT_PORT: u16 = 8080;
pub const THREAD_POOL_SIZE: usize = 4;
const DEFAULT_STORAGE_ROOT: &str = "/tmp/data";

// The dispatcher wakes at least this often to sweep idle connections and
// observe the shutdown flag.
const POLL_INTERVAL_MS: c_int = 1000;

/// State shared by the dispatcher and every worker.
pub struct ServerState {
    pub storage: Storage,
    pub metrics: Metrics,
}

impl ServerState {
    pub fn new(storage_root: impl Into<PathBuf>) -> ServerState {
        ServerState {
            storage: Storage::new(storage_root),
            metrics: Metrics::new(),
        }
    }
}

// The pollfd row and the connection row share one index; every mutation
// moves them together so they cannot drift.
struct PollSet {
    fds: Vec<libc::pollfd>,
    connections: Vec<Connection>,
}

impl PollSet {
    fn new() -> PollSet {
        PollSet {
            fds: Vec::with_capacity(8),
            connections: Vec::with_capacity(8),
        }
    }

    fn len(&self) -> usize {
        debug_assert_eq!(self.fds.len(), self.connections.len());
        self.fds.len()
    }

    fn push(&mut self, fd: c_int, connection: Connection) {
        self.fds.push(syscalls::pollfd(fd, libc::POLLIN));
        self.connections.push(connection);
    }

    /// Removes entry `index` by swapping the last entry into its place.
    fn swap_remove(&mut self, index: usize) -> Connection {
        self.fds.swap_remove(index);
        self.connections.swap_remove(index)
    }

    fn set_fd(&mut self, index: usize, fd: c_int) {
        self.fds[index].fd = fd;
        self.fds[index].revents = 0;
    }
}

/// The server: a poll-driven dispatcher thread owning every connection, a
/// fixed worker pool handling parsed requests, and the shared store.
pub struct Server {
    host_port: String,
    workers: usize,
    storage_root: PathBuf,
}

impl Server {
    pub fn bind(host_port: &str) -> Server {
        Server {
            host_port: host_port.to_string(),
            workers: THREAD_POOL_SIZE,
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
        }
    }

    pub fn workers(mut self, workers: usize) -> Server {
        self.workers = workers.max(1);
        self
    }

    pub fn storage(mut self, root: impl Into<PathBuf>) -> Server {
        self.storage_root = root.into();
        self
    }

    /// Runs the dispatcher loop until `shutdown` is raised.
    pub fn serve(self, shutdown: Arc<AtomicBool>) -> VersoResult<()> {
        let address: SocketAddr = self
            .host_port
            .parse()
            .map_err(|_| VersoError::Input)?;

        let state = Arc::new(ServerState::new(self.storage_root));
        let mut pool = WorkerPool::start(self.workers, state.clone())?;
        let listen_fd = syscalls::create_listen_socket(&address)?;
        info!(%address, workers = pool.len(), "listening");

        let mut pollset = PollSet::new();
        pollset.push(listen_fd, Connection::Listen);

        let mut last_report = unix_now();

        while !shutdown.load(Ordering::Acquire) {
            syscalls::poll_wait(&mut pollset.fds, POLL_INTERVAL_MS)?;
            let now = unix_now();

            if now.saturating_sub(last_report) >= 60 {
                let (accepted, served) = state.metrics.snapshot();
                debug!(
                    connections = pollset.len() - 1,
                    accepted, served, "dispatcher heartbeat"
                );
                last_report = now;
            }

            // Entries pushed during this pass sit beyond poll_count and are
            // not examined until the next poll round.
            let mut poll_count = pollset.len();
            let mut index = 0;
            while index < poll_count {
                let revents = pollset.fds[index].revents;
                pollset.fds[index].revents = 0;

                // What kind of descriptor this slot polls, captured before
                // handing the pollset to the helpers.
                enum Target {
                    Listen,
                    Parse { activity: u64, fd: c_int },
                    Response(usize),
                }
                let target = match &pollset.connections[index] {
                    Connection::Listen => Target::Listen,
                    Connection::Parse(session) => Target::Parse {
                        activity: session.activity,
                        fd: session.fd(),
                    },
                    Connection::ResponseDynamic { worker } => Target::Response(*worker),
                };

                // Some(graceful) tears the entry down.
                let mut term: Option<bool> = None;

                if revents & libc::POLLIN != 0 {
                    match target {
                        Target::Listen => accept_client(&mut pollset, index, &state, now),
                        Target::Parse { .. } => {
                            term = drive_parse(&mut pollset, &mut pool, index, now);
                        }
                        Target::Response(worker) => {
                            term = finish_response(&mut pollset, &mut pool, worker, index, now);
                        }
                    }
                } else if revents != 0 {
                    // Error or hangup.
                    match target {
                        Target::Response(worker) => {
                            term = finish_response(&mut pollset, &mut pool, worker, index, now);
                        }
                        _ => term = Some(false),
                    }
                } else if let Target::Parse { activity, fd } = target {
                    // Idle sweep: a parsing connection that made no progress
                    // within the stream timeout is reclaimed.
                    if now.saturating_sub(activity) > (TIMEOUT_MS / 1000) as u64 {
                        debug!(fd, "idle timeout");
                        term = Some(false);
                    }
                }

                if let Some(graceful) = term {
                    teardown(&mut pollset, index, graceful);
                    if pollset.len() < poll_count {
                        // The swapped-in entry was part of this pass; examine
                        // it at the same index.
                        poll_count -= 1;
                        continue;
                    }
                }

                index += 1;
            }
        }

        info!("shutting down");
        while pollset.len() > 0 {
            let index = pollset.len() - 1;
            match &pollset.connections[index] {
                Connection::ResponseDynamic { worker } => {
                    // Wait for the worker to hand the session back.
                    let worker = *worker;
                    match pool.collect(worker) {
                        Ok((session, _)) => syscalls::close_graceful(session.fd()),
                        Err(e) => error!(worker, error = %e, "lost session at shutdown"),
                    }
                    pollset.swap_remove(index);
                }
                Connection::Listen => {
                    syscalls::close_fd(pollset.fds[index].fd);
                    pollset.swap_remove(index);
                }
                Connection::Parse(_) => {
                    teardown(&mut pollset, index, true);
                }
            }
        }

        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn accept_client(pollset: &mut PollSet, index: usize, state: &ServerState, now: u64) {
    let listen_fd = pollset.fds[index].fd;
    match syscalls::accept_connection(listen_fd) {
        Ok(Some((fd, peer))) => {
            // Arm the linger so an abnormal close sends RST.
            syscalls::linger_arm(fd);
            match Stream::new(fd) {
                Ok(stream) => {
                    state.metrics.connection_accepted();
                    debug!(%peer, fd, "accepted connection");
                    pollset.push(fd, Connection::Parse(Box::new(Session::new(stream, peer, now))));
                }
                Err(e) => {
                    warn!(error = %e, "unable to initialise stream");
                    syscalls::close_abortive(fd);
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "accept failed"),
    }
}

// Feeds newly arrived bytes to the connection's parser; on completion hands
// the session to a worker and repoints the poll entry at that worker's
// response pipe.
fn drive_parse(
    pollset: &mut PollSet,
    pool: &mut WorkerPool,
    index: usize,
    now: u64,
) -> Option<bool> {
    let Connection::Parse(session) = &mut pollset.connections[index] else {
        return None;
    };

    match session.context.parse(&mut session.stream) {
        Ok(()) => {
            // The host must be known: either the header is present or the
            // URI is absolute-form and synthesises it later.
            let request = &session.context.request;
            if request.header("host").is_none() && !request.uri.starts_with(b"http") {
                debug!(fd = session.fd(), "request without host");
                return Some(true);
            }
            session.activity = now;

            let worker = pool.pick();
            let slot = std::mem::replace(
                &mut pollset.connections[index],
                Connection::ResponseDynamic { worker },
            );
            let session = match slot {
                Connection::Parse(session) => session,
                other => {
                    pollset.connections[index] = other;
                    return None;
                }
            };

            match pool.dispatch(worker, session) {
                Ok(()) => {
                    // Poll the worker's response pipe instead of the socket
                    // until the response is done.
                    pollset.set_fd(index, pool.response_fd(worker));
                    None
                }
                Err(session) => {
                    error!(worker, "unable to hand the session off");
                    pollset.connections[index] = Connection::Parse(session);
                    Some(false)
                }
            }
        }
        Err(VersoError::Again) => {
            session.activity = now;
            None
        }
        Err(VersoError::Status(code)) => {
            debug!(fd = session.fd(), code, "parse failed");
            Some(true)
        }
        Err(error) => {
            debug!(fd = session.fd(), error = %error, "connection error");
            Some(false)
        }
    }
}

// Collects a finished session from the worker, restores the socket into the
// poll entry and either resumes parsing or signals teardown.
fn finish_response(
    pollset: &mut PollSet,
    pool: &mut WorkerPool,
    worker: usize,
    index: usize,
    now: u64,
) -> Option<bool> {
    let (mut session, outcome) = match pool.collect(worker) {
        Ok(result) => result,
        Err(e) => {
            // The worker died with the session; drop the poll entry. The
            // pipe descriptor stays with the pool.
            error!(worker, error = %e, "worker lost");
            return Some(false);
        }
    };

    pollset.set_fd(index, session.fd());

    match outcome {
        Outcome::KeepAlive => {
            session.context.reset();
            session.activity = now;
            let buffered = session.stream.cached() > 0;
            pollset.connections[index] = Connection::Parse(session);
            if buffered {
                // The next request was pipelined behind the previous body;
                // the socket will not poll readable for it, so parse now.
                drive_parse(pollset, pool, index, now)
            } else {
                None
            }
        }
        Outcome::Close => {
            pollset.connections[index] = Connection::Parse(session);
            Some(true)
        }
        Outcome::Abort => {
            pollset.connections[index] = Connection::Parse(session);
            Some(false)
        }
    }
}

// Removes a pollset entry; a graceful close disarms the linger first, an
// abortive one leaves it armed so the peer sees RST.
fn teardown(pollset: &mut PollSet, index: usize, graceful: bool) {
    match pollset.swap_remove(index) {
        Connection::Parse(session) => {
            let fd = session.fd();
            debug!(fd, graceful, "closing connection");
            if graceful {
                syscalls::close_graceful(fd);
            } else {
                syscalls::close_abortive(fd);
            }
        }
        // Listeners close at shutdown; a lost worker slot owns no socket.
        Connection::Listen | Connection::ResponseDynamic { .. } => {}
    }
}
